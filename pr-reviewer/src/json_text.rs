//! Helpers for digging JSON out of model text.
//!
//! Models wrap JSON in markdown fences, preambles, and trailing prose.
//! These helpers strip fences and scan for balanced `{...}` objects
//! (string- and escape-aware) so parse layers can recover without
//! re-prompting.

/// Removes a single surrounding markdown code fence, if present.
pub fn strip_markdown_fences(text: &str) -> String {
    let mut s = text.trim();
    if s.starts_with("```") {
        // Drop the opening fence line (``` or ```json).
        s = s.splitn(2, '\n').nth(1).unwrap_or("").trim();
        if let Some(idx) = s.rfind("```") {
            s = s[..idx].trim();
        }
    }
    s.to_string()
}

/// All balanced top-level `{...}` spans in `text`, in order.
pub fn find_json_objects(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        out.push(&text[start..=i]);
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// First fenced ```json block in `text`, if any.
pub fn first_fenced_json(text: &str) -> Option<String> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let after = after.strip_prefix("json").unwrap_or(after);
    let after = after.strip_prefix('\n').unwrap_or(after);
    let end = after.find("```")?;
    Some(after[..end].trim().to_string())
}

/// Best-effort extraction of the first parseable JSON object.
pub fn extract_json_value(text: &str) -> Option<serde_json::Value> {
    let cleaned = strip_markdown_fences(text);
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&cleaned) {
        if v.is_object() {
            return Some(v);
        }
    }
    for candidate in find_json_objects(&cleaned) {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(candidate) {
            return Some(v);
        }
    }
    if let Some(block) = first_fenced_json(text) {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&block) {
            return Some(v);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_json_fences() {
        let s = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_markdown_fences(s), "{\"a\": 1}");
    }

    #[test]
    fn finds_nested_objects_with_braces_in_strings() {
        let text = r#"prefix {"outer": {"inner": "has } brace"}} suffix {"second": 2}"#;
        let objs = find_json_objects(text);
        assert_eq!(objs.len(), 2);
        assert!(objs[0].contains("inner"));
        assert_eq!(objs[1], r#"{"second": 2}"#);
    }

    #[test]
    fn extracts_from_prose_wrapped_output() {
        let text = "Here is my analysis:\n{\"confidence\": 0.8}\nHope that helps!";
        let v = extract_json_value(text).unwrap();
        assert_eq!(v["confidence"], 0.8);
    }

    #[test]
    fn extracts_from_fenced_block_boundary_case() {
        let text = "```json\n{\"risk_type\": \"syntax_static_errors\"}\n```";
        let v = extract_json_value(text).unwrap();
        assert_eq!(v["risk_type"], "syntax_static_errors");
    }

    #[test]
    fn returns_none_for_plain_prose() {
        assert!(extract_json_value("no json here").is_none());
    }
}
