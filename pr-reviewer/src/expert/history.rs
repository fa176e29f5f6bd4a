//! Message-history budgeting for the expert loop.
//!
//! The full log is append-only and survives for audit and digest
//! building; shrinking returns a new view. Rules:
//! - keep at most `max_history_messages` trailing messages, extending
//!   backwards over a trailing tool block so the assistant message that
//!   spawned it stays in view;
//! - never start the view with a tool message;
//! - re-insert the latest user turn when none survived;
//! - clip oversized tool/assistant payloads, then drop from the front
//!   until the total character budget holds.

use llm_gateway::message::{ChatMessage, Role};

use crate::config::ExpertConfig;

/// Truncates with an explicit marker; empty when `max_chars` is zero.
pub fn truncate_text(s: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_chars).collect();
    format!("{cut}\n...[truncated]...")
}

/// Returns a budgeted view of `messages` (system message excluded).
pub fn shrink_history(messages: &[ChatMessage], cfg: &ExpertConfig) -> Vec<ChatMessage> {
    if messages.is_empty() {
        return Vec::new();
    }
    let max_history = cfg.max_history_messages.max(1);
    let max_total = cfg.max_total_chars.max(10_000);
    let max_tool = cfg.max_tool_chars.max(500);
    let max_ai = cfg.max_ai_chars.max(500);

    // Collect backwards; a trailing tool message pulls in its caller.
    let mut collected: Vec<ChatMessage> = Vec::new();
    let mut idx = messages.len();
    let mut need_prev_for_tool = false;
    while idx > 0 && (collected.len() < max_history || need_prev_for_tool) {
        idx -= 1;
        let m = &messages[idx];
        collected.push(m.clone());
        need_prev_for_tool = m.role == Role::Tool;
    }
    collected.reverse();

    while collected.first().map(|m| m.role) == Some(Role::Tool) {
        collected.remove(0);
    }

    if !collected.is_empty() && !collected.iter().any(|m| m.role == Role::User) {
        if let Some(user) = messages[..idx].iter().rev().find(|m| m.role == Role::User) {
            collected.insert(0, user.clone());
        }
    }

    let mut clipped: Vec<ChatMessage> = collected
        .into_iter()
        .map(|mut m| {
            match m.role {
                Role::Tool => m.content = truncate_text(&m.content, max_tool),
                Role::Assistant => m.content = truncate_text(&m.content, max_ai),
                _ => {}
            }
            m
        })
        .collect();

    let total = |msgs: &[ChatMessage]| -> usize { msgs.iter().map(|m| m.content.len()).sum() };
    while clipped.len() > 1 && total(&clipped) > max_total {
        clipped.remove(0);
        while clipped.first().map(|m| m.role) == Some(Role::Tool) {
            clipped.remove(0);
        }
    }
    clipped
}

/// Labeled, truncated concatenation of recent assistant and tool
/// contents, oldest first. Attached to the forced-finalize prompt so the
/// model can conclude without further tools.
pub fn build_evidence_digest(messages: &[ChatMessage], cfg: &ExpertConfig) -> String {
    let max_digest = cfg.max_digest_chars.max(1000);
    const PER_ENTRY: usize = 3000;

    // Map tool_call_id -> tool name from the assistant intents.
    let mut names: std::collections::BTreeMap<&str, &str> = std::collections::BTreeMap::new();
    for m in messages {
        for tc in &m.tool_calls {
            names.insert(tc.id.as_str(), tc.name.as_str());
        }
    }

    let mut parts: Vec<String> = Vec::new();
    let mut used = 0usize;
    for m in messages.iter().rev() {
        if used >= max_digest {
            break;
        }
        let block = match m.role {
            Role::Tool => {
                let id = m.tool_call_id.as_deref().unwrap_or("");
                let name = names.get(id).copied().unwrap_or("tool");
                format!("[TOOL:{name} id={id}]\n{}\n", truncate_text(&m.content, PER_ENTRY))
            }
            Role::Assistant => {
                let content = m.content.trim();
                if content.is_empty() {
                    continue;
                }
                format!("[ASSISTANT]\n{}\n", truncate_text(content, PER_ENTRY))
            }
            _ => continue,
        };
        if used + block.len() > max_digest && !parts.is_empty() {
            break;
        }
        used += block.len();
        parts.push(block);
    }
    parts.reverse();
    parts.join("\n").trim().to_string()
}

/// A tool result carrying no actionable information: errors, empty match
/// lists, or an unavailable repo map.
pub fn is_no_signal(content: &str) -> bool {
    let s = content.trim();
    if s.is_empty() {
        return true;
    }
    if s.contains("Error invoking tool") || s.contains("Repository map not found") {
        return true;
    }
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(s) {
        if let Some(err) = v.get("error") {
            let empty_str = err.as_str().map(|e| e.is_empty()).unwrap_or(false);
            if !err.is_null() && !empty_str {
                return true;
            }
        }
        if v.get("matches")
            .and_then(|m| m.as_array())
            .map(|a| a.is_empty())
            .unwrap_or(false)
        {
            return true;
        }
        if v.get("total").and_then(|t| t.as_u64()) == Some(0) {
            return true;
        }
        return false;
    }
    s.contains("\"matches\": []") || s.contains("\"total\": 0") || s.contains("No matches found")
}

/// No-signal tool results among the trailing `window` tool messages.
pub fn count_recent_no_signal(messages: &[ChatMessage], window: usize) -> usize {
    let window = window.max(1);
    let mut seen = 0usize;
    let mut hits = 0usize;
    for m in messages.iter().rev() {
        if m.role != Role::Tool {
            continue;
        }
        seen += 1;
        if is_no_signal(&m.content) {
            hits += 1;
        }
        if seen >= window {
            break;
        }
    }
    hits
}

/// Tool messages in the whole log.
pub fn count_tool_messages(messages: &[ChatMessage]) -> usize {
    messages.iter().filter(|m| m.role == Role::Tool).count()
}

/// Assistant messages in the whole log.
pub fn count_assistant_messages(messages: &[ChatMessage]) -> usize {
    messages.iter().filter(|m| m.role == Role::Assistant).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm_gateway::message::ToolCall;

    fn cfg() -> ExpertConfig {
        ExpertConfig::default()
    }

    fn assistant_calling(id: &str) -> ChatMessage {
        ChatMessage::assistant_with_tool_calls(
            "",
            vec![ToolCall {
                id: id.into(),
                name: "run_grep".into(),
                args: serde_json::json!({}),
            }],
        )
    }

    #[test]
    fn shrink_keeps_caller_of_trailing_tool_block() {
        let mut cfg = cfg();
        cfg.max_history_messages = 1;
        let log = vec![
            ChatMessage::user("start"),
            assistant_calling("c1"),
            ChatMessage::tool("c1", "result"),
        ];
        let out = shrink_history(&log, &cfg);
        // The window of 1 lands on the tool message; its assistant caller
        // is pulled in, and the user turn is re-inserted up front.
        let roles: Vec<Role> = out.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool]);
    }

    #[test]
    fn shrink_never_starts_with_tool() {
        let mut cfg = cfg();
        cfg.max_history_messages = 2;
        let log = vec![
            ChatMessage::user("u"),
            assistant_calling("c1"),
            ChatMessage::tool("c1", "r1"),
            ChatMessage::assistant("done"),
        ];
        let out = shrink_history(&log, &cfg);
        assert_ne!(out.first().map(|m| m.role), Some(Role::Tool));
    }

    #[test]
    fn shrink_clips_oversized_payloads() {
        let mut cfg = cfg();
        cfg.max_tool_chars = 500;
        cfg.max_ai_chars = 500;
        let log = vec![
            ChatMessage::user("u"),
            assistant_calling("c1"),
            ChatMessage::tool("c1", &"x".repeat(9000)),
            ChatMessage::assistant(&"y".repeat(9000)),
        ];
        let out = shrink_history(&log, &cfg);
        let tool = out.iter().find(|m| m.role == Role::Tool).unwrap();
        let ai = out.iter().rfind(|m| m.role == Role::Assistant).unwrap();
        assert!(tool.content.len() < 600);
        assert!(tool.content.ends_with("...[truncated]..."));
        assert!(ai.content.len() < 600);
    }

    #[test]
    fn digest_labels_tools_by_name_and_orders_oldest_first() {
        let log = vec![
            ChatMessage::user("u"),
            assistant_calling("c1"),
            ChatMessage::tool("c1", "{\"total\": 3}"),
            ChatMessage::assistant("I found the call site."),
        ];
        let digest = build_evidence_digest(&log, &cfg());
        let tool_pos = digest.find("[TOOL:run_grep id=c1]").unwrap();
        let ai_pos = digest.find("[ASSISTANT]").unwrap();
        assert!(tool_pos < ai_pos);
        assert!(digest.contains("{\"total\": 3}"));
    }

    #[test]
    fn no_signal_detects_errors_and_empties() {
        assert!(is_no_signal(""));
        assert!(is_no_signal("Error invoking tool: unknown tool `x`"));
        assert!(is_no_signal("{\"matches\": [], \"total\": 0, \"error\": null}"));
        assert!(is_no_signal("{\"error\": \"File not found: x\"}"));
        assert!(is_no_signal("{\"summary\": \"\", \"error\": \"Repository map not found in storage\"}"));
        assert!(!is_no_signal("{\"matches\": [{\"file\": \"a.rs\"}], \"total\": 2, \"error\": null}"));
        assert!(!is_no_signal("{\"content\": \"1: fn main()\", \"error\": null}"));
    }

    #[test]
    fn no_signal_streak_counts_within_window() {
        let mut log = vec![ChatMessage::user("u")];
        for i in 0..6 {
            log.push(assistant_calling(&format!("c{i}")));
            log.push(ChatMessage::tool(format!("c{i}"), "{\"matches\": [], \"total\": 0}"));
        }
        assert_eq!(count_recent_no_signal(&log, 10), 6);
        assert_eq!(count_recent_no_signal(&log, 3), 3);
        assert_eq!(count_tool_messages(&log), 6);
        assert_eq!(count_assistant_messages(&log), 6);
    }
}
