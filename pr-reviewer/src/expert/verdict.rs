//! Final-verdict parsing for the expert loop.
//!
//! Order of attempts: whole-message JSON parse (after stripping fences),
//! then the first balanced `{...}` object mentioning `risk_type` or
//! `file_path`, then the first fenced JSON block. Identity is enforced:
//! the verdict keeps the task's `file_path` and risk type (unless the
//! model names another known type), and the line range may only narrow
//! within the file's bounds.

use tracing::debug;

use crate::json_text::{find_json_objects, first_fenced_json, strip_markdown_fences};
use crate::state::{LineRange, RiskItem, RiskType, Severity};

/// Parses the assistant's final text into a verdict; `None` when no JSON
/// object could be recovered at all.
pub fn parse_verdict(text: &str, task: &RiskItem, file_line_count: Option<u32>) -> Option<RiskItem> {
    let value = extract_verdict_value(text)?;
    Some(verdict_from_value(&value, task, file_line_count))
}

/// Zero-confidence verdict preserving the task anchor; used when parsing
/// or the finalize call fails.
pub fn zero_confidence_verdict(task: &RiskItem) -> RiskItem {
    RiskItem {
        risk_type: task.risk_type,
        file_path: task.file_path.clone(),
        line_number: task.line_number,
        description: task.description.clone(),
        confidence: 0.0,
        severity: Severity::Info,
        suggestion: None,
    }
}

fn extract_verdict_value(text: &str) -> Option<serde_json::Value> {
    let cleaned = strip_markdown_fences(text);

    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&cleaned) {
        if v.is_object() {
            return Some(v);
        }
    }

    for candidate in find_json_objects(&cleaned) {
        if !(candidate.contains("risk_type") || candidate.contains("file_path")) {
            continue;
        }
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(candidate) {
            return Some(v);
        }
    }

    if let Some(block) = first_fenced_json(text) {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&block) {
            if v.is_object() {
                return Some(v);
            }
        }
    }

    debug!("expert: no JSON object recoverable from final response");
    None
}

fn verdict_from_value(
    value: &serde_json::Value,
    task: &RiskItem,
    file_line_count: Option<u32>,
) -> RiskItem {
    // Unknown risk types fall back to the task's original type.
    let risk_type = value
        .get("risk_type")
        .and_then(|v| v.as_str())
        .and_then(RiskType::parse)
        .unwrap_or(task.risk_type);

    let mut line_number = value
        .get("line_number")
        .and_then(LineRange::normalize)
        .unwrap_or(task.line_number);
    if let Some(count) = file_line_count {
        line_number = line_number.clamp_to(count);
    }

    let description = value
        .get("description")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(&task.description)
        .to_string();

    let confidence = value
        .get("confidence")
        .and_then(|v| v.as_f64())
        .map(|c| c as f32)
        .unwrap_or(task.confidence)
        .clamp(0.0, 1.0);

    let severity = value
        .get("severity")
        .and_then(|v| v.as_str())
        .map(Severity::parse)
        .unwrap_or(task.severity);

    let suggestion = value
        .get("suggestion")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .filter(|s| !s.trim().is_empty());

    RiskItem {
        risk_type,
        // Identity: the expert may not move the finding to another file.
        file_path: task.file_path.clone(),
        line_number,
        description,
        confidence,
        severity,
        suggestion,
    }
}
