//! Intent analysis (map stage).
//!
//! One LLM call per changed file, fanned out under the shared semaphore.
//! Each call renders the `intent_analysis` template with the file's diff
//! section and (capped) content, requests a schema-conforming JSON
//! object, and parses it strictly; on failure a best-effort textual
//! recovery runs. A per-file failure never raises into the stage — it
//! yields a diagnostic `FileAnalysis` with empty risks.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::diff::DiffIndex;
use crate::json_text::extract_json_value;
use crate::prompts::{PromptRenderer, TemplateVars};
use crate::state::{
    Deadline, FileAnalysis, LineRange, RiskItem, RiskType, Severity, file_analysis_format_instructions,
    sort_file_analyses,
};
use crate::tools::WorkspaceTools;
use llm_gateway::LlmGateway;
use llm_gateway::message::ChatMessage;

/// System persona for intent calls.
const INTENT_SYSTEM: &str = "You are an expert code reviewer analyzing file changes.";

/// Runs per-file intent analysis over all changed files.
pub async fn analyze_intent(
    gateway: &LlmGateway,
    prompts: &PromptRenderer,
    tools: &WorkspaceTools,
    cfg: &Config,
    diff: &DiffIndex,
    changed_files: &[String],
    deadline: Deadline,
    semaphore: Arc<Semaphore>,
) -> Vec<FileAnalysis> {
    if changed_files.is_empty() {
        warn!("stage1: no changed files to analyze");
        return Vec::new();
    }

    info!(
        files = changed_files.len(),
        concurrency = cfg.system.max_concurrent_llm_requests,
        "stage1: intent analysis start"
    );

    let mut pending: FuturesUnordered<_> = changed_files
        .iter()
        .map(|file_path| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = match semaphore.acquire().await {
                    Ok(p) => p,
                    Err(_) => return FileAnalysis::diagnostic(file_path.as_str(), "semaphore closed"),
                };
                if deadline.expired() {
                    return FileAnalysis::diagnostic(
                        file_path.as_str(),
                        "deadline exceeded before analysis",
                    );
                }
                analyze_file(gateway, prompts, tools, cfg, diff, file_path).await
            }
        })
        .collect();

    let mut analyses = Vec::with_capacity(changed_files.len());
    while let Some(fa) = pending.next().await {
        analyses.push(fa);
    }

    sort_file_analyses(&mut analyses);
    let total_risks: usize = analyses.iter().map(|fa| fa.potential_risks.len()).sum();
    info!(
        analyses = analyses.len(),
        risks = total_risks,
        "stage1: intent analysis done"
    );
    analyses
}

async fn analyze_file(
    gateway: &LlmGateway,
    prompts: &PromptRenderer,
    tools: &WorkspaceTools,
    cfg: &Config,
    diff: &DiffIndex,
    file_path: &str,
) -> FileAnalysis {
    debug!(file = %file_path, "stage1: analyzing");

    let file_diff = diff.file_diff(file_path).to_string();
    let mut file_content = tools.read_file_content(file_path);
    let cap = cfg.system.max_file_content_chars;
    if file_content.chars().count() > cap {
        file_content = file_content.chars().take(cap).collect::<String>() + "\n...[truncated]...";
    }

    let mut vars = TemplateVars::new();
    vars.insert("file_path", file_path.to_string());
    vars.insert("file_diff", file_diff);
    vars.insert("file_content", file_content);

    let rendered = match prompts.render("intent_analysis", &vars) {
        Ok(r) => r,
        Err(e) => return FileAnalysis::diagnostic(file_path, e),
    };

    let messages = [
        ChatMessage::system(INTENT_SYSTEM),
        ChatMessage::user(format!(
            "{rendered}\n\n{}",
            file_analysis_format_instructions()
        )),
    ];

    let response_text = match gateway.invoke(&messages, None).await {
        Ok(msg) => msg.content,
        Err(e) => {
            warn!(file = %file_path, error = %e, "stage1: llm call failed");
            return FileAnalysis::diagnostic(file_path, e);
        }
    };

    parse_file_analysis(&response_text, file_path)
}

/// Strict parse first, then lenient recovery.
pub fn parse_file_analysis(text: &str, file_path: &str) -> FileAnalysis {
    if let Some(value) = extract_json_value(text) {
        if let Ok(mut fa) = serde_json::from_value::<FileAnalysis>(value.clone()) {
            if fa.file_path.trim().is_empty() {
                fa.file_path = file_path.to_string();
            }
            return fa;
        }
        return lenient_from_value(&value, file_path, text);
    }
    // No JSON at all: keep a trace of what the model said.
    FileAnalysis {
        file_path: file_path.to_string(),
        intent_summary: truncate_chars(text, 500),
        potential_risks: Vec::new(),
        complexity_score: None,
    }
}

/// Field-by-field recovery: normalize `line_number` shapes, coerce
/// unknown risk types, skip items without a usable range.
pub(crate) fn lenient_from_value(
    value: &serde_json::Value,
    file_path: &str,
    raw: &str,
) -> FileAnalysis {
    let intent_summary = value
        .get("intent_summary")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| truncate_chars(raw, 500));

    let mut potential_risks = Vec::new();
    if let Some(items) = value.get("potential_risks").and_then(|v| v.as_array()) {
        for item in items {
            let Some(line_number) = item.get("line_number").and_then(LineRange::normalize) else {
                warn!(file = %file_path, "stage1: dropping risk without usable line_number");
                continue;
            };
            let risk_type = item
                .get("risk_type")
                .and_then(|v| v.as_str())
                .and_then(RiskType::parse)
                .unwrap_or(RiskType::RobustnessBoundaryConditions);
            let description = item
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let confidence = item
                .get("confidence")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.5) as f32;
            let severity = item
                .get("severity")
                .and_then(|v| v.as_str())
                .map(Severity::parse)
                .unwrap_or(Severity::Info);
            let suggestion = item
                .get("suggestion")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            potential_risks.push(RiskItem {
                risk_type,
                file_path: item
                    .get("file_path")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or(file_path)
                    .to_string(),
                line_number,
                description,
                confidence: confidence.clamp(0.0, 1.0),
                severity,
                suggestion,
            });
        }
    }

    let complexity_score = value
        .get("complexity_score")
        .and_then(|v| v.as_f64())
        .map(|v| v as f32)
        .filter(|v| (0.0..=100.0).contains(v));

    FileAnalysis {
        file_path: file_path.to_string(),
        intent_summary,
        potential_risks,
        complexity_score,
    }
}

fn truncate_chars(s: &str, n: usize) -> String {
    if s.chars().count() <= n {
        s.to_string()
    } else {
        s.chars().take(n).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_schema_parse_round_trips() {
        let text = r#"{"file_path": "src/a.py", "intent_summary": "adds parser",
            "potential_risks": [{"risk_type": "concurrency_timing_correctness",
            "file_path": "src/a.py", "line_number": [4, 6],
            "description": "lock not held", "confidence": 0.7, "severity": "warning"}]}"#;
        let fa = parse_file_analysis(text, "src/a.py");
        assert_eq!(fa.potential_risks.len(), 1);
        assert_eq!(
            fa.potential_risks[0].risk_type,
            RiskType::ConcurrencyTimingCorrectness
        );
        assert_eq!(fa.potential_risks[0].line_number, LineRange { start: 4, end: 6 });
    }

    #[test]
    fn fenced_output_still_parses() {
        let text = "```json\n{\"file_path\": \"a.py\", \"intent_summary\": \"x\", \"potential_risks\": []}\n```";
        let fa = parse_file_analysis(text, "a.py");
        assert_eq!(fa.intent_summary, "x");
        assert!(fa.potential_risks.is_empty());
    }

    #[test]
    fn lenient_parse_normalizes_scalar_line_numbers() {
        let text = r#"{"intent_summary": "s", "potential_risks": [
            {"risk_type": "made_up_type", "line_number": 7, "description": "d"},
            {"risk_type": "authorization_data_exposure", "line_number": [3], "description": "e"},
            {"risk_type": "authorization_data_exposure", "description": "no line"}
        ]}"#;
        let fa = parse_file_analysis(text, "b.py");
        assert_eq!(fa.potential_risks.len(), 2);
        // Unknown risk type coerces to robustness.
        assert_eq!(
            fa.potential_risks[0].risk_type,
            RiskType::RobustnessBoundaryConditions
        );
        assert_eq!(fa.potential_risks[0].line_number, LineRange { start: 7, end: 7 });
        assert_eq!(fa.potential_risks[1].line_number, LineRange { start: 3, end: 3 });
        assert_eq!(fa.potential_risks[0].file_path, "b.py");
    }

    #[test]
    fn prose_only_output_becomes_empty_analysis() {
        let fa = parse_file_analysis("I could not analyze this file.", "c.py");
        assert!(fa.potential_risks.is_empty());
        assert!(fa.intent_summary.contains("could not analyze"));
    }
}
