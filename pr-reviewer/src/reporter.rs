//! Reporter: threshold filtering plus final report rendering.
//!
//! Confirmed issues are the expert verdicts that clear their per-type
//! confidence threshold. With no confirmed issues the deterministic
//! "no issues" report is emitted without any LLM call; otherwise a single
//! tool-less LLM call renders the Markdown report, falling back to a
//! deterministic renderer on transport or template failure.

use tracing::{info, warn};

use crate::config::ReporterConfig;
use crate::prompts::{PromptRenderer, TemplateVars};
use crate::state::{RiskItem, Severity};
use llm_gateway::LlmGateway;
use llm_gateway::message::ChatMessage;

/// Deterministic report used when nothing cleared the thresholds.
pub const NO_ISSUES_REPORT: &str = "No issues found. Code review completed successfully.";

const REPORTER_SYSTEM: &str =
    "You are a senior code reviewer writing the final review report in Markdown.";

/// Reporter output.
#[derive(Debug)]
pub struct ReporterOutput {
    pub confirmed_issues: Vec<RiskItem>,
    pub final_report: String,
    /// True when the LLM rendering failed and the deterministic fallback
    /// was used.
    pub used_fallback: bool,
}

/// Applies thresholds; the result is sorted by severity, then location.
pub fn filter_confirmed(cfg: &ReporterConfig, verdicts: &[RiskItem]) -> Vec<RiskItem> {
    let mut confirmed: Vec<RiskItem> = verdicts
        .iter()
        .filter(|v| v.confidence >= cfg.threshold_for(v.risk_type))
        .cloned()
        .collect();
    confirmed.sort_by(|a, b| {
        b.severity
            .rank()
            .cmp(&a.severity.rank())
            .then(a.file_path.cmp(&b.file_path))
            .then(a.line_number.start.cmp(&b.line_number.start))
    });
    confirmed
}

/// Runs the report stage over flattened expert verdicts.
pub async fn run_reporter(
    gateway: &LlmGateway,
    prompts: &PromptRenderer,
    cfg: &ReporterConfig,
    verdicts: &[RiskItem],
    diff: &str,
    changed_file_count: usize,
) -> ReporterOutput {
    let confirmed_issues = filter_confirmed(cfg, verdicts);
    info!(
        verdicts = verdicts.len(),
        confirmed = confirmed_issues.len(),
        threshold = cfg.confidence_threshold,
        "stage4: reporter start"
    );

    if confirmed_issues.is_empty() {
        return ReporterOutput {
            confirmed_issues,
            final_report: NO_ISSUES_REPORT.to_string(),
            used_fallback: false,
        };
    }

    let issues_json = serde_json::to_string_pretty(&confirmed_issues)
        .unwrap_or_else(|_| "[]".to_string());

    let mut vars = TemplateVars::new();
    vars.insert("diff_context", truncate_chars(diff, 3000));
    vars.insert("confirmed_issues", issues_json);
    vars.insert("num_issues", confirmed_issues.len().to_string());
    vars.insert("num_files", changed_file_count.to_string());

    let rendered = match prompts.render("reporter", &vars) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "stage4: reporter template failed, using fallback renderer");
            let report = fallback_report(&confirmed_issues);
            return ReporterOutput {
                confirmed_issues,
                final_report: report,
                used_fallback: true,
            };
        }
    };

    let messages = [
        ChatMessage::system(REPORTER_SYSTEM),
        ChatMessage::user(rendered),
    ];
    match gateway.invoke(&messages, None).await {
        Ok(response) if !response.content.trim().is_empty() => ReporterOutput {
            confirmed_issues,
            final_report: response.content,
            used_fallback: false,
        },
        Ok(_) => {
            warn!("stage4: reporter LLM returned empty content, using fallback renderer");
            let report = fallback_report(&confirmed_issues);
            ReporterOutput {
                confirmed_issues,
                final_report: report,
                used_fallback: true,
            }
        }
        Err(e) => {
            warn!(error = %e, "stage4: reporter LLM failed, using fallback renderer");
            let report = fallback_report(&confirmed_issues);
            ReporterOutput {
                confirmed_issues,
                final_report: report,
                used_fallback: true,
            }
        }
    }
}

/// Deterministic Markdown renderer: grouped by severity, then by file.
pub fn fallback_report(confirmed: &[RiskItem]) -> String {
    if confirmed.is_empty() {
        return NO_ISSUES_REPORT.to_string();
    }

    let mut lines = vec![
        "# Code Review Report".to_string(),
        format!("\nTotal issues: {}\n", confirmed.len()),
    ];

    for severity in [Severity::Error, Severity::Warning, Severity::Info] {
        let mut group: Vec<&RiskItem> = confirmed
            .iter()
            .filter(|i| i.severity == severity)
            .collect();
        if group.is_empty() {
            continue;
        }
        group.sort_by(|a, b| {
            a.file_path
                .cmp(&b.file_path)
                .then(a.line_number.start.cmp(&b.line_number.start))
        });
        lines.push(format!(
            "\n## {} ({})",
            severity.as_str().to_uppercase(),
            group.len()
        ));
        for issue in group {
            lines.push(format!(
                "- **{}:{}** [{}] (confidence: {:.2})\n  {}",
                issue.file_path,
                issue.line_number,
                issue.risk_type,
                issue.confidence,
                issue.description
            ));
            if let Some(s) = &issue.suggestion {
                lines.push(format!("  Suggestion: {s}"));
            }
        }
    }

    lines.join("\n")
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
    use crate::config::ReporterConfig;
    use crate::state::{LineRange, RiskType};
    use llm_gateway::services::scripted::ScriptedService;

    fn verdict(rt: RiskType, conf: f32, sev: Severity, path: &str, line: u32) -> RiskItem {
        RiskItem {
            risk_type: rt,
            file_path: path.into(),
            line_number: LineRange::single(line),
            description: "d".into(),
            confidence: conf,
            severity: sev,
            suggestion: None,
        }
    }

    #[test]
    fn filter_honors_default_and_per_type_thresholds() {
        let mut cfg = ReporterConfig::default();
        cfg.confidence_threshold_by_risk_type
            .insert(RiskType::SyntaxStaticErrors, 0.9);
        let verdicts = vec![
            verdict(RiskType::SyntaxStaticErrors, 0.8, Severity::Error, "a.py", 1),
            verdict(RiskType::IntentSemanticConsistency, 0.8, Severity::Warning, "b.py", 2),
            verdict(RiskType::IntentSemanticConsistency, 0.5, Severity::Warning, "c.py", 3),
        ];
        let confirmed = filter_confirmed(&cfg, &verdicts);
        // Syntax item misses its raised threshold; 0.5 misses the default.
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].file_path, "b.py");
    }

    #[test]
    fn confirmed_sorted_by_severity_then_location() {
        let cfg = ReporterConfig::default();
        let verdicts = vec![
            verdict(RiskType::IntentSemanticConsistency, 0.9, Severity::Info, "a.py", 1),
            verdict(RiskType::IntentSemanticConsistency, 0.9, Severity::Error, "z.py", 9),
            verdict(RiskType::IntentSemanticConsistency, 0.9, Severity::Error, "a.py", 5),
        ];
        let confirmed = filter_confirmed(&cfg, &verdicts);
        assert_eq!(confirmed[0].file_path, "a.py");
        assert_eq!(confirmed[0].severity, Severity::Error);
        assert_eq!(confirmed[1].file_path, "z.py");
        assert_eq!(confirmed[2].severity, Severity::Info);
    }

    #[tokio::test]
    async fn empty_confirmed_set_skips_llm_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let prompts = PromptRenderer::new(dir.path());
        let gateway = LlmGateway::Scripted(ScriptedService::new(vec![]));
        let out = run_reporter(&gateway, &prompts, &ReporterConfig::default(), &[], "", 0).await;
        assert!(out.confirmed_issues.is_empty());
        assert_eq!(out.final_report, NO_ISSUES_REPORT);
        let LlmGateway::Scripted(svc) = &gateway else {
            unreachable!()
        };
        assert_eq!(svc.consumed(), 0);
    }

    #[tokio::test]
    async fn llm_failure_falls_back_to_deterministic_markdown() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("reporter"),
            "Report {num_issues} issues across {num_files} files.\n{confirmed_issues}\n{diff_context}",
        )
        .unwrap();
        let prompts = PromptRenderer::new(dir.path());
        // Empty script → the reporter call errors out.
        let gateway = LlmGateway::Scripted(ScriptedService::new(vec![]));
        let verdicts = vec![verdict(
            RiskType::AuthorizationDataExposure,
            0.9,
            Severity::Error,
            "src/auth.py",
            12,
        )];
        let out = run_reporter(&gateway, &prompts, &ReporterConfig::default(), &verdicts, "diff", 1).await;
        assert!(out.used_fallback);
        assert!(out.final_report.contains("# Code Review Report"));
        assert!(out.final_report.contains("## ERROR (1)"));
        assert!(out.final_report.contains("src/auth.py:12"));
    }

    #[tokio::test]
    async fn successful_llm_render_is_passed_through() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("reporter"), "{num_issues} {num_files} {confirmed_issues} {diff_context}").unwrap();
        let prompts = PromptRenderer::new(dir.path());
        let gateway = LlmGateway::Scripted(ScriptedService::new(vec![ChatMessage::assistant(
            "# Review\nLooks risky.",
        )]));
        let verdicts = vec![verdict(
            RiskType::SyntaxStaticErrors,
            0.95,
            Severity::Error,
            "a.py",
            3,
        )];
        let out = run_reporter(&gateway, &prompts, &ReporterConfig::default(), &verdicts, "", 1).await;
        assert!(!out.used_fallback);
        assert_eq!(out.final_report, "# Review\nLooks risky.");
    }

    #[test]
    fn fallback_groups_by_severity_then_file() {
        let issues = vec![
            verdict(RiskType::IntentSemanticConsistency, 0.9, Severity::Warning, "b.py", 8),
            verdict(RiskType::SyntaxStaticErrors, 0.9, Severity::Error, "a.py", 3),
        ];
        let report = fallback_report(&issues);
        let err_pos = report.find("## ERROR").unwrap();
        let warn_pos = report.find("## WARNING").unwrap();
        assert!(err_pos < warn_pos);
    }
}
