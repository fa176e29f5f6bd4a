//! Pipeline driver.
//!
//! Static graph: intent → manager → (experts | reporter) → reporter.
//! The driver owns `RunState` and the monotonic deadline, assembles the
//! gateway/tools/config dependencies for each stage, decides between
//! per-file and chunked intent, routes around the expert stage when the
//! manager produced no tasks, and serializes intermediate artifacts.
//! Stages never raise into the driver; the reporter always runs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::Config;
use crate::diff::DiffIndex;
use crate::errors::ReviewResult;
use crate::expert::ExpertRuntime;
use crate::intent::analyze_intent;
use crate::intent_chunked::analyze_intent_chunked;
use crate::manager::run_manager;
use crate::prompts::PromptRenderer;
use crate::reporter::run_reporter;
use crate::state::{Deadline, LintError, RiskItem, RunState};
use crate::tools::WorkspaceTools;
use llm_gateway::LlmGateway;

/// Inputs the driver consumes; producing them (git, linters) is the
/// caller's job.
#[derive(Debug, Default)]
pub struct ReviewInput {
    pub diff: String,
    pub changed_files: Vec<String>,
    pub lint_errors: Vec<LintError>,
}

/// Assembled dependencies for one pipeline run.
pub struct PipelineDriver {
    pub config: Config,
    pub gateway: LlmGateway,
    pub prompts: PromptRenderer,
    pub tools: WorkspaceTools,
}

impl PipelineDriver {
    /// Executes the four-stage pipeline and returns the final state.
    pub async fn run(&self, input: ReviewInput) -> ReviewResult<RunState> {
        let deadline = Deadline::new(Duration::from_secs(self.config.system.timeout_seconds));
        let semaphore = Arc::new(Semaphore::new(self.config.system.max_concurrent_llm_requests));

        let mut state = RunState {
            diff: input.diff,
            changed_files: input.changed_files,
            lint_errors: input.lint_errors,
            ..Default::default()
        };
        meta(&mut state, "timeout_seconds", self.config.system.timeout_seconds);
        let changed_files_count = state.changed_files.len();
        meta(&mut state, "changed_files", changed_files_count);

        let diff_index = DiffIndex::parse(&state.diff);

        // ---------------- stage 1: intent (map) ----------------
        let t1 = Instant::now();
        let chunked = self.should_use_chunked(&state, &diff_index);
        meta(&mut state, "intent_mode", if chunked { "chunked" } else { "per_file" });

        if chunked {
            let outcome = analyze_intent_chunked(
                &self.gateway,
                &self.prompts,
                &self.config,
                &diff_index,
                &state.changed_files,
                deadline,
                Arc::clone(&semaphore),
            )
            .await;
            meta(&mut state, "intent_chunk_total", outcome.chunk_total);
            meta(&mut state, "intent_chunk_selected", outcome.selected.clone());
            meta(&mut state, "intent_chunk_skipped", outcome.skipped.clone());
            meta(&mut state, "intent_chunk_cancelled", outcome.cancelled);
            state.file_analyses = outcome.analyses;
        } else {
            state.file_analyses = analyze_intent(
                &self.gateway,
                &self.prompts,
                &self.tools,
                &self.config,
                &diff_index,
                &state.changed_files,
                deadline,
                Arc::clone(&semaphore),
            )
            .await;
        }
        meta(&mut state, "stage1_ms", t1.elapsed().as_millis() as u64);
        let file_analyses_count = state.file_analyses.len();
        meta(&mut state, "file_analyses", file_analyses_count);
        self.write_artifact("file_analyses.json", &state.file_analyses);

        // ---------------- stage 2: manager (reduce) ----------------
        let t2 = Instant::now();
        let manager_out = run_manager(
            &self.config.manager,
            &diff_index,
            &state.file_analyses,
            &state.lint_errors,
        );
        state.work_list = manager_out.work_list;
        state.expert_tasks = manager_out.expert_tasks;
        meta(&mut state, "stage2_ms", t2.elapsed().as_millis() as u64);
        let work_list_count = state.work_list.len();
        meta(&mut state, "work_items", work_list_count);
        meta(&mut state, "dropped_unanchored", manager_out.dropped_unanchored);
        meta(&mut state, "capped_unanchored", manager_out.capped_unanchored);
        self.write_artifact("work_list.json", &state.work_list);

        // ---------------- stage 3: experts (routed) ----------------
        if state.expert_tasks.is_empty() {
            info!("driver: no expert tasks, routing straight to reporter");
        } else {
            let t3 = Instant::now();
            let runtime = ExpertRuntime {
                gateway: &self.gateway,
                prompts: &self.prompts,
                tools: &self.tools,
                cfg: &self.config,
                diff: &diff_index,
            };
            state.expert_results = runtime
                .run(&state.expert_tasks, deadline, Arc::clone(&semaphore))
                .await;
            meta(&mut state, "stage3_ms", t3.elapsed().as_millis() as u64);
        }
        let verdicts: Vec<RiskItem> = state
            .expert_results
            .values()
            .flat_map(|v| v.iter().cloned())
            .collect();
        meta(&mut state, "expert_verdicts", verdicts.len());

        // ---------------- stage 4: reporter ----------------
        let t4 = Instant::now();
        let reporter_out = run_reporter(
            &self.gateway,
            &self.prompts,
            &self.config.reporter,
            &verdicts,
            &state.diff,
            state.changed_files.len(),
        )
        .await;
        state.confirmed_issues = reporter_out.confirmed_issues;
        state.final_report = reporter_out.final_report;
        meta(&mut state, "stage4_ms", t4.elapsed().as_millis() as u64);
        let confirmed_issues_count = state.confirmed_issues.len();
        meta(&mut state, "confirmed_issues", confirmed_issues_count);
        meta(&mut state, "reporter_fallback", reporter_out.used_fallback);
        meta(&mut state, "deadline_exceeded", deadline.expired());
        meta(&mut state, "elapsed_ms", deadline.elapsed().as_millis() as u64);

        self.write_run_report(&state);
        info!(
            confirmed = state.confirmed_issues.len(),
            elapsed_ms = deadline.elapsed().as_millis() as u64,
            "driver: pipeline complete"
        );
        Ok(state)
    }

    /// Chunked intent activates when either explicit threshold trips.
    fn should_use_chunked(&self, state: &RunState, diff: &DiffIndex) -> bool {
        let files = state.changed_files.len();
        let chars = diff.total_chars();
        let by_files = files > self.config.system.chunked_file_count_threshold;
        let by_chars = chars > self.config.system.chunked_total_diff_chars_threshold;
        if by_files || by_chars {
            info!(
                files,
                chars,
                by_files,
                by_chars,
                "driver: activating chunked intent mode"
            );
        }
        by_files || by_chars
    }

    /// Best-effort artifact serialization; failures are logged only.
    fn write_artifact<T: serde::Serialize>(&self, name: &str, value: &T) {
        let dir = &self.config.system.artifacts_dir;
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!("driver: cannot create artifacts dir: {e}");
            return;
        }
        let path = dir.join(name);
        let data = serde_json::to_vec_pretty(value).unwrap_or_else(|_| b"{}".to_vec());
        if let Err(e) = std::fs::write(&path, data) {
            warn!("driver: failed to write artifact {}: {e}", path.display());
        }
    }

    fn write_run_report(&self, state: &RunState) {
        let report = serde_json::json!({
            "generated_at": chrono::Utc::now().to_rfc3339(),
            "metadata": state.metadata,
            "confirmed_issues": state.confirmed_issues,
            "final_report": state.final_report,
        });
        self.write_artifact("run_report.json", &report);
    }
}

fn meta(state: &mut RunState, key: &str, value: impl serde::Serialize) {
    if let Ok(v) = serde_json::to_value(value) {
        state.metadata.insert(key.to_string(), v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::AssetStore;
    use crate::reporter::NO_ISSUES_REPORT;
    use crate::state::{LineRange, RiskType, Severity};
    use llm_gateway::message::ChatMessage;
    use llm_gateway::services::scripted::ScriptedService;

    struct TestEnv {
        _prompts: tempfile::TempDir,
        _workspace: tempfile::TempDir,
        _artifacts: tempfile::TempDir,
        config: Config,
        prompts_path: std::path::PathBuf,
        workspace_path: std::path::PathBuf,
    }

    fn env_with_templates() -> TestEnv {
        let prompts = tempfile::tempdir().unwrap();
        for (name, body) in [
            ("intent_analysis", "Analyze {file_path}\n{file_diff}\n{file_content}"),
            (
                "intent_analysis_chunked",
                "Chunk {chunk_id} in {group_key}\nFiles:\n{files_list}\n{chunk_diff}",
            ),
            ("reporter", "Summarize {num_issues} issues in {num_files} files\n{confirmed_issues}\n{diff_context}"),
            ("expert_generic", "You validate {risk_type} findings.\n{available_tools}"),
        ] {
            std::fs::write(prompts.path().join(name), body).unwrap();
        }
        let workspace = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.system.workspace_root = workspace.path().to_path_buf();
        config.system.artifacts_dir = artifacts.path().to_path_buf();
        TestEnv {
            prompts_path: prompts.path().to_path_buf(),
            workspace_path: workspace.path().to_path_buf(),
            _prompts: prompts,
            _workspace: workspace,
            _artifacts: artifacts,
            config,
        }
    }

    fn driver(env: &TestEnv, replies: Vec<ChatMessage>) -> PipelineDriver {
        PipelineDriver {
            config: env.config.clone(),
            gateway: LlmGateway::Scripted(ScriptedService::new(replies)),
            prompts: PromptRenderer::new(&env.prompts_path),
            tools: WorkspaceTools::new(
                &env.workspace_path,
                AssetStore::new(env.workspace_path.join(".assets")),
                None,
            ),
        }
    }

    #[tokio::test]
    async fn empty_diff_yields_deterministic_no_issues_report() {
        let env = env_with_templates();
        let d = driver(&env, vec![]);
        let state = d.run(ReviewInput::default()).await.unwrap();
        assert!(state.confirmed_issues.is_empty());
        assert_eq!(state.final_report, NO_ISSUES_REPORT);

        // Second run returns identical bytes; no LLM call was ever made.
        let state2 = d.run(ReviewInput::default()).await.unwrap();
        assert_eq!(state.final_report, state2.final_report);
        assert_eq!(
            serde_json::to_string(&state.confirmed_issues).unwrap(),
            serde_json::to_string(&state2.confirmed_issues).unwrap()
        );
        let LlmGateway::Scripted(svc) = &d.gateway else {
            unreachable!()
        };
        assert_eq!(svc.consumed(), 0);
    }

    #[tokio::test]
    async fn lint_only_path_flows_to_confirmed_issue() {
        let env = env_with_templates();
        std::fs::create_dir_all(env.workspace_path.join("src")).unwrap();
        std::fs::write(
            env.workspace_path.join("src/a.py"),
            "l1\nl2\nl3\nl4\nl5\n",
        )
        .unwrap();

        let diff = "\
diff --git a/src/a.py b/src/a.py
--- /dev/null
+++ b/src/a.py
@@ -0,0 +1,5 @@
+l1
+l2
+l3
+l4
+l5
";
        let intent_reply = ChatMessage::assistant(
            r#"{"file_path": "src/a.py", "intent_summary": "new module", "potential_risks": []}"#,
        );
        let expert_reply = ChatMessage::assistant(
            r#"{"risk_type": "syntax_static_errors", "file_path": "src/a.py",
                "line_number": [3, 3], "description": "[E0602] undefined",
                "confidence": 0.9, "severity": "error", "suggestion": "define the name"}"#,
        );
        let reporter_reply = ChatMessage::assistant("# Review\nOne confirmed issue.");

        let d = driver(&env, vec![intent_reply, expert_reply, reporter_reply]);
        let input = ReviewInput {
            diff: diff.to_string(),
            changed_files: vec!["src/a.py".into()],
            lint_errors: vec![LintError {
                file: "src/a.py".into(),
                line: 3,
                message: "undefined".into(),
                severity: Severity::Error,
                code: "E0602".into(),
            }],
        };
        let state = d.run(input).await.unwrap();

        assert_eq!(state.work_list.len(), 1);
        assert_eq!(state.work_list[0].risk_type, RiskType::SyntaxStaticErrors);
        assert_eq!(state.work_list[0].line_number, LineRange { start: 3, end: 3 });
        assert_eq!(state.work_list[0].description, "[E0602] undefined");
        assert_eq!(state.work_list[0].confidence, 0.8);

        assert_eq!(state.confirmed_issues.len(), 1);
        assert_eq!(state.confirmed_issues[0].confidence, 0.9);
        assert_eq!(state.final_report, "# Review\nOne confirmed issue.");
        assert_eq!(
            state.metadata.get("intent_mode"),
            Some(&serde_json::json!("per_file"))
        );
    }

    #[tokio::test]
    async fn anchor_drop_routes_straight_to_reporter() {
        let env = env_with_templates();
        let diff = "\
diff --git a/src/a.py b/src/a.py
--- a/src/a.py
+++ b/src/a.py
@@ -10,0 +10,11 @@
+a
+b
+c
+d
+e
+f
+g
+h
+i
+j
+k
";
        // Intent reports one risk far from the changed lines.
        let intent_reply = ChatMessage::assistant(
            r#"{"file_path": "src/a.py", "intent_summary": "s", "potential_risks": [
                {"risk_type": "robustness_boundary_conditions", "file_path": "src/a.py",
                 "line_number": [120, 120], "description": "far away", "confidence": 0.9,
                 "severity": "warning"}]}"#,
        );
        let d = driver(&env, vec![intent_reply]);
        let state = d
            .run(ReviewInput {
                diff: diff.to_string(),
                changed_files: vec!["src/a.py".into()],
                lint_errors: vec![],
            })
            .await
            .unwrap();

        assert!(state.work_list.is_empty());
        assert!(state.expert_tasks.is_empty());
        assert!(state.confirmed_issues.is_empty());
        assert_eq!(state.final_report, NO_ISSUES_REPORT);
        // Only the intent call was consumed.
        let LlmGateway::Scripted(svc) = &d.gateway else {
            unreachable!()
        };
        assert_eq!(svc.consumed(), 1);
    }

    #[tokio::test]
    async fn oversized_pr_uses_chunked_mode() {
        let mut env = env_with_templates();
        env.config.system.chunked_file_count_threshold = 1;
        let diff = "\
diff --git a/src/a.py b/src/a.py
--- a/src/a.py
+++ b/src/a.py
@@ -1,0 +1,1 @@
+x
diff --git a/lib/b.py b/lib/b.py
--- a/lib/b.py
+++ b/lib/b.py
@@ -1,0 +1,1 @@
+y
";
        // Two chunks (distinct depth-2 groups), each answered empty.
        let empty = ChatMessage::assistant(r#"{"file_analyses": []}"#);
        let d = driver(&env, vec![empty.clone(), empty]);
        let state = d
            .run(ReviewInput {
                diff: diff.to_string(),
                changed_files: vec!["src/a.py".into(), "lib/b.py".into()],
                lint_errors: vec![],
            })
            .await
            .unwrap();

        assert_eq!(
            state.metadata.get("intent_mode"),
            Some(&serde_json::json!("chunked"))
        );
        assert_eq!(
            state.metadata.get("intent_chunk_total"),
            Some(&serde_json::json!(2))
        );
        assert_eq!(state.final_report, NO_ISSUES_REPORT);
    }

    #[tokio::test]
    async fn artifacts_are_serialized() {
        let env = env_with_templates();
        let d = driver(&env, vec![]);
        let _ = d.run(ReviewInput::default()).await.unwrap();
        assert!(env.config.system.artifacts_dir.join("file_analyses.json").is_file());
        assert!(env.config.system.artifacts_dir.join("work_list.json").is_file());
        assert!(env.config.system.artifacts_dir.join("run_report.json").is_file());
    }
}
