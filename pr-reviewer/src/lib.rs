//! Public entry for the pr-reviewer pipeline.
//!
//! Single high-level function to review a PR against a local repository.
//!
//! 1) **Step 1 — Git I/O**
//!    - Validate the repo path, check out `head_ref`
//!    - Produce the triple-dot diff (merge base → head) and changed files
//!
//! 2) **Step 2 — Path filtering**
//!    - Drop low-signal paths (locks, generated code, binaries, media)
//!
//! 3) **Step 3 — Pipeline**
//!    - Intent (per-file map, or chunked for oversized PRs)
//!    - Manager (anchor, merge, budget, group)
//!    - Experts (bounded tool-calling loops, shared LLM semaphore)
//!    - Reporter (thresholds + final Markdown report)
//!
//! The pipeline uses `tracing` for step logging and avoids `async-trait`
//! and heap trait objects. Dispatch over LLM backends is enum-based.

pub mod assets;
pub mod config;
pub mod diff;
pub mod errors;
pub mod expert;
pub mod intent;
pub mod intent_chunked;
pub mod json_text;
pub mod manager;
pub mod path_filter;
pub mod pipeline;
pub mod prompts;
pub mod reporter;
pub mod state;
pub mod tools;

use std::path::Path;
use std::time::Instant;

use tracing::{debug, info};

use assets::AssetStore;
use config::Config;
use errors::{Error, ReviewResult};
use pipeline::{PipelineDriver, ReviewInput};
use prompts::PromptRenderer;
use state::{LintError, RunState};
use tools::WorkspaceTools;
use llm_gateway::LlmGateway;

/// Runs a full review of `base_ref...head_ref` in `repo_path`.
///
/// The working tree is checked out to `head_ref` before any tool runs.
/// `lint_errors` come from an external linter invocation and enter the
/// manager as evidence-based syntax risks.
pub async fn run_review(
    repo_path: &Path,
    base_ref: &str,
    head_ref: &str,
    mut config: Config,
    lint_errors: Vec<LintError>,
) -> ReviewResult<RunState> {
    // ---------------------------
    // Step 1: git I/O
    // ---------------------------
    let t0 = Instant::now();
    debug!("step1: open repository {}", repo_path.display());
    let repo = git_services::GitRepo::open(repo_path)
        .map_err(|e| Error::Input(format!("{}: {e}", repo_path.display())))?;

    debug!("step1: checkout {head_ref}");
    repo.checkout(head_ref)
        .map_err(|e| Error::Input(format!("cannot check out {head_ref}: {e}")))?;

    let diff = repo
        .diff(base_ref, head_ref)
        .map_err(|e| Error::Input(format!("diff {base_ref}...{head_ref}: {e}")))?;
    let files = repo
        .list_changed_files(base_ref, head_ref)
        .map_err(|e| Error::Input(format!("changed files {base_ref}...{head_ref}: {e}")))?;
    debug!(
        "step1: done in {} ms (files={}, diff_chars={})",
        t0.elapsed().as_millis(),
        files.len(),
        diff.len()
    );

    // ---------------------------
    // Step 2: path filtering
    // ---------------------------
    let changed_files = path_filter::filter_changed_files(&files, &config.path_filter);
    if changed_files.len() != files.len() {
        info!(
            kept = changed_files.len(),
            dropped = files.len() - changed_files.len(),
            "step2: path filter applied"
        );
    }

    // ---------------------------
    // Step 3: pipeline
    // ---------------------------
    config.system.workspace_root = repo_path.to_path_buf();
    let driver = build_driver(config)?;
    driver
        .run(ReviewInput {
            diff,
            changed_files,
            lint_errors,
        })
        .await
}

/// Assembles the pipeline driver from a config. The only place gateway,
/// tools, and prompts are wired together.
pub fn build_driver(config: Config) -> ReviewResult<PipelineDriver> {
    let gateway = LlmGateway::from_config(config.llm.clone())
        .map_err(|e| Error::Input(format!("gateway config: {e}")))?;
    let prompts = PromptRenderer::new(&config.system.prompts_dir);
    let tools = WorkspaceTools::new(
        &config.system.workspace_root,
        AssetStore::new(&config.system.assets_dir),
        config.system.asset_key.clone(),
    );
    Ok(PipelineDriver {
        config,
        gateway,
        prompts,
        tools,
    })
}

// -----------------------------------------------------------------------------
// Convenience re-exports for downstream users
// -----------------------------------------------------------------------------

pub use config::Config as ReviewerConfig;
pub use reporter::NO_ISSUES_REPORT;
pub use state::{
    FileAnalysis, LineRange, LintError as ReviewerLintError, RiskItem, RiskType, RunState as ReviewState,
    Severity,
};
