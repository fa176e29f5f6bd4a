//! Webhook entrypoint.
//!
//! A small axum service: `GET /healthz` plus `POST /webhook` receiving a
//! pull-request event. The handler validates the event (action, repo
//! allowlist), resolves the local checkout, runs the review pipeline,
//! and answers with the built review comments plus the skipped list.
//! Posting the comments to a forge is the caller's job.

pub mod comment_builder;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{error, info, warn};

use comment_builder::build_review_comments;
use pr_reviewer::config::Config;

/// Service settings, environment-driven like the rest of the deployment.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    /// Directory containing local checkouts, one per `owner/repo`.
    pub repos_root: PathBuf,
    /// Allowed `owner/repo` names; empty list rejects everything.
    pub allowed_repos: Vec<String>,
    pub bind_addr: String,
    pub max_review_comments: usize,
    pub max_line_fuzz: u32,
}

impl ApiSettings {
    /// Reads settings from the environment. `ALLOWED_REPOS` is required;
    /// the rest have defaults.
    pub fn from_env() -> Result<ApiSettings, String> {
        let allowed = std::env::var("ALLOWED_REPOS").map_err(|_| {
            "Missing env: ALLOWED_REPOS (comma-separated owner/repo)".to_string()
        })?;
        let allowed_repos: Vec<String> = allowed
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if allowed_repos.is_empty() {
            return Err("ALLOWED_REPOS must name at least one repository".into());
        }
        Ok(ApiSettings {
            repos_root: std::env::var("REPOS_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("code_data")),
            allowed_repos,
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            max_review_comments: std::env::var("MAX_REVIEW_COMMENTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            max_line_fuzz: std::env::var("MAX_LINE_FUZZ")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
        })
    }
}

#[derive(Clone)]
struct AppState {
    settings: Arc<ApiSettings>,
    config: Arc<Config>,
}

/// Pull-request event payload (the subset the service consumes).
#[derive(Debug, Deserialize)]
struct PullRequestEvent {
    action: String,
    repository: RepositoryRef,
    pull_request: PullRequestRef,
}

#[derive(Debug, Deserialize)]
struct RepositoryRef {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestRef {
    base: BranchRef,
    head: BranchRef,
}

#[derive(Debug, Deserialize)]
struct BranchRef {
    #[serde(rename = "ref")]
    name: String,
}

/// Builds the router; exposed separately for tests and embedding.
pub fn router(settings: ApiSettings, config: Config) -> Router {
    let state = AppState {
        settings: Arc::new(settings),
        config: Arc::new(config),
    };
    Router::new()
        .route("/healthz", get(healthz))
        .route("/webhook", post(webhook))
        .with_state(state)
}

/// Binds and serves until the process exits.
pub async fn start(settings: ApiSettings, config: Config) -> std::io::Result<()> {
    let addr = settings.bind_addr.clone();
    let app = router(settings, config);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "api: listening");
    axum::serve(listener, app).await
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn webhook(State(state): State<AppState>, body: String) -> Response {
    let event: PullRequestEvent = match serde_json::from_str(&body) {
        Ok(e) => e,
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid json").into_response(),
    };

    if !matches!(event.action.as_str(), "opened" | "synchronize" | "reopened") {
        return (StatusCode::OK, "ignored").into_response();
    }
    let repo_name = event.repository.full_name.trim();
    if !state
        .settings
        .allowed_repos
        .iter()
        .any(|r| r == repo_name)
    {
        warn!(repo = repo_name, "api: repo not allowed");
        return (StatusCode::OK, "repo not allowed").into_response();
    }

    let repo_path = state.settings.repos_root.join(repo_name);
    let base = event.pull_request.base.name;
    let head = event.pull_request.head.name;
    info!(repo = repo_name, %base, %head, "api: review requested");

    let outcome = pr_reviewer::run_review(
        &repo_path,
        &base,
        &head,
        (*state.config).clone(),
        Vec::new(),
    )
    .await;

    match outcome {
        Ok(review) => {
            let built = build_review_comments(
                &review.diff,
                &review.confirmed_issues,
                state.settings.max_review_comments,
                state.settings.max_line_fuzz,
            );
            info!(
                comments = built.review_comments.len(),
                skipped = built.skipped.len(),
                "api: review complete"
            );
            Json(serde_json::json!({
                "repository": repo_name,
                "confirmed_issues": review.confirmed_issues,
                "final_report": review.final_report,
                "review_comments": built.review_comments,
                "skipped": built.skipped,
            }))
            .into_response()
        }
        Err(e) => {
            error!(repo = repo_name, error = %e, "api: review failed");
            (StatusCode::UNPROCESSABLE_ENTITY, format!("review failed: {e}")).into_response()
        }
    }
}
