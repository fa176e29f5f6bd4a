//! Review system configuration.
//!
//! Loaded from a JSON file (optional), then overridden by environment
//! variables. Every knob carries the documented default so an empty
//! `{}` config is fully usable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::state::RiskType;

pub use llm_gateway::config::{LlmConfig, LlmProvider};

/// Main configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub system: SystemConfig,
    pub manager: ManagerConfig,
    pub reporter: ReporterConfig,
    pub expert: ExpertConfig,
    pub chunked: ChunkedIntentConfig,
    pub path_filter: PathFilterConfig,
}

/// Global runtime knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Workspace root the tools read from (the checked-out head).
    pub workspace_root: PathBuf,
    /// Directory holding persisted assets (repo map etc.).
    pub assets_dir: PathBuf,
    /// Directory the prompt templates are loaded from.
    pub prompts_dir: PathBuf,
    /// Directory intermediate artifacts are serialized into.
    pub artifacts_dir: PathBuf,
    /// Asset key for repository-specific assets.
    pub asset_key: Option<String>,
    /// Global wall-clock deadline for the whole pipeline.
    pub timeout_seconds: u64,
    /// Shared LLM semaphore size across all stages.
    pub max_concurrent_llm_requests: usize,
    /// Per-expert round cap (circuit breaker).
    pub max_expert_rounds: usize,
    /// Per-expert tool-call cap; 0 disables tools entirely.
    pub max_expert_tool_calls: usize,
    /// Chunked intent activates when the changed-file count exceeds this.
    pub chunked_file_count_threshold: usize,
    /// ... or when the aggregate diff size (chars) exceeds this.
    pub chunked_total_diff_chars_threshold: usize,
    /// Character cap applied to whole-file content in intent prompts.
    pub max_file_content_chars: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            assets_dir: PathBuf::from("assets_cache"),
            prompts_dir: PathBuf::from("prompts"),
            artifacts_dir: PathBuf::from("review_artifacts"),
            asset_key: None,
            timeout_seconds: 600,
            max_concurrent_llm_requests: 5,
            max_expert_rounds: 20,
            max_expert_tool_calls: 6,
            chunked_file_count_threshold: 50,
            chunked_total_diff_chars_threshold: 300_000,
            max_file_content_chars: 48_000,
        }
    }
}

/// Deterministic reduce-stage knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Anchor window `W`: keep items whose `[start-W, end+W]` touches a
    /// changed line.
    pub anchor_window: u32,
    /// Drop unanchored items entirely instead of capping confidence.
    pub drop_unanchored: bool,
    /// Confidence cap applied to kept unanchored items.
    pub unanchored_confidence: f32,
    pub max_work_items_total: usize,
    pub max_items_per_file: usize,
    /// Optional per-type caps; absent types are uncapped.
    pub max_items_per_risk_type: BTreeMap<RiskType, usize>,
    /// Type weights; falls back to `RiskType::default_weight`.
    pub risk_type_weights: BTreeMap<RiskType, f32>,
    /// Severity weights keyed by `error`/`warning`/`info`.
    pub severity_weights: BTreeMap<String, f32>,
    pub merge_line_window: u32,
    pub merge_jaccard: f32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let mut severity_weights = BTreeMap::new();
        severity_weights.insert("error".to_string(), 1.3);
        severity_weights.insert("warning".to_string(), 1.0);
        severity_weights.insert("info".to_string(), 0.7);
        Self {
            anchor_window: 5,
            drop_unanchored: true,
            unanchored_confidence: 0.2,
            max_work_items_total: 30,
            max_items_per_file: 6,
            max_items_per_risk_type: BTreeMap::new(),
            risk_type_weights: BTreeMap::new(),
            severity_weights,
            merge_line_window: 5,
            merge_jaccard: 0.75,
        }
    }
}

impl ManagerConfig {
    pub fn type_weight(&self, rt: RiskType) -> f32 {
        self.risk_type_weights
            .get(&rt)
            .copied()
            .unwrap_or_else(|| rt.default_weight())
    }

    pub fn severity_weight(&self, severity: crate::state::Severity) -> f32 {
        self.severity_weights
            .get(severity.as_str())
            .copied()
            .unwrap_or(1.0)
    }
}

/// Reporter thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    pub confidence_threshold: f32,
    pub confidence_threshold_by_risk_type: BTreeMap<RiskType, f32>,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            confidence_threshold_by_risk_type: BTreeMap::new(),
        }
    }
}

impl ReporterConfig {
    pub fn threshold_for(&self, rt: RiskType) -> f32 {
        self.confidence_threshold_by_risk_type
            .get(&rt)
            .copied()
            .unwrap_or(self.confidence_threshold)
    }
}

/// Expert-runtime budgets beyond the round/tool caps in [`SystemConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpertConfig {
    /// Trailing messages kept when shrinking history.
    pub max_history_messages: usize,
    /// Hard character budget for a shrunken history.
    pub max_total_chars: usize,
    /// Per-message cap for tool results.
    pub max_tool_chars: usize,
    /// Per-message cap for assistant contents.
    pub max_ai_chars: usize,
    /// Cap for the diff excerpt embedded in the system message.
    pub max_diff_chars: usize,
    /// Total cap for the evidence digest (3000 chars per entry).
    pub max_digest_chars: usize,
    /// No-signal streak that triggers the tool-budget stop.
    pub max_consecutive_no_signal_tools: usize,
    /// Trailing window the streak is counted in.
    pub no_signal_window: usize,
    /// Lines of file context included around the anchor (±).
    pub context_window_lines: u32,
}

impl Default for ExpertConfig {
    fn default() -> Self {
        Self {
            max_history_messages: 16,
            max_total_chars: 80_000,
            max_tool_chars: 6_000,
            max_ai_chars: 12_000,
            max_diff_chars: 12_000,
            max_digest_chars: 16_000,
            max_consecutive_no_signal_tools: 5,
            no_signal_window: 10,
            context_window_lines: 200,
        }
    }
}

/// Degraded-mode (chunked intent) controls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkedIntentConfig {
    pub max_chunk_chars: usize,
    pub max_file_diff_chars: usize,
    pub topk_ratio: f32,
    pub topk_min: usize,
    pub topk_max: usize,
    /// Below this many chunks, Top-K pruning is skipped entirely.
    pub topk_disable_below: usize,
    /// Stage budget as a fraction of the global deadline.
    pub budget_ratio: f32,
    pub soft_margin_seconds: u64,
    /// 0 disables the sentinel chunk; otherwise one deterministic extra
    /// chunk is pulled from the skipped tail.
    pub sentinel_sample: usize,
    /// Deterministic index seed for the sentinel pick.
    pub sentinel_seed: usize,
}

impl Default for ChunkedIntentConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 30_000,
            max_file_diff_chars: 24_000,
            topk_ratio: 0.3,
            topk_min: 4,
            topk_max: 10,
            topk_disable_below: 4,
            budget_ratio: 0.25,
            soft_margin_seconds: 60,
            sentinel_sample: 0,
            sentinel_seed: 1,
        }
    }
}

/// Changed-file path filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathFilterConfig {
    pub enabled: bool,
    /// Globs that always keep a path, overriding every exclude.
    pub include_globs: Vec<String>,
    /// Extra excludes on top of the built-in list.
    pub exclude_globs: Vec<String>,
}

impl Default for PathFilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            include_globs: Vec::new(),
            exclude_globs: Vec::new(),
        }
    }
}

impl Config {
    /// Load from an optional JSON file, then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut cfg = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(ConfigError::NotFound(p.display().to_string()));
                }
                let raw = std::fs::read_to_string(p)?;
                serde_json::from_str(&raw)?
            }
            None => Config::default(),
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Environment overrides; unset or malformed values leave the current
    /// setting in place (malformed numerics are reported).
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("LLM_MODEL") {
            if !v.trim().is_empty() {
                self.llm.model = v;
            }
        }
        if let Ok(v) = std::env::var("LLM_BASE_URL") {
            if !v.trim().is_empty() {
                self.llm.base_url = v;
            }
        }
        if let Ok(v) = std::env::var("LLM_API_KEY") {
            if !v.trim().is_empty() {
                self.llm.api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("LLM_TEMPERATURE") {
            if let Ok(t) = v.trim().parse() {
                self.llm.temperature = Some(t);
            }
        }
        if let Ok(v) = std::env::var("WORKSPACE_ROOT") {
            if !v.trim().is_empty() {
                self.system.workspace_root = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("ASSETS_DIR") {
            if !v.trim().is_empty() {
                self.system.assets_dir = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("TIMEOUT_SECONDS") {
            if let Ok(n) = v.trim().parse() {
                self.system.timeout_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("MAX_CONCURRENT_LLM_REQUESTS") {
            if let Ok(n) = v.trim().parse() {
                self.system.max_concurrent_llm_requests = n;
            }
        }
        if let Ok(v) = std::env::var("MAX_EXPERT_ROUNDS") {
            if let Ok(n) = v.trim().parse() {
                self.system.max_expert_rounds = n;
            }
        }
        if let Ok(v) = std::env::var("MAX_EXPERT_TOOL_CALLS") {
            if let Ok(n) = v.trim().parse() {
                self.system.max_expert_tool_calls = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.system.max_concurrent_llm_requests == 0 {
            return Err(ConfigError::InvalidValue {
                field: "system.max_concurrent_llm_requests",
                reason: "must be at least 1".into(),
            });
        }
        if self.system.max_expert_rounds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "system.max_expert_rounds",
                reason: "must be at least 1".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.reporter.confidence_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "reporter.confidence_threshold",
                reason: "expected 0.0..=1.0".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.manager.merge_jaccard) {
            return Err(ConfigError::InvalidValue {
                field: "manager.merge_jaccard",
                reason: "expected 0.0..=1.0".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_documented_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.system.timeout_seconds, 600);
        assert_eq!(cfg.system.max_concurrent_llm_requests, 5);
        assert_eq!(cfg.system.max_expert_rounds, 20);
        assert_eq!(cfg.system.max_expert_tool_calls, 6);
        assert_eq!(cfg.manager.anchor_window, 5);
        assert!(cfg.manager.drop_unanchored);
        assert_eq!(cfg.manager.max_work_items_total, 30);
        assert_eq!(cfg.manager.max_items_per_file, 6);
        assert_eq!(cfg.reporter.confidence_threshold, 0.6);
        assert_eq!(cfg.chunked.max_chunk_chars, 30_000);
        assert_eq!(cfg.chunked.topk_min, 4);
        assert_eq!(cfg.chunked.topk_max, 10);
        assert!(cfg.path_filter.enabled);
    }

    #[test]
    fn type_weight_falls_back_to_builtin_table() {
        let cfg = ManagerConfig::default();
        assert_eq!(cfg.type_weight(RiskType::SyntaxStaticErrors), 1.4);
        assert_eq!(cfg.type_weight(RiskType::RobustnessBoundaryConditions), 0.7);

        let mut custom = ManagerConfig::default();
        custom
            .risk_type_weights
            .insert(RiskType::SyntaxStaticErrors, 2.0);
        assert_eq!(custom.type_weight(RiskType::SyntaxStaticErrors), 2.0);
    }

    #[test]
    fn threshold_prefers_per_type_entries() {
        let mut cfg = ReporterConfig::default();
        cfg.confidence_threshold_by_risk_type
            .insert(RiskType::SyntaxStaticErrors, 0.4);
        assert_eq!(cfg.threshold_for(RiskType::SyntaxStaticErrors), 0.4);
        assert_eq!(cfg.threshold_for(RiskType::IntentSemanticConsistency), 0.6);
    }

    #[test]
    fn validation_rejects_zero_concurrency() {
        let mut cfg = Config::default();
        cfg.system.max_concurrent_llm_requests = 0;
        assert!(cfg.validate().is_err());
    }
}
