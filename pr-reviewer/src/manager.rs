//! Manager (reduce stage). Fully deterministic, no LLM call.
//!
//! Pipeline: collect candidate risks (intent output + converted lint
//! errors) → anchor-filter against changed lines → merge near-duplicates
//! → budget with type/severity weights → partition by risk type for the
//! expert fan-out. Idempotent: feeding its own output back yields the
//! same result.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::config::ManagerConfig;
use crate::diff::{DiffIndex, normalize_path};
use crate::state::{
    FileAnalysis, LineRange, LintError, RiskItem, RiskType, Severity, sort_risk_items,
};

/// Lint-derived risks enter with this fixed confidence.
const LINT_CONFIDENCE: f32 = 0.8;

/// Manager output: the budgeted work list plus its per-type partition.
#[derive(Debug, Default)]
pub struct ManagerOutput {
    pub work_list: Vec<RiskItem>,
    pub expert_tasks: BTreeMap<RiskType, Vec<RiskItem>>,
    pub dropped_unanchored: usize,
    pub capped_unanchored: usize,
}

/// Runs the reduce stage.
pub fn run_manager(
    cfg: &ManagerConfig,
    diff: &DiffIndex,
    file_analyses: &[FileAnalysis],
    lint_errors: &[LintError],
) -> ManagerOutput {
    let mut raw_items: Vec<RiskItem> = file_analyses
        .iter()
        .flat_map(|fa| fa.potential_risks.iter().cloned())
        .collect();

    let lint_items = convert_lint_errors(lint_errors);
    if !lint_items.is_empty() {
        debug!(count = lint_items.len(), "stage2: adding lint-derived tasks");
        raw_items.extend(lint_items);
    }

    let (anchored, dropped, capped) = anchor_filter(cfg, diff, raw_items);
    if dropped > 0 || capped > 0 {
        debug!(
            dropped,
            capped,
            window = cfg.anchor_window,
            "stage2: anchor filter applied"
        );
    }

    let merged = merge_near_duplicates(anchored, cfg.merge_line_window, cfg.merge_jaccard);
    let mut work_list = budget_work_items(cfg, merged);
    sort_risk_items(&mut work_list);

    let expert_tasks = group_by_risk_type(&work_list);
    info!(
        tasks = work_list.len(),
        groups = expert_tasks.len(),
        "stage2: manager done"
    );

    ManagerOutput {
        work_list,
        expert_tasks,
        dropped_unanchored: dropped,
        capped_unanchored: capped,
    }
}

/// Converts linter findings into evidence-based syntax risks.
pub fn convert_lint_errors(lint_errors: &[LintError]) -> Vec<RiskItem> {
    lint_errors
        .iter()
        .map(|e| {
            let description = if e.code.trim().is_empty() {
                e.message.clone()
            } else {
                format!("[{}] {}", e.code, e.message)
            };
            RiskItem {
                risk_type: RiskType::SyntaxStaticErrors,
                file_path: e.file.clone(),
                line_number: LineRange::single(e.line),
                description,
                confidence: LINT_CONFIDENCE,
                severity: e.severity,
                suggestion: None,
            }
        })
        .collect()
}

/// Keeps items whose padded range touches a changed line; the rest are
/// dropped or confidence-capped per config. Syntax/static errors bypass
/// the filter — they are already evidence-based.
fn anchor_filter(
    cfg: &ManagerConfig,
    diff: &DiffIndex,
    items: Vec<RiskItem>,
) -> (Vec<RiskItem>, usize, usize) {
    let mut kept = Vec::with_capacity(items.len());
    let mut dropped = 0usize;
    let mut capped = 0usize;

    for it in items {
        if it.risk_type == RiskType::SyntaxStaticErrors {
            kept.push(it);
            continue;
        }

        let changed = diff.changed_lines(&normalize_path(&it.file_path));
        if is_anchored(&changed, it.line_number, cfg.anchor_window) {
            kept.push(it);
            continue;
        }

        if cfg.drop_unanchored {
            dropped += 1;
            continue;
        }

        capped += 1;
        kept.push(RiskItem {
            confidence: it.confidence.min(cfg.unanchored_confidence),
            suggestion: None,
            ..it
        });
    }
    (kept, dropped, capped)
}

/// True when any changed line falls within `[start-window, end+window]`.
fn is_anchored(changed_sorted: &[u32], range: LineRange, window: u32) -> bool {
    if changed_sorted.is_empty() {
        return false;
    }
    let lo = range.start.saturating_sub(window).max(1);
    let hi = range.end.saturating_add(window);
    let idx = changed_sorted.partition_point(|&l| l < lo);
    idx < changed_sorted.len() && changed_sorted[idx] <= hi
}

fn tokenize(s: &str) -> std::collections::BTreeSet<String> {
    s.to_lowercase()
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn jaccard(a: &std::collections::BTreeSet<String>, b: &std::collections::BTreeSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        inter as f32 / union as f32
    }
}

/// Merges near-duplicates within `(file_path, risk_type)`: close line
/// ranges plus token-Jaccard similarity above the threshold. The merged
/// item spans the union range, takes the max confidence and the stronger
/// severity, and joins descriptions with blank lines. Suggestions are
/// cleared — the expert re-emits them.
pub fn merge_near_duplicates(
    items: Vec<RiskItem>,
    line_window: u32,
    jaccard_threshold: f32,
) -> Vec<RiskItem> {
    if items.is_empty() {
        return Vec::new();
    }

    let mut by_key: BTreeMap<(String, RiskType), Vec<RiskItem>> = BTreeMap::new();
    for it in items {
        by_key
            .entry((it.file_path.clone(), it.risk_type))
            .or_default()
            .push(it);
    }

    let mut merged = Vec::new();
    for (_, mut group) in by_key {
        group.sort_by(|a, b| {
            (a.line_number.start, a.line_number.end)
                .cmp(&(b.line_number.start, b.line_number.end))
                .then(b.confidence.total_cmp(&a.confidence))
        });

        let mut cur: Option<RiskItem> = None;
        let mut cur_descs: Vec<String> = Vec::new();
        for it in group {
            let Some(prev) = cur.take() else {
                cur_descs = vec![it.description.clone()];
                cur = Some(it);
                continue;
            };

            let near = it.line_number.start.abs_diff(prev.line_number.end) <= line_window;
            let sim = jaccard(&tokenize(&prev.description), &tokenize(&it.description));
            if near && sim >= jaccard_threshold {
                cur_descs.push(it.description.clone());
                cur = Some(RiskItem {
                    risk_type: prev.risk_type,
                    file_path: prev.file_path,
                    line_number: prev.line_number.merge(it.line_number),
                    description: cur_descs.join("\n\n"),
                    confidence: prev.confidence.max(it.confidence),
                    severity: prev.severity.max(it.severity),
                    suggestion: None,
                });
            } else {
                merged.push(prev);
                cur_descs = vec![it.description.clone()];
                cur = Some(it);
            }
        }
        if let Some(last) = cur {
            merged.push(last);
        }
    }
    merged
}

/// Greedy budget pass over items sorted by weighted score.
fn budget_work_items(cfg: &ManagerConfig, items: Vec<RiskItem>) -> Vec<RiskItem> {
    if items.is_empty() {
        return Vec::new();
    }

    let score = |it: &RiskItem| -> f32 {
        it.confidence.clamp(0.0, 1.0) * cfg.type_weight(it.risk_type) * cfg.severity_weight(it.severity)
    };

    let mut scored = items;
    scored.sort_by(|a, b| {
        score(b)
            .total_cmp(&score(a))
            .then(b.severity.rank().cmp(&a.severity.rank()))
            .then(a.file_path.cmp(&b.file_path))
            .then(a.line_number.start.cmp(&b.line_number.start))
    });

    let mut selected = Vec::new();
    let mut per_file: BTreeMap<String, usize> = BTreeMap::new();
    let mut per_type: BTreeMap<RiskType, usize> = BTreeMap::new();

    for it in scored {
        if selected.len() >= cfg.max_work_items_total {
            break;
        }
        let file_count = per_file.entry(it.file_path.clone()).or_insert(0);
        if *file_count >= cfg.max_items_per_file {
            continue;
        }
        if let Some(cap) = cfg.max_items_per_risk_type.get(&it.risk_type) {
            if per_type.get(&it.risk_type).copied().unwrap_or(0) >= *cap {
                continue;
            }
        }
        *file_count += 1;
        *per_type.entry(it.risk_type).or_insert(0) += 1;
        selected.push(it);
    }
    selected
}

/// Partition by risk type; empty groups are absent.
pub fn group_by_risk_type(work_list: &[RiskItem]) -> BTreeMap<RiskType, Vec<RiskItem>> {
    let mut grouped: BTreeMap<RiskType, Vec<RiskItem>> = BTreeMap::new();
    for it in work_list {
        grouped.entry(it.risk_type).or_default().push(it.clone());
    }
    grouped
}
