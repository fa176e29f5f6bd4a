//! Chunked intent analysis for oversized PRs (degraded map stage).
//!
//! Avoids per-file LLM calls by:
//! 1) scoring each changed file (churn, API surface, danger markers,
//!    file-type weight),
//! 2) grouping files by path depth 2,
//! 3) packing group members into size-bounded diff-only chunks,
//! 4) selecting Top-K chunks (all must-include chunks plus the
//!    highest-scoring remainder, optionally one deterministic sentinel),
//! 5) analyzing each selected chunk under a wall-clock budget that
//!    cancels outstanding work near the margin.

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use regex::Regex;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::diff::{DiffIndex, normalize_path};
use crate::intent::lenient_from_value;
use crate::json_text::extract_json_value;
use crate::prompts::{PromptRenderer, TemplateVars};
use crate::state::{Deadline, FileAnalysis, chunked_format_instructions, sort_file_analyses};
use llm_gateway::LlmGateway;
use llm_gateway::message::ChatMessage;

const CHUNKED_SYSTEM: &str = "You are an expert code reviewer analyzing PR diffs.";

static STRONG_DANGER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(eval|exec|token|secret|permission|acl|authorize|authorization|innerHTML|dangerouslySetInnerHTML)\b",
    )
    .unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

static DANGER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(auth|permission|acl|scope|role|token|secret|csrf|oauth|jwt|signature|sql|select\s|insert\s|update\s|delete\s|deserialize|pickle|subprocess|shell|cmd|async|await|promise|thread|lock|transaction|retry|queue|task|cron|cache|session|cookie|singleton|global)\b",
    )
    .unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

static API_DELTA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(export|public|def|class|interface|type|pub)\b")
        .unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

/// First two path segments; the whole path when shallower.
pub fn group_key_depth2(file_path: &str) -> String {
    let norm = normalize_path(file_path);
    let parts: Vec<&str> = norm.split('/').filter(|p| !p.is_empty()).collect();
    match parts.as_slice() {
        [] => String::new(),
        [one] => (*one).to_string(),
        [a, b, ..] => format!("{a}/{b}"),
    }
}

/// Type damping: tests and docs rarely deserve expert attention.
pub fn file_type_weight(file_path: &str) -> f32 {
    let p = normalize_path(file_path).to_ascii_lowercase();
    if p.contains("/test")
        || p.starts_with("tests/")
        || p.ends_with("_test.py")
        || p.ends_with("_test.go")
        || p.ends_with(".spec.ts")
        || p.ends_with(".spec.tsx")
    {
        return 0.4;
    }
    if p.ends_with(".md") || p.ends_with(".rst") || p.ends_with(".txt") {
        return 0.2;
    }
    if p.ends_with(".yml")
        || p.ends_with(".yaml")
        || p.ends_with(".json")
        || p.ends_with(".toml")
        || p.ends_with(".ini")
        || p.ends_with(".cfg")
    {
        return 0.6;
    }
    1.0
}

/// Count of added lines that touch public API surface, capped at 6.
fn public_api_delta(diff_text: &str) -> u32 {
    let mut hits = 0u32;
    for line in diff_text.lines() {
        let Some(rest) = line.strip_prefix('+') else {
            continue;
        };
        if API_DELTA_RE.is_match(rest) {
            hits += 1;
            if hits >= 6 {
                break;
            }
        }
    }
    hits
}

fn count_danger_hits(diff_text: &str) -> (u32, bool) {
    if diff_text.is_empty() {
        return (0, false);
    }
    let strong = STRONG_DANGER_RE.is_match(diff_text);
    let hits = DANGER_RE.find_iter(diff_text).count() as u32;
    (hits, strong)
}

/// One scored changed file.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub file_path: String,
    pub group_key: String,
    pub diff_text: String,
    pub changed_lines: u32,
    pub danger_hits: u32,
    pub strong_danger: bool,
    pub public_api_delta_hits: u32,
    pub type_weight: f32,
}

impl FileEntry {
    pub fn score(&self) -> f32 {
        let churn = ((self.changed_lines as f32) + 1.0).ln();
        let danger = self.danger_hits.min(6) as f32;
        let api = self.public_api_delta_hits.min(6) as f32;
        let mut base = 2.0 * churn + 0.6 * api + 0.9 * danger;
        if self.strong_danger {
            base += 4.0;
        }
        base * self.type_weight
    }
}

/// One packed diff chunk.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub chunk_id: String,
    pub group_key: String,
    pub files: Vec<String>,
    pub chunk_diff: String,
    pub changed_lines: u32,
    pub score: f32,
    pub must_include: bool,
}

/// Stage outcome, including the telemetry the driver folds into metadata.
#[derive(Debug, Default)]
pub struct ChunkedOutcome {
    pub analyses: Vec<FileAnalysis>,
    pub chunk_total: usize,
    pub selected: Vec<String>,
    pub skipped: Vec<String>,
    pub cancelled: usize,
}

pub fn build_file_entries(diff: &DiffIndex, changed_files: &[String]) -> Vec<FileEntry> {
    changed_files
        .iter()
        .map(|fp| {
            let changed_lines = diff.changed_lines(fp).len() as u32;
            let diff_text = diff.file_diff(fp).to_string();
            let (danger_hits, strong_danger) = count_danger_hits(&diff_text);
            let public_api_delta_hits = public_api_delta(&diff_text);
            FileEntry {
                group_key: group_key_depth2(fp),
                type_weight: file_type_weight(fp),
                file_path: fp.clone(),
                diff_text,
                changed_lines,
                danger_hits,
                strong_danger,
                public_api_delta_hits,
            }
        })
        .collect()
}

/// Packs group members into chunks under `max_chunk_chars`; one oversized
/// file becomes its own truncated chunk.
pub fn pack_chunks(entries: &[FileEntry], max_chunk_chars: usize, max_file_diff_chars: usize) -> Vec<Chunk> {
    let mut groups: std::collections::BTreeMap<String, Vec<&FileEntry>> =
        std::collections::BTreeMap::new();
    for e in entries {
        groups.entry(e.group_key.clone()).or_default().push(e);
    }

    let mut chunks = Vec::new();
    for (group_key, mut group_files) in groups {
        // Important files first, so a truncated chunk keeps the signal.
        group_files.sort_by(|a, b| {
            b.score()
                .total_cmp(&a.score())
                .then(b.changed_lines.cmp(&a.changed_lines))
                .then(a.file_path.cmp(&b.file_path))
        });

        let mut packer = ChunkPacker {
            group_key: &group_key,
            idx: 0,
            buf: Vec::new(),
            buf_texts: Vec::new(),
            buf_chars: 0,
        };

        for e in group_files {
            let mut raw = e.diff_text.clone();
            if max_file_diff_chars > 0 && raw.len() > max_file_diff_chars {
                raw.truncate(floor_char_boundary(&raw, max_file_diff_chars));
                raw.push_str("\n...[truncated]...");
            }
            let section = format!("=== FILE: {} ===\n{}\n", normalize_path(&e.file_path), raw);

            if packer.buf.is_empty() && section.len() > max_chunk_chars {
                let mut cut = section.clone();
                cut.truncate(floor_char_boundary(&cut, max_chunk_chars));
                cut.push_str("\n...[chunk-truncated]...");
                packer.buf.push(e);
                packer.buf_texts.push(cut);
                packer.flush(&mut chunks);
                continue;
            }

            if !packer.buf.is_empty() && packer.buf_chars + section.len() > max_chunk_chars {
                packer.flush(&mut chunks);
            }

            packer.buf_chars += section.len();
            packer.buf.push(e);
            packer.buf_texts.push(section);
        }
        packer.flush(&mut chunks);
    }

    chunks
}

/// Accumulator for one group's chunk packing.
struct ChunkPacker<'a> {
    group_key: &'a str,
    idx: usize,
    buf: Vec<&'a FileEntry>,
    buf_texts: Vec<String>,
    buf_chars: usize,
}

impl ChunkPacker<'_> {
    fn flush(&mut self, chunks: &mut Vec<Chunk>) {
        if self.buf.is_empty() {
            return;
        }
        self.idx += 1;
        let chunk_diff = self.buf_texts.join("\n").trim().to_string();
        chunks.push(Chunk {
            chunk_id: format!("{}:{}", self.group_key, self.idx),
            group_key: self.group_key.to_string(),
            files: self.buf.iter().map(|e| e.file_path.clone()).collect(),
            changed_lines: self.buf.iter().map(|e| e.changed_lines).sum(),
            score: self.buf.iter().map(|e| e.score()).sum(),
            must_include: self.buf.iter().any(|e| e.strong_danger),
            chunk_diff,
        });
        self.buf.clear();
        self.buf_texts.clear();
        self.buf_chars = 0;
    }
}

/// Top-K selection: all must-include chunks, then the best of the rest up
/// to `K = clamp(ceil(N * ratio), min, max)`. Below `topk_disable_below`
/// chunks no pruning happens. Returns `(selected, skipped)`.
pub fn select_topk(chunks: &[Chunk], cfg: &Config) -> (Vec<Chunk>, Vec<Chunk>) {
    if chunks.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let c = &cfg.chunked;

    let order = |a: &Chunk, b: &Chunk| {
        b.must_include
            .cmp(&a.must_include)
            .then(b.score.total_cmp(&a.score))
            .then(a.chunk_id.cmp(&b.chunk_id))
    };

    if c.topk_disable_below > 0 && chunks.len() < c.topk_disable_below {
        let mut all: Vec<Chunk> = chunks.to_vec();
        all.sort_by(order);
        return (all, Vec::new());
    }

    let n = chunks.len();
    let mut k = ((n as f32) * c.topk_ratio).ceil() as usize;
    k = k.max(c.topk_min);
    if c.topk_max > 0 {
        k = k.min(c.topk_max);
    }
    k = k.min(n);

    let mut selected: Vec<Chunk> = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();

    for ch in chunks.iter().filter(|c| c.must_include) {
        if seen.insert(ch.chunk_id.clone()) {
            selected.push(ch.clone());
        }
    }

    let mut rest: Vec<&Chunk> = chunks.iter().filter(|c| !c.must_include).collect();
    rest.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(b.changed_lines.cmp(&a.changed_lines))
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
    for ch in rest {
        if selected.len() >= k {
            break;
        }
        if seen.insert(ch.chunk_id.clone()) {
            selected.push(ch.clone());
        }
    }

    let mut remaining: Vec<Chunk> = chunks
        .iter()
        .filter(|c| !seen.contains(&c.chunk_id))
        .cloned()
        .collect();

    if c.sentinel_sample > 0 && !remaining.is_empty() {
        let pick = remaining.remove(c.sentinel_seed % remaining.len());
        seen.insert(pick.chunk_id.clone());
        selected.push(pick);
    }

    selected.sort_by(order);
    remaining.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.chunk_id.cmp(&b.chunk_id)));
    (selected, remaining)
}

/// Parses `{"file_analyses": [...]}` with per-entry lenient recovery;
/// entries without a `file_path` are dropped.
pub fn parse_chunk_response(text: &str) -> Vec<FileAnalysis> {
    let Some(value) = extract_json_value(text) else {
        return Vec::new();
    };
    let Some(items) = value.get("file_analyses").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for item in items {
        if let Ok(fa) = serde_json::from_value::<FileAnalysis>(item.clone()) {
            out.push(fa);
            continue;
        }
        let Some(fp) = item.get("file_path").and_then(|v| v.as_str()) else {
            continue;
        };
        out.push(lenient_from_value(item, fp, text));
    }
    out
}

/// Runs the degraded map stage end to end.
pub async fn analyze_intent_chunked(
    gateway: &LlmGateway,
    prompts: &PromptRenderer,
    cfg: &Config,
    diff: &DiffIndex,
    changed_files: &[String],
    deadline: Deadline,
    semaphore: Arc<Semaphore>,
) -> ChunkedOutcome {
    if changed_files.is_empty() {
        warn!("stage1b: no changed files");
        return ChunkedOutcome::default();
    }

    let entries = build_file_entries(diff, changed_files);
    let chunks = pack_chunks(
        &entries,
        cfg.chunked.max_chunk_chars,
        cfg.chunked.max_file_diff_chars,
    );
    let (selected, skipped) = select_topk(&chunks, cfg);

    let budget = Duration::from_secs_f64(
        (deadline.total().as_secs_f64() * cfg.chunked.budget_ratio as f64).max(30.0),
    );
    let soft_margin = Duration::from_secs(cfg.chunked.soft_margin_seconds);

    info!(
        chunks = chunks.len(),
        selected = selected.len(),
        skipped = skipped.len(),
        budget_s = budget.as_secs(),
        "stage1b: chunked intent start"
    );

    let mut pending: FuturesUnordered<_> = selected
        .iter()
        .map(|chunk| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = match semaphore.acquire().await {
                    Ok(p) => p,
                    Err(_) => return Vec::new(),
                };
                if deadline.elapsed() >= budget {
                    return Vec::new();
                }
                analyze_chunk(gateway, prompts, chunk).await
            }
        })
        .collect();

    let mut analyses: Vec<FileAnalysis> = Vec::new();
    let mut cancelled = 0usize;

    while !pending.is_empty() {
        let remaining = budget.saturating_sub(deadline.elapsed());
        if remaining <= soft_margin {
            cancelled = pending.len();
            debug!(cancelled, "stage1b: budget margin reached, cancelling outstanding chunks");
            break;
        }
        let tick = remaining.min(Duration::from_secs(1));
        match tokio::time::timeout(tick, pending.next()).await {
            Ok(Some(batch)) => analyses.extend(batch),
            Ok(None) => break,
            Err(_) => continue,
        }
    }
    drop(pending);

    sort_file_analyses(&mut analyses);
    info!(
        analyses = analyses.len(),
        cancelled, "stage1b: chunked intent done"
    );

    ChunkedOutcome {
        analyses,
        chunk_total: chunks.len(),
        selected: selected.iter().map(|c| c.chunk_id.clone()).collect(),
        skipped: skipped.iter().map(|c| c.chunk_id.clone()).collect(),
        cancelled,
    }
}

async fn analyze_chunk(gateway: &LlmGateway, prompts: &PromptRenderer, chunk: &Chunk) -> Vec<FileAnalysis> {
    let files_list = chunk
        .files
        .iter()
        .map(|f| format!("- {f}"))
        .collect::<Vec<_>>()
        .join("\n");

    let mut vars = TemplateVars::new();
    vars.insert("chunk_id", chunk.chunk_id.clone());
    vars.insert("group_key", chunk.group_key.clone());
    vars.insert("files_list", files_list);
    vars.insert("chunk_diff", chunk.chunk_diff.clone());

    let rendered = match prompts.render("intent_analysis_chunked", &vars) {
        Ok(r) => r,
        Err(e) => {
            warn!(chunk = %chunk.chunk_id, error = %e, "stage1b: template render failed");
            return Vec::new();
        }
    };

    let messages = [
        ChatMessage::system(CHUNKED_SYSTEM),
        ChatMessage::user(format!("{rendered}\n\n{}", chunked_format_instructions())),
    ];

    let text = match gateway.invoke(&messages, None).await {
        Ok(msg) => msg.content,
        Err(e) => {
            warn!(chunk = %chunk.chunk_id, error = %e, "stage1b: chunk llm call failed");
            return Vec::new();
        }
    };

    let declared: BTreeSet<String> = chunk.files.iter().map(|f| normalize_path(f)).collect();
    parse_chunk_response(&text)
        .into_iter()
        .filter(|fa| {
            let keep = declared.contains(&normalize_path(&fa.file_path));
            if !keep {
                warn!(
                    chunk = %chunk.chunk_id,
                    file = %fa.file_path,
                    "stage1b: dropping analysis for undeclared file"
                );
            }
            keep
        })
        .collect()
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
