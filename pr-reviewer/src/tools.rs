//! Tool surface bound to a workspace root.
//!
//! A small typed toolbox the expert runtime exposes to the model:
//! `read_file_snippet`, `run_grep`, and `fetch_repo_map`. Tools are
//! read-only with respect to the workspace, never touch run state, and
//! always answer — failures are reported through the mandatory `error`
//! field of the serialized result, not as Rust errors.

use std::path::{Component, Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::assets::{AssetStore, RepoMapAsset};
use llm_gateway::message::{ToolCall, ToolSpec};

/// Files larger than this are skipped by grep.
const MAX_GREP_FILE_BYTES: u64 = 1_000_000;
/// Preview length of the repo-map file list.
const REPO_MAP_FILES_PREVIEW: usize = 50;

/// Toolbox bound to one workspace checkout.
#[derive(Debug)]
pub struct WorkspaceTools {
    root: PathBuf,
    assets: AssetStore,
    asset_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnippetArgs {
    path: String,
    #[serde(default = "default_start")]
    start_line: u32,
    #[serde(default)]
    end_line: Option<u32>,
    #[serde(default = "default_max_lines")]
    max_lines: usize,
}

fn default_start() -> u32 {
    1
}

fn default_max_lines() -> usize {
    120
}

#[derive(Debug, Serialize)]
struct SnippetResult {
    content: String,
    file_path: String,
    start_line: u32,
    end_line: u32,
    line_count: usize,
    truncated: bool,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GrepArgs {
    pattern: String,
    #[serde(default)]
    is_regex: bool,
    #[serde(default = "default_true")]
    case_sensitive: bool,
    #[serde(default)]
    include_patterns: Vec<String>,
    #[serde(default)]
    exclude_patterns: Vec<String>,
    #[serde(default = "default_context")]
    context_lines: usize,
    #[serde(default = "default_max_results")]
    max_results: usize,
}

fn default_true() -> bool {
    true
}

fn default_context() -> usize {
    10
}

fn default_max_results() -> usize {
    50
}

#[derive(Debug, Serialize)]
struct GrepMatch {
    file: String,
    line: u32,
    text: String,
    context: String,
}

#[derive(Debug, Serialize)]
struct GrepResult {
    matches: Vec<GrepMatch>,
    total: usize,
    truncated: bool,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct RepoMapResult {
    summary: String,
    file_count: usize,
    files: Vec<String>,
    error: Option<String>,
}

impl WorkspaceTools {
    pub fn new(root: impl Into<PathBuf>, assets: AssetStore, asset_key: Option<String>) -> Self {
        Self {
            root: root.into(),
            assets,
            asset_key,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Declarations for gateway binding.
    pub fn specs(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: "read_file_snippet".into(),
                description: "Read a line range from a workspace file with absolute line numbers. \
                              Use max_lines to control the output budget."
                    .into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "Repo-relative file path"},
                        "start_line": {"type": "integer", "minimum": 1, "default": 1},
                        "end_line": {"type": "integer", "minimum": 1},
                        "max_lines": {"type": "integer", "minimum": 1, "default": 120}
                    },
                    "required": ["path"]
                }),
            },
            ToolSpec {
                name: "run_grep".into(),
                description: "Search the workspace for a string or regex. Supports include/exclude \
                              glob lists, context lines, and a max_results cap."
                    .into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "pattern": {"type": "string"},
                        "is_regex": {"type": "boolean", "default": false},
                        "case_sensitive": {"type": "boolean", "default": true},
                        "include_patterns": {"type": "array", "items": {"type": "string"}},
                        "exclude_patterns": {"type": "array", "items": {"type": "string"}},
                        "context_lines": {"type": "integer", "default": 10},
                        "max_results": {"type": "integer", "default": 50}
                    },
                    "required": ["pattern"]
                }),
            },
            ToolSpec {
                name: "fetch_repo_map".into(),
                description: "Fetch the pre-built repository structure summary (tree plus a prefix \
                              of the file list)."
                    .into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {}
                }),
            },
        ]
    }

    /// Executes one normalized tool call; the returned string is the tool
    /// message content (always valid JSON with an `error` field).
    pub fn execute(&self, call: &ToolCall) -> String {
        debug!(tool = %call.name, "tools: execute");
        match call.name.as_str() {
            "read_file_snippet" => match serde_json::from_value::<SnippetArgs>(call.args.clone()) {
                Ok(args) => to_json(&self.read_file_snippet(args)),
                Err(e) => error_payload(format!("Error invoking tool: bad arguments: {e}")),
            },
            "run_grep" => match serde_json::from_value::<GrepArgs>(call.args.clone()) {
                Ok(args) => to_json(&self.run_grep(args)),
                Err(e) => error_payload(format!("Error invoking tool: bad arguments: {e}")),
            },
            "fetch_repo_map" => to_json(&self.fetch_repo_map()),
            other => error_payload(format!("Error invoking tool: unknown tool `{other}`")),
        }
    }

    fn read_file_snippet(&self, args: SnippetArgs) -> SnippetResult {
        let empty = |error: String| SnippetResult {
            content: String::new(),
            file_path: args.path.clone(),
            start_line: args.start_line,
            end_line: args.end_line.unwrap_or(args.start_line),
            line_count: 0,
            truncated: false,
            error: Some(error),
        };

        let Some(path) = self.resolve(&args.path) else {
            return empty(format!("path escapes the workspace: {}", args.path));
        };
        if !path.is_file() {
            return empty(format!("File not found: {}", args.path));
        }
        let raw = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) => return empty(format!("Error reading file: {e}")),
        };

        let lines: Vec<&str> = raw.lines().collect();
        let line_count = lines.len();
        let start = args.start_line.max(1) as usize;
        let end = args
            .end_line
            .map(|e| e as usize)
            .unwrap_or(line_count)
            .min(line_count);
        if start > line_count || end < start {
            return SnippetResult {
                content: String::new(),
                file_path: args.path,
                start_line: start as u32,
                end_line: end as u32,
                line_count,
                truncated: false,
                error: Some(format!(
                    "requested range {start}:{end} outside file of {line_count} lines"
                )),
            };
        }

        let max_lines = args.max_lines.max(1);
        let wanted = end - start + 1;
        let taken = wanted.min(max_lines);
        let truncated = taken < wanted;

        let mut content = String::new();
        for (offset, text) in lines[start - 1..start - 1 + taken].iter().enumerate() {
            content.push_str(&format!("{}: {}\n", start + offset, text));
        }
        if truncated {
            content.push_str(&format!("... ({} more lines)\n", wanted - taken));
        }

        SnippetResult {
            content,
            file_path: args.path,
            start_line: start as u32,
            end_line: (start + taken - 1) as u32,
            line_count,
            truncated,
            error: None,
        }
    }

    fn run_grep(&self, args: GrepArgs) -> GrepResult {
        let empty = |error: String| GrepResult {
            matches: Vec::new(),
            total: 0,
            truncated: false,
            error: Some(error),
        };

        if args.pattern.trim().is_empty() {
            return empty("empty pattern".into());
        }

        let pattern = if args.is_regex {
            args.pattern.clone()
        } else {
            regex::escape(&args.pattern)
        };
        let re = match RegexBuilder::new(&pattern)
            .case_insensitive(!args.case_sensitive)
            .build()
        {
            Ok(re) => re,
            Err(e) => return empty(format!("invalid pattern: {e}")),
        };

        let include = build_globset(&args.include_patterns);
        let exclude = build_globset(&args.exclude_patterns);
        let max_results = args.max_results.max(1);

        let mut matches = Vec::new();
        let mut total = 0usize;
        let mut truncated = false;

        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                if e.depth() == 0 {
                    return true;
                }
                let name = e.file_name().to_string_lossy();
                !(name.starts_with('.')
                    || name == "node_modules"
                    || name == "target"
                    || name == "__pycache__")
            });

        'files: for entry in walker.filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let rel_str = rel.to_string_lossy().replace('\\', "/");

            if let Some(inc) = &include {
                if !inc.is_match(&rel_str) {
                    continue;
                }
            }
            if let Some(exc) = &exclude {
                if exc.is_match(&rel_str) {
                    continue;
                }
            }
            if entry.metadata().map(|m| m.len()).unwrap_or(u64::MAX) > MAX_GREP_FILE_BYTES {
                continue;
            }
            let Ok(raw) = std::fs::read_to_string(entry.path()) else {
                continue; // binary or unreadable
            };

            let lines: Vec<&str> = raw.lines().collect();
            for (i, text) in lines.iter().enumerate() {
                if !re.is_match(text) {
                    continue;
                }
                total += 1;
                if matches.len() >= max_results {
                    truncated = true;
                    continue 'files;
                }
                let lo = i.saturating_sub(args.context_lines);
                let hi = (i + args.context_lines).min(lines.len().saturating_sub(1));
                let context = lines[lo..=hi]
                    .iter()
                    .enumerate()
                    .map(|(off, l)| format!("{}: {}", lo + off + 1, l))
                    .collect::<Vec<_>>()
                    .join("\n");
                matches.push(GrepMatch {
                    file: rel_str.clone(),
                    line: (i + 1) as u32,
                    text: text.to_string(),
                    context,
                });
            }
        }

        GrepResult {
            matches,
            total,
            truncated,
            error: None,
        }
    }

    fn fetch_repo_map(&self) -> RepoMapResult {
        let key = self.asset_key.as_deref().unwrap_or("repo_map");
        let Some(raw) = self.assets.load("assets", key) else {
            return RepoMapResult {
                summary: String::new(),
                file_count: 0,
                files: Vec::new(),
                error: Some("Repository map not found in storage".into()),
            };
        };
        let map: RepoMapAsset = match serde_json::from_value(raw) {
            Ok(m) => m,
            Err(e) => {
                return RepoMapResult {
                    summary: String::new(),
                    file_count: 0,
                    files: Vec::new(),
                    error: Some(format!("Malformed repository map asset: {e}")),
                };
            }
        };

        let preview: Vec<String> = map.files.iter().take(REPO_MAP_FILES_PREVIEW).cloned().collect();
        let mut listing = preview
            .iter()
            .map(|f| format!("  - {f}"))
            .collect::<Vec<_>>()
            .join("\n");
        if map.files.len() > REPO_MAP_FILES_PREVIEW {
            listing.push_str(&format!(
                "\n  ... and {} more files",
                map.files.len() - REPO_MAP_FILES_PREVIEW
            ));
        }
        let summary = format!(
            "Repository Structure Summary:\nSource Path: {}\nTotal Files: {}\n\nFile Tree:\n{}\n\nKey Files (first {}):\n{}\n",
            map.source_path,
            map.file_count,
            map.file_tree,
            REPO_MAP_FILES_PREVIEW,
            listing
        );

        RepoMapResult {
            summary,
            file_count: map.file_count,
            files: preview,
            error: None,
        }
    }

    /// Reads whole file content from the workspace (intent stage helper);
    /// empty string when missing or unreadable.
    pub fn read_file_content(&self, path: &str) -> String {
        let Some(resolved) = self.resolve(path) else {
            return String::new();
        };
        std::fs::read_to_string(resolved).unwrap_or_default()
    }

    /// Line count of a workspace file; `None` when unreadable.
    pub fn file_line_count(&self, path: &str) -> Option<u32> {
        let resolved = self.resolve(path)?;
        let raw = std::fs::read_to_string(resolved).ok()?;
        Some(raw.lines().count() as u32)
    }

    /// Resolves a repo-relative path, rejecting traversal outside the root.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let rel = Path::new(path.trim());
        if rel.is_absolute() {
            return None;
        }
        for comp in rel.components() {
            match comp {
                Component::Normal(_) | Component::CurDir => {}
                _ => return None,
            }
        }
        Some(self.root.join(rel))
    }
}

fn build_globset(patterns: &[String]) -> Option<GlobSet> {
    if patterns.is_empty() {
        return None;
    }
    let mut builder = GlobSetBuilder::new();
    let mut any = false;
    for p in patterns {
        if let Ok(g) = Glob::new(p.trim()) {
            builder.add(g);
            any = true;
        }
    }
    if !any {
        return None;
    }
    builder.build().ok()
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| error_payload(format!("serialize error: {e}")))
}

fn error_payload(message: String) -> String {
    serde_json::json!({ "error": message }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toolbox(dir: &Path) -> WorkspaceTools {
        WorkspaceTools::new(dir, AssetStore::new(dir.join(".assets")), None)
    }

    fn call(name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "call-0".into(),
            name: name.into(),
            args,
        }
    }

    #[test]
    fn snippet_caps_by_max_lines_and_numbers_absolutely() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "l1\nl2\nl3\nl4\nl5\n").unwrap();
        let tools = toolbox(dir.path());

        let out = tools.execute(&call(
            "read_file_snippet",
            serde_json::json!({"path": "a.txt", "start_line": 2, "end_line": 5, "max_lines": 2}),
        ));
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert!(v["error"].is_null());
        assert_eq!(v["truncated"], true);
        let content = v["content"].as_str().unwrap();
        assert!(content.starts_with("2: l2\n3: l3\n"));
        assert!(content.contains("2 more lines"));
    }

    #[test]
    fn snippet_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let tools = toolbox(dir.path());
        let out = tools.execute(&call(
            "read_file_snippet",
            serde_json::json!({"path": "../outside.txt"}),
        ));
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert!(v["error"].as_str().unwrap().contains("escapes"));
    }

    #[test]
    fn grep_caps_results_and_reports_total() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("x.rs"),
            "needle\nnope\nneedle\nneedle\n",
        )
        .unwrap();
        let tools = toolbox(dir.path());
        let out = tools.execute(&call(
            "run_grep",
            serde_json::json!({"pattern": "needle", "max_results": 2, "context_lines": 0}),
        ));
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["matches"].as_array().unwrap().len(), 2);
        assert_eq!(v["total"], 3);
        assert_eq!(v["truncated"], true);
    }

    #[test]
    fn grep_literal_mode_escapes_regex_metacharacters() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.py"), "eval(input())\nevalx\n").unwrap();
        let tools = toolbox(dir.path());
        let out = tools.execute(&call(
            "run_grep",
            serde_json::json!({"pattern": "eval(", "is_regex": false}),
        ));
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert!(v["error"].is_null());
        assert_eq!(v["total"], 1);
    }

    #[test]
    fn grep_respects_include_globs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "token\n").unwrap();
        std::fs::write(dir.path().join("b.md"), "token\n").unwrap();
        let tools = toolbox(dir.path());
        let out = tools.execute(&call(
            "run_grep",
            serde_json::json!({"pattern": "token", "include_patterns": ["*.rs"]}),
        ));
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["total"], 1);
        assert_eq!(v["matches"][0]["file"], "a.rs");
    }

    #[test]
    fn repo_map_reports_missing_asset() {
        let dir = tempfile::tempdir().unwrap();
        let tools = toolbox(dir.path());
        let out = tools.execute(&call("fetch_repo_map", serde_json::json!({})));
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert!(v["error"].as_str().unwrap().contains("not found"));
    }

    #[test]
    fn repo_map_serves_saved_asset() {
        let dir = tempfile::tempdir().unwrap();
        let store = AssetStore::new(dir.path().join(".assets"));
        let asset = crate::assets::RepoMapAsset {
            file_tree: "src/\n  lib.rs\n".into(),
            file_count: 1,
            files: vec!["src/lib.rs".into()],
            source_path: "/repo".into(),
        };
        store
            .save("assets", "repo_map", &serde_json::to_value(&asset).unwrap())
            .unwrap();
        let tools = WorkspaceTools::new(dir.path(), store, None);
        let out = tools.execute(&call("fetch_repo_map", serde_json::json!({})));
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert!(v["error"].is_null());
        assert_eq!(v["file_count"], 1);
        assert!(v["summary"].as_str().unwrap().contains("Total Files: 1"));
    }

    #[test]
    fn unknown_tool_reports_invocation_error() {
        let dir = tempfile::tempdir().unwrap();
        let tools = toolbox(dir.path());
        let out = tools.execute(&call("make_coffee", serde_json::json!({})));
        assert!(out.contains("Error invoking tool"));
    }
}
