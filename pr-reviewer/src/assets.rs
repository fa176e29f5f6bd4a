//! Persisted asset store and the repo-map asset.
//!
//! Assets are JSON documents keyed by `(kind, key)` and stored as
//! `<assets_dir>/<kind>/<key>.json`. The core only reads assets at review
//! time; building happens out-of-band (e.g. `build_repo_map` invoked from
//! the CLI or the webhook worker before a review).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// File-backed JSON asset store.
#[derive(Debug, Clone)]
pub struct AssetStore {
    dir: PathBuf,
}

impl AssetStore {
    pub fn new(dir: impl Into<PathBuf>) -> AssetStore {
        AssetStore { dir: dir.into() }
    }

    fn path_for(&self, kind: &str, key: &str) -> PathBuf {
        // Keys may contain path-hostile characters (branch names etc.).
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(kind).join(format!("{safe}.json"))
    }

    /// Loads an asset; `None` when absent or unreadable.
    pub fn load(&self, kind: &str, key: &str) -> Option<serde_json::Value> {
        let path = self.path_for(kind, key);
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("assets: unreadable asset {}: {e}", path.display());
                None
            }
        }
    }

    /// Stores an asset, creating directories as needed.
    pub fn save(&self, kind: &str, key: &str, value: &serde_json::Value) -> std::io::Result<()> {
        let path = self.path_for(kind, key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(value).unwrap_or_else(|_| b"{}".to_vec());
        std::fs::write(&path, data)?;
        debug!("assets: saved {kind}/{key} -> {}", path.display());
        Ok(())
    }

    pub fn exists(&self, kind: &str, key: &str) -> bool {
        self.path_for(kind, key).is_file()
    }
}

/// Persisted shape of the repo-map asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoMapAsset {
    pub file_tree: String,
    pub file_count: usize,
    pub files: Vec<String>,
    pub source_path: String,
}

/// Walks the workspace and builds the repo-map asset: a directory tree
/// rendering plus the sorted file list. Hidden directories and obvious
/// build output are skipped.
pub fn build_repo_map(root: &Path) -> RepoMapAsset {
    let mut files: Vec<String> = Vec::new();

    let walker = WalkDir::new(root)
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
                || name == "__pycache__"
                || name == "dist"
                || name == "build")
        });

    for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            files.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    files.sort();

    let file_tree = render_tree(&files);
    RepoMapAsset {
        file_count: files.len(),
        file_tree,
        files,
        source_path: root.display().to_string(),
    }
}

/// Renders a compact directory tree from sorted relative paths.
fn render_tree(files: &[String]) -> String {
    let mut out = String::new();
    let mut last_dirs: Vec<String> = Vec::new();
    for f in files {
        let parts: Vec<&str> = f.split('/').collect();
        let (dirs, name) = parts.split_at(parts.len().saturating_sub(1));
        // Print newly-entered directory levels.
        let mut common = 0usize;
        while common < dirs.len()
            && common < last_dirs.len()
            && last_dirs[common] == dirs[common]
        {
            common += 1;
        }
        for (depth, d) in dirs.iter().enumerate().skip(common) {
            out.push_str(&"  ".repeat(depth));
            out.push_str(d);
            out.push_str("/\n");
        }
        out.push_str(&"  ".repeat(dirs.len()));
        out.push_str(name.first().copied().unwrap_or(""));
        out.push('\n');
        last_dirs = dirs.iter().map(|s| s.to_string()).collect();
    }
    out
}
