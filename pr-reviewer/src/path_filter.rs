//! Changed-file path filtering.
//!
//! Drops low-signal paths (lock files, build output, generated code,
//! binaries, media, fonts) before the intent stage. Include globs always
//! win over every exclude; the output is deduplicated and sorted so the
//! downstream fan-out is deterministic.

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;

use crate::config::PathFilterConfig;

/// Built-in excludes applied on top of any configured ones.
const DEFAULT_EXCLUDE_GLOBS: &[&str] = &[
    // lock files
    "**/*.lock",
    "**/package-lock.json",
    "**/yarn.lock",
    "**/pnpm-lock.yaml",
    "**/Cargo.lock",
    "**/poetry.lock",
    "**/composer.lock",
    "**/Gemfile.lock",
    // build output / caches
    "**/dist/**",
    "**/build/**",
    "**/target/**",
    "**/node_modules/**",
    "**/__pycache__/**",
    "**/*.min.js",
    "**/*.min.css",
    // generated code
    "**/*.pb.go",
    "**/*_pb2.py",
    "**/*.generated.*",
    "**/*.g.dart",
    "**/*.freezed.dart",
    // binaries & archives
    "**/*.so",
    "**/*.dylib",
    "**/*.dll",
    "**/*.exe",
    "**/*.a",
    "**/*.o",
    "**/*.class",
    "**/*.jar",
    "**/*.zip",
    "**/*.tar",
    "**/*.gz",
    // media
    "**/*.png",
    "**/*.jpg",
    "**/*.jpeg",
    "**/*.gif",
    "**/*.svg",
    "**/*.ico",
    "**/*.mp3",
    "**/*.mp4",
    "**/*.pdf",
    // fonts
    "**/*.ttf",
    "**/*.otf",
    "**/*.woff",
    "**/*.woff2",
];

fn build_globset(patterns: impl IntoIterator<Item = impl AsRef<str>>) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        let pat = pat.as_ref().trim();
        if pat.is_empty() {
            continue;
        }
        match Glob::new(pat) {
            Ok(g) => {
                builder.add(g);
            }
            Err(e) => {
                // A malformed pattern must not break reviews.
                warn!("path_filter: ignoring malformed glob {pat:?}: {e}");
            }
        }
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
}

fn normalize(p: &str) -> String {
    let mut s = p.trim().replace('\\', "/");
    while let Some(rest) = s.strip_prefix("./") {
        s = rest.to_string();
    }
    while let Some(rest) = s.strip_prefix('/') {
        s = rest.to_string();
    }
    s
}

/// Filters low-signal file paths. Returns a sorted, deduplicated list.
pub fn filter_changed_files(files: &[String], cfg: &PathFilterConfig) -> Vec<String> {
    if files.is_empty() {
        return Vec::new();
    }

    if !cfg.enabled {
        let mut kept: Vec<String> = files
            .iter()
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect();
        kept.sort();
        kept.dedup();
        return kept;
    }

    let include = build_globset(&cfg.include_globs);
    let exclude = build_globset(
        DEFAULT_EXCLUDE_GLOBS
            .iter()
            .map(|s| s.to_string())
            .chain(cfg.exclude_globs.iter().cloned()),
    );

    let mut kept = Vec::new();
    for f in files {
        let norm = normalize(f);
        if norm.is_empty() {
            continue;
        }
        if include.is_match(&norm) {
            kept.push(f.trim().to_string());
            continue;
        }
        if exclude.is_match(&norm) {
            continue;
        }
        kept.push(f.trim().to_string());
    }
    kept.sort();
    kept.dedup();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn drops_lock_files_and_binaries_by_default() {
        let cfg = PathFilterConfig::default();
        let kept = filter_changed_files(
            &files(&[
                "src/app.py",
                "Cargo.lock",
                "assets/logo.png",
                "web/dist/bundle.js",
            ]),
            &cfg,
        );
        assert_eq!(kept, vec!["src/app.py".to_string()]);
    }

    #[test]
    fn include_globs_override_excludes() {
        let cfg = PathFilterConfig {
            include_globs: vec!["**/*.png".into()],
            ..Default::default()
        };
        let kept = filter_changed_files(&files(&["assets/logo.png", "poetry.lock"]), &cfg);
        assert_eq!(kept, vec!["assets/logo.png".to_string()]);
    }

    #[test]
    fn disabled_filter_only_trims_and_sorts() {
        let cfg = PathFilterConfig {
            enabled: false,
            ..Default::default()
        };
        let kept = filter_changed_files(&files(&["b.lock", " a.py ", "", "a.py"]), &cfg);
        assert_eq!(kept, vec!["a.py".to_string(), "b.lock".to_string()]);
    }

    #[test]
    fn malformed_globs_are_ignored() {
        let cfg = PathFilterConfig {
            exclude_globs: vec!["[".into()],
            ..Default::default()
        };
        let kept = filter_changed_files(&files(&["src/a.py"]), &cfg);
        assert_eq!(kept, vec!["src/a.py".to_string()]);
    }
}
