//! Diff context adapter.
//!
//! Parses a unified diff once into per-file structures: the set of added
//! and modified line numbers (new-file numbering), the visible new-file
//! lines with absolute numbers, and the raw per-file diff section. Robust
//! to marker lines (`\ No newline at end of file`) and binary patches;
//! asking about a file absent from the diff yields empty structures,
//! never an error.

use std::collections::{BTreeMap, BTreeSet};

/// Strips `a/`, `b/`, and leading-slash prefixes from diff paths.
pub fn normalize_path(p: &str) -> String {
    let mut s = p.trim();
    if let Some(rest) = s.strip_prefix("a/").or_else(|| s.strip_prefix("b/")) {
        s = rest;
    }
    while let Some(rest) = s.strip_prefix('/') {
        s = rest;
    }
    s.to_string()
}

/// Per-file view of the diff, in new-file line numbering.
#[derive(Debug, Clone, Default)]
pub struct FileDiffContext {
    /// New lines inserted without replacing anything.
    pub added_lines: BTreeSet<u32>,
    /// New lines that replace removed ones.
    pub modified_lines: BTreeSet<u32>,
    /// All new-file lines visible in the diff, `(absolute_line, text)`.
    pub new_file_lines: Vec<(u32, String)>,
}

impl FileDiffContext {
    /// Sorted union of added and modified lines.
    pub fn changed_lines(&self) -> Vec<u32> {
        self.added_lines
            .union(&self.modified_lines)
            .copied()
            .collect()
    }
}

/// Whole-diff index built by a single parse.
#[derive(Debug, Clone, Default)]
pub struct DiffIndex {
    files: BTreeMap<String, FileDiffContext>,
    sections: BTreeMap<String, String>,
    total_chars: usize,
}

impl DiffIndex {
    /// Parses a unified diff. Never fails; unparseable regions are skipped.
    pub fn parse(diff: &str) -> DiffIndex {
        let mut files: BTreeMap<String, FileDiffContext> = BTreeMap::new();
        let mut sections: BTreeMap<String, String> = BTreeMap::new();

        let mut current: Option<String> = None;
        let mut section_buf = String::new();
        let mut new_line = 0u32;
        let mut pending_removals = 0u32;
        let mut in_hunk = false;

        let mut flush_section =
            |path: &Option<String>, buf: &mut String, sections: &mut BTreeMap<String, String>| {
                if let Some(p) = path {
                    if !buf.is_empty() {
                        sections
                            .entry(p.clone())
                            .or_default()
                            .push_str(buf.as_str());
                    }
                }
                buf.clear();
            };

        for line in diff.lines() {
            if line.starts_with("diff --git ") {
                flush_section(&current, &mut section_buf, &mut sections);
                // "diff --git a/old b/new": the b/ side names the file.
                current = line
                    .rsplit(' ')
                    .next()
                    .map(normalize_path)
                    .filter(|p| !p.is_empty());
                in_hunk = false;
                pending_removals = 0;
                section_buf.push_str(line);
                section_buf.push('\n');
                continue;
            }

            if let Some(rest) = line.strip_prefix("+++ ") {
                let p = rest.trim();
                if p != "/dev/null" {
                    let normalized = normalize_path(p);
                    if !normalized.is_empty() {
                        if current.as_deref() != Some(normalized.as_str()) {
                            flush_section(&current, &mut section_buf, &mut sections);
                        }
                        current = Some(normalized);
                    }
                }
                section_buf.push_str(line);
                section_buf.push('\n');
                continue;
            }

            section_buf.push_str(line);
            section_buf.push('\n');

            if line.starts_with("@@") {
                if let Some((_, new_start)) = parse_hunk_header(line) {
                    new_line = new_start;
                    in_hunk = true;
                    pending_removals = 0;
                }
                continue;
            }

            // Marker lines are not diff content.
            if line.starts_with("\\ ") {
                continue;
            }

            let Some(path) = current.clone() else {
                continue;
            };
            if !in_hunk {
                continue;
            }

            let ctx = files.entry(path).or_default();
            if let Some(rest) = line.strip_prefix('+') {
                if pending_removals > 0 {
                    ctx.modified_lines.insert(new_line);
                    pending_removals -= 1;
                } else {
                    ctx.added_lines.insert(new_line);
                }
                ctx.new_file_lines.push((new_line, rest.to_string()));
                new_line += 1;
            } else if line.starts_with('-') {
                pending_removals += 1;
            } else {
                // Context line (leading space or provider quirk).
                pending_removals = 0;
                let text = line.strip_prefix(' ').unwrap_or(line);
                ctx.new_file_lines.push((new_line, text.to_string()));
                new_line += 1;
            }
        }
        flush_section(&current, &mut section_buf, &mut sections);

        DiffIndex {
            files,
            sections,
            total_chars: diff.len(),
        }
    }

    /// Per-file context; `None` for files outside the diff.
    pub fn context(&self, path: &str) -> Option<&FileDiffContext> {
        self.files.get(&normalize_path(path))
    }

    /// Raw diff section for a file; empty for unknown paths.
    pub fn file_diff(&self, path: &str) -> &str {
        self.sections
            .get(&normalize_path(path))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Sorted changed-line union for a file; empty for unknown paths.
    pub fn changed_lines(&self, path: &str) -> Vec<u32> {
        self.context(path)
            .map(FileDiffContext::changed_lines)
            .unwrap_or_default()
    }

    /// Window of new-file lines in `[start-pad, end+pad]` with absolute
    /// line numbers, as visible in the diff.
    pub fn window(&self, path: &str, start: u32, end: u32, pad: u32) -> Vec<(u32, String)> {
        let Some(ctx) = self.context(path) else {
            return Vec::new();
        };
        let lo = start.saturating_sub(pad).max(1);
        let hi = end.saturating_add(pad);
        ctx.new_file_lines
            .iter()
            .filter(|(n, _)| *n >= lo && *n <= hi)
            .cloned()
            .collect()
    }

    /// Paths present in the diff, sorted.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Total size of the parsed diff in characters.
    pub fn total_chars(&self) -> usize {
        self.total_chars
    }
}

/// Splits `@@ -a,b +c,d @@` into `(old_start, new_start)`.
fn parse_hunk_header(line: &str) -> Option<(u32, u32)> {
    let inner = line.trim_start_matches('@').trim_end_matches(|c| c != '@');
    let inner = inner.trim_matches('@').trim();
    let (left, right) = inner.split_once('+')?;
    let old_start = split_nums(left.trim().trim_start_matches('-')).0;
    let new_start = split_nums(right.trim()).0;
    Some((old_start, new_start))
}

/// Splits "12,7" or "12" into (start, len).
fn split_nums(s: &str) -> (u32, u32) {
    let s = s
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim();
    if let Some((a, b)) = s.split_once(',') {
        (a.parse().unwrap_or(0), b.parse().unwrap_or(0))
    } else {
        (s.parse().unwrap_or(0), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
diff --git a/src/a.py b/src/a.py
index 111..222 100644
--- a/src/a.py
+++ b/src/a.py
@@ -1,4 +1,5 @@
 def main():
-    x = 1
+    x = 2
+    y = 3
     return x
\\ No newline at end of file
diff --git a/src/b.py b/src/b.py
--- a/src/b.py
+++ b/src/b.py
@@ -10,2 +10,3 @@
 context
+added
 tail
";

    #[test]
    fn classifies_added_vs_modified_lines() {
        let idx = DiffIndex::parse(SAMPLE);
        let ctx = idx.context("src/a.py").unwrap();
        // "x = 2" replaces "x = 1" → modified; "y = 3" is a pure insert.
        assert!(ctx.modified_lines.contains(&2));
        assert!(ctx.added_lines.contains(&3));
        assert_eq!(idx.changed_lines("src/a.py"), vec![2, 3]);

        let ctx_b = idx.context("src/b.py").unwrap();
        assert_eq!(ctx_b.changed_lines(), vec![11]);
    }

    #[test]
    fn new_file_lines_carry_absolute_numbers() {
        let idx = DiffIndex::parse(SAMPLE);
        let ctx = idx.context("src/a.py").unwrap();
        let lines: Vec<_> = ctx.new_file_lines.iter().cloned().collect();
        assert_eq!(lines[0], (1, "def main():".to_string()));
        assert_eq!(lines[2], (3, "    y = 3".to_string()));
        assert_eq!(lines[3], (4, "    return x".to_string()));
    }

    #[test]
    fn window_selects_padded_range() {
        let idx = DiffIndex::parse(SAMPLE);
        let w = idx.window("src/a.py", 3, 3, 1);
        let nums: Vec<u32> = w.iter().map(|(n, _)| *n).collect();
        assert_eq!(nums, vec![2, 3, 4]);
    }

    #[test]
    fn per_file_sections_are_isolated() {
        let idx = DiffIndex::parse(SAMPLE);
        let a = idx.file_diff("src/a.py");
        assert!(a.contains("+    y = 3"));
        assert!(!a.contains("+added"));
        assert!(idx.file_diff("b/src/b.py").contains("+added"));
    }

    #[test]
    fn unknown_file_yields_empty_structures() {
        let idx = DiffIndex::parse(SAMPLE);
        assert!(idx.context("nope.py").is_none());
        assert_eq!(idx.file_diff("nope.py"), "");
        assert!(idx.changed_lines("nope.py").is_empty());
        assert!(idx.window("nope.py", 1, 5, 2).is_empty());
    }

    #[test]
    fn empty_diff_parses_to_empty_index() {
        let idx = DiffIndex::parse("");
        assert_eq!(idx.paths().count(), 0);
        assert_eq!(idx.total_chars(), 0);
    }

    #[test]
    fn path_normalization_strips_prefixes() {
        assert_eq!(normalize_path("a/src/x.rs"), "src/x.rs");
        assert_eq!(normalize_path("b/src/x.rs"), "src/x.rs");
        assert_eq!(normalize_path("/src/x.rs"), "src/x.rs");
        assert_eq!(normalize_path("  src/x.rs"), "src/x.rs");
    }
}
