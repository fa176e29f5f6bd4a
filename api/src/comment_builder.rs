//! Builds inline review comments from confirmed issues.
//!
//! Maps each issue onto a commentable line (a new-file line visible in
//! the PR diff), fuzzing up to `max_line_fuzz` lines when the exact line
//! is not commentable. Issues landing on the same `(path, line)` are
//! grouped into one comment; groups are ranked by max severity then max
//! confidence and capped at `max_review_comments`. Everything that could
//! not be placed or did not fit the cap comes back in `skipped`.

use std::collections::BTreeMap;

use serde::Serialize;

use pr_reviewer::diff::{DiffIndex, normalize_path};
use pr_reviewer::state::RiskItem;

/// Provider-side comment bodies are limited; stay well below.
const MAX_COMMENT_BODY_CHARS: usize = 65_000;

/// One inline review comment ready for posting.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewComment {
    pub path: String,
    pub line: u32,
    pub side: &'static str,
    pub body: String,
}

/// Builder output.
#[derive(Debug, Serialize)]
pub struct BuiltComments {
    pub review_comments: Vec<ReviewComment>,
    pub skipped: Vec<RiskItem>,
    pub total_issues: usize,
}

/// Builds up to `max_review_comments` grouped comments.
pub fn build_review_comments(
    pr_diff: &str,
    confirmed_issues: &[RiskItem],
    max_review_comments: usize,
    max_line_fuzz: u32,
) -> BuiltComments {
    let index = DiffIndex::parse(pr_diff);

    let mut grouped: BTreeMap<(String, u32), Vec<RiskItem>> = BTreeMap::new();
    let mut skipped: Vec<RiskItem> = Vec::new();

    for issue in confirmed_issues {
        let path = normalize_path(&issue.file_path);
        let commentable: Vec<u32> = index
            .context(&path)
            .map(|ctx| ctx.new_file_lines.iter().map(|(n, _)| *n).collect())
            .unwrap_or_default();
        if path.is_empty() || commentable.is_empty() {
            skipped.push(issue.clone());
            continue;
        }

        match select_line(&commentable, issue, max_line_fuzz) {
            Some(line) => grouped.entry((path, line)).or_default().push(issue.clone()),
            None => skipped.push(issue.clone()),
        }
    }

    // Rank groups by (max severity, max confidence), strongest first.
    let mut ranked: Vec<((String, u32), Vec<RiskItem>)> = grouped.into_iter().collect();
    ranked.sort_by(|a, b| {
        group_score(&b.1)
            .partial_cmp(&group_score(&a.1))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });

    let total_issues = confirmed_issues.len();
    let mut review_comments = Vec::new();
    for ((path, line), items) in ranked.iter().take(max_review_comments) {
        review_comments.push(ReviewComment {
            path: path.clone(),
            line: *line,
            side: "RIGHT",
            body: render_body(items),
        });
    }
    for (_, items) in ranked.into_iter().skip(max_review_comments) {
        skipped.extend(items);
    }

    BuiltComments {
        review_comments,
        skipped,
        total_issues,
    }
}

/// Exact line first, then a forward scan over the fuzzed range, then the
/// nearest commentable line within the fuzz distance.
fn select_line(commentable: &[u32], issue: &RiskItem, max_line_fuzz: u32) -> Option<u32> {
    let start = issue.line_number.start;
    let end = issue.line_number.end.max(start);
    if commentable.binary_search(&start).is_ok() {
        return Some(start);
    }

    let lo = start.saturating_sub(max_line_fuzz).max(1);
    let hi = end.saturating_add(max_line_fuzz);
    for candidate in lo..=hi {
        if commentable.binary_search(&candidate).is_ok() {
            return Some(candidate);
        }
    }

    if max_line_fuzz > 0 {
        let nearest = commentable
            .iter()
            .min_by_key(|&&c| c.abs_diff(start))
            .copied()?;
        if nearest.abs_diff(start) <= max_line_fuzz {
            return Some(nearest);
        }
    }
    None
}

fn group_score(items: &[RiskItem]) -> (u8, f32) {
    let sev = items.iter().map(|i| i.severity.rank()).max().unwrap_or(0);
    let conf = items
        .iter()
        .map(|i| i.confidence)
        .fold(0.0f32, f32::max);
    (sev, conf)
}

fn render_body(items: &[RiskItem]) -> String {
    let mut lines: Vec<String> = Vec::new();
    for item in items {
        lines.push(format!(
            "- **{}** `{}` (confidence {:.2}) line {}",
            item.severity.as_str().to_uppercase(),
            item.risk_type,
            item.confidence,
            item.line_number,
        ));
        if !item.description.trim().is_empty() {
            lines.push(format!("  - {}", item.description.trim()));
        }
        if let Some(s) = &item.suggestion {
            lines.push(format!("  - Suggestion: {}", s.trim()));
        }
    }
    let mut body = lines.join("\n");
    if body.len() > MAX_COMMENT_BODY_CHARS {
        body.truncate(floor_char_boundary(&body, MAX_COMMENT_BODY_CHARS));
    }
    body
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

#[cfg(test)]
mod tests {
    use super::*;
    use pr_reviewer::state::{LineRange, RiskType, Severity};

    const DIFF: &str = "\
diff --git a/src/a.py b/src/a.py
--- a/src/a.py
+++ b/src/a.py
@@ -9,0 +10,5 @@
+l10
+l11
+l12
+l13
+l14
";

    fn issue(path: &str, start: u32, end: u32, conf: f32, sev: Severity) -> RiskItem {
        RiskItem {
            risk_type: RiskType::RobustnessBoundaryConditions,
            file_path: path.into(),
            line_number: LineRange::new(start, end).unwrap(),
            description: "desc".into(),
            confidence: conf,
            severity: sev,
            suggestion: None,
        }
    }

    #[test]
    fn exact_line_comments_are_placed() {
        let out = build_review_comments(DIFF, &[issue("src/a.py", 12, 12, 0.9, Severity::Error)], 10, 3);
        assert_eq!(out.review_comments.len(), 1);
        assert_eq!(out.review_comments[0].line, 12);
        assert_eq!(out.review_comments[0].side, "RIGHT");
        assert!(out.skipped.is_empty());
    }

    #[test]
    fn fuzz_finds_nearby_commentable_line() {
        // Line 8 is not in the diff; fuzz 3 reaches line 10.
        let out = build_review_comments(DIFF, &[issue("src/a.py", 8, 8, 0.9, Severity::Error)], 10, 3);
        assert_eq!(out.review_comments.len(), 1);
        assert_eq!(out.review_comments[0].line, 10);
    }

    #[test]
    fn out_of_reach_issues_are_skipped() {
        let out = build_review_comments(DIFF, &[issue("src/a.py", 50, 50, 0.9, Severity::Error)], 10, 3);
        assert!(out.review_comments.is_empty());
        assert_eq!(out.skipped.len(), 1);
    }

    #[test]
    fn same_line_issues_group_into_one_comment() {
        let issues = vec![
            issue("src/a.py", 11, 11, 0.7, Severity::Warning),
            issue("src/a.py", 11, 11, 0.9, Severity::Error),
        ];
        let out = build_review_comments(DIFF, &issues, 10, 0);
        assert_eq!(out.review_comments.len(), 1);
        let body = &out.review_comments[0].body;
        assert!(body.contains("**ERROR**"));
        assert!(body.contains("**WARNING**"));
    }

    #[test]
    fn cap_keeps_strongest_groups_and_reports_rest() {
        let issues = vec![
            issue("src/a.py", 10, 10, 0.5, Severity::Info),
            issue("src/a.py", 12, 12, 0.9, Severity::Error),
        ];
        let out = build_review_comments(DIFF, &issues, 1, 0);
        assert_eq!(out.review_comments.len(), 1);
        assert_eq!(out.review_comments[0].line, 12);
        assert_eq!(out.skipped.len(), 1);
        assert_eq!(out.total_issues, 2);
    }

    #[test]
    fn unknown_paths_are_skipped() {
        let out = build_review_comments(DIFF, &[issue("other.py", 10, 10, 0.9, Severity::Error)], 10, 3);
        assert!(out.review_comments.is_empty());
        assert_eq!(out.skipped.len(), 1);
    }
}
