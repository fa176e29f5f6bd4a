//! Core data model shared by all pipeline stages.
//!
//! Every entity is created by its producing stage and immutable after
//! that; the driver owns [`RunState`] and is the only writer across stage
//! boundaries. Collections are sorted deterministically at stage output
//! boundaries so reruns are byte-identical.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Closed set of risk categories an expert can be dispatched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskType {
    SyntaxStaticErrors,
    RobustnessBoundaryConditions,
    ConcurrencyTimingCorrectness,
    AuthorizationDataExposure,
    IntentSemanticConsistency,
    LifecycleStateConsistency,
}

impl RiskType {
    pub const ALL: [RiskType; 6] = [
        RiskType::SyntaxStaticErrors,
        RiskType::RobustnessBoundaryConditions,
        RiskType::ConcurrencyTimingCorrectness,
        RiskType::AuthorizationDataExposure,
        RiskType::IntentSemanticConsistency,
        RiskType::LifecycleStateConsistency,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RiskType::SyntaxStaticErrors => "syntax_static_errors",
            RiskType::RobustnessBoundaryConditions => "robustness_boundary_conditions",
            RiskType::ConcurrencyTimingCorrectness => "concurrency_timing_correctness",
            RiskType::AuthorizationDataExposure => "authorization_data_exposure",
            RiskType::IntentSemanticConsistency => "intent_semantic_consistency",
            RiskType::LifecycleStateConsistency => "lifecycle_state_consistency",
        }
    }

    /// Lenient parse from model output; `None` for unknown strings.
    pub fn parse(s: &str) -> Option<RiskType> {
        let t = s.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|rt| rt.as_str() == t)
    }

    /// Name of the expert prompt template for this type.
    pub fn template_name(self) -> String {
        format!("expert_{}", self.as_str())
    }

    /// Default manager weight; tuned to favor high-signal categories and
    /// damp robustness noise.
    pub fn default_weight(self) -> f32 {
        match self {
            RiskType::SyntaxStaticErrors => 1.4,
            RiskType::ConcurrencyTimingCorrectness => 1.3,
            RiskType::AuthorizationDataExposure => 1.3,
            RiskType::LifecycleStateConsistency => 1.1,
            RiskType::IntentSemanticConsistency => 1.0,
            RiskType::RobustnessBoundaryConditions => 0.7,
        }
    }
}

impl fmt::Display for RiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Issue severity, ordered `error > warning > info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn rank(self) -> u8 {
        match self {
            Severity::Error => 3,
            Severity::Warning => 2,
            Severity::Info => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }

    /// Lenient parse; anything unknown maps to `Info`.
    pub fn parse(s: &str) -> Severity {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Severity::Error,
            "warning" => Severity::Warning,
            _ => Severity::Info,
        }
    }

    /// The stronger of the two severities.
    pub fn max(self, other: Severity) -> Severity {
        if self.rank() >= other.rank() { self } else { other }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive 1-based line range `[start, end]`.
///
/// Serialized as a two-element array. Strict deserialization rejects a
/// bare integer; the lenient [`LineRange::normalize`] accepts `n`, `"n"`,
/// `[n]`, and `[a, b]` for model-output recovery paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

impl LineRange {
    pub fn new(start: u32, end: u32) -> Option<LineRange> {
        if start >= 1 && start <= end {
            Some(LineRange { start, end })
        } else {
            None
        }
    }

    pub fn single(line: u32) -> LineRange {
        let line = line.max(1);
        LineRange {
            start: line,
            end: line,
        }
    }

    /// Best-effort normalization from arbitrary JSON.
    pub fn normalize(v: &serde_json::Value) -> Option<LineRange> {
        match v {
            serde_json::Value::Number(n) => {
                let n = n.as_u64()?;
                LineRange::new(n as u32, n as u32)
            }
            serde_json::Value::String(s) => {
                let n: u32 = s.trim().parse().ok()?;
                LineRange::new(n, n)
            }
            serde_json::Value::Array(items) => match items.as_slice() {
                [a] => {
                    let n = a.as_u64()? as u32;
                    LineRange::new(n, n)
                }
                [a, b] => {
                    let s = a.as_u64()? as u32;
                    let e = b.as_u64()? as u32;
                    LineRange::new(s, e)
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// Union of two ranges.
    pub fn merge(self, other: LineRange) -> LineRange {
        LineRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Clamp into `[1, max_line]`, preserving ordering.
    pub fn clamp_to(self, max_line: u32) -> LineRange {
        let max_line = max_line.max(1);
        let start = self.start.clamp(1, max_line);
        let end = self.end.clamp(start, max_line);
        LineRange { start, end }
    }
}

impl fmt::Display for LineRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}

impl Serialize for LineRange {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        [self.start, self.end].serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LineRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RangeVisitor;

        impl<'de> Visitor<'de> for RangeVisitor {
            type Value = LineRange;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a two-element [start, end] line range")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<LineRange, A::Error> {
                let start: u32 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let end: u32 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                if seq.next_element::<serde_json::Value>()?.is_some() {
                    return Err(de::Error::invalid_length(3, &self));
                }
                LineRange::new(start, end).ok_or_else(|| {
                    de::Error::custom(format!("invalid line range [{start}, {end}]"))
                })
            }
        }

        deserializer.deserialize_seq(RangeVisitor)
    }
}

/// A single candidate or confirmed code-quality issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskItem {
    pub risk_type: RiskType,
    /// POSIX, repo-relative path.
    pub file_path: String,
    pub line_number: LineRange,
    pub description: String,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default)]
    pub suggestion: Option<String>,
}

fn default_confidence() -> f32 {
    0.5
}

fn default_severity() -> Severity {
    Severity::Warning
}

/// Per-file result of the intent map stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAnalysis {
    pub file_path: String,
    pub intent_summary: String,
    #[serde(default)]
    pub potential_risks: Vec<RiskItem>,
    #[serde(default)]
    pub complexity_score: Option<f32>,
}

impl FileAnalysis {
    /// Placeholder analysis used when a per-file task fails; never raises
    /// into the stage.
    pub fn diagnostic(file_path: impl Into<String>, detail: impl fmt::Display) -> FileAnalysis {
        FileAnalysis {
            file_path: file_path.into(),
            intent_summary: format!("Error analyzing file: {detail}"),
            potential_risks: Vec::new(),
            complexity_score: None,
        }
    }
}

/// One pre-computed static-analysis finding supplied as input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LintError {
    pub file: String,
    pub line: u32,
    pub message: String,
    pub severity: Severity,
    #[serde(default)]
    pub code: String,
}

/// Free-form per-run metadata (mode flags, timings, counters).
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// State record owned by the pipeline driver.
///
/// Entity collections are immutable replacements at stage boundaries;
/// `metadata` is updated with append/replace semantics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    pub diff: String,
    pub changed_files: Vec<String>,
    pub file_analyses: Vec<FileAnalysis>,
    pub work_list: Vec<RiskItem>,
    pub expert_tasks: BTreeMap<RiskType, Vec<RiskItem>>,
    pub expert_results: BTreeMap<RiskType, Vec<RiskItem>>,
    pub confirmed_issues: Vec<RiskItem>,
    pub final_report: String,
    pub lint_errors: Vec<LintError>,
    pub metadata: Metadata,
}

/// Monotonic wall-clock deadline shared by the whole pipeline.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    total: Duration,
}

impl Deadline {
    pub fn new(total: Duration) -> Deadline {
        Deadline {
            started: Instant::now(),
            total,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.total.saturating_sub(self.started.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn total(&self) -> Duration {
        self.total
    }
}

/// Stable 8-byte hex hash of a description, used only for canonical
/// ordering at stage boundaries.
pub fn description_hash(description: &str) -> String {
    let digest = Sha256::digest(description.as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Canonical ordering for intent output: by file path.
pub fn sort_file_analyses(analyses: &mut [FileAnalysis]) {
    analyses.sort_by(|a, b| a.file_path.cmp(&b.file_path));
}

/// Canonical ordering for risk lists: `(file_path, start, end,
/// description hash)`.
pub fn sort_risk_items(items: &mut [RiskItem]) {
    items.sort_by(|a, b| {
        (
            a.file_path.as_str(),
            a.line_number.start,
            a.line_number.end,
            description_hash(&a.description),
        )
            .cmp(&(
                b.file_path.as_str(),
                b.line_number.start,
                b.line_number.end,
                description_hash(&b.description),
            ))
    });
}

/// Schema suffix appended to intent prompts, requesting a `FileAnalysis`
/// JSON object.
pub fn file_analysis_format_instructions() -> String {
    let risk_types = RiskType::ALL
        .iter()
        .map(|rt| format!("\"{}\"", rt.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"You must respond with a JSON object that matches the following schema:

{{
  "file_path": "string",
  "intent_summary": "string",
  "potential_risks": [
    {{
      "risk_type": "string",
      "file_path": "string",
      "line_number": [start, end],
      "description": "string",
      "confidence": 0.0,
      "severity": "error | warning | info",
      "suggestion": "string or null"
    }}
  ],
  "complexity_score": 0.0
}}

Important notes:
- The "risk_type" field must be one of: {risk_types}
- The "line_number" field must be a two-element array [start, end] of positive 1-indexed integers
- The "confidence" field must be a float between 0.0 and 1.0
- The "severity" field must be one of: "error", "warning", "info"
- The "suggestion" field is optional (can be null or omitted)

Return only the JSON object, without any markdown code blocks or additional text."#
    )
}

/// Schema suffix for chunked intent prompts: `{{"file_analyses": [...]}}`.
pub fn chunked_format_instructions() -> String {
    format!(
        "You must respond with a JSON object of the form {{\"file_analyses\": [FileAnalysis, ...]}} where each FileAnalysis follows this schema:\n\n{}",
        file_analysis_format_instructions()
    )
}

/// Strict output contract for expert verdicts.
pub fn verdict_format_instructions() -> String {
    let risk_types = RiskType::ALL
        .iter()
        .map(|rt| format!("\"{}\"", rt.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"You must output a single JSON object with exactly these fields:

{{
  "risk_type": one of {risk_types},
  "file_path": "string (repo-relative path, unchanged from the task)",
  "line_number": [start, end],
  "description": "string (your final assessment of the risk)",
  "confidence": float in [0.0, 1.0] (0.0 means the risk is refuted),
  "severity": "error" | "warning" | "info",
  "suggestion": "string or null"
}}

Return only the JSON object. No markdown fences, no explanations."#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_range_rejects_bare_integer() {
        let err = serde_json::from_str::<LineRange>("12");
        assert!(err.is_err());
    }

    #[test]
    fn line_range_rejects_inverted_and_zero() {
        assert!(serde_json::from_str::<LineRange>("[5, 3]").is_err());
        assert!(serde_json::from_str::<LineRange>("[0, 3]").is_err());
        assert!(serde_json::from_str::<LineRange>("[1, 2, 3]").is_err());
    }

    #[test]
    fn line_range_round_trips_as_pair() {
        let r: LineRange = serde_json::from_str("[3, 7]").unwrap();
        assert_eq!(r, LineRange { start: 3, end: 7 });
        assert_eq!(serde_json::to_string(&r).unwrap(), "[3,7]");
    }

    #[test]
    fn normalize_accepts_all_lenient_shapes() {
        use serde_json::json;
        assert_eq!(
            LineRange::normalize(&json!(4)),
            Some(LineRange { start: 4, end: 4 })
        );
        assert_eq!(
            LineRange::normalize(&json!("9")),
            Some(LineRange { start: 9, end: 9 })
        );
        assert_eq!(
            LineRange::normalize(&json!([6])),
            Some(LineRange { start: 6, end: 6 })
        );
        assert_eq!(
            LineRange::normalize(&json!([2, 8])),
            Some(LineRange { start: 2, end: 8 })
        );
        assert_eq!(LineRange::normalize(&json!([8, 2])), None);
        assert_eq!(LineRange::normalize(&json!(null)), None);
        assert_eq!(LineRange::normalize(&json!([1, 2, 3])), None);
    }

    #[test]
    fn risk_type_parse_is_lenient_on_case() {
        assert_eq!(
            RiskType::parse(" Syntax_Static_Errors "),
            Some(RiskType::SyntaxStaticErrors)
        );
        assert_eq!(RiskType::parse("made_up"), None);
    }

    #[test]
    fn severity_ordering_and_max() {
        assert!(Severity::Error.rank() > Severity::Warning.rank());
        assert_eq!(Severity::Info.max(Severity::Error), Severity::Error);
    }

    #[test]
    fn sort_risk_items_is_total_and_stable_across_runs() {
        let mk = |path: &str, s: u32, d: &str| RiskItem {
            risk_type: RiskType::RobustnessBoundaryConditions,
            file_path: path.into(),
            line_number: LineRange::single(s),
            description: d.into(),
            confidence: 0.5,
            severity: Severity::Warning,
            suggestion: None,
        };
        let mut a = vec![mk("b.rs", 2, "x"), mk("a.rs", 9, "y"), mk("a.rs", 9, "b")];
        let mut b = vec![mk("a.rs", 9, "b"), mk("b.rs", 2, "x"), mk("a.rs", 9, "y")];
        sort_risk_items(&mut a);
        sort_risk_items(&mut b);
        assert_eq!(a, b);
        assert_eq!(a[0].file_path, "a.rs");
    }

    #[test]
    fn clamp_keeps_range_inside_file() {
        let r = LineRange { start: 150, end: 300 };
        let c = r.clamp_to(200);
        assert_eq!(c, LineRange { start: 150, end: 200 });
        let c2 = LineRange { start: 500, end: 600 }.clamp_to(10);
        assert_eq!(c2, LineRange { start: 10, end: 10 });
    }
}
