//! Crate-wide error hierarchy for pr-reviewer.
//!
//! Goals:
//! - Single root `Error` for all public functions.
//! - Only input validation and invariant breaches are fatal; everything
//!   inside a stage degrades into structured placeholders instead of
//!   propagating upwards.
//! - No dynamic dispatch, no async-trait, ergonomic `?` via `From` impls.

use thiserror::Error;

/// Convenient alias for crate-wide results.
pub type ReviewResult<T> = Result<T, Error>;

/// Root error type for the pr-reviewer crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid inputs (bad repo path, missing ref, malformed lint list).
    /// The pipeline does not start.
    #[error("input error: {0}")]
    Input(String),

    /// Prompt template loading/rendering failure.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Configuration problems (unreadable file, bad JSON, bad values).
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// `RunState` invariant breach detected by the driver.
    #[error("state invariant violated: {0}")]
    Invariant(String),

    /// Artifact/asset I/O failure at a point where it is fatal.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic catch-all when nothing else fits.
    #[error("other error: {0}")]
    Other(String),
}

/// Prompt template errors.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template not found: {0}")]
    NotFound(String),

    #[error("io error reading template {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A `{placeholder}` in the template has no bound variable.
    #[error("template {name}: missing variable `{variable}`")]
    MissingVariable { name: String, variable: String },
}

/// Configuration and setup errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Other(format!("serde error: {e}"))
    }
}
