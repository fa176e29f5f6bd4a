//! Unified error types for `llm-gateway`.
//!
//! Transport failures keep their `reqwest` detail; non-2xx responses are
//! surfaced as [`HttpError`] carrying `{status, url, snippet}` so callers
//! can log actionable diagnostics without dumping whole response bodies.

use thiserror::Error;

/// Maximum number of characters of a response body kept for diagnostics.
const MAX_SNIPPET_CHARS: usize = 4000;

/// Structured view of a non-success HTTP response.
#[derive(Debug, Clone)]
pub struct HttpError {
    pub status: u16,
    pub url: String,
    /// Truncated response body for logs.
    pub snippet: String,
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "status {} at {}: {}", self.status, self.url, self.snippet)
    }
}

/// Root error type for gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Provider returned a non-2xx status.
    #[error("provider http error: {0}")]
    HttpStatus(HttpError),

    /// Network/transport failure (DNS, connect, timeout, TLS).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Response body could not be decoded into the expected shape.
    #[error("decode error: {0}")]
    Decode(String),

    /// Provider answered with an empty `choices` array.
    #[error("provider returned no choices")]
    EmptyChoices,

    /// API key required by the configured provider but absent.
    #[error("missing api key for provider")]
    MissingApiKey,

    /// Endpoint is empty or does not use an http(s) scheme.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The scripted backend ran out of queued replies.
    #[error("scripted gateway exhausted after {0} replies")]
    ScriptExhausted(usize),
}

/// Convenient alias for gateway results.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Truncates a response body into a single-line log snippet.
pub fn make_snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_SNIPPET_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(MAX_SNIPPET_CHARS).collect();
    format!("{cut}\n...[truncated]...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_passes_short_bodies_through() {
        assert_eq!(make_snippet("  {\"error\": \"bad\"}  "), "{\"error\": \"bad\"}");
    }

    #[test]
    fn snippet_truncates_long_bodies() {
        let body = "x".repeat(MAX_SNIPPET_CHARS + 100);
        let s = make_snippet(&body);
        assert!(s.ends_with("...[truncated]..."));
        assert!(s.chars().count() < body.chars().count());
    }
}
