//! Error taxonomy surfaced to callers of the core.

use thiserror::Error;

/// Errors produced by the orchestration core.
///
/// Provider and auth failures carry enough context for a caller to act
/// (missing credentials include the command to run; HTTP failures include
/// the status and a body snippet).
#[derive(Debug, Error)]
pub enum CoreError {
    /// No credentials file, or no entry for the requested provider.
    #[error("no credentials found: {0}")]
    AuthMissing(String),

    /// The token refresh HTTP call failed or returned a malformed payload.
    #[error("token refresh failed: {0}")]
    AuthRefreshFailed(String),

    /// The one-time provider validation call returned an unexpected payload.
    #[error("provider smoke test failed: {0}")]
    SmokeTestFailed(String),

    /// Non-2xx response from a provider API.
    #[error("provider returned HTTP {status}: {body}")]
    ProviderHttp { status: u16, body: String },

    /// Provider-level failure that is not a plain HTTP status (e.g. an
    /// error event inside a stream).
    #[error("provider error: {0}")]
    Provider(String),

    /// Client-side deadline exceeded.
    #[error("timeout after {0} ms")]
    Timeout(u64),

    /// The model name did not resolve to any known provider.
    #[error("no provider recognizes model '{0}'")]
    UnknownProvider(String),

    /// LLM output could not be parsed into a valid subtask array.
    #[error("decomposition failed: {0}")]
    Decomposition(String),

    /// An operation referenced a task id that does not exist.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// The executor detected a dependency cycle the decomposer validation
    /// should have rejected.
    #[error("unresolvable dependency cycle in swarm {0}")]
    UnresolvableCycle(String),

    /// A caller-supplied argument failed validation.
    #[error("{0}")]
    Invalid(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_the_deadline() {
        let e = CoreError::Timeout(2500);
        assert_eq!(e.to_string(), "timeout after 2500 ms");
    }

    #[test]
    fn provider_http_message_carries_status_and_body() {
        let e = CoreError::ProviderHttp {
            status: 429,
            body: "rate_limit_exceeded".to_string(),
        };
        let msg = e.to_string();
        assert!(msg.contains("429"));
        assert!(msg.contains("rate_limit_exceeded"));
    }

    #[test]
    fn unknown_provider_names_the_model() {
        let e = CoreError::UnknownProvider("mistral-large".to_string());
        assert!(e.to_string().contains("mistral-large"));
    }
}
