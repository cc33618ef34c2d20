use thiserror::Error;

/// Errors surfaced by the dispatcher to the host engine are never exceptions — they
/// are coerced into `{"error": "..."}` JSON strings by [`crate::dispatcher`]. This type
/// exists for the internal plumbing that produces those strings and for the pieces
/// (cache, tracker) that are allowed to fail open.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("cascade invocation failed: {0}")]
    Cascade(String),

    #[error("host engine query failed: {0}")]
    HostEngine(String),

    #[error("cache backend unavailable: {0}")]
    CacheUnavailable(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
