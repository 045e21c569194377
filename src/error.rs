use thiserror::Error;

/// Crate-wide error type.
///
/// Distinguishes store connectivity failures, which should propagate out of
/// the claim/reaper loops, from per-job failures (bad decode, a failed
/// handler), which stay local and never abort a loop.
#[derive(Debug, Error)]
pub enum MlqError {
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("record at key {key} could not be decoded in either text or byte-key mode")]
    Decode { key: String },

    #[error("handler {name} failed: {message}")]
    Handler { name: String, message: String },

    #[error("callback request failed: {0}")]
    Callback(#[from] reqwest::Error),

    #[error("no progress record found for job {0}")]
    NotFound(String),

    #[error("http layer error: {0}")]
    Http(String),
}

pub type Result<T> = std::result::Result<T, MlqError>;
