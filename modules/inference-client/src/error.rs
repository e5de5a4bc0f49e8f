use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("inference request failed: {0}")]
    Http(String),

    #[error("inference response malformed: {0}")]
    Decode(String),

    /// The device ran out of memory. Callers should retry without state
    /// change; the operator remedy is lowering concurrency.
    #[error("inference device out of memory")]
    OutOfMemory,

    #[error("inference engine unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for InferenceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            InferenceError::Unavailable(e.to_string())
        } else {
            InferenceError::Http(e.to_string())
        }
    }
}
