use edgesync_core::{FormatError, GraphError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EdgeError>;

/// Error taxonomy shared by every engine component.
///
/// The variant decides what the caller does next: transient failures are
/// retried by the synchronizer, corruption rejects the offending frame or
/// snapshot and keeps going, fatal errors stop the component that hit them.
#[derive(Error, Debug)]
pub enum EdgeError {
    /// Network or disk hiccup; the operation can be retried as-is.
    #[error("transient io failure: {0}")]
    TransientIo(String),

    /// Checksum, decode, or validation failure on persisted or downloaded data.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// Durable write failed; the component must stop accepting work.
    #[error("fatal storage failure: {0}")]
    Fatal(String),

    /// Serving with reduced coverage (e.g. no snapshot installed yet).
    #[error("degraded: {0}")]
    Degraded(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("embedding failed: {0}")]
    Embedding(String),
}

impl EdgeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EdgeError::TransientIo(_) | EdgeError::Degraded(_))
    }

    /// Stable machine-readable code for API bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            EdgeError::TransientIo(_) => "transient_io",
            EdgeError::Corruption(_) => "corruption",
            EdgeError::Fatal(_) => "fatal",
            EdgeError::Degraded(_) => "degraded",
            EdgeError::InvalidInput(_) => "bad_request",
            EdgeError::Embedding(_) => "embedding_failed",
        }
    }

    pub fn transient(context: &str, err: impl std::fmt::Display) -> Self {
        EdgeError::TransientIo(format!("{context}: {err}"))
    }

    pub fn fatal(context: &str, err: impl std::fmt::Display) -> Self {
        EdgeError::Fatal(format!("{context}: {err}"))
    }

    pub fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        EdgeError::InvalidInput(format!(
            "dimension mismatch: expected {expected}, got {actual}"
        ))
    }
}

impl From<FormatError> for EdgeError {
    fn from(err: FormatError) -> Self {
        match err {
            FormatError::Io(io) => EdgeError::TransientIo(io.to_string()),
            other => EdgeError::Corruption(other.to_string()),
        }
    }
}

impl From<GraphError> for EdgeError {
    fn from(err: GraphError) -> Self {
        EdgeError::Corruption(err.to_string())
    }
}

impl From<std::io::Error> for EdgeError {
    fn from(err: std::io::Error) -> Self {
        EdgeError::TransientIo(err.to_string())
    }
}

impl From<reqwest::Error> for EdgeError {
    fn from(err: reqwest::Error) -> Self {
        EdgeError::TransientIo(format!("http: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(EdgeError::TransientIo("timeout".into()).is_retryable());
        assert!(EdgeError::Degraded("no snapshot".into()).is_retryable());
        assert!(!EdgeError::Corruption("bad checksum".into()).is_retryable());
        assert!(!EdgeError::Fatal("disk full".into()).is_retryable());
        assert!(!EdgeError::InvalidInput("dim".into()).is_retryable());
    }

    #[test]
    fn format_errors_map_to_corruption() {
        let err: EdgeError = FormatError::InvalidMagic.into();
        assert_eq!(err.code(), "corruption");
        let err: EdgeError = FormatError::Io(std::io::Error::other("eio")).into();
        assert_eq!(err.code(), "transient_io");
    }

    #[test]
    fn dimension_mismatch_is_bad_request() {
        let err = EdgeError::dimension_mismatch(512, 3);
        assert_eq!(err.code(), "bad_request");
        assert!(err.to_string().contains("expected 512, got 3"));
    }
}
