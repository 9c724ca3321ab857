//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Server is busy ({limit} transfers already running). Please try again in a few minutes.")]
    CapacityExceeded { limit: usize },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Extraction failed: {message}")]
    Extraction {
        message: String,
        diagnostics: Option<String>,
    },

    #[error("Transcode failed: {0}")]
    TranscodeFailure(String),

    #[error("Upload failed: {0}")]
    SinkFailure(String),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::Unauthenticated(msg.into())
    }

    pub fn source(msg: impl Into<String>) -> Self {
        Self::SourceUnavailable(msg.into())
    }

    pub fn transcode(msg: impl Into<String>) -> Self {
        Self::TranscodeFailure(msg.into())
    }

    pub fn sink(msg: impl Into<String>) -> Self {
        Self::SinkFailure(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn extraction(msg: impl Into<String>, diagnostics: Option<String>) -> Self {
        Self::Extraction {
            message: msg.into(),
            diagnostics,
        }
    }

    /// Short, user-facing summary for the terminal `error` event.
    pub fn summary(&self) -> &'static str {
        match self {
            Self::SourceUnavailable(_) | Self::Extraction { .. } => {
                "Could not fetch the source video"
            }
            Self::TranscodeFailure(_) => "Compression failed",
            Self::SinkFailure(_) => "Saving to storage failed",
            Self::Unauthenticated(_) => "Storage access was denied",
            Self::Cancelled => "Transfer cancelled",
            _ => "An unexpected error occurred",
        }
    }

    /// Detailed message including any captured tool diagnostics.
    pub fn detail(&self) -> String {
        match self {
            Self::Extraction {
                message,
                diagnostics: Some(diagnostics),
            } if !diagnostics.is_empty() => format!("{message}: {diagnostics}"),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extraction_detail_includes_diagnostics() {
        let err = Error::extraction("metadata probe failed", Some("ERROR: Unsupported URL".into()));
        assert_eq!(err.summary(), "Could not fetch the source video");
        assert!(err.detail().contains("Unsupported URL"));
    }

    #[test]
    fn test_capacity_message() {
        let err = Error::CapacityExceeded { limit: 5 };
        assert!(err.to_string().contains("busy"));
    }
}
