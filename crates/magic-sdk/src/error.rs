//! SDK error types.
//!
//! [`SdkError`] is the single error type returned by every fallible
//! operation in the SDK. It wraps transport and serialization failures and
//! surfaces protocol-level rejections with both code spaces.

use magic_models::{MagicStatus, ResultCode};

/// Error type for all SDK operations.
#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    /// Generic I/O error on the control connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The connection closed while an answer was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// No answer arrived within the request deadline.
    #[error("request timed out")]
    Timeout,

    /// The gateway answered with an unexpected message type.
    #[error("unexpected answer type {got}")]
    UnexpectedAnswer {
        /// Mnemonic of the message that arrived instead.
        got: &'static str,
    },

    /// The gateway rejected the request.
    #[error("request rejected: result {result}, status {status:?}: {message}")]
    Rejected {
        /// Protocol-level result code.
        result: ResultCode,
        /// Detailed MAGIC status, when the answer carried one.
        status: Option<MagicStatus>,
        /// Diagnostic text from the answer.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_display_carries_both_codes() {
        let err = SdkError::Rejected {
            result: ResultCode::UnableToComply,
            status: Some(MagicStatus::QueueFull),
            message: "queue full".into(),
        };
        let text = err.to_string();
        assert!(text.contains("5012"));
        assert!(text.contains("queue full"));
    }
}
