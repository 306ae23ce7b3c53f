//! Error types for the Phoenix client.
//!
//! Only [`PhoenixError::DuplicateJoin`], [`PhoenixError::ReservedEvent`] and
//! [`PhoenixError::SocketClosed`] are ever returned synchronously from channel
//! calls. Transport failures and malformed frames are absorbed by the socket
//! driver (logged, then reconnect or discard); join rejections and push
//! timeouts reach the application through push callbacks.

use thiserror::Error;

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum PhoenixError {
    /// Transport failure: connection refused, dropped, or send failed.
    #[error("Transport error: {0}")]
    Transport(#[source] anyhow::Error),

    /// An inbound frame did not match the `[join_ref, ref, topic, event, payload]` shape.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The server answered `phx_join` with an `"error"` status.
    #[error("Join rejected for {topic}: {response}")]
    JoinRejected {
        /// Channel topic.
        topic: String,
        /// Response carried by the error reply.
        response: serde_json::Value,
    },

    /// No reply arrived before the push timeout elapsed.
    #[error("Push '{event}' on {topic} timed out")]
    PushTimeout {
        /// Channel topic.
        topic: String,
        /// Event name of the push.
        event: String,
    },

    /// `join` was called while a join is already outstanding or complete.
    #[error("Channel {0} is already joining or joined")]
    DuplicateJoin(String),

    /// The application tried to push a protocol-internal event.
    #[error("Event '{0}' is reserved by the protocol")]
    ReservedEvent(String),

    /// The socket driver has shut down.
    #[error("Socket closed")]
    SocketClosed,

    /// Invalid configuration (endpoint URL, config file).
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using [`PhoenixError`].
pub type Result<T> = std::result::Result<T, PhoenixError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_duplicate_join() {
        let err = PhoenixError::DuplicateJoin("room:lobby".to_string());
        assert_eq!(
            err.to_string(),
            "Channel room:lobby is already joining or joined"
        );
    }

    #[test]
    fn test_display_join_rejected_includes_response() {
        let err = PhoenixError::JoinRejected {
            topic: "room:lobby".to_string(),
            response: serde_json::json!({"reason": "unauthorized"}),
        };
        assert_eq!(
            err.to_string(),
            r#"Join rejected for room:lobby: {"reason":"unauthorized"}"#
        );
    }

    #[test]
    fn test_json_error_converts() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: PhoenixError = parse_err.into();
        assert!(matches!(err, PhoenixError::Json(_)));
    }
}
