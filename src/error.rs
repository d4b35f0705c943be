use serde_json::{Value, json};

/// Errors surfaced through socket acks or connection teardown. Handler-local
/// variants are converted into typed ack payloads; the rest propagate.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Authentication failed")]
    AuthFailed,

    #[error("Authentication timed out")]
    AuthTimeout,

    #[error("Invalid room password")]
    InvalidRoomPassword,

    #[error("User is banned from this room")]
    Banned,

    #[error("Peer is not in a room")]
    NotInRoom,

    #[error("No upstream transport")]
    NoUpstream,

    #[error("No media workers available")]
    NoWorkersAvailable,

    #[error("cannotConsume")]
    CannotConsume,

    #[error("Downstream transport not found")]
    DownstreamNotFound,

    #[error("Consumer not found")]
    ConsumerNotFound,

    #[error("RESOURCE_BUSY")]
    LockBusy,

    #[error("Lock aborted")]
    LockAborted,

    #[error("{0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Store(#[from] redis::RedisError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// Ack payload shape per error kind. Consume-path misses keep their
    /// legacy string acks; everything else is `{error}` or `{ok,error}`.
    pub fn ack_payload(&self) -> Value {
        match self {
            GatewayError::CannotConsume => json!("cannotConsume"),
            GatewayError::DownstreamNotFound => json!("consumeFailed"),
            GatewayError::ConsumerNotFound => json!("consumerNotFound"),
            GatewayError::LockBusy => json!({"ok": false, "error": "RESOURCE_BUSY"}),
            GatewayError::InvalidPayload(msg) => json!({"success": false, "error": msg}),
            other => json!({"error": other.to_string()}),
        }
    }

    /// True when the error ends the connection rather than a single request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::AuthFailed
                | GatewayError::AuthTimeout
                | GatewayError::Store(_)
                | GatewayError::LockAborted
        )
    }
}

/// Errors from SFU operations.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("Room {0} not found")]
    RoomNotFound(String),

    #[error("Peer not found on socket")]
    PeerNotFound,

    #[error("Transport not found")]
    TransportNotFound,

    #[error("Producer {0} not found")]
    ProducerNotFound(String),

    #[error("SFU request failed: {0}")]
    Sfu(String),
}

/// Errors local to the audio side-tap; they are logged and never disturb the
/// live media path.
#[derive(Debug, thiserror::Error)]
pub enum SideTapError {
    #[error("No consecutive RTP/RTCP port pair available")]
    NoPortPairs,

    #[error("Segmenter spawn failed: {0}")]
    Segmenter(String),

    #[error("Transcription failed: {0}")]
    Transcription(String),

    #[error("Transcription timed out")]
    TranscriptionTimeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Media(#[from] MediaError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_misses_keep_string_acks() {
        assert_eq!(GatewayError::CannotConsume.ack_payload(), json!("cannotConsume"));
        assert_eq!(GatewayError::DownstreamNotFound.ack_payload(), json!("consumeFailed"));
        assert_eq!(GatewayError::ConsumerNotFound.ack_payload(), json!("consumerNotFound"));
    }

    #[test]
    fn busy_lock_acks_resource_busy() {
        assert_eq!(
            GatewayError::LockBusy.ack_payload(),
            json!({"ok": false, "error": "RESOURCE_BUSY"})
        );
    }

    #[test]
    fn auth_errors_are_fatal() {
        assert!(GatewayError::AuthFailed.is_fatal());
        assert!(GatewayError::AuthTimeout.is_fatal());
        assert!(!GatewayError::InvalidRoomPassword.is_fatal());
        assert!(!GatewayError::CannotConsume.is_fatal());
    }
}
