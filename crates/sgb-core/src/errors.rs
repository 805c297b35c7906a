/// Core error type for the bot.
///
/// Adapter crates map their specific errors into this type so the worker loops
/// can tell a retryable failure (transport, store, peer) from a business-rule
/// rejection that goes back to the caller as-is.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no peer reply for {action}")]
    DeliveryTimeout { action: String },

    #[error("peer error {code}: {description}")]
    Peer { code: i64, description: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("bad data: {0}")]
    BadData(String),

    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("forbidden")]
    Forbidden,

    #[error("conversation members checksum invalid")]
    ChecksumMismatch,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

/// Peer error code the bus uses for requests that must not be repeated.
pub const FORBIDDEN_CODE: i64 = 403;

/// Peer error code for a recipient session checksum that no longer matches.
pub const CHECKSUM_INVALID_CODE: i64 = 20140;

impl Error {
    /// True when the peer rejected the request outright.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Error::Forbidden)
            || matches!(self, Error::Peer { code, .. } if *code == FORBIDDEN_CODE)
    }

    /// Typed form of a peer error envelope.
    pub fn from_peer(code: i64, description: impl Into<String>) -> Self {
        match code {
            CHECKSUM_INVALID_CODE => Error::ChecksumMismatch,
            _ => Error::Peer {
                code,
                description: description.into(),
            },
        }
    }

    /// Whether the enclosing loop may repeat the same logical call.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_)
            | Error::DeliveryTimeout { .. }
            | Error::Store(_)
            | Error::Io(_)
            | Error::External(_) => true,
            Error::Peer { code, .. } => *code != FORBIDDEN_CODE,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_peer_errors_are_final() {
        let e = Error::Peer {
            code: 403,
            description: "Forbidden".to_string(),
        };
        assert!(e.is_forbidden());
        assert!(!e.is_retryable());

        let e = Error::Peer {
            code: 500,
            description: "Internal".to_string(),
        };
        assert!(!e.is_forbidden());
        assert!(e.is_retryable());
    }

    #[test]
    fn checksum_code_maps_to_its_own_variant() {
        let e = Error::from_peer(CHECKSUM_INVALID_CODE, "Conversation checksum invalid");
        assert!(matches!(e, Error::ChecksumMismatch));
        assert!(!e.is_retryable());
        assert!(matches!(
            Error::from_peer(500, "Internal"),
            Error::Peer { code: 500, .. }
        ));
    }

    #[test]
    fn business_errors_are_not_retried() {
        assert!(!Error::InsufficientBalance.is_retryable());
        assert!(!Error::BadData("x".to_string()).is_retryable());
        assert!(Error::DeliveryTimeout {
            action: "LIST_PENDING_MESSAGES".to_string()
        }
        .is_retryable());
    }
}
