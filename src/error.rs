use thiserror::Error;

#[derive(Error, Debug)]
pub enum NsqError {
    #[error("Connect error to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("Identify error: {0}")]
    Identify(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Discovery error from {endpoint}: {reason}")]
    Discovery { endpoint: String, reason: String },

    #[error("Message response error: {0}")]
    MessageResponse(String),

    #[error("Discard threshold reached after {attempts} attempts")]
    DiscardThresholdReached { attempts: u16 },

    #[error("Message {id} already responded")]
    AlreadyResponded { id: String },

    #[error("Daemon error: {code} {message}")]
    Daemon { code: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Timeout error after {0}ms")]
    Timeout(u64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NsqError {
    /// Transport and discovery failures are recovered by retrying later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NsqError::Connect { .. }
                | NsqError::Identify(_)
                | NsqError::Discovery { .. }
                | NsqError::Timeout(_)
                | NsqError::Io(_)
        )
    }

    /// Whether a daemon error frame tears down the connection.
    ///
    /// The `*_FAILED` codes only concern a single message or publish; every
    /// other daemon error closes the connection.
    pub fn is_fatal(&self) -> bool {
        match self {
            NsqError::Daemon { code, .. } => !matches!(
                code.as_str(),
                "E_FIN_FAILED"
                    | "E_REQ_FAILED"
                    | "E_TOUCH_FAILED"
                    | "E_PUB_FAILED"
                    | "E_MPUB_FAILED"
                    | "E_DPUB_FAILED"
            ),
            NsqError::ConnectionClosed
            | NsqError::Protocol(_)
            | NsqError::Tls(_)
            | NsqError::Compression(_)
            | NsqError::Io(_) => true,
            _ => false,
        }
    }

    /// Parses the body of an error frame, e.g. `E_BAD_TOPIC invalid topic name`.
    pub(crate) fn from_daemon_frame(body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(body);
        let text = text.trim();
        match text.split_once(' ') {
            Some((code, message)) => NsqError::Daemon {
                code: code.to_string(),
                message: message.to_string(),
            },
            None => NsqError::Daemon {
                code: text.to_string(),
                message: String::new(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, NsqError>;
