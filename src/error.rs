use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),

    #[error("transport closed")]
    TransportClosed,

    #[error("transport i/o: {0}")]
    TransportIo(String),

    #[error("operation timed out")]
    Timeout,

    #[error("protocol frame: {0}")]
    ProtocolFrame(String),

    #[error("event id does not match hashed contents")]
    InvalidEventId,

    #[error("invalid event signature")]
    InvalidSignature,

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("rate limited")]
    RateLimited,

    #[error("server error (status {0})")]
    ServerError(u16),

    #[error("rejected by relay: {0}")]
    Rejected(String),

    #[error("signer error: {0}")]
    Signer(String),

    #[error("downloaded blob does not match its hash")]
    BlobHashMismatch,

    /// Soft condition: eviction from the signature cache is logged and
    /// handled internally, never returned to callers.
    #[error("signature cache full")]
    CacheFull,

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map a relay `OK false` machine-readable message onto an error kind.
    ///
    /// NIP-01 prefixes the human message with a machine-readable word
    /// (`rate-limited:`, `auth-required:`, ...).
    pub(crate) fn from_ok_message(message: &str) -> Self {
        let prefix = message.split(':').next().unwrap_or_default();
        match prefix {
            "rate-limited" => Error::RateLimited,
            "auth-required" | "restricted" => Error::Unauthorized,
            _ => Error::Rejected(message.to_string()),
        }
    }
}
