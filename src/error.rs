use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failures of the streaming request engine and its port bridge.
///
/// Every variant except `ContentLengthTooLarge` and `Serialize` is fatal to an
/// in-flight request and ends up as a single `FAILED` status on the port side.
#[derive(Debug, Error)]
pub enum Error {
    #[error("name resolution failed: {0}")]
    Resolve(io::Error),

    #[error("name resolution timed out after {0:?}")]
    ResolveTimeout(Duration),

    #[error("connect failed: {0}")]
    Connect(io::Error),

    #[error("tls handshake failed: {0}")]
    Handshake(io::Error),

    #[error("write failed: {0}")]
    Write(io::Error),

    #[error("read failed: {0}")]
    Read(io::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request prelude does not fit in {0} bytes")]
    PreludeOverflow(usize),

    #[error("content length {0} exceeds maximum {1}")]
    ContentLengthTooLarge(u32, u16),

    #[error("tls setup failed: {0}")]
    Tls(String),

    #[error("request body serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Error {
    /// Whether a transport error only means "try again on the next poll".
    pub(crate) fn is_would_block(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        )
    }
}
