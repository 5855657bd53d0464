use b_x::BX;

use crate::h2::SessionError;

/// Errors that end a single connection. The acceptor logs them and tears
/// the connection down; they never reach other connections.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// Reading from or writing to the peer failed
    #[error("connection i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The TLS engine rejected the peer's records
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// The handshake negotiated a protocol nobody registered, and there is
    /// no default entry to fall back to
    #[error("no handler registered for protocol {0:?}")]
    NoProtocol(String),

    /// The HTTP/2 framing engine gave up on the connection
    #[error("http/2 session error: {0}")]
    H2(#[from] SessionError),
}

impl From<ServeError> for BX {
    fn from(e: ServeError) -> Self {
        BX::from_err(e)
    }
}
