use thiserror::Error;

/// Errors produced by the client engine.
///
/// Connection-fatal variants (`ProtocolDecode`, `Transport`,
/// `ConnectionClosed`) are broadcast to every pending operation, so the
/// type is `Clone`. Everything else is scoped to a single operation.
#[derive(Debug, Clone, Error)]
pub enum LdapError {
    /// Write attempted while the connection is not in a writable state.
    #[error("transport unavailable")]
    TransportUnavailable,

    /// Malformed bytes on the stream. Fatal: BER framing cannot resynchronize.
    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),

    /// The server closed the stream (or unbind shutdown completed).
    #[error("connection closed")]
    ConnectionClosed,

    /// I/O failure on the underlying stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// A deadline-bounded wait expired. The operation stays registered.
    #[error("operation timed out")]
    TimedOut,

    /// The operation was abandoned by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// The server reported a different or missing VLV context id.
    #[error("virtual list view context lost")]
    VlvContextLost,

    /// Search filter string could not be parsed.
    #[error("invalid search filter: {0}")]
    InvalidFilter(String),

    /// A well-formed response with a failure result code, raised only by
    /// the `LdapResult::success` convenience. One failed operation never
    /// affects the connection.
    #[error("server error (rc={rc}): {text}")]
    ServerError {
        rc: i32,
        matched: String,
        text: String,
    },
}

impl From<std::io::Error> for LdapError {
    fn from(e: std::io::Error) -> Self {
        LdapError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LdapError>;
