//! Error types for egs-core.

use thiserror::Error;

/// Main error type for guest services operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation or unexpected frame.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Codec error during frame encoding/decoding.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// Malformed channel-request payload.
    #[error("malformed request payload: {message}")]
    Wire { message: String },

    /// Authentication failed.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer rejected a channel request.
    #[error("channel request rejected: {request_type}")]
    ChannelRejected { request_type: String },

    /// Channel error.
    #[error("channel error: {message}")]
    Channel { message: String },

    /// A forwarder or PTY was started twice.
    #[error("already started")]
    AlreadyStarted,

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// PTY error.
    #[error("pty error: {message}")]
    Pty { message: String },

    /// File transfer error.
    #[error("file transfer error: {message}")]
    FileTransfer { message: String },

    /// Socket transport error.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Invalid socket address or service identifier.
    #[error("invalid address: {message}")]
    Address { message: String },

    /// Operation not supported on this platform.
    #[error("unsupported: {message}")]
    Unsupported { message: String },
}

impl Error {
    /// Returns true if this error is transient and a new connection may help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::ConnectionClosed | Error::Timeout | Error::Io(_)
        )
    }

    /// Returns true if this error is fatal to the session or process.
    ///
    /// Fatal errors are surfaced to the process owner and never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::AuthenticationFailed
                | Error::Protocol { .. }
                | Error::Address { .. }
                | Error::Unsupported { .. }
        )
    }
}

/// Convenience result type for guest services operations.
pub type Result<T> = std::result::Result<T, Error>;
