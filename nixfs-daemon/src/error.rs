//! Error types for daemon sessions.

/// Result type alias for daemon session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while talking to the Nix daemon.
///
/// Everything here is fatal to the session: the protocol offers no way to
/// resynchronize a stream once framing has been lost, so callers tear the
/// connection down and report the failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket or stream I/O failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The server's greeting did not carry the expected magic word.
    #[error("invalid daemon magic: {magic:#x}")]
    InvalidMagic {
        /// The word received instead of the server magic.
        magic: u64,
    },

    /// A string frame held bytes that are not valid UTF-8.
    #[error("malformed string in protocol frame: {0}")]
    MalformedString(#[from] std::string::FromUtf8Error),

    /// A stderr frame carried a tag this client does not interpret.
    #[error("unexpected stderr message tag: {tag:#x}")]
    UnexpectedStderr {
        /// The unrecognized tag word.
        tag: u64,
    },

    /// The daemon reported a failure while processing a request.
    #[error("daemon error: {message}")]
    Daemon {
        /// The daemon's rendered error message.
        message: String,
    },

    /// `query-path-info` found no valid info for the given store path.
    #[error("no valid path info for {path:?}")]
    InvalidPathInfo {
        /// The store path that was queried.
        path: String,
    },
}
