//! Error taxonomy for the analyzer.
//!
//! Tool and i/o failures abort the enclosing batch call. A closed transport
//! is normal shutdown, not a fault. Phase-ordering violations are programmer
//! errors and fail fast via `assert!` rather than appearing here; a string
//! literal with no match in the final binary is an expected outcome and is
//! not an error at all.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// An external tool exited non-zero or produced unusable output.
    #[error("{tool} failed on {context}: {message}")]
    Tool {
        tool: String,
        context: String,
        message: String,
    },

    /// A static archive could not be read or parsed.
    #[error("archive {path}: {message}")]
    Archive { path: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The control channel to the delegate closed. Normal during shutdown.
    #[error("transport closed")]
    TransportClosed,

    /// A malformed or unexpected control-channel frame.
    #[error("protocol frame error: {0}")]
    Frame(String),

    #[error("frame payload: {0}")]
    Codec(#[from] serde_json::Error),

    /// The worker pool could not be constructed.
    #[error("worker pool: {0}")]
    Pool(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a `Tool` error from an invocation context.
    pub(crate) fn tool(tool: &str, context: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.to_string(),
            context: context.into(),
            message: message.into(),
        }
    }
}
