//! Error types returned by replay requests and raw transports.
use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level replay error.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid request parameters. Raised before any data is fetched.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Failure of the raw transport, surfaced as-is to the caller.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Frame checksum did not match its payload.
    #[error("CRC mismatch in {path} at frame {frame}: file={expected:#x}, calc={actual:#x}")]
    CorruptFrame {
        path: String,
        frame: usize,
        expected: u32,
        actual: u32,
    },

    #[error("frame decode in {path}: {source}")]
    Codec {
        path: String,
        #[source]
        source: bincode::Error,
    },

    #[error("format {0:?} is not supported by this transport")]
    UnsupportedFormat(crate::transport::Format),

    /// The cancellation context was cancelled.
    #[error("replay cancelled")]
    Cancelled,

    #[error("fetch worker panicked")]
    WorkerPanicked,
}

/// A schema or message payload could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message line from '{exchange}' has no channel")]
    MissingChannel { exchange: String },

    #[error("definition for {exchange}/{channel}: {source}")]
    Definition {
        exchange: String,
        channel: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("message for {exchange}/{channel}: {source}")]
    Message {
        exchange: String,
        channel: String,
        #[source]
        source: serde_json::Error,
    },

    /// A field value does not fit the type tag its definition declares.
    #[error("field '{field}' declared '{field_type}': {reason}")]
    Coercion {
        field: String,
        field_type: String,
        reason: String,
    },
}
