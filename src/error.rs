//! Error types for the stream router.

use std::path::PathBuf;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Stream router error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed transport parameters, raised before any I/O
    #[error("Settings error: {0}")]
    Settings(String),

    /// The active transport has not been configured enough to connect
    #[error("Missing settings: {0}")]
    MissingSettings(String),

    /// The serial port is held by another process
    #[error("Serial port {0} is already in use")]
    PortInUse(String),

    /// The serial device does not exist
    #[error("Serial port {0} not found")]
    PortNotFound(String),

    /// DNS, socket or bind failure
    #[error("Connection error: {0}")]
    Connect(String),

    /// The NTRIP caster answered 401; carries the caster's response body
    #[error("NTRIP authentication failed: {0}")]
    Authentication(String),

    /// Source table retrieval failed
    #[error("Source table error: {0}")]
    SourceTable(String),

    /// Startup or shutdown script could not be read
    #[error("Cannot read script file {path}: {source}")]
    ScriptFile {
        /// Script path
        path: PathBuf,
        /// Underlying I/O failure
        source: std::io::Error,
    },

    /// Traffic log could not be opened or written
    #[error("Cannot open log file {path}: {source}")]
    LogFile {
        /// Log path
        path: PathBuf,
        /// Underlying I/O failure
        source: std::io::Error,
    },

    /// Opening the transport of a stream failed
    #[error("Stream {id} failed to open connection: {source}")]
    OpenConnection {
        /// Stream id
        id: usize,
        /// What went wrong
        source: Box<Error>,
    },

    /// Fault raised while starting or running a stream worker
    #[error("Stream worker error: {0}")]
    StreamThread(String),

    /// Closing a transport failed
    #[error("Error while closing connection: {0}")]
    Closing(String),

    /// Disconnecting a stream failed; the stream is disconnected regardless
    #[error("Error while disconnecting stream {id}: {reason}")]
    Disconnect {
        /// Stream id
        id: usize,
        /// What went wrong
        reason: String,
    },

    /// Bad configuration line or file
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
