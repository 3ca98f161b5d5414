//! Crate-level error type.
//!
//! Every variant carries enough context (operation target plus the
//! underlying cause) to diagnose a failure from the log line alone.

use thiserror::Error;

/// Errors produced by the stats pusher.
#[derive(Error, Debug)]
pub enum PushError {
    /// A TCP/HTTP-level failure while talking to the bridge.
    #[error("fetch from {url} failed: {detail}")]
    Fetch { url: String, detail: String },

    /// The bridge replied with a non-2xx status code.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// The bridge body was not JSON or lacked the expected shape.
    #[error("malformed stats document: {detail}")]
    Document { detail: String },

    /// Websocket handshake, write or keepalive failure.
    #[error("transport error on {url}: {detail}")]
    Transport { url: String, detail: String },

    /// The bridge log file could not be opened or read.
    #[error("log tail error on {path}: {detail}")]
    LogTail { path: String, detail: String },

    /// An invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias using [`PushError`].
pub type Result<T> = std::result::Result<T, PushError>;
