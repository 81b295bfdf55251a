//! Core error types for portwarden

use pw_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the operations the supervisor retries
#[derive(Error, Debug)]
pub enum PwError {
    /// Protocol error (tag mismatch, non-success result, malformed body)
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Remote service error
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Interface lookup error
    #[error("Interface error: {0}")]
    Interface(#[from] InterfaceError),

    /// Client settings file error
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network or API failure talking to a remote endpoint
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Transport-level failure
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Endpoint answered with an unexpected status
    #[error("Unexpected HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    /// The client asked for a session id but did not provide one
    #[error("Session id handshake failed: missing {0} header")]
    MissingSessionId(&'static str),
}

/// Interface address lookup errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    /// No interface with that name
    #[error("Interface not found: {0}")]
    NotFound(String),

    /// Interface exists but has no assigned address
    #[error("Interface {0} has no addresses")]
    NoAddress(String),

    /// Address could not be parsed
    #[error("Invalid interface address: {0}")]
    InvalidAddress(String),

    /// Lookup failed at the OS level
    #[error("Interface lookup failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Client settings file errors
#[derive(Error, Debug)]
pub enum SettingsError {
    /// Settings file could not be read
    #[error("Failed to read settings {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Settings file could not be written back
    #[error("Failed to write settings {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Settings file is not valid JSON
    #[error("Failed to parse settings {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Settings file is JSON but not an object
    #[error("Settings {0:?} is not a JSON object")]
    NotAnObject(PathBuf),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
