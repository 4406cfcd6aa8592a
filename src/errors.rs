//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Malformed target id, region, profile, host or port. Never retried.
    Validation(String),
    /// No free local port was found within the probe budget.
    NoFreePort(String),
    /// The launcher was spawned but no matching OS process appeared.
    PidDiscovery(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Spawning or signalling an OS process failed.
    Process(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Stable, caller-facing error code.
    ///
    /// Lets the API layer tell capacity exhaustion (retry with other
    /// parameters) apart from discovery failure (retry as-is).
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG",
            Self::Db(_) => "STORE",
            Self::Validation(_) => "INVALID_TARGET",
            Self::NoFreePort(_) => "NO_FREE_PORT",
            Self::PidDiscovery(_) => "PID_DISCOVERY_FAILED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Process(_) => "PROCESS",
            Self::Io(_) => "IO",
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::NoFreePort(msg) => write!(f, "no free port: {msg}"),
            Self::PidDiscovery(msg) => write!(f, "pid discovery: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Process(msg) => write!(f, "process: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Db(format!("invalid stored value: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
