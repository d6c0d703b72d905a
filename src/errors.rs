//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
///
/// An unknown task name and a transport rejecting its arguments (bad port,
/// unreachable host) are intentionally absent: the first falls back to `run`,
/// the second surfaces only as stderr text and a non-zero status.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing, loading, or override failure.
    Config(String),
    /// The local shell or the transport binary could not be started.
    Spawn(String),
    /// A process stream became unusable mid-read.
    Stream(String),
    /// A scope was exited out of order or twice.
    Scope(String),
    /// Task arguments could not be interpreted.
    Task(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Stream(msg) => write!(f, "stream: {msg}"),
            Self::Scope(msg) => write!(f, "scope: {msg}"),
            Self::Task(msg) => write!(f, "task: {msg}"),
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

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
