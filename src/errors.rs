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
    /// Channel connect/send/sync failure.
    Channel(String),
    /// Agent process spawn, stream, or protocol failure.
    Agent(String),
    /// Sandbox engine preparation or cleanup failure.
    Sandbox(String),
    /// Requested mount denied by the mount policy.
    MountRejected(String),
    /// Filesystem IPC request failure.
    Ipc(String),
    /// Workspace is not allowed to perform the requested action.
    Unauthorized(String),
    /// Invalid cron expression, interval, or one-shot timestamp.
    Schedule(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Channel(msg) => write!(f, "channel: {msg}"),
            Self::Agent(msg) => write!(f, "agent: {msg}"),
            Self::Sandbox(msg) => write!(f, "sandbox: {msg}"),
            Self::MountRejected(msg) => write!(f, "mount rejected: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::Schedule(msg) => write!(f, "schedule: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
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

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Ipc(format!("invalid json: {err}"))
    }
}
