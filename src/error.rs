//! WolfSync Error Types

use thiserror::Error;

/// Result type alias for WolfSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Storage errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error on {member}: {reason}")]
    Storage { member: String, reason: String },

    #[error("Member unavailable: {0}")]
    MemberUnavailable(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Operation not supported by {member}: {operation}")]
    UnsupportedOperation { member: String, operation: String },

    // Cluster errors
    #[error("Member not found: {0}")]
    MemberNotFound(String),

    #[error("No template member available in cluster {0}")]
    NoTemplate(String),

    #[error("Queue for {0} is closed")]
    QueueClosed(String),

    #[error("Synchronization of {member} failed: {reason}")]
    Sync { member: String, reason: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Build a storage error for a member
    pub fn storage(member: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Storage {
            member: member.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error means the member could not be reached at all
    pub fn is_member_unavailable(&self) -> bool {
        match self {
            Error::MemberUnavailable(_) => true,
            Error::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            _ => false,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.is_member_unavailable() || matches!(self, Error::QueueClosed(_))
    }
}
