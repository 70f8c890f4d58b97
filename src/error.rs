use thiserror::Error;

use crate::Role;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error taxonomy. Statistics and Domain errors are per-round
/// local (logged and nullified); Timeout/Transport abort a calibration;
/// Persistence rolls back the whole record.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{role} photometer timeout: {reason}")]
    Timeout { role: Role, reason: String },

    #[error("{role} photometer transport error: {reason}")]
    Transport { role: Role, reason: String },

    #[error("statistics error: {0}")]
    Statistics(String),

    #[error("domain error: freq {freq} Hz not above freq offset {freq_offset} Hz")]
    Domain { freq: f64, freq_offset: f64 },

    #[error("batch state error: {0}")]
    BatchState(String),

    #[error("database error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("missing config value [{section}] {property}")]
    MissingConfig { section: String, property: String },

    #[error("bad config value [{section}] {property} = {value:?}: {reason}")]
    InvalidConfig {
        section: String,
        property: String,
        value: String,
        reason: String,
    },

    #[error("bad timestamp {0:?}")]
    Timestamp(String),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn timeout(role: Role, reason: impl Into<String>) -> Self {
        Error::Timeout {
            role,
            reason: reason.into(),
        }
    }

    pub fn transport(role: Role, reason: impl Into<String>) -> Self {
        Error::Transport {
            role,
            reason: reason.into(),
        }
    }

    /// True for the failure classes that abort a calibration outright.
    pub fn is_fatal_to_calibration(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::Transport { .. })
    }
}
