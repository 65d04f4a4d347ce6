//! Typed errors for the execution engine
//!
//! Translation problems, job table lookups and engine-loop failures surface
//! as [`EngineError`]. Failures of a running command never do: they become
//! an exit status on the job that hit them.

use thiserror::Error;

/// Status a job reports when it could not be launched at all.
pub const DEFAULT_FAILED_STATUS: i32 = 127;

/// Status given to a step whose construct could not be translated.
pub const MALFORMED_STATUS: i32 = 2;

#[derive(Error, Debug)]
pub enum EngineError {
    /// A construct the translator refuses (bad assignment word, multi-command
    /// substitution, unsupported substitution body)
    #[error("malformed construct: {0}")]
    Malformed(String),

    #[error("{0}: no such job")]
    UnknownJob(usize),

    #[error("{0}: invalid job specification")]
    InvalidJobSpec(String),

    #[error("{name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Waiting on a hub that has no way left to complete
    #[error("engine stalled: no pending work can complete the awaited executor")]
    Stalled,

    #[error("unknown notification hub {0}")]
    Hub(usize),
}

impl EngineError {
    pub fn malformed(message: impl Into<String>) -> Self {
        EngineError::Malformed(message.into())
    }

    /// Status a step reports when this error aborted it
    pub fn status(&self, failed_status: i32) -> i32 {
        match self {
            EngineError::Malformed(_) => MALFORMED_STATUS,
            EngineError::Spawn { .. } => failed_status,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
