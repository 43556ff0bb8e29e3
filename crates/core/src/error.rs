//! Failure taxonomy shared by the process, build and recovery crates.
//!
//! A non-zero exit code is never an error here: it travels inside
//! [`CommandResult`](crate::CommandResult). These variants cover the cases
//! where no usable result exists, or where the caller has to decide whether
//! to retry.

use crate::CommandResult;
use std::time::Duration;
use thiserror::Error;

pub type ToolResult<T> = std::result::Result<T, ToolError>;

#[derive(Debug, Error)]
pub enum ToolError {
    /// Tool binary missing or not executable. Never retried.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("compile failed with {errors} error(s)")]
    Compile { errors: usize },

    #[error("upload failed: {0}")]
    Upload(String),

    /// The user has to reconnect hardware.
    #[error("port not found: {0}")]
    PortNotFound(String),

    /// Whatever output was captured before the kill is kept in `partial`.
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: String,
        after: Duration,
        partial: Option<Box<CommandResult>>,
    },

    /// A maintenance passthrough the tool itself reported as failed.
    #[error("{command} failed: {message}")]
    Command { command: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),
}

impl ToolError {
    /// Fatal errors must reach a human instead of another automatic attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ToolError::Spawn { .. } | ToolError::PortNotFound(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ToolError::Timeout { .. })
    }

    pub fn partial_output(&self) -> Option<&CommandResult> {
        match self {
            ToolError::Timeout { partial, .. } => partial.as_deref(),
            _ => None,
        }
    }
}
