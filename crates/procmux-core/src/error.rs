use std::io;
use thiserror::Error;

use crate::ProcessId;

/// Error types for process supervision
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("I/O operation on closed process")]
    BadDescriptor,

    #[error("ExitStatus: '{command}' did not exit normally")]
    NotExitedNormally { command: String },

    #[error("pid {0} is not managed")]
    Unmanaged(ProcessId),

    #[error("Invalid command line: {0}")]
    InvalidCommand(String),

    #[error("which: no '{0}' found in $PATH")]
    CommandNotFound(String),

    #[error("Process cannot be cloned: {0}")]
    NotClonable(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ProcessError {
    /// Wrap an OS error raised while creating `command`
    pub fn spawn_failed(command: impl Into<String>, source: impl Into<io::Error>) -> Self {
        ProcessError::SpawnFailed {
            command: command.into(),
            source: source.into(),
        }
    }

    /// The underlying OS error code, if this error carries one
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            ProcessError::SpawnFailed { source, .. } | ProcessError::Io(source) => {
                source.raw_os_error()
            }
            _ => None,
        }
    }

    /// Check if the operation can simply be attempted again
    pub fn is_retryable(&self) -> bool {
        match self {
            ProcessError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Check if this error indicates a permanent failure
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ProcessError::BadDescriptor
                | ProcessError::NotExitedNormally { .. }
                | ProcessError::Unmanaged(_)
                | ProcessError::InvalidCommand(_)
                | ProcessError::CommandNotFound(_)
                | ProcessError::NotClonable(_)
                | ProcessError::Configuration(_)
        )
    }
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;
