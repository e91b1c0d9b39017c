use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{ProcessError, Result};

/// How a child process changed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitState {
    /// Exited normally with an exit code
    Exited,
    /// Stopped by a job-control signal
    Stopped,
    /// Terminated by a signal
    Signaled,
}

/// Decoded termination status of a child process.
///
/// Evaluates as successful only if the process exited normally with code 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    cmdline: String,
    state: ExitState,
    status: i32,
}

impl ExitStatus {
    pub fn exited(cmdline: impl Into<String>, code: i32) -> Self {
        Self::new(cmdline, ExitState::Exited, code)
    }

    pub fn stopped(cmdline: impl Into<String>, signal: i32) -> Self {
        Self::new(cmdline, ExitState::Stopped, signal)
    }

    pub fn signaled(cmdline: impl Into<String>, signal: i32) -> Self {
        Self::new(cmdline, ExitState::Signaled, signal)
    }

    fn new(cmdline: impl Into<String>, state: ExitState, status: i32) -> Self {
        Self {
            cmdline: cmdline.into(),
            state,
            status,
        }
    }

    pub fn state(&self) -> ExitState {
        self.state
    }

    /// Raw pair of state and code-or-signal
    pub fn status(&self) -> (ExitState, i32) {
        (self.state, self.status)
    }

    pub fn cmdline(&self) -> &str {
        &self.cmdline
    }

    pub fn is_exited(&self) -> bool {
        self.state == ExitState::Exited
    }

    pub fn is_stopped(&self) -> bool {
        self.state == ExitState::Stopped
    }

    pub fn is_signalled(&self) -> bool {
        self.state == ExitState::Signaled
    }

    /// Exit code of a normally exited process
    pub fn code(&self) -> Result<i32> {
        match self.state {
            ExitState::Exited => Ok(self.status),
            _ => Err(ProcessError::NotExitedNormally {
                command: self.name().to_string(),
            }),
        }
    }

    /// Stop or termination signal number, if any
    pub fn signal(&self) -> Option<i32> {
        match self.state {
            ExitState::Exited => None,
            ExitState::Stopped | ExitState::Signaled => Some(self.status),
        }
    }

    pub fn success(&self) -> bool {
        self.state == ExitState::Exited && self.status == 0
    }

    /// Basename of the program named by the command line
    pub fn name(&self) -> &str {
        let program = self.cmdline.split_whitespace().next().unwrap_or("");
        Path::new(program)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(program)
    }
}

impl TryFrom<&ExitStatus> for i32 {
    type Error = ProcessError;

    fn try_from(status: &ExitStatus) -> Result<i32> {
        status.code()
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        match self.state {
            ExitState::Exited if self.status == 0 => write!(f, "{name}: Exited normally."),
            ExitState::Exited => write!(
                f,
                "{name}: Exited abnormally with status {}.",
                self.status
            ),
            ExitState::Stopped => write!(f, "{name} is stopped."),
            ExitState::Signaled => write!(f, "{name} exited by signal {}.", self.status),
        }
    }
}
