use std::fmt;

use crate::config::{ManagerConfig, SpawnOptions};
use crate::error::Result;
use crate::exit_status::ExitStatus;

/// Unique identifier for a process
pub type ProcessId = u32;

/// Transport connecting the supervisor to a child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessKind {
    /// stdin/stdout(/stderr) over anonymous pipes
    Pipe,
    /// A pseudo-terminal that is also the child's controlling terminal
    Pty,
    /// Two commands joined by an internal pipe
    Pipeline,
    /// Forked closure with piped stdio
    Coprocess,
    /// Forked closure sharing the parent's stdio
    Subprocess,
}

impl ProcessKind {
    /// Whether a fresh copy can be spawned from the command line alone
    pub fn is_clonable(self) -> bool {
        matches!(
            self,
            ProcessKind::Pipe | ProcessKind::Pty | ProcessKind::Pipeline
        )
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessKind::Pipe => "pipe",
            ProcessKind::Pty => "pty",
            ProcessKind::Pipeline => "pipeline",
            ProcessKind::Coprocess => "coprocess",
            ProcessKind::Subprocess => "subprocess",
        };
        f.write_str(name)
    }
}

/// Whether `waitproc` may block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitMode {
    #[default]
    Block,
    NoHang,
}

/// Supervisor of child processes: the single owner of the OS wait primitive
/// for the children it spawned.
pub trait ProcessManager: Send + Sync {
    /// Handle to a supervised process
    type Handle;
    /// Signal representation used by the platform
    type Signal: Copy;

    /// Spawn `cmd` connected through pipes; an unquoted `|` selects a pipeline
    fn spawn_pipe(&self, cmd: &str, options: SpawnOptions) -> Result<Self::Handle>;

    /// Spawn `cmd` on a fresh pseudo-terminal
    fn spawn_pty(&self, cmd: &str, options: SpawnOptions) -> Result<Self::Handle>;

    /// Collect the exit status of `handle`.
    ///
    /// Returns `Ok(None)` for a running process when `mode` is [`WaitMode::NoHang`].
    fn waitproc(&self, handle: &Self::Handle, mode: WaitMode) -> Result<Option<ExitStatus>>;

    /// Signal a process without triggering its death callback
    fn kill(&self, handle: &Self::Handle, signal: Self::Signal) -> Result<()>;

    /// Spawn a fresh copy of a process under a new pid
    fn clone_process(&self, handle: &Self::Handle) -> Result<Self::Handle>;

    /// Collect pending child state changes, returning how many were handled
    fn reap(&self) -> usize;

    fn config(&self) -> &ManagerConfig;

    /// Release process-wide resources held by this manager
    fn shutdown(&self);
}

/// Factory trait for creating platform-specific process managers
pub trait ProcessManagerFactory {
    /// The type of process manager this factory creates
    type Manager: ProcessManager;

    /// Create a process manager for the current platform
    fn create_process_manager(config: ManagerConfig) -> Result<Self::Manager>;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clonable_kinds() {
        assert!(ProcessKind::Pipe.is_clonable());
        assert!(ProcessKind::Pty.is_clonable());
        assert!(ProcessKind::Pipeline.is_clonable());
        assert!(!ProcessKind::Coprocess.is_clonable());
        assert!(!ProcessKind::Subprocess.is_clonable());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ProcessKind::Pty.to_string(), "pty");
        assert_eq!(WaitMode::default(), WaitMode::Block);
    }
}
