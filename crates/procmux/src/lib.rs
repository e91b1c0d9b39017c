use std::os::unix::process::ExitStatusExt;
use std::process::Command;
use tracing::debug;
use tracing_subscriber::EnvFilter;

// Re-export core functionality
pub use procmux_core::*;

pub use nix::sys::signal::Signal;
pub use procmux_unix::{
    CHILD_FAILURE, ChildOutcome, CredentialLookup, DeathCallback, PipeIo, ProcStat, Process,
    ProcessIo, ProcessStatus, PtyIo, UnixProcessManager, is_pipeline, signal_fd,
    split_command_line, split_pipeline, status, which,
};

/// The process manager for the current platform
pub type ProcManager = UnixProcessManager;

/// Platform-independent factory that selects the implementation at compile time
pub struct PlatformProcessManagerFactory;

impl ProcessManagerFactory for PlatformProcessManagerFactory {
    type Manager = procmux_unix::UnixProcessManager;

    fn create_process_manager(config: ManagerConfig) -> Result<Self::Manager> {
        procmux_unix::UnixProcessManagerFactory::create_process_manager(config)
    }

    fn platform_name() -> &'static str {
        procmux_unix::UnixProcessManagerFactory::platform_name()
    }
}

/// Convenience function to create a manager with the default configuration
pub fn create_process_manager() -> Result<ProcManager> {
    PlatformProcessManagerFactory::create_process_manager(ManagerConfig::default())
}

/// Install a `fmt` subscriber filtered by `RUST_LOG`, or by `level` when unset.
/// Does nothing if a global subscriber already exists.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_line_number(true)
        .try_init();
}

/// Run `cmd` with stderr merged into stdout and return its status and output
pub fn getstatusoutput(manager: &ProcManager, cmd: &str) -> Result<(ExitStatus, String)> {
    let process = manager.spawn_pipe(cmd, SpawnOptions::default())?;
    let text = process.read_to_string()?;
    let status = process.wait()?;
    Ok((status, text))
}

/// Run `cmd` to completion, discarding its output
pub fn call(manager: &ProcManager, cmd: &str, options: SpawnOptions) -> Result<ExitStatus> {
    let process = manager.spawn_pipe(cmd, options)?;
    let discarded = process.read_to_end()?.len();
    debug!(pid = process.pid(), "discarded {discarded} bytes of output");
    process.wait()
}

/// Run `cmd` through `/bin/sh -c` outside any manager
pub fn system(cmd: &str) -> Result<ExitStatus> {
    let raw = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .status()
        .map_err(|e| ProcessError::spawn_failed(cmd, e))?
        .into_raw();
    status::from_raw(cmd, raw)
        .ok_or_else(|| ProcessError::InvalidCommand(format!("'{cmd}' produced wait status {raw}")))
}
