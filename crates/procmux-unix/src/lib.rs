mod command;
mod coprocess;
mod exec;
mod fd;
mod manager;
mod pipe;
mod pipeline;
mod process;
mod pty;
mod signals;
mod stat;
pub mod status;
mod user;

pub use command::{is_pipeline, split_command_line, split_pipeline, which};
pub use coprocess::{CHILD_FAILURE, ChildOutcome};
pub use manager::UnixProcessManager;
pub use pipe::PipeIo;
pub use process::{DeathCallback, Process, ProcessIo};
pub use pty::PtyIo;
pub use signals::signal_fd;
pub use stat::{ProcStat, ProcessStatus};
pub use user::CredentialLookup;

use procmux_core::{ManagerConfig, ProcessManagerFactory, Result};

pub struct UnixProcessManagerFactory;

impl ProcessManagerFactory for UnixProcessManagerFactory {
    type Manager = UnixProcessManager;

    fn create_process_manager(config: ManagerConfig) -> Result<UnixProcessManager> {
        UnixProcessManager::new(config)
    }

    fn platform_name() -> &'static str {
        "Unix"
    }
}
