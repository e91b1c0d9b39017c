use procmux_core::{ExitStatus, ProcessId};
use std::fmt;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Snapshot of a live process as seen by the operating system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: ProcessId,
    pub name: String,
    pub state: String,
    pub parent: Option<ProcessId>,
    /// Resident memory in bytes
    pub memory: u64,
    /// Seconds since the process started
    pub run_time: u64,
}

impl ProcStat {
    pub fn for_pid(pid: ProcessId) -> Option<ProcStat> {
        let mut system = System::new();
        let target = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        let process = system.process(target)?;
        Some(ProcStat {
            pid,
            name: process.name().to_string_lossy().into_owned(),
            state: process.status().to_string(),
            parent: process.parent().map(|parent| parent.as_u32()),
            memory: process.memory(),
            run_time: process.run_time(),
        })
    }
}

impl fmt::Display for ProcStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:6} ({}) {}", self.pid, self.state, self.name)
    }
}

/// Either live statistics or the final status of a process
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessStatus {
    Running(ProcStat),
    Exited(ExitStatus),
    /// Alive as far as the manager knows, but not visible to the OS query
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_of_self() {
        let stat = ProcStat::for_pid(std::process::id()).unwrap();
        assert_eq!(stat.pid, std::process::id());
        assert!(!stat.name.is_empty());
        assert!(stat.to_string().contains(&stat.name));
    }

    #[test]
    fn test_stat_of_missing_pid() {
        assert!(ProcStat::for_pid(u32::MAX - 1).is_none());
    }
}
