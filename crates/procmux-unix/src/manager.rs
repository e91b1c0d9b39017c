//! The process manager: spawning, child-state reaping and restarts.
//!
//! Every spawned child is recorded in a live table keyed by pid. Reaping
//! only ever waits on those pids, so children created elsewhere in the
//! program are left alone. A reaped pid moves to the graveyard until a
//! waiter collects it, or until its death is handled after every handle
//! to the process was dropped.

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use parking_lot::{Mutex, RwLock};
use procmux_core::{
    ExitStatus, ManagerConfig, NullPoller, Poller, ProcessError, ProcessId, ProcessKind,
    ProcessManager, Result, SpawnOptions, WaitMode,
};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

use crate::command;
use crate::coprocess::{self, ChildOutcome, ChildSetup, Forked};
use crate::pipe::{self, StdioPipes};
use crate::pipeline;
use crate::process::{DeathCallback, Process, Spawned};
use crate::pty;
use crate::signals::{self, ChildSignalGuard, SignalRegistration};
use crate::stat::ProcessStatus;
use crate::status;

#[derive(Default)]
struct Tables {
    live: HashMap<ProcessId, Arc<Process>>,
    graveyard: HashMap<ProcessId, ExitStatus>,
    /// Pids with a blocking waitpid in flight, and how many
    waiting: HashMap<ProcessId, usize>,
}

impl Tables {
    /// Apply a wait status. Returns the process when this completed its death.
    fn record(&mut self, pid: ProcessId, status: WaitStatus) -> Option<Arc<Process>> {
        let Some(process) = self.live.get(&pid).cloned() else {
            warn!(pid, "status for an unmanaged child: {:?}", status);
            return None;
        };
        let exit = status::from_wait_status(process.command_for(pid), status)?;
        if exit.is_stopped() {
            debug!(pid, "{}", exit);
            process.record_stop(exit);
            return None;
        }

        info!(pid, "{}", exit);
        self.live.remove(&pid);
        self.graveyard.insert(pid, exit.clone());
        process.record_death(pid, exit).then_some(process)
    }

    /// Consume graveyard entries for `process` and return a pid still running
    fn collect(&mut self, process: &Process) -> Option<ProcessId> {
        let mut pending = None;
        for pid in process.pids() {
            if self.graveyard.remove(&pid).is_some() {
                continue;
            }
            if pending.is_none() && self.live.contains_key(&pid) {
                pending = Some(pid);
            }
        }
        pending
    }

    fn begin_wait(&mut self, pid: ProcessId) {
        *self.waiting.entry(pid).or_default() += 1;
    }

    /// Returns whether another thread is still blocked on `pid`
    fn end_wait(&mut self, pid: ProcessId) -> bool {
        match self.waiting.get_mut(&pid) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            _ => {
                self.waiting.remove(&pid);
                false
            }
        }
    }
}

pub(crate) struct Shared {
    config: ManagerConfig,
    tables: Mutex<Tables>,
    poller: RwLock<Arc<dyn Poller>>,
    registration: Mutex<Option<SignalRegistration>>,
}

impl Shared {
    fn poller(&self) -> Arc<dyn Poller> {
        self.poller.read().clone()
    }

    /// Wait for `process`. `NoHang` performs one non-blocking reap first.
    pub(crate) fn waitproc(&self, process: &Process, mode: WaitMode) -> Result<Option<ExitStatus>> {
        let mut polled = false;
        loop {
            let mut tables = self.tables.lock();
            let pending = tables.collect(process);
            let Some(pid) = pending else {
                drop(tables);
                return process
                    .exit_status()
                    .map(Some)
                    .ok_or(ProcessError::Unmanaged(process.pid()));
            };

            if mode == WaitMode::NoHang {
                drop(tables);
                if polled {
                    return Ok(None);
                }
                polled = true;
                self.reap_pids(&process.pids());
                continue;
            }

            // reap_pids leaves the pid alone until this wait is recorded
            tables.begin_wait(pid);
            drop(tables);
            let result = waitpid(Pid::from_raw(pid as i32), None);
            let mut tables = self.tables.lock();
            let others_waiting = tables.end_wait(pid);
            match result {
                Ok(status) => {
                    let dead = tables.record(pid, status);
                    drop(tables);
                    self.finish(dead.into_iter().collect());
                }
                Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) if !tables.live.contains_key(&pid) => {}
                Err(Errno::ECHILD) if others_waiting => {
                    // another waiter holds the status and has yet to record it
                    drop(tables);
                    thread::yield_now();
                }
                Err(Errno::ECHILD) => {
                    tables.live.remove(&pid);
                    error!(pid, "child was collected outside the manager");
                    return Err(io::Error::from(Errno::ECHILD).into());
                }
                Err(e) => return Err(io::Error::from(e).into()),
            }
        }
    }

    /// Non-blocking reap of the given pids
    fn reap_pids(&self, pids: &[ProcessId]) -> usize {
        let mut reaped = 0;
        let mut dead = Vec::new();
        {
            let mut tables = self.tables.lock();
            for &pid in pids {
                if !tables.live.contains_key(&pid) || tables.waiting.contains_key(&pid) {
                    continue;
                }
                let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED;
                match waitpid(Pid::from_raw(pid as i32), Some(flags)) {
                    Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => {}
                    Ok(status) => {
                        reaped += 1;
                        dead.extend(tables.record(pid, status));
                    }
                    Err(Errno::ECHILD) => {
                        tables.live.remove(&pid);
                        error!(pid, "child was collected outside the manager");
                    }
                    Err(e) => error!(pid, "waitpid failed: {e}"),
                }
            }
        }
        self.finish(dead);
        reaped
    }

    /// Death notifications, run without holding the tables
    fn finish(&self, dead: Vec<Arc<Process>>) {
        for process in dead {
            if process.options().polled {
                self.poller().unregister(process.pid());
            }
            if let Some(callback) = process.take_callback() {
                callback(&process);
            }
            // with every handle dropped nobody is left to collect the status
            if Arc::strong_count(&process) == 1 {
                let mut tables = self.tables.lock();
                for pid in process.pids() {
                    tables.graveyard.remove(&pid);
                }
            }
        }
    }

    fn register(&self, process: &Arc<Process>) {
        {
            let mut tables = self.tables.lock();
            for pid in process.pids() {
                tables.graveyard.remove(&pid);
                tables.live.insert(pid, process.clone());
            }
        }
        if process.options().polled {
            self.poller().register(process.pid(), process.clone());
        }
    }
}

/// Supervises children spawned through it
#[derive(Clone)]
pub struct UnixProcessManager {
    shared: Arc<Shared>,
}

impl UnixProcessManager {
    /// Validate `config` and install the child-state handler
    pub fn new(config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        let registration = SignalRegistration::install()?;
        info!(
            "Initializing Unix process manager (restart delay {:?})",
            config.restart_delay()
        );
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                tables: Mutex::default(),
                poller: RwLock::new(Arc::new(NullPoller)),
                registration: Mutex::new(Some(registration)),
            }),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(ManagerConfig::default())
    }

    /// Poller that `polled` processes are registered with
    pub fn set_poller(&self, poller: Arc<dyn Poller>) {
        *self.shared.poller.write() = poller;
    }

    pub fn poller(&self) -> Arc<dyn Poller> {
        self.shared.poller()
    }

    /// Spawn `cmd` as `kind`. A pipe command containing an unquoted `|`
    /// becomes a two-stage pipeline.
    pub fn spawn(
        &self,
        kind: ProcessKind,
        cmd: &str,
        options: SpawnOptions,
        callback: Option<DeathCallback>,
    ) -> Result<Arc<Process>> {
        let kind = match kind {
            ProcessKind::Pipe if command::is_pipeline(cmd) => ProcessKind::Pipeline,
            ProcessKind::Coprocess | ProcessKind::Subprocess => {
                return Err(ProcessError::InvalidCommand(format!(
                    "{kind} processes run a closure, not '{cmd}'"
                )));
            }
            other => other,
        };
        let callback = self.death_callback(kind, callback, &options);

        let guard = ChildSignalGuard::block()?;
        let spawned = match kind {
            ProcessKind::Pty => pty::spawn(cmd, &options)?,
            ProcessKind::Pipeline => pipeline::spawn(cmd, &options)?,
            _ => pipe::spawn(cmd, &options)?,
        };
        let process = self.adopt(cmd, kind, spawned, options, callback);
        drop(guard);
        Ok(process)
    }

    /// Fork and run `entry` in the child with its stdio connected to the
    /// returned process
    pub fn coprocess<F, R>(&self, entry: F, options: SpawnOptions) -> Result<Arc<Process>>
    where
        F: FnOnce() -> R,
        R: ChildOutcome,
    {
        let cmdline = format!("{} <=> coprocess", coprocess::program_name());
        let callback = self.death_callback(ProcessKind::Coprocess, None, &options);
        let setup = ChildSetup::new(&options)?;

        let guard = ChildSignalGuard::block()?;
        let pipes = StdioPipes::new(options.merge)?;
        match coprocess::fork()? {
            Forked::Child => {
                let attached = pipes.attach_child();
                self.forget_in_child();
                if let Err(e) = attached {
                    coprocess::abort_child(self.error_log(), &format!("stdio setup failed: {e}"));
                }
                coprocess::enter_child(&setup, entry, self.error_log())
            }
            Forked::Parent(pid) => {
                let spawned = Spawned {
                    stages: vec![(pid, cmdline.clone())],
                    transport: Some(Box::new(pipes.into_parent())),
                };
                let process =
                    self.adopt(&cmdline, ProcessKind::Coprocess, spawned, options, callback);
                drop(guard);
                Ok(process)
            }
        }
    }

    /// Fork and run `entry` in the child, which shares our stdio
    pub fn submethod<F, R>(&self, entry: F, options: SpawnOptions) -> Result<Arc<Process>>
    where
        F: FnOnce() -> R,
        R: ChildOutcome,
    {
        let cmdline = coprocess::program_name();
        let callback = self.death_callback(ProcessKind::Subprocess, None, &options);
        let setup = ChildSetup::new(&options)?;

        let guard = ChildSignalGuard::block()?;
        match coprocess::fork()? {
            Forked::Child => {
                self.forget_in_child();
                coprocess::enter_child(&setup, entry, self.error_log())
            }
            Forked::Parent(pid) => {
                let spawned = Spawned {
                    stages: vec![(pid, cmdline.clone())],
                    transport: None,
                };
                let process =
                    self.adopt(&cmdline, ProcessKind::Subprocess, spawned, options, callback);
                drop(guard);
                Ok(process)
            }
        }
    }

    fn error_log(&self) -> &Path {
        &self.shared.config.child_error_log
    }

    fn death_callback(
        &self,
        kind: ProcessKind,
        callback: Option<DeathCallback>,
        options: &SpawnOptions,
    ) -> Option<DeathCallback> {
        if callback.is_some() || !options.persistent {
            return callback;
        }
        if !kind.is_clonable() {
            warn!("{kind} processes cannot be restarted; ignoring persistent");
            return None;
        }
        Some(self.persistent_callback())
    }

    fn adopt(
        &self,
        cmdline: &str,
        kind: ProcessKind,
        spawned: Spawned,
        options: SpawnOptions,
        callback: Option<DeathCallback>,
    ) -> Arc<Process> {
        let process = Arc::new(Process::new(
            cmdline,
            kind,
            spawned,
            options,
            Arc::downgrade(&self.shared),
        ));
        process.set_callback(callback);
        self.shared.register(&process);
        info!(pid = process.pid(), "started {} process '{}'", kind, cmdline);
        process
    }

    /// The manager's state as inherited by a forked child
    fn forget_in_child(&self) {
        if let Some(mut tables) = self.shared.tables.try_lock() {
            tables.live.clear();
            tables.graveyard.clear();
        }
        if let Some(poller) = self.shared.poller.try_read() {
            poller.clear();
        }
    }

    fn persistent_callback(&self) -> DeathCallback {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move |dead: &Arc<Process>| {
            if let Some(shared) = shared.upgrade() {
                UnixProcessManager { shared }.restart(dead);
            }
        })
    }

    fn restart(&self, dead: &Arc<Process>) {
        let Some(status) = dead.exit_status() else {
            return;
        };
        if status.success() {
            dead.log(&format!(
                "*** process '{}' normal exit (NOT restarting).\n",
                dead.cmdline()
            ));
            info!(pid = dead.pid(), "'{}' exited normally, not restarting", dead.cmdline());
            return;
        }

        dead.log(&format!(
            "*** process '{}' died: {} (restarting).\n",
            dead.cmdline(),
            status
        ));
        warn!(pid = dead.pid(), "'{}' died: {} (restarting)", dead.cmdline(), status);
        thread::sleep(self.shared.config.restart_delay());

        match self.clone_process(dead) {
            Ok(replacement) => {
                if let Some(log) = dead.logfile() {
                    replacement.set_log(log);
                }
                info!(
                    old = dead.pid(),
                    new = replacement.pid(),
                    "restarted '{}'",
                    dead.cmdline()
                );
            }
            Err(e) => error!(pid = dead.pid(), "failed to restart '{}': {e}", dead.cmdline()),
        }
    }

    /// Drain pending child-state notifications and reap. Call when
    /// [`signal_fd`](Self::signal_fd) becomes readable.
    pub fn handle_child_events(&self) -> usize {
        signals::take_pending();
        self.reap_all()
    }

    fn reap_all(&self) -> usize {
        let pids = self.pids();
        self.shared.reap_pids(&pids)
    }

    /// Readable whenever a child changed state
    pub fn signal_fd(&self) -> Option<RawFd> {
        signals::signal_fd()
    }

    /// Pids of every live child, sorted
    pub fn pids(&self) -> Vec<ProcessId> {
        let mut pids: Vec<_> = self.shared.tables.lock().live.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Live processes, one entry per process even for pipelines
    pub fn processes(&self) -> Vec<Arc<Process>> {
        let tables = self.shared.tables.lock();
        let mut processes: Vec<Arc<Process>> = Vec::new();
        for process in tables.live.values() {
            if !processes.iter().any(|seen| Arc::ptr_eq(seen, process)) {
                processes.push(process.clone());
            }
        }
        processes.sort_by_key(|process| process.pid());
        processes
    }

    /// Live processes whose program basename matches that of `name`
    pub fn by_name(&self, name: &str) -> Vec<Arc<Process>> {
        let wanted = name.rsplit('/').next().unwrap_or(name);
        self.processes()
            .into_iter()
            .filter(|process| process.basename() == wanted)
            .collect()
    }

    pub fn by_pid(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.shared.tables.lock().live.get(&pid).cloned()
    }

    /// Number of live processes
    pub fn len(&self) -> usize {
        self.processes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.tables.lock().live.is_empty()
    }

    /// Send `signal` to every live process, or those named `name`. Returns
    /// how many were signalled.
    pub fn killall(&self, name: Option<&str>, signal: Signal) -> usize {
        let targets = match name {
            Some(name) => self.by_name(name),
            None => self.processes(),
        };
        let mut signalled = 0;
        for process in targets {
            match self.kill(&process, signal) {
                Ok(()) => signalled += 1,
                Err(e) => warn!(pid = process.pid(), "failed to send {signal}: {e}"),
            }
        }
        signalled
    }

    /// SIGSTOP every live process
    pub fn stopall(&self) -> usize {
        let mut stopped = 0;
        for process in self.processes() {
            match process.stop() {
                Ok(()) => stopped += 1,
                Err(e) => warn!(pid = process.pid(), "failed to stop: {e}"),
            }
        }
        stopped
    }

    pub fn flush_logs(&self) {
        for process in self.processes() {
            if let Err(e) = process.flush_log() {
                warn!(pid = process.pid(), "failed to flush log: {e}");
            }
        }
    }

    /// Status of a managed pid, live or collected but not yet waited for
    pub fn child_status(&self, pid: ProcessId) -> Option<ProcessStatus> {
        let tables = self.shared.tables.lock();
        if let Some(status) = tables.graveyard.get(&pid) {
            return Some(ProcessStatus::Exited(status.clone()));
        }
        let process = tables.live.get(&pid)?.clone();
        drop(tables);
        Some(process.stat())
    }
}

impl ProcessManager for UnixProcessManager {
    type Handle = Arc<Process>;
    type Signal = Signal;

    fn spawn_pipe(&self, cmd: &str, options: SpawnOptions) -> Result<Self::Handle> {
        self.spawn(ProcessKind::Pipe, cmd, options, None)
    }

    fn spawn_pty(&self, cmd: &str, options: SpawnOptions) -> Result<Self::Handle> {
        self.spawn(ProcessKind::Pty, cmd, options, None)
    }

    fn waitproc(&self, handle: &Self::Handle, mode: WaitMode) -> Result<Option<ExitStatus>> {
        self.shared.waitproc(handle, mode)
    }

    /// Signal without triggering a restart
    fn kill(&self, handle: &Self::Handle, signal: Signal) -> Result<()> {
        handle.set_callback(None);
        handle.kill(signal)
    }

    fn clone_process(&self, handle: &Self::Handle) -> Result<Self::Handle> {
        if !handle.kind().is_clonable() {
            return Err(ProcessError::NotClonable(handle.cmdline().to_string()));
        }
        self.spawn(
            handle.kind(),
            handle.cmdline(),
            handle.options().clone(),
            handle.callback(),
        )
    }

    fn reap(&self) -> usize {
        self.reap_all()
    }

    fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    fn shutdown(&self) {
        if self.shared.registration.lock().take().is_some() {
            info!("Unix process manager released its child-state handler");
        }
    }
}

impl fmt::Display for UnixProcessManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for process in self.processes() {
            writeln!(f, "{process}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for UnixProcessManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnixProcessManager")
            .field("config", &self.shared.config)
            .field("pids", &self.pids())
            .finish()
    }
}
