use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{self, Pid};
use parking_lot::Mutex;
use procmux_core::{
    ExitStatus, Pollable, ProcessError, ProcessId, ProcessKind, ProcessLog, Result, SpawnOptions,
    WaitMode,
};
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::manager::Shared;
use crate::stat::{ProcStat, ProcessStatus};

const READ_CHUNK: usize = 4096;
const READLINE_CHUNK: usize = 100;
const ERR_CHUNK: usize = 1024;
const POLL_FILL: usize = 16384;
const MAX_RAW_READ: usize = 1 << 20;

/// Invoked once when a process dies
pub type DeathCallback = Arc<dyn Fn(&Arc<Process>) + Send + Sync>;

/// Descriptor-level transport between the supervisor and a child
pub trait ProcessIo: Send {
    /// One read from the child's output
    fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// One read from the child's separate error stream
    fn read_err_raw(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }

    /// One write to the child's input
    fn write_raw(&mut self, data: &[u8]) -> io::Result<usize>;

    fn fileno(&self) -> RawFd;

    fn filenos(&self) -> Vec<RawFd>;

    fn set_nonblocking(&mut self, flag: bool) -> io::Result<()>;

    fn isatty(&self) -> bool;

    /// Name of the terminal device, when the transport is one
    fn ttyname(&self) -> Option<String> {
        None
    }

    /// Byte that interrupts the foreground job, when the transport is a terminal
    fn interrupt_char(&mut self) -> Option<u8> {
        None
    }
}

/// Result of starting the OS side of a process
pub(crate) struct Spawned {
    /// Pid and command of every child, in pipeline order
    pub(crate) stages: Vec<(ProcessId, String)>,
    pub(crate) transport: Option<Box<dyn ProcessIo>>,
}

fn retry<T>(restart: bool, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(e) if restart && e.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

struct IoState {
    transport: Option<Box<dyn ProcessIo>>,
    buf: VecDeque<u8>,
    errbuf: VecDeque<u8>,
    writebuf: Vec<u8>,
    eof: bool,
    log: Option<ProcessLog>,
    restart: bool,
}

impl IoState {
    fn mirror(&self, data: &[u8]) {
        if let Some(log) = &self.log {
            if let Err(e) = log.write(data) {
                debug!("process log write failed: {e}");
            }
        }
    }

    fn raw_read(&mut self, amt: usize) -> io::Result<Vec<u8>> {
        let restart = self.restart;
        let Some(transport) = self.transport.as_mut() else {
            return Ok(Vec::new());
        };
        let mut chunk = vec![0u8; amt.clamp(1, MAX_RAW_READ)];
        let n = retry(restart, || transport.read_raw(&mut chunk))?;
        chunk.truncate(n);
        if n == 0 {
            self.eof = true;
        } else {
            self.mirror(&chunk);
        }
        Ok(chunk)
    }

    fn raw_read_err(&mut self, amt: usize) -> io::Result<Vec<u8>> {
        let restart = self.restart;
        let Some(transport) = self.transport.as_mut() else {
            return Ok(Vec::new());
        };
        let mut chunk = vec![0u8; amt];
        let n = retry(restart, || transport.read_err_raw(&mut chunk))?;
        chunk.truncate(n);
        self.mirror(&chunk);
        Ok(chunk)
    }

    fn raw_write(&mut self, data: &[u8]) -> io::Result<usize> {
        let restart = self.restart;
        let Some(transport) = self.transport.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        let n = retry(restart, || transport.write_raw(data))?;
        if n == 0 && !data.is_empty() {
            return Err(io::ErrorKind::WriteZero.into());
        }
        self.mirror(&data[..n]);
        Ok(n)
    }

    fn take(&mut self, amt: usize) -> Vec<u8> {
        let n = amt.min(self.buf.len());
        self.buf.drain(..n).collect()
    }

    fn unread(&mut self, data: &[u8]) {
        for &byte in data.iter().rev() {
            self.buf.push_front(byte);
        }
    }

    fn read(&mut self, amt: usize) -> Result<Vec<u8>> {
        while self.buf.len() < amt {
            match self.raw_read(READ_CHUNK) {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => self.buf.extend(chunk),
                Err(e) if would_block(&e) && !self.buf.is_empty() => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.take(amt))
    }

    /// Buffered bytes if there are any, otherwise at most one descriptor read
    fn read_available(&mut self, amt: usize) -> Result<Vec<u8>> {
        if amt == 0 {
            return Ok(Vec::new());
        }
        if self.buf.is_empty() {
            let chunk = self.raw_read(amt)?;
            self.buf.extend(chunk);
        }
        Ok(self.take(amt))
    }

    fn readline(&mut self, limit: usize) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        let mut remaining = limit;
        let mut chunk = READLINE_CHUNK.min(limit);

        while remaining > 0 {
            let data = match self.read_available(chunk) {
                Ok(data) => data,
                Err(e) => {
                    self.unread(&line);
                    return Err(e);
                }
            };
            if data.is_empty() {
                break;
            }

            if let Some(i) = data.iter().position(|&b| b == b'\n') {
                let end = (i + 1).min(remaining);
                line.extend_from_slice(&data[..end]);
                self.unread(&data[end..]);
                break;
            }
            if data.len() >= remaining {
                line.extend_from_slice(&data[..remaining]);
                self.unread(&data[remaining..]);
                break;
            }

            remaining -= data.len();
            line.extend_from_slice(&data);
            chunk = chunk.saturating_mul(2).min(remaining);
        }
        Ok(line)
    }

    fn readerr(&mut self, amt: usize) -> Result<Vec<u8>> {
        while self.errbuf.len() < amt {
            match self.raw_read_err(ERR_CHUNK) {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => self.errbuf.extend(chunk),
                Err(e) if would_block(&e) && !self.errbuf.is_empty() => break,
                Err(e) => return Err(e.into()),
            }
        }
        let n = amt.min(self.errbuf.len());
        Ok(self.errbuf.drain(..n).collect())
    }

    fn write_pending(&mut self) -> io::Result<usize> {
        let pending = std::mem::take(&mut self.writebuf);
        let result = self.raw_write(&pending);
        self.writebuf = pending;
        if let Ok(n) = result {
            self.writebuf.drain(..n);
        }
        result
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.transport.is_none() {
            return Err(ProcessError::BadDescriptor);
        }
        while !self.writebuf.is_empty() {
            match self.write_pending() {
                Ok(_) => {}
                Err(e) if would_block(&e) => {
                    self.writebuf.extend_from_slice(data);
                    return Ok(data.len());
                }
                Err(e) => return Err(e.into()),
            }
        }
        if data.is_empty() {
            return Ok(0);
        }
        match self.raw_write(data) {
            Ok(n) => {
                self.writebuf.extend_from_slice(&data[n..]);
                Ok(data.len())
            }
            Err(e) if would_block(&e) => {
                self.writebuf.extend_from_slice(data);
                Ok(data.len())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn flush(&mut self) -> Result<()> {
        while !self.writebuf.is_empty() {
            self.write_pending()?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct LifeState {
    statuses: Vec<(ProcessId, ExitStatus)>,
    exit_status: Option<ExitStatus>,
    stop_status: Option<ExitStatus>,
    callback: Option<DeathCallback>,
    callback_fired: bool,
}

/// A supervised child (or pair of children, for a pipeline).
///
/// Output is buffered per process: `read` drains what is buffered before
/// touching the descriptor, and `readline` pushes back what follows the line.
/// The manager records the exit status when the child is reaped.
pub struct Process {
    cmdline: String,
    kind: ProcessKind,
    stages: Vec<(ProcessId, String)>,
    options: SpawnOptions,
    io: Mutex<IoState>,
    life: Mutex<LifeState>,
    manager: Weak<Shared>,
}

impl Process {
    pub(crate) fn new(
        cmdline: impl Into<String>,
        kind: ProcessKind,
        spawned: Spawned,
        options: SpawnOptions,
        manager: Weak<Shared>,
    ) -> Process {
        let io = IoState {
            transport: spawned.transport,
            buf: VecDeque::new(),
            errbuf: VecDeque::new(),
            writebuf: Vec::new(),
            eof: false,
            log: options.log.clone(),
            restart: true,
        };
        Process {
            cmdline: cmdline.into(),
            kind,
            stages: spawned.stages,
            options,
            io: Mutex::new(io),
            life: Mutex::new(LifeState::default()),
            manager,
        }
    }

    pub fn cmdline(&self) -> &str {
        &self.cmdline
    }

    pub fn kind(&self) -> ProcessKind {
        self.kind
    }

    pub fn options(&self) -> &SpawnOptions {
        &self.options
    }

    /// Pid of the first child
    pub fn pid(&self) -> ProcessId {
        self.stages.first().map(|(pid, _)| *pid).unwrap_or(0)
    }

    pub fn pids(&self) -> Vec<ProcessId> {
        self.stages.iter().map(|(pid, _)| *pid).collect()
    }

    /// Program name of the command line
    pub fn basename(&self) -> &str {
        let program = self.cmdline.split_whitespace().next().unwrap_or("");
        Path::new(program)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(program)
    }

    pub(crate) fn command_for(&self, pid: ProcessId) -> &str {
        self.stages
            .iter()
            .find(|(stage, _)| *stage == pid)
            .map(|(_, command)| command.as_str())
            .unwrap_or(&self.cmdline)
    }

    pub fn is_alive(&self) -> bool {
        !self.is_dead()
    }

    pub fn is_dead(&self) -> bool {
        self.life.lock().exit_status.is_some()
    }

    /// Final status, once the process has been reaped
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.life.lock().exit_status.clone()
    }

    /// Status from the last job-control stop, cleared by [`Process::cont`]
    pub fn stop_status(&self) -> Option<ExitStatus> {
        self.life.lock().stop_status.clone()
    }

    // reads

    /// Read up to `amt` bytes, blocking until that many arrive or the child closes its output
    pub fn read(&self, amt: usize) -> Result<Vec<u8>> {
        self.io.lock().read(amt)
    }

    /// Everything up to end of file
    pub fn read_to_end(&self) -> Result<Vec<u8>> {
        self.read(usize::MAX)
    }

    pub fn read_to_string(&self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.read_to_end()?).into_owned())
    }

    pub fn readline(&self) -> Result<Vec<u8>> {
        self.readline_limit(usize::MAX)
    }

    /// Read one line of at most `amt` bytes, terminator included
    pub fn readline_limit(&self, amt: usize) -> Result<Vec<u8>> {
        self.io.lock().readline(amt)
    }

    pub fn readlines(&self) -> Result<Vec<Vec<u8>>> {
        let mut io = self.io.lock();
        let mut lines = Vec::new();
        loop {
            let line = io.readline(usize::MAX)?;
            if line.is_empty() {
                return Ok(lines);
            }
            lines.push(line);
        }
    }

    /// Read from the separate error stream; always empty when stderr is merged
    pub fn readerr(&self, amt: usize) -> Result<Vec<u8>> {
        self.io.lock().readerr(amt)
    }

    // writes

    /// Write `data`, first pushing out anything left over from earlier writes.
    ///
    /// Returns the length of `data`: whatever the OS did not take now is
    /// kept and sent ahead of the next write.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.io.lock().write(data)
    }

    pub fn send(&self, data: &[u8]) -> Result<usize> {
        self.write(data)
    }

    /// Push out all pending bytes
    pub fn flush(&self) -> Result<()> {
        self.io.lock().flush()
    }

    // lifecycle

    /// Block until the process is dead and return its status
    pub fn wait(&self) -> Result<ExitStatus> {
        if let Some(manager) = self.manager.upgrade() {
            if let Some(status) = manager.waitproc(self, WaitMode::Block)? {
                return Ok(status);
            }
        }
        self.exit_status()
            .ok_or(ProcessError::Unmanaged(self.pid()))
    }

    /// Status if the process already died, without blocking
    pub fn try_wait(&self) -> Result<Option<ExitStatus>> {
        match self.manager.upgrade() {
            Some(manager) => manager.waitproc(self, WaitMode::NoHang),
            None => Ok(self.exit_status()),
        }
    }

    fn unreaped(&self) -> Vec<ProcessId> {
        let life = self.life.lock();
        if life.exit_status.is_some() {
            return Vec::new();
        }
        self.stages
            .iter()
            .map(|(pid, _)| *pid)
            .filter(|pid| *pid != 0 && !life.statuses.iter().any(|(dead, _)| dead == pid))
            .collect()
    }

    /// Send `signal` to every child still running
    pub fn kill(&self, signal: Signal) -> Result<()> {
        for pid in self.unreaped() {
            match signal::kill(Pid::from_raw(pid as i32), signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => return Err(io::Error::from(e).into()),
            }
        }
        Ok(())
    }

    pub fn killwait(&self, signal: Signal) -> Result<ExitStatus> {
        self.kill(signal)?;
        self.wait()
    }

    pub fn stop(&self) -> Result<()> {
        self.kill(Signal::SIGSTOP)
    }

    pub fn cont(&self) -> Result<()> {
        self.kill(Signal::SIGCONT)?;
        self.life.lock().stop_status = None;
        Ok(())
    }

    pub fn hangup(&self) -> Result<()> {
        self.kill(Signal::SIGHUP)
    }

    /// Interrupt the foreground job: the terminal's interrupt character on a
    /// pty, SIGINT otherwise
    pub fn interrupt(&self) -> Result<()> {
        let mut io = self.io.lock();
        let intr = io.transport.as_mut().and_then(|t| t.interrupt_char());
        match intr {
            Some(c) => {
                io.raw_write(&[c])?;
                Ok(())
            }
            None => {
                drop(io);
                self.kill(Signal::SIGINT)
            }
        }
    }

    pub fn setpgid(&self, pgid: ProcessId) -> Result<()> {
        unistd::setpgid(Pid::from_raw(self.pid() as i32), Pid::from_raw(pgid as i32))
            .map_err(io::Error::from)?;
        Ok(())
    }

    /// Live information from the OS, or the exit status once dead
    pub fn stat(&self) -> ProcessStatus {
        if let Some(status) = self.exit_status() {
            return ProcessStatus::Exited(status);
        }
        ProcStat::for_pid(self.pid())
            .map(ProcessStatus::Running)
            .unwrap_or(ProcessStatus::Unknown)
    }

    // descriptors

    pub fn fileno(&self) -> Result<RawFd> {
        self.io
            .lock()
            .transport
            .as_ref()
            .map(|t| t.fileno())
            .ok_or(ProcessError::BadDescriptor)
    }

    pub fn filenos(&self) -> Result<Vec<RawFd>> {
        self.io
            .lock()
            .transport
            .as_ref()
            .map(|t| t.filenos())
            .ok_or(ProcessError::BadDescriptor)
    }

    pub fn set_nonblocking(&self, flag: bool) -> Result<()> {
        let mut io = self.io.lock();
        let transport = io.transport.as_mut().ok_or(ProcessError::BadDescriptor)?;
        transport.set_nonblocking(flag)?;
        Ok(())
    }

    pub fn isatty(&self) -> bool {
        self.io
            .lock()
            .transport
            .as_ref()
            .is_some_and(|t| t.isatty())
    }

    /// Release the descriptors and drop the death callback. Idempotent.
    pub fn close(&self) {
        let transport = self.io.lock().transport.take();
        drop(transport);
        self.life.lock().callback = None;
    }

    pub fn is_closed(&self) -> bool {
        self.io.lock().transport.is_none()
    }

    /// Whether failed system calls interrupted by a signal are retried.
    /// Returns the previous setting.
    pub fn set_restart(&self, flag: bool) -> bool {
        std::mem::replace(&mut self.io.lock().restart, flag)
    }

    // logging

    pub fn set_log(&self, log: ProcessLog) {
        self.io.lock().log = Some(log);
    }

    pub fn logfile(&self) -> Option<ProcessLog> {
        self.io.lock().log.clone()
    }

    pub fn remove_log(&self) -> Option<ProcessLog> {
        self.io.lock().log.take()
    }

    /// Write an entry to the attached log sink
    pub fn log(&self, entry: &str) {
        self.io.lock().mirror(entry.as_bytes());
    }

    pub fn flush_log(&self) -> Result<()> {
        if let Some(log) = self.logfile() {
            log.flush()?;
        }
        Ok(())
    }

    // death bookkeeping

    /// Replace the death callback
    pub fn set_callback(&self, callback: Option<DeathCallback>) {
        self.life.lock().callback = callback;
    }

    pub(crate) fn callback(&self) -> Option<DeathCallback> {
        self.life.lock().callback.clone()
    }

    /// The callback, the first time it is asked for after death
    pub(crate) fn take_callback(&self) -> Option<DeathCallback> {
        let mut life = self.life.lock();
        if life.exit_status.is_none() || life.callback_fired {
            return None;
        }
        life.callback_fired = true;
        life.callback.clone()
    }

    pub(crate) fn record_stop(&self, status: ExitStatus) {
        self.life.lock().stop_status = Some(status);
    }

    /// Note that `pid` died. Returns true once every child is dead.
    pub(crate) fn record_death(&self, pid: ProcessId, status: ExitStatus) -> bool {
        let mut life = self.life.lock();
        if life.exit_status.is_some() {
            return false;
        }
        if !life.statuses.iter().any(|(dead, _)| *dead == pid) {
            life.statuses.push((pid, status));
        }

        let all_dead = self
            .stages
            .iter()
            .all(|(stage, _)| life.statuses.iter().any(|(dead, _)| dead == stage));
        if !all_dead {
            return false;
        }

        let last = self.stages.last().map(|(pid, _)| *pid);
        let final_status = life
            .statuses
            .iter()
            .find(|(dead, _)| Some(*dead) == last)
            .map(|(_, status)| status.clone());
        life.exit_status = final_status;
        life.stop_status = None;
        life.exit_status.is_some()
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("cmdline", &self.cmdline)
            .field("kind", &self.kind)
            .field("pids", &self.pids())
            .finish()
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tty = self
            .io
            .lock()
            .transport
            .as_ref()
            .and_then(|t| t.ttyname())
            .map(|name| name.trim_start_matches("/dev/").to_string())
            .unwrap_or_else(|| "?".to_string());
        match self.stat() {
            ProcessStatus::Exited(status) => write!(f, "{status}"),
            ProcessStatus::Running(stat) => write!(
                f,
                "{:6} {:<7} ({}) {}",
                self.pid(),
                tty,
                stat.state,
                self.cmdline
            ),
            ProcessStatus::Unknown => {
                write!(f, "{:6} {:<7} (?) {}", self.pid(), tty, self.cmdline)
            }
        }
    }
}

fn into_io_error(error: ProcessError) -> io::Error {
    match error {
        ProcessError::Io(e) => e,
        other => io::Error::other(other),
    }
}

impl Read for &Process {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self
            .io
            .lock()
            .read_available(buf.len())
            .map_err(into_io_error)?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl Write for &Process {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        // whatever the OS does not take now stays buffered
        Process::write(self, data).map_err(into_io_error)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Process::flush(self).map_err(into_io_error)
    }
}

impl Pollable for Process {
    fn fileno(&self) -> Result<RawFd> {
        Process::fileno(self)
    }

    fn filenos(&self) -> Result<Vec<RawFd>> {
        Process::filenos(self)
    }

    fn readable(&self) -> bool {
        let io = self.io.lock();
        io.transport.is_some() && !io.eof
    }

    fn writable(&self) -> bool {
        !self.io.lock().writebuf.is_empty()
    }

    fn handle_read(&self) {
        let mut io = self.io.lock();
        match io.raw_read(POLL_FILL) {
            Ok(chunk) => io.buf.extend(chunk),
            Err(e) if would_block(&e) => {}
            Err(e) => warn!(pid = self.pid(), "read error on '{}': {}", self.cmdline, e),
        }
    }

    fn handle_write(&self) {
        let mut io = self.io.lock();
        if io.writebuf.is_empty() {
            return;
        }
        match io.write_pending() {
            Ok(n) => debug!(pid = self.pid(), "flushed {} pending bytes", n),
            Err(e) if would_block(&e) => {}
            Err(e) => warn!(pid = self.pid(), "write error on '{}': {}", self.cmdline, e),
        }
    }

    fn handle_hangup(&self) {
        debug!(pid = self.pid(), "hangup on '{}'", self.cmdline);
    }

    fn handle_error(&self, error: &ProcessError) {
        self.log(&format!("error event: {error}\n"));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use procmux_core::SharedBuffer;
    use std::io::BufRead;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted transport: serves `input` and counts descriptor reads
    pub(crate) struct MockIo {
        input: VecDeque<u8>,
        pub(crate) written: Arc<parking_lot::Mutex<Vec<u8>>>,
        pub(crate) reads: Arc<AtomicUsize>,
        write_limit: usize,
        block_after: Option<usize>,
    }

    impl MockIo {
        pub(crate) fn new(input: &[u8]) -> MockIo {
            MockIo {
                input: input.iter().copied().collect(),
                written: Arc::default(),
                reads: Arc::default(),
                write_limit: usize::MAX,
                block_after: None,
            }
        }
    }

    impl ProcessIo for MockIo {
        fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let reads = self.reads.fetch_add(1, Ordering::SeqCst);
            if self.block_after.is_some_and(|limit| reads >= limit) {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.input.len());
            for (slot, byte) in buf.iter_mut().zip(self.input.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }

        fn write_raw(&mut self, data: &[u8]) -> io::Result<usize> {
            if self.write_limit == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = data.len().min(self.write_limit);
            self.written.lock().extend_from_slice(&data[..n]);
            Ok(n)
        }

        fn fileno(&self) -> RawFd {
            42
        }

        fn filenos(&self) -> Vec<RawFd> {
            vec![42]
        }

        fn set_nonblocking(&mut self, _flag: bool) -> io::Result<()> {
            Ok(())
        }

        fn isatty(&self) -> bool {
            false
        }
    }

    pub(crate) fn mock_process(io: MockIo) -> Process {
        Process::new(
            "mock --flag",
            ProcessKind::Pipe,
            Spawned {
                stages: vec![(0, "mock --flag".to_string())],
                transport: Some(Box::new(io)),
            },
            SpawnOptions::default(),
            Weak::new(),
        )
    }

    #[test]
    fn test_read_never_over_returns() {
        let process = mock_process(MockIo::new(b"abcdefghij"));
        assert_eq!(process.read(4).unwrap(), b"abcd");
        assert_eq!(process.read(4).unwrap(), b"efgh");
        assert_eq!(process.read(4).unwrap(), b"ij");
        assert!(process.read(4).unwrap().is_empty());
    }

    #[test]
    fn test_readline_splits_and_keeps_remainder() {
        let process = mock_process(MockIo::new(b"one\ntwo\nthree"));
        assert_eq!(process.readline().unwrap(), b"one\n");
        assert_eq!(process.readline().unwrap(), b"two\n");
        assert_eq!(process.read(100).unwrap(), b"three");
        assert!(process.readline().unwrap().is_empty());
    }

    #[test]
    fn test_readline_uses_logarithmic_reads() {
        let mut input = vec![b'x'; 100_000];
        input.push(b'\n');
        input.extend_from_slice(b"tail");
        let io = MockIo::new(&input);
        let reads = io.reads.clone();
        let process = mock_process(io);

        let line = process.readline().unwrap();
        assert_eq!(line.len(), 100_001);
        // 100, 200, 400, ... reaches 100k bytes within 11 steps
        assert!(reads.load(Ordering::SeqCst) <= 12);
        assert_eq!(process.read(10).unwrap(), b"tail");
    }

    #[test]
    fn test_readline_limit() {
        let process = mock_process(MockIo::new(b"abcdefgh\nrest"));
        assert_eq!(process.readline_limit(3).unwrap(), b"abc");
        assert_eq!(process.readline().unwrap(), b"defgh\n");
        assert_eq!(process.readlines().unwrap(), vec![b"rest".to_vec()]);
    }

    #[test]
    fn test_partial_read_on_would_block() {
        let mut io = MockIo::new(b"xyz");
        io.block_after = Some(1);
        let process = mock_process(io);
        assert_eq!(process.read(10).unwrap(), b"xyz");

        let err = process.read(10).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_readline_keeps_bytes_on_would_block() {
        let mut io = MockIo::new(b"no newline yet");
        io.block_after = Some(1);
        let process = mock_process(io);
        assert!(process.readline().unwrap_err().is_retryable());
        assert_eq!(process.read(100).unwrap(), b"no newline yet");
    }

    #[test]
    fn test_write_buffers_remainder() {
        let mut io = MockIo::new(b"");
        io.write_limit = 3;
        let written = io.written.clone();
        let process = mock_process(io);

        // accepted whole, two bytes held back
        assert_eq!(process.write(b"hello").unwrap(), 5);
        assert!(Pollable::writable(&process));
        // the remainder goes out before the new data
        assert_eq!(process.write(b"!").unwrap(), 1);
        assert_eq!(written.lock().as_slice(), b"hello!");
        process.flush().unwrap();
        assert!(!Pollable::writable(&process));
    }

    #[test]
    fn test_write_would_block_is_buffered_once() {
        let mut io = MockIo::new(b"");
        io.write_limit = 0;
        let written = io.written.clone();
        let process = mock_process(io);
        assert_eq!(process.write(b"later").unwrap(), 5);
        assert!(Pollable::writable(&process));
        assert_eq!(process.write(b" on").unwrap(), 3);
        assert_eq!(process.io.lock().writebuf.as_slice(), b"later on");
        assert!(written.lock().is_empty());
    }

    #[test]
    fn test_log_mirrors_reads_and_writes() {
        let buffer = SharedBuffer::new();
        let process = mock_process(MockIo::new(b"output\n"));
        process.set_log(buffer.clone().into_log());
        process.write(b"input\n").unwrap();
        process.readline().unwrap();
        process.log("note\n");
        assert_eq!(buffer.to_string_lossy(), "input\noutput\nnote\n");
        assert!(process.remove_log().is_some());
        assert!(process.logfile().is_none());
    }

    #[test]
    fn test_close_is_idempotent() {
        let process = mock_process(MockIo::new(b"data"));
        assert_eq!(process.fileno().unwrap(), 42);
        process.close();
        process.close();
        assert!(process.is_closed());
        assert!(matches!(process.fileno(), Err(ProcessError::BadDescriptor)));
        assert!(matches!(process.write(b"x"), Err(ProcessError::BadDescriptor)));
        assert!(process.read(10).unwrap().is_empty());
    }

    #[test]
    fn test_death_bookkeeping() {
        let process = Arc::new(mock_process(MockIo::new(b"")));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        process.set_callback(Some(Arc::new(move |_: &Arc<Process>| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        assert!(process.take_callback().is_none());
        process.record_stop(ExitStatus::stopped("mock", 19));
        assert!(process.is_alive());
        assert!(process.stop_status().is_some());

        assert!(process.record_death(0, ExitStatus::exited("mock", 0)));
        assert!(!process.record_death(0, ExitStatus::exited("mock", 1)));
        assert!(process.is_dead());
        assert!(process.stop_status().is_none());
        assert!(process.exit_status().unwrap().success());

        for _ in 0..2 {
            if let Some(callback) = process.take_callback() {
                callback(&process);
            }
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // a dead process ignores signals
        process.kill(Signal::SIGTERM).unwrap();
    }

    #[test]
    fn test_pipeline_dies_with_both_stages() {
        let process = Process::new(
            "a | b",
            ProcessKind::Pipeline,
            Spawned {
                stages: vec![(11, "a".to_string()), (12, "b".to_string())],
                transport: None,
            },
            SpawnOptions::default(),
            Weak::new(),
        );
        assert_eq!(process.command_for(11), "a");
        assert_eq!(process.command_for(12), "b");
        assert!(matches!(process.fileno(), Err(ProcessError::BadDescriptor)));

        assert!(!process.record_death(12, ExitStatus::exited("b", 0)));
        assert!(process.is_alive());
        assert!(process.record_death(11, ExitStatus::exited("a", 1)));
        // the consuming command decides the pipeline's status
        assert!(process.exit_status().unwrap().success());
    }

    #[test]
    fn test_unmanaged_wait() {
        let process = mock_process(MockIo::new(b""));
        assert!(matches!(process.wait(), Err(ProcessError::Unmanaged(0))));
        assert_eq!(process.try_wait().unwrap(), None);
    }

    #[test]
    fn test_std_io_adapters() {
        let process = mock_process(MockIo::new(b"first\nsecond\n"));
        let mut reader = io::BufReader::new(&process);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "first\n");

        let mut writer = &process;
        writer.write_all(b"abc").unwrap();
        writer.flush().unwrap();
    }

    #[test]
    fn test_misc_accessors() {
        let process = mock_process(MockIo::new(b""));
        assert_eq!(process.basename(), "mock");
        assert!(process.set_restart(false));
        assert!(!process.set_restart(true));
        assert!(!process.isatty());
        assert_eq!(process.filenos().unwrap(), vec![42]);
        Pollable::handle_error(&process, &ProcessError::BadDescriptor);
    }
}
