use procmux_core::{ProcessError, Result, SpawnOptions};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::Stdio;
use tracing::debug;

use crate::exec;
use crate::fd;
use crate::process::{ProcessIo, Spawned};

/// Child stdio connected through anonymous pipes
pub struct PipeIo {
    stdin: File,
    stdout: File,
    stderr: Option<File>,
}

impl PipeIo {
    pub(crate) fn new(stdin: File, stdout: File, stderr: Option<File>) -> PipeIo {
        PipeIo {
            stdin,
            stdout,
            stderr,
        }
    }
}

impl ProcessIo for PipeIo {
    fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf)
    }

    fn read_err_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stderr.as_mut() {
            Some(stderr) => stderr.read(buf),
            None => Ok(0),
        }
    }

    fn write_raw(&mut self, data: &[u8]) -> io::Result<usize> {
        self.stdin.write(data)
    }

    fn fileno(&self) -> RawFd {
        self.stdout.as_raw_fd()
    }

    fn filenos(&self) -> Vec<RawFd> {
        let mut fds = vec![self.stdout.as_raw_fd(), self.stdin.as_raw_fd()];
        fds.extend(self.stderr.as_ref().map(|stderr| stderr.as_raw_fd()));
        fds
    }

    fn set_nonblocking(&mut self, flag: bool) -> io::Result<()> {
        fd::set_nonblocking(&self.stdin, flag)?;
        fd::set_nonblocking(&self.stdout, flag)?;
        if let Some(stderr) = self.stderr.as_ref() {
            fd::set_nonblocking(stderr, flag)?;
        }
        Ok(())
    }

    fn isatty(&self) -> bool {
        fd::isatty(&self.stdin)
    }
}

/// Both ends of the stdio pipes for one child
pub(crate) struct StdioPipes {
    pub(crate) child_stdin: OwnedFd,
    pub(crate) child_stdout: OwnedFd,
    pub(crate) child_stderr: OwnedFd,
    parent: PipeIo,
}

impl StdioPipes {
    /// With `merge` the child's stderr shares its stdout pipe
    pub(crate) fn new(merge: bool) -> io::Result<StdioPipes> {
        let (child_stdin, parent_stdin) = fd::pipe()?;
        let (parent_stdout, child_stdout) = fd::pipe()?;
        let (parent_stderr, child_stderr) = if merge {
            (None, child_stdout.try_clone()?)
        } else {
            let (read, write) = fd::pipe()?;
            (Some(File::from(read)), write)
        };

        Ok(StdioPipes {
            child_stdin,
            child_stdout,
            child_stderr,
            parent: PipeIo::new(
                File::from(parent_stdin),
                File::from(parent_stdout),
                parent_stderr,
            ),
        })
    }

    /// Close the child's ends and keep the parent's
    pub(crate) fn into_parent(self) -> PipeIo {
        self.parent
    }

    /// In a forked child: move the child ends onto 0, 1 and 2 and close the rest
    pub(crate) fn attach_child(self) -> io::Result<()> {
        fd::dup_stdio(&self.child_stdin, libc::STDIN_FILENO)?;
        fd::dup_stdio(&self.child_stdout, libc::STDOUT_FILENO)?;
        fd::dup_stdio(&self.child_stderr, libc::STDERR_FILENO)?;
        // dropping closes the originals; the descriptors on 0-2 stay open
        let StdioPipes {
            child_stdin,
            child_stdout,
            child_stderr,
            parent,
        } = self;
        for owned in [child_stdin, child_stdout, child_stderr] {
            if owned.as_raw_fd() > 2 {
                drop(owned);
            } else {
                std::mem::forget(owned);
            }
        }
        drop(parent);
        Ok(())
    }
}

/// Spawn `cmdline` with its stdio connected to fresh pipes
pub(crate) fn spawn(cmdline: &str, options: &SpawnOptions) -> Result<Spawned> {
    let mut command = exec::new_command(cmdline, options)?;
    if let Some(credential) = &options.credential {
        exec::drop_privileges(&mut command, credential)?;
    }

    let pipes = StdioPipes::new(options.merge)?;
    command
        .stdin(Stdio::from(pipes.child_stdin.try_clone()?))
        .stdout(Stdio::from(pipes.child_stdout.try_clone()?))
        .stderr(Stdio::from(pipes.child_stderr.try_clone()?));

    let child = command
        .spawn()
        .map_err(|e| ProcessError::spawn_failed(cmdline, e))?;
    // the command holds the child's ends until dropped
    drop(command);
    let transport = pipes.into_parent();

    let pid = child.id();
    debug!(pid, "spawned '{}' on pipes", cmdline);
    Ok(Spawned {
        stages: vec![(pid, cmdline.to_string())],
        transport: Some(Box::new(transport)),
    })
}
