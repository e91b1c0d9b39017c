use nix::pty::openpty;
use nix::sys::termios::{SpecialCharacterIndices, tcgetattr};
use procmux_core::{ProcessError, Result, SpawnOptions};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use tracing::debug;

use crate::exec;
use crate::fd;
use crate::process::{ProcessIo, Spawned};

/// ETX, the usual interrupt character
const DEFAULT_INTR: u8 = 0x03;

/// Master side of a pseudo-terminal
pub struct PtyIo {
    master: File,
    intr: Option<u8>,
}

impl PtyIo {
    pub(crate) fn new(master: File) -> PtyIo {
        PtyIo { master, intr: None }
    }
}

impl ProcessIo for PtyIo {
    fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.master.read(buf) {
            // the slave side has no more openers
            Err(e) if e.raw_os_error() == Some(libc::EIO) => Ok(0),
            result => result,
        }
    }

    fn write_raw(&mut self, data: &[u8]) -> io::Result<usize> {
        self.master.write(data)
    }

    fn fileno(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    fn filenos(&self) -> Vec<RawFd> {
        vec![self.master.as_raw_fd()]
    }

    fn set_nonblocking(&mut self, flag: bool) -> io::Result<()> {
        fd::set_nonblocking(&self.master, flag)
    }

    fn isatty(&self) -> bool {
        fd::isatty(&self.master)
    }

    fn ttyname(&self) -> Option<String> {
        fd::ttyname(&self.master)
    }

    fn interrupt_char(&mut self) -> Option<u8> {
        if self.intr.is_none() {
            let intr = match tcgetattr(&self.master) {
                Ok(termios) => termios.control_chars[SpecialCharacterIndices::VINTR as usize],
                Err(e) => {
                    debug!("tcgetattr failed, using ^C: {e}");
                    DEFAULT_INTR
                }
            };
            self.intr = Some(intr);
        }
        self.intr
    }
}

fn dev_null(write: bool) -> io::Result<File> {
    OpenOptions::new()
        .read(!write)
        .append(write)
        .open("/dev/null")
}

/// Spawn `cmdline` on a new pseudo-terminal that becomes its controlling terminal
pub(crate) fn spawn(cmdline: &str, options: &SpawnOptions) -> Result<Spawned> {
    let mut command = exec::new_command(cmdline, options)?;

    let pty = openpty(None, None).map_err(io::Error::from)?;
    fd::set_cloexec(&pty.master)?;
    fd::set_cloexec(&pty.slave)?;
    let slave = File::from(pty.slave);

    if options.devnull {
        let output = match options.log.as_ref().and_then(|log| log.child_stdio()) {
            Some(file) => file?,
            None => dev_null(true)?,
        };
        command
            .stdin(Stdio::from(dev_null(false)?))
            .stdout(Stdio::from(output.try_clone()?))
            .stderr(Stdio::from(output));
    } else {
        command
            .stdin(Stdio::from(slave.try_clone()?))
            .stdout(Stdio::from(slave.try_clone()?))
            .stderr(Stdio::from(slave.try_clone()?));
    }

    let slave_fd = slave.as_raw_fd();
    // SAFETY: setsid and ioctl are async-signal-safe
    unsafe {
        command.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    if let Some(credential) = &options.credential {
        exec::drop_privileges(&mut command, credential)?;
    }

    let child = command
        .spawn()
        .map_err(|e| ProcessError::spawn_failed(cmdline, e))?;
    drop(command);
    drop(slave);

    let pid = child.id();
    debug!(pid, "spawned '{}' on a pty", cmdline);
    Ok(Spawned {
        stages: vec![(pid, cmdline.to_string())],
        transport: Some(Box::new(PtyIo::new(File::from(pty.master)))),
    })
}
