//! Descriptor plumbing shared by the transports.

use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::unistd;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};

/// Anonymous pipe with both ends close-on-exec, returned as (read, write)
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC)?;

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    let (read, write) = unistd::pipe()?;

    set_cloexec(&read)?;
    set_cloexec(&write)?;
    Ok((read, write))
}

pub(crate) fn set_cloexec(fd: impl AsFd) -> io::Result<()> {
    let fd = fd.as_fd();
    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    if !flags.contains(FdFlag::FD_CLOEXEC) {
        fcntl(fd, FcntlArg::F_SETFD(flags | FdFlag::FD_CLOEXEC))?;
    }
    Ok(())
}

pub(crate) fn set_nonblocking(fd: impl AsFd, flag: bool) -> io::Result<()> {
    let fd = fd.as_fd();
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    let mut wanted = flags;
    wanted.set(OFlag::O_NONBLOCK, flag);
    if wanted != flags {
        fcntl(fd, FcntlArg::F_SETFL(wanted))?;
    }
    Ok(())
}

pub(crate) fn isatty(fd: impl AsFd) -> bool {
    unistd::isatty(fd).unwrap_or(false)
}

/// Name of the terminal behind `fd`, if any
pub(crate) fn ttyname(fd: impl AsFd) -> Option<String> {
    unistd::ttyname(fd)
        .ok()
        .map(|path| path.to_string_lossy().into_owned())
}

/// Make `fd` the child's stdin, stdout or stderr. Only used between fork and exec.
pub(crate) fn dup_stdio(fd: impl AsFd, target: RawFd) -> io::Result<()> {
    let fd = fd.as_fd();
    if fd.as_raw_fd() == target {
        // dup2 would leave close-on-exec set
        let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
        fcntl(fd, FcntlArg::F_SETFD(flags - FdFlag::FD_CLOEXEC))?;
        return Ok(());
    }
    match target {
        libc::STDIN_FILENO => unistd::dup2_stdin(fd)?,
        libc::STDOUT_FILENO => unistd::dup2_stdout(fd)?,
        libc::STDERR_FILENO => unistd::dup2_stderr(fd)?,
        _ => return Err(io::Error::from(io::ErrorKind::InvalidInput)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};

    #[test]
    fn test_pipe_is_cloexec() {
        let (read, write) = pipe().unwrap();
        for fd in [&read, &write] {
            let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD).unwrap());
            assert!(flags.contains(FdFlag::FD_CLOEXEC));
        }
        assert!(!isatty(&read));
        assert!(ttyname(&read).is_none());

        let mut writer = File::from(write);
        let mut reader = File::from(read);
        writer.write_all(b"ping").unwrap();
        drop(writer);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "ping");
    }

    #[test]
    fn test_nonblocking_read_would_block() {
        let (read, _write) = pipe().unwrap();
        set_nonblocking(&read, true).unwrap();
        let mut reader = File::from(read);
        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        set_nonblocking(&reader, false).unwrap();
        let flags = OFlag::from_bits_truncate(fcntl(&reader, FcntlArg::F_GETFL).unwrap());
        assert!(!flags.contains(OFlag::O_NONBLOCK));
    }

    #[test]
    fn test_dup_stdio_rejects_other_targets() {
        let (read, _write) = pipe().unwrap();
        let err = dup_stdio(&read, 1000).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
