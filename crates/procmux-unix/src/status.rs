//! Wait-status decoding.

use nix::sys::wait::WaitStatus;
use procmux_core::ExitStatus;

/// Translate a decoded wait status. Continue events carry no status and are skipped.
pub fn from_wait_status(cmdline: &str, status: WaitStatus) -> Option<ExitStatus> {
    match status {
        WaitStatus::Exited(_, code) => Some(ExitStatus::exited(cmdline, code)),
        WaitStatus::Signaled(_, signal, _) => Some(ExitStatus::signaled(cmdline, signal as i32)),
        WaitStatus::Stopped(_, signal) => Some(ExitStatus::stopped(cmdline, signal as i32)),
        _ => None,
    }
}

/// Translate a raw status word as filled in by `waitpid(2)` or `system(3)`
pub fn from_raw(cmdline: &str, raw: i32) -> Option<ExitStatus> {
    if libc::WIFEXITED(raw) {
        Some(ExitStatus::exited(cmdline, libc::WEXITSTATUS(raw)))
    } else if libc::WIFSTOPPED(raw) {
        Some(ExitStatus::stopped(cmdline, libc::WSTOPSIG(raw)))
    } else if libc::WIFSIGNALED(raw) {
        Some(ExitStatus::signaled(cmdline, libc::WTERMSIG(raw)))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;
    use nix::unistd::Pid;

    #[test]
    fn test_from_wait_status() {
        let pid = Pid::from_raw(100);
        let status = from_wait_status("true", WaitStatus::Exited(pid, 0)).unwrap();
        assert!(status.success());

        let status =
            from_wait_status("sleep 5", WaitStatus::Signaled(pid, Signal::SIGTERM, false)).unwrap();
        assert!(status.is_signalled());
        assert_eq!(status.signal(), Some(15));

        let status = from_wait_status("cat", WaitStatus::Stopped(pid, Signal::SIGSTOP)).unwrap();
        assert!(status.is_stopped());

        assert!(from_wait_status("cat", WaitStatus::StillAlive).is_none());
    }

    #[test]
    fn test_from_raw() {
        // exit(3) is encoded in the high byte
        let status = from_raw("sh", 3 << 8).unwrap();
        assert_eq!(status.code().unwrap(), 3);

        let status = from_raw("sh", libc::SIGKILL).unwrap();
        assert!(status.is_signalled());
        assert_eq!(status.signal(), Some(libc::SIGKILL));

        let status = from_raw("sh", (libc::SIGSTOP << 8) | 0x7f).unwrap();
        assert!(status.is_stopped());
    }
}
