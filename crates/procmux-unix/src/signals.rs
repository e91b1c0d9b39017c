//! Child-state signal handling.
//!
//! The installed handler only raises a flag and writes a byte to a
//! non-blocking self-pipe. Reaping happens in ordinary code, driven by
//! whoever watches [`signal_fd`].

use nix::errno::Errno;
use nix::sys::signal::{
    self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, pthread_sigmask,
};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use tracing::debug;

use crate::fd;

static PENDING: AtomicBool = AtomicBool::new(false);
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

struct HandlerState {
    installs: usize,
    previous: Option<SigAction>,
    wake_read: Option<File>,
    wake_write: Option<OwnedFd>,
}

static HANDLER: Mutex<HandlerState> = parking_lot::const_mutex(HandlerState {
    installs: 0,
    previous: None,
    wake_read: None,
    wake_write: None,
});

extern "C" fn on_child_signal(_signal: libc::c_int) {
    let saved = Errno::last_raw();
    PENDING.store(true, Ordering::SeqCst);
    let fd = WAKE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = 1u8;
        // a full pipe already guarantees a wakeup
        unsafe {
            libc::write(fd, (&byte as *const u8).cast(), 1);
        }
    }
    Errno::set_raw(saved);
}

/// Keeps the SIGCHLD handler installed while alive
#[derive(Debug)]
pub(crate) struct SignalRegistration {
    _private: (),
}

impl SignalRegistration {
    pub(crate) fn install() -> io::Result<SignalRegistration> {
        let mut state = HANDLER.lock();
        if state.installs == 0 {
            let (read, write) = fd::pipe()?;
            fd::set_nonblocking(&read, true)?;
            fd::set_nonblocking(&write, true)?;
            WAKE_FD.store(write.as_raw_fd(), Ordering::SeqCst);

            let action = SigAction::new(
                SigHandler::Handler(on_child_signal),
                SaFlags::SA_RESTART,
                SigSet::empty(),
            );
            let previous = match unsafe { signal::sigaction(Signal::SIGCHLD, &action) } {
                Ok(previous) => previous,
                Err(errno) => {
                    WAKE_FD.store(-1, Ordering::SeqCst);
                    return Err(errno.into());
                }
            };

            state.previous = Some(previous);
            state.wake_read = Some(File::from(read));
            state.wake_write = Some(write);
            debug!("installed SIGCHLD handler");
        }
        state.installs += 1;
        Ok(SignalRegistration { _private: () })
    }
}

impl Drop for SignalRegistration {
    fn drop(&mut self) {
        let mut state = HANDLER.lock();
        state.installs = state.installs.saturating_sub(1);
        if state.installs > 0 {
            return;
        }
        if let Some(previous) = state.previous.take() {
            if let Err(e) = unsafe { signal::sigaction(Signal::SIGCHLD, &previous) } {
                debug!("failed to restore SIGCHLD disposition: {e}");
            }
        }
        WAKE_FD.store(-1, Ordering::SeqCst);
        state.wake_read = None;
        state.wake_write = None;
        debug!("removed SIGCHLD handler");
    }
}

/// Read end of the self-pipe, readable whenever a child changed state
pub fn signal_fd() -> Option<RawFd> {
    HANDLER.lock().wake_read.as_ref().map(|file| file.as_raw_fd())
}

/// Whether a child signal arrived since the last call. Drains the self-pipe.
pub(crate) fn take_pending() -> bool {
    if let Some(reader) = HANDLER.lock().wake_read.as_mut() {
        let mut buf = [0u8; 64];
        while matches!(reader.read(&mut buf), Ok(n) if n > 0) {}
    }
    PENDING.swap(false, Ordering::SeqCst)
}

/// Blocks SIGCHLD on the calling thread, restoring the previous mask on drop
pub(crate) struct ChildSignalGuard {
    previous: SigSet,
}

impl ChildSignalGuard {
    pub(crate) fn block() -> io::Result<ChildSignalGuard> {
        let mut blocked = SigSet::empty();
        blocked.add(Signal::SIGCHLD);
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&blocked), Some(&mut previous))?;
        Ok(ChildSignalGuard { previous })
    }
}

impl Drop for ChildSignalGuard {
    fn drop(&mut self) {
        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None) {
            debug!("failed to restore signal mask: {e}");
        }
    }
}

/// Give a freshly forked child default signal state
pub(crate) fn reset_in_child() {
    WAKE_FD.store(-1, Ordering::SeqCst);
    unsafe {
        let _ = signal::signal(Signal::SIGCHLD, SigHandler::SigDfl);
    }
    let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
}
