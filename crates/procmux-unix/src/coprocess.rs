//! Running a closure in a forked child.

use nix::unistd::{self, ForkResult};
use procmux_core::{ProcessId, Result, SpawnOptions};
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Display;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use crate::exec::PrivilegeDrop;
use crate::signals;

/// Exit status a child reports for the value its entry function returned
pub const CHILD_FAILURE: i32 = 127;

/// Conversion of a child entry function's return value into an exit code
pub trait ChildOutcome {
    /// `Err` carries a description of a failure worth recording
    fn into_exit_code(self) -> std::result::Result<i32, String>;
}

impl ChildOutcome for () {
    fn into_exit_code(self) -> std::result::Result<i32, String> {
        Ok(0)
    }
}

impl ChildOutcome for i32 {
    fn into_exit_code(self) -> std::result::Result<i32, String> {
        Ok(self)
    }
}

impl ChildOutcome for u8 {
    fn into_exit_code(self) -> std::result::Result<i32, String> {
        Ok(self.into())
    }
}

impl ChildOutcome for bool {
    fn into_exit_code(self) -> std::result::Result<i32, String> {
        Ok(if self { 0 } else { 1 })
    }
}

impl<T: ChildOutcome, E: Display> ChildOutcome for std::result::Result<T, E> {
    fn into_exit_code(self) -> std::result::Result<i32, String> {
        match self {
            Ok(value) => value.into_exit_code(),
            Err(e) => Err(e.to_string()),
        }
    }
}

pub(crate) enum Forked {
    Child,
    Parent(ProcessId),
}

pub(crate) fn fork() -> Result<Forked> {
    // SAFETY: the child side only runs `enter_child`, which never returns
    match unsafe { unistd::fork() }.map_err(io::Error::from)? {
        ForkResult::Parent { child } => Ok(Forked::Parent(child.as_raw() as ProcessId)),
        ForkResult::Child => Ok(Forked::Child),
    }
}

/// Name used for the command line of forked children
pub(crate) fn program_name() -> String {
    std::env::args()
        .next()
        .unwrap_or_else(|| "procmux".to_string())
}

/// Identity and environment a forked child takes on before running
pub(crate) struct ChildSetup {
    env: Option<HashMap<String, String>>,
    privileges: Option<PrivilegeDrop>,
}

impl ChildSetup {
    pub(crate) fn new(options: &SpawnOptions) -> Result<ChildSetup> {
        let privileges = options
            .credential
            .as_ref()
            .map(PrivilegeDrop::new)
            .transpose()?;
        Ok(ChildSetup {
            env: options.child_env(),
            privileges,
        })
    }

    fn apply(&self) -> io::Result<()> {
        if let Some(privileges) = &self.privileges {
            privileges.apply()?;
        }
        if let Some(env) = &self.env {
            // SAFETY: a freshly forked child has a single thread
            unsafe {
                for (key, _) in std::env::vars_os() {
                    std::env::remove_var(key);
                }
                for (key, value) in env {
                    std::env::set_var(key, value);
                }
            }
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

fn record_failure(error_log: &Path, message: &str) {
    let opened = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(error_log);
    if let Ok(mut file) = opened {
        let _ = writeln!(file, "child {} failed: {}", std::process::id(), message);
    }
}

/// Leave a forked child after a setup failure
pub(crate) fn abort_child(error_log: &Path, message: &str) -> ! {
    record_failure(error_log, message);
    // SAFETY: _exit skips atexit handlers and never returns
    unsafe { libc::_exit(CHILD_FAILURE) }
}

/// Run `entry` in a forked child and exit with the code it produces.
/// Failures and panics are written to `error_log` and exit with 127.
pub(crate) fn enter_child<F, R>(setup: &ChildSetup, entry: F, error_log: &Path) -> !
where
    F: FnOnce() -> R,
    R: ChildOutcome,
{
    signals::reset_in_child();
    if let Err(e) = setup.apply() {
        abort_child(error_log, &format!("setup failed: {e}"));
    }

    let code = match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(outcome) => match outcome.into_exit_code() {
            Ok(code) => code,
            Err(message) => {
                record_failure(error_log, &message);
                CHILD_FAILURE
            }
        },
        Err(payload) => {
            record_failure(error_log, &panic_message(payload.as_ref()));
            CHILD_FAILURE
        }
    };

    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
    // SAFETY: as in abort_child
    unsafe { libc::_exit(code) }
}
