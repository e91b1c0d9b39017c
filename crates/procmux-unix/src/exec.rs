//! Building the child side of a spawn.

use nix::sys::stat::{Mode, umask};
use nix::unistd::{self, Gid, Uid};
use procmux_core::{Credential, ProcessError, Result, SpawnOptions};
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::process::Command;

use crate::command::split_command_line;

/// A `Command` for `cmdline` with the environment from `options` applied
pub(crate) fn new_command(cmdline: &str, options: &SpawnOptions) -> Result<Command> {
    let argv = split_command_line(cmdline)?;
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| ProcessError::InvalidCommand(cmdline.to_string()))?;

    let mut command = Command::new(program);
    command.args(args);
    if let Some(env) = options.child_env() {
        command.env_clear().envs(env);
    }
    Ok(command)
}

/// Arrange for the child to switch identity before exec
pub(crate) fn drop_privileges(command: &mut Command, credential: &Credential) -> Result<()> {
    let switch = PrivilegeDrop::new(credential)?;
    // SAFETY: apply only makes async-signal-safe calls and does not allocate
    unsafe {
        command.pre_exec(move || switch.apply());
    }
    Ok(())
}

/// Identity switch prepared in the parent so the child does not allocate
pub(crate) struct PrivilegeDrop {
    home: CString,
    uid: Uid,
    gid: Gid,
    #[cfg_attr(target_vendor = "apple", allow(dead_code))]
    groups: Vec<Gid>,
}

impl PrivilegeDrop {
    pub(crate) fn new(credential: &Credential) -> Result<PrivilegeDrop> {
        let home = CString::new(credential.home.as_os_str().as_bytes()).map_err(|_| {
            ProcessError::Configuration(format!(
                "home directory of '{}' contains a NUL byte",
                credential.name
            ))
        })?;
        Ok(PrivilegeDrop {
            home,
            uid: Uid::from_raw(credential.uid),
            gid: Gid::from_raw(credential.gid),
            groups: credential
                .all_groups()
                .into_iter()
                .map(Gid::from_raw)
                .collect(),
        })
    }

    /// umask 022, chdir home (falling back to `/`), then groups, gid and uid
    pub(crate) fn apply(&self) -> io::Result<()> {
        umask(Mode::from_bits_truncate(0o022));
        if unistd::chdir(self.home.as_c_str()).is_err() {
            unistd::chdir(c"/")?;
        }
        // supplementary groups stay untouched where nix has no setgroups
        #[cfg(not(target_vendor = "apple"))]
        unistd::setgroups(&self.groups)?;
        unistd::setgid(self.gid)?;
        unistd::setuid(self.uid)?;
        Ok(())
    }
}
