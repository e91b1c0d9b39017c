use nix::unistd::User;
use procmux_core::{Credential, ProcessError, Result};
use std::io;

/// Look a [`Credential`] up in the system user database
pub trait CredentialLookup: Sized {
    fn lookup(name: &str) -> Result<Self>;
}

impl CredentialLookup for Credential {
    fn lookup(name: &str) -> Result<Credential> {
        let user = User::from_name(name)
            .map_err(io::Error::from)?
            .ok_or_else(|| ProcessError::Configuration(format!("unknown user '{name}'")))?;

        Ok(Credential {
            name: user.name.clone(),
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir.clone(),
            shell: user.shell.clone(),
            groups: supplementary_groups(&user),
        })
    }
}

#[cfg(target_os = "linux")]
fn supplementary_groups(user: &User) -> Vec<u32> {
    let Ok(name) = std::ffi::CString::new(user.name.as_str()) else {
        return vec![user.gid.as_raw()];
    };
    match nix::unistd::getgrouplist(&name, user.gid) {
        Ok(groups) => groups.into_iter().map(|gid| gid.as_raw()).collect(),
        Err(_) => vec![user.gid.as_raw()],
    }
}

#[cfg(not(target_os = "linux"))]
fn supplementary_groups(user: &User) -> Vec<u32> {
    vec![user.gid.as_raw()]
}
