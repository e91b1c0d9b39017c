use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// User identity a child drops to before running its command.
///
/// Applying it requires the parent to hold root privileges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    pub shell: PathBuf,
    #[serde(default)]
    pub groups: Vec<u32>,
}

impl Credential {
    /// Environment the child sees after the privilege drop
    pub fn environment(&self) -> Vec<(String, String)> {
        vec![
            ("HOME".to_string(), self.home.display().to_string()),
            ("USER".to_string(), self.name.clone()),
            ("LOGNAME".to_string(), self.name.clone()),
            ("SHELL".to_string(), self.shell.display().to_string()),
            ("PATH".to_string(), "/bin:/usr/bin:/usr/local/bin".to_string()),
        ]
    }

    /// Supplementary groups, always including the primary group
    pub fn all_groups(&self) -> Vec<u32> {
        let mut groups = self.groups.clone();
        if !groups.contains(&self.gid) {
            groups.insert(0, self.gid);
        }
        groups
    }
}
