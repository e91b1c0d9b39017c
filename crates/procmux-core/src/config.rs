use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::credential::Credential;
use crate::error::ProcessError;
use crate::log::ProcessLog;

/// Process-wide supervision settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagerConfig {
    /// Pause before a persistent process is respawned (in milliseconds)
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    /// Where a forked child records a failure escaping its entry function
    #[serde(default = "default_child_error_log")]
    pub child_error_log: PathBuf,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: default_restart_delay_ms(),
            child_error_log: default_child_error_log(),
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_child_error_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.child_error_log = path.into();
        self
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), ProcessError> {
        if self.restart_delay_ms > 60_000 {
            return Err(ProcessError::Configuration(
                "restart_delay_ms should not exceed 60 seconds".to_string(),
            ));
        }

        if self.child_error_log.as_os_str().is_empty() {
            return Err(ProcessError::Configuration(
                "child_error_log cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Per-spawn options
#[derive(Debug, Clone, Builder)]
#[builder(setter(into, strip_option))]
pub struct SpawnOptions {
    /// Complete child environment; `None` inherits the parent's
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: Option<HashMap<String, String>>,
    /// Send stderr down the stdout stream
    #[builder(default = "true")]
    pub merge: bool,
    #[builder(default)]
    pub credential: Option<Credential>,
    /// Respawn after abnormal death
    #[builder(default)]
    pub persistent: bool,
    /// Register with the manager's readiness poller
    #[builder(default)]
    pub polled: bool,
    /// Detach a pty child's standard streams from the terminal
    #[builder(default)]
    pub devnull: bool,
    #[builder(default)]
    pub log: Option<ProcessLog>,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            env: None,
            merge: true,
            credential: None,
            persistent: false,
            polled: false,
            devnull: false,
            log: None,
        }
    }
}

impl SpawnOptions {
    pub fn builder() -> SpawnOptionsBuilder {
        SpawnOptionsBuilder::default()
    }

    /// Environment handed to the child, credential variables applied last
    pub fn child_env(&self) -> Option<HashMap<String, String>> {
        let mut env = self.env.clone();
        if let Some(credential) = &self.credential {
            let map = env.get_or_insert_with(|| std::env::vars().collect());
            map.extend(credential.environment());
        }
        env
    }
}

impl SpawnOptionsBuilder {
    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self
            .env
            .get_or_insert_with(|| Some(HashMap::new()))
            .get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let map = self
            .env
            .get_or_insert_with(|| Some(HashMap::new()))
            .get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            map.insert(key.to_string(), value.to_string());
        }
        self
    }
}

impl From<SpawnOptionsBuilderError> for ProcessError {
    fn from(error: SpawnOptionsBuilderError) -> Self {
        ProcessError::Configuration(error.to_string())
    }
}

// Default value functions for serde
fn default_restart_delay_ms() -> u64 {
    1_000
}
fn default_child_error_log() -> PathBuf {
    std::env::temp_dir().join("procmux_child.log")
}
