use std::os::fd::RawFd;
use std::sync::Arc;

use crate::ProcessId;
use crate::error::{ProcessError, Result};

/// An object an external readiness poller can watch
pub trait Pollable: Send + Sync {
    /// Primary descriptor to watch
    fn fileno(&self) -> Result<RawFd>;

    /// All descriptors owned by this object
    fn filenos(&self) -> Result<Vec<RawFd>>;

    fn readable(&self) -> bool;

    fn writable(&self) -> bool;

    fn priority(&self) -> bool {
        false
    }

    /// Called when the descriptor is readable
    fn handle_read(&self);

    /// Called when the descriptor is writable
    fn handle_write(&self);

    fn handle_hangup(&self) {}

    fn handle_error(&self, error: &ProcessError);
}

/// Registry side of a readiness poller.
///
/// Registrations are keyed by the primary pid of the process they belong to.
pub trait Poller: Send + Sync {
    fn register(&self, key: ProcessId, target: Arc<dyn Pollable>);

    fn unregister(&self, key: ProcessId);

    /// Forget every registration without touching the targets
    fn clear(&self);
}

/// Poller that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPoller;

impl Poller for NullPoller {
    fn register(&self, _key: ProcessId, _target: Arc<dyn Pollable>) {}

    fn unregister(&self, _key: ProcessId) {}

    fn clear(&self) {}
}
