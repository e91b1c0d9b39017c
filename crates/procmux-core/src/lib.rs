//! procmux core - platform-independent types for process supervision
//!
//! This crate provides the exit-status model, error types, spawn and manager
//! configuration, log sinks and the traits shared with platform-specific
//! implementations.

mod config;
mod credential;
mod error;
mod exit_status;
mod log;
mod poller;
mod process;

pub use config::*;
pub use credential::*;
pub use error::*;
pub use exit_status::*;
pub use log::*;
pub use poller::*;
pub use process::*;
