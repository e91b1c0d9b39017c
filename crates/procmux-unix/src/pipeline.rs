use nix::sys::signal::{self, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use procmux_core::{ProcessError, Result, SpawnOptions};
use std::fs::File;
use std::process::Stdio;
use tracing::{debug, warn};

use crate::command::split_pipeline;
use crate::exec;
use crate::fd;
use crate::pipe::PipeIo;
use crate::process::Spawned;

/// Spawn `first | second`. The caller writes to the first command and reads
/// from the second; both inherit our stderr.
pub(crate) fn spawn(cmdline: &str, options: &SpawnOptions) -> Result<Spawned> {
    let (first, second) = split_pipeline(cmdline)?;

    let mut producer = exec::new_command(&first, options)?;
    let mut consumer = exec::new_command(&second, options)?;
    if let Some(credential) = &options.credential {
        exec::drop_privileges(&mut producer, credential)?;
        exec::drop_privileges(&mut consumer, credential)?;
    }

    let (child_stdin, parent_stdin) = fd::pipe()?;
    let (link_read, link_write) = fd::pipe()?;
    let (parent_stdout, child_stdout) = fd::pipe()?;

    producer
        .stdin(Stdio::from(child_stdin))
        .stdout(Stdio::from(link_write));
    consumer
        .stdin(Stdio::from(link_read))
        .stdout(Stdio::from(child_stdout));

    let producer_child = producer
        .spawn()
        .map_err(|e| ProcessError::spawn_failed(first.as_str(), e))?;
    drop(producer);
    let producer_pid = producer_child.id();

    let consumer_child = match consumer.spawn() {
        Ok(child) => child,
        Err(e) => {
            abandon(producer_pid);
            return Err(ProcessError::spawn_failed(second.as_str(), e));
        }
    };
    drop(consumer);
    let consumer_pid = consumer_child.id();

    debug!(
        producer = producer_pid,
        consumer = consumer_pid,
        "spawned pipeline '{}'",
        cmdline
    );
    let transport = PipeIo::new(File::from(parent_stdin), File::from(parent_stdout), None);
    Ok(Spawned {
        stages: vec![(producer_pid, first), (consumer_pid, second)],
        transport: Some(Box::new(transport)),
    })
}

/// Kill and collect a first stage whose partner never started
fn abandon(pid: u32) {
    let pid = Pid::from_raw(pid as i32);
    if let Err(e) = signal::kill(pid, Signal::SIGKILL) {
        warn!("failed to kill orphaned pipeline stage {pid}: {e}");
    }
    if let Err(e) = waitpid(pid, None) {
        warn!("failed to collect orphaned pipeline stage {pid}: {e}");
    }
}
