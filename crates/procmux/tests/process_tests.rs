use anyhow::Result;
use procmux::{
    ExitState, ManagerConfig, NullPoller, Pollable, Poller, ProcManager, ProcessError, ProcessId,
    ProcessKind, ProcessManager, SharedBuffer, Signal, SpawnOptions, WaitMode, getstatusoutput,
};
use serial_test::serial;
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn manager() -> ProcManager {
    procmux::init_tracing("debug");
    ProcManager::new(ManagerConfig::new().with_restart_delay(Duration::from_millis(20))).unwrap()
}

fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

/// Bytes written to `cat` come back unchanged
#[test]
#[serial]
fn test_pipe_write_read_identity() -> Result<()> {
    let manager = manager();
    let cat = manager.spawn_pipe("cat", SpawnOptions::default())?;

    cat.write(b"hello world\n")?;
    assert_eq!(cat.readline()?, b"hello world\n");

    let payload: Vec<u8> = (0..200u8).cycle().take(3000).collect();
    cat.write(&payload)?;
    cat.flush()?;
    assert_eq!(cat.read(payload.len())?, payload);

    cat.close();
    assert!(matches!(cat.fileno(), Err(ProcessError::BadDescriptor)));
    let status = cat.wait()?;
    assert!(status.success());
    Ok(())
}

/// The `cat` scenario: read back a line, close, reap, then collect exit 0
#[test]
#[serial]
fn test_close_then_reap_cat() -> Result<()> {
    let manager = manager();
    let cat = manager.spawn_pipe("cat", SpawnOptions::default())?;
    cat.write(b"hello\n")?;
    assert_eq!(cat.read(6)?, b"hello\n");

    cat.close();
    assert!(eventually(|| {
        manager.reap();
        cat.is_dead()
    }));
    let status = cat.wait()?;
    assert!(status.is_exited());
    assert_eq!(status.code()?, 0);
    Ok(())
}

/// With merging off, stderr is read on its own and stdout stays clean
#[test]
#[serial]
fn test_readerr_without_merge() -> Result<()> {
    let manager = manager();
    let options = SpawnOptions::builder().merge(false).build()?;
    let process = manager.spawn_pipe("sh -c 'echo out; echo err >&2; echo more'", options)?;
    assert_eq!(process.read_to_end()?, b"out\nmore\n");
    assert_eq!(process.readerr(100)?, b"err\n");
    assert!(process.readerr(100)?.is_empty());
    assert!(process.wait()?.success());
    Ok(())
}

/// The interrupt character goes through the terminal and kills `cat`
#[test]
#[serial]
fn test_pty_interrupt_kills_foreground() -> Result<()> {
    let manager = manager();
    let cat = manager.spawn_pty("cat", SpawnOptions::default())?;
    cat.interrupt()?;
    let status = cat.wait()?;
    assert!(status.is_signalled());
    assert_eq!(status.signal(), Some(Signal::SIGINT as i32));
    Ok(())
}

/// With signal generation off the interrupt character arrives as data
#[test]
#[serial]
fn test_pty_interrupt_writes_terminal_character() -> Result<()> {
    let manager = manager();
    let process = manager.spawn_pty(
        "sh -c 'stty -isig -echo; echo ready; cat'",
        SpawnOptions::default(),
    )?;
    assert_eq!(process.readline()?, b"ready\r\n");

    process.interrupt()?;
    assert_eq!(process.read(1)?, b"\x03");
    assert!(process.is_alive());

    let status = process.killwait(Signal::SIGKILL)?;
    assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
    Ok(())
}

/// The `cat` scenario: write, read back, kill, and check the signal
#[test]
#[serial]
fn test_killwait_reports_signal() -> Result<()> {
    let manager = manager();
    let cat = manager.spawn_pipe("cat", SpawnOptions::default())?;
    cat.write(b"abc\n")?;
    assert_eq!(cat.read(4)?, b"abc\n");

    let status = cat.killwait(Signal::SIGTERM)?;
    assert_eq!(status.state(), ExitState::Signaled);
    assert!(status.is_signalled());
    assert_eq!(status.signal(), Some(15));
    assert!(!status.success());
    assert!(matches!(
        status.code(),
        Err(ProcessError::NotExitedNormally { .. })
    ));
    assert_eq!(status.to_string(), "cat exited by signal 15.");
    assert!(cat.is_dead());

    // a dead process ignores further signals
    cat.kill(Signal::SIGKILL)?;
    assert_eq!(cat.killwait(Signal::SIGKILL)?, status);
    Ok(())
}

#[test]
#[serial]
fn test_exit_codes() -> Result<()> {
    let manager = manager();
    for code in [0, 1, 42, 255] {
        let process = manager.spawn_pipe(&format!("sh -c 'exit {code}'"), SpawnOptions::default())?;
        let status = process.wait()?;
        assert!(status.is_exited());
        assert_eq!(status.code()?, code);
        assert_eq!(status.success(), code == 0);
        assert_eq!(i32::try_from(&status)?, code);
    }
    Ok(())
}

#[test]
#[serial]
fn test_status_output() -> Result<()> {
    let manager = manager();
    let (status, text) = getstatusoutput(&manager, "sh -c 'echo out; echo err >&2; exit 2'")?;
    assert_eq!(status.code()?, 2);
    assert!(text.contains("out\n"));
    assert!(text.contains("err\n"));

    let status = procmux::call(&manager, "echo ignored", SpawnOptions::default())?;
    assert!(status.success());
    Ok(())
}

/// Waiting twice, or reaping after a wait, never consults the OS again
#[test]
#[serial]
fn test_reap_idempotence() -> Result<()> {
    let manager = manager();
    let process = manager.spawn_pipe("sh -c 'exit 5'", SpawnOptions::default())?;
    let pid = process.pid();

    assert!(eventually(|| {
        manager.reap();
        process.is_dead()
    }));
    assert!(manager.child_status(pid).is_some());
    assert_eq!(manager.waitproc(&process, WaitMode::NoHang)?.map(|s| s.code().ok()), Some(Some(5)));
    assert!(manager.child_status(pid).is_none());

    assert_eq!(manager.reap(), 0);
    assert_eq!(process.wait()?.code()?, 5);
    assert_eq!(manager.waitproc(&process, WaitMode::Block)?.map(|s| s.code().ok()), Some(Some(5)));
    Ok(())
}

/// An abnormal death restarts, an explicit kill does not
#[test]
#[serial]
fn test_persistent_restart() -> Result<()> {
    let manager = manager();
    let log = SharedBuffer::new();
    let options = SpawnOptions::builder()
        .persistent(true)
        .log(log.clone().into_log())
        .build()?;
    let original = manager.spawn_pipe("sleep 30", options)?;
    let original_pid = original.pid();

    // a signal from outside the manager
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(original_pid as i32),
        Signal::SIGTERM,
    )?;
    assert!(eventually(|| {
        manager.reap();
        manager.pids().iter().any(|pid| *pid != original_pid)
    }));
    assert!(original.is_dead());
    assert!(log.to_string_lossy().contains("died"));

    let replacement = manager
        .by_name("sleep")
        .pop()
        .ok_or_else(|| anyhow::anyhow!("no replacement process"))?;
    assert_ne!(replacement.pid(), original_pid);
    assert_eq!(replacement.cmdline(), "sleep 30");
    assert!(replacement.options().persistent);

    manager.kill(&replacement, Signal::SIGTERM)?;
    assert!(replacement.wait()?.is_signalled());
    thread::sleep(Duration::from_millis(200));
    manager.reap();
    assert!(manager.is_empty());
    Ok(())
}

/// Both halves of a pipeline are registered, read through, and killed
#[test]
#[serial]
fn test_pipeline_read_and_kill() -> Result<()> {
    let manager = manager();
    let pipeline = manager.spawn_pipe("printf 'b\\na\\nc\\n' | sort", SpawnOptions::default())?;
    assert_eq!(pipeline.kind(), ProcessKind::Pipeline);
    assert_eq!(pipeline.read_to_end()?, b"a\nb\nc\n");
    assert!(pipeline.wait()?.success());

    let endless = manager.spawn_pipe("sleep 30 | cat", SpawnOptions::default())?;
    let pids = endless.pids();
    assert_eq!(pids.len(), 2);
    let status = endless.killwait(Signal::SIGKILL)?;
    assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
    for pid in pids {
        assert!(manager.by_pid(pid).is_none());
    }
    Ok(())
}

/// The pty scenario: output arrives through the terminal and status is exit 3
#[test]
#[serial]
fn test_pty_exit_status() -> Result<()> {
    let manager = manager();
    let process = manager.spawn_pty("sh -c 'echo on a tty; exit 3'", SpawnOptions::default())?;
    assert!(process.isatty());
    let text = String::from_utf8_lossy(&process.read_to_end()?).into_owned();
    assert!(text.contains("on a tty"));
    let status = process.wait()?;
    assert_eq!(status.code()?, 3);
    assert_eq!(status.to_string(), "sh: Exited abnormally with status 3.");
    Ok(())
}

#[test]
#[serial]
fn test_pty_devnull_writes_to_log_file() -> Result<()> {
    let manager = manager();
    let file = tempfile::NamedTempFile::new()?;
    let options = SpawnOptions::builder()
        .devnull(true)
        .log(procmux::ProcessLog::from_file(file.reopen()?)?)
        .build()?;
    let process = manager.spawn_pty("echo to the log", options)?;
    assert!(process.wait()?.success());
    let text = std::fs::read_to_string(file.path())?;
    assert!(text.contains("to the log"));
    Ok(())
}

#[test]
#[serial]
fn test_explicit_environment() -> Result<()> {
    let manager = manager();
    let env: HashMap<&str, &str> = [("PROCMUX_TEST", "yes")].into_iter().collect();
    let options = SpawnOptions::builder().env_multi(env).build()?;
    let process = manager.spawn_pipe("printenv PROCMUX_TEST", options)?;
    assert_eq!(process.read_to_string()?, "yes\n");
    assert!(process.wait()?.success());
    Ok(())
}

#[test]
#[serial]
fn test_coprocess_echo() -> Result<()> {
    let manager = manager();
    let process = manager.coprocess(
        || {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            std::io::stdout().write_all(line.to_uppercase().as_bytes())?;
            Ok::<bool, std::io::Error>(line.starts_with("ok"))
        },
        SpawnOptions::default(),
    )?;
    process.write(b"ok then\n")?;
    assert_eq!(process.readline()?, b"OK THEN\n");
    assert!(process.wait()?.success());
    Ok(())
}

#[test]
#[serial]
fn test_missing_command_fails_synchronously() {
    let manager = manager();
    let result = manager.spawn_pipe("procmux-definitely-missing", SpawnOptions::default());
    assert!(matches!(result, Err(ProcessError::SpawnFailed { .. })));
    assert!(manager.is_empty());
}

#[derive(Default)]
struct RecordingPoller {
    registered: Mutex<Vec<ProcessId>>,
}

impl Poller for RecordingPoller {
    fn register(&self, key: ProcessId, target: Arc<dyn Pollable>) {
        assert!(target.fileno().is_ok());
        self.registered.lock().unwrap().push(key);
    }

    fn unregister(&self, key: ProcessId) {
        self.registered.lock().unwrap().retain(|pid| *pid != key);
    }

    fn clear(&self) {
        self.registered.lock().unwrap().clear();
    }
}

#[test]
#[serial]
fn test_polled_process_registration() -> Result<()> {
    let manager = manager();
    let poller = Arc::new(RecordingPoller::default());
    manager.set_poller(poller.clone());

    let options = SpawnOptions::builder().polled(true).build()?;
    let process = manager.spawn_pipe("cat", options)?;
    assert_eq!(*poller.registered.lock().unwrap(), vec![process.pid()]);

    process.kill(Signal::SIGTERM)?;
    process.wait()?;
    assert!(poller.registered.lock().unwrap().is_empty());

    manager.set_poller(Arc::new(NullPoller));
    Ok(())
}

#[test]
fn test_manager_config_serialization() -> Result<()> {
    let config = ManagerConfig::new().with_restart_delay(Duration::from_millis(250));
    let json = serde_json::to_string(&config)?;
    assert!(json.contains("restartDelayMs"));
    let back: ManagerConfig = serde_json::from_str(&json)?;
    assert_eq!(back, config);
    Ok(())
}
