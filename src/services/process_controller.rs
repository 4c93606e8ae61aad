// Process Controller
// Owns the egress process lifecycle: cold spawn, SIGHUP reload, exit tracking

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::Utc;

use crate::models::{EgressState, EgressStatus, ProcessHandle};
use crate::services::errors::ControllerError;

/// How liveness is derived. A deployment picks one; they are alternate
/// designs, not layers.
#[derive(Debug, Clone)]
pub enum LivenessProbe {
    /// Trust the in-memory handle from our own spawn. Immune to pid reuse,
    /// but a supervisor restart loses track of the process.
    Handle,
    /// Read the pid file the egress process maintains and send signal 0.
    /// Survives supervisor restarts; a recycled pid can false-positive,
    /// which is an accepted limitation of this mode.
    PidFile(PathBuf),
}

struct ControllerInner {
    state: EgressState,
    child: Option<Child>,
    handle: Option<ProcessHandle>,
}

/// Manages the external egress process bound to the rendered configuration
pub struct ProcessController {
    binary: String,
    config_path: PathBuf,
    probe: LivenessProbe,
    inner: Arc<Mutex<ControllerInner>>,
}

impl ProcessController {
    const MONITOR_INTERVAL: Duration = Duration::from_millis(300);

    pub fn new(binary: impl Into<String>, config_path: PathBuf, probe: LivenessProbe) -> Self {
        Self {
            binary: binary.into(),
            config_path,
            probe,
            inner: Arc::new(Mutex::new(ControllerInner {
                state: EgressState::Stopped,
                child: None,
                handle: None,
            })),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, ControllerInner> {
        // A poisoned lock only means a panicked thread; the state itself
        // stays consistent because every transition is a single assignment
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Launch the egress process in foreground mode so its exit is
    /// observable. Idempotent: spawning while running returns the existing
    /// handle instead of creating a duplicate process.
    pub fn spawn(&self) -> Result<ProcessHandle, ControllerError> {
        let mut inner = self.lock_inner();

        if inner.state == EgressState::Running {
            if let Some(handle) = Self::live_handle(&mut inner) {
                log::debug!("Egress process already running (pid {})", handle.pid);
                return Ok(handle);
            }
        }

        inner.state = EgressState::Starting;
        log::info!(
            "Starting egress process: {} -c {}",
            self.binary,
            self.config_path.display()
        );

        let spawned = Command::new(&self.binary)
            .arg("-c")
            .arg(&self.config_path)
            .arg("-g")
            .arg("daemon off;")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                inner.state = EgressState::Stopped;
                return Err(ControllerError::SpawnFailed {
                    reason: format!("{}: {e}", self.binary),
                });
            }
        };

        let pid = child.id();
        let handle = ProcessHandle {
            pid,
            started_at: Utc::now(),
        };

        if let Some(stderr) = child.stderr.take() {
            Self::spawn_output_reader(stderr, pid);
        }

        inner.child = Some(child);
        inner.handle = Some(handle.clone());
        inner.state = EgressState::Running;
        drop(inner);

        self.spawn_exit_monitor(pid);

        log::info!("Egress process started (pid {pid})");
        Ok(handle)
    }

    /// In-place reconfigure of the running process via SIGHUP. Preferred
    /// over a respawn because it preserves active connections. Never
    /// auto-starts: a stopped controller is the caller's branch to take.
    pub fn reload(&self) -> Result<(), ControllerError> {
        let inner = self.lock_inner();

        let pid = match &self.probe {
            LivenessProbe::Handle => {
                if inner.state != EgressState::Running {
                    return Err(ControllerError::NotRunning);
                }
                inner
                    .handle
                    .as_ref()
                    .map(|handle| handle.pid)
                    .ok_or(ControllerError::NotRunning)?
            }
            LivenessProbe::PidFile(path) => {
                let pid = read_pid_file(path).ok_or(ControllerError::NotRunning)?;
                if !process_exists(pid) {
                    return Err(ControllerError::NotRunning);
                }
                pid
            }
        };

        send_reload_signal(pid)?;
        log::info!("Sent SIGHUP to egress process (pid {pid})");
        Ok(())
    }

    /// Liveness per the configured probe. Never errors; a missing pid
    /// source means "not running".
    pub fn is_running(&self) -> bool {
        match &self.probe {
            LivenessProbe::Handle => {
                let mut inner = self.lock_inner();
                Self::live_handle(&mut inner).is_some()
            }
            LivenessProbe::PidFile(path) => match read_pid_file(path) {
                Some(pid) => process_exists(pid),
                None => false,
            },
        }
    }

    /// Status snapshot for the API layer
    pub fn status(&self) -> EgressStatus {
        let alive = self.is_running();
        let inner = self.lock_inner();
        EgressStatus {
            state: inner.state,
            pid: inner.handle.as_ref().map(|handle| handle.pid),
            started_at: inner.handle.as_ref().map(|handle| handle.started_at),
            alive,
        }
    }

    /// Kill the tracked process. Shutdown path only; apply() never stops a
    /// healthy process.
    pub fn stop(&self) {
        let mut inner = self.lock_inner();
        if let Some(mut child) = inner.child.take() {
            log::info!("Stopping egress process (pid {})", child.id());
            let _ = child.kill();
            let _ = child.wait();
        }
        inner.handle = None;
        inner.state = EgressState::Stopped;
    }

    /// Re-check the tracked child under the lock and return its handle if it
    /// is still alive, flipping to Stopped if it already exited
    fn live_handle(inner: &mut ControllerInner) -> Option<ProcessHandle> {
        let exited = match inner.child.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        };

        if exited {
            if inner.state == EgressState::Running {
                log::warn!("Egress process exited since last check");
            }
            inner.child = None;
            inner.handle = None;
            inner.state = EgressState::Stopped;
            return None;
        }

        inner.handle.clone()
    }

    /// Background thread that watches for process exit and updates shared
    /// state under the controller mutex, so a reload can never race a
    /// just-detected exit into a dead handle
    fn spawn_exit_monitor(&self, pid: u32) {
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || loop {
            thread::sleep(Self::MONITOR_INTERVAL);

            let mut guard = match inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            let child = match guard.child.as_mut() {
                // Stopped or respawned since this monitor started
                Some(child) if child.id() == pid => child,
                _ => return,
            };

            match child.try_wait() {
                Ok(None) => {}
                Ok(Some(status)) => {
                    if status.success() {
                        log::info!("Egress process exited cleanly (pid {pid})");
                    } else {
                        log::warn!("Egress process exited (pid {pid}, {status})");
                    }
                    guard.child = None;
                    guard.handle = None;
                    guard.state = EgressState::Stopped;
                    return;
                }
                Err(e) => {
                    log::warn!("Lost track of egress process (pid {pid}): {e}");
                    guard.child = None;
                    guard.handle = None;
                    guard.state = EgressState::Stopped;
                    return;
                }
            }
        });
    }

    /// Forward the process's stderr into the server log; nginx writes its
    /// error log there in foreground mode
    fn spawn_output_reader(stderr: std::process::ChildStderr, pid: u32) {
        thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines().map_while(Result::ok) {
                log::debug!("egress[{pid}]: {line}");
            }
        });
    }
}

impl Drop for ProcessController {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read a pid from a plain-decimal pid file, tolerating trailing whitespace.
/// Absence or garbage means "no pid", never an error.
fn read_pid_file(path: &std::path::Path) -> Option<u32> {
    let content = std::fs::read_to_string(path).ok()?;
    content.trim().parse::<u32>().ok()
}

#[cfg(unix)]
fn send_reload_signal(pid: u32) -> Result<(), ControllerError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGHUP).map_err(|e| {
        ControllerError::SignalFailed {
            reason: format!("SIGHUP to pid {pid}: {e}"),
        }
    })
}

#[cfg(not(unix))]
fn send_reload_signal(pid: u32) -> Result<(), ControllerError> {
    Err(ControllerError::SignalFailed {
        reason: format!("reload signals are not supported on this platform (pid {pid})"),
    })
}

/// Zero-signal existence probe
#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> bool {
    false
}
