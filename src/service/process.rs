//! Child process supervision
//!
//! Spawns a service executable and watches it from a dedicated task:
//! - startup grace before the process counts as running
//! - graceful stop (SIGTERM) with a forced kill after a timeout
//! - one exit callback per spawn, whether the exit was requested or not

use crate::config::ProcessConfig;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Process not started
    Stopped,
    /// Spawned, still inside the startup grace period
    Starting,
    /// Process is running
    Running,
    /// Stop requested, waiting for exit
    Stopping,
    /// Exited on its own with a failure status
    Failed,
}

impl ProcessState {
    pub fn is_alive(&self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping
        )
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Failed => write!(f, "failed"),
        }
    }
}

/// Supervised child process
pub struct ManagedProcess {
    name: &'static str,
    config: ProcessConfig,
    state_tx: Arc<watch::Sender<ProcessState>>,
    stop_tx: Mutex<Option<oneshot::Sender<bool>>>,
}

impl ManagedProcess {
    pub fn new(name: &'static str, config: ProcessConfig) -> Self {
        let (state_tx, _) = watch::channel(ProcessState::Stopped);

        ManagedProcess {
            name,
            config,
            state_tx: Arc::new(state_tx),
            stop_tx: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ProcessState {
        *self.state_tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_alive()
    }

    /// Spawn the process with `args` appended to the configured ones.
    ///
    /// `on_exit` runs exactly once when the process is gone, including when
    /// it dies inside the startup grace period.
    pub async fn spawn<F>(&self, args: Vec<String>, on_exit: F) -> Result<()>
    where
        F: FnOnce(Option<ExitStatus>) + Send + 'static,
    {
        if self.is_running() {
            return Err(Error::process(format!("{} is already running", self.name)));
        }

        let mut cmd = Command::new(&self.config.executable);
        cmd.args(&self.config.args)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if let Some(ref work_dir) = self.config.work_dir {
            cmd.current_dir(work_dir);
        }

        info!(
            "Starting {}: {:?} {:?}",
            self.name, self.config.executable, args
        );

        let child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn {}: {}", self.name, e);
            Error::process(format!("failed to spawn {}: {}", self.name, e))
        })?;

        info!("{} started with PID: {}", self.name, child.id().unwrap_or(0));

        let mut state_rx = self.state_tx.subscribe();
        self.state_tx.send_replace(ProcessState::Starting);

        let (stop_tx, stop_rx) = oneshot::channel();
        *self.stop_tx.lock() = Some(stop_tx);

        tokio::spawn(supervise(
            self.name,
            child,
            stop_rx,
            self.config.stop_timeout(),
            self.state_tx.clone(),
            on_exit,
        ));

        // Anything other than Starting within the grace period means it exited
        let exited = timeout(
            self.config.startup_grace(),
            state_rx.wait_for(|s| *s != ProcessState::Starting),
        )
        .await
        .is_ok();

        let promoted = !exited
            && self.state_tx.send_if_modified(|s| {
                if *s == ProcessState::Starting {
                    *s = ProcessState::Running;
                    true
                } else {
                    false
                }
            });

        if promoted {
            info!("{} is running", self.name);
            Ok(())
        } else {
            Err(Error::process(format!(
                "{} exited immediately after start",
                self.name
            )))
        }
    }

    /// Ask the process to stop without waiting. Returns false if nothing
    /// was running.
    pub fn request_stop(&self, force: bool) -> bool {
        match self.stop_tx.lock().take() {
            Some(tx) => {
                if self.state_tx.send_if_modified(|s| {
                    if s.is_alive() {
                        *s = ProcessState::Stopping;
                        true
                    } else {
                        false
                    }
                }) {
                    debug!("{} stop requested (force: {})", self.name, force);
                }
                tx.send(force).is_ok()
            }
            None => false,
        }
    }

    /// Stop the process and wait until it has exited
    pub async fn stop(&self, force: bool) -> Result<()> {
        let mut state_rx = self.state_tx.subscribe();
        if !self.request_stop(force) {
            return Ok(());
        }

        let _ = state_rx.wait_for(|s| !s.is_alive()).await;
        info!("{} stopped", self.name);
        Ok(())
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        // Supervisor sees the dropped sender and kills the child
        self.stop_tx.lock().take();
    }
}

async fn supervise<F>(
    name: &'static str,
    mut child: Child,
    stop_rx: oneshot::Receiver<bool>,
    stop_timeout: Duration,
    state_tx: Arc<watch::Sender<ProcessState>>,
    on_exit: F,
) where
    F: FnOnce(Option<ExitStatus>) + Send + 'static,
{
    let stop_request = tokio::select! {
        status = child.wait() => Err(status),
        request = stop_rx => Ok(request.unwrap_or(true)),
    };

    let (status, requested) = match stop_request {
        Err(status) => {
            let status = status.ok();
            warn!("{} exited on its own: {:?}", name, status);
            (status, false)
        }
        Ok(force) => (terminate(name, &mut child, force, stop_timeout).await, true),
    };

    let clean = status.map(|s| s.success()).unwrap_or(false);
    state_tx.send_replace(if requested || clean {
        ProcessState::Stopped
    } else {
        ProcessState::Failed
    });

    on_exit(status);
}

async fn terminate(
    name: &'static str,
    child: &mut Child,
    force: bool,
    stop_timeout: Duration,
) -> Option<ExitStatus> {
    if !force {
        // Try graceful shutdown first
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Some(pid) = child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        #[cfg(not(unix))]
        let _ = child.start_kill();

        match timeout(stop_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!("{} exited with status: {}", name, status);
                return Some(status);
            }
            Ok(Err(e)) => {
                warn!("Error waiting for {}: {}", name, e);
            }
            Err(_) => {
                warn!("{} didn't exit gracefully, forcing kill", name);
            }
        }
    }

    if let Err(e) = child.kill().await {
        warn!("Failed to kill {}: {}", name, e);
    }
    child.wait().await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(executable: &str) -> ProcessConfig {
        ProcessConfig {
            startup_grace_ms: 200,
            stop_timeout_ms: 1000,
            ..ProcessConfig::new(executable)
        }
    }

    #[test]
    fn test_process_state_display() {
        assert_eq!(ProcessState::Stopped.to_string(), "stopped");
        assert_eq!(ProcessState::Running.to_string(), "running");
        assert_eq!(ProcessState::Failed.to_string(), "failed");
        assert!(ProcessState::Stopping.is_alive());
        assert!(!ProcessState::Failed.is_alive());
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let process = ManagedProcess::new("core", config("/nonexistent/prifi-core"));
        let result = process.spawn(Vec::new(), |_| {}).await;
        assert!(result.is_err());
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let process = ManagedProcess::new("tunnel", config("sleep"));
        assert!(!process.request_stop(false));
        assert!(process.stop(true).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_and_stop_reports_exit_once() {
        let exits = Arc::new(AtomicU32::new(0));
        let counter = exits.clone();
        let process = ManagedProcess::new("core", config("sleep"));

        process
            .spawn(vec!["30".to_string()], move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        assert_eq!(process.state(), ProcessState::Running);
        assert!(process.is_running());

        process.stop(false).await.unwrap();
        assert_eq!(process.state(), ProcessState::Stopped);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_immediate_exit_fails_start() {
        let process = ManagedProcess::new("core", config("false"));
        let result = process.spawn(Vec::new(), |_| {}).await;
        assert!(result.is_err());
        assert_eq!(process.state(), ProcessState::Failed);
    }
}
