//! Supervision tree: owns named child processes, restarts crashed ones
//! under a bounded backoff policy, and tears them down on request.
//!
//! The tree does not run its own loop. The daemon drives [`SupervisionTree::tick`]
//! from its select loop, which keeps every mutation of a service serialized.

use anyhow::{Context, Result, anyhow, bail};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use rand::Rng;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;

use crate::protocol::StatusMap;
use crate::state::{Lifecycle, ProcessState, Transition};

pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_STABILITY_WINDOW_MS: u64 = 30_000;

const BACKOFF_INITIAL_MS: u64 = 250;
const BACKOFF_MAX_MS: u64 = 15_000;

/// Tree-level lifecycle notifications, observable via [`SupervisionTree::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeEvent {
    Started,
    Stopped,
}

struct Service {
    cmd: String,
    cwd: Option<PathBuf>,
    log_path: PathBuf,
    state: ProcessState,
    child: Option<Child>,
    backoff_until: Option<Instant>,
    up_since: Option<Instant>,
}

pub struct SupervisionTree {
    log_dir: PathBuf,
    shutdown_timeout: Duration,
    stability_window: Duration,
    services: HashMap<String, Service>,
    order: Vec<String>,
    events: broadcast::Sender<TreeEvent>,
}

impl SupervisionTree {
    pub fn new(
        log_dir: PathBuf,
        shutdown_timeout_ms: Option<u64>,
        stability_window_ms: Option<u64>,
    ) -> Result<Self> {
        fs::create_dir_all(&log_dir)
            .with_context(|| format!("log directory {} is unusable", log_dir.display()))?;
        let (events, _) = broadcast::channel(16);
        Ok(Self {
            log_dir,
            shutdown_timeout: Duration::from_millis(
                shutdown_timeout_ms.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            ),
            stability_window: Duration::from_millis(
                stability_window_ms.unwrap_or(DEFAULT_STABILITY_WINDOW_MS),
            ),
            services: HashMap::new(),
            order: Vec::new(),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
        self.events.subscribe()
    }

    pub fn start(&mut self) -> Result<()> {
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("failed to create {}", self.log_dir.display()))?;
        let _ = self.events.send(TreeEvent::Started);
        Ok(())
    }

    pub fn add(&mut self, name: &str, cmd: &str, cwd: Option<&Path>) -> Result<()> {
        if self.services.contains_key(name) {
            bail!("already added: {name}");
        }

        let log_path = self.log_dir.join(format!("{name}.log"));
        let (child, pid) = spawn_child(cmd, cwd, &log_path)?;

        let mut state = ProcessState::new();
        state.transition_to(Lifecycle::Starting, Transition::pid(pid));
        state.transition_to(Lifecycle::Up, Transition::pid(pid));

        self.services.insert(
            name.to_string(),
            Service {
                cmd: cmd.to_string(),
                cwd: cwd.map(Path::to_path_buf),
                log_path,
                state,
                child: Some(child),
                backoff_until: None,
                up_since: Some(Instant::now()),
            },
        );
        self.order.push(name.to_string());
        tracing::info!(service = %name, pid, "service added");
        Ok(())
    }

    pub async fn remove(&mut self, name: &str) -> Result<()> {
        let Some(mut svc) = self.services.remove(name) else {
            bail!("not found: {name}");
        };
        self.order.retain(|n| n != name);

        let pid = svc.state.pid;
        if let (Some(mut child), Some(pid)) = (svc.child.take(), pid) {
            svc.state.transition_to(Lifecycle::Stopping, Transition::default());
            // Best effort: the record is already unregistered, so a failed
            // signal must not abort the wait/escalate path below.
            if let Err(e) = kill_pgroup(pid, Signal::SIGTERM) {
                tracing::warn!(service = %name, error = %e, "failed to signal process group");
            }

            let deadline = Instant::now() + self.shutdown_timeout;
            let mut exited = false;
            while Instant::now() < deadline {
                if matches!(child.try_wait(), Ok(Some(_))) {
                    exited = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            if !exited {
                tracing::warn!(service = %name, "graceful stop timed out, escalating to SIGKILL");
                if let Err(e) = kill_pgroup(pid, Signal::SIGKILL) {
                    tracing::warn!(service = %name, error = %e, "failed to kill process group");
                }
                let _ = child.wait().await;
            }
        }

        tracing::info!(service = %name, "service removed");
        Ok(())
    }

    pub fn status(&self) -> StatusMap {
        self.services
            .iter()
            .map(|(name, svc)| (name.clone(), svc.state.clone()))
            .collect()
    }

    /// Removes every service in reverse registration order, then notifies
    /// observers that the tree has stopped.
    pub async fn stop(&mut self) {
        for name in self.order.clone().into_iter().rev() {
            if let Err(e) = self.remove(&name).await {
                tracing::warn!(service = %name, error = %e, "failed to remove during stop");
            }
        }
        let _ = self.events.send(TreeEvent::Stopped);
    }

    /// One supervision pass: reap exited children into `backoff`, respawn
    /// services whose backoff deadline has passed, and reset the restart
    /// count of services that stayed up past the stability window.
    pub fn tick(&mut self) {
        for name in self.order.clone() {
            let Some(svc) = self.services.get_mut(&name) else {
                continue;
            };

            if let Some(child) = svc.child.as_mut() {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        let code = status.code();
                        tracing::warn!(service = %name, exit_code = ?code, "service exited unexpectedly");
                        svc.child = None;
                        svc.up_since = None;
                        svc.state
                            .transition_to(Lifecycle::Down, Transition::exit_code(code));
                        svc.state
                            .transition_to(Lifecycle::Backoff, Transition::default());
                        let delay = backoff_delay(svc.state.restart_count);
                        svc.backoff_until = Some(Instant::now() + delay);
                        tracing::info!(
                            service = %name,
                            restarts = svc.state.restart_count,
                            delay_ms = delay.as_millis() as u64,
                            "restart scheduled"
                        );
                    }
                    Ok(None) => {
                        if svc.state.restart_count > 0
                            && let Some(up_since) = svc.up_since
                            && up_since.elapsed() >= self.stability_window
                        {
                            svc.state.reset_restart_count();
                            tracing::debug!(service = %name, "stable past window, restart count reset");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(service = %name, error = %e, "wait failed");
                        svc.child = None;
                        svc.up_since = None;
                        svc.state
                            .transition_to(Lifecycle::Down, Transition::default());
                        svc.state
                            .transition_to(Lifecycle::Backoff, Transition::default());
                        svc.backoff_until =
                            Some(Instant::now() + backoff_delay(svc.state.restart_count));
                    }
                }
            } else if svc.state.state == Lifecycle::Backoff
                && let Some(until) = svc.backoff_until
                && Instant::now() >= until
            {
                match spawn_child(&svc.cmd, svc.cwd.as_deref(), &svc.log_path) {
                    Ok((child, pid)) => {
                        svc.state
                            .transition_to(Lifecycle::Starting, Transition::pid(pid));
                        svc.state.transition_to(Lifecycle::Up, Transition::pid(pid));
                        svc.child = Some(child);
                        svc.backoff_until = None;
                        svc.up_since = Some(Instant::now());
                        tracing::info!(service = %name, pid, "service restarted");
                    }
                    Err(e) => {
                        tracing::warn!(service = %name, error = %e, "restart failed");
                        svc.state
                            .transition_to(Lifecycle::Backoff, Transition::default());
                        svc.backoff_until =
                            Some(Instant::now() + backoff_delay(svc.state.restart_count));
                    }
                }
            }
        }
    }
}

/// Bounded exponential backoff with +/-25% jitter. The n-th restart waits
/// roughly `250ms * 2^(n-1)`, capped at 15s, so a crash-looping service
/// never turns into a restart storm.
fn backoff_delay(restarts: u32) -> Duration {
    let exp = restarts.saturating_sub(1).min(16);
    let base = BACKOFF_INITIAL_MS
        .saturating_mul(1u64 << exp)
        .min(BACKOFF_MAX_MS);
    let span = base / 4;
    let jittered = base - span + rand::thread_rng().gen_range(0..=span * 2);
    Duration::from_millis(jittered)
}

fn spawn_child(cmd: &str, cwd: Option<&Path>, log_path: &Path) -> Result<(Child, i32)> {
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("failed to open log file {}", log_path.display()))?;
    let log_err = log.try_clone()?;

    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    // Own process group so stop signals reach the whole subtree.
    unsafe {
        command.pre_exec(|| {
            if nix::libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command
        .spawn()
        .with_context(|| format!("failed to spawn: {cmd}"))?;
    let pid = child
        .id()
        .map(|x| x as i32)
        .ok_or_else(|| anyhow!("spawned child has no pid"))?;
    Ok((child, pid))
}

fn kill_pgroup(pid: i32, signal: Signal) -> Result<()> {
    match killpg(Pid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(anyhow!(e)),
    }
}
