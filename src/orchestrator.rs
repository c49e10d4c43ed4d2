//! Sequences a declared list of services on top of the daemon.
//!
//! Oneshot services never reach the supervision tree: their up/down
//! commands run synchronously here, inheriting stdio. Longrun services are
//! registered and unregistered over the control socket. Start walks the
//! declared order first-to-target; stop mirrors it, most recently started
//! first.

use anyhow::{Context, Result, anyhow, bail};
use nix::unistd::Pid;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::process::{Command as StdCommand, Stdio};
use std::time::Duration;

use crate::client;
use crate::config::{ServiceDef, ServiceKind, ServicesConfig};
use crate::paths::RuntimePaths;
use crate::protocol::{Request, Response, StatusMap};

/// Operating-system access used by the orchestrator, injected at
/// construction so sequencing logic is testable without touching a real OS.
pub trait System {
    fn pid_alive(&self, pid: i32) -> bool;
    fn spawn_daemon(&self, paths: &RuntimePaths) -> Result<()>;
    /// Run a one-shot command to completion with inherited stdio; returns
    /// its exit code.
    fn run_command(&self, cmd: &str, cwd: Option<&Path>) -> Result<i32>;
    fn send(&self, socket_path: &Path, req: &Request) -> Result<Response>;
    fn send_shutdown(&self, socket_path: &Path) -> Result<()>;
    fn wait_ready(&self, socket_path: &Path, timeout: Duration) -> Result<()>;
}

pub struct RealSystem;

impl System for RealSystem {
    fn pid_alive(&self, pid: i32) -> bool {
        nix::sys::signal::kill(Pid::from_raw(pid), None).is_ok()
    }

    /// Re-executes the current binary as a detached `daemon` process with
    /// its output redirected to the daemon log file.
    fn spawn_daemon(&self, paths: &RuntimePaths) -> Result<()> {
        paths.ensure_dirs()?;
        let exe = std::env::current_exe()?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths.daemon_log())?;
        let log_err = log.try_clone()?;

        StdCommand::new(exe)
            .arg("daemon")
            .arg("--socket")
            .arg(paths.socket_path())
            .arg("--pid-file")
            .arg(paths.pid_file())
            .arg("--log-dir")
            .arg(paths.log_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()?;
        Ok(())
    }

    fn run_command(&self, cmd: &str, cwd: Option<&Path>) -> Result<i32> {
        let mut command = StdCommand::new("sh");
        command.arg("-c").arg(cmd);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        let status = command
            .status()
            .with_context(|| format!("failed to run: {cmd}"))?;
        Ok(status.code().unwrap_or(-1))
    }

    fn send(&self, socket_path: &Path, req: &Request) -> Result<Response> {
        client::send(socket_path, req)
    }

    fn send_shutdown(&self, socket_path: &Path) -> Result<()> {
        client::send_shutdown(socket_path)
    }

    fn wait_ready(&self, socket_path: &Path, timeout: Duration) -> Result<()> {
        client::wait_ready(socket_path, timeout)
    }
}

pub struct Orchestrator<S: System> {
    config: ServicesConfig,
    paths: RuntimePaths,
    system: S,
}

impl<S: System> Orchestrator<S> {
    pub fn new(config: ServicesConfig, paths: RuntimePaths, system: S) -> Self {
        Self {
            config,
            paths,
            system,
        }
    }

    /// PID-file read plus process-existence check. Never errors: any
    /// missing, unreadable, or stale artifact just means "not running".
    pub fn daemon_alive(&self) -> bool {
        let Ok(raw) = fs::read_to_string(self.paths.pid_file()) else {
            return false;
        };
        let Ok(pid) = raw.trim().parse::<i32>() else {
            return false;
        };
        self.system.pid_alive(pid)
    }

    pub fn ensure_daemon(&self) -> Result<()> {
        if self.daemon_alive() {
            return Ok(());
        }
        self.system.spawn_daemon(&self.paths)?;
        self.system
            .wait_ready(
                &self.paths.socket_path(),
                Duration::from_millis(client::DEFAULT_READY_TIMEOUT_MS),
            )
            .context("daemon failed to start")
    }

    fn target_index(&self, target: &str) -> Result<usize> {
        self.config
            .services
            .iter()
            .position(|d| d.name == target)
            .ok_or_else(|| anyhow!("unknown service: {target}"))
    }

    /// Starts every configured service from the first through (and
    /// including) `target`, in declared order; all of them when `target`
    /// is omitted.
    pub fn start(&self, target: Option<&str>) -> Result<()> {
        let count = match target {
            Some(t) => self.target_index(t)? + 1,
            None => self.config.services.len(),
        };
        self.ensure_daemon()?;
        for def in self.config.services.iter().take(count) {
            self.start_service(def)?;
        }
        Ok(())
    }

    fn start_service(&self, def: &ServiceDef) -> Result<()> {
        match def.kind {
            ServiceKind::Oneshot => {
                let up = def.up.as_deref().unwrap_or_default();
                let code = self.system.run_command(up, def.cwd.as_deref())?;
                if code != 0 {
                    bail!("{}: up command exited with code {code}", def.name);
                }
                println!("started {}", def.name);
            }
            ServiceKind::Longrun => {
                let req = Request::Add {
                    name: def.name.clone(),
                    cmd: def.command.clone().unwrap_or_default(),
                    cwd: def.cwd.as_ref().map(|p| p.to_string_lossy().into_owned()),
                };
                let resp = self.system.send(&self.paths.socket_path(), &req)?;
                if resp.ok {
                    println!("started {}", def.name);
                } else if is_duplicate(&resp) {
                    println!("{} already started", def.name);
                } else {
                    bail!("{}: {}", def.name, error_text(resp));
                }
            }
        }
        Ok(())
    }

    /// Stops every configured service from `target` through the last, in
    /// reverse declared order. A full stop also shuts the daemon down and
    /// removes any leftover socket file.
    pub fn stop(&self, target: Option<&str>) -> Result<()> {
        let from = match target {
            Some(t) => self.target_index(t)?,
            None => 0,
        };
        let alive = self.daemon_alive();
        for def in self.config.services[from..].iter().rev() {
            self.stop_service(def, alive)?;
        }
        if target.is_none() {
            if alive {
                self.system.send_shutdown(&self.paths.socket_path())?;
            }
            let _ = fs::remove_file(self.paths.socket_path());
        }
        Ok(())
    }

    fn stop_service(&self, def: &ServiceDef, daemon_alive: bool) -> Result<()> {
        match def.kind {
            ServiceKind::Longrun => {
                if !daemon_alive {
                    println!("{} already stopped", def.name);
                    return Ok(());
                }
                let resp = self.system.send(
                    &self.paths.socket_path(),
                    &Request::Remove {
                        name: def.name.clone(),
                    },
                )?;
                if resp.ok || is_not_found(&resp) {
                    println!("stopped {}", def.name);
                } else {
                    bail!("{}: {}", def.name, error_text(resp));
                }
            }
            ServiceKind::Oneshot => {
                if let Some(down) = def.down.as_deref() {
                    let code = self.system.run_command(down, def.cwd.as_deref())?;
                    if code != 0 {
                        bail!("{}: down command exited with code {code}", def.name);
                    }
                }
                println!("stopped {}", def.name);
            }
        }
        Ok(())
    }

    /// Reports the daemon's status map, filtered to `target` when given.
    /// A `target` that is not in the configuration is an error, distinct
    /// from a configured service the daemon does not know yet.
    pub fn status(&self, target: Option<&str>) -> Result<StatusMap> {
        if let Some(t) = target {
            self.target_index(t)?;
        }
        let resp = self
            .system
            .send(&self.paths.socket_path(), &Request::Status)
            .context("daemon unreachable")?;
        if !resp.ok {
            bail!(error_text(resp));
        }
        let mut map = resp.services.unwrap_or_default();
        if let Some(t) = target {
            map.retain(|name, _| name == t);
        }
        Ok(map)
    }
}

/// The daemon reports a duplicate add as a failure; from the orchestrator's
/// point of view that service is simply already started.
fn is_duplicate(resp: &Response) -> bool {
    resp.error
        .as_deref()
        .is_some_and(|e| e.starts_with("already added"))
}

fn is_not_found(resp: &Response) -> bool {
    resp.error
        .as_deref()
        .is_some_and(|e| e.starts_with("not found"))
}

fn error_text(resp: Response) -> String {
    resp.error.unwrap_or_else(|| "unknown error".to_string())
}
