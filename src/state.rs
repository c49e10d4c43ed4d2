//! Lifecycle state machine for one supervised process.
//!
//! Transitions are unconditionally accepted; the supervision tree is the
//! only caller and is responsible for calling in a valid sequence.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Down,
    Starting,
    Up,
    Stopping,
    Backoff,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Down => "down",
            Self::Starting => "starting",
            Self::Up => "up",
            Self::Stopping => "stopping",
            Self::Backoff => "backoff",
        };
        f.write_str(s)
    }
}

/// Payload accompanying a transition. Only `starting`/`up` read `pid`,
/// only `down` reads `exit_code`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Transition {
    pub pid: Option<i32>,
    pub exit_code: Option<i32>,
}

impl Transition {
    pub fn pid(pid: i32) -> Self {
        Self {
            pid: Some(pid),
            exit_code: None,
        }
    }

    pub fn exit_code(code: Option<i32>) -> Self {
        Self {
            pid: None,
            exit_code: code,
        }
    }
}

/// Invariant: `pid` is set if and only if the state is `starting` or `up`.
/// `restart_count` only grows on entering `backoff` and only resets through
/// [`ProcessState::reset_restart_count`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessState {
    pub state: Lifecycle,
    pub pid: Option<i32>,
    pub restart_count: u32,
    pub started_at: Option<String>,
    pub last_exit_code: Option<i32>,
}

impl Default for ProcessState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessState {
    pub fn new() -> Self {
        Self {
            state: Lifecycle::Down,
            pid: None,
            restart_count: 0,
            started_at: None,
            last_exit_code: None,
        }
    }

    pub fn transition_to(&mut self, state: Lifecycle, change: Transition) {
        match state {
            Lifecycle::Starting => {
                self.pid = change.pid;
                self.started_at = Some(now_rfc3339());
            }
            Lifecycle::Up => {
                self.pid = change.pid;
            }
            Lifecycle::Down => {
                self.pid = None;
                self.started_at = None;
                if let Some(code) = change.exit_code {
                    self.last_exit_code = Some(code);
                }
            }
            Lifecycle::Backoff => {
                // No live process in backoff, so no pid either.
                self.pid = None;
                self.started_at = None;
                self.restart_count = self.restart_count.saturating_add(1);
            }
            Lifecycle::Stopping => {
                self.pid = None;
                self.started_at = None;
            }
        }
        self.state = state;
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, Lifecycle::Starting | Lifecycle::Up)
    }

    pub fn reset_restart_count(&mut self) {
        self.restart_count = 0;
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
