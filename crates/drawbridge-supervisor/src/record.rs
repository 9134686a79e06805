//! Supervisor state machine.
//!
//! `SupervisorRecord` only reacts to observations (a spawn, a probe result,
//! a process exit) and says what should happen next. It never touches a
//! process or a clock itself; callers pass `now` in.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, warn};

use drawbridge_core::config::SupervisorConfig;

/// Lifecycle of the managed engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Healthy,
    Unhealthy,
    Restarting,
    ShuttingDown,
    /// Restarts exhausted; only an explicit start leaves this state.
    Failed,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Restarting => "restarting",
            Self::ShuttingDown => "shutting_down",
            Self::Failed => "failed",
        }
    }

    /// A process is expected to exist and be probed.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Starting | Self::Healthy | Self::Unhealthy)
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the driver should do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    None,
    /// Terminate the current process and spawn a new one after `delay`.
    Restart { delay: Duration },
    /// Terminate the current process and stay down.
    GiveUp,
}

/// Serializable snapshot of the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub pid: Option<u32>,
    pub consecutive_failures: u32,
    /// Restart attempts since the engine was last healthy.
    pub restart_attempts: u32,
    pub total_restarts: u64,
    pub process_exits: u64,
    pub last_error: Option<String>,
    pub last_healthy_at: Option<DateTime<Utc>>,
    pub last_probe_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SupervisorRecord {
    config: SupervisorConfig,
    state: SupervisorState,
    pid: Option<u32>,
    consecutive_failures: u32,
    restart_attempts: u32,
    total_restarts: u64,
    process_exits: u64,
    spawned_at: Option<Instant>,
    restart_due: Option<Instant>,
    last_error: Option<String>,
    last_healthy_at: Option<DateTime<Utc>>,
    last_probe_at: Option<DateTime<Utc>>,
}

impl SupervisorRecord {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            state: SupervisorState::Stopped,
            pid: None,
            consecutive_failures: 0,
            restart_attempts: 0,
            total_restarts: 0,
            process_exits: 0,
            spawned_at: None,
            restart_due: None,
            last_error: None,
            last_healthy_at: None,
            last_probe_at: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn restart_attempts(&self) -> u32 {
        self.restart_attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// When a pending restart may proceed.
    pub fn restart_due(&self) -> Option<Instant> {
        self.restart_due
    }

    pub fn snapshot(&self) -> SupervisorStatus {
        SupervisorStatus {
            state: self.state,
            pid: self.pid,
            consecutive_failures: self.consecutive_failures,
            restart_attempts: self.restart_attempts,
            total_restarts: self.total_restarts,
            process_exits: self.process_exits,
            last_error: self.last_error.clone(),
            last_healthy_at: self.last_healthy_at,
            last_probe_at: self.last_probe_at,
        }
    }

    fn transition(&mut self, next: SupervisorState) {
        if self.state != next {
            info!(from = %self.state, to = %next, "Supervisor state changed");
            self.state = next;
        }
    }

    /// Explicit start request: forget previous failures.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.restart_attempts = 0;
        self.restart_due = None;
        self.last_error = None;
    }

    /// A fresh process was spawned (initially or as a restart).
    pub fn on_spawned(&mut self, pid: Option<u32>, now: Instant) {
        self.pid = pid;
        self.spawned_at = Some(now);
        self.restart_due = None;
        self.consecutive_failures = 0;
        self.transition(SupervisorState::Starting);
    }

    /// Spawning failed; counts as a restart attempt.
    pub fn on_spawn_failed(&mut self, error: String, now: Instant) -> SupervisorAction {
        warn!(%error, "Failed to spawn engine process");
        self.pid = None;
        self.last_error = Some(error);
        self.begin_restart(now)
    }

    /// A restart just replaced the process.
    pub fn on_restarted(&mut self, pid: Option<u32>, now: Instant) {
        self.total_restarts += 1;
        self.on_spawned(pid, now);
    }

    /// Fold in one health probe result.
    pub fn on_probe(&mut self, result: Result<(), String>, now: Instant) -> SupervisorAction {
        if !self.state.is_running() {
            return SupervisorAction::None;
        }
        self.last_probe_at = Some(Utc::now());

        let error = match result {
            Ok(()) => {
                if self.state != SupervisorState::Healthy {
                    info!(pid = ?self.pid, "Engine healthy");
                }
                self.consecutive_failures = 0;
                self.restart_attempts = 0;
                self.last_error = None;
                self.last_healthy_at = Some(Utc::now());
                self.transition(SupervisorState::Healthy);
                return SupervisorAction::None;
            }
            Err(error) => error,
        };

        self.consecutive_failures += 1;
        warn!(
            state = %self.state,
            failures = self.consecutive_failures,
            %error,
            "Engine health probe failed"
        );
        self.last_error = Some(error);

        match self.state {
            SupervisorState::Starting => {
                let grace = self.config.startup_grace();
                let elapsed = self
                    .spawned_at
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or(grace);
                if elapsed >= grace {
                    self.begin_restart(now)
                } else {
                    SupervisorAction::None
                }
            }
            SupervisorState::Healthy | SupervisorState::Unhealthy => {
                self.transition(SupervisorState::Unhealthy);
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.begin_restart(now)
                } else {
                    SupervisorAction::None
                }
            }
            _ => SupervisorAction::None,
        }
    }

    /// The managed process exited without being asked to.
    pub fn on_process_exited(&mut self, exit: String, now: Instant) -> SupervisorAction {
        if !self.state.is_running() {
            return SupervisorAction::None;
        }
        warn!(pid = ?self.pid, %exit, "Engine process exited");
        self.process_exits += 1;
        self.pid = None;
        self.last_error = Some(format!("process exited: {exit}"));
        self.begin_restart(now)
    }

    fn begin_restart(&mut self, now: Instant) -> SupervisorAction {
        if self.restart_attempts >= self.config.max_restarts {
            error!(
                attempts = self.restart_attempts,
                last_error = ?self.last_error,
                "Engine restarts exhausted, giving up"
            );
            self.restart_due = None;
            self.transition(SupervisorState::Failed);
            return SupervisorAction::GiveUp;
        }
        self.restart_attempts += 1;
        let delay = self.config.backoff(self.restart_attempts);
        warn!(
            attempt = self.restart_attempts,
            max = self.config.max_restarts,
            delay_ms = delay.as_millis() as u64,
            "Restarting engine"
        );
        self.restart_due = Some(now + delay);
        self.transition(SupervisorState::Restarting);
        SupervisorAction::Restart { delay }
    }

    pub fn on_shutting_down(&mut self) {
        self.restart_due = None;
        self.transition(SupervisorState::ShuttingDown);
    }

    pub fn on_stopped(&mut self) {
        self.pid = None;
        self.spawned_at = None;
        self.restart_due = None;
        self.consecutive_failures = 0;
        self.transition(SupervisorState::Stopped);
    }
}
