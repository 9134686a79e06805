//! Engine process control.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use drawbridge_core::error::{DrawbridgeError, Result};

/// Spawn, observe and stop the engine process.
#[async_trait]
pub trait EngineProcess: Send {
    /// Start a new process. Returns its pid when the platform reports one.
    async fn spawn(&mut self) -> Result<Option<u32>>;

    /// `Some(description)` if the process has exited since it was spawned.
    fn try_wait(&mut self) -> Result<Option<String>>;

    /// Ask the process to stop, forcing it after `grace`. No-op when nothing runs.
    async fn terminate(&mut self, grace: Duration) -> Result<()>;

    fn pid(&self) -> Option<u32>;
}

/// A child process launched from a program and argument list.
pub struct ChildEngineProcess {
    program: String,
    args: Vec<String>,
    child: Option<Child>,
}

impl ChildEngineProcess {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            child: None,
        }
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl EngineProcess for ChildEngineProcess {
    async fn spawn(&mut self) -> Result<Option<u32>> {
        if self.child.is_some() {
            self.terminate(Duration::from_secs(1)).await?;
        }

        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DrawbridgeError::Process(format!("failed to spawn '{}': {e}", self.program))
            })?;

        let pid = child.id();
        info!(pid = ?pid, command = %self.command_line(), "Engine process spawned");
        self.child = Some(child);
        Ok(pid)
    }

    fn try_wait(&mut self) -> Result<Option<String>> {
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        match child.try_wait()? {
            Some(status) => {
                self.child = None;
                Ok(Some(status.to_string()))
            }
            None => Ok(None),
        }
    }

    async fn terminate(&mut self, grace: Duration) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if let Some(status) = child.try_wait()? {
            debug!(%status, "Engine process already exited");
            return Ok(());
        }

        send_sigterm(&child);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => {
                let status = status?;
                info!(%status, "Engine process stopped");
            }
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "Engine ignored SIGTERM, killing");
                child.kill().await?;
            }
        }
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!(pid, error = %e, "Failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) {}
