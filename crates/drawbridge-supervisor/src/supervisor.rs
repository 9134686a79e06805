//! Companion process supervisor.
//!
//! A background task probes the engine on a fixed interval and feeds the
//! results into [`SupervisorRecord`]. Restarts, give-ups and shutdown act on
//! the process; every transition is published on a `watch` channel that
//! [`Supervisor::ensure_available`] waits on.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use drawbridge_core::config::{Config, SupervisorConfig, UnavailablePolicy};
use drawbridge_core::error::{DrawbridgeError, Result};

use crate::alerts::{Alert, AlertManager};
use crate::probe::HealthProbe;
use crate::process::EngineProcess;
use crate::record::{SupervisorAction, SupervisorRecord, SupervisorState, SupervisorStatus};

/// Status snapshot together with the alerts currently firing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorReport {
    pub status: SupervisorStatus,
    pub active_alerts: Vec<Alert>,
}

struct Core {
    record: SupervisorRecord,
    process: Box<dyn EngineProcess>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    auto_start: bool,
    core: Mutex<Core>,
    probe: Arc<dyn HealthProbe>,
    alerts: Option<AlertManager>,
    status_tx: watch::Sender<SupervisorStatus>,
    cancel: CancellationToken,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        config: &Config,
        probe: Arc<dyn HealthProbe>,
        process: Box<dyn EngineProcess>,
    ) -> Arc<Self> {
        let record = SupervisorRecord::new(config.supervisor.clone());
        let (status_tx, _) = watch::channel(record.snapshot());
        let alerts = config
            .alerts
            .enabled
            .then(|| AlertManager::new(config.alerts.clone()));
        Arc::new(Self {
            config: config.supervisor.clone(),
            auto_start: config.engine.auto_start,
            core: Mutex::new(Core { record, process }),
            probe,
            alerts,
            status_tx,
            cancel: CancellationToken::new(),
            task: StdMutex::new(None),
        })
    }

    /// Start the background loop, and the engine too when auto-start is on.
    pub async fn launch(self: &Arc<Self>) -> Result<()> {
        if self.auto_start {
            self.start().await?;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run().await });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        info!(
            interval_ms = self.config.health_interval_ms,
            "Supervisor loop started"
        );
        loop {
            let wait = self.next_wait().await;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => self.tick().await,
            }
        }
        debug!("Supervisor loop stopped");
    }

    /// Time until the next tick: the health interval, or less when a
    /// restart comes due sooner.
    async fn next_wait(&self) -> Duration {
        let interval = self.config.health_interval();
        let core = self.core.lock().await;
        match core.record.restart_due() {
            Some(due) => due.saturating_duration_since(Instant::now()).min(interval),
            None => interval,
        }
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status_tx.borrow().clone()
    }

    pub fn state(&self) -> SupervisorState {
        self.status_tx.borrow().state
    }

    pub fn alerts(&self) -> Option<&AlertManager> {
        self.alerts.as_ref()
    }

    /// Receiver that observes every published status.
    pub fn watch_status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status_tx.subscribe()
    }

    pub fn report(&self) -> SupervisorReport {
        SupervisorReport {
            status: self.status(),
            active_alerts: self
                .alerts
                .as_ref()
                .map(AlertManager::active_alerts)
                .unwrap_or_default(),
        }
    }

    fn publish(&self, record: &SupervisorRecord) {
        let status = record.snapshot();
        if let Some(alerts) = &self.alerts {
            alerts.evaluate(&status);
        }
        self.status_tx.send_replace(status);
    }

    /// Spawn the engine unless one is already running or being restarted.
    /// Leaves `Failed` and clears previous failure counts.
    pub async fn start(&self) -> Result<()> {
        let mut core = self.core.lock().await;
        let state = core.record.state();
        if state.is_running() || state == SupervisorState::Restarting {
            return Ok(());
        }
        if state == SupervisorState::ShuttingDown {
            return Err(DrawbridgeError::EngineUnavailable(
                "supervisor is shutting down".into(),
            ));
        }

        info!("Starting engine");
        core.record.reset();
        let spawned = core.process.spawn().await;
        let now = Instant::now();
        let result = match spawned {
            Ok(pid) => {
                core.record.on_spawned(pid, now);
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                core.record.on_spawn_failed(message, now);
                Err(e)
            }
        };
        self.publish(&core.record);
        result
    }

    /// One supervision step: restart if due, otherwise check the process
    /// and probe its health.
    pub async fn tick(&self) {
        let state = self.state();
        match state {
            SupervisorState::Restarting => self.restart_if_due().await,
            s if s.is_running() => self.check().await,
            _ => {}
        }
    }

    async fn check(&self) {
        {
            let mut core = self.core.lock().await;
            if !core.record.state().is_running() {
                return;
            }
            let exited = match core.process.try_wait() {
                Ok(exit) => exit,
                Err(e) => {
                    warn!(error = %e, "Could not poll engine process");
                    None
                }
            };
            if let Some(exit) = exited {
                let action = core.record.on_process_exited(exit, Instant::now());
                self.apply(&mut core, action).await;
                self.publish(&core.record);
                return;
            }
        }

        // Probe without holding the lock; it is bounded by the probe timeout.
        let result = self.probe.probe().await.map(|_| ()).map_err(|e| e.to_string());

        let mut core = self.core.lock().await;
        let action = core.record.on_probe(result, Instant::now());
        self.apply(&mut core, action).await;
        self.publish(&core.record);
    }

    async fn apply(&self, core: &mut Core, action: SupervisorAction) {
        match action {
            SupervisorAction::None => {}
            SupervisorAction::Restart { .. } | SupervisorAction::GiveUp => {
                if let Err(e) = core.process.terminate(self.config.shutdown_grace()).await {
                    warn!(error = %e, "Failed to terminate engine process");
                }
            }
        }
    }

    async fn restart_if_due(&self) {
        let mut core = self.core.lock().await;
        if core.record.state() != SupervisorState::Restarting {
            return;
        }
        let now = Instant::now();
        if core.record.restart_due().is_some_and(|due| due > now) {
            return;
        }

        match core.process.spawn().await {
            Ok(pid) => core.record.on_restarted(pid, Instant::now()),
            Err(e) => {
                let action = core.record.on_spawn_failed(e.to_string(), Instant::now());
                self.apply(&mut core, action).await;
            }
        }
        self.publish(&core.record);
    }

    /// Gate for agent commands: succeed only once the engine is healthy.
    ///
    /// A stopped engine is started first. With the `wait` policy the call
    /// blocks until the engine turns healthy or `wait_timeout` passes; with
    /// `fail_fast` it returns `EngineUnavailable` straight away.
    pub async fn ensure_available(&self) -> Result<()> {
        match self.state() {
            SupervisorState::Healthy => return Ok(()),
            SupervisorState::Failed => return Err(self.failed_error()),
            SupervisorState::ShuttingDown => {
                return Err(DrawbridgeError::EngineUnavailable(
                    "supervisor is shutting down".into(),
                ));
            }
            SupervisorState::Stopped => {
                if let Err(e) = self.start().await {
                    warn!(error = %e, "On-demand engine start failed");
                }
            }
            _ => {}
        }

        let state = self.state();
        if self.config.unavailable_policy == UnavailablePolicy::FailFast {
            return match state {
                SupervisorState::Healthy => Ok(()),
                SupervisorState::Failed => Err(self.failed_error()),
                other => Err(DrawbridgeError::EngineUnavailable(format!("engine is {other}"))),
            };
        }

        let mut rx = self.status_tx.subscribe();
        let wait = rx.wait_for(|s| {
            matches!(
                s.state,
                SupervisorState::Healthy | SupervisorState::Failed | SupervisorState::Stopped
            )
        });
        let outcome = tokio::time::timeout(self.config.wait_timeout(), async {
            wait.await.map(|s| s.state)
        })
        .await;

        match outcome {
            Ok(Ok(SupervisorState::Healthy)) => Ok(()),
            Ok(Ok(SupervisorState::Failed)) => Err(self.failed_error()),
            Ok(Ok(other)) => Err(DrawbridgeError::EngineUnavailable(format!("engine is {other}"))),
            Ok(Err(_)) => Err(DrawbridgeError::EngineUnavailable(
                "supervisor stopped".into(),
            )),
            Err(_) => Err(DrawbridgeError::EngineUnavailable(format!(
                "engine not healthy after {}ms",
                self.config.wait_timeout_ms
            ))),
        }
    }

    fn failed_error(&self) -> DrawbridgeError {
        let status = self.status();
        DrawbridgeError::EngineFailed(format!(
            "gave up after {} restart attempts: {}",
            status.restart_attempts,
            status.last_error.as_deref().unwrap_or("unknown error")
        ))
    }

    /// Stop the loop, then terminate the engine within the shutdown grace.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Supervisor loop ended abnormally");
            }
        }

        let mut core = self.core.lock().await;
        core.record.on_shutting_down();
        self.publish(&core.record);
        let result = core.process.terminate(self.config.shutdown_grace()).await;
        core.record.on_stopped();
        self.publish(&core.record);
        info!("Supervisor shut down");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;
    use drawbridge_core::protocol::EngineHealth;

    #[derive(Default)]
    struct Counters {
        spawns: AtomicU32,
        terminates: AtomicU32,
        healthy: AtomicBool,
        exited: AtomicBool,
        spawn_fails: AtomicBool,
    }

    struct FakeProbe(Arc<Counters>);

    #[async_trait]
    impl HealthProbe for FakeProbe {
        async fn probe(&self) -> Result<EngineHealth> {
            if self.0.healthy.load(Ordering::SeqCst) {
                Ok(EngineHealth {
                    status: "healthy".into(),
                    element_count: 0,
                    subscriber_count: 0,
                    uptime_secs: 1,
                    version: "test".into(),
                    timestamp: chrono::Utc::now(),
                })
            } else {
                Err(DrawbridgeError::EngineUnavailable("connection refused".into()))
            }
        }
    }

    struct FakeProcess(Arc<Counters>);

    #[async_trait]
    impl EngineProcess for FakeProcess {
        async fn spawn(&mut self) -> Result<Option<u32>> {
            if self.0.spawn_fails.load(Ordering::SeqCst) {
                return Err(DrawbridgeError::Process("spawn failed".into()));
            }
            let n = self.0.spawns.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.exited.store(false, Ordering::SeqCst);
            Ok(Some(1000 + n))
        }

        fn try_wait(&mut self) -> Result<Option<String>> {
            if self.0.exited.swap(false, Ordering::SeqCst) {
                Ok(Some("exit status: 1".into()))
            } else {
                Ok(None)
            }
        }

        async fn terminate(&mut self, _grace: Duration) -> Result<()> {
            self.0.terminates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn pid(&self) -> Option<u32> {
            None
        }
    }

    fn setup(tweak: impl FnOnce(&mut Config)) -> (Arc<Supervisor>, Arc<Counters>) {
        let mut config = Config::default();
        config.engine.auto_start = false;
        config.supervisor.failure_threshold = 3;
        config.supervisor.max_restarts = 2;
        config.supervisor.backoff_base_ms = 1_000;
        config.supervisor.wait_timeout_ms = 2_000;
        tweak(&mut config);
        let counters = Arc::new(Counters::default());
        let sup = Supervisor::new(
            &config,
            Arc::new(FakeProbe(counters.clone())),
            Box::new(FakeProcess(counters.clone())),
        );
        (sup, counters)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_then_healthy() {
        let (sup, c) = setup(|_| {});
        assert_eq!(sup.state(), SupervisorState::Stopped);
        sup.start().await.unwrap();
        assert_eq!(sup.state(), SupervisorState::Starting);
        assert_eq!(sup.status().pid, Some(1001));

        c.healthy.store(true, Ordering::SeqCst);
        sup.tick().await;
        assert_eq!(sup.state(), SupervisorState::Healthy);
        sup.ensure_available().await.unwrap();

        // Starting again while running is a no-op.
        sup.start().await.unwrap();
        assert_eq!(c.spawns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_restart_once_then_recover() {
        let (sup, c) = setup(|_| {});
        sup.start().await.unwrap();
        c.healthy.store(true, Ordering::SeqCst);
        sup.tick().await;

        c.healthy.store(false, Ordering::SeqCst);
        sup.tick().await;
        sup.tick().await;
        assert_eq!(sup.state(), SupervisorState::Unhealthy);
        assert_eq!(c.terminates.load(Ordering::SeqCst), 0);
        sup.tick().await;
        assert_eq!(sup.state(), SupervisorState::Restarting);
        assert_eq!(c.terminates.load(Ordering::SeqCst), 1);

        // Not due yet.
        sup.tick().await;
        assert_eq!(c.spawns.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        sup.tick().await;
        assert_eq!(c.spawns.load(Ordering::SeqCst), 2);
        assert_eq!(sup.state(), SupervisorState::Starting);

        c.healthy.store(true, Ordering::SeqCst);
        sup.tick().await;
        let status = sup.status();
        assert_eq!(status.state, SupervisorState::Healthy);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.total_restarts, 1);
        assert_eq!(c.terminates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_exit_triggers_restart() {
        let (sup, c) = setup(|_| {});
        sup.start().await.unwrap();
        c.healthy.store(true, Ordering::SeqCst);
        sup.tick().await;

        c.exited.store(true, Ordering::SeqCst);
        sup.tick().await;
        let status = sup.status();
        assert_eq!(status.state, SupervisorState::Restarting);
        assert_eq!(status.process_exits, 1);
        let alerts = sup.alerts().unwrap();
        assert_eq!(alerts.fire_count(crate::alerts::ENGINE_PROCESS_DIED), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_carries_status_and_active_alerts() {
        let (sup, c) = setup(|_| {});
        let mut rx = sup.watch_status();
        sup.start().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().state, SupervisorState::Starting);

        c.healthy.store(true, Ordering::SeqCst);
        sup.tick().await;
        assert!(sup.report().active_alerts.is_empty());

        c.exited.store(true, Ordering::SeqCst);
        sup.tick().await;
        let report = sup.report();
        assert_eq!(report.status.state, SupervisorState::Restarting);
        assert_eq!(report.active_alerts.len(), 1);
        assert_eq!(report.active_alerts[0].rule, crate::alerts::ENGINE_PROCESS_DIED);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"]["state"], "restarting");
        assert_eq!(json["activeAlerts"][0]["rule"], "engine_process_died");
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarts_exhausted_fails_callers() {
        let (sup, c) = setup(|_| {});
        sup.start().await.unwrap();
        c.spawn_fails.store(true, Ordering::SeqCst);

        for _ in 0..3 {
            c.exited.store(true, Ordering::SeqCst);
            sup.tick().await;
            tokio::time::advance(Duration::from_secs(5)).await;
            sup.tick().await;
        }
        assert_eq!(sup.state(), SupervisorState::Failed);
        assert!(matches!(
            sup.ensure_available().await,
            Err(DrawbridgeError::EngineFailed(_))
        ));

        // An explicit start leaves Failed.
        c.spawn_fails.store(false, Ordering::SeqCst);
        sup.start().await.unwrap();
        assert_eq!(sup.state(), SupervisorState::Starting);
        assert_eq!(sup.status().restart_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_policy() {
        let (sup, c) = setup(|config| {
            config.supervisor.unavailable_policy = UnavailablePolicy::FailFast;
        });
        // Stopped: the call starts the engine but does not wait for it.
        let err = sup.ensure_available().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(c.spawns.load(Ordering::SeqCst), 1);
        assert_eq!(sup.state(), SupervisorState::Starting);

        c.healthy.store(true, Ordering::SeqCst);
        sup.tick().await;
        sup.ensure_available().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_policy_blocks_until_healthy() {
        let (sup, c) = setup(|_| {});
        sup.start().await.unwrap();

        let waiter = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.ensure_available().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        c.healthy.store(true, Ordering::SeqCst);
        sup.tick().await;
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_policy_times_out() {
        let (sup, _c) = setup(|_| {});
        sup.start().await.unwrap();
        let err = sup.ensure_available().await.unwrap_err();
        assert!(matches!(err, DrawbridgeError::EngineUnavailable(_)));
        assert!(err.to_string().contains("2000ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_and_shutdown() {
        let (sup, c) = setup(|config| config.engine.auto_start = true);
        c.healthy.store(true, Ordering::SeqCst);
        sup.launch().await.unwrap();
        assert_eq!(c.spawns.load(Ordering::SeqCst), 1);

        // Let the loop run a probe.
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(sup.state(), SupervisorState::Healthy);

        sup.shutdown().await.unwrap();
        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert_eq!(c.terminates.load(Ordering::SeqCst), 1);
    }
}
