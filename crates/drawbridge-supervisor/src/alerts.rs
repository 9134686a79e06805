//! Alert rules evaluated against supervisor status.
//!
//! Alerts fire when a rule's condition starts holding, stay active while it
//! holds, and resolve once it clears. A rule that fired recently does not
//! fire again until its throttle window has passed.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use drawbridge_core::config::AlertsConfig;

use crate::record::{SupervisorState, SupervisorStatus};

const HISTORY_LIMIT: usize = 100;

pub const HEALTH_CHECK_FAILING: &str = "health_check_failing";
pub const HEALTH_CHECK_CRITICAL: &str = "health_check_critical";
pub const ENGINE_PROCESS_DIED: &str = "engine_process_died";
pub const RESTARTS_EXHAUSTED: &str = "restarts_exhausted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub severity: Severity,
    pub description: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub fired_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct AlertBook {
    active: HashMap<String, Alert>,
    history: VecDeque<Alert>,
    counts: HashMap<String, u64>,
    last_fired: HashMap<String, DateTime<Utc>>,
    exits_seen: u64,
}

pub struct AlertManager {
    config: AlertsConfig,
    rules: Mutex<Vec<AlertRule>>,
    book: Mutex<AlertBook>,
}

impl AlertManager {
    pub fn new(config: AlertsConfig) -> Self {
        let rules = vec![
            AlertRule {
                name: HEALTH_CHECK_FAILING.into(),
                severity: Severity::Warning,
                description: format!(
                    "{} or more consecutive failed health checks",
                    config.warning_threshold
                ),
                enabled: true,
            },
            AlertRule {
                name: HEALTH_CHECK_CRITICAL.into(),
                severity: Severity::Critical,
                description: format!(
                    "{} or more consecutive failed health checks",
                    config.critical_threshold
                ),
                enabled: true,
            },
            AlertRule {
                name: ENGINE_PROCESS_DIED.into(),
                severity: Severity::Critical,
                description: "Engine process exited unexpectedly".into(),
                enabled: true,
            },
            AlertRule {
                name: RESTARTS_EXHAUSTED.into(),
                severity: Severity::Critical,
                description: "Engine restarts exhausted".into(),
                enabled: true,
            },
        ];
        Self {
            config,
            rules: Mutex::new(rules),
            book: Mutex::new(AlertBook::default()),
        }
    }

    fn rules(&self) -> MutexGuard<'_, Vec<AlertRule>> {
        self.rules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn book(&self) -> MutexGuard<'_, AlertBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn list_rules(&self) -> Vec<AlertRule> {
        self.rules().clone()
    }

    /// Enable or disable a rule. Returns false for an unknown rule name.
    pub fn set_rule_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut rules = self.rules();
        let Some(rule) = rules.iter_mut().find(|r| r.name == name) else {
            return false;
        };
        rule.enabled = enabled;
        if !enabled {
            self.book().active.remove(name);
        }
        info!(rule = name, enabled, "Alert rule toggled");
        true
    }

    pub fn evaluate(&self, status: &SupervisorStatus) -> Vec<Alert> {
        self.evaluate_at(status, Utc::now())
    }

    /// Check every enabled rule against `status`. Returns newly fired alerts.
    pub fn evaluate_at(&self, status: &SupervisorStatus, now: DateTime<Utc>) -> Vec<Alert> {
        let rules = self.rules().clone();
        let mut book = self.book();
        let new_exit = status.process_exits > book.exits_seen;
        book.exits_seen = status.process_exits;

        let throttle = Duration::seconds(self.config.throttle_secs as i64);
        let mut fired = Vec::new();

        for rule in rules.iter().filter(|r| r.enabled) {
            match self.condition(&rule.name, status, new_exit) {
                Some(message) => {
                    if book.active.contains_key(&rule.name) {
                        continue;
                    }
                    if let Some(last) = book.last_fired.get(&rule.name) {
                        if now - *last < throttle {
                            continue;
                        }
                    }
                    let alert = Alert {
                        rule: rule.name.clone(),
                        severity: rule.severity,
                        message,
                        fired_at: now,
                        resolved_at: None,
                    };
                    deliver(&alert);
                    book.active.insert(rule.name.clone(), alert.clone());
                    book.last_fired.insert(rule.name.clone(), now);
                    *book.counts.entry(rule.name.clone()).or_default() += 1;
                    push_history(&mut book.history, alert.clone());
                    fired.push(alert);
                }
                None => {
                    if let Some(mut alert) = book.active.remove(&rule.name) {
                        alert.resolved_at = Some(now);
                        info!(rule = %alert.rule, "Alert resolved");
                        push_history(&mut book.history, alert);
                    }
                }
            }
        }
        fired
    }

    fn condition(&self, rule: &str, status: &SupervisorStatus, new_exit: bool) -> Option<String> {
        let failures = status.consecutive_failures;
        match rule {
            HEALTH_CHECK_FAILING if failures >= self.config.warning_threshold => {
                Some(format!("{failures} consecutive health checks failed"))
            }
            HEALTH_CHECK_CRITICAL if failures >= self.config.critical_threshold => Some(format!(
                "{failures} consecutive health checks failed: {}",
                status.last_error.as_deref().unwrap_or("unknown error")
            )),
            ENGINE_PROCESS_DIED if new_exit => Some(format!(
                "engine process exited ({} exits total)",
                status.process_exits
            )),
            RESTARTS_EXHAUSTED if status.state == SupervisorState::Failed => Some(format!(
                "gave up after {} restart attempts",
                status.restart_attempts
            )),
            _ => None,
        }
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<_> = self.book().active.values().cloned().collect();
        alerts.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.fired_at.cmp(&b.fired_at)));
        alerts
    }

    /// Most recent first.
    pub fn history(&self, limit: usize) -> Vec<Alert> {
        self.book().history.iter().rev().take(limit).cloned().collect()
    }

    pub fn fire_count(&self, rule: &str) -> u64 {
        self.book().counts.get(rule).copied().unwrap_or(0)
    }
}

fn push_history(history: &mut VecDeque<Alert>, alert: Alert) {
    if history.len() == HISTORY_LIMIT {
        history.pop_front();
    }
    history.push_back(alert);
}

fn deliver(alert: &Alert) {
    match alert.severity {
        Severity::Info => info!(rule = %alert.rule, message = %alert.message, "Alert"),
        Severity::Warning => warn!(rule = %alert.rule, message = %alert.message, "Alert"),
        Severity::Critical => error!(rule = %alert.rule, message = %alert.message, "Alert"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: SupervisorState, failures: u32) -> SupervisorStatus {
        SupervisorStatus {
            state,
            pid: Some(1),
            consecutive_failures: failures,
            restart_attempts: 0,
            total_restarts: 0,
            process_exits: 0,
            last_error: Some("connection refused".into()),
            last_healthy_at: None,
            last_probe_at: None,
        }
    }

    fn manager() -> AlertManager {
        AlertManager::new(AlertsConfig::default())
    }

    #[test]
    fn test_warning_then_critical() {
        let alerts = manager();
        let now = Utc::now();
        assert!(alerts.evaluate_at(&status(SupervisorState::Unhealthy, 2), now).is_empty());

        let fired = alerts.evaluate_at(&status(SupervisorState::Unhealthy, 3), now);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].rule, HEALTH_CHECK_FAILING);
        assert_eq!(fired[0].severity, Severity::Warning);

        let fired = alerts.evaluate_at(&status(SupervisorState::Unhealthy, 5), now);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].rule, HEALTH_CHECK_CRITICAL);

        let active = alerts.active_alerts();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].severity, Severity::Critical);
    }

    #[test]
    fn test_resolves_when_condition_clears() {
        let alerts = manager();
        let now = Utc::now();
        alerts.evaluate_at(&status(SupervisorState::Unhealthy, 3), now);
        alerts.evaluate_at(&status(SupervisorState::Healthy, 0), now);
        assert!(alerts.active_alerts().is_empty());

        let history = alerts.history(10);
        assert_eq!(history.len(), 2);
        assert!(history[0].resolved_at.is_some());
    }

    #[test]
    fn test_throttle_suppresses_refire() {
        let alerts = manager();
        let t0 = Utc::now();
        alerts.evaluate_at(&status(SupervisorState::Unhealthy, 3), t0);
        alerts.evaluate_at(&status(SupervisorState::Healthy, 0), t0);

        let soon = t0 + Duration::seconds(60);
        assert!(alerts.evaluate_at(&status(SupervisorState::Unhealthy, 3), soon).is_empty());

        let later = t0 + Duration::seconds(301);
        assert_eq!(alerts.evaluate_at(&status(SupervisorState::Unhealthy, 3), later).len(), 1);
        assert_eq!(alerts.fire_count(HEALTH_CHECK_FAILING), 2);
    }

    #[test]
    fn test_process_death_fires_once_per_exit() {
        let alerts = manager();
        let mut s = status(SupervisorState::Restarting, 0);
        s.process_exits = 1;
        let now = Utc::now();
        let fired = alerts.evaluate_at(&s, now);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].rule, ENGINE_PROCESS_DIED);

        // Same exit count: condition cleared, alert resolves.
        assert!(alerts.evaluate_at(&s, now).is_empty());
        assert!(alerts.active_alerts().is_empty());
    }

    #[test]
    fn test_restarts_exhausted() {
        let alerts = manager();
        let fired = alerts.evaluate_at(&status(SupervisorState::Failed, 0), Utc::now());
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].rule, RESTARTS_EXHAUSTED);
    }

    #[test]
    fn test_disabled_rule_does_not_fire() {
        let alerts = manager();
        assert!(alerts.set_rule_enabled(HEALTH_CHECK_FAILING, false));
        assert!(!alerts.set_rule_enabled("no_such_rule", false));
        assert!(alerts.evaluate_at(&status(SupervisorState::Unhealthy, 3), Utc::now()).is_empty());
        assert!(!alerts.list_rules().iter().find(|r| r.name == HEALTH_CHECK_FAILING).unwrap().enabled);
    }
}
