//! Configuration loading, environment overrides, and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DrawbridgeError, Result};

/// Top-level Drawbridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub alerts: AlertsConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Where the canvas engine listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3031
}

/// How the agent side reaches (and launches) the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL the agent side uses. Derived from `server` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Accept full-overwrite syncs from viewers.
    #[serde(default = "default_true")]
    pub sync_enabled: bool,

    /// Spawn the engine as soon as the supervisor starts.
    #[serde(default = "default_true")]
    pub auto_start: bool,

    /// Program to launch; defaults to `<current exe> engine`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            url: None,
            sync_enabled: true,
            auto_start: true,
            command: None,
            args: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// What an agent command does when the engine is not healthy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailablePolicy {
    /// Block until the engine turns healthy, bounded by `wait_timeout_ms`.
    #[default]
    Wait,
    /// Return `EngineUnavailable` immediately.
    FailFast,
}

/// Health-check and restart policy for the managed engine process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    /// Consecutive failed probes before a restart.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub unavailable_policy: UnavailablePolicy,
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_interval_ms: default_health_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            startup_grace_ms: default_startup_grace_ms(),
            failure_threshold: default_failure_threshold(),
            max_restarts: default_max_restarts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            unavailable_policy: UnavailablePolicy::default(),
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

fn default_health_interval_ms() -> u64 {
    5_000
}

fn default_probe_timeout_ms() -> u64 {
    3_000
}

fn default_startup_grace_ms() -> u64 {
    10_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_max_restarts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_wait_timeout_ms() -> u64 {
    15_000
}

impl SupervisorConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// Delay before restart attempt `attempt` (1-based): exponential, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

/// Broadcast hub tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Per-subscriber queue length; a subscriber whose queue is full is dropped.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

fn default_subscriber_buffer() -> usize {
    256
}

/// Alert rules fed by supervisor health data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: u32,
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: u32,
    #[serde(default = "default_throttle_secs")]
    pub throttle_secs: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warning_threshold: default_warning_threshold(),
            critical_threshold: default_critical_threshold(),
            throttle_secs: default_throttle_secs(),
        }
    }
}

fn default_warning_threshold() -> u32 {
    3
}

fn default_critical_threshold() -> u32 {
    5
}

fn default_throttle_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "drawbridge_engine=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

fn default_log_format() -> String {
    "plain".to_string()
}

fn default_log_output() -> String {
    "stderr".to_string()
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

/// Parse a boolean environment flag.
pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        json5::from_str(&substituted).map_err(|e| DrawbridgeError::Config(e.to_string()))
    }

    /// Load from `path` and then apply process environment overrides.
    pub fn load_with_env(path: &Path) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.engine.url = Some(config.engine_url());
        Ok(config)
    }

    /// Apply `HOST`, `PORT`, `ENGINE_URL`, `ENABLE_CANVAS_SYNC`, `CANVAS_AUTO_START`.
    ///
    /// Takes a lookup function so tests do not have to touch the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST").filter(|h| !h.is_empty()) {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT").filter(|p| !p.is_empty()) {
            self.server.port = port
                .parse()
                .map_err(|_| DrawbridgeError::Config(format!("PORT is not a valid port: {port}")))?;
        }
        if let Some(url) = lookup("ENGINE_URL").filter(|u| !u.is_empty()) {
            self.engine.url = Some(url);
        }
        if let Some(flag) = lookup("ENABLE_CANVAS_SYNC") {
            self.engine.sync_enabled = parse_bool_flag(&flag).ok_or_else(|| {
                DrawbridgeError::Config(format!("ENABLE_CANVAS_SYNC is not a boolean: {flag}"))
            })?;
        }
        if let Some(flag) = lookup("CANVAS_AUTO_START") {
            self.engine.auto_start = parse_bool_flag(&flag).ok_or_else(|| {
                DrawbridgeError::Config(format!("CANVAS_AUTO_START is not a boolean: {flag}"))
            })?;
        }
        Ok(())
    }

    /// Default config file location.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Address the engine binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Where the agent side reaches the engine: `engine.url` when set,
    /// otherwise the server's bind address. Wildcard hosts map to loopback.
    pub fn engine_url(&self) -> String {
        if let Some(url) = &self.engine.url {
            return url.clone();
        }
        let host = match self.server.host.as_str() {
            "0.0.0.0" | "" => "127.0.0.1",
            "::" => "[::1]",
            other => other,
        };
        format!("http://{host}:{}", self.server.port)
    }

    /// Get a config value by dotted path (e.g. "supervisor.max_restarts").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("Server port cannot be 0".to_string());
        }

        let engine_url = self.engine_url();
        if url::Url::parse(&engine_url).is_err() {
            errors.push(format!("Engine URL is not a valid URL: {engine_url}"));
        }

        let sup = &self.supervisor;
        if sup.failure_threshold == 0 {
            errors.push("supervisor.failure_threshold must be at least 1".to_string());
        }
        if sup.health_interval_ms == 0 {
            errors.push("supervisor.health_interval_ms must be positive".to_string());
        }
        if sup.backoff_base_ms > sup.backoff_max_ms {
            errors.push(format!(
                "supervisor.backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                sup.backoff_base_ms, sup.backoff_max_ms
            ));
        }
        if sup.probe_timeout_ms >= sup.health_interval_ms {
            warnings.push(format!(
                "supervisor.probe_timeout_ms ({}) is not shorter than health_interval_ms ({})",
                sup.probe_timeout_ms, sup.health_interval_ms
            ));
        }
        if sup.max_restarts == 0 {
            warnings.push("supervisor.max_restarts is 0; the engine will never be restarted".to_string());
        }

        if self.hub.subscriber_buffer == 0 {
            errors.push("hub.subscriber_buffer must be at least 1".to_string());
        }

        if self.alerts.critical_threshold < self.alerts.warning_threshold {
            warnings.push("alerts.critical_threshold is below warning_threshold".to_string());
        }

        (warnings, errors)
    }
}

/// Base directory for Drawbridge data: `~/.drawbridge/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".drawbridge")
}
