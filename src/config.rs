use crate::health::HealthPolicy;
use crate::route::{RouteSpec, TargetPolicy};
use crate::scheduler::SchedulerConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the route monitor
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Health monitoring settings
    #[serde(default)]
    pub health: HealthConfig,

    /// Restrictions on route targets
    #[serde(default)]
    pub policy: TargetPolicy,

    /// Routes created at startup when nothing was persisted
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the admin API (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API (default: 8000)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the admin API; requests are unauthenticated if unset
    pub admin_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Where route definitions are persisted; routes live in memory only if unset
    pub routes_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            pid_file: None,
            routes_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Run the background monitor (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Scheduler tick in milliseconds (default: 1000)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Check interval for routes without their own (default: 300)
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Successful responses slower than this are DEGRADED (default: 3000)
    #[serde(default = "default_degraded_threshold_ms")]
    pub degraded_threshold_ms: u64,

    /// Consecutive failures before an established route turns DOWN (default: 1)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Maximum probes in flight at once (default: 16)
    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,

    /// Time past a route's timeout before a probe task is aborted (default: 1000)
    #[serde(default = "default_probe_grace_ms")]
    pub probe_grace_ms: u64,

    /// Verify certificates of https targets (default: false)
    #[serde(default)]
    pub tls_verify: bool,

    /// PEM bundle of trusted CAs, required when `tls_verify` is set
    pub tls_ca_file: Option<PathBuf>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: default_tick_interval_ms(),
            check_interval_secs: default_check_interval_secs(),
            degraded_threshold_ms: default_degraded_threshold_ms(),
            failure_threshold: default_failure_threshold(),
            max_concurrent_probes: default_max_concurrent_probes(),
            probe_grace_ms: default_probe_grace_ms(),
            tls_verify: false,
            tls_ca_file: None,
        }
    }
}

impl HealthConfig {
    pub fn policy(&self) -> HealthPolicy {
        HealthPolicy {
            degraded_threshold_ms: self.degraded_threshold_ms,
            failure_threshold: self.failure_threshold,
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            check_interval: Duration::from_secs(self.check_interval_secs),
            max_concurrent_probes: self.max_concurrent_probes,
            probe_grace: Duration::from_millis(self.probe_grace_ms),
        }
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.tick_interval_ms == 0 {
            errors.push("health.tick_interval_ms must be at least 1".to_string());
        }
        if self.check_interval_secs == 0 {
            errors.push("health.check_interval_secs must be at least 1".to_string());
        }
        if self.failure_threshold == 0 {
            errors.push("health.failure_threshold must be at least 1".to_string());
        }
        if self.max_concurrent_probes == 0 {
            errors.push("health.max_concurrent_probes must be at least 1".to_string());
        }
        if self.tls_verify {
            match &self.tls_ca_file {
                None => errors.push("health.tls_verify requires health.tls_ca_file".to_string()),
                Some(path) if !path.exists() => errors.push(format!(
                    "health.tls_ca_file '{}' does not exist",
                    path.display()
                )),
                Some(_) => {}
            }
        }

        errors
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    8000
}

fn default_true() -> bool {
    true
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_check_interval_secs() -> u64 {
    300
}

fn default_degraded_threshold_ms() -> u64 {
    3000
}

fn default_failure_threshold() -> u32 {
    1
}

fn default_max_concurrent_probes() -> usize {
    16
}

fn default_probe_grace_ms() -> u64 {
    1000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = self.health.validate();

        if self.server.admin_token.as_deref() == Some("") {
            errors.push("server.admin_token must not be empty".to_string());
        }

        for (idx, route) in self.routes.iter().enumerate() {
            if let Err(e) = route.validate(&self.policy) {
                errors.push(format!("routes[{}] ({}): {}", idx, route.path, e));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
