//! Process-wide configuration, parsed from the environment once at the CLI
//! boundary. Every other component takes a `KernelConfig` by value/`Arc`
//! instead of reading `std::env` itself.

use std::path::PathBuf;
use std::time::Duration;

/// Locking strategy for the atomic mutator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Exclusive `fs2` advisory lock per table.
    Advisory,
    /// Reread-at-commit compare-and-swap fallback for filesystems without
    /// advisory locking.
    CompareAndSwap,
}

#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Root of the state directory (`COORDINATION_DIR`).
    pub coordination_dir: PathBuf,
    pub service_name: String,
    pub service_version: String,
    pub telemetry_sample_rate: f64,
    pub lock_timeout: Duration,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub stale_claim_timeout: Duration,
    pub max_retries: u32,
    pub lock_mode: LockMode,
    pub health_weights: HealthWeights,
    /// How long an agent must hold a fresh heartbeat while `recovering`
    /// before being promoted back to `active`.
    pub recovery_grace: Duration,
    /// Heartbeat staleness multiple (in heartbeat intervals) past which the
    /// health scan marks an agent `unhealthy`.
    pub unhealthy_after_missed_heartbeats: u32,
}

/// Weights for the health-score formula, summing to 1.0
/// by convention but not enforced — an operator retuning the mix is allowed
/// to over- or under-weight deliberately.
#[derive(Debug, Clone, Copy)]
pub struct HealthWeights {
    pub heartbeat_freshness: f64,
    pub span_success_rate: f64,
    pub load_headroom: f64,
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            heartbeat_freshness: 0.4,
            span_success_rate: 0.4,
            load_headroom: 0.2,
        }
    }
}

impl KernelConfig {
    /// Build configuration from the documented environment variables,
    /// falling back to spec defaults. `COORDINATION_DIR` is the only
    /// required variable.
    pub fn from_env() -> Result<Self, crate::error::SwarmError> {
        let coordination_dir = std::env::var("COORDINATION_DIR")
            .map(PathBuf::from)
            .map_err(|_| crate::error::SwarmError::UsageError {
                message: "COORDINATION_DIR must be set to the coordination state directory".to_string(),
            })?;

        Ok(Self {
            coordination_dir,
            service_name: env_or("OTEL_SERVICE_NAME", "swarmsh"),
            service_version: env_or("OTEL_SERVICE_VERSION", env!("CARGO_PKG_VERSION")),
            telemetry_sample_rate: env_parsed("TELEMETRY_SAMPLE_RATE", 1.0),
            lock_timeout: Duration::from_millis(env_parsed("LOCK_TIMEOUT_MS", 30_000)),
            poll_interval: Duration::from_millis(env_parsed("POLL_INTERVAL_MS", 2_000)),
            heartbeat_interval: Duration::from_millis(env_parsed("HEARTBEAT_INTERVAL_MS", 10_000)),
            stale_claim_timeout: Duration::from_millis(env_parsed("STALE_CLAIM_TIMEOUT_MS", 30 * 60 * 1000)),
            max_retries: env_parsed("MAX_RETRIES", 3),
            lock_mode: match std::env::var("SWARMSH_LOCK_MODE").as_deref() {
                Ok("cas") => LockMode::CompareAndSwap,
                _ => LockMode::Advisory,
            },
            health_weights: HealthWeights::default(),
            recovery_grace: Duration::from_millis(env_parsed("RECOVERY_GRACE_MS", 30_000)),
            unhealthy_after_missed_heartbeats: env_parsed("UNHEALTHY_AFTER_MISSED_HEARTBEATS", 3),
        })
    }

    /// Configuration rooted at `dir`, with every other field at its spec
    /// default. Used by tests and by the `swarmsh` binary's `--dir` flag.
    pub fn for_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            coordination_dir: dir.into(),
            service_name: "swarmsh".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            telemetry_sample_rate: 1.0,
            lock_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
            stale_claim_timeout: Duration::from_secs(30 * 60),
            max_retries: 3,
            lock_mode: LockMode::Advisory,
            health_weights: HealthWeights::default(),
            recovery_grace: Duration::from_secs(30),
            unhealthy_after_missed_heartbeats: 3,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
