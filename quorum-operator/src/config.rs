//! Operator configuration.
//!
//! Configuration is read from `QUORUM_*` environment variables and can be
//! overridden with builder methods (the binary applies its CLI flags this way).

use crate::error::{OperatorError, OperatorResult};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default full reconciliation interval (2 minutes).
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 120_000;
/// Default readiness timeout for a restarted pod (5 minutes).
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 300_000;
/// Default readiness poll period.
pub const DEFAULT_READINESS_POLL_MS: u64 = 1_000;
/// Default worker pool bound.
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: usize = 4;

/// How generation tokens are derived from a pod template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenerationStrategyKind {
    /// Content hash of the pod template.
    #[default]
    Hash,
    /// Integer bumped whenever the template changes.
    Counter,
}

impl FromStr for GenerationStrategyKind {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hash" => Ok(Self::Hash),
            "counter" => Ok(Self::Counter),
            other => Err(OperatorError::InvalidConfig(format!(
                "Unknown generation strategy: {}",
                other
            ))),
        }
    }
}

/// Configuration for the operator process.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Watched namespaces. Empty means all namespaces.
    namespaces: Vec<String>,
    /// Interval between full reconciliation sweeps.
    sweep_interval: Duration,
    /// How long to wait for a replaced pod to become ready.
    readiness_timeout: Duration,
    /// How often readiness is polled.
    readiness_poll_interval: Duration,
    /// Maximum reconciliations running at once.
    max_concurrent_reconciles: usize,
    /// Generation token strategy.
    generation_strategy: GenerationStrategyKind,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespaces: Vec::new(),
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
            readiness_timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
            readiness_poll_interval: Duration::from_millis(DEFAULT_READINESS_POLL_MS),
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
            generation_strategy: GenerationStrategyKind::default(),
        }
    }
}

impl OperatorConfig {
    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `QUORUM_NAMESPACES`: comma-separated namespaces (empty = all)
    /// - `QUORUM_FULL_RECONCILIATION_INTERVAL_MS`: sweep interval
    /// - `QUORUM_OPERATION_TIMEOUT_MS`: readiness timeout
    /// - `QUORUM_READINESS_POLL_INTERVAL_MS`: readiness poll period
    /// - `QUORUM_MAX_CONCURRENT_RECONCILES`: worker pool bound
    /// - `QUORUM_GENERATION_STRATEGY`: "hash" or "counter"
    pub fn from_env() -> OperatorResult<Self> {
        let namespaces = env::var("QUORUM_NAMESPACES")
            .map(|s| parse_namespaces(&s))
            .unwrap_or_default();

        let generation_strategy = match env::var("QUORUM_GENERATION_STRATEGY") {
            Ok(s) => s.parse()?,
            Err(_) => GenerationStrategyKind::default(),
        };

        Ok(Self {
            namespaces,
            sweep_interval: Duration::from_millis(env_u64(
                "QUORUM_FULL_RECONCILIATION_INTERVAL_MS",
                DEFAULT_SWEEP_INTERVAL_MS,
            )),
            readiness_timeout: Duration::from_millis(env_u64(
                "QUORUM_OPERATION_TIMEOUT_MS",
                DEFAULT_OPERATION_TIMEOUT_MS,
            )),
            readiness_poll_interval: Duration::from_millis(env_u64(
                "QUORUM_READINESS_POLL_INTERVAL_MS",
                DEFAULT_READINESS_POLL_MS,
            )),
            max_concurrent_reconciles: env::var("QUORUM_MAX_CONCURRENT_RECONCILES")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(DEFAULT_MAX_CONCURRENT_RECONCILES)
                .max(1),
            generation_strategy,
        })
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> OperatorResult<()> {
        if self.readiness_timeout.is_zero() {
            return Err(OperatorError::InvalidConfig(
                "Readiness timeout must be greater than zero".into(),
            ));
        }
        if self.readiness_poll_interval > self.readiness_timeout {
            return Err(OperatorError::InvalidConfig(format!(
                "Readiness poll interval {:?} exceeds readiness timeout {:?}",
                self.readiness_poll_interval, self.readiness_timeout
            )));
        }
        if self.sweep_interval.is_zero() {
            return Err(OperatorError::InvalidConfig(
                "Full reconciliation interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Set the watched namespaces.
    pub fn with_namespaces(mut self, namespaces: Vec<String>) -> Self {
        self.namespaces = namespaces;
        self
    }

    /// Set the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the readiness timeout.
    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    /// Set the readiness poll interval.
    pub fn with_readiness_poll_interval(mut self, interval: Duration) -> Self {
        self.readiness_poll_interval = interval;
        self
    }

    /// Set the worker pool bound.
    pub fn with_max_concurrent_reconciles(mut self, max: usize) -> Self {
        self.max_concurrent_reconciles = max.max(1); // At least 1
        self
    }

    /// Set the generation strategy.
    pub fn with_generation_strategy(mut self, strategy: GenerationStrategyKind) -> Self {
        self.generation_strategy = strategy;
        self
    }

    /// Watched namespaces (empty = all).
    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    /// Sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Readiness timeout.
    pub fn readiness_timeout(&self) -> Duration {
        self.readiness_timeout
    }

    /// Readiness poll interval.
    pub fn readiness_poll_interval(&self) -> Duration {
        self.readiness_poll_interval
    }

    /// Worker pool bound.
    pub fn max_concurrent_reconciles(&self) -> usize {
        self.max_concurrent_reconciles
    }

    /// Generation strategy.
    pub fn generation_strategy(&self) -> GenerationStrategyKind {
        self.generation_strategy
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

/// Split a comma-separated namespace list, dropping blanks.
pub fn parse_namespaces(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
