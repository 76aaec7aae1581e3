use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::optimizer::OptimizerConfig;
use crate::pool::{CircuitBreakerConfig, PoolConfig, MIN_SAMPLES_FLOOR};
use crate::routing::{Endpoint, IsolatorConfig, MonitorConfig, ReplicaInfo};

/// Convert seconds to a Duration
///
/// Negative and NaN values become zero, values too large for a Duration
/// saturate. [`Config::validate`] rejects both before a config is used.
fn secs(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

fn ensure_seconds(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        anyhow::bail!("{} must be a non-negative number of seconds, got {}", name, value);
    }
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("{} is out of range: {} seconds", name, value))?;
    Ok(())
}

/// Circuit breaker settings (durations in seconds)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSection {
    /// Failure rate that must be exceeded to open the circuit (0.0-1.0]
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,

    #[serde(default = "default_failure_window")]
    pub failure_window: f64,

    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout: f64,

    /// Delay before each retry attempt; the last entry repeats
    #[serde(default = "default_backoff_delays")]
    pub backoff_delays: Vec<f64>,

    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

fn default_failure_threshold() -> f64 {
    0.5
}

fn default_failure_window() -> f64 {
    60.0
}

fn default_recovery_timeout() -> f64 {
    30.0
}

fn default_backoff_delays() -> Vec<f64> {
    vec![1.0, 2.0, 4.0]
}

fn default_min_samples() -> usize {
    2
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window: default_failure_window(),
            recovery_timeout: default_recovery_timeout(),
            backoff_delays: default_backoff_delays(),
            min_samples: default_min_samples(),
        }
    }
}

impl CircuitBreakerSection {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            failure_window: secs(self.failure_window),
            recovery_timeout: secs(self.recovery_timeout),
            backoff_delays: self.backoff_delays.iter().copied().map(secs).collect(),
            min_samples: self.min_samples,
        }
    }
}

/// Settings for one connection pool (durations in seconds)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: f64,

    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: f64,
}

fn default_min_connections() -> usize {
    2
}

fn default_max_connections() -> usize {
    20
}

fn default_idle_timeout() -> f64 {
    300.0
}

fn default_acquire_timeout() -> f64 {
    30.0
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            idle_timeout: default_idle_timeout(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

impl PoolSection {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_connections: self.min_connections,
            max_connections: self.max_connections,
            idle_timeout: secs(self.idle_timeout),
            acquire_timeout: secs(self.acquire_timeout),
        }
    }
}

/// Read and write pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolsSection {
    #[serde(default)]
    pub read: PoolSection,

    #[serde(default)]
    pub write: PoolSection,

    /// Interval of the background idle reaper in seconds
    #[serde(default = "default_reap_interval")]
    pub reap_interval: f64,
}

fn default_reap_interval() -> f64 {
    60.0
}

impl Default for PoolsSection {
    fn default() -> Self {
        Self {
            read: PoolSection::default(),
            write: PoolSection::default(),
            reap_interval: default_reap_interval(),
        }
    }
}

/// Retry settings for circuit-protected acquisition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

fn default_max_retries() -> usize {
    3
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

/// Primary endpoint, replica snapshot and lag monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSection {
    #[serde(default)]
    pub primary: Endpoint,

    /// Largest acceptable replication lag in seconds
    #[serde(default = "default_max_replica_lag")]
    pub max_replica_lag: f64,

    /// Initial replica snapshot
    #[serde(default)]
    pub replicas: Vec<ReplicaInfo>,

    #[serde(default = "default_monitor_enabled")]
    pub monitor_enabled: bool,

    /// Interval between replica lag checks in seconds
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval: f64,
}

fn default_max_replica_lag() -> f64 {
    5.0
}

fn default_monitor_enabled() -> bool {
    true
}

fn default_monitor_interval() -> f64 {
    10.0
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            primary: Endpoint::default(),
            max_replica_lag: default_max_replica_lag(),
            replicas: Vec::new(),
            monitor_enabled: default_monitor_enabled(),
            monitor_interval: default_monitor_interval(),
        }
    }
}

impl RoutingSection {
    pub fn to_isolator_config(&self) -> IsolatorConfig {
        IsolatorConfig {
            primary: self.primary.clone(),
            max_replica_lag: self.max_replica_lag,
        }
    }

    pub fn to_monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            enabled: self.monitor_enabled,
            interval: secs(self.monitor_interval),
        }
    }
}

/// Query diagnostics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSection {
    /// Queries slower than this many seconds are slow
    #[serde(default = "default_slow_query_threshold")]
    pub slow_query_threshold: f64,

    #[serde(default = "default_max_query_history")]
    pub max_query_history: usize,

    #[serde(default = "default_n_plus_one_threshold")]
    pub n_plus_one_threshold: usize,

    #[serde(default = "default_index_min_occurrences")]
    pub index_min_occurrences: usize,
}

fn default_slow_query_threshold() -> f64 {
    0.1
}

fn default_max_query_history() -> usize {
    1000
}

fn default_n_plus_one_threshold() -> usize {
    3
}

fn default_index_min_occurrences() -> usize {
    3
}

impl Default for OptimizerSection {
    fn default() -> Self {
        Self {
            slow_query_threshold: default_slow_query_threshold(),
            max_query_history: default_max_query_history(),
            n_plus_one_threshold: default_n_plus_one_threshold(),
            index_min_occurrences: default_index_min_occurrences(),
        }
    }
}

impl OptimizerSection {
    pub fn to_optimizer_config(&self) -> OptimizerConfig {
        OptimizerConfig {
            slow_query_threshold: secs(self.slow_query_threshold),
            max_query_history: self.max_query_history,
            n_plus_one_threshold: self.n_plus_one_threshold,
            index_min_occurrences: self.index_min_occurrences,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSection,

    #[serde(default)]
    pub pools: PoolsSection,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub routing: RoutingSection,

    #[serde(default)]
    pub optimizer: OptimizerSection,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check every setting for values the runtime cannot honor
    pub fn validate(&self) -> Result<()> {
        let cb = &self.circuit_breaker;
        if !(cb.failure_threshold > 0.0 && cb.failure_threshold <= 1.0) {
            anyhow::bail!(
                "circuit_breaker.failure_threshold must be in (0, 1], got {}",
                cb.failure_threshold
            );
        }
        ensure_seconds("circuit_breaker.failure_window", cb.failure_window)?;
        ensure_seconds("circuit_breaker.recovery_timeout", cb.recovery_timeout)?;
        if cb.backoff_delays.is_empty() {
            anyhow::bail!("circuit_breaker.backoff_delays must not be empty");
        }
        for delay in &cb.backoff_delays {
            ensure_seconds("circuit_breaker.backoff_delays", *delay)?;
        }
        if cb.backoff_delays.windows(2).any(|pair| pair[1] < pair[0]) {
            anyhow::bail!("circuit_breaker.backoff_delays must be non-decreasing");
        }
        if cb.min_samples < MIN_SAMPLES_FLOOR {
            anyhow::bail!(
                "circuit_breaker.min_samples must be at least {}, got {}",
                MIN_SAMPLES_FLOOR,
                cb.min_samples
            );
        }

        for (name, pool) in [("read", &self.pools.read), ("write", &self.pools.write)] {
            pool.to_pool_config()
                .validate()
                .with_context(|| format!("Invalid pools.{} configuration", name))?;
            ensure_seconds(&format!("pools.{}.idle_timeout", name), pool.idle_timeout)?;
            ensure_seconds(&format!("pools.{}.acquire_timeout", name), pool.acquire_timeout)?;
        }
        ensure_seconds("pools.reap_interval", self.pools.reap_interval)?;

        if self.retry.max_retries == 0 {
            anyhow::bail!("retry.max_retries must be at least 1");
        }

        ensure_seconds("routing.max_replica_lag", self.routing.max_replica_lag)?;
        ensure_seconds("routing.monitor_interval", self.routing.monitor_interval)?;
        if self.routing.monitor_enabled && self.routing.monitor_interval == 0.0 {
            anyhow::bail!("routing.monitor_interval must be positive when monitoring is enabled");
        }

        ensure_seconds("optimizer.slow_query_threshold", self.optimizer.slow_query_threshold)?;
        if self.optimizer.max_query_history == 0 {
            anyhow::bail!("optimizer.max_query_history must be at least 1");
        }

        Ok(())
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    config.validate()?;
    Ok(config)
}

/// Load configuration from environment variables
///
/// Reads `.env` first if present. Every variable is optional:
/// - DBGUARD_FAILURE_THRESHOLD, DBGUARD_FAILURE_WINDOW, DBGUARD_RECOVERY_TIMEOUT
/// - DBGUARD_BACKOFF_DELAYS (comma-separated seconds)
/// - DBGUARD_READ_MIN_CONNECTIONS / DBGUARD_READ_MAX_CONNECTIONS
/// - DBGUARD_WRITE_MIN_CONNECTIONS / DBGUARD_WRITE_MAX_CONNECTIONS
/// - DBGUARD_IDLE_TIMEOUT, DBGUARD_ACQUIRE_TIMEOUT (both pools)
/// - DBGUARD_MAX_RETRIES
/// - DBGUARD_PRIMARY (host:port), DBGUARD_REPLICAS (comma-separated host:port)
/// - DBGUARD_MAX_REPLICA_LAG, DBGUARD_MONITOR_INTERVAL
/// - DBGUARD_SLOW_QUERY_THRESHOLD, DBGUARD_MAX_QUERY_HISTORY
/// - DBGUARD_N_PLUS_ONE_THRESHOLD, DBGUARD_INDEX_MIN_OCCURRENCES
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let config = config_from_vars(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => {
            let value = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid value for {}: {:?}", key, raw))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Parse `host` or `host:port`
pub fn parse_endpoint(raw: &str) -> Result<Endpoint> {
    let raw = raw.trim();
    match raw.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .with_context(|| format!("Invalid port in endpoint {:?}", raw))?;
            Ok(Endpoint::new(host, port))
        }
        None if !raw.is_empty() => Ok(Endpoint::new(raw, Endpoint::default().port)),
        None => anyhow::bail!("Empty endpoint"),
    }
}

/// Build a configuration from a variable lookup, starting from defaults
fn config_from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let mut config = Config::new();

    let cb = &mut config.circuit_breaker;
    if let Some(v) = parse_var(&lookup, "DBGUARD_FAILURE_THRESHOLD")? {
        cb.failure_threshold = v;
    }
    if let Some(v) = parse_var(&lookup, "DBGUARD_FAILURE_WINDOW")? {
        cb.failure_window = v;
    }
    if let Some(v) = parse_var(&lookup, "DBGUARD_RECOVERY_TIMEOUT")? {
        cb.recovery_timeout = v;
    }
    if let Some(raw) = lookup("DBGUARD_BACKOFF_DELAYS") {
        cb.backoff_delays = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<f64>()
                    .with_context(|| format!("Invalid value in DBGUARD_BACKOFF_DELAYS: {:?}", s))
            })
            .collect::<Result<_>>()?;
    }

    let pools = &mut config.pools;
    if let Some(v) = parse_var(&lookup, "DBGUARD_READ_MIN_CONNECTIONS")? {
        pools.read.min_connections = v;
    }
    if let Some(v) = parse_var(&lookup, "DBGUARD_READ_MAX_CONNECTIONS")? {
        pools.read.max_connections = v;
    }
    if let Some(v) = parse_var(&lookup, "DBGUARD_WRITE_MIN_CONNECTIONS")? {
        pools.write.min_connections = v;
    }
    if let Some(v) = parse_var(&lookup, "DBGUARD_WRITE_MAX_CONNECTIONS")? {
        pools.write.max_connections = v;
    }
    if let Some(v) = parse_var::<f64>(&lookup, "DBGUARD_IDLE_TIMEOUT")? {
        pools.read.idle_timeout = v;
        pools.write.idle_timeout = v;
    }
    if let Some(v) = parse_var::<f64>(&lookup, "DBGUARD_ACQUIRE_TIMEOUT")? {
        pools.read.acquire_timeout = v;
        pools.write.acquire_timeout = v;
    }

    if let Some(v) = parse_var(&lookup, "DBGUARD_MAX_RETRIES")? {
        config.retry.max_retries = v;
    }

    let routing = &mut config.routing;
    if let Some(raw) = lookup("DBGUARD_PRIMARY") {
        routing.primary = parse_endpoint(&raw).context("Invalid DBGUARD_PRIMARY")?;
    }
    if let Some(raw) = lookup("DBGUARD_REPLICAS") {
        routing.replicas = raw
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                parse_endpoint(s)
                    .map(|ep| ReplicaInfo::new(ep.host, ep.port))
                    .context("Invalid DBGUARD_REPLICAS entry")
            })
            .collect::<Result<_>>()?;
    }
    if let Some(v) = parse_var(&lookup, "DBGUARD_MAX_REPLICA_LAG")? {
        routing.max_replica_lag = v;
    }
    if let Some(v) = parse_var(&lookup, "DBGUARD_MONITOR_INTERVAL")? {
        routing.monitor_interval = v;
    }

    let optimizer = &mut config.optimizer;
    if let Some(v) = parse_var(&lookup, "DBGUARD_SLOW_QUERY_THRESHOLD")? {
        optimizer.slow_query_threshold = v;
    }
    if let Some(v) = parse_var(&lookup, "DBGUARD_MAX_QUERY_HISTORY")? {
        optimizer.max_query_history = v;
    }
    if let Some(v) = parse_var(&lookup, "DBGUARD_N_PLUS_ONE_THRESHOLD")? {
        optimizer.n_plus_one_threshold = v;
    }
    if let Some(v) = parse_var(&lookup, "DBGUARD_INDEX_MIN_OCCURRENCES")? {
        optimizer.index_min_occurrences = v;
    }

    Ok(config)
}

/// Load configuration from file or environment
///
/// Tries the YAML file first when a path is given, otherwise falls back to
/// environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    match config_path {
        Some(path) => load_from_yaml(path),
        None => load_from_env(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_load_from_yaml_string() {
        let yaml = r#"
circuit_breaker:
  failure_threshold: 0.4
  failure_window: 30
  backoff_delays: [0.5, 1, 2]

pools:
  read:
    min_connections: 4
    max_connections: 40
  write:
    max_connections: 10
    acquire_timeout: 2.5

routing:
  primary:
    host: db-primary
    port: 5432
  max_replica_lag: 2.0
  replicas:
    - host: db-r1
      port: 5432
    - host: db-r2
      port: 5433
      replication_lag: 0.7
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.circuit_breaker.failure_threshold, 0.4);
        let breaker = config.circuit_breaker.to_breaker_config();
        assert_eq!(breaker.failure_window, Duration::from_secs(30));
        assert_eq!(breaker.backoff_delays[0], Duration::from_millis(500));
        assert_eq!(breaker.recovery_timeout, Duration::from_secs(30));

        assert_eq!(config.pools.read.max_connections, 40);
        assert_eq!(config.pools.write.min_connections, 2);
        assert_eq!(
            config.pools.write.to_pool_config().acquire_timeout,
            Duration::from_millis(2500)
        );

        assert_eq!(config.routing.primary.host, "db-primary");
        assert_eq!(config.routing.replicas.len(), 2);
        assert_eq!(config.routing.replicas[1].replication_lag, 0.7);
        assert!(config.routing.replicas[0].is_healthy);
    }

    #[test]
    fn test_default_values() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        config.validate().unwrap();

        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.routing.max_replica_lag, 5.0);
        assert_eq!(config.optimizer.n_plus_one_threshold, 3);
        assert_eq!(config.optimizer.index_min_occurrences, 3);
        assert_eq!(
            config.optimizer.to_optimizer_config().slow_query_threshold,
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::new();
        config.circuit_breaker.failure_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::new();
        config.circuit_breaker.backoff_delays = vec![2.0, 1.0];
        assert!(config.validate().is_err());

        let mut config = Config::new();
        config.circuit_breaker.backoff_delays.clear();
        assert!(config.validate().is_err());

        let mut config = Config::new();
        config.pools.read.min_connections = 30;
        assert!(config.validate().is_err());

        let mut config = Config::new();
        config.pools.write.max_connections = 0;
        assert!(config.validate().is_err());

        let mut config = Config::new();
        config.retry.max_retries = 0;
        assert!(config.validate().is_err());

        let mut config = Config::new();
        config.routing.max_replica_lag = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_vars() {
        let config = config_from_vars(vars(&[
            ("DBGUARD_FAILURE_THRESHOLD", "0.25"),
            ("DBGUARD_BACKOFF_DELAYS", "0.1, 0.2,0.4"),
            ("DBGUARD_READ_MAX_CONNECTIONS", "50"),
            ("DBGUARD_IDLE_TIMEOUT", "120"),
            ("DBGUARD_PRIMARY", "pg-main:6432"),
            ("DBGUARD_REPLICAS", "pg-r1:6432,pg-r2"),
            ("DBGUARD_N_PLUS_ONE_THRESHOLD", "5"),
        ]))
        .unwrap();

        assert_eq!(config.circuit_breaker.failure_threshold, 0.25);
        assert_eq!(config.circuit_breaker.backoff_delays, vec![0.1, 0.2, 0.4]);
        assert_eq!(config.pools.read.max_connections, 50);
        assert_eq!(config.pools.write.idle_timeout, 120.0);
        assert_eq!(config.routing.primary, Endpoint::new("pg-main", 6432));
        assert_eq!(config.routing.replicas[1].id(), "pg-r2:5432");
        assert_eq!(config.optimizer.n_plus_one_threshold, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_vars_rejects_garbage() {
        let err = config_from_vars(vars(&[("DBGUARD_MAX_RETRIES", "many")])).unwrap_err();
        assert!(err.to_string().contains("DBGUARD_MAX_RETRIES"));
        assert!(config_from_vars(vars(&[("DBGUARD_PRIMARY", "host:notaport")])).is_err());
    }

    #[test]
    fn test_secs_conversion_saturates_invalid() {
        assert_eq!(secs(-1.0), Duration::ZERO);
        assert_eq!(secs(f64::NAN), Duration::ZERO);
        assert_eq!(secs(1.5), Duration::from_millis(1500));
        assert_eq!(secs(1e30), Duration::MAX);
        assert_eq!(secs(f64::INFINITY), Duration::MAX);
    }

    #[test]
    fn test_validation_rejects_low_min_samples() {
        for min_samples in [0, 1] {
            let yaml = format!("circuit_breaker:\n  min_samples: {}\n", min_samples);
            let config: Config = serde_yaml::from_str(&yaml).unwrap();
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("min_samples"));
        }

        let config: Config = serde_yaml::from_str("circuit_breaker:\n  min_samples: 3\n").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_unrepresentable_durations() {
        let mut config = Config::new();
        config.circuit_breaker.recovery_timeout = 1e30;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("circuit_breaker.recovery_timeout"));

        let mut config = Config::new();
        config.circuit_breaker.backoff_delays = vec![1.0, 1e25];
        assert!(config.validate().is_err());

        let mut config = Config::new();
        config.pools.write.acquire_timeout = 1e300;
        assert!(config.validate().is_err());

        let mut config = Config::new();
        config.routing.monitor_interval = 1e21;
        assert!(config.validate().is_err());

        // Largest values a Duration holds are still accepted
        let mut config = Config::new();
        config.circuit_breaker.failure_window = 1e15;
        assert!(config.validate().is_ok());
    }
}
