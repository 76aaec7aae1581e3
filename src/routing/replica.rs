use serde::{Deserialize, Serialize};
use std::fmt;

/// A host/port pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new("localhost", 5432)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A candidate read replica, as last reported by health checking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub host: String,
    pub port: u16,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default = "default_healthy")]
    pub is_healthy: bool,

    /// CPU utilization in percent
    #[serde(default)]
    pub cpu_utilization: f64,

    /// Average response time in milliseconds
    #[serde(default)]
    pub avg_response_time: f64,

    /// Replication lag in seconds; infinite when unknown
    #[serde(default)]
    pub replication_lag: f64,
}

fn default_weight() -> u32 {
    1
}

fn default_healthy() -> bool {
    true
}

impl ReplicaInfo {
    /// Create a healthy, caught-up replica
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: default_weight(),
            is_healthy: true,
            cpu_utilization: 0.0,
            avg_response_time: 0.0,
            replication_lag: 0.0,
        }
    }

    pub fn with_lag(mut self, replication_lag: f64) -> Self {
        self.replication_lag = replication_lag;
        self
    }

    pub fn with_health(mut self, is_healthy: bool) -> Self {
        self.is_healthy = is_healthy;
        self
    }

    /// Identifier used by lag checks: `host:port`
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    /// Healthy and no further behind than `max_lag` seconds
    pub fn is_eligible(&self, max_lag: f64) -> bool {
        self.is_healthy && self.replication_lag <= max_lag
    }
}

/// Routing view of one replica
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaStatus {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub is_healthy: bool,
    pub replication_lag: f64,
    pub within_lag_bound: bool,
    pub eligible: bool,
    pub cpu_utilization: f64,
    pub avg_response_time: f64,
}
