//! Workload isolation: per-query primary/replica routing
//!
//! Routing is a pure decision over the query, its priority and the current
//! replica snapshot. The snapshot is an `Arc<Vec<ReplicaInfo>>` that is
//! swapped wholesale by [`WorkloadIsolator::update_replica_info`]; readers
//! clone the `Arc` and never observe a partially updated list.

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use super::query::{Priority, Query, QueryType};
use super::replica::{Endpoint, ReplicaInfo, ReplicaStatus};
use crate::pool::BoxError;

/// Measures replication lag in seconds for a replica id (`host:port`)
pub type LagCheck = Arc<dyn Fn(&str) -> Result<f64, BoxError> + Send + Sync>;

/// Kind of database a query is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Primary,
    Replica,
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TargetType::Primary => "primary",
            TargetType::Replica => "replica",
        })
    }
}

/// Why a routing decision was made
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    UnknownQueryType,
    CriticalPriority,
    WriteOperation,
    NoReplicasConfigured,
    NoEligibleReplica,
    LowestLagReplica { lag: f64 },
}

impl RouteReason {
    /// A read that wanted a replica but ended on the primary
    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            RouteReason::NoReplicasConfigured | RouteReason::NoEligibleReplica
        )
    }
}

impl fmt::Display for RouteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteReason::UnknownQueryType => {
                f.write_str("unknown query type, routing to primary for safety")
            }
            RouteReason::CriticalPriority => f.write_str("critical priority"),
            RouteReason::WriteOperation => f.write_str("write operation requires primary"),
            RouteReason::NoReplicasConfigured => f.write_str("no replicas configured"),
            RouteReason::NoEligibleReplica => {
                f.write_str("no healthy replica within lag bound, falling back")
            }
            RouteReason::LowestLagReplica { lag } => {
                write!(f, "read routed to replica with lowest lag ({:.3}s)", lag)
            }
        }
    }
}

/// Routing decision
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseTarget {
    pub target_type: TargetType,
    pub host: String,
    pub port: u16,
    pub reason: RouteReason,
}

impl DatabaseTarget {
    fn primary(endpoint: &Endpoint, reason: RouteReason) -> Self {
        Self {
            target_type: TargetType::Primary,
            host: endpoint.host.clone(),
            port: endpoint.port,
            reason,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.target_type == TargetType::Primary
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

/// Configuration for the workload isolator
#[derive(Debug, Clone)]
pub struct IsolatorConfig {
    pub primary: Endpoint,

    /// Largest acceptable replication lag, in seconds
    pub max_replica_lag: f64,
}

impl Default for IsolatorConfig {
    fn default() -> Self {
        Self {
            primary: Endpoint::default(),
            max_replica_lag: 5.0,
        }
    }
}

/// Routes queries to the primary or to the freshest eligible replica
pub struct WorkloadIsolator {
    config: IsolatorConfig,
    replicas: RwLock<Arc<Vec<ReplicaInfo>>>,
    lag_check: Option<LagCheck>,
}

impl WorkloadIsolator {
    pub fn new(config: IsolatorConfig, replicas: Vec<ReplicaInfo>) -> Self {
        info!(
            primary = %config.primary,
            replicas = replicas.len(),
            max_replica_lag = config.max_replica_lag,
            "Creating workload isolator"
        );
        Self {
            config,
            replicas: RwLock::new(Arc::new(replicas)),
            lag_check: None,
        }
    }

    /// Use `lag_check` for [`WorkloadIsolator::check_replica_lag`]
    pub fn with_lag_check(mut self, lag_check: LagCheck) -> Self {
        self.lag_check = Some(lag_check);
        self
    }

    pub fn has_lag_check(&self) -> bool {
        self.lag_check.is_some()
    }

    pub fn primary(&self) -> &Endpoint {
        &self.config.primary
    }

    pub fn max_replica_lag(&self) -> f64 {
        self.config.max_replica_lag
    }

    /// Current replica snapshot
    pub fn replicas(&self) -> Arc<Vec<ReplicaInfo>> {
        let guard = self.replicas.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Replace the replica snapshot
    pub fn update_replica_info(&self, replicas: Vec<ReplicaInfo>) {
        let healthy = replicas.iter().filter(|r| r.is_healthy).count();
        let total = replicas.len();
        let fresh = Arc::new(replicas);
        *self.replicas.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        debug!(total, healthy, "Replica snapshot updated");
    }

    /// Replace the replica snapshot only if it is still `expected`
    ///
    /// Returns `false` and leaves the snapshot alone when another writer
    /// replaced it since `expected` was read.
    pub fn update_replica_info_if_current(
        &self,
        expected: &Arc<Vec<ReplicaInfo>>,
        replicas: Vec<ReplicaInfo>,
    ) -> bool {
        let mut guard = self.replicas.write().unwrap_or_else(PoisonError::into_inner);
        if !Arc::ptr_eq(&*guard, expected) {
            return false;
        }
        let healthy = replicas.iter().filter(|r| r.is_healthy).count();
        let total = replicas.len();
        *guard = Arc::new(replicas);
        drop(guard);
        debug!(total, healthy, "Replica snapshot updated");
        true
    }

    /// Decide where `query` should run
    pub fn route_query(&self, query: &Query, priority: Priority) -> DatabaseTarget {
        let query_type = query.query_type();
        let primary = &self.config.primary;

        let target = if query_type == QueryType::Other {
            DatabaseTarget::primary(primary, RouteReason::UnknownQueryType)
        } else if priority == Priority::Critical {
            DatabaseTarget::primary(primary, RouteReason::CriticalPriority)
        } else if query_type.is_write() {
            DatabaseTarget::primary(primary, RouteReason::WriteOperation)
        } else {
            self.route_read()
        };

        debug!(
            query_type = %query_type,
            priority = %priority,
            target = ?target.target_type,
            host = %target.host,
            port = target.port,
            reason = %target.reason,
            "Routed query"
        );
        target
    }

    fn route_read(&self) -> DatabaseTarget {
        let replicas = self.replicas();
        if replicas.is_empty() {
            return DatabaseTarget::primary(&self.config.primary, RouteReason::NoReplicasConfigured);
        }

        // Strict comparison keeps the first replica on ties
        let mut best: Option<&ReplicaInfo> = None;
        for replica in replicas
            .iter()
            .filter(|r| r.is_eligible(self.config.max_replica_lag))
        {
            if best.map_or(true, |b| replica.replication_lag < b.replication_lag) {
                best = Some(replica);
            }
        }

        match best {
            Some(replica) => DatabaseTarget {
                target_type: TargetType::Replica,
                host: replica.host.clone(),
                port: replica.port,
                reason: RouteReason::LowestLagReplica {
                    lag: replica.replication_lag,
                },
            },
            None => {
                warn!(
                    replicas = replicas.len(),
                    max_replica_lag = self.config.max_replica_lag,
                    "No eligible replica, falling back to primary"
                );
                DatabaseTarget::primary(&self.config.primary, RouteReason::NoEligibleReplica)
            }
        }
    }

    /// Same decision as [`WorkloadIsolator::route_query`] for a caller that
    /// already holds a freshly measured lag for its replica
    pub fn should_route_to_primary(&self, query: &Query, priority: Priority, replica_lag: f64) -> bool {
        let query_type = query.query_type();
        query_type == QueryType::Other
            || query_type.is_write()
            || priority == Priority::Critical
            || !(replica_lag <= self.config.max_replica_lag)
    }

    /// Replication lag of `replica_id` in seconds
    ///
    /// Uses the lag check when one is configured; a failing check yields
    /// infinity. Without a lag check the snapshot value is returned, or
    /// infinity for an unknown replica.
    pub fn check_replica_lag(&self, replica_id: &str) -> f64 {
        if let Some(lag_check) = &self.lag_check {
            return match lag_check(replica_id) {
                Ok(lag) if lag.is_finite() && lag >= 0.0 => lag,
                Ok(lag) => {
                    warn!(replica = %replica_id, lag, "Lag check returned an invalid value");
                    f64::INFINITY
                }
                Err(e) => {
                    warn!(replica = %replica_id, error = %e, "Lag check failed");
                    f64::INFINITY
                }
            };
        }

        self.replicas()
            .iter()
            .find(|r| r.id() == replica_id)
            .map_or(f64::INFINITY, |r| r.replication_lag)
    }

    /// Routing view of every replica in the snapshot
    pub fn get_replica_status(&self) -> Vec<ReplicaStatus> {
        let max_lag = self.config.max_replica_lag;
        self.replicas()
            .iter()
            .map(|r| ReplicaStatus {
                id: r.id(),
                host: r.host.clone(),
                port: r.port,
                is_healthy: r.is_healthy,
                replication_lag: r.replication_lag,
                within_lag_bound: r.replication_lag <= max_lag,
                eligible: r.is_eligible(max_lag),
                cpu_utilization: r.cpu_utilization,
                avg_response_time: r.avg_response_time,
            })
            .collect()
    }
}
