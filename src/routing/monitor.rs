use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::isolator::WorkloadIsolator;

/// Configuration for replica lag monitoring
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Whether periodic lag checks run at all
    pub enabled: bool,
    /// Interval between lag checks
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
        }
    }
}

/// Periodically re-measures replica lag and publishes a fresh snapshot to
/// the isolator
///
/// A replica whose lag cannot be measured is published as unhealthy with
/// infinite lag, which keeps it out of routing until a later check succeeds.
pub struct ReplicaMonitor {
    isolator: Arc<WorkloadIsolator>,
    config: MonitorConfig,
}

impl ReplicaMonitor {
    pub fn new(isolator: Arc<WorkloadIsolator>, config: MonitorConfig) -> Self {
        Self { isolator, config }
    }

    /// Start the monitoring background task
    /// Returns a task handle that runs until aborted
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.enabled {
                info!("Replica monitor disabled - replica snapshot is only updated externally");
                return;
            }
            if !self.isolator.has_lag_check() {
                info!("No lag check configured - replica monitor not started");
                return;
            }

            info!(
                interval_secs = self.config.interval.as_secs_f64(),
                "Replica monitor started"
            );

            loop {
                let start = Instant::now();
                // Lag checks may do blocking I/O
                let monitor = Arc::clone(&self);
                match tokio::task::spawn_blocking(move || monitor.refresh()).await {
                    Ok(eligible) => debug!(
                        eligible,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Replica lag check cycle completed"
                    ),
                    Err(e) => warn!(error = %e, "Replica lag check cycle failed"),
                }

                sleep(self.config.interval).await;
            }
        })
    }

    /// Measure every replica once and publish the result
    ///
    /// Runs the lag check synchronously for each replica. The result is only
    /// published if nobody replaced the snapshot while measuring; otherwise
    /// the newer snapshot is kept and measured on the next cycle.
    ///
    /// Returns the number of replicas eligible for routing afterwards.
    pub fn refresh(&self) -> usize {
        let max_lag = self.isolator.max_replica_lag();
        let current = self.isolator.replicas();

        let updated: Vec<_> = current
            .iter()
            .map(|replica| {
                let id = replica.id();
                let lag = self.isolator.check_replica_lag(&id);
                let mut replica = replica.clone();

                let reachable = lag.is_finite();
                if replica.is_healthy && !reachable {
                    warn!(replica = %id, "Replica lag unknown, marking unhealthy");
                } else if !replica.is_healthy && reachable {
                    info!(replica = %id, lag, "Replica reachable again, marking healthy");
                }

                replica.is_healthy = reachable;
                replica.replication_lag = lag;
                replica
            })
            .collect();

        let eligible = updated.iter().filter(|r| r.is_eligible(max_lag)).count();
        if self.isolator.update_replica_info_if_current(&current, updated) {
            return eligible;
        }

        debug!("Replica snapshot replaced during lag checks, keeping the newer one");
        self.isolator
            .replicas()
            .iter()
            .filter(|r| r.is_eligible(max_lag))
            .count()
    }
}
