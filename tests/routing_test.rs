//! Integration tests for query routing and replica monitoring

use dbguard::pool::BoxError;
use dbguard::routing::{
    Endpoint, IsolatorConfig, LagCheck, MonitorConfig, Priority, Query, QueryType, ReplicaInfo,
    ReplicaMonitor, RouteReason, TargetType, WorkloadIsolator,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn config(max_lag: f64) -> IsolatorConfig {
    IsolatorConfig {
        primary: Endpoint::new("pg-primary", 5432),
        max_replica_lag: max_lag,
    }
}

#[test]
fn test_writes_and_critical_reads_stay_on_primary() {
    let isolator = WorkloadIsolator::new(
        config(5.0),
        vec![ReplicaInfo::new("pg-r1", 5432).with_lag(0.1)],
    );

    let write = isolator.route_query(
        &Query::new("DELETE FROM sessions WHERE expires_at < now()"),
        Priority::Normal,
    );
    assert_eq!(write.target_type, TargetType::Primary);
    assert_eq!(write.reason, RouteReason::WriteOperation);
    assert_eq!(write.endpoint(), Endpoint::new("pg-primary", 5432));

    let critical = isolator.route_query(&Query::new("SELECT balance FROM accounts"), Priority::Critical);
    assert_eq!(critical.target_type, TargetType::Primary);
    assert_eq!(critical.reason, RouteReason::CriticalPriority);

    let unknown = isolator.route_query(&Query::new("VACUUM ANALYZE orders"), Priority::Normal);
    assert_eq!(unknown.reason, RouteReason::UnknownQueryType);
}

#[test]
fn test_read_lag_bound() {
    let fresh = WorkloadIsolator::new(config(5.0), vec![ReplicaInfo::new("pg-r1", 5432).with_lag(0.5)]);
    let target = fresh.route_query(&Query::new("SELECT * FROM orders"), Priority::Normal);
    assert_eq!(target.target_type, TargetType::Replica);
    assert_eq!(target.host, "pg-r1");

    let stale = WorkloadIsolator::new(config(5.0), vec![ReplicaInfo::new("pg-r1", 5432).with_lag(10.0)]);
    let target = stale.route_query(&Query::new("SELECT * FROM orders"), Priority::Normal);
    assert_eq!(target.target_type, TargetType::Primary);
    assert!(target.reason.is_fallback());
}

#[test]
fn test_lowest_lag_replica_wins() {
    let isolator = WorkloadIsolator::new(
        config(5.0),
        vec![
            ReplicaInfo::new("a", 5432).with_lag(2.0),
            ReplicaInfo::new("b", 5432).with_lag(0.0).with_health(false),
            ReplicaInfo::new("c", 5432).with_lag(0.5),
        ],
    );

    let target = isolator.route_query(&Query::new("SELECT 1"), Priority::High);
    assert_eq!(target.host, "c");
    assert_eq!(target.reason, RouteReason::LowestLagReplica { lag: 0.5 });
}

#[test]
fn test_explicit_query_type_overrides_classification() {
    let isolator = WorkloadIsolator::new(config(5.0), vec![ReplicaInfo::new("pg-r1", 5432)]);

    // A function call that writes, declared by the caller
    let query = Query::new("SELECT archive_old_orders()").with_type(QueryType::Update);
    let target = isolator.route_query(&query, Priority::Normal);
    assert!(target.is_primary());
}

#[test]
fn test_snapshot_swap_changes_routing() {
    let isolator = WorkloadIsolator::new(config(1.0), vec![]);
    let read = Query::new("SELECT id FROM users");

    assert_eq!(
        isolator.route_query(&read, Priority::Normal).reason,
        RouteReason::NoReplicasConfigured
    );

    isolator.update_replica_info(vec![ReplicaInfo::new("pg-r2", 5433).with_lag(0.2)]);
    let target = isolator.route_query(&read, Priority::Normal);
    assert_eq!(target.endpoint(), Endpoint::new("pg-r2", 5433));

    let status = isolator.get_replica_status();
    assert_eq!(status.len(), 1);
    assert!(status[0].eligible);
}

#[test]
fn test_should_route_to_primary_uses_given_lag() {
    let isolator = WorkloadIsolator::new(config(5.0), vec![]);
    let read = Query::new("SELECT * FROM products");

    assert!(!isolator.should_route_to_primary(&read, Priority::Normal, 5.0));
    assert!(isolator.should_route_to_primary(&read, Priority::Normal, 5.01));
    assert!(isolator.should_route_to_primary(&read, Priority::Normal, f64::NAN));
    assert!(isolator.should_route_to_primary(&read, Priority::Critical, 0.0));
}

#[tokio::test]
async fn test_monitor_drives_routing() {
    let lags: Arc<Mutex<HashMap<String, f64>>> = Arc::new(Mutex::new(HashMap::from([
        ("pg-r1:5432".to_string(), 0.3),
        ("pg-r2:5432".to_string(), 0.1),
    ])));

    let source = Arc::clone(&lags);
    let check: LagCheck = Arc::new(move |id: &str| -> Result<f64, BoxError> {
        source
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .ok_or_else(|| format!("replica {} unreachable", id).into())
    });

    let isolator = Arc::new(
        WorkloadIsolator::new(
            config(1.0),
            vec![ReplicaInfo::new("pg-r1", 5432), ReplicaInfo::new("pg-r2", 5432)],
        )
        .with_lag_check(check),
    );
    let monitor = Arc::new(ReplicaMonitor::new(
        Arc::clone(&isolator),
        MonitorConfig {
            enabled: true,
            interval: Duration::from_millis(10),
        },
    ));

    let read = Query::new("SELECT * FROM invoices");
    assert_eq!(monitor.refresh(), 2);
    assert_eq!(isolator.route_query(&read, Priority::Normal).host, "pg-r2");

    // r2 disappears; r1 becomes the only candidate after the next cycle
    lags.lock().unwrap().remove("pg-r2:5432");
    let handle = Arc::clone(&monitor).start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.abort();

    let target = isolator.route_query(&read, Priority::Normal);
    assert_eq!(target.host, "pg-r1");
    let down = isolator
        .replicas()
        .iter()
        .find(|r| r.host == "pg-r2")
        .cloned()
        .unwrap();
    assert!(!down.is_healthy);
    assert!(down.replication_lag.is_infinite());
}

#[tokio::test]
async fn test_monitor_without_lag_check_exits() {
    let isolator = Arc::new(WorkloadIsolator::new(config(5.0), vec![ReplicaInfo::new("pg-r1", 5432)]));
    let monitor = Arc::new(ReplicaMonitor::new(isolator, MonitorConfig::default()));

    let handle = monitor.start();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("monitor should exit without a lag check")
        .unwrap();
}
