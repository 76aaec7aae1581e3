//! Workload routing module
//!
//! This module decides, per query, whether work runs on the primary or on a
//! read replica.
//!
//! # Components
//!
//! - [`Query`] / [`QueryType`] / [`Priority`]: the unit of work and its classification
//! - [`ReplicaInfo`]: a candidate replica as reported by health checking
//! - [`WorkloadIsolator`]: the routing decision over a replica snapshot
//! - [`ReplicaMonitor`]: optional background lag checking that refreshes the snapshot
//!
//! # Routing rules
//!
//! 1. Unrecognized statements go to the primary
//! 2. `Critical` priority goes to the primary
//! 3. Writes (INSERT/UPDATE/DELETE) go to the primary
//! 4. Reads go to the healthy replica with the lowest lag within the bound,
//!    falling back to the primary when none qualifies
//!
//! Routing never fails; every ambiguity resolves to the primary.

pub mod isolator;
pub mod monitor;
pub mod query;
pub mod replica;

pub use isolator::{
    DatabaseTarget, IsolatorConfig, LagCheck, RouteReason, TargetType, WorkloadIsolator,
};
pub use monitor::{MonitorConfig, ReplicaMonitor};
pub use query::{Priority, Query, QueryType};
pub use replica::{Endpoint, ReplicaInfo, ReplicaStatus};
