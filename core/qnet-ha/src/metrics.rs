//! Metrics collection for the HA layer

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_gauge, CounterVec, Gauge};

lazy_static! {
    /// Health samples by outcome
    pub static ref HEALTH_SAMPLES: CounterVec = register_counter_vec!(
        "qnet_ha_health_samples_total",
        "Total number of node health samples",
        &["result"]
    ).expect("health sample counter registers once");

    /// Nodes currently flagged faulty
    pub static ref FAULTY_NODES: Gauge = register_gauge!(
        "qnet_ha_faulty_nodes",
        "Number of nodes currently flagged faulty"
    ).expect("faulty node gauge registers once");

    /// Node recoveries by outcome
    pub static ref NODE_RECOVERIES: CounterVec = register_counter_vec!(
        "qnet_ha_node_recoveries_total",
        "Total number of node recoveries",
        &["result"]
    ).expect("recovery counter registers once");

    /// Heartbeat misses
    pub static ref HEARTBEAT_MISSES: CounterVec = register_counter_vec!(
        "qnet_ha_heartbeat_misses_total",
        "Nodes flagged unresponsive by the heartbeat monitor",
        &["node"]
    ).expect("heartbeat counter registers once");

    /// Failover attempts by outcome
    pub static ref FAILOVERS: CounterVec = register_counter_vec!(
        "qnet_ha_failovers_total",
        "Total number of failover attempts",
        &["result"]
    ).expect("failover counter registers once");

    /// Replication transfers by outcome
    pub static ref REPLICATION_TRANSFERS: CounterVec = register_counter_vec!(
        "qnet_ha_replication_transfers_total",
        "Replication transfers per target",
        &["result"]
    ).expect("replication counter registers once");

    /// Fork events by type
    pub static ref FORK_EVENTS: CounterVec = register_counter_vec!(
        "qnet_ha_fork_events_total",
        "Fork detections and resolutions",
        &["event"]
    ).expect("fork counter registers once");

    /// Backup operations by type and outcome
    pub static ref BACKUP_OPERATIONS: CounterVec = register_counter_vec!(
        "qnet_ha_backup_operations_total",
        "Backup, restore and prune operations",
        &["op", "result"]
    ).expect("backup counter registers once");
}

fn outcome(ok: bool) -> &'static str {
    if ok { "success" } else { "failure" }
}

/// Record a health sample
pub fn record_health_sample(healthy: bool) {
    let label = if healthy { "healthy" } else { "faulty" };
    HEALTH_SAMPLES.with_label_values(&[label]).inc();
}

/// Update faulty node gauge
pub fn set_faulty_nodes(count: usize) {
    FAULTY_NODES.set(count as f64);
}

/// Record a node recovery
pub fn record_node_recovery(ok: bool) {
    NODE_RECOVERIES.with_label_values(&[outcome(ok)]).inc();
}

/// Record a heartbeat miss
pub fn record_heartbeat_miss(node_id: &str) {
    HEARTBEAT_MISSES.with_label_values(&[node_id]).inc();
}

/// Record a failover attempt
pub fn record_failover(ok: bool) {
    FAILOVERS.with_label_values(&[outcome(ok)]).inc();
}

/// Record a replication transfer
pub fn record_transfer(result: &str) {
    REPLICATION_TRANSFERS.with_label_values(&[result]).inc();
}

/// Record a fork event
pub fn record_fork_event(event: &str) {
    FORK_EVENTS.with_label_values(&[event]).inc();
}

/// Record a backup operation
pub fn record_backup_op(op: &str, ok: bool) {
    BACKUP_OPERATIONS.with_label_values(&[op, outcome(ok)]).inc();
}
