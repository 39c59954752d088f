//! End-to-end scenarios across monitoring, failover, replication, forks and recovery

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use qnet_ha::monitoring::SampleTransition;
use qnet_ha::*;
use qnet_ledger::{AuditKind, Block, ChainSource, InMemoryAudit, Ledger};
use tempfile::TempDir;

/// Probe whose per-node verdict can be flipped at runtime
#[derive(Default)]
struct SwitchableProbe {
    down: Mutex<HashMap<String, bool>>,
}

impl SwitchableProbe {
    fn set_down(&self, node: &str, down: bool) {
        self.down.lock().insert(node.to_string(), down);
    }
}

#[async_trait]
impl HealthProbe for SwitchableProbe {
    async fn probe(&self, node_id: &str) -> Result<ProbeSample, ProbeError> {
        if self.down.lock().get(node_id).copied().unwrap_or(false) {
            Err(ProbeError::Timeout)
        } else {
            Ok(ProbeSample::new(15, 20.0))
        }
    }
}

struct Cluster {
    _dir: TempDir,
    ledger: Arc<Ledger>,
    audit: Arc<InMemoryAudit>,
    probe: Arc<SwitchableProbe>,
    transport: Arc<LoopbackTransport>,
    monitor: Arc<NodeMonitoringService>,
    replication: Arc<DataReplicationManager>,
    failover: Arc<NodeFailoverManager>,
    backups: Arc<DataBackupManager>,
    recovery: DisasterRecoveryManager,
}

fn monitoring_config() -> MonitoringConfig {
    MonitoringConfig {
        check_interval_ms: 100,
        fault_threshold: 3,
        max_latency_ms: 200,
        max_cpu_pct: 90.0,
        max_task_restarts: 2,
    }
}

fn replication_config(factor: usize) -> ReplicationConfig {
    ReplicationConfig {
        replication_factor: factor,
        chunk_size: 64 * 1024,
        transfer_timeout_ms: 1_000,
        max_attempts: 3,
        audit_interval_ms: 1_000,
    }
}

fn cluster(factor: usize) -> Cluster {
    let dir = TempDir::new().unwrap();
    let ledger = Arc::new(Ledger::with_genesis(Block::genesis(1_000)));
    let audit = Arc::new(InMemoryAudit::new());
    let probe = Arc::new(SwitchableProbe::default());
    let transport = Arc::new(LoopbackTransport::new());
    let alerts = AlertBus::default();

    let replication = Arc::new(DataReplicationManager::new(
        "a",
        replication_config(factor),
        transport.clone(),
        Arc::new(PlainPayload),
        audit.clone(),
    ));
    let monitor = Arc::new(NodeMonitoringService::new(
        monitoring_config(),
        probe.clone(),
        Arc::new(NoopRecovery),
        audit.clone(),
        alerts.clone(),
        EventSink::disabled(),
    ));
    for node in ["a", "b", "c"] {
        monitor.add_node(node);
    }
    let failover = Arc::new(NodeFailoverManager::new(
        FailoverConfig {
            primary: Some("a".into()),
            backups: vec!["b".into(), "c".into()],
            check_interval_ms: 100,
        },
        monitor.clone(),
        alerts.clone(),
    ));
    let backups = Arc::new(DataBackupManager::new(
        "a",
        BackupConfig {
            directory: dir.path().to_path_buf(),
            interval_secs: 60,
            retention_secs: 3_600,
            compress: true,
            io_timeout_ms: 5_000,
        },
        ledger.clone(),
    ));
    let recovery = DisasterRecoveryManager::new(
        "a",
        failover.clone(),
        replication.clone(),
        backups.clone(),
        monitor.clone(),
        alerts,
    );
    Cluster {
        _dir: dir,
        ledger,
        audit,
        probe,
        transport,
        monitor,
        replication,
        failover,
        backups,
        recovery,
    }
}

fn nodes(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_factor_two_stops_after_first_target() {
    let cluster = cluster(2);
    let state = cluster.ledger.state();

    let report = cluster
        .replication
        .replicate_full_ledger(&state, &nodes(&["b", "c"]))
        .await
        .unwrap();
    assert_eq!(report.replicated, nodes(&["b"]));
    assert_eq!(cluster.transport.contacts("c"), 0);

    let id = DataUnit::FullLedger(state).id().unwrap();
    let status = cluster.replication.get_replication_status(&id);
    let replicated: Vec<&str> = status
        .iter()
        .filter(|s| s.is_data_replicated)
        .map(|s| s.node_id.as_str())
        .collect();
    assert_eq!(replicated, vec!["a", "b"]);
    assert!(cluster.replication.replicated_count(&id) >= 2);
}

#[tokio::test]
async fn test_replication_is_monotonic() {
    let cluster = cluster(2);
    let block = cluster.ledger.get_last_block().unwrap();
    cluster.replication.replicate_block(&block, &nodes(&["b", "c"])).await.unwrap();
    let id = DataUnit::Block(block.clone()).id().unwrap();
    let before = cluster.replication.get_replication_status(&id);

    cluster.transport.set_down("b", true);
    cluster.replication.replicate_block(&block, &nodes(&["b", "c"])).await.unwrap();
    let after = cluster.replication.get_replication_status(&id);

    assert!(cluster.replication.replicated_count(&id) >= 2);
    for state in before.iter().filter(|s| s.is_data_replicated) {
        assert!(after.iter().any(|s| s.node_id == state.node_id && s.is_data_replicated));
    }
    assert_eq!(cluster.transport.contacts("b"), 1);
}

#[tokio::test]
async fn test_flipped_byte_rejects_target() {
    let cluster = cluster(2);
    cluster.transport.set_corrupt("b", true);
    let block = cluster.ledger.get_last_block().unwrap();

    let err = cluster
        .replication
        .replicate_block(&block, &nodes(&["b"]))
        .await
        .unwrap_err();
    assert!(matches!(err, HaError::InsufficientReplication { achieved: 1, required: 2 }));
    let id = DataUnit::Block(block).id().unwrap();
    assert_eq!(cluster.replication.holders(&id), nodes(&["a"]));
    assert_eq!(cluster.audit.count(AuditKind::Replication, "b"), 0);
}

#[tokio::test]
async fn test_longest_chain_scenarios() {
    let ledger = Arc::new(Ledger::with_genesis(Block::genesis(1_000)));
    for i in 1..4u64 {
        let head = ledger.get_last_block().unwrap();
        ledger
            .append_block(Block::new(i, 1_000 + i, head.calculate_hash(), Vec::new(), Vec::new()))
            .unwrap();
    }
    let canonical = ledger.get_blocks();
    let forks = ChainForkManager::new(ledger.clone(), &ForkConfig::default());

    let branch = |len: usize, salt: u64| {
        let mut blocks: Vec<Block> = Vec::new();
        for i in 0..len {
            let parent = blocks.last().unwrap_or(&canonical[1]);
            let (index, prev) = (parent.index + 1, parent.calculate_hash());
            blocks.push(Block::new(index, 50_000 + salt * 100 + i as u64, prev, Vec::new(), Vec::new()));
        }
        blocks
    };

    // N = 4: branches producing chains of 3, 4 and 5 blocks
    for (len, salt) in [(1, 1), (2, 2), (3, 3)] {
        for block in branch(len, salt) {
            forks.detect_fork(block).await.unwrap();
        }
    }
    assert_eq!(forks.branches().await.len(), 3);
    let expected_tip = branch(3, 3).last().unwrap().hash;

    let resolution = forks.fork_recovery().await.unwrap();
    assert!(matches!(resolution, ForkResolution::Switched { new_length: 5, .. }));
    assert_eq!(ledger.get_last_block().unwrap().hash, expected_tip);
    assert_eq!(&ledger.get_blocks()[..2], &canonical[..2]);

    // Two branches of equal length N+1 keep the chain unchanged
    let current = ledger.get_blocks();
    let rival = |salt: u64| {
        let mut blocks: Vec<Block> = Vec::new();
        for i in 0..4u64 {
            let parent = blocks.last().unwrap_or(&current[1]);
            let (index, prev) = (parent.index + 1, parent.calculate_hash());
            blocks.push(Block::new(index, 90_000 + salt * 100 + i, prev, Vec::new(), Vec::new()));
        }
        blocks
    };
    for salt in [1, 2] {
        for block in rival(salt) {
            forks.detect_fork(block).await.unwrap();
        }
    }
    assert_eq!(forks.resolve_fork().await.unwrap(), ForkResolution::KeptCanonical);
    assert_eq!(ledger.get_blocks(), current);
}

#[tokio::test]
async fn test_fault_threshold_escalation_and_reset() {
    let cluster = cluster(2);
    cluster.probe.set_down("a", true);
    for _ in 0..2 {
        cluster.monitor.sample_node("a").await;
    }
    assert!(cluster.monitor.is_healthy("a"), "below threshold the node is still healthy");
    assert_eq!(cluster.monitor.sample_node("a").await, SampleTransition::Escalated);
    assert_eq!(cluster.monitor.recovery_records().len(), 1);

    // Two new faults, then one healthy sample clears the count
    for _ in 0..2 {
        cluster.monitor.sample_node("a").await;
    }
    assert_eq!(cluster.monitor.get_node_status("a").unwrap().fault_count, 2);
    cluster.probe.set_down("a", false);
    assert_eq!(cluster.monitor.sample_node("a").await, SampleTransition::Healthy);
    assert_eq!(cluster.monitor.get_node_status("a").unwrap().fault_count, 0);
    assert_eq!(cluster.audit.count(AuditKind::NodeRecovery, "a"), 1);
}

#[tokio::test]
async fn test_failover_exhaustion_keeps_primary() {
    let cluster = cluster(2);
    let recovery = Arc::new(FailingRecovery);
    let monitor = Arc::new(NodeMonitoringService::new(
        monitoring_config(),
        cluster.probe.clone(),
        recovery,
        cluster.audit.clone(),
        AlertBus::default(),
        EventSink::disabled(),
    ));
    for node in ["a", "b", "c"] {
        monitor.add_node(node);
        cluster.probe.set_down(node, true);
        for _ in 0..3 {
            monitor.sample_node(node).await;
        }
        assert!(!monitor.is_healthy(node));
    }

    let alerts = AlertBus::default();
    let mut rx = alerts.subscribe();
    let failover = NodeFailoverManager::new(
        FailoverConfig {
            primary: Some("a".into()),
            backups: nodes(&["b", "c"]),
            check_interval_ms: 100,
        },
        monitor,
        alerts,
    );
    assert!(matches!(failover.check_primary().await, Err(HaError::NoHealthyBackup)));
    assert_eq!(failover.current_primary().as_deref(), Some("a"));
    assert_eq!(failover.status().state, FailoverState::Degraded);
    assert_eq!(rx.recv().await.unwrap().severity, AlertSeverity::Critical);
}

struct FailingRecovery;

#[async_trait]
impl NodeRecoveryHandler for FailingRecovery {
    async fn recover_node(&self, node_id: &str) -> HaResult<()> {
        Err(HaError::NodeNotFound(node_id.to_string()))
    }
}

#[tokio::test]
async fn test_disaster_recovery_of_primary() {
    let cluster = cluster(3);
    let state = cluster.ledger.state();
    cluster
        .replication
        .replicate_full_ledger(&state, &nodes(&["b", "c"]))
        .await
        .unwrap();
    let backup = cluster.backups.create_backup().await.unwrap();

    // Ledger drifts after the backup; c loses its disk
    let head = cluster.ledger.get_last_block().unwrap();
    cluster
        .ledger
        .append_block(Block::new(1, 2_000, head.hash, Vec::new(), Vec::new()))
        .unwrap();
    cluster.transport.wipe("c");

    let report = cluster.recovery.recover_from_failure("a").await;
    assert_eq!(report.failover, StepOutcome::Succeeded);
    assert_eq!(report.new_primary.as_deref(), Some("b"));
    assert_eq!(report.restore, StepOutcome::Succeeded);
    assert_eq!(report.backup_id.as_deref(), Some(backup.backup_id.as_str()));
    assert_eq!(cluster.ledger.state(), state);
    assert!(report.is_complete());

    let log = cluster.recovery.recovery_log();
    let events: Vec<RecoveryEvent> = log.iter().map(|e| e.event).collect();
    assert_eq!(
        events,
        vec![
            RecoveryEvent::Failover,
            RecoveryEvent::LedgerRestore,
            RecoveryEvent::DataRecovery,
            RecoveryEvent::RecoveryCompleted
        ]
    );
}

#[tokio::test]
async fn test_disaster_recovery_is_best_effort() {
    let cluster = cluster(2);
    // No backups exist and the node holds no replicated data
    let report = cluster.recovery.recover_from_failure("c").await;

    assert_eq!(report.failover, StepOutcome::Skipped);
    assert!(report.restore.is_failure());
    assert_eq!(report.data_recovery, StepOutcome::Succeeded);
    assert!(!report.is_complete());
    assert_eq!(cluster.failover.current_primary().as_deref(), Some("a"));

    let log = cluster.recovery.recovery_log();
    assert_eq!(log.len(), 4);
    assert!(log.last().unwrap().outcome.is_failure());
}

#[tokio::test]
async fn test_system_health_gate() {
    let cluster = cluster(2);
    assert!(cluster.recovery.check_system_health());

    cluster.probe.set_down("c", true);
    let recovery = Arc::new(FailingRecovery);
    let monitor = Arc::new(NodeMonitoringService::new(
        monitoring_config(),
        cluster.probe.clone(),
        recovery,
        cluster.audit.clone(),
        AlertBus::default(),
        EventSink::disabled(),
    ));
    monitor.add_node("b");
    monitor.add_node("c");
    for _ in 0..3 {
        monitor.sample_node("c").await;
    }
    let failover = Arc::new(NodeFailoverManager::new(
        FailoverConfig {
            primary: Some("a".into()),
            backups: nodes(&["b", "c"]),
            check_interval_ms: 100,
        },
        monitor.clone(),
        AlertBus::default(),
    ));
    let gate = DisasterRecoveryManager::new(
        "a",
        failover,
        cluster.replication.clone(),
        cluster.backups.clone(),
        monitor,
        AlertBus::default(),
    );
    assert!(!gate.check_system_health());
}

#[tokio::test(start_paused = true)]
async fn test_silent_node_flagged_after_twice_interval() {
    struct Silent;

    #[async_trait]
    impl HeartbeatTransport for Silent {
        async fn send_heartbeat(&self, node_id: &str) -> Result<(), ProbeError> {
            Err(ProbeError::Unreachable(node_id.to_string()))
        }
    }

    let (events, mut rx) = EventSink::channel();
    let heartbeat = Arc::new(HeartbeatService::new(
        Duration::from_secs(1),
        Arc::new(Silent),
        Arc::new(NoopRecovery),
        AlertBus::default(),
        events,
    ));
    heartbeat.add_node("b");

    tokio::time::advance(Duration::from_millis(2_000)).await;
    assert!(heartbeat.check_liveness().is_empty());
    tokio::time::advance(Duration::from_millis(100)).await;
    assert_eq!(heartbeat.check_liveness(), nodes(&["b"]));
    assert!(matches!(rx.recv().await, Some(MonitorEvent::Unresponsive { .. })));
}
