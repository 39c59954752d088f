//! HA node wiring
//!
//! Builds every HA manager from a [`NodeConfig`], starts their loops under a
//! single [`Supervisor`] and feeds incoming blocks through fork detection.

use std::sync::Arc;

use qnet_ha::monitoring::{HttpHealthProbe, HttpHeartbeat};
use qnet_ha::tls::build_client;
use qnet_ha::{
    AlertBus, ChainForkManager, DataBackupManager, DataReplicationManager, DisasterRecoveryManager, EventSink,
    ForkDetection, ForkResolution, HealthProbe, HeartbeatService, HeartbeatTransport, HttpsTransport,
    MonitorEvent, NodeFailoverManager, NodeMonitoringService, NodeRegistry, PlainPayload, RecoveryReport,
    RedundancyManager, ReplicationTransport, Supervisor,
};
use qnet_ledger::{Block, ChainSource, Ledger, TracingAudit};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};

/// Network capabilities the node talks through
pub struct Transports {
    pub probe: Arc<dyn HealthProbe>,
    pub heartbeat: Arc<dyn HeartbeatTransport>,
    pub replication: Arc<dyn ReplicationTransport>,
}

impl Transports {
    /// Mutually authenticated HTTPS to every peer in `registry`
    pub fn https(config: &NodeConfig, registry: &NodeRegistry) -> NodeResult<Self> {
        let client = build_client(&config.ha.tls, config.ha.replication.transfer_timeout())?;
        Ok(Self {
            probe: Arc::new(HttpHealthProbe::new(client.clone(), registry.clone())),
            heartbeat: Arc::new(HttpHeartbeat::new(
                client.clone(),
                registry.clone(),
                config.ha.node_id.clone(),
            )),
            replication: Arc::new(HttpsTransport::new(client, registry.clone())),
        })
    }
}

/// Running HA node
pub struct HaNode {
    config: NodeConfig,
    registry: NodeRegistry,
    ledger: Arc<Ledger>,
    alerts: AlertBus,
    supervisor: Supervisor,
    monitor: Arc<NodeMonitoringService>,
    heartbeat: Arc<HeartbeatService>,
    replication: Arc<DataReplicationManager>,
    redundancy: Arc<RedundancyManager>,
    failover: Arc<NodeFailoverManager>,
    forks: ChainForkManager,
    backups: Arc<DataBackupManager>,
    recovery: Arc<DisasterRecoveryManager>,
    events: Option<UnboundedReceiver<MonitorEvent>>,
    event_task: Option<JoinHandle<()>>,
}

impl HaNode {
    /// Node talking HTTPS to its peers
    pub fn new(config: NodeConfig) -> NodeResult<Self> {
        let registry = config.registry();
        let transports = Transports::https(&config, &registry)?;
        Self::with_transports(config, registry, transports)
    }

    /// Node over caller-supplied transports
    pub fn with_transports(config: NodeConfig, registry: NodeRegistry, transports: Transports) -> NodeResult<Self> {
        config.validate()?;
        let ha = &config.ha;
        let node_id = ha.node_id.clone();
        info!("Creating HA node {} with {} peers", node_id, config.peers.len());

        let ledger = Arc::new(Ledger::with_genesis(Block::genesis(0)));
        let audit = Arc::new(TracingAudit);
        let alerts = AlertBus::default();
        let (events, events_rx) = EventSink::channel();
        let supervisor = Supervisor::new(ha.monitoring.max_task_restarts, events.clone());

        let replication = Arc::new(
            DataReplicationManager::new(
                node_id.clone(),
                ha.replication.clone(),
                transports.replication,
                Arc::new(PlainPayload),
                audit.clone(),
            )
            .with_chain(ledger.clone()),
        );
        let monitor = Arc::new(NodeMonitoringService::new(
            ha.monitoring.clone(),
            transports.probe,
            replication.clone(),
            audit,
            alerts.clone(),
            events.clone(),
        ));
        let heartbeat = Arc::new(HeartbeatService::new(
            ha.heartbeat.interval(),
            transports.heartbeat,
            replication.clone(),
            alerts.clone(),
            events,
        ));
        // Failover reads the local node's health too
        for record in registry.all() {
            monitor.add_node(&record.node_id);
        }
        for peer in config.peer_ids() {
            heartbeat.add_node(&peer);
        }

        let failover = Arc::new(
            NodeFailoverManager::new(ha.failover.clone(), monitor.clone(), alerts.clone())
                .with_registry(registry.clone())
                .with_resync(replication.clone()),
        );
        let redundancy = Arc::new(
            RedundancyManager::new(registry.clone(), replication.clone(), ha.replication.audit_interval())
                .with_health(monitor.clone()),
        );
        let forks = ChainForkManager::new(ledger.clone(), &ha.fork);
        let backups = Arc::new(DataBackupManager::new(node_id.clone(), ha.backup.clone(), ledger.clone()));
        let recovery = Arc::new(DisasterRecoveryManager::new(
            node_id,
            failover.clone(),
            replication.clone(),
            backups.clone(),
            monitor.clone(),
            alerts.clone(),
        ));

        Ok(Self {
            config,
            registry,
            ledger,
            alerts,
            supervisor,
            monitor,
            heartbeat,
            replication,
            redundancy,
            failover,
            forks,
            backups,
            recovery,
            events: Some(events_rx),
            event_task: None,
        })
    }

    /// Load persisted backups and start every background loop
    pub async fn start(&mut self) -> NodeResult<()> {
        let events = self.events.take().ok_or(NodeError::AlreadyRunning)?;
        self.backups.load_manifest().await?;

        self.event_task = Some(tokio::spawn(log_events(events)));
        self.monitor.start_monitoring(&self.supervisor);
        self.heartbeat.start(&self.supervisor);
        self.failover.start_monitoring(&self.supervisor);
        self.redundancy.start_auditing(&self.supervisor);
        self.backups
            .start_auto_backup(&self.supervisor, self.config.ha.backup.interval());
        self.start_health_gate();

        info!(
            "HA node {} started: {} supervised tasks",
            self.config.ha.node_id,
            self.supervisor.task_count()
        );
        Ok(())
    }

    fn start_health_gate(&self) {
        let recovery = self.recovery.clone();
        let interval = self.config.ha.failover.check_interval();
        self.supervisor.spawn("system-health", move || {
            let recovery = recovery.clone();
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                let mut healthy = true;
                loop {
                    ticker.tick().await;
                    let now = recovery.check_system_health();
                    if now != healthy {
                        info!("System health changed: {}", if now { "healthy" } else { "at risk" });
                        healthy = now;
                    }
                }
            }
        });
    }

    /// Stop every loop and take a final backup
    pub async fn stop(&mut self) -> NodeResult<()> {
        info!("Stopping HA node {}", self.config.ha.node_id);
        self.supervisor.shutdown();
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
        self.backups.create_backup().await?;
        Ok(())
    }

    /// Feed a block received from consensus through fork handling
    pub async fn on_block(&self, block: Block) -> NodeResult<ForkDetection> {
        let detection = self.forks.detect_fork(block.clone()).await?;
        match detection {
            ForkDetection::NoFork => {
                self.ledger.append_block(block.clone())?;
                let targets = self.config.peer_ids();
                if let Err(e) = self.replication.replicate_block(&block, &targets).await {
                    warn!("Block #{} under-replicated: {}", block.index, e);
                }
            }
            ForkDetection::NewBranch(_) | ForkDetection::ExtendedBranch(_) => {
                match self.forks.fork_recovery().await? {
                    ForkResolution::Switched {
                        branch_id,
                        reorg_depth,
                        new_length,
                    } => info!(
                        "Switched to branch {} (reorg depth {}, length {})",
                        branch_id, reorg_depth, new_length
                    ),
                    ForkResolution::KeptCanonical => debug!("Canonical chain kept"),
                }
            }
        }
        Ok(detection)
    }

    /// Run disaster recovery for a failed node
    pub async fn recover(&self, failed_node: &str) -> RecoveryReport {
        self.recovery.recover_from_failure(failed_node).await
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn alerts(&self) -> &AlertBus {
        &self.alerts
    }

    pub fn monitor(&self) -> &Arc<NodeMonitoringService> {
        &self.monitor
    }

    pub fn replication(&self) -> &Arc<DataReplicationManager> {
        &self.replication
    }

    pub fn failover(&self) -> &Arc<NodeFailoverManager> {
        &self.failover
    }

    pub fn forks(&self) -> &ChainForkManager {
        &self.forks
    }

    pub fn backups(&self) -> &Arc<DataBackupManager> {
        &self.backups
    }

    /// Chain height of the local ledger
    pub fn height(&self) -> Option<u64> {
        self.ledger.get_last_block().ok().map(|b| b.index)
    }
}

async fn log_events(mut events: UnboundedReceiver<MonitorEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            MonitorEvent::Escalated { node_id } => warn!("Node {} escalated to faulty", node_id),
            MonitorEvent::Unresponsive { node_id, silent_for } => {
                warn!("Node {} silent for {:?}", node_id, silent_for)
            }
            MonitorEvent::TaskAbandoned { task } => error!("Supervised task {} abandoned", task),
            other => debug!("{:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use qnet_ha::{LoopbackTransport, ProbeError, ProbeSample};
    use tempfile::TempDir;

    struct SteadyProbe;

    #[async_trait]
    impl HealthProbe for SteadyProbe {
        async fn probe(&self, _node_id: &str) -> Result<ProbeSample, ProbeError> {
            Ok(ProbeSample::new(10, 20.0))
        }
    }

    #[async_trait]
    impl HeartbeatTransport for SteadyProbe {
        async fn send_heartbeat(&self, _node_id: &str) -> Result<(), ProbeError> {
            Ok(())
        }
    }

    fn node(dir: &TempDir) -> (HaNode, Arc<LoopbackTransport>) {
        let mut config = NodeConfig::default();
        config.ha.node_id = "a".into();
        config.ha.replication.replication_factor = 2;
        config.ha.failover.primary = Some("a".into());
        config.ha.failover.backups = vec!["b".into()];
        config.peers = vec![crate::config::PeerConfig {
            node_id: "b".into(),
            address: "10.0.0.2:8443".into(),
            role: qnet_ha::NodeRole::Backup,
        }];
        config.apply_overrides(None, Some(dir.path().to_path_buf()));

        let loopback = Arc::new(LoopbackTransport::new());
        let transports = Transports {
            probe: Arc::new(SteadyProbe),
            heartbeat: Arc::new(SteadyProbe),
            replication: loopback.clone(),
        };
        let registry = config.registry();
        (HaNode::with_transports(config, registry, transports).unwrap(), loopback)
    }

    fn child(parent: &Block, timestamp: u64) -> Block {
        Block::new(parent.index + 1, timestamp, parent.calculate_hash(), Vec::new(), Vec::new())
    }

    #[tokio::test]
    async fn test_block_appended_and_replicated() {
        let dir = TempDir::new().unwrap();
        let (node, loopback) = node(&dir);
        let head = node.ledger().get_last_block().unwrap();
        let block = child(&head, 1_000);

        assert_eq!(node.on_block(block.clone()).await.unwrap(), ForkDetection::NoFork);
        assert_eq!(node.height(), Some(1));
        assert_eq!(loopback.contacts("b"), 1);
        assert_eq!(node.replication().units().len(), 1);
    }

    #[tokio::test]
    async fn test_longer_branch_replaces_chain() {
        let dir = TempDir::new().unwrap();
        let (node, _) = node(&dir);
        let genesis = node.ledger().get_last_block().unwrap();
        let first = child(&genesis, 1_000);
        node.on_block(first).await.unwrap();

        let rival = child(&genesis, 2_000);
        let rival_next = child(&rival, 3_000);
        assert!(matches!(node.on_block(rival).await.unwrap(), ForkDetection::NewBranch(_)));
        assert_eq!(node.height(), Some(1));
        assert!(matches!(
            node.on_block(rival_next.clone()).await.unwrap(),
            ForkDetection::ExtendedBranch(_)
        ));
        assert_eq!(node.height(), Some(2));
        assert_eq!(node.ledger().get_last_block().unwrap(), rival_next);
    }

    #[tokio::test]
    async fn test_start_twice_rejected_and_stop_backs_up() {
        let dir = TempDir::new().unwrap();
        let (mut node, _) = node(&dir);
        node.start().await.unwrap();
        assert!(matches!(node.start().await, Err(NodeError::AlreadyRunning)));
        node.stop().await.unwrap();
        assert_eq!(node.backups().list_backups().await.len(), 1);
    }

    #[tokio::test]
    async fn test_recover_primary_promotes_backup() {
        let dir = TempDir::new().unwrap();
        let (node, _) = node(&dir);
        node.backups().create_backup().await.unwrap();

        let report = node.recover("a").await;
        assert_eq!(report.new_primary.as_deref(), Some("b"));
        assert_eq!(node.failover().current_primary().as_deref(), Some("b"));
        assert!(report.backup_id.is_some());
    }
}
