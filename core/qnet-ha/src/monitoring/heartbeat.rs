//! Heartbeat-based liveness detection
//!
//! One sender per node emits a heartbeat every interval; a single monitor
//! checks ten times per interval and flags nodes whose last heartbeat is
//! older than twice the interval.
//! Alerts raised here are advisory. Fault decisions belong to
//! [`NodeMonitoringService`](super::NodeMonitoringService).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{EventSink, MonitorEvent, Supervisor};
use crate::metrics;
use crate::traits::{HeartbeatTransport, NodeRecoveryHandler};
use crate::types::{AlertBus, AlertSeverity};

/// Liveness checks per heartbeat interval
const MONITOR_RESOLUTION: u32 = 10;

/// Heartbeat sender/monitor
pub struct HeartbeatService {
    interval: Duration,
    nodes: RwLock<Vec<String>>,
    /// node_id -> time of last successful heartbeat
    last_heartbeat: RwLock<HashMap<String, Instant>>,
    flagged: RwLock<HashSet<String>>,
    transport: Arc<dyn HeartbeatTransport>,
    recovery: Arc<dyn NodeRecoveryHandler>,
    alerts: AlertBus,
    events: EventSink,
}

impl HeartbeatService {
    pub fn new(
        interval: Duration,
        transport: Arc<dyn HeartbeatTransport>,
        recovery: Arc<dyn NodeRecoveryHandler>,
        alerts: AlertBus,
        events: EventSink,
    ) -> Self {
        Self {
            interval,
            nodes: RwLock::new(Vec::new()),
            last_heartbeat: RwLock::new(HashMap::new()),
            flagged: RwLock::new(HashSet::new()),
            transport,
            recovery,
            alerts,
            events,
        }
    }

    /// Start watching a node. The registration time counts as its first heartbeat.
    pub fn add_node(&self, node_id: &str) {
        let mut nodes = self.nodes.write();
        if !nodes.iter().any(|n| n == node_id) {
            nodes.push(node_id.to_string());
            self.last_heartbeat.write().insert(node_id.to_string(), Instant::now());
        }
    }

    /// Launch one sender per node and the liveness monitor
    pub fn start(self: &Arc<Self>, supervisor: &Supervisor) {
        let nodes = self.nodes.read().clone();
        info!("Starting heartbeat service for {} nodes (interval {:?})", nodes.len(), self.interval);

        for node_id in nodes {
            let service = self.clone();
            supervisor.spawn(format!("heartbeat-sender-{}", node_id), move || {
                let service = service.clone();
                let node_id = node_id.clone();
                async move { service.run_sender(&node_id).await }
            });
        }

        let service = self.clone();
        supervisor.spawn("heartbeat-monitor", move || {
            let service = service.clone();
            async move { service.run_monitor().await }
        });
    }

    async fn run_sender(&self, node_id: &str) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let sent_at = Instant::now();
            match self.transport.send_heartbeat(node_id).await {
                Ok(()) => self.record_heartbeat_at(node_id, sent_at),
                Err(e) => debug!("Heartbeat to {} failed: {}", node_id, e),
            }
        }
    }

    async fn run_monitor(&self) {
        let period = (self.interval / MONITOR_RESOLUTION).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for node_id in self.check_liveness() {
                if let Err(e) = self.recovery.recover_node(&node_id).await {
                    error!("Recovery of unresponsive node {} failed: {}", node_id, e);
                }
            }
        }
    }

    /// Record a heartbeat received now
    pub fn record_heartbeat(&self, node_id: &str) {
        self.record_heartbeat_at(node_id, Instant::now());
    }

    fn record_heartbeat_at(&self, node_id: &str, at: Instant) {
        let mut last = self.last_heartbeat.write();
        match last.get_mut(node_id) {
            Some(ts) if *ts < at => *ts = at,
            Some(_) => {}
            None => {
                last.insert(node_id.to_string(), at);
            }
        }
    }

    /// `now - last <= 2 x interval`; unknown nodes are not responsive
    pub fn is_responsive(&self, node_id: &str) -> bool {
        self.last_heartbeat
            .read()
            .get(node_id)
            .map(|last| Instant::now().saturating_duration_since(*last) <= self.interval * 2)
            .unwrap_or(false)
    }

    /// Flag nodes that went silent; returns the nodes flagged by this call
    pub fn check_liveness(&self) -> Vec<String> {
        let now = Instant::now();
        let limit = self.interval * 2;
        let silent: Vec<(String, Duration)> = self
            .last_heartbeat
            .read()
            .iter()
            .map(|(id, last)| (id.clone(), now.saturating_duration_since(*last)))
            .collect();

        let mut newly_flagged = Vec::new();
        let mut flagged = self.flagged.write();
        for (node_id, elapsed) in silent {
            if elapsed > limit {
                if flagged.insert(node_id.clone()) {
                    warn!("Node {} missed heartbeats for {:?}", node_id, elapsed);
                    metrics::record_heartbeat_miss(&node_id);
                    self.alerts.raise(
                        AlertSeverity::Warning,
                        Some(&node_id),
                        format!("no heartbeat for {} ms", elapsed.as_millis()),
                    );
                    self.events.emit(MonitorEvent::Unresponsive {
                        node_id: node_id.clone(),
                        silent_for: elapsed,
                    });
                    newly_flagged.push(node_id);
                }
            } else if flagged.remove(&node_id) {
                info!("Node {} heartbeats resumed", node_id);
                self.events.emit(MonitorEvent::Responsive { node_id });
            }
        }
        newly_flagged.sort();
        newly_flagged
    }

    /// Nodes currently flagged unresponsive
    pub fn unresponsive_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<_> = self.flagged.read().iter().cloned().collect();
        nodes.sort();
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{HaResult, ProbeError};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct SilentTransport;

    #[async_trait]
    impl HeartbeatTransport for SilentTransport {
        async fn send_heartbeat(&self, node_id: &str) -> Result<(), ProbeError> {
            Err(ProbeError::Unreachable(node_id.to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingRecovery {
        recovered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NodeRecoveryHandler for RecordingRecovery {
        async fn recover_node(&self, node_id: &str) -> HaResult<()> {
            self.recovered.lock().push(node_id.to_string());
            Ok(())
        }
    }

    fn service(recovery: Arc<RecordingRecovery>) -> Arc<HeartbeatService> {
        Arc::new(HeartbeatService::new(
            Duration::from_secs(1),
            Arc::new(SilentTransport),
            recovery,
            AlertBus::default(),
            EventSink::disabled(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_flagged_only_after_twice_interval() {
        let svc = service(Arc::new(RecordingRecovery::default()));
        svc.add_node("a");

        tokio::time::advance(Duration::from_millis(1900)).await;
        assert!(svc.is_responsive("a"));
        assert!(svc.check_liveness().is_empty());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(svc.is_responsive("a"), "exactly 2x interval is still responsive");
        assert!(svc.check_liveness().is_empty());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(!svc.is_responsive("a"));
        assert_eq!(svc.check_liveness(), vec!["a".to_string()]);
        // Flagged once, not on every tick
        assert!(svc.check_liveness().is_empty());
        assert_eq!(svc.unresponsive_nodes(), vec!["a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_clears_flag() {
        let svc = service(Arc::new(RecordingRecovery::default()));
        svc.add_node("a");
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(svc.check_liveness().len(), 1);

        svc.record_heartbeat("a");
        assert!(svc.is_responsive("a"));
        assert!(svc.check_liveness().is_empty());
        assert!(svc.unresponsive_nodes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_invokes_recovery() {
        let recovery = Arc::new(RecordingRecovery::default());
        let svc = service(recovery.clone());
        svc.add_node("a");

        let supervisor = Supervisor::new(3, EventSink::disabled());
        svc.start(&supervisor);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(recovery.recovered.lock().clone(), vec!["a".to_string()]);
        supervisor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_flags_soon_after_deadline() {
        let svc = service(Arc::new(RecordingRecovery::default()));
        svc.add_node("a");

        let supervisor = Supervisor::new(3, EventSink::disabled());
        svc.start(&supervisor);

        tokio::time::sleep(Duration::from_millis(1950)).await;
        assert!(svc.unresponsive_nodes().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(svc.unresponsive_nodes(), vec!["a".to_string()]);
        supervisor.shutdown();
    }

    #[test]
    fn test_unknown_node_not_responsive() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
        rt.block_on(async {
            let svc = service(Arc::new(RecordingRecovery::default()));
            assert!(!svc.is_responsive("ghost"));
        });
    }
}
