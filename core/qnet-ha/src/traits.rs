//! Capabilities injected into the HA managers
//!
//! Production wiring and test doubles implement the same traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{HaResult, ProbeError};

/// One health sample taken from a node
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProbeSample {
    pub latency_ms: u64,
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub disk_pct: f64,
    pub network_bytes: u64,
}

impl ProbeSample {
    pub fn new(latency_ms: u64, cpu_pct: f64) -> Self {
        Self {
            latency_ms,
            cpu_pct,
            ..Self::default()
        }
    }
}

/// Deep health probe
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, node_id: &str) -> Result<ProbeSample, ProbeError>;
}

/// Liveness signal sender
#[async_trait]
pub trait HeartbeatTransport: Send + Sync {
    async fn send_heartbeat(&self, node_id: &str) -> Result<(), ProbeError>;
}

/// Action run when a node must be recovered
#[async_trait]
pub trait NodeRecoveryHandler: Send + Sync {
    async fn recover_node(&self, node_id: &str) -> HaResult<()>;
}

/// Read-only view of node health
pub trait HealthView: Send + Sync {
    fn is_healthy(&self, node_id: &str) -> bool;
}

/// Recovery handler that does nothing beyond logging
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecovery;

#[async_trait]
impl NodeRecoveryHandler for NoopRecovery {
    async fn recover_node(&self, node_id: &str) -> HaResult<()> {
        tracing::debug!("No recovery action configured for {}", node_id);
        Ok(())
    }
}
