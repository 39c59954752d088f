//! Shared node and alert types

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Primary,
    Backup,
    Replica,
}

/// Cluster member identity. Only the role ever changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeRecord {
    /// Stable node identifier
    pub node_id: String,
    /// `host:port` used for HTTPS endpoints
    pub address: String,
    /// Encoded public key
    pub public_key: Vec<u8>,
    /// Current role
    pub role: NodeRole,
    /// Participates in validation
    pub is_validator: bool,
}

impl NodeRecord {
    pub fn new(node_id: impl Into<String>, address: impl Into<String>, role: NodeRole) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
            public_key: Vec::new(),
            role,
            is_validator: false,
        }
    }
}

/// Registry of known nodes, shared by every manager that needs addresses or roles
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<HashMap<String, NodeRecord>>>,
    order: Arc<RwLock<Vec<String>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a node; registration order is preserved
    pub fn upsert(&self, record: NodeRecord) {
        let mut nodes = self.nodes.write();
        if !nodes.contains_key(&record.node_id) {
            self.order.write().push(record.node_id.clone());
        }
        nodes.insert(record.node_id.clone(), record);
    }

    pub fn get(&self, node_id: &str) -> Option<NodeRecord> {
        self.nodes.read().get(node_id).cloned()
    }

    /// All nodes in registration order
    pub fn all(&self) -> Vec<NodeRecord> {
        let nodes = self.nodes.read();
        self.order
            .read()
            .iter()
            .filter_map(|id| nodes.get(id).cloned())
            .collect()
    }

    pub fn remove(&self, node_id: &str) -> Option<NodeRecord> {
        let removed = self.nodes.write().remove(node_id);
        if removed.is_some() {
            self.order.write().retain(|id| id != node_id);
        }
        removed
    }

    /// Change a node's role; returns false for unknown nodes
    pub fn set_role(&self, node_id: &str, role: NodeRole) -> bool {
        match self.nodes.write().get_mut(node_id) {
            Some(record) => {
                record.role = role;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Advisory alert raised by a monitoring component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub node_id: Option<String>,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Broadcast bus for alerts. Raising never fails, even with no subscribers.
#[derive(Debug, Clone)]
pub struct AlertBus {
    tx: broadcast::Sender<Alert>,
}

impl AlertBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }

    /// Log and publish an alert
    pub fn raise(&self, severity: AlertSeverity, node_id: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        let node = node_id.unwrap_or("-");
        match severity {
            AlertSeverity::Info => info!("[ALERT] {}: {}", node, message),
            AlertSeverity::Warning => warn!("[ALERT] {}: {}", node, message),
            AlertSeverity::Critical => error!("[ALERT] CRITICAL {}: {}", node, message),
        }
        let _ = self.tx.send(Alert {
            severity,
            node_id: node_id.map(str::to_string),
            message,
            raised_at: Utc::now(),
        });
    }
}

impl Default for AlertBus {
    fn default() -> Self {
        Self::new(256)
    }
}
