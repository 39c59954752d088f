//! HTTPS health probe and heartbeat transport used in production

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::errors::ProbeError;
use crate::traits::{HealthProbe, HeartbeatTransport, ProbeSample};
use crate::types::NodeRegistry;

/// Body of `GET /api/health`
#[derive(Debug, Deserialize)]
struct HealthResponse {
    cpu_pct: f64,
    #[serde(default)]
    memory_pct: f64,
    #[serde(default)]
    disk_pct: f64,
    #[serde(default)]
    network_bytes: u64,
}

/// Body of `POST /api/heartbeat`
#[derive(Debug, Serialize)]
struct HeartbeatRequest<'a> {
    from: &'a str,
    sent_at: i64,
}

fn address(registry: &NodeRegistry, node_id: &str) -> Result<String, ProbeError> {
    registry
        .get(node_id)
        .map(|n| n.address)
        .ok_or_else(|| ProbeError::Unreachable(format!("unknown node {}", node_id)))
}

fn transport_error(e: reqwest::Error) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout
    } else {
        ProbeError::Unreachable(e.to_string())
    }
}

/// Probe that measures round-trip latency of `GET /api/health`
pub struct HttpHealthProbe {
    client: Client,
    registry: NodeRegistry,
}

impl HttpHealthProbe {
    pub fn new(client: Client, registry: NodeRegistry) -> Self {
        Self { client, registry }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, node_id: &str) -> Result<ProbeSample, ProbeError> {
        let url = format!("https://{}/api/health", address(&self.registry, node_id)?);
        let started = Instant::now();
        let response = self.client.get(&url).send().await.map_err(transport_error)?;
        let latency_ms = started.elapsed().as_millis() as u64;

        if !response.status().is_success() {
            return Err(ProbeError::InvalidResponse(format!("status {}", response.status())));
        }
        let body: HealthResponse = response
            .json()
            .await
            .map_err(|e| ProbeError::InvalidResponse(e.to_string()))?;

        Ok(ProbeSample {
            latency_ms,
            cpu_pct: body.cpu_pct,
            memory_pct: body.memory_pct,
            disk_pct: body.disk_pct,
            network_bytes: body.network_bytes,
        })
    }
}

/// Heartbeat sent as `POST /api/heartbeat`
pub struct HttpHeartbeat {
    client: Client,
    registry: NodeRegistry,
    local_node: String,
}

impl HttpHeartbeat {
    pub fn new(client: Client, registry: NodeRegistry, local_node: impl Into<String>) -> Self {
        Self {
            client,
            registry,
            local_node: local_node.into(),
        }
    }
}

#[async_trait]
impl HeartbeatTransport for HttpHeartbeat {
    async fn send_heartbeat(&self, node_id: &str) -> Result<(), ProbeError> {
        let url = format!("https://{}/api/heartbeat", address(&self.registry, node_id)?);
        let response = self
            .client
            .post(&url)
            .json(&HeartbeatRequest {
                from: &self.local_node,
                sent_at: Utc::now().timestamp(),
            })
            .send()
            .await
            .map_err(transport_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProbeError::InvalidResponse(format!("status {}", response.status())))
        }
    }
}
