//! Replication transports
//!
//! A transport delivers one chunked payload to a target and returns the
//! target's SHA-256 (hex) of the bytes it reconstructed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::{Body, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::cipher::{PayloadCipher, PlainPayload};
use super::codec::{chunk_payload, decode_unit, digest, DataUnit, DataUnitId, Endpoint};
use crate::errors::TransferError;
use crate::types::NodeRegistry;

/// One payload delivery to `target`. The bytes always leave the local node;
/// `source` names the replica the copy is attributed to.
#[derive(Debug, Clone)]
pub struct TransferRequest<'a> {
    pub unit: &'a DataUnitId,
    pub source: &'a str,
    pub target: &'a str,
    pub endpoint: Endpoint,
    /// Encoded unit, encrypted if a payload cipher is configured
    pub payload: Bytes,
    pub chunk_size: usize,
}

#[async_trait]
pub trait ReplicationTransport: Send + Sync {
    async fn transfer(&self, request: TransferRequest<'_>) -> Result<String, TransferError>;
}

/// Acknowledgement body returned by the target
#[derive(Debug, Serialize, Deserialize)]
pub struct TransferAck {
    /// Hex SHA-256 of the reconstructed plaintext
    pub digest: String,
}

/// Streams chunks over mutually authenticated HTTPS
pub struct HttpsTransport {
    client: Client,
    registry: NodeRegistry,
}

impl HttpsTransport {
    pub fn new(client: Client, registry: NodeRegistry) -> Self {
        Self { client, registry }
    }
}

#[async_trait]
impl ReplicationTransport for HttpsTransport {
    async fn transfer(&self, request: TransferRequest<'_>) -> Result<String, TransferError> {
        let address = self
            .registry
            .get(request.target)
            .map(|n| n.address)
            .ok_or_else(|| TransferError::Transport(format!("unknown node {}", request.target)))?;
        let url = format!("https://{}{}", address, request.endpoint.path());

        let chunks = chunk_payload(&request.payload, request.chunk_size);
        debug!(
            "Streaming {} ({} bytes, {} chunks) to {}",
            request.unit,
            request.payload.len(),
            chunks.len(),
            url
        );
        let stream = futures::stream::iter(chunks.into_iter().map(Ok::<Bytes, std::io::Error>));

        let response = self
            .client
            .post(&url)
            .header("X-QNet-Source", request.source)
            .header("X-QNet-Unit", request.unit.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::wrap_stream(stream))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransferError::Timeout(0)
                } else {
                    TransferError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(TransferError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let ack: TransferAck = response
            .json()
            .await
            .map_err(|e| TransferError::MalformedAck(e.to_string()))?;
        Ok(ack.digest)
    }
}

#[derive(Default)]
struct LoopbackInner {
    /// node -> digest -> reconstructed plaintext
    stores: HashMap<String, HashMap<String, Vec<u8>>>,
    down: HashSet<String>,
    corrupt: HashSet<String>,
    transient_failures: HashMap<String, u32>,
    rejections: HashMap<String, (u16, String)>,
    delays: HashMap<String, Duration>,
    contacts: HashMap<String, u32>,
    /// target -> source of the last accepted transfer
    sources: HashMap<String, String>,
}

/// In-process transport for single-host clusters and tests.
///
/// Each node gets its own store of reconstructed payloads. Outages,
/// transient failures, slow links and in-transit corruption can be injected
/// per node.
pub struct LoopbackTransport {
    inner: Mutex<LoopbackInner>,
    cipher: Arc<dyn PayloadCipher>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::with_cipher(Arc::new(PlainPayload))
    }

    /// Loopback whose targets decrypt with `cipher`
    pub fn with_cipher(cipher: Arc<dyn PayloadCipher>) -> Self {
        Self {
            inner: Mutex::new(LoopbackInner::default()),
            cipher,
        }
    }

    /// Take a node offline or bring it back
    pub fn set_down(&self, node_id: &str, down: bool) {
        let mut inner = self.inner.lock();
        if down {
            inner.down.insert(node_id.to_string());
        } else {
            inner.down.remove(node_id);
        }
    }

    /// Flip one byte of every payload sent to `node_id`
    pub fn set_corrupt(&self, node_id: &str, corrupt: bool) {
        let mut inner = self.inner.lock();
        if corrupt {
            inner.corrupt.insert(node_id.to_string());
        } else {
            inner.corrupt.remove(node_id);
        }
    }

    /// Fail the next `count` transfers to `node_id` with a transport error
    pub fn fail_next(&self, node_id: &str, count: u32) {
        self.inner.lock().transient_failures.insert(node_id.to_string(), count);
    }

    /// Answer every transfer to `node_id` with a non-200 status
    pub fn set_reject(&self, node_id: &str, rejection: Option<(u16, &str)>) {
        let mut inner = self.inner.lock();
        match rejection {
            Some((status, body)) => {
                inner.rejections.insert(node_id.to_string(), (status, body.to_string()));
            }
            None => {
                inner.rejections.remove(node_id);
            }
        }
    }

    /// Delay every transfer to `node_id`
    pub fn set_delay(&self, node_id: &str, delay: Duration) {
        self.inner.lock().delays.insert(node_id.to_string(), delay);
    }

    /// Transfer attempts addressed to `node_id`
    pub fn contacts(&self, node_id: &str) -> u32 {
        self.inner.lock().contacts.get(node_id).copied().unwrap_or(0)
    }

    /// Source named by the last transfer `node_id` accepted
    pub fn last_source(&self, node_id: &str) -> Option<String> {
        self.inner.lock().sources.get(node_id).cloned()
    }

    /// True if `node_id` holds a payload with this digest
    pub fn holds(&self, node_id: &str, digest_hex: &str) -> bool {
        self.inner
            .lock()
            .stores
            .get(node_id)
            .map(|s| s.contains_key(digest_hex))
            .unwrap_or(false)
    }

    /// Decodable units stored on `node_id`
    pub fn stored_units(&self, node_id: &str) -> Vec<DataUnit> {
        self.inner
            .lock()
            .stores
            .get(node_id)
            .map(|s| s.values().filter_map(|b| decode_unit(b).ok()).collect())
            .unwrap_or_default()
    }

    /// Drop everything a node holds, as after a disk loss
    pub fn wipe(&self, node_id: &str) {
        self.inner.lock().stores.remove(node_id);
    }
}

#[async_trait]
impl ReplicationTransport for LoopbackTransport {
    async fn transfer(&self, request: TransferRequest<'_>) -> Result<String, TransferError> {
        let (corrupt, delay) = {
            let mut inner = self.inner.lock();
            *inner.contacts.entry(request.target.to_string()).or_insert(0) += 1;

            if inner.down.contains(request.target) {
                return Err(TransferError::Transport(format!("{} is unreachable", request.target)));
            }
            if inner.down.contains(request.source) {
                return Err(TransferError::Transport(format!("source {} is unreachable", request.source)));
            }
            if let Some((status, body)) = inner.rejections.get(request.target) {
                return Err(TransferError::Rejected {
                    status: *status,
                    body: body.clone(),
                });
            }
            if let Some(remaining) = inner.transient_failures.get_mut(request.target) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransferError::Transport("connection reset".into()));
                }
            }
            (
                inner.corrupt.contains(request.target),
                inner.delays.get(request.target).copied(),
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut received = Vec::with_capacity(request.payload.len());
        for chunk in chunk_payload(&request.payload, request.chunk_size) {
            received.extend_from_slice(&chunk);
        }
        if corrupt && !received.is_empty() {
            let mid = received.len() / 2;
            received[mid] ^= 0xff;
        }

        let plaintext = self.cipher.decrypt(&received).map_err(|e| TransferError::Rejected {
            status: 400,
            body: e.to_string(),
        })?;
        let digest_hex = hex::encode(digest(&plaintext));
        let mut inner = self.inner.lock();
        inner
            .stores
            .entry(request.target.to_string())
            .or_default()
            .insert(digest_hex.clone(), plaintext);
        inner.sources.insert(request.target.to_string(), request.source.to_string());
        Ok(digest_hex)
    }
}
