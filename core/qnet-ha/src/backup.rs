//! Ledger backups
//!
//! One file per backup under the configured directory, named after the
//! source node and creation time. `manifest.json` records every
//! [`BackupRecord`] so a restarted node can find its backups again. Files are
//! written to a temporary name and renamed into place.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use qnet_ledger::{LedgerState, LedgerStore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::BackupConfig;
use crate::errors::{HaError, HaResult};
use crate::metrics;
use crate::monitoring::Supervisor;

const MANIFEST_FILE: &str = "manifest.json";

/// Metadata of one stored backup; immutable once written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub backup_id: String,
    pub created_at: DateTime<Utc>,
    /// Size of the stored file
    pub size_bytes: u64,
    /// Hex SHA-256 of the stored file
    pub integrity_hash: String,
    pub is_compressed: bool,
    pub source_node_id: String,
    /// Chain height captured, if the ledger had blocks
    pub height: Option<u64>,
}

impl BackupRecord {
    fn file_name(&self) -> String {
        if self.is_compressed {
            format!("{}.bin.lz4", self.backup_id)
        } else {
            format!("{}.bin", self.backup_id)
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    backups: Vec<BackupRecord>,
}

/// Periodic snapshots of the full ledger state
pub struct DataBackupManager {
    node_id: String,
    config: BackupConfig,
    ledger: Arc<dyn LedgerStore>,
    records: Mutex<Vec<BackupRecord>>,
}

impl DataBackupManager {
    pub fn new(node_id: impl Into<String>, config: BackupConfig, ledger: Arc<dyn LedgerStore>) -> Self {
        Self {
            node_id: node_id.into(),
            config,
            ledger,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    fn path_of(&self, file_name: &str) -> PathBuf {
        self.config.directory.join(file_name)
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> HaResult<T>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        match tokio::time::timeout(self.config.io_timeout(), fut).await {
            Ok(result) => result.map_err(HaError::from),
            Err(_) => Err(HaError::Timeout(format!("backup {}", what))),
        }
    }

    async fn write_atomic(&self, file_name: &str, data: &[u8]) -> HaResult<()> {
        let path = self.path_of(file_name);
        let tmp = self.path_of(&format!(".{}.tmp", file_name));
        self.bounded("write", tokio::fs::write(&tmp, data)).await?;
        self.bounded("rename", tokio::fs::rename(&tmp, &path)).await
    }

    async fn persist_manifest(&self, records: &[BackupRecord]) -> HaResult<()> {
        let manifest = Manifest {
            backups: records.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&manifest)?;
        self.write_atomic(MANIFEST_FILE, &json).await
    }

    /// Load records persisted by a previous run; returns how many were found
    pub async fn load_manifest(&self) -> HaResult<usize> {
        let path = self.path_of(MANIFEST_FILE);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!("No backup manifest at {}", path.display());
            return Ok(0);
        }
        let bytes = self.bounded("manifest read", tokio::fs::read(&path)).await?;
        let manifest: Manifest = serde_json::from_slice(&bytes)?;
        let count = manifest.backups.len();
        *self.records.lock().await = manifest.backups;
        info!("Loaded {} backup records from {}", count, path.display());
        Ok(count)
    }

    /// Serialize the full ledger state to a new backup file
    pub async fn create_backup(&self) -> HaResult<BackupRecord> {
        let result = self.write_backup().await;
        metrics::record_backup_op("create", result.is_ok());
        if let Err(e) = &result {
            error!("Backup failed: {}", e);
        }
        result
    }

    async fn write_backup(&self) -> HaResult<BackupRecord> {
        let state = self.ledger.snapshot();
        let encoded = state.encode()?;
        let stored = if self.config.compress {
            lz4_flex::compress_prepend_size(&encoded)
        } else {
            encoded
        };
        let integrity_hash = hex::encode(Sha256::digest(&stored));

        let mut records = self.records.lock().await;
        let created_at = Utc::now();
        let base_id = format!("{}-{}", self.node_id, created_at.format("%Y%m%dT%H%M%S%.6fZ"));
        let mut backup_id = base_id.clone();
        let mut suffix = 1;
        while records.iter().any(|r| r.backup_id == backup_id) {
            backup_id = format!("{}-{}", base_id, suffix);
            suffix += 1;
        }

        let record = BackupRecord {
            backup_id,
            created_at,
            size_bytes: stored.len() as u64,
            integrity_hash,
            is_compressed: self.config.compress,
            source_node_id: self.node_id.clone(),
            height: state.height(),
        };

        self.bounded("mkdir", tokio::fs::create_dir_all(&self.config.directory)).await?;
        self.write_atomic(&record.file_name(), &stored).await?;
        records.push(record.clone());
        self.persist_manifest(&records).await?;

        info!(
            "Backup {} written: {} bytes{} at height {:?}",
            record.backup_id,
            record.size_bytes,
            if record.is_compressed { " (lz4)" } else { "" },
            record.height
        );
        Ok(record)
    }

    /// Back up every `interval` and prune past the retention window
    pub fn start_auto_backup(self: &Arc<Self>, supervisor: &Supervisor, interval: Duration) {
        let manager = self.clone();
        info!("Starting auto-backup every {:?}", interval);
        supervisor.spawn("auto-backup", move || {
            let manager = manager.clone();
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // First tick completes immediately
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if manager.create_backup().await.is_ok() {
                        if let Err(e) = manager.remove_old_backups(manager.config.retention()).await {
                            warn!("Backup pruning failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Verify and decode a backup without touching the ledger
    pub async fn read_backup(&self, backup_id: &str) -> HaResult<LedgerState> {
        let record = self
            .records
            .lock()
            .await
            .iter()
            .find(|r| r.backup_id == backup_id)
            .cloned()
            .ok_or_else(|| HaError::BackupNotFound(backup_id.to_string()))?;

        let stored = self
            .bounded("read", tokio::fs::read(self.path_of(&record.file_name())))
            .await?;
        if hex::encode(Sha256::digest(&stored)) != record.integrity_hash {
            return Err(HaError::CorruptBackup(backup_id.to_string()));
        }
        let encoded = if record.is_compressed {
            lz4_flex::decompress_size_prepended(&stored)
                .map_err(|_| HaError::CorruptBackup(backup_id.to_string()))?
        } else {
            stored
        };
        LedgerState::decode(&encoded).map_err(|_| HaError::CorruptBackup(backup_id.to_string()))
    }

    /// Replace the in-memory ledger with a backup.
    /// Callers must keep writers away from the ledger meanwhile.
    pub async fn restore_ledger(&self, backup_id: &str) -> HaResult<()> {
        let result = self.read_backup(backup_id).await;
        metrics::record_backup_op("restore", result.is_ok());
        let state = result?;
        info!(
            "Restoring ledger from {} ({} blocks)",
            backup_id,
            state.blocks.len()
        );
        self.ledger.restore(state);
        Ok(())
    }

    /// Delete backups older than `retention`; returns how many were removed
    pub async fn remove_old_backups(&self, retention: Duration) -> HaResult<usize> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| HaError::Config(format!("invalid retention: {}", e)))?;
        let cutoff = Utc::now() - retention;

        let mut records = self.records.lock().await;
        let (expired, kept): (Vec<BackupRecord>, Vec<BackupRecord>) =
            records.drain(..).partition(|r| r.created_at < cutoff);
        *records = kept;
        if expired.is_empty() {
            return Ok(0);
        }

        for record in &expired {
            match self.bounded("remove", tokio::fs::remove_file(self.path_of(&record.file_name()))).await {
                Ok(()) => debug!("Removed backup {}", record.backup_id),
                Err(HaError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!("Backup file for {} already gone", record.backup_id)
                }
                Err(e) => warn!("Failed to remove backup {}: {}", record.backup_id, e),
            }
        }
        self.persist_manifest(&records).await?;
        metrics::record_backup_op("prune", true);
        info!("Pruned {} backups older than {}", expired.len(), cutoff);
        Ok(expired.len())
    }

    /// Most recent backup taken from `node_id`
    pub async fn retrieve_latest_backup(&self, node_id: &str) -> HaResult<BackupRecord> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| r.source_node_id == node_id)
            .max_by_key(|r| r.created_at)
            .cloned()
            .ok_or_else(|| HaError::BackupNotFound(format!("no backups for {}", node_id)))
    }

    /// Every known backup, oldest first
    pub async fn list_backups(&self) -> Vec<BackupRecord> {
        let mut records = self.records.lock().await.clone();
        records.sort_by_key(|r| r.created_at);
        records
    }
}
