//! Write-ahead log for saga state transitions.
//!
//! Every saga transition appends one ordered record; recovery replays the
//! records to reconstruct the step-completion set and the state at crash.
//! Records for terminal sagas are pruned by the orchestrator's retention
//! sweep.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use goclaw_core::{GoclawError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

/// One WAL entry. State names are plain strings so the log format does not
/// depend on the orchestrator's state enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SagaWalEntry {
    Created {
        name: String,
        step_ids: Vec<String>,
    },
    StateChanged {
        old_state: String,
        new_state: String,
    },
    StepCompleted {
        step_id: String,
        result: serde_json::Value,
    },
    StepFailed {
        step_id: String,
        error: String,
    },
    StepCompensated {
        step_id: String,
        idempotency_key: Option<String>,
    },
    CompensationFailed {
        step_id: String,
        error: String,
    },
    /// Snapshot of the completed-step set, written after each step
    Checkpoint {
        completed_steps: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaWalRecord {
    pub saga_id: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub entry: SagaWalEntry,
}

/// Ordered append-only log contract, keyed by saga ID.
#[async_trait]
pub trait SagaWal: Send + Sync {
    /// Append a record; returns the assigned per-saga sequence number.
    async fn append(&self, saga_id: &str, entry: SagaWalEntry) -> Result<u64>;

    /// All records of one saga in append order. Empty if unknown.
    async fn replay(&self, saga_id: &str) -> Result<Vec<SagaWalRecord>>;

    /// IDs of every saga with at least one record.
    async fn list_sagas(&self) -> Result<Vec<String>>;

    /// Remove all records of one saga.
    async fn prune(&self, saga_id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory WAL
// ---------------------------------------------------------------------------

pub struct MemoryWal {
    records: RwLock<HashMap<String, Vec<SagaWalRecord>>>,
}

impl MemoryWal {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryWal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SagaWal for MemoryWal {
    async fn append(&self, saga_id: &str, entry: SagaWalEntry) -> Result<u64> {
        let mut w = self.records.write().await;
        let records = w.entry(saga_id.to_string()).or_default();
        let seq = records.len() as u64;
        records.push(SagaWalRecord {
            saga_id: saga_id.to_string(),
            seq,
            timestamp: Utc::now(),
            entry,
        });
        Ok(seq)
    }

    async fn replay(&self, saga_id: &str) -> Result<Vec<SagaWalRecord>> {
        let r = self.records.read().await;
        Ok(r.get(saga_id).cloned().unwrap_or_default())
    }

    async fn list_sagas(&self) -> Result<Vec<String>> {
        let r = self.records.read().await;
        let mut ids: Vec<String> = r.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn prune(&self, saga_id: &str) -> Result<()> {
        let mut w = self.records.write().await;
        w.remove(saga_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sled-backed WAL
// ---------------------------------------------------------------------------

/// WAL on a dedicated sled tree, keys `saga:<id>:wal:<seq>` with the
/// sequence zero-padded so prefix scans yield append order.
pub struct SledWal {
    tree: sled::Tree,
    sync_writes: bool,
}

fn wal_key(saga_id: &str, seq: u64) -> String {
    format!("saga:{saga_id}:wal:{seq:020}")
}

fn wal_prefix(saga_id: &str) -> String {
    format!("saga:{saga_id}:wal:")
}

fn store_err(err: sled::Error) -> GoclawError {
    GoclawError::storage(err.to_string())
}

impl SledWal {
    pub fn on(db: sled::Db, sync_writes: bool) -> Result<Self> {
        let tree = db.open_tree("saga_wal").map_err(store_err)?;
        Ok(Self { tree, sync_writes })
    }

    fn next_seq(&self, saga_id: &str) -> Result<u64> {
        let last = self
            .tree
            .scan_prefix(wal_prefix(saga_id))
            .last()
            .transpose()
            .map_err(store_err)?;
        match last {
            Some((_, value)) => {
                let record: SagaWalRecord =
                    serde_json::from_slice(&value).map_err(|e| GoclawError::serialization(e.to_string()))?;
                Ok(record.seq + 1)
            }
            None => Ok(0),
        }
    }
}

#[async_trait]
impl SagaWal for SledWal {
    async fn append(&self, saga_id: &str, entry: SagaWalEntry) -> Result<u64> {
        let seq = self.next_seq(saga_id)?;
        let record = SagaWalRecord {
            saga_id: saga_id.to_string(),
            seq,
            timestamp: Utc::now(),
            entry,
        };
        let bytes = serde_json::to_vec(&record)?;
        self.tree
            .insert(wal_key(saga_id, seq).as_bytes(), bytes)
            .map_err(store_err)?;
        if self.sync_writes {
            self.tree.flush_async().await.map_err(store_err)?;
        }
        Ok(seq)
    }

    async fn replay(&self, saga_id: &str) -> Result<Vec<SagaWalRecord>> {
        let mut records = Vec::new();
        for entry in self.tree.scan_prefix(wal_prefix(saga_id)) {
            let (_, value) = entry.map_err(store_err)?;
            records.push(
                serde_json::from_slice(&value)
                    .map_err(|e| GoclawError::serialization(e.to_string()))?,
            );
        }
        Ok(records)
    }

    async fn list_sagas(&self) -> Result<Vec<String>> {
        let mut ids = BTreeSet::new();
        for entry in self.tree.iter() {
            let (key, _) = entry.map_err(store_err)?;
            let key = String::from_utf8_lossy(&key);
            if let Some(rest) = key.strip_prefix("saga:") {
                if let Some((id, _)) = rest.rsplit_once(":wal:") {
                    ids.insert(id.to_string());
                }
            }
        }
        Ok(ids.into_iter().collect())
    }

    async fn prune(&self, saga_id: &str) -> Result<()> {
        let keys: Vec<sled::IVec> = self
            .tree
            .scan_prefix(wal_prefix(saga_id))
            .map(|entry| entry.map(|(k, _)| k).map_err(store_err))
            .collect::<Result<_>>()?;
        for key in keys {
            self.tree.remove(key).map_err(store_err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_wal_append_order() {
        let wal = MemoryWal::new();
        wal.append(
            "s1",
            SagaWalEntry::Created {
                name: "order".into(),
                step_ids: vec!["a".into(), "b".into()],
            },
        )
        .await
        .unwrap();
        wal.append(
            "s1",
            SagaWalEntry::StepCompleted {
                step_id: "a".into(),
                result: serde_json::json!(1),
            },
        )
        .await
        .unwrap();

        let records = wal.replay("s1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].seq, 0);
        assert_eq!(records[1].seq, 1);
        assert!(matches!(records[1].entry, SagaWalEntry::StepCompleted { .. }));
    }

    #[tokio::test]
    async fn test_sled_wal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::Config::new().path(dir.path()).open().unwrap();
        {
            let wal = SledWal::on(db.clone(), false).unwrap();
            wal.append(
                "s1",
                SagaWalEntry::StateChanged {
                    old_state: "created".into(),
                    new_state: "running".into(),
                },
            )
            .await
            .unwrap();
            wal.append(
                "s1",
                SagaWalEntry::StepCompleted {
                    step_id: "a".into(),
                    result: serde_json::Value::Null,
                },
            )
            .await
            .unwrap();
        }
        let wal = SledWal::on(db, false).unwrap();
        let records = wal.replay("s1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(wal.list_sagas().await.unwrap(), vec!["s1".to_string()]);

        wal.prune("s1").await.unwrap();
        assert!(wal.replay("s1").await.unwrap().is_empty());
        assert!(wal.list_sagas().await.unwrap().is_empty());
    }
}
