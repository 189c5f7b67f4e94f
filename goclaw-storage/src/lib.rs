//! Storage layer for Goclaw.
//!
//! This crate defines the persistence contract the engine writes through at
//! every state transition, plus two reference backends: an in-memory store
//! for tests and ephemeral use, and an embedded key-value store (sled) with
//! prefix-scanned secondary indices. The saga write-ahead log lives behind
//! its own trait with the same two backends.

pub mod memory;
pub mod saga_wal;
pub mod sled_store;

pub use memory::MemoryStore;
pub use saga_wal::{MemoryWal, SagaWal, SagaWalEntry, SagaWalRecord, SledWal};
pub use sled_store::SledStore;

use async_trait::async_trait;
use goclaw_core::config::{GoclawConfig, StorageKind};
use goclaw_core::{Result, TaskState, WorkflowFilter, WorkflowState};
use std::sync::Arc;

/// Persistence contract for workflow and task state.
///
/// The engine considers a transition observable only after the matching
/// save has returned. All methods are upserts unless documented otherwise.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Upsert the full workflow record, including current task states.
    async fn save_workflow(&self, workflow: &WorkflowState) -> Result<()>;

    /// Fetch one workflow or `NotFound`.
    async fn get_workflow(&self, id: &str) -> Result<WorkflowState>;

    /// List workflows matching the filter. Pagination applies after status
    /// filtering; the returned total is the pre-pagination match count.
    async fn list_workflows(&self, filter: &WorkflowFilter) -> Result<(Vec<WorkflowState>, usize)>;

    /// Delete a workflow and cascade to its tasks. `NotFound` if absent.
    async fn delete_workflow(&self, id: &str) -> Result<()>;

    /// Upsert one task state. `NotFound` if the workflow does not exist.
    async fn save_task(&self, workflow_id: &str, task: &TaskState) -> Result<()>;

    /// Fetch one task state or `NotFound`.
    async fn get_task(&self, workflow_id: &str, task_id: &str) -> Result<TaskState>;

    /// All task states of a workflow. `NotFound` if the workflow is absent.
    async fn list_tasks(&self, workflow_id: &str) -> Result<Vec<TaskState>>;

    /// Flush and release backend resources. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Build the configured backend pair: workflow store plus saga WAL.
///
/// Both ride on the same sled database when the embedded backend is
/// selected, so the engine only ever opens one database directory.
pub fn open_storage(config: &GoclawConfig) -> Result<(Arc<dyn WorkflowStore>, Arc<dyn SagaWal>)> {
    match config.storage.kind {
        StorageKind::Memory => Ok((Arc::new(MemoryStore::new()), Arc::new(MemoryWal::new()))),
        StorageKind::EmbeddedKv => {
            let store = SledStore::open(&config.storage)?;
            let wal = SledWal::on(store.db().clone(), config.storage.sync_writes)?;
            Ok((Arc::new(store), Arc::new(wal)))
        }
    }
}
