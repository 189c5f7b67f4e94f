//! Embedded key-value implementation of `WorkflowStore` on sled.
//!
//! Key scheme:
//!
//! ```text
//! workflow:<id>                                  -> WorkflowState (JSON)
//! workflow:<id>:task:<taskID>                    -> TaskState (JSON)
//! workflow:index:status:<status>:<id>            -> (empty)
//! workflow:index:created:<unixTs>:<id>           -> (empty)
//! ```
//!
//! Scans use prefix iteration. The created-at index key zero-pads the
//! timestamp so lexicographic order equals chronological order.

use crate::WorkflowStore;
use async_trait::async_trait;
use goclaw_core::config::StorageConfig;
use goclaw_core::{GoclawError, Result, TaskState, WorkflowFilter, WorkflowState, WorkflowStatus};
use tracing::debug;

pub struct SledStore {
    db: sled::Db,
    sync_writes: bool,
}

fn workflow_key(id: &str) -> String {
    format!("workflow:{id}")
}

fn task_key(workflow_id: &str, task_id: &str) -> String {
    format!("workflow:{workflow_id}:task:{task_id}")
}

fn task_prefix(workflow_id: &str) -> String {
    format!("workflow:{workflow_id}:task:")
}

fn status_index_key(status: WorkflowStatus, id: &str) -> String {
    format!("workflow:index:status:{status}:{id}")
}

fn created_index_key(unix_ts: i64, id: &str) -> String {
    format!("workflow:index:created:{unix_ts:020}:{id}")
}

const CREATED_INDEX_PREFIX: &str = "workflow:index:created:";

fn store_err(err: sled::Error) -> GoclawError {
    GoclawError::storage(err.to_string())
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| GoclawError::serialization(e.to_string()))
}

impl SledStore {
    /// Open (or create) the database at the configured path.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        // sled has no separate value log; the size knob bounds its page cache.
        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.value_log_file_size)
            .open()
            .map_err(store_err)?;
        debug!(path = %config.path.display(), sync_writes = config.sync_writes, "opened sled store");
        Ok(Self {
            db,
            sync_writes: config.sync_writes,
        })
    }

    /// The underlying database, shared with the saga WAL.
    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    async fn maybe_flush(&self) -> Result<()> {
        if self.sync_writes {
            self.db.flush_async().await.map_err(store_err)?;
        }
        Ok(())
    }

    fn load_workflow(&self, id: &str) -> Result<WorkflowState> {
        let bytes = self
            .db
            .get(workflow_key(id))
            .map_err(store_err)?
            .ok_or_else(|| GoclawError::not_found("workflow", id))?;
        let mut workflow: WorkflowState = decode(&bytes)?;
        // Task keys are written on every transition; overlay them so the
        // record reflects saves made after the last full workflow write.
        for entry in self.db.scan_prefix(task_prefix(id)) {
            let (_, value) = entry.map_err(store_err)?;
            let task: TaskState = decode(&value)?;
            workflow.task_status.insert(task.id.clone(), task);
        }
        Ok(workflow)
    }
}

#[async_trait]
impl WorkflowStore for SledStore {
    async fn save_workflow(&self, workflow: &WorkflowState) -> Result<()> {
        let key = workflow_key(&workflow.id);
        let old_status = match self.db.get(&key).map_err(store_err)? {
            Some(bytes) => Some(decode::<WorkflowState>(&bytes)?.status),
            None => None,
        };

        let bytes = serde_json::to_vec(workflow)?;
        self.db.insert(key.as_bytes(), bytes).map_err(store_err)?;

        for task in workflow.task_status.values() {
            let bytes = serde_json::to_vec(task)?;
            self.db
                .insert(task_key(&workflow.id, &task.id).as_bytes(), bytes)
                .map_err(store_err)?;
        }

        match old_status {
            Some(old) if old != workflow.status => {
                self.db
                    .remove(status_index_key(old, &workflow.id).as_bytes())
                    .map_err(store_err)?;
            }
            None => {
                let ts = workflow.created_at.timestamp();
                self.db
                    .insert(created_index_key(ts, &workflow.id).as_bytes(), &[][..])
                    .map_err(store_err)?;
            }
            _ => {}
        }
        self.db
            .insert(
                status_index_key(workflow.status, &workflow.id).as_bytes(),
                &[][..],
            )
            .map_err(store_err)?;

        self.maybe_flush().await
    }

    async fn get_workflow(&self, id: &str) -> Result<WorkflowState> {
        self.load_workflow(id)
    }

    async fn list_workflows(&self, filter: &WorkflowFilter) -> Result<(Vec<WorkflowState>, usize)> {
        let mut matched = Vec::new();
        for entry in self.db.scan_prefix(CREATED_INDEX_PREFIX) {
            let (key, _) = entry.map_err(store_err)?;
            let key = String::from_utf8_lossy(&key);
            let id = match key
                .strip_prefix(CREATED_INDEX_PREFIX)
                .and_then(|rest| rest.split_once(':'))
            {
                Some((_, id)) => id.to_string(),
                None => continue,
            };
            match self.load_workflow(&id) {
                Ok(workflow) if filter.matches(workflow.status) => matched.push(workflow),
                Ok(_) => {}
                // A dangling index entry is not a listing failure.
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        let total = matched.len();
        let page = matched
            .into_iter()
            .skip(filter.offset)
            .take(filter.effective_limit())
            .collect();
        Ok((page, total))
    }

    async fn delete_workflow(&self, id: &str) -> Result<()> {
        let workflow = self.load_workflow(id)?;

        let task_keys: Vec<sled::IVec> = self
            .db
            .scan_prefix(task_prefix(id))
            .map(|entry| entry.map(|(k, _)| k).map_err(store_err))
            .collect::<Result<_>>()?;
        for key in task_keys {
            self.db.remove(key).map_err(store_err)?;
        }

        self.db
            .remove(status_index_key(workflow.status, id).as_bytes())
            .map_err(store_err)?;
        self.db
            .remove(created_index_key(workflow.created_at.timestamp(), id).as_bytes())
            .map_err(store_err)?;
        self.db.remove(workflow_key(id).as_bytes()).map_err(store_err)?;

        self.maybe_flush().await
    }

    async fn save_task(&self, workflow_id: &str, task: &TaskState) -> Result<()> {
        if self
            .db
            .get(workflow_key(workflow_id))
            .map_err(store_err)?
            .is_none()
        {
            return Err(GoclawError::not_found("workflow", workflow_id));
        }
        let bytes = serde_json::to_vec(task)?;
        self.db
            .insert(task_key(workflow_id, &task.id).as_bytes(), bytes)
            .map_err(store_err)?;
        self.maybe_flush().await
    }

    async fn get_task(&self, workflow_id: &str, task_id: &str) -> Result<TaskState> {
        let bytes = self
            .db
            .get(task_key(workflow_id, task_id))
            .map_err(store_err)?
            .ok_or_else(|| GoclawError::not_found("task", task_id))?;
        decode(&bytes)
    }

    async fn list_tasks(&self, workflow_id: &str) -> Result<Vec<TaskState>> {
        if self
            .db
            .get(workflow_key(workflow_id))
            .map_err(store_err)?
            .is_none()
        {
            return Err(GoclawError::not_found("workflow", workflow_id));
        }
        let mut tasks = Vec::new();
        for entry in self.db.scan_prefix(task_prefix(workflow_id)) {
            let (_, value) = entry.map_err(store_err)?;
            tasks.push(decode::<TaskState>(&value)?);
        }
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn close(&self) -> Result<()> {
        self.db.flush_async().await.map_err(store_err)?;
        Ok(())
    }
}
