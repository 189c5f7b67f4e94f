//! In-memory implementation of `WorkflowStore` for tests and ephemeral use.

use crate::WorkflowStore;
use async_trait::async_trait;
use goclaw_core::{GoclawError, Result, TaskState, WorkflowFilter, WorkflowState};
use std::collections::HashMap;
use tokio::sync::RwLock;

pub struct MemoryStore {
    workflows: RwLock<HashMap<String, WorkflowState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn save_workflow(&self, workflow: &WorkflowState) -> Result<()> {
        let mut w = self.workflows.write().await;
        w.insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<WorkflowState> {
        let r = self.workflows.read().await;
        r.get(id)
            .cloned()
            .ok_or_else(|| GoclawError::not_found("workflow", id))
    }

    async fn list_workflows(&self, filter: &WorkflowFilter) -> Result<(Vec<WorkflowState>, usize)> {
        let r = self.workflows.read().await;
        let mut matched: Vec<WorkflowState> = r
            .values()
            .filter(|w| filter.matches(w.status))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let total = matched.len();
        let page = matched
            .into_iter()
            .skip(filter.offset)
            .take(filter.effective_limit())
            .collect();
        Ok((page, total))
    }

    async fn delete_workflow(&self, id: &str) -> Result<()> {
        let mut w = self.workflows.write().await;
        w.remove(id)
            .map(|_| ())
            .ok_or_else(|| GoclawError::not_found("workflow", id))
    }

    async fn save_task(&self, workflow_id: &str, task: &TaskState) -> Result<()> {
        let mut w = self.workflows.write().await;
        let workflow = w
            .get_mut(workflow_id)
            .ok_or_else(|| GoclawError::not_found("workflow", workflow_id))?;
        workflow.task_status.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, workflow_id: &str, task_id: &str) -> Result<TaskState> {
        let r = self.workflows.read().await;
        let workflow = r
            .get(workflow_id)
            .ok_or_else(|| GoclawError::not_found("workflow", workflow_id))?;
        workflow
            .task_status
            .get(task_id)
            .cloned()
            .ok_or_else(|| GoclawError::not_found("task", task_id))
    }

    async fn list_tasks(&self, workflow_id: &str) -> Result<Vec<TaskState>> {
        let r = self.workflows.read().await;
        let workflow = r
            .get(workflow_id)
            .ok_or_else(|| GoclawError::not_found("workflow", workflow_id))?;
        let mut tasks: Vec<TaskState> = workflow.task_status.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
