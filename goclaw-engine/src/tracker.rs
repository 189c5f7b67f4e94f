//! Authoritative task and workflow state, with transition-driven
//! persistence, metrics, and streaming.
//!
//! Every state change flows through this tracker: it validates the
//! transition, updates the in-memory record, persists through storage, and
//! publishes a lifecycle event. Metrics and the stream originate here, never
//! at call sites. Terminal transitions are idempotent per attempt.

use crate::broadcast::EventBroadcaster;
use crate::metrics::EngineMetrics;
use chrono::Utc;
use dashmap::DashMap;
use goclaw_core::events::{TaskStateChanged, WorkflowStateChanged};
use goclaw_core::{
    EventEnvelope, GoclawError, Result, TaskState, TaskStatus, WorkflowState, WorkflowStatus,
};
use goclaw_storage::WorkflowStore;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

pub struct StateTracker {
    store: Arc<dyn WorkflowStore>,
    broadcaster: Arc<EventBroadcaster>,
    metrics: Arc<EngineMetrics>,
    workflows: DashMap<String, Arc<RwLock<WorkflowState>>>,
}

fn task_transition_legal(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, Scheduled)
            | (Scheduled, Running)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Pending, Cancelled)
            | (Scheduled, Cancelled)
            // Lane admission refusals fail a task before it ever runs.
            | (Scheduled, Failed)
    )
}

fn workflow_transition_legal(from: WorkflowStatus, to: WorkflowStatus) -> bool {
    use WorkflowStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Cancelled)
            | (Pending, Failed)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
    )
}

impl StateTracker {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        broadcaster: Arc<EventBroadcaster>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            store,
            broadcaster,
            metrics,
            workflows: DashMap::new(),
        }
    }

    /// Take ownership of a workflow's runtime state. The caller must have
    /// persisted the record already.
    pub fn register(&self, workflow: WorkflowState) {
        self.workflows
            .insert(workflow.id.clone(), Arc::new(RwLock::new(workflow)));
    }

    /// Release a terminal workflow's in-memory state.
    pub fn unregister(&self, workflow_id: &str) {
        self.workflows.remove(workflow_id);
        self.broadcaster.prune(workflow_id);
    }

    pub fn is_registered(&self, workflow_id: &str) -> bool {
        self.workflows.contains_key(workflow_id)
    }

    fn entry(&self, workflow_id: &str) -> Result<Arc<RwLock<WorkflowState>>> {
        self.workflows
            .get(workflow_id)
            .map(|e| e.clone())
            .ok_or_else(|| GoclawError::not_found("workflow", workflow_id))
    }

    // -- Task transitions -------------------------------------------------

    pub async fn mark_scheduled(&self, workflow_id: &str, task_id: &str) -> Result<()> {
        self.transition_task(workflow_id, task_id, TaskStatus::Scheduled, |_| {})
            .await
    }

    pub async fn mark_running(&self, workflow_id: &str, task_id: &str) -> Result<()> {
        self.transition_task(workflow_id, task_id, TaskStatus::Running, |task| {
            task.started_at = Some(Utc::now());
        })
        .await
    }

    pub async fn mark_completed(
        &self,
        workflow_id: &str,
        task_id: &str,
        result: serde_json::Value,
    ) -> Result<()> {
        self.transition_task(workflow_id, task_id, TaskStatus::Completed, move |task| {
            task.completed_at = Some(Utc::now());
            task.result = Some(result);
            task.error = None;
        })
        .await
    }

    pub async fn mark_failed(
        &self,
        workflow_id: &str,
        task_id: &str,
        error: impl Into<String>,
    ) -> Result<()> {
        let error = error.into();
        self.transition_task(workflow_id, task_id, TaskStatus::Failed, move |task| {
            task.completed_at = Some(Utc::now());
            task.error = Some(error);
        })
        .await
    }

    pub async fn mark_cancelled(
        &self,
        workflow_id: &str,
        task_id: &str,
        reason: impl Into<String>,
    ) -> Result<()> {
        let reason = reason.into();
        self.transition_task(workflow_id, task_id, TaskStatus::Cancelled, move |task| {
            task.completed_at = Some(Utc::now());
            task.error = Some(reason);
        })
        .await
    }

    async fn transition_task(
        &self,
        workflow_id: &str,
        task_id: &str,
        to: TaskStatus,
        mutate: impl FnOnce(&mut TaskState),
    ) -> Result<()> {
        let entry = self.entry(workflow_id)?;
        let mut workflow = entry.write().await;
        let (from, snapshot) = {
            let task = workflow
                .task_status
                .get_mut(task_id)
                .ok_or_else(|| GoclawError::not_found("task", task_id))?;
            let from = task.status;

            if from == to && to.is_terminal() {
                // Duplicate terminal callback for the same attempt: count once.
                return Ok(());
            }
            if !task_transition_legal(from, to) {
                return Err(GoclawError::conflict(format!(
                    "illegal task transition {from} -> {to} for {workflow_id}/{task_id}"
                )));
            }

            task.status = to;
            mutate(task);
            (from, task.clone())
        };

        // Persist before the transition becomes observable.
        self.store.save_task(workflow_id, &snapshot).await?;

        if to.is_terminal() {
            let run_ms = match (snapshot.started_at, snapshot.completed_at) {
                (Some(start), Some(end)) => {
                    Some((end - start).num_milliseconds().max(0) as u64)
                }
                _ => None,
            };
            self.metrics.record_task_terminal(to, run_ms);
        }

        self.publish(EventEnvelope::task(TaskStateChanged {
            workflow_id: workflow_id.to_string(),
            task_id: task_id.to_string(),
            task_name: snapshot.name.clone(),
            old_state: from,
            new_state: to,
            error: snapshot.error.clone(),
            result: snapshot.result.clone(),
        }));
        debug!(workflow_id, task_id, %from, %to, "task transition");
        Ok(())
    }

    /// Reset a failed task for another attempt. The only sanctioned
    /// terminal -> non-terminal move besides recovery.
    pub async fn reset_for_retry(&self, workflow_id: &str, task_id: &str) -> Result<u32> {
        let entry = self.entry(workflow_id)?;
        let mut workflow = entry.write().await;
        let snapshot = {
            let task = workflow
                .task_status
                .get_mut(task_id)
                .ok_or_else(|| GoclawError::not_found("task", task_id))?;
            if task.status != TaskStatus::Failed {
                return Err(GoclawError::conflict(format!(
                    "cannot retry task {task_id} in state {}",
                    task.status
                )));
            }
            task.status = TaskStatus::Pending;
            task.attempt += 1;
            task.started_at = None;
            task.completed_at = None;
            task.error = None;
            task.result = None;
            task.clone()
        };
        let attempt = snapshot.attempt;

        self.store.save_task(workflow_id, &snapshot).await?;
        self.metrics.record_task_retry();
        debug!(workflow_id, task_id, attempt, "task reset for retry");
        Ok(attempt)
    }

    // -- Workflow transitions ---------------------------------------------

    pub async fn mark_workflow_running(&self, workflow_id: &str) -> Result<()> {
        self.transition_workflow(workflow_id, WorkflowStatus::Running, |wf| {
            wf.started_at = Some(Utc::now());
        })
        .await
    }

    pub async fn mark_workflow_terminal(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
        error: Option<String>,
    ) -> Result<()> {
        debug_assert!(status.is_terminal());
        self.transition_workflow(workflow_id, status, move |wf| {
            wf.completed_at = Some(Utc::now());
            wf.error = error;
        })
        .await
    }

    async fn transition_workflow(
        &self,
        workflow_id: &str,
        to: WorkflowStatus,
        mutate: impl FnOnce(&mut WorkflowState),
    ) -> Result<()> {
        let entry = self.entry(workflow_id)?;
        let mut workflow = entry.write().await;
        let from = workflow.status;

        if from == to && to.is_terminal() {
            return Ok(());
        }
        if !workflow_transition_legal(from, to) {
            return Err(GoclawError::conflict(format!(
                "illegal workflow transition {from} -> {to} for {workflow_id}"
            )));
        }

        workflow.status = to;
        mutate(&mut workflow);
        let name = workflow.name.clone();
        let snapshot = workflow.clone();

        self.store.save_workflow(&snapshot).await?;

        if to.is_terminal() {
            self.metrics.record_workflow_terminal(to);
        }
        self.publish(EventEnvelope::workflow(WorkflowStateChanged {
            workflow_id: workflow_id.to_string(),
            name,
            old_state: from,
            new_state: to,
            updated_at: Utc::now(),
        }));
        debug!(workflow_id, %from, %to, "workflow transition");
        Ok(())
    }

    fn publish(&self, event: EventEnvelope) {
        self.metrics.record_event_published();
        self.broadcaster.publish(event);
    }

    // -- Queries ----------------------------------------------------------

    pub async fn snapshot(&self, workflow_id: &str) -> Result<WorkflowState> {
        let entry = self.entry(workflow_id)?;
        let workflow = entry.read().await;
        Ok(workflow.clone())
    }

    pub async fn snapshot_task(&self, workflow_id: &str, task_id: &str) -> Result<TaskState> {
        let entry = self.entry(workflow_id)?;
        let workflow = entry.read().await;
        workflow
            .task_status
            .get(task_id)
            .cloned()
            .ok_or_else(|| GoclawError::not_found("task", task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goclaw_core::TaskSpec;
    use goclaw_storage::MemoryStore;
    use std::collections::HashMap;

    async fn tracker_with(tasks: Vec<TaskSpec>) -> (StateTracker, Arc<dyn WorkflowStore>) {
        let store: Arc<dyn WorkflowStore> = Arc::new(MemoryStore::new());
        let tracker = StateTracker::new(
            store.clone(),
            Arc::new(EventBroadcaster::new()),
            Arc::new(EngineMetrics::new()),
        );
        let workflow = WorkflowState::new("wf-1", "test", "", tasks, HashMap::new());
        store.save_workflow(&workflow).await.unwrap();
        tracker.register(workflow);
        (tracker, store)
    }

    #[tokio::test]
    async fn test_legal_transition_sequence() {
        let (tracker, store) = tracker_with(vec![TaskSpec::new("a", "A")]).await;
        tracker.mark_scheduled("wf-1", "a").await.unwrap();
        tracker.mark_running("wf-1", "a").await.unwrap();
        tracker
            .mark_completed("wf-1", "a", serde_json::json!("done"))
            .await
            .unwrap();

        let task = store.get_task("wf-1", "a").await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.started_at.unwrap() <= task.completed_at.unwrap());
        assert_eq!(task.result, Some(serde_json::json!("done")));
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let (tracker, _) = tracker_with(vec![TaskSpec::new("a", "A")]).await;
        // pending -> running skips scheduled
        assert!(tracker.mark_running("wf-1", "a").await.unwrap_err().is_conflict());
        // pending -> completed skips everything
        assert!(tracker
            .mark_completed("wf-1", "a", serde_json::Value::Null)
            .await
            .unwrap_err()
            .is_conflict());
    }

    #[tokio::test]
    async fn test_terminal_is_frozen() {
        let (tracker, _) = tracker_with(vec![TaskSpec::new("a", "A")]).await;
        tracker.mark_scheduled("wf-1", "a").await.unwrap();
        tracker.mark_running("wf-1", "a").await.unwrap();
        tracker.mark_failed("wf-1", "a", "boom").await.unwrap();

        // Different terminal for the same attempt conflicts.
        assert!(tracker
            .mark_completed("wf-1", "a", serde_json::Value::Null)
            .await
            .unwrap_err()
            .is_conflict());
        assert!(tracker.mark_scheduled("wf-1", "a").await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_duplicate_terminal_is_idempotent() {
        let store: Arc<dyn WorkflowStore> = Arc::new(MemoryStore::new());
        let metrics = Arc::new(EngineMetrics::new());
        let tracker = StateTracker::new(store.clone(), Arc::new(EventBroadcaster::new()), metrics.clone());
        let workflow = WorkflowState::new("wf-1", "test", "", vec![TaskSpec::new("a", "A")], HashMap::new());
        store.save_workflow(&workflow).await.unwrap();
        tracker.register(workflow);

        tracker.mark_scheduled("wf-1", "a").await.unwrap();
        tracker.mark_running("wf-1", "a").await.unwrap();
        tracker.mark_cancelled("wf-1", "a", "deadline").await.unwrap();
        // Second identical terminal is a no-op, metered once.
        tracker.mark_cancelled("wf-1", "a", "deadline").await.unwrap();
        assert_eq!(metrics.snapshot().tasks_cancelled, 1);
    }

    #[tokio::test]
    async fn test_pre_start_cancellation_paths() {
        let (tracker, _) = tracker_with(vec![TaskSpec::new("a", "A"), TaskSpec::new("b", "B")]).await;
        // pending -> cancelled
        tracker.mark_cancelled("wf-1", "a", "workflow cancelled").await.unwrap();
        // scheduled -> cancelled
        tracker.mark_scheduled("wf-1", "b").await.unwrap();
        tracker.mark_cancelled("wf-1", "b", "workflow cancelled").await.unwrap();

        let snap = tracker.snapshot("wf-1").await.unwrap();
        assert_eq!(snap.task("a").unwrap().status, TaskStatus::Cancelled);
        assert_eq!(snap.task("b").unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_retry_reset_increments_attempt() {
        let (tracker, store) = tracker_with(vec![TaskSpec::new("a", "A")]).await;
        tracker.mark_scheduled("wf-1", "a").await.unwrap();
        tracker.mark_running("wf-1", "a").await.unwrap();
        tracker.mark_failed("wf-1", "a", "boom").await.unwrap();

        let attempt = tracker.reset_for_retry("wf-1", "a").await.unwrap();
        assert_eq!(attempt, 2);
        let task = store.get_task("wf-1", "a").await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.error.is_none());

        // Only failed tasks can be reset.
        assert!(tracker.reset_for_retry("wf-1", "a").await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_workflow_transitions_persist() {
        let (tracker, store) = tracker_with(vec![TaskSpec::new("a", "A")]).await;
        tracker.mark_workflow_running("wf-1").await.unwrap();
        assert_eq!(
            store.get_workflow("wf-1").await.unwrap().status,
            WorkflowStatus::Running
        );
        tracker
            .mark_workflow_terminal("wf-1", WorkflowStatus::Completed, None)
            .await
            .unwrap();
        let wf = store.get_workflow("wf-1").await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert!(wf.completed_at.is_some());

        // Terminal workflows are frozen.
        assert!(tracker.mark_workflow_running("wf-1").await.unwrap_err().is_conflict());
    }
}
