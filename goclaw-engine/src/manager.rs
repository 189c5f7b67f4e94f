//! Workflow manager: the submission pipeline and status surface.
//!
//! Submissions run in two phases: validate and persist `pending`, then
//! trigger execution when executable functions are available. Status queries
//! always read persisted state.

use crate::dag::{ExecutionPlan, TaskGraph};
use crate::metrics::EngineMetrics;
use crate::scheduler::Scheduler;
use crate::tracker::StateTracker;
use dashmap::DashMap;
use goclaw_core::types::{MAX_DESCRIPTION_LEN, MAX_NAME_LEN};
use goclaw_core::{
    GoclawError, Result, SubmitWorkflowRequest, SubmitWorkflowResponse, TaskFn, TaskStatus,
    WorkflowFilter, WorkflowState, WorkflowStatus,
};
use goclaw_storage::WorkflowStore;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

pub struct WorkflowManager {
    store: Arc<dyn WorkflowStore>,
    tracker: Arc<StateTracker>,
    scheduler: Arc<Scheduler>,
    metrics: Arc<EngineMetrics>,
    /// Engine root token; workflow contexts derive from it
    root: CancellationToken,
    /// Running workflow contexts, for cancellation
    active: DashMap<String, CancellationToken>,
    /// Bounds concurrently executing workflows
    run_permits: Arc<Semaphore>,
    self_ref: OnceLock<Weak<WorkflowManager>>,
}

impl WorkflowManager {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        tracker: Arc<StateTracker>,
        scheduler: Arc<Scheduler>,
        metrics: Arc<EngineMetrics>,
        root: CancellationToken,
        max_concurrent_workflows: usize,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            store,
            tracker,
            scheduler,
            metrics,
            root,
            active: DashMap::new(),
            run_permits: Arc::new(Semaphore::new(max_concurrent_workflows.max(1))),
            self_ref: OnceLock::new(),
        });
        let _ = manager.self_ref.set(Arc::downgrade(&manager));
        manager
    }

    /// Validate, persist `pending`, then trigger per the submission mode.
    ///
    /// With handlers and `async` unset, blocks until the workflow is
    /// terminal. With handlers and `async` set, returns once persisted.
    /// Without handlers the workflow stays `pending` for an external
    /// trigger and the response is always non-terminal.
    pub async fn submit(
        &self,
        request: SubmitWorkflowRequest,
        handlers: HashMap<String, TaskFn>,
    ) -> Result<SubmitWorkflowResponse> {
        let plan = validate_request(&request)?;

        let workflow_id = Uuid::new_v4().to_string();
        let workflow = WorkflowState::new(
            workflow_id.clone(),
            request.name.clone(),
            request.description.clone(),
            request.tasks.clone(),
            request.metadata.clone(),
        );

        // Submission phase: the workflow exists once `pending` is durable.
        self.store.save_workflow(&workflow).await?;
        self.tracker.register(workflow);
        self.metrics.record_workflow_submitted();
        info!(%workflow_id, name = %request.name, tasks = request.tasks.len(), "workflow submitted");

        if handlers.is_empty() {
            // No executable functions: stays pending for an external trigger.
            return Ok(SubmitWorkflowResponse {
                workflow_id,
                status: WorkflowStatus::Pending,
            });
        }

        let handle = self.spawn_execution(&workflow_id, plan, Arc::new(handlers))?;
        if request.async_mode {
            return Ok(SubmitWorkflowResponse {
                workflow_id,
                status: WorkflowStatus::Pending,
            });
        }

        let status = handle
            .await
            .map_err(|e| GoclawError::internal(format!("execution task failed: {e}")))?;
        Ok(SubmitWorkflowResponse {
            workflow_id,
            status,
        })
    }

    /// Trigger execution of a persisted `pending` workflow with the given
    /// handlers. Used by the engine for recovery and external triggers.
    pub fn trigger(
        &self,
        workflow: &WorkflowState,
        handlers: Arc<HashMap<String, TaskFn>>,
    ) -> Result<()> {
        if workflow.status != WorkflowStatus::Pending {
            return Err(GoclawError::conflict(format!(
                "workflow {} is {}, only pending workflows can be triggered",
                workflow.id, workflow.status
            )));
        }
        let plan = TaskGraph::from_specs(&workflow.tasks)?.compile()?;
        self.spawn_execution(&workflow.id, plan, handlers)?;
        Ok(())
    }

    fn spawn_execution(
        &self,
        workflow_id: &str,
        plan: ExecutionPlan,
        handlers: Arc<HashMap<String, TaskFn>>,
    ) -> Result<tokio::task::JoinHandle<WorkflowStatus>> {
        let manager = self
            .self_ref
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| GoclawError::internal("workflow manager not initialized"))?;
        let workflow_id = workflow_id.to_string();
        let token = self.root.child_token();
        self.active.insert(workflow_id.clone(), token.clone());

        Ok(tokio::spawn(async move {
            // The workflow stays pending while waiting for a run slot.
            let _permit = match manager.run_permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    manager.active.remove(&workflow_id);
                    return WorkflowStatus::Pending;
                }
            };

            let specs = match manager.tracker.snapshot(&workflow_id).await {
                Ok(snapshot) => snapshot.tasks,
                Err(err) => {
                    error!(%workflow_id, %err, "workflow vanished before execution");
                    manager.active.remove(&workflow_id);
                    return WorkflowStatus::Pending;
                }
            };

            let status = match manager
                .scheduler
                .run(token, &workflow_id, &specs, &plan, handlers)
                .await
            {
                Ok(status) => status,
                Err(err) => {
                    error!(%workflow_id, %err, "scheduler error, failing workflow");
                    let _ = manager
                        .tracker
                        .mark_workflow_terminal(
                            &workflow_id,
                            WorkflowStatus::Failed,
                            Some(err.to_string()),
                        )
                        .await;
                    WorkflowStatus::Failed
                }
            };

            manager.active.remove(&workflow_id);
            manager.tracker.unregister(&workflow_id);
            status
        }))
    }

    /// Cancel a workflow. Running workflows get their context cancelled;
    /// pending ones transition straight to `cancelled`. Terminal workflows
    /// conflict.
    pub async fn cancel(&self, workflow_id: &str) -> Result<()> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        if workflow.status.is_terminal() {
            return Err(GoclawError::conflict(format!(
                "workflow {workflow_id} is already {}",
                workflow.status
            )));
        }

        if let Some(token) = self.active.get(workflow_id) {
            token.cancel();
            info!(workflow_id, "cancellation requested for running workflow");
            return Ok(());
        }

        // Pending and never dispatched: cancel without executing anything.
        for task_id in workflow.task_status.keys() {
            let _ = self
                .tracker
                .mark_cancelled(workflow_id, task_id, "workflow cancelled before dispatch")
                .await;
        }
        self.tracker
            .mark_workflow_terminal(
                workflow_id,
                WorkflowStatus::Cancelled,
                Some("cancelled before dispatch".to_string()),
            )
            .await?;
        self.tracker.unregister(workflow_id);
        info!(workflow_id, "pending workflow cancelled");
        Ok(())
    }

    /// Number of workflows currently executing or queued for a run slot.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Cancel every active workflow context (engine stop path).
    pub fn cancel_all(&self) {
        for entry in self.active.iter() {
            entry.value().cancel();
        }
    }

    pub async fn get(&self, workflow_id: &str) -> Result<WorkflowState> {
        self.store.get_workflow(workflow_id).await
    }

    pub async fn list(&self, filter: &WorkflowFilter) -> Result<(Vec<WorkflowState>, usize)> {
        self.store.list_workflows(filter).await
    }

    /// A completed task's opaque result payload.
    pub async fn task_result(
        &self,
        workflow_id: &str,
        task_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        let task = self.store.get_task(workflow_id, task_id).await?;
        Ok(task.result)
    }

    /// Delete a terminal workflow and its tasks.
    pub async fn delete(&self, workflow_id: &str) -> Result<()> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        if !workflow.status.is_terminal() {
            return Err(GoclawError::conflict(format!(
                "workflow {workflow_id} is {}, only terminal workflows can be deleted",
                workflow.status
            )));
        }
        self.store.delete_workflow(workflow_id).await
    }
}

/// Request validation: structural limits first, then graph shape.
fn validate_request(request: &SubmitWorkflowRequest) -> Result<ExecutionPlan> {
    if request.name.is_empty() || request.name.len() > MAX_NAME_LEN {
        return Err(GoclawError::validation(
            "name",
            format!("must be 1-{MAX_NAME_LEN} characters"),
        ));
    }
    if request.description.len() > MAX_DESCRIPTION_LEN {
        return Err(GoclawError::validation(
            "description",
            format!("must be at most {MAX_DESCRIPTION_LEN} characters"),
        ));
    }
    if request.tasks.is_empty() {
        return Err(GoclawError::validation("tasks", "at least one task is required"));
    }

    let mut seen = HashSet::new();
    for task in &request.tasks {
        if task.id.is_empty() {
            return Err(GoclawError::validation("tasks.id", "task id must not be empty"));
        }
        if task.lane.is_empty() {
            return Err(GoclawError::validation(
                "tasks.lane",
                format!("task {} has an empty lane", task.id),
            ));
        }
        if !seen.insert(task.id.as_str()) {
            return Err(GoclawError::DuplicateTask(task.id.clone()));
        }
    }

    // Unknown dependencies and cycles surface from graph construction.
    TaskGraph::from_specs(&request.tasks)?.compile()
}

/// True when every task of the workflow ended completed.
pub fn all_tasks_completed(workflow: &WorkflowState) -> bool {
    workflow
        .task_status
        .values()
        .all(|t| t.status == TaskStatus::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use goclaw_core::TaskSpec;

    fn request(tasks: Vec<TaskSpec>) -> SubmitWorkflowRequest {
        SubmitWorkflowRequest {
            name: "test".into(),
            description: String::new(),
            tasks,
            metadata: HashMap::new(),
            async_mode: false,
        }
    }

    #[test]
    fn test_validation_limits() {
        let mut req = request(vec![TaskSpec::new("a", "A")]);
        req.name = String::new();
        assert!(matches!(
            validate_request(&req).unwrap_err(),
            GoclawError::Validation { .. }
        ));

        let mut req = request(vec![TaskSpec::new("a", "A")]);
        req.name = "x".repeat(MAX_NAME_LEN + 1);
        assert!(validate_request(&req).is_err());

        let mut req = request(vec![TaskSpec::new("a", "A")]);
        req.description = "d".repeat(MAX_DESCRIPTION_LEN + 1);
        assert!(validate_request(&req).is_err());

        let req = request(vec![]);
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn test_duplicate_and_unknown_dependency_rejected() {
        let req = request(vec![TaskSpec::new("a", "A"), TaskSpec::new("a", "A2")]);
        assert!(matches!(
            validate_request(&req).unwrap_err(),
            GoclawError::DuplicateTask(_)
        ));

        let req = request(vec![
            TaskSpec::new("a", "A").with_dependencies(vec!["ghost".into()])
        ]);
        assert!(matches!(
            validate_request(&req).unwrap_err(),
            GoclawError::DependencyNotFound { .. }
        ));
    }

    #[test]
    fn test_cycle_rejected_with_path() {
        let req = request(vec![
            TaskSpec::new("a", "A").with_dependencies(vec!["b".into()]),
            TaskSpec::new("b", "B").with_dependencies(vec!["a".into()]),
        ]);
        assert!(matches!(
            validate_request(&req).unwrap_err(),
            GoclawError::CyclicDependency { .. }
        ));
    }

    #[test]
    fn test_valid_request_produces_plan() {
        let req = request(vec![
            TaskSpec::new("a", "A"),
            TaskSpec::new("b", "B").with_dependencies(vec!["a".into()]),
        ]);
        let plan = validate_request(&req).unwrap();
        assert_eq!(plan.layers.len(), 2);
    }
}
