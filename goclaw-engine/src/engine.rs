//! Engine lifecycle: component wiring, start/stop, and crash recovery.

use crate::broadcast::EventBroadcaster;
use crate::lane::{LaneManager, LaneStats};
use crate::manager::WorkflowManager;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::registry::TaskHandlerRegistry;
use crate::saga::SagaOrchestrator;
use crate::scheduler::Scheduler;
use crate::tracker::StateTracker;
use goclaw_core::types::MAX_LIST_LIMIT;
use goclaw_core::{
    EventEnvelope, GoclawConfig, GoclawError, Result, SubmitWorkflowRequest,
    SubmitWorkflowResponse, TaskFn, TaskState, TaskStatus, WorkflowFilter, WorkflowState,
    WorkflowStatus,
};
use goclaw_storage::{open_storage, SagaWal, WorkflowStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Stopped,
    Error,
}

/// The orchestration engine: owns storage, lanes, tracker, scheduler,
/// workflow manager, broadcaster, and the saga orchestrator.
pub struct Engine {
    config: GoclawConfig,
    state: parking_lot::RwLock<EngineState>,
    store: Arc<dyn WorkflowStore>,
    lanes: Arc<LaneManager>,
    tracker: Arc<StateTracker>,
    broadcaster: Arc<EventBroadcaster>,
    metrics: Arc<EngineMetrics>,
    manager: Arc<WorkflowManager>,
    registry: Arc<TaskHandlerRegistry>,
    root: CancellationToken,
    saga: Option<Arc<SagaOrchestrator>>,
}

impl Engine {
    /// Build all components. Must run inside a tokio runtime; the engine is
    /// `Idle` until [`Engine::start`].
    pub fn new(config: GoclawConfig) -> Result<Self> {
        config.validate()?;
        let (store, wal): (Arc<dyn WorkflowStore>, Arc<dyn SagaWal>) = open_storage(&config)?;
        let broadcaster = Arc::new(EventBroadcaster::from_mode(
            &config.signal.mode,
            config.orchestration.queue.size,
        ));
        let metrics = Arc::new(EngineMetrics::new());
        let tracker = Arc::new(StateTracker::new(
            store.clone(),
            broadcaster.clone(),
            metrics.clone(),
        ));
        if config.orchestration.queue.kind == "distributed" {
            warn!("distributed queue unavailable, falling back to in-memory lanes");
        }
        let lanes = Arc::new(LaneManager::from_configs(&config.lanes)?);
        let root = CancellationToken::new();
        let scheduler = Arc::new(Scheduler::new(
            lanes.clone(),
            tracker.clone(),
            config.orchestration.grace_period(),
        ));
        let manager = WorkflowManager::new(
            store.clone(),
            tracker.clone(),
            scheduler,
            metrics.clone(),
            root.clone(),
            config.orchestration.max_agents,
        );
        let saga = if config.saga.enabled {
            Some(SagaOrchestrator::new(
                config.saga.clone(),
                wal,
                lanes.clone(),
                broadcaster.clone(),
                metrics.clone(),
                root.clone(),
            ))
        } else {
            None
        };

        Ok(Self {
            config,
            state: parking_lot::RwLock::new(EngineState::Idle),
            store,
            lanes,
            tracker,
            broadcaster,
            metrics,
            manager,
            registry: Arc::new(TaskHandlerRegistry::new()),
            root,
            saga,
        })
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    pub fn config(&self) -> &GoclawConfig {
        &self.config
    }

    /// Register a named task handler used for recovery re-binding and for
    /// submissions without inline closures.
    pub fn register_task_handler(&self, name: impl Into<String>, handler: TaskFn) {
        self.registry.register(name, handler);
    }

    /// Start the engine: run workflow and saga recovery, then accept work.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            match *state {
                EngineState::Idle => {}
                EngineState::Running => {
                    return Err(GoclawError::lifecycle("engine is already running"))
                }
                _ => return Err(GoclawError::lifecycle("engine cannot restart after stop")),
            }
            *state = EngineState::Running;
        }

        if let Err(err) = self.recover_workflows().await {
            *self.state.write() = EngineState::Error;
            return Err(err);
        }
        if let Some(saga) = &self.saga {
            saga.recover().await?;
            saga.start_wal_cleanup();
        }
        info!("engine running");
        Ok(())
    }

    /// Stop the engine: refuse new submissions, cancel outstanding workflow
    /// contexts within the grace window, then close lanes and storage.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != EngineState::Running {
                return Err(GoclawError::lifecycle("engine is not running"));
            }
            *state = EngineState::Stopped;
        }
        info!("engine stopping");

        self.manager.cancel_all();
        let deadline = Instant::now() + self.config.orchestration.grace_period();
        while self.manager.active_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        if self.manager.active_count() > 0 {
            warn!(
                remaining = self.manager.active_count(),
                "workflows still active after grace window"
            );
        }

        self.root.cancel();
        self.lanes.close().await?;
        self.store.close().await?;
        info!("engine stopped");
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.state() != EngineState::Running {
            return Err(GoclawError::lifecycle("engine is not running"));
        }
        Ok(())
    }

    /// Submit with inline per-task handlers (task ID -> function).
    pub async fn submit_workflow_with_handlers(
        &self,
        request: SubmitWorkflowRequest,
        handlers: HashMap<String, TaskFn>,
    ) -> Result<SubmitWorkflowResponse> {
        self.ensure_running()?;
        self.manager.submit(request, handlers).await
    }

    /// Submit resolving handlers from the registry by task name. Tasks
    /// without registered handlers leave the workflow pending.
    pub async fn submit_workflow(
        &self,
        request: SubmitWorkflowRequest,
    ) -> Result<SubmitWorkflowResponse> {
        self.ensure_running()?;
        let handlers = self.registry.resolve(&request.tasks).unwrap_or_default();
        self.manager.submit(request, handlers).await
    }

    /// Trigger a pending workflow with handlers resolved from the registry.
    pub async fn trigger_workflow(&self, workflow_id: &str) -> Result<()> {
        self.ensure_running()?;
        let workflow = self.store.get_workflow(workflow_id).await?;
        let handlers = self.registry.resolve(&workflow.tasks).ok_or_else(|| {
            GoclawError::validation("tasks", "no registered handlers for workflow tasks")
        })?;
        if !self.tracker.is_registered(workflow_id) {
            self.tracker.register(workflow.clone());
        }
        self.manager.trigger(&workflow, Arc::new(handlers))
    }

    pub async fn cancel_workflow(&self, workflow_id: &str) -> Result<()> {
        self.ensure_running()?;
        self.manager.cancel(workflow_id).await
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<WorkflowState> {
        self.manager.get(workflow_id).await
    }

    pub async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<(Vec<WorkflowState>, usize)> {
        self.manager.list(filter).await
    }

    pub async fn task_result(
        &self,
        workflow_id: &str,
        task_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        self.manager.task_result(workflow_id, task_id).await
    }

    pub async fn delete_workflow(&self, workflow_id: &str) -> Result<()> {
        self.ensure_running()?;
        self.manager.delete(workflow_id).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.broadcaster.subscribe_all()
    }

    pub fn subscribe_workflow(&self, workflow_id: &str) -> broadcast::Receiver<EventEnvelope> {
        self.broadcaster.subscribe_workflow(workflow_id)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn lane_stats(&self) -> HashMap<String, LaneStats> {
        self.lanes.stats()
    }

    pub fn saga(&self) -> Option<Arc<SagaOrchestrator>> {
        self.saga.clone()
    }

    // -- Recovery ---------------------------------------------------------

    /// Scan persistence for interrupted workflows and resume them
    /// best-effort. A failure on one workflow never blocks the others.
    async fn recover_workflows(&self) -> Result<()> {
        let statuses = vec![WorkflowStatus::Pending, WorkflowStatus::Running];
        let mut offset = 0;
        let mut recovered = 0usize;
        loop {
            let filter = WorkflowFilter {
                statuses: statuses.clone(),
                limit: Some(MAX_LIST_LIMIT),
                offset,
            };
            let (page, total) = self.store.list_workflows(&filter).await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            for workflow in page {
                let workflow_id = workflow.id.clone();
                match self.recover_workflow(workflow).await {
                    Ok(resumed) => {
                        if resumed {
                            recovered += 1;
                        }
                    }
                    Err(err) => {
                        warn!(%workflow_id, %err, "skipping workflow during recovery");
                    }
                }
            }
            if offset >= total {
                break;
            }
        }
        if recovered > 0 {
            info!(recovered, "workflow recovery finished");
        }
        Ok(())
    }

    /// Returns true when the workflow was resubmitted to the scheduler.
    async fn recover_workflow(&self, mut workflow: WorkflowState) -> Result<bool> {
        let retries_by_id: HashMap<&str, u32> = workflow
            .tasks
            .iter()
            .map(|s| (s.id.as_str(), s.retries))
            .collect();

        let mut unrecoverable = false;
        for task in workflow.task_status.values_mut() {
            match task.status {
                TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Pending => {}
                TaskStatus::Running | TaskStatus::Scheduled => {
                    // Interrupted mid-flight; re-execute under the task's
                    // idempotency assumptions.
                    reset_task(task);
                }
                TaskStatus::Failed => {
                    let budget = retries_by_id.get(task.id.as_str()).copied().unwrap_or(0);
                    if task.attempt <= budget {
                        reset_task(task);
                    } else {
                        unrecoverable = true;
                    }
                }
            }
        }

        if unrecoverable {
            workflow.status = WorkflowStatus::Failed;
            workflow.completed_at = Some(chrono::Utc::now());
            workflow.error = Some("unrecoverable task failure found at restart".to_string());
            self.store.save_workflow(&workflow).await?;
            return Ok(false);
        }

        workflow.status = WorkflowStatus::Pending;
        workflow.started_at = None;
        workflow.completed_at = None;
        workflow.error = None;
        self.store.save_workflow(&workflow).await?;
        self.tracker.register(workflow.clone());

        match self.registry.resolve(&workflow.tasks) {
            Some(handlers) => {
                self.manager.trigger(&workflow, Arc::new(handlers))?;
                info!(workflow_id = %workflow.id, "recovered workflow resubmitted");
                Ok(true)
            }
            None => {
                info!(
                    workflow_id = %workflow.id,
                    "recovered workflow left pending: no registered handlers"
                );
                Ok(false)
            }
        }
    }
}

fn reset_task(task: &mut TaskState) {
    task.status = TaskStatus::Pending;
    task.started_at = None;
    task.completed_at = None;
    task.error = None;
    task.result = None;
}
