//! Layer-by-layer workflow execution.
//!
//! The scheduler walks the compiled plan one layer at a time: every task in
//! a layer is wrapped as a lane task and submitted through the lane manager,
//! then a barrier holds until each is terminal. Intra-layer concurrency is
//! owned entirely by lane capacity. A task failure with no retry budget
//! fails fast: the workflow context is cancelled, later layers never
//! dispatch, and their tasks are marked cancelled.

use crate::dag::ExecutionPlan;
use crate::lane::{LaneManager, LaneTask, TaskOutcome};
use crate::tracker::StateTracker;
use futures::future::join_all;
use futures::FutureExt;
use goclaw_core::{Result, TaskContext, TaskFn, TaskSpec, TaskStatus, WorkflowStatus};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Base delay for retry backoff; doubles per attempt, capped below.
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(50);
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(5);

pub struct Scheduler {
    lanes: Arc<LaneManager>,
    tracker: Arc<StateTracker>,
    grace: Duration,
}

impl Scheduler {
    pub fn new(lanes: Arc<LaneManager>, tracker: Arc<StateTracker>, grace: Duration) -> Self {
        Self {
            lanes,
            tracker,
            grace,
        }
    }

    /// Drive one workflow to a terminal status.
    pub async fn run(
        &self,
        ctx: CancellationToken,
        workflow_id: &str,
        specs: &[TaskSpec],
        plan: &ExecutionPlan,
        handlers: Arc<HashMap<String, TaskFn>>,
    ) -> Result<WorkflowStatus> {
        self.tracker.mark_workflow_running(workflow_id).await?;

        let spec_map: HashMap<&str, &TaskSpec> =
            specs.iter().map(|s| (s.id.as_str(), s)).collect();

        for (layer_idx, layer) in plan.layers.iter().enumerate() {
            if ctx.is_cancelled() {
                return self
                    .finish_cancelled(workflow_id, &plan.layers[layer_idx..])
                    .await;
            }

            debug!(workflow_id, layer = layer_idx, tasks = layer.len(), "dispatching layer");
            let drivers: Vec<_> = layer
                .iter()
                .map(|task_id| {
                    let spec = spec_map[task_id.as_str()];
                    self.run_task_attempts(&ctx, workflow_id, spec, handlers.clone())
                })
                .collect();

            let barrier = join_all(drivers);
            tokio::pin!(barrier);
            let outcomes: Vec<TaskStatus> = tokio::select! {
                outcomes = &mut barrier => outcomes,
                _ = ctx.cancelled() => {
                    // Queued-but-not-running tasks cancel immediately;
                    // running ones get the grace window to observe it.
                    self.cancel_waiting_tasks(workflow_id, layer).await;
                    tokio::select! {
                        outcomes = &mut barrier => outcomes,
                        _ = tokio::time::sleep(self.grace) => {
                            warn!(workflow_id, "grace window exceeded, forcing terminal transitions");
                            self.force_cancel_tasks(workflow_id, layer).await;
                            Vec::new()
                        }
                    }
                }
            };

            if ctx.is_cancelled() {
                return self
                    .finish_cancelled(workflow_id, &plan.layers[layer_idx + 1..])
                    .await;
            }

            // A failed task exhausts fail-fast; so does a task-level
            // cancellation (timeout) when the workflow itself was not
            // cancelled: dependents must never run after either.
            if outcomes
                .iter()
                .any(|s| matches!(s, TaskStatus::Failed | TaskStatus::Cancelled))
            {
                ctx.cancel();
                self.cancel_pending_layers(workflow_id, &plan.layers[layer_idx + 1..])
                    .await;
                let error = self.first_failure(workflow_id, layer).await;
                self.tracker
                    .mark_workflow_terminal(workflow_id, WorkflowStatus::Failed, error)
                    .await?;
                return Ok(WorkflowStatus::Failed);
            }
        }

        self.tracker
            .mark_workflow_terminal(workflow_id, WorkflowStatus::Completed, None)
            .await?;
        Ok(WorkflowStatus::Completed)
    }

    /// Run one task to a terminal status, re-submitting through the lane
    /// while retry budget remains. Cancellation-derived terminals never
    /// retry.
    async fn run_task_attempts(
        &self,
        ctx: &CancellationToken,
        workflow_id: &str,
        spec: &TaskSpec,
        handlers: Arc<HashMap<String, TaskFn>>,
    ) -> TaskStatus {
        let max_attempts = spec.retries.saturating_add(1);
        let mut attempt: u32 = 1;

        // A recovered workflow carries tasks that are already terminal;
        // completed results are preserved, never re-executed.
        if let Ok(task) = self.tracker.snapshot_task(workflow_id, &spec.id).await {
            if task.status.is_terminal() {
                return task.status;
            }
            attempt = task.attempt;
        }

        loop {
            if ctx.is_cancelled() {
                let _ = self
                    .tracker
                    .mark_cancelled(workflow_id, &spec.id, "workflow cancelled")
                    .await;
                return TaskStatus::Cancelled;
            }

            if self.tracker.mark_scheduled(workflow_id, &spec.id).await.is_err() {
                // Swept to cancelled between attempts.
                return TaskStatus::Cancelled;
            }

            let Some(handler) = handlers.get(&spec.id).cloned() else {
                let _ = self
                    .tracker
                    .mark_failed(workflow_id, &spec.id, "no executable function for task")
                    .await;
                return TaskStatus::Failed;
            };

            let (done_tx, done_rx) = oneshot::channel();
            let lane_task = self.build_lane_task(ctx, workflow_id, spec, attempt, handler, done_tx);

            let status = match self.lanes.submit(ctx, lane_task).await {
                Ok(()) => match done_rx.await {
                    Ok(status) => status,
                    Err(_) => {
                        // The executor vanished without reporting; surface a
                        // failure unless the task already went terminal.
                        let _ = self
                            .tracker
                            .mark_failed(workflow_id, &spec.id, "task execution abandoned")
                            .await;
                        self.terminal_status(workflow_id, &spec.id).await
                    }
                },
                Err(err) if err.is_cancelled() => {
                    let _ = self
                        .tracker
                        .mark_cancelled(workflow_id, &spec.id, "workflow cancelled")
                        .await;
                    return TaskStatus::Cancelled;
                }
                Err(err) => {
                    debug!(workflow_id, task_id = %spec.id, %err, "lane admission failed");
                    let _ = self
                        .tracker
                        .mark_failed(workflow_id, &spec.id, err.to_string())
                        .await;
                    TaskStatus::Failed
                }
            };

            match status {
                TaskStatus::Completed => return TaskStatus::Completed,
                TaskStatus::Cancelled => return TaskStatus::Cancelled,
                TaskStatus::Failed if attempt < max_attempts && !ctx.is_cancelled() => {
                    if self
                        .tracker
                        .reset_for_retry(workflow_id, &spec.id)
                        .await
                        .is_err()
                    {
                        return TaskStatus::Failed;
                    }
                    let backoff = retry_backoff(attempt);
                    debug!(workflow_id, task_id = %spec.id, attempt, ?backoff, "retrying task");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = ctx.cancelled() => {
                            let _ = self
                                .tracker
                                .mark_cancelled(workflow_id, &spec.id, "workflow cancelled")
                                .await;
                            return TaskStatus::Cancelled;
                        }
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn build_lane_task(
        &self,
        ctx: &CancellationToken,
        workflow_id: &str,
        spec: &TaskSpec,
        attempt: u32,
        handler: TaskFn,
        done_tx: oneshot::Sender<TaskStatus>,
    ) -> LaneTask {
        let tracker = self.tracker.clone();
        let token = ctx.child_token();
        let timeout = spec.timeout;
        let task_ctx = TaskContext {
            workflow_id: workflow_id.to_string(),
            task_id: spec.id.clone(),
            attempt,
            metadata: spec.metadata.clone(),
            cancellation: token.clone(),
        };
        let workflow_id = workflow_id.to_string();
        let task_id = spec.id.clone();
        let lane_workflow_id = workflow_id.clone();
        let lane_task_id = task_id.clone();

        let execute: crate::lane::ExecuteFn = Box::new(move || {
            Box::pin(async move {
                if token.is_cancelled() {
                    let _ = tracker
                        .mark_cancelled(&workflow_id, &task_id, "workflow cancelled")
                        .await;
                    let _ = done_tx.send(TaskStatus::Cancelled);
                    return TaskOutcome::Cancelled;
                }
                if tracker.mark_running(&workflow_id, &task_id).await.is_err() {
                    // Already swept to a terminal state while queued.
                    let _ = done_tx.send(TaskStatus::Cancelled);
                    return TaskOutcome::Cancelled;
                }

                let body = AssertUnwindSafe(handler(task_ctx)).catch_unwind();
                let run = async {
                    match timeout {
                        Some(deadline) => match tokio::time::timeout(deadline, body).await {
                            Ok(inner) => Run::Finished(inner),
                            Err(_) => Run::DeadlineExceeded,
                        },
                        None => Run::Finished(body.await),
                    }
                };
                let outcome = tokio::select! {
                    _ = token.cancelled() => Run::ContextCancelled,
                    outcome = run => outcome,
                };

                match outcome {
                    Run::Finished(Ok(Ok(value))) => {
                        let marked = tracker.mark_completed(&workflow_id, &task_id, value).await;
                        if let Err(err) = marked {
                            warn!(%workflow_id, %task_id, %err, "failed to persist completion");
                            let _ = tracker
                                .mark_failed(&workflow_id, &task_id, err.to_string())
                                .await;
                            let _ = done_tx.send(TaskStatus::Failed);
                            return TaskOutcome::Failed;
                        }
                        let _ = done_tx.send(TaskStatus::Completed);
                        TaskOutcome::Completed
                    }
                    Run::Finished(Ok(Err(err))) if err.is_cancelled() => {
                        let _ = tracker
                            .mark_cancelled(&workflow_id, &task_id, err.to_string())
                            .await;
                        let _ = done_tx.send(TaskStatus::Cancelled);
                        TaskOutcome::Cancelled
                    }
                    Run::Finished(Ok(Err(err))) => {
                        let _ = tracker
                            .mark_failed(&workflow_id, &task_id, err.to_string())
                            .await;
                        let _ = done_tx.send(TaskStatus::Failed);
                        TaskOutcome::Failed
                    }
                    Run::Finished(Err(panic)) => {
                        let message = panic_message(panic);
                        let _ = tracker
                            .mark_failed(&workflow_id, &task_id, format!("task panicked: {message}"))
                            .await;
                        let _ = done_tx.send(TaskStatus::Failed);
                        TaskOutcome::Failed
                    }
                    Run::DeadlineExceeded => {
                        let _ = tracker
                            .mark_cancelled(&workflow_id, &task_id, "task deadline exceeded")
                            .await;
                        let _ = done_tx.send(TaskStatus::Cancelled);
                        TaskOutcome::Cancelled
                    }
                    Run::ContextCancelled => {
                        let _ = tracker
                            .mark_cancelled(&workflow_id, &task_id, "workflow cancelled")
                            .await;
                        let _ = done_tx.send(TaskStatus::Cancelled);
                        TaskOutcome::Cancelled
                    }
                }
            })
        });

        LaneTask::new(
            lane_workflow_id,
            lane_task_id,
            spec.lane.clone(),
            spec.priority,
            execute,
        )
    }

    async fn terminal_status(&self, workflow_id: &str, task_id: &str) -> TaskStatus {
        match self.tracker.snapshot_task(workflow_id, task_id).await {
            Ok(task) if task.status.is_terminal() => task.status,
            _ => TaskStatus::Failed,
        }
    }

    /// First recorded failure message in a layer, for the workflow error.
    /// Falls back to a cancelled task's reason (timeout path).
    async fn first_failure(&self, workflow_id: &str, layer: &[String]) -> Option<String> {
        let mut cancelled_reason = None;
        for task_id in layer {
            if let Ok(task) = self.tracker.snapshot_task(workflow_id, task_id).await {
                match task.status {
                    TaskStatus::Failed => {
                        return Some(
                            task.error
                                .unwrap_or_else(|| format!("task {task_id} failed")),
                        );
                    }
                    TaskStatus::Cancelled if cancelled_reason.is_none() => {
                        cancelled_reason = Some(
                            task.error
                                .unwrap_or_else(|| format!("task {task_id} cancelled")),
                        );
                    }
                    _ => {}
                }
            }
        }
        cancelled_reason
    }

    /// Cancel tasks that are scheduled (queued) but not yet running.
    async fn cancel_waiting_tasks(&self, workflow_id: &str, layer: &[String]) {
        for task_id in layer {
            if let Ok(task) = self.tracker.snapshot_task(workflow_id, task_id).await {
                if matches!(task.status, TaskStatus::Pending | TaskStatus::Scheduled) {
                    let _ = self
                        .tracker
                        .mark_cancelled(workflow_id, task_id, "workflow cancelled")
                        .await;
                }
            }
        }
    }

    /// Force every non-terminal task in the layer to cancelled, including
    /// running ones that outlived the grace window.
    async fn force_cancel_tasks(&self, workflow_id: &str, layer: &[String]) {
        for task_id in layer {
            if let Ok(task) = self.tracker.snapshot_task(workflow_id, task_id).await {
                if !task.status.is_terminal() {
                    let _ = self
                        .tracker
                        .mark_cancelled(workflow_id, task_id, "cancelled after grace window")
                        .await;
                }
            }
        }
    }

    /// Cancel every not-yet-dispatched task of the remaining layers.
    async fn cancel_pending_layers(&self, workflow_id: &str, layers: &[Vec<String>]) {
        for layer in layers {
            for task_id in layer {
                let _ = self
                    .tracker
                    .mark_cancelled(workflow_id, task_id, "workflow failed fast")
                    .await;
            }
        }
    }

    async fn finish_cancelled(
        &self,
        workflow_id: &str,
        remaining_layers: &[Vec<String>],
    ) -> Result<WorkflowStatus> {
        for layer in remaining_layers {
            self.cancel_waiting_tasks(workflow_id, layer).await;
        }
        self.tracker
            .mark_workflow_terminal(
                workflow_id,
                WorkflowStatus::Cancelled,
                Some("workflow cancelled".to_string()),
            )
            .await?;
        Ok(WorkflowStatus::Cancelled)
    }
}

enum Run {
    Finished(std::result::Result<Result<serde_json::Value>, Box<dyn std::any::Any + Send>>),
    DeadlineExceeded,
    ContextCancelled,
}

fn retry_backoff(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    let base = RETRY_BACKOFF_BASE.saturating_mul(factor).min(RETRY_BACKOFF_CAP);
    // Spread retries out a little so simultaneous failures do not stampede.
    let jitter = rand::random::<u64>() % (base.as_millis().max(1) as u64 / 2 + 1);
    base + Duration::from_millis(jitter)
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_grows_and_caps() {
        let first = retry_backoff(1);
        assert!(first >= RETRY_BACKOFF_BASE);
        let late = retry_backoff(20);
        assert!(late <= RETRY_BACKOFF_CAP + RETRY_BACKOFF_CAP / 2 + Duration::from_millis(1));
    }

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("boom".to_string())), "boom");
        assert_eq!(panic_message(Box::new(42u32)), "unknown panic");
    }
}
