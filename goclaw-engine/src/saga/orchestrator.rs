//! Saga orchestrator: WAL-checkpointed forward execution and reverse-order
//! compensation.

use super::{
    CompensationPolicy, SagaDefinition, SagaInstance, SagaState, SagaStep, SagaStepContext,
};
use crate::broadcast::EventBroadcaster;
use crate::dag::TaskGraph;
use crate::lane::{LaneManager, LaneTask, TaskOutcome};
use crate::metrics::EngineMetrics;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use goclaw_core::config::SagaConfig;
use goclaw_core::events::SagaStateChanged;
use goclaw_core::{EventEnvelope, GoclawError, Result};
use goclaw_storage::{SagaWal, SagaWalEntry};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Upper bound for compensation backoff growth.
const COMPENSATION_BACKOFF_CAP: Duration = Duration::from_secs(30);

fn saga_transition_legal(from: SagaState, to: SagaState) -> bool {
    use SagaState::*;
    matches!(
        (from, to),
        (Created, Running)
            | (Created, PendingCompensation)
            | (Running, Completed)
            | (Running, Compensating)
            | (Running, PendingCompensation)
            | (PendingCompensation, Compensating)
            | (Compensating, Compensated)
            | (Compensating, CompensationFailed)
    )
}

enum ForwardResult {
    Done,
    Failed { policy: CompensationPolicy },
    Interrupted,
}

pub struct SagaOrchestrator {
    config: SagaConfig,
    wal: Arc<dyn SagaWal>,
    lanes: Arc<LaneManager>,
    broadcaster: Arc<EventBroadcaster>,
    metrics: Arc<EngineMetrics>,
    root: CancellationToken,
    sagas: DashMap<String, Arc<RwLock<SagaInstance>>>,
    /// Definitions by saga name, used to re-bind closures at recovery
    definitions: DashMap<String, Arc<SagaDefinition>>,
    /// Live definitions by saga ID
    active_definitions: DashMap<String, Arc<SagaDefinition>>,
    tokens: DashMap<String, CancellationToken>,
    self_ref: OnceLock<Weak<SagaOrchestrator>>,
}

impl SagaOrchestrator {
    pub fn new(
        config: SagaConfig,
        wal: Arc<dyn SagaWal>,
        lanes: Arc<LaneManager>,
        broadcaster: Arc<EventBroadcaster>,
        metrics: Arc<EngineMetrics>,
        root: CancellationToken,
    ) -> Arc<Self> {
        let orchestrator = Arc::new(Self {
            config,
            wal,
            lanes,
            broadcaster,
            metrics,
            root,
            sagas: DashMap::new(),
            definitions: DashMap::new(),
            active_definitions: DashMap::new(),
            tokens: DashMap::new(),
            self_ref: OnceLock::new(),
        });
        let _ = orchestrator.self_ref.set(Arc::downgrade(&orchestrator));
        orchestrator
    }

    fn strong(&self) -> Option<Arc<Self>> {
        self.self_ref.get().and_then(Weak::upgrade)
    }

    /// Register a definition for WAL recovery re-binding, keyed by name.
    pub fn register_definition(&self, definition: SagaDefinition) {
        self.definitions
            .insert(definition.name.clone(), Arc::new(definition));
    }

    /// Validate and start a saga. Returns its ID once the creation record is
    /// durable; execution proceeds in the background.
    pub async fn submit(&self, definition: SagaDefinition) -> Result<String> {
        let plan_graph = step_graph(&definition.steps)?;
        plan_graph.compile()?;

        let saga_id = definition
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.sagas.contains_key(&saga_id) {
            return Err(GoclawError::conflict(format!("saga {saga_id} already exists")));
        }

        let instance = SagaInstance::new(saga_id.clone(), definition.name.clone());
        self.wal
            .append(
                &saga_id,
                SagaWalEntry::Created {
                    name: definition.name.clone(),
                    step_ids: definition.steps.iter().map(|s| s.id.clone()).collect(),
                },
            )
            .await?;

        let definition = Arc::new(definition);
        self.sagas
            .insert(saga_id.clone(), Arc::new(RwLock::new(instance)));
        self.active_definitions
            .insert(saga_id.clone(), definition.clone());
        self.definitions
            .entry(definition.name.clone())
            .or_insert_with(|| definition.clone());
        info!(%saga_id, name = %definition.name, steps = definition.steps.len(), "saga submitted");

        self.spawn_forward(saga_id.clone(), definition);
        Ok(saga_id)
    }

    pub async fn get(&self, saga_id: &str) -> Result<SagaInstance> {
        let entry = self
            .sagas
            .get(saga_id)
            .ok_or_else(|| GoclawError::not_found("saga", saga_id))?
            .clone();
        let instance = entry.read().await;
        Ok(instance.clone())
    }

    pub async fn list(&self) -> Vec<SagaInstance> {
        let mut out = Vec::with_capacity(self.sagas.len());
        let entries: Vec<_> = self.sagas.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            out.push(entry.read().await.clone());
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    /// Manually trigger compensation: legal from pending-compensation, or
    /// for a running saga (which is interrupted first). Terminal sagas
    /// conflict; unknown sagas are NotFound.
    pub async fn compensate(&self, saga_id: &str) -> Result<()> {
        let state = self.get(saga_id).await?.state;
        match state {
            SagaState::PendingCompensation => {
                let definition = self
                    .active_definitions
                    .get(saga_id)
                    .map(|d| d.clone())
                    .ok_or_else(|| {
                        GoclawError::conflict(format!("saga {saga_id} has no bound definition"))
                    })?;
                self.spawn_compensation(saga_id.to_string(), definition);
                Ok(())
            }
            SagaState::Running | SagaState::Created => {
                // Interrupt forward execution; its exit path compensates.
                if let Some(token) = self.tokens.get(saga_id) {
                    token.cancel();
                }
                Ok(())
            }
            terminal => Err(GoclawError::conflict(format!(
                "saga {saga_id} is {terminal} and cannot be compensated"
            ))),
        }
    }

    /// Rebuild one saga from its WAL and resume whatever was in flight.
    pub async fn recover_saga(&self, saga_id: &str) -> Result<()> {
        let records = self.wal.replay(saga_id).await?;
        if records.is_empty() {
            return Err(GoclawError::not_found("saga", saga_id));
        }

        let mut name = String::new();
        let mut instance = SagaInstance::new(saga_id.to_string(), String::new());
        for record in &records {
            match &record.entry {
                SagaWalEntry::Created { name: n, .. } => {
                    name = n.clone();
                    instance.name = n.clone();
                    instance.created_at = record.timestamp;
                }
                SagaWalEntry::StateChanged { new_state, .. } => {
                    if let Some(state) = parse_state(new_state) {
                        instance.state = state;
                    }
                }
                SagaWalEntry::StepCompleted { step_id, result } => {
                    if !instance.completed_steps.contains(step_id) {
                        instance.completed_steps.push(step_id.clone());
                    }
                    instance.step_results.insert(step_id.clone(), result.clone());
                }
                SagaWalEntry::StepFailed { step_id, .. } => {
                    instance.failed_step = Some(step_id.clone());
                }
                SagaWalEntry::StepCompensated {
                    step_id,
                    idempotency_key,
                } => {
                    if !instance.compensated_steps.contains(step_id) {
                        instance.compensated_steps.push(step_id.clone());
                    }
                    if let Some(key) = idempotency_key {
                        if !instance.compensation_keys.contains(key) {
                            instance.compensation_keys.push(key.clone());
                        }
                    }
                }
                SagaWalEntry::CompensationFailed { .. } => {}
                SagaWalEntry::Checkpoint { completed_steps } => {
                    for step_id in completed_steps {
                        if !instance.completed_steps.contains(step_id) {
                            instance.completed_steps.push(step_id.clone());
                        }
                    }
                }
            }
            instance.updated_at = record.timestamp;
        }

        let state = instance.state;
        self.sagas
            .insert(saga_id.to_string(), Arc::new(RwLock::new(instance)));

        if state.is_terminal() {
            return Ok(());
        }
        let Some(definition) = self.definitions.get(&name).map(|d| d.clone()) else {
            warn!(saga_id, %name, "no registered definition, saga left as found");
            return Ok(());
        };
        self.active_definitions
            .insert(saga_id.to_string(), definition.clone());

        match state {
            SagaState::Created | SagaState::Running => {
                info!(saga_id, "resuming saga forward execution");
                self.spawn_forward(saga_id.to_string(), definition);
            }
            SagaState::Compensating => {
                info!(saga_id, "resuming saga compensation");
                self.spawn_compensation(saga_id.to_string(), definition);
            }
            SagaState::PendingCompensation => {}
            _ => {}
        }
        Ok(())
    }

    /// Scan the WAL for every saga and recover each, best-effort.
    pub async fn recover(&self) -> Result<()> {
        for saga_id in self.wal.list_sagas().await? {
            if let Err(err) = self.recover_saga(&saga_id).await {
                warn!(%saga_id, %err, "skipping saga during recovery");
            }
        }
        Ok(())
    }

    /// Periodically prune WAL records of terminal sagas past retention.
    pub fn start_wal_cleanup(&self) {
        let Some(this) = self.strong() else { return };
        let interval = self.config.wal_cleanup_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.root.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(err) = this.cleanup_expired().await {
                    warn!(%err, "saga WAL cleanup failed");
                }
            }
        });
    }

    async fn cleanup_expired(&self) -> Result<()> {
        let retention = chrono::Duration::from_std(self.config.wal_retention())
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let cutoff = Utc::now() - retention;
        let entries: Vec<(String, Arc<RwLock<SagaInstance>>)> = self
            .sagas
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (saga_id, entry) in entries {
            let instance = entry.read().await;
            if instance.state.is_terminal() && instance.updated_at < cutoff {
                drop(instance);
                self.wal.prune(&saga_id).await?;
                self.sagas.remove(&saga_id);
                self.active_definitions.remove(&saga_id);
                debug!(%saga_id, "pruned terminal saga past retention");
            }
        }
        Ok(())
    }

    // -- Execution --------------------------------------------------------

    fn spawn_forward(&self, saga_id: String, definition: Arc<SagaDefinition>) {
        let Some(this) = self.strong() else { return };
        tokio::spawn(async move {
            if let Err(err) = this.run_forward(&saga_id, definition).await {
                error!(%saga_id, %err, "saga execution error");
            }
        });
    }

    fn spawn_compensation(&self, saga_id: String, definition: Arc<SagaDefinition>) {
        let Some(this) = self.strong() else { return };
        tokio::spawn(async move {
            if let Err(err) = this.run_compensation(&saga_id, definition).await {
                error!(%saga_id, %err, "saga compensation error");
            }
        });
    }

    async fn run_forward(&self, saga_id: &str, definition: Arc<SagaDefinition>) -> Result<()> {
        let token = self.root.child_token();
        self.tokens.insert(saga_id.to_string(), token.clone());
        self.set_state(saga_id, SagaState::Running).await?;

        let layers = step_graph(&definition.steps)?.compile()?.layers;
        let forward = self.walk_layers(saga_id, &definition, &layers, &token);
        let result = match definition.timeout {
            Some(deadline) => match tokio::time::timeout(deadline, forward).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(saga_id, "saga timed out, cancelling running steps");
                    token.cancel();
                    ForwardResult::Interrupted
                }
            },
            None => forward.await,
        };

        match result {
            ForwardResult::Done => {
                self.set_state(saga_id, SagaState::Completed).await?;
                self.tokens.remove(saga_id);
                Ok(())
            }
            ForwardResult::Failed {
                policy: CompensationPolicy::Manual,
            } => {
                self.set_state(saga_id, SagaState::PendingCompensation).await?;
                self.tokens.remove(saga_id);
                Ok(())
            }
            ForwardResult::Failed { .. } | ForwardResult::Interrupted => {
                self.tokens.remove(saga_id);
                self.run_compensation(saga_id, definition).await
            }
        }
    }

    async fn walk_layers(
        &self,
        saga_id: &str,
        definition: &Arc<SagaDefinition>,
        layers: &[Vec<String>],
        token: &CancellationToken,
    ) -> ForwardResult {
        let steps_by_id: HashMap<&str, &SagaStep> = definition
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s))
            .collect();

        for layer in layers {
            if token.is_cancelled() {
                return ForwardResult::Interrupted;
            }

            let (already_done, results) = {
                let entry = self.sagas.get(saga_id).map(|e| e.clone());
                let Some(entry) = entry else {
                    return ForwardResult::Interrupted;
                };
                let instance = entry.read().await;
                (
                    instance
                        .completed_steps
                        .iter()
                        .cloned()
                        .collect::<HashSet<_>>(),
                    instance.step_results.clone(),
                )
            };

            let pending: Vec<&SagaStep> = layer
                .iter()
                .filter(|id| !already_done.contains(*id))
                .map(|id| steps_by_id[id.as_str()])
                .collect();
            if pending.is_empty() {
                continue;
            }

            let executions = pending.iter().map(|step| {
                self.execute_step(saga_id, step, results.clone(), token.clone())
            });
            let outcomes: Vec<(String, Result<serde_json::Value>)> =
                join_all(executions).await;

            // Record successes first so dependents and compensation both see
            // every completed step.
            let mut failure: Option<(&SagaStep, GoclawError)> = None;
            for (step_id, outcome) in outcomes {
                match outcome {
                    Ok(value) => {
                        if let Err(err) = self.record_step_completed(saga_id, &step_id, value).await
                        {
                            failure = Some((steps_by_id[step_id.as_str()], err));
                        }
                    }
                    Err(err) => {
                        let _ = self
                            .wal
                            .append(
                                saga_id,
                                SagaWalEntry::StepFailed {
                                    step_id: step_id.clone(),
                                    error: err.to_string(),
                                },
                            )
                            .await;
                        let entry = self.sagas.get(saga_id).map(|e| e.clone());
                        if let Some(entry) = entry {
                            let mut instance = entry.write().await;
                            instance.failed_step = Some(step_id.clone());
                            instance.updated_at = Utc::now();
                        }
                        if failure.is_none() {
                            failure = Some((steps_by_id[step_id.as_str()], err));
                        }
                    }
                }
            }

            if let Some((step, err)) = failure {
                warn!(saga_id, step_id = %step.id, %err, "saga step failed");
                return ForwardResult::Failed {
                    policy: step.policy,
                };
            }
        }
        ForwardResult::Done
    }

    /// Run one step through the lane path, honoring its timeout.
    async fn execute_step(
        &self,
        saga_id: &str,
        step: &SagaStep,
        results: HashMap<String, serde_json::Value>,
        token: CancellationToken,
    ) -> (String, Result<serde_json::Value>) {
        let (done_tx, done_rx) = oneshot::channel::<Result<serde_json::Value>>();
        let action = step.action.clone();
        let ctx = SagaStepContext {
            saga_id: saga_id.to_string(),
            step_id: step.id.clone(),
            results,
            cancellation: token.clone(),
        };
        let timeout = step.timeout;
        let step_token = token.clone();

        let execute: crate::lane::ExecuteFn = Box::new(move || {
            Box::pin(async move {
                let body = AssertUnwindSafe(action(ctx)).catch_unwind();
                let run = async {
                    match timeout {
                        Some(deadline) => match tokio::time::timeout(deadline, body).await {
                            Ok(inner) => inner,
                            Err(_) => Ok(Err(GoclawError::timeout("saga step deadline exceeded"))),
                        },
                        None => body.await,
                    }
                };
                let outcome = tokio::select! {
                    _ = step_token.cancelled() => Ok(Err(GoclawError::cancelled("saga cancelled"))),
                    outcome = run => outcome,
                };
                match outcome {
                    Ok(Ok(value)) => {
                        let _ = done_tx.send(Ok(value));
                        TaskOutcome::Completed
                    }
                    Ok(Err(err)) => {
                        let cancelled = err.is_cancelled();
                        let _ = done_tx.send(Err(err));
                        if cancelled {
                            TaskOutcome::Cancelled
                        } else {
                            TaskOutcome::Failed
                        }
                    }
                    Err(panic) => {
                        let message = if let Some(s) = panic.downcast_ref::<&str>() {
                            (*s).to_string()
                        } else if let Some(s) = panic.downcast_ref::<String>() {
                            s.clone()
                        } else {
                            "unknown panic".to_string()
                        };
                        let _ = done_tx.send(Err(GoclawError::internal(format!(
                            "saga step panicked: {message}"
                        ))));
                        TaskOutcome::Failed
                    }
                }
            })
        });

        let lane_task = LaneTask::new(
            format!("saga:{saga_id}"),
            step.id.clone(),
            step.lane.clone(),
            0,
            execute,
        );
        let outcome = match self.lanes.submit(&token, lane_task).await {
            Ok(()) => done_rx
                .await
                .unwrap_or_else(|_| Err(GoclawError::internal("saga step abandoned"))),
            Err(err) => Err(err),
        };
        (step.id.clone(), outcome)
    }

    async fn record_step_completed(
        &self,
        saga_id: &str,
        step_id: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        self.wal
            .append(
                saga_id,
                SagaWalEntry::StepCompleted {
                    step_id: step_id.to_string(),
                    result: value.clone(),
                },
            )
            .await?;
        let entry = self
            .sagas
            .get(saga_id)
            .map(|e| e.clone())
            .ok_or_else(|| GoclawError::not_found("saga", saga_id))?;
        let completed = {
            let mut instance = entry.write().await;
            instance.completed_steps.push(step_id.to_string());
            instance
                .step_results
                .insert(step_id.to_string(), value);
            instance.updated_at = Utc::now();
            instance.completed_steps.clone()
        };
        self.wal
            .append(
                saga_id,
                SagaWalEntry::Checkpoint {
                    completed_steps: completed,
                },
            )
            .await?;
        debug!(saga_id, step_id, "saga step completed");
        Ok(())
    }

    // -- Compensation -----------------------------------------------------

    async fn run_compensation(
        &self,
        saga_id: &str,
        definition: Arc<SagaDefinition>,
    ) -> Result<()> {
        self.set_state(saga_id, SagaState::Compensating).await?;

        let steps_by_id: HashMap<&str, &SagaStep> = definition
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s))
            .collect();
        let layers = step_graph(&definition.steps)?.compile()?.layers;

        let entry = self
            .sagas
            .get(saga_id)
            .map(|e| e.clone())
            .ok_or_else(|| GoclawError::not_found("saga", saga_id))?;
        let (completed, already_compensated) = {
            let instance = entry.read().await;
            (
                instance.completed_steps.iter().cloned().collect::<HashSet<_>>(),
                instance
                    .compensated_steps
                    .iter()
                    .cloned()
                    .collect::<HashSet<_>>(),
            )
        };

        // Reverse topological order of completion; steps that completed in
        // the same layer compensate in parallel.
        for layer in layers.iter().rev() {
            let targets: Vec<&SagaStep> = layer
                .iter()
                .filter(|id| completed.contains(*id) && !already_compensated.contains(*id))
                .map(|id| steps_by_id[id.as_str()])
                .collect();
            if targets.is_empty() {
                continue;
            }

            let compensations = targets
                .iter()
                .map(|step| self.compensate_step(saga_id, step, &entry));
            let results: Vec<Result<()>> = join_all(compensations).await;
            if let Some(err) = results.into_iter().find_map(|r| r.err()) {
                error!(saga_id, %err, "compensation exhausted retries");
                self.set_state(saga_id, SagaState::CompensationFailed).await?;
                return Ok(());
            }
        }

        self.set_state(saga_id, SagaState::Compensated).await?;
        Ok(())
    }

    async fn compensate_step(
        &self,
        saga_id: &str,
        step: &SagaStep,
        entry: &Arc<RwLock<SagaInstance>>,
    ) -> Result<()> {
        // Idempotency: a key that already produced an effect is a no-op.
        if let Some(key) = &step.idempotency_key {
            let already_applied = {
                let instance = entry.read().await;
                instance.compensation_keys.contains(key)
            };
            if already_applied {
                debug!(saga_id, step_id = %step.id, "compensation key already applied");
                return self.record_step_compensated(saga_id, step, entry).await;
            }
        }

        // Steps without a compensation function, or with Skip policy, are
        // recorded as handled without invocation.
        let compensation = match &step.compensation {
            Some(f) if step.policy != CompensationPolicy::Skip => f.clone(),
            _ => return self.record_step_compensated(saga_id, step, entry).await,
        };

        let results = entry.read().await.step_results.clone();
        let mut backoff = self.config.initial_backoff();
        let mut last_error: Option<GoclawError> = None;

        for attempt in 0..=self.config.max_retries {
            let ctx = SagaStepContext {
                saga_id: saga_id.to_string(),
                step_id: step.id.clone(),
                results: results.clone(),
                cancellation: self.root.child_token(),
            };
            match AssertUnwindSafe(compensation(ctx)).catch_unwind().await {
                Ok(Ok(())) => {
                    return self.record_step_compensated(saga_id, step, entry).await;
                }
                Ok(Err(err)) => {
                    warn!(saga_id, step_id = %step.id, attempt, %err, "compensation attempt failed");
                    last_error = Some(err);
                }
                Err(_) => {
                    warn!(saga_id, step_id = %step.id, attempt, "compensation panicked");
                    last_error = Some(GoclawError::internal("compensation panicked"));
                }
            }
            if attempt < self.config.max_retries {
                tokio::time::sleep(backoff).await;
                let scaled = backoff.as_millis() as f64 * self.config.backoff_factor;
                backoff = Duration::from_millis(scaled as u64).min(COMPENSATION_BACKOFF_CAP);
            }
        }

        let error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "compensation failed".to_string());
        self.wal
            .append(
                saga_id,
                SagaWalEntry::CompensationFailed {
                    step_id: step.id.clone(),
                    error: error.clone(),
                },
            )
            .await?;
        Err(GoclawError::internal(format!(
            "compensation for step {} failed: {error}",
            step.id
        )))
    }

    async fn record_step_compensated(
        &self,
        saga_id: &str,
        step: &SagaStep,
        entry: &Arc<RwLock<SagaInstance>>,
    ) -> Result<()> {
        self.wal
            .append(
                saga_id,
                SagaWalEntry::StepCompensated {
                    step_id: step.id.clone(),
                    idempotency_key: step.idempotency_key.clone(),
                },
            )
            .await?;
        let mut instance = entry.write().await;
        if !instance.compensated_steps.contains(&step.id) {
            instance.compensated_steps.push(step.id.clone());
        }
        if let Some(key) = &step.idempotency_key {
            if !instance.compensation_keys.contains(key) {
                instance.compensation_keys.push(key.clone());
            }
        }
        instance.updated_at = Utc::now();
        Ok(())
    }

    // -- State ------------------------------------------------------------

    /// Persist and apply one state transition. Same-state is a no-op.
    async fn set_state(&self, saga_id: &str, to: SagaState) -> Result<()> {
        let entry = self
            .sagas
            .get(saga_id)
            .map(|e| e.clone())
            .ok_or_else(|| GoclawError::not_found("saga", saga_id))?;
        let mut instance = entry.write().await;
        let from = instance.state;
        if from == to {
            return Ok(());
        }
        if !saga_transition_legal(from, to) {
            return Err(GoclawError::conflict(format!(
                "illegal saga transition {from} -> {to} for {saga_id}"
            )));
        }

        // WAL first: the transition exists once the record does.
        self.wal
            .append(
                saga_id,
                SagaWalEntry::StateChanged {
                    old_state: from.as_str().to_string(),
                    new_state: to.as_str().to_string(),
                },
            )
            .await?;
        instance.state = to;
        instance.updated_at = Utc::now();
        let name = instance.name.clone();
        drop(instance);

        if to.is_terminal() {
            self.metrics.record_saga_terminal(to.as_str());
        }
        self.broadcaster.publish(EventEnvelope::saga(SagaStateChanged {
            saga_id: saga_id.to_string(),
            name,
            old_state: from.as_str().to_string(),
            new_state: to.as_str().to_string(),
        }));
        info!(saga_id, %from, %to, "saga transition");
        Ok(())
    }
}

fn step_graph(steps: &[SagaStep]) -> Result<TaskGraph> {
    let mut graph = TaskGraph::new();
    for step in steps {
        graph.add_node(&step.id)?;
    }
    for step in steps {
        for dep in &step.dependencies {
            graph.add_edge(dep, &step.id)?;
        }
    }
    Ok(graph)
}

fn parse_state(s: &str) -> Option<SagaState> {
    match s {
        "created" => Some(SagaState::Created),
        "running" => Some(SagaState::Running),
        "completed" => Some(SagaState::Completed),
        "compensating" => Some(SagaState::Compensating),
        "compensated" => Some(SagaState::Compensated),
        "compensation-failed" => Some(SagaState::CompensationFailed),
        "pending-compensation" => Some(SagaState::PendingCompensation),
        _ => None,
    }
}
