//! Saga transactions: ordered steps with reverse-order compensation.

mod orchestrator;

pub use orchestrator::SagaOrchestrator;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use goclaw_core::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Saga lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SagaState {
    Created,
    Running,
    Completed,
    Compensating,
    Compensated,
    CompensationFailed,
    PendingCompensation,
}

impl SagaState {
    /// Terminal sagas are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Compensated | Self::CompensationFailed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
            Self::CompensationFailed => "compensation-failed",
            Self::PendingCompensation => "pending-compensation",
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a step participates in compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompensationPolicy {
    /// Failure of this step starts compensation automatically
    Auto,
    /// Failure of this step parks the saga in pending-compensation
    Manual,
    /// This step is skipped during the compensation sweep
    Skip,
}

/// Context handed to step actions and compensations.
#[derive(Clone)]
pub struct SagaStepContext {
    pub saga_id: String,
    pub step_id: String,
    /// Results of completed dependency steps
    pub results: HashMap<String, serde_json::Value>,
    pub cancellation: CancellationToken,
}

pub type SagaActionFn =
    Arc<dyn Fn(SagaStepContext) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;
pub type SagaCompensationFn =
    Arc<dyn Fn(SagaStepContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// One saga step: an action, an optional compensation, and scheduling hints.
#[derive(Clone)]
pub struct SagaStep {
    pub id: String,
    pub name: String,
    pub dependencies: Vec<String>,
    pub action: SagaActionFn,
    pub compensation: Option<SagaCompensationFn>,
    pub timeout: Option<Duration>,
    pub policy: CompensationPolicy,
    pub idempotency_key: Option<String>,
    /// Lane the step executes on
    pub lane: String,
}

impl SagaStep {
    pub fn new(id: impl Into<String>, name: impl Into<String>, action: SagaActionFn) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            dependencies: Vec::new(),
            action,
            compensation: None,
            timeout: None,
            policy: CompensationPolicy::Auto,
            idempotency_key: None,
            lane: "default".to_string(),
        }
    }

    pub fn with_compensation(mut self, compensation: SagaCompensationFn) -> Self {
        self.compensation = Some(compensation);
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_policy(mut self, policy: CompensationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = lane.into();
        self
    }
}

/// A saga definition: ordered steps with optional DAG dependencies.
#[derive(Clone)]
pub struct SagaDefinition {
    /// Explicit ID; generated when absent
    pub id: Option<String>,
    pub name: String,
    pub steps: Vec<SagaStep>,
    /// Overall deadline; expiry cancels running steps and compensates
    pub timeout: Option<Duration>,
}

impl SagaDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<SagaStep>) -> Self {
        Self {
            id: None,
            name: name.into(),
            steps,
            timeout: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Runtime state of one saga, exposed by the status API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaInstance {
    pub id: String,
    pub name: String,
    pub state: SagaState,
    /// Step IDs in completion order
    pub completed_steps: Vec<String>,
    pub compensated_steps: Vec<String>,
    pub failed_step: Option<String>,
    pub step_results: HashMap<String, serde_json::Value>,
    /// Idempotency keys of compensations that already took effect
    #[serde(default)]
    pub compensation_keys: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaInstance {
    pub(crate) fn new(id: String, name: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            state: SagaState::Created,
            completed_steps: Vec::new(),
            compensated_steps: Vec::new(),
            failed_step: None,
            step_results: HashMap::new(),
            compensation_keys: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}
