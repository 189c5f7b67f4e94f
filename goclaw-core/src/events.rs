//! Lifecycle event envelopes streamed to subscribers.
//!
//! Every transition recorded by the state tracker (and the saga
//! orchestrator) is published as one envelope. Delivery per workflow
//! preserves transition order; global ordering across workflows is
//! unspecified.

use crate::types::{TaskStatus, WorkflowStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "workflow.state_changed")]
    WorkflowStateChanged,
    #[serde(rename = "task.state_changed")]
    TaskStateChanged,
    #[serde(rename = "saga.state_changed")]
    SagaStateChanged,
}

/// Per-event envelope: `{type, timestamp, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Workflow(WorkflowStateChanged),
    Task(TaskStateChanged),
    Saga(SagaStateChanged),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStateChanged {
    pub workflow_id: String,
    pub name: String,
    pub old_state: WorkflowStatus,
    pub new_state: WorkflowStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStateChanged {
    pub workflow_id: String,
    pub task_id: String,
    pub task_name: String,
    pub old_state: TaskStatus,
    pub new_state: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStateChanged {
    pub saga_id: String,
    pub name: String,
    pub old_state: String,
    pub new_state: String,
}

impl EventEnvelope {
    pub fn workflow(payload: WorkflowStateChanged) -> Self {
        Self {
            kind: EventKind::WorkflowStateChanged,
            timestamp: Utc::now(),
            payload: EventPayload::Workflow(payload),
        }
    }

    pub fn task(payload: TaskStateChanged) -> Self {
        Self {
            kind: EventKind::TaskStateChanged,
            timestamp: Utc::now(),
            payload: EventPayload::Task(payload),
        }
    }

    pub fn saga(payload: SagaStateChanged) -> Self {
        Self {
            kind: EventKind::SagaStateChanged,
            timestamp: Utc::now(),
            payload: EventPayload::Saga(payload),
        }
    }

    /// Workflow ID this event is scoped to, if any.
    pub fn workflow_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Workflow(p) => Some(&p.workflow_id),
            EventPayload::Task(p) => Some(&p.workflow_id),
            EventPayload::Saga(_) => None,
        }
    }

    /// Whether this event records a terminal transition for its scope.
    pub fn is_terminal(&self) -> bool {
        match &self.payload {
            EventPayload::Workflow(p) => p.new_state.is_terminal(),
            EventPayload::Task(p) => p.new_state.is_terminal(),
            EventPayload::Saga(p) => matches!(
                p.new_state.as_str(),
                "completed" | "compensated" | "compensation-failed"
            ),
        }
    }
}
