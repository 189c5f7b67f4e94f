//! Core data model: workflows, tasks, statuses, and submission types.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Maximum workflow name length accepted at submission.
pub const MAX_NAME_LEN: usize = 100;
/// Maximum workflow description length accepted at submission.
pub const MAX_DESCRIPTION_LEN: usize = 500;
/// Maximum page size for list queries.
pub const MAX_LIST_LIMIT: usize = 100;

/// Workflow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal statuses are frozen: no further transitions are legal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = crate::error::GoclawError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(crate::error::GoclawError::validation(
                "status",
                format!("unknown workflow status '{s}'"),
            )),
        }
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Execution context handed to a task function.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Owning workflow ID
    pub workflow_id: String,
    /// Task ID within the workflow
    pub task_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    /// Task metadata as declared at submission
    pub metadata: HashMap<String, String>,
    /// Cancellation token derived from the workflow context
    pub cancellation: CancellationToken,
}

/// Executable task function: an async closure producing an opaque result payload.
pub type TaskFn =
    Arc<dyn Fn(TaskContext) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

/// Task definition: a DAG node as declared by the client.
#[derive(Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique within the workflow
    pub id: String,
    pub name: String,
    /// Lane routing key
    #[serde(default = "default_lane")]
    pub lane: String,
    /// IDs of tasks that must be terminal-completed first
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Optional per-task execution deadline
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Additional attempts after the first failure
    #[serde(default)]
    pub retries: u32,
    /// Lane ordering priority; higher dequeues first
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_lane() -> String {
    "default".to_string()
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("lane", &self.lane)
            .field("dependencies", &self.dependencies)
            .field("retries", &self.retries)
            .field("priority", &self.priority)
            .finish()
    }
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            lane: default_lane(),
            dependencies: Vec::new(),
            timeout: None,
            retries: 0,
            priority: 0,
            metadata: HashMap::new(),
        }
    }

    pub fn with_lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = lane.into();
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

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Per-task runtime state, persisted at every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    /// Opaque payload produced by a completed task
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// 1-based attempt number
    #[serde(default = "default_attempt")]
    pub attempt: u32,
}

fn default_attempt() -> u32 {
    1
}

impl TaskState {
    pub fn pending(spec: &TaskSpec) -> Self {
        Self {
            id: spec.id.clone(),
            name: spec.name.clone(),
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
            attempt: 1,
        }
    }
}

/// Workflow state: the persisted record owned by the workflow manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: WorkflowStatus,
    /// Task definitions as submitted
    pub tasks: Vec<TaskSpec>,
    /// Task ID -> runtime state
    pub task_status: HashMap<String, TaskState>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkflowState {
    /// Create a new pending workflow from submitted task specs.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        tasks: Vec<TaskSpec>,
        metadata: HashMap<String, String>,
    ) -> Self {
        let task_status = tasks
            .iter()
            .map(|t| (t.id.clone(), TaskState::pending(t)))
            .collect();
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            status: WorkflowStatus::Pending,
            tasks,
            task_status,
            metadata,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskState> {
        self.task_status.get(task_id)
    }
}

/// Filter for workflow list queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowFilter {
    /// Restrict to these statuses; empty means all
    #[serde(default)]
    pub statuses: Vec<WorkflowStatus>,
    /// Page size, clamped to [1, 100]
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl WorkflowFilter {
    pub fn matches(&self, status: WorkflowStatus) -> bool {
        self.statuses.is_empty() || self.statuses.contains(&status)
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(MAX_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }
}

/// Client-facing workflow submission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitWorkflowRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// When set, return as soon as the workflow is persisted as pending
    #[serde(default, rename = "async")]
    pub async_mode: bool,
}

/// Response to a workflow submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitWorkflowResponse {
    pub workflow_id: String,
    pub status: WorkflowStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::Pending.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());

        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Scheduled.is_terminal());
    }

    #[test]
    fn test_status_round_trip() {
        let s: WorkflowStatus = "failed".parse().unwrap();
        assert_eq!(s, WorkflowStatus::Failed);
        assert!("bogus".parse::<WorkflowStatus>().is_err());
    }

    #[test]
    fn test_task_state_serializes_canonical_timestamp_names() {
        let mut state = TaskState::pending(&TaskSpec::new("a", "A"));
        state.started_at = Some(Utc::now());
        state.completed_at = Some(Utc::now());
        let json = serde_json::to_value(&state).unwrap();
        assert!(json.get("started_at").is_some());
        assert!(json.get("completed_at").is_some());
    }

    #[test]
    fn test_workflow_state_seeds_pending_tasks() {
        let tasks = vec![TaskSpec::new("a", "A"), TaskSpec::new("b", "B")];
        let wf = WorkflowState::new("wf-1", "test", "", tasks, HashMap::new());
        assert_eq!(wf.status, WorkflowStatus::Pending);
        assert_eq!(wf.task_status.len(), 2);
        assert_eq!(wf.task("a").unwrap().status, TaskStatus::Pending);
        assert_eq!(wf.task("a").unwrap().attempt, 1);
    }

    #[test]
    fn test_filter_defaults_match_everything() {
        let filter = WorkflowFilter::default();
        assert!(filter.matches(WorkflowStatus::Running));
        assert_eq!(filter.effective_limit(), MAX_LIST_LIMIT);

        let filter = WorkflowFilter {
            statuses: vec![WorkflowStatus::Pending],
            limit: Some(500),
            offset: 0,
        };
        assert!(!filter.matches(WorkflowStatus::Running));
        assert_eq!(filter.effective_limit(), MAX_LIST_LIMIT);
    }
}
