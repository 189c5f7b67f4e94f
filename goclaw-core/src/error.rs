//! Error types for the Goclaw engine.

/// Result type alias for Goclaw operations.
pub type Result<T> = std::result::Result<T, GoclawError>;

/// Main error type for the Goclaw engine.
#[derive(Debug, thiserror::Error)]
pub enum GoclawError {
    /// Request validation errors with field detail
    #[error("Validation error: {field}: {message}")]
    Validation { field: String, message: String },

    /// Not found errors
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Duplicate task ID inside a workflow graph
    #[error("Duplicate task: {0}")]
    DuplicateTask(String),

    /// Dependency edge referencing an unknown task
    #[error("Dependency not found: task {task_id} depends on unknown {dependency_id}")]
    DependencyNotFound {
        task_id: String,
        dependency_id: String,
    },

    /// Cyclic dependency with the concrete cycle path
    #[error("Cyclic dependency: {}", path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    /// Illegal state transition or operation on a terminal resource
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Engine not running / already running
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Rate limiter refused admission
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Lane refused a submission before queuing
    #[error("Lane {lane} rejected submission: {reason}")]
    Rejected { lane: String, reason: String },

    /// Lane discarded a submission under Drop backpressure
    #[error("Lane {lane} dropped submission: queue full")]
    Dropped { lane: String },

    /// Storage backend unavailable or failing
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Operation was cancelled
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Wrapped anyhow errors for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GoclawError {
    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new not found error
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create a new conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a new lifecycle error
    pub fn lifecycle(msg: impl Into<String>) -> Self {
        Self::Lifecycle(msg.into())
    }

    /// Create a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::StorageUnavailable(msg.into())
    }

    /// Create a new serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new cancelled error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this is a conflict error
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Check if this is a cancellation-derived error
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_) | Self::Timeout(_))
    }

    /// Check if this is a lane admission refusal
    pub fn is_admission_failure(&self) -> bool {
        matches!(
            self,
            Self::Rejected { .. } | Self::Dropped { .. } | Self::RateLimited(_)
        )
    }

    /// Check if a retry could succeed for this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Rejected { .. }
                | Self::Dropped { .. }
                | Self::RateLimited(_)
                | Self::StorageUnavailable(_)
                | Self::Internal(_)
        )
    }
}

impl From<serde_json::Error> for GoclawError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
