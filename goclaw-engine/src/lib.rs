//! Goclaw execution kernel.
//!
//! Compiles submitted workflow DAGs into layered execution plans, dispatches
//! tasks through bounded rate-limited lanes, tracks every state transition
//! (driving persistence, metrics, and streaming from one source), recovers
//! interrupted workflows on restart, and runs saga transactions with
//! WAL-checkpointed compensation.

pub mod broadcast;
pub mod dag;
pub mod engine;
pub mod lane;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod saga;
pub mod scheduler;
pub mod tracker;

pub use broadcast::EventBroadcaster;
pub use dag::{ExecutionPlan, TaskGraph};
pub use engine::{Engine, EngineState};
pub use lane::{Lane, LaneManager, LaneStats, LaneTask, TaskOutcome};
pub use manager::WorkflowManager;
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use registry::TaskHandlerRegistry;
pub use saga::{
    CompensationPolicy, SagaActionFn, SagaCompensationFn, SagaDefinition, SagaInstance,
    SagaOrchestrator, SagaState, SagaStep, SagaStepContext,
};
pub use scheduler::Scheduler;
pub use tracker::StateTracker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::engine::{Engine, EngineState};
    pub use crate::lane::{LaneManager, LaneStats, LaneTask, TaskOutcome};
    pub use crate::saga::{
        CompensationPolicy, SagaDefinition, SagaInstance, SagaState, SagaStep, SagaStepContext,
    };
    pub use goclaw_core::prelude::*;
}
