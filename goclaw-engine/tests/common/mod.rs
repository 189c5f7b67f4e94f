#![allow(dead_code)]

//! Shared helpers for engine integration tests.

use goclaw_core::config::{GoclawConfig, LaneConfig};
use goclaw_core::{TaskFn, WorkflowState, WorkflowStatus};
use goclaw_engine::Engine;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Engine config with in-memory storage and a small default lane.
pub fn test_config() -> GoclawConfig {
    let mut config = GoclawConfig::default();
    config.lanes = vec![LaneConfig {
        name: "default".into(),
        capacity: 16,
        max_concurrency: 4,
        ..LaneConfig::default()
    }];
    config.orchestration.grace_period_secs = 2;
    config
}

pub async fn running_engine(config: GoclawConfig) -> Engine {
    let engine = Engine::new(config).unwrap();
    engine.start().await.unwrap();
    engine
}

pub fn ok_handler(value: serde_json::Value) -> TaskFn {
    Arc::new(move |_ctx| {
        let value = value.clone();
        Box::pin(async move { Ok(value) })
    })
}

pub fn fail_handler(message: &str) -> TaskFn {
    let message = message.to_string();
    Arc::new(move |_ctx| {
        let message = message.clone();
        Box::pin(async move { Err(goclaw_core::GoclawError::internal(message)) })
    })
}

pub fn sleep_handler(duration: Duration) -> TaskFn {
    Arc::new(move |_ctx| {
        Box::pin(async move {
            tokio::time::sleep(duration).await;
            Ok(serde_json::Value::Null)
        })
    })
}

/// Fails until `succeed_at_attempt`, then completes.
pub fn flaky_handler(succeed_at_attempt: u32, calls: Arc<AtomicUsize>) -> TaskFn {
    Arc::new(move |ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        let attempt = ctx.attempt;
        Box::pin(async move {
            if attempt >= succeed_at_attempt {
                Ok(serde_json::json!({ "attempt": attempt }))
            } else {
                Err(goclaw_core::GoclawError::internal("transient failure"))
            }
        })
    })
}

/// Polls until the workflow reaches the wanted status or the timeout hits.
pub async fn wait_for_status(
    engine: &Engine,
    workflow_id: &str,
    status: WorkflowStatus,
    timeout: Duration,
) -> WorkflowState {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let workflow = engine.get_workflow(workflow_id).await.unwrap();
        if workflow.status == status {
            return workflow;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "workflow {workflow_id} stuck in {:?} waiting for {status}",
            workflow.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
