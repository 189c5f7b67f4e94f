//! Saga orchestration: forward execution, reverse compensation, WAL
//! recovery, and idempotency.

mod common;

use goclaw_core::config::{LaneConfig, SagaConfig};
use goclaw_core::GoclawError;
use goclaw_engine::{
    CompensationPolicy, EngineMetrics, EventBroadcaster, LaneManager, SagaActionFn,
    SagaCompensationFn, SagaDefinition, SagaOrchestrator, SagaState, SagaStep,
};
use goclaw_storage::{MemoryWal, SagaWal, SagaWalEntry};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn orchestrator(wal: Arc<dyn SagaWal>) -> Arc<SagaOrchestrator> {
    let lanes = Arc::new(LaneManager::from_configs(&[LaneConfig::named("default")]).unwrap());
    let config = SagaConfig {
        max_retries: 2,
        initial_backoff_ms: 5,
        backoff_factor: 2.0,
        ..SagaConfig::default()
    };
    SagaOrchestrator::new(
        config,
        wal,
        lanes,
        Arc::new(EventBroadcaster::new()),
        Arc::new(EngineMetrics::new()),
        CancellationToken::new(),
    )
}

fn ok_action(value: serde_json::Value) -> SagaActionFn {
    Arc::new(move |_ctx| {
        let value = value.clone();
        Box::pin(async move { Ok(value) })
    })
}

fn fail_action(message: &str) -> SagaActionFn {
    let message = message.to_string();
    Arc::new(move |_ctx| {
        let message = message.clone();
        Box::pin(async move { Err(GoclawError::internal(message)) })
    })
}

fn recording_compensation(order: &Arc<Mutex<Vec<String>>>, id: &str) -> SagaCompensationFn {
    let order = order.clone();
    let id = id.to_string();
    Arc::new(move |_ctx| {
        order.lock().push(id.clone());
        Box::pin(async { Ok(()) })
    })
}

async fn wait_for_saga(
    orch: &Arc<SagaOrchestrator>,
    saga_id: &str,
    state: SagaState,
    timeout: Duration,
) -> goclaw_engine::SagaInstance {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let instance = orch.get(saga_id).await.unwrap();
        if instance.state == state {
            return instance;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "saga {saga_id} stuck in {} waiting for {state}",
            instance.state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_forward_execution_completes_in_dependency_order() {
    let orch = orchestrator(Arc::new(MemoryWal::new()));

    // s2 reads s1's result through the step context.
    let s2_action: SagaActionFn = Arc::new(|ctx| {
        Box::pin(async move {
            let upstream = ctx
                .results
                .get("s1")
                .cloned()
                .ok_or_else(|| GoclawError::internal("missing dependency result"))?;
            Ok(serde_json::json!({ "from_s1": upstream }))
        })
    });

    let definition = SagaDefinition::new(
        "order-flow",
        vec![
            SagaStep::new("s1", "reserve", ok_action(serde_json::json!("reserved"))),
            SagaStep::new("s2", "charge", s2_action).with_dependencies(vec!["s1".into()]),
            SagaStep::new("s3", "notify", ok_action(serde_json::json!("sent")))
                .with_dependencies(vec!["s2".into()]),
        ],
    );

    let saga_id = orch.submit(definition).await.unwrap();
    let instance = wait_for_saga(&orch, &saga_id, SagaState::Completed, Duration::from_secs(5)).await;
    assert_eq!(instance.completed_steps, vec!["s1", "s2", "s3"]);
    assert_eq!(
        instance.step_results["s2"],
        serde_json::json!({ "from_s1": "reserved" })
    );
    assert!(instance.failed_step.is_none());
}

#[tokio::test]
async fn test_failure_compensates_in_reverse_completion_order() {
    let orch = orchestrator(Arc::new(MemoryWal::new()));
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let definition = SagaDefinition::new(
        "refund-flow",
        vec![
            SagaStep::new("s1", "reserve", ok_action(serde_json::json!(1)))
                .with_compensation(recording_compensation(&order, "s1")),
            SagaStep::new("s2", "charge", ok_action(serde_json::json!(2)))
                .with_dependencies(vec!["s1".into()])
                .with_compensation(recording_compensation(&order, "s2")),
            SagaStep::new("s3", "ship", fail_action("warehouse on fire"))
                .with_dependencies(vec!["s2".into()]),
        ],
    );

    let saga_id = orch.submit(definition).await.unwrap();
    let instance =
        wait_for_saga(&orch, &saga_id, SagaState::Compensated, Duration::from_secs(5)).await;
    assert_eq!(instance.failed_step.as_deref(), Some("s3"));
    assert_eq!(*order.lock(), vec!["s2", "s1"]);
    assert!(instance.compensated_steps.contains(&"s1".to_string()));
    assert!(instance.compensated_steps.contains(&"s2".to_string()));
}

#[tokio::test]
async fn test_parallel_layer_compensates_before_earlier_layer() {
    let orch = orchestrator(Arc::new(MemoryWal::new()));
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let definition = SagaDefinition::new(
        "fanout-flow",
        vec![
            SagaStep::new("root", "root", ok_action(serde_json::json!(0)))
                .with_compensation(recording_compensation(&order, "root")),
            SagaStep::new("left", "left", ok_action(serde_json::json!(1)))
                .with_dependencies(vec!["root".into()])
                .with_compensation(recording_compensation(&order, "left")),
            SagaStep::new("right", "right", ok_action(serde_json::json!(2)))
                .with_dependencies(vec!["root".into()])
                .with_compensation(recording_compensation(&order, "right")),
            SagaStep::new("last", "last", fail_action("nope"))
                .with_dependencies(vec!["left".into(), "right".into()]),
        ],
    );

    let saga_id = orch.submit(definition).await.unwrap();
    wait_for_saga(&orch, &saga_id, SagaState::Compensated, Duration::from_secs(5)).await;

    let recorded = order.lock().clone();
    assert_eq!(recorded.len(), 3);
    // The middle layer (in either order) compensates before the root.
    assert_eq!(recorded[2], "root");
    assert!(recorded[..2].contains(&"left".to_string()));
    assert!(recorded[..2].contains(&"right".to_string()));
}

#[tokio::test]
async fn test_manual_policy_parks_for_api_compensation() {
    let orch = orchestrator(Arc::new(MemoryWal::new()));
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let definition = SagaDefinition::new(
        "manual-flow",
        vec![
            SagaStep::new("s1", "book", ok_action(serde_json::json!(1)))
                .with_compensation(recording_compensation(&order, "s1")),
            SagaStep::new("s2", "confirm", fail_action("needs human"))
                .with_dependencies(vec!["s1".into()])
                .with_policy(CompensationPolicy::Manual),
        ],
    );

    let saga_id = orch.submit(definition).await.unwrap();
    wait_for_saga(
        &orch,
        &saga_id,
        SagaState::PendingCompensation,
        Duration::from_secs(5),
    )
    .await;
    assert!(order.lock().is_empty());

    orch.compensate(&saga_id).await.unwrap();
    wait_for_saga(&orch, &saga_id, SagaState::Compensated, Duration::from_secs(5)).await;
    assert_eq!(*order.lock(), vec!["s1"]);

    // Terminal sagas reject further compensation.
    assert!(orch.compensate(&saga_id).await.unwrap_err().is_conflict());
}

#[tokio::test]
async fn test_compensation_retries_then_gives_up() {
    let orch = orchestrator(Arc::new(MemoryWal::new()));
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let broken_compensation: SagaCompensationFn = Arc::new(move |_ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(GoclawError::internal("compensation broken")) })
    });

    let definition = SagaDefinition::new(
        "hopeless-flow",
        vec![
            SagaStep::new("s1", "act", ok_action(serde_json::json!(1)))
                .with_compensation(broken_compensation),
            SagaStep::new("s2", "fail", fail_action("trigger"))
                .with_dependencies(vec!["s1".into()]),
        ],
    );

    let saga_id = orch.submit(definition).await.unwrap();
    wait_for_saga(
        &orch,
        &saga_id,
        SagaState::CompensationFailed,
        Duration::from_secs(5),
    )
    .await;
    // max_retries = 2: one initial try plus two retries.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_steps_without_compensation_are_skipped() {
    let orch = orchestrator(Arc::new(MemoryWal::new()));
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let definition = SagaDefinition::new(
        "skip-flow",
        vec![
            SagaStep::new("s1", "log", ok_action(serde_json::json!(1))),
            SagaStep::new("s2", "write", ok_action(serde_json::json!(2)))
                .with_dependencies(vec!["s1".into()])
                .with_compensation(recording_compensation(&order, "s2")),
            SagaStep::new("s3", "skippable", ok_action(serde_json::json!(3)))
                .with_dependencies(vec!["s2".into()])
                .with_policy(CompensationPolicy::Skip)
                .with_compensation(recording_compensation(&order, "s3")),
            SagaStep::new("s4", "fail", fail_action("end of the line"))
                .with_dependencies(vec!["s3".into()]),
        ],
    );

    let saga_id = orch.submit(definition).await.unwrap();
    let instance =
        wait_for_saga(&orch, &saga_id, SagaState::Compensated, Duration::from_secs(5)).await;
    // Only s2's compensation ran; s1 (no function) and s3 (skip policy)
    // are recorded as handled without invocation.
    assert_eq!(*order.lock(), vec!["s2"]);
    assert!(instance.compensated_steps.contains(&"s1".to_string()));
    assert!(instance.compensated_steps.contains(&"s3".to_string()));
}

#[tokio::test]
async fn test_definition_validation_errors() {
    let orch = orchestrator(Arc::new(MemoryWal::new()));

    let cyclic = SagaDefinition::new(
        "cyclic",
        vec![
            SagaStep::new("a", "a", ok_action(serde_json::Value::Null))
                .with_dependencies(vec!["b".into()]),
            SagaStep::new("b", "b", ok_action(serde_json::Value::Null))
                .with_dependencies(vec!["a".into()]),
        ],
    );
    assert!(matches!(
        orch.submit(cyclic).await.unwrap_err(),
        GoclawError::CyclicDependency { .. }
    ));

    let unknown_dep = SagaDefinition::new(
        "unknown",
        vec![SagaStep::new("a", "a", ok_action(serde_json::Value::Null))
            .with_dependencies(vec!["ghost".into()])],
    );
    assert!(matches!(
        orch.submit(unknown_dep).await.unwrap_err(),
        GoclawError::DependencyNotFound { .. }
    ));

    assert!(orch.get("missing").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_saga_timeout_triggers_compensation() {
    let orch = orchestrator(Arc::new(MemoryWal::new()));
    let slow_action: SagaActionFn = Arc::new(|_ctx| {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(serde_json::Value::Null)
        })
    });

    let definition = SagaDefinition::new(
        "slow-flow",
        vec![SagaStep::new("s1", "slow", slow_action)],
    )
    .with_timeout(Duration::from_millis(50));

    let saga_id = orch.submit(definition).await.unwrap();
    let instance =
        wait_for_saga(&orch, &saga_id, SagaState::Compensated, Duration::from_secs(5)).await;
    assert!(instance.completed_steps.is_empty());
}

#[tokio::test]
async fn test_engine_saga_surface_streams_terminal_event() {
    let engine = common::running_engine(common::test_config()).await;
    let orch = engine.saga().expect("saga enabled by default");
    let mut rx = engine.subscribe_events();

    let definition = SagaDefinition::new(
        "engine-flow",
        vec![
            SagaStep::new("s1", "first", ok_action(serde_json::json!(1))),
            SagaStep::new("s2", "second", ok_action(serde_json::json!(2)))
                .with_dependencies(vec!["s1".into()]),
        ],
    );
    let saga_id = orch.submit(definition).await.unwrap();
    wait_for_saga(&orch, &saga_id, SagaState::Completed, Duration::from_secs(5)).await;

    // The saga's transitions ride the engine's event stream.
    let mut states = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while states.last().map(String::as_str) != Some("completed") {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for saga events")
            .unwrap();
        if let goclaw_core::events::EventPayload::Saga(p) = &event.payload {
            if p.saga_id == saga_id {
                states.push(p.new_state.clone());
            }
        }
    }
    assert_eq!(states, vec!["running", "completed"]);
    assert_eq!(orch.list().await.len(), 1);
}

// ============================================================================
// WAL recovery
// ============================================================================

#[tokio::test]
async fn test_recovery_resumes_forward_execution() {
    let wal: Arc<dyn SagaWal> = Arc::new(MemoryWal::new());
    wal.append(
        "saga-1",
        SagaWalEntry::Created {
            name: "resume-flow".into(),
            step_ids: vec!["s1".into(), "s2".into(), "s3".into()],
        },
    )
    .await
    .unwrap();
    wal.append(
        "saga-1",
        SagaWalEntry::StateChanged {
            old_state: "created".into(),
            new_state: "running".into(),
        },
    )
    .await
    .unwrap();
    wal.append(
        "saga-1",
        SagaWalEntry::StepCompleted {
            step_id: "s1".into(),
            result: serde_json::json!("done-before-crash"),
        },
    )
    .await
    .unwrap();
    wal.append(
        "saga-1",
        SagaWalEntry::Checkpoint {
            completed_steps: vec!["s1".into()],
        },
    )
    .await
    .unwrap();

    let orch = orchestrator(wal);
    let replayed: SagaActionFn = Arc::new(|_ctx| {
        Box::pin(async { panic!("completed step re-executed") })
    });
    orch.register_definition(SagaDefinition::new(
        "resume-flow",
        vec![
            SagaStep::new("s1", "first", replayed),
            SagaStep::new("s2", "second", ok_action(serde_json::json!(2)))
                .with_dependencies(vec!["s1".into()]),
            SagaStep::new("s3", "third", ok_action(serde_json::json!(3)))
                .with_dependencies(vec!["s2".into()]),
        ],
    ));

    orch.recover().await.unwrap();
    let instance =
        wait_for_saga(&orch, "saga-1", SagaState::Completed, Duration::from_secs(5)).await;
    assert_eq!(
        instance.step_results["s1"],
        serde_json::json!("done-before-crash")
    );
    assert_eq!(instance.completed_steps, vec!["s1", "s2", "s3"]);
}

#[tokio::test]
async fn test_recovery_resumes_compensation_and_honors_keys() {
    let wal: Arc<dyn SagaWal> = Arc::new(MemoryWal::new());
    wal.append(
        "saga-2",
        SagaWalEntry::Created {
            name: "comp-flow".into(),
            step_ids: vec!["s1".into(), "s2".into(), "s3".into()],
        },
    )
    .await
    .unwrap();
    for (old, new) in [("created", "running"), ("running", "compensating")] {
        wal.append(
            "saga-2",
            SagaWalEntry::StateChanged {
                old_state: old.into(),
                new_state: new.into(),
            },
        )
        .await
        .unwrap();
    }
    for step in ["s1", "s2"] {
        wal.append(
            "saga-2",
            SagaWalEntry::StepCompleted {
                step_id: step.into(),
                result: serde_json::Value::Null,
            },
        )
        .await
        .unwrap();
    }
    wal.append(
        "saga-2",
        SagaWalEntry::StepFailed {
            step_id: "s3".into(),
            error: "crashed mid-compensation".into(),
        },
    )
    .await
    .unwrap();
    // s2 was already compensated before the crash.
    wal.append(
        "saga-2",
        SagaWalEntry::StepCompensated {
            step_id: "s2".into(),
            idempotency_key: Some("undo-s2".into()),
        },
    )
    .await
    .unwrap();

    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let orch = orchestrator(wal);
    orch.register_definition(SagaDefinition::new(
        "comp-flow",
        vec![
            SagaStep::new("s1", "first", ok_action(serde_json::Value::Null))
                .with_compensation(recording_compensation(&order, "s1"))
                .with_idempotency_key("undo-s1"),
            SagaStep::new("s2", "second", ok_action(serde_json::Value::Null))
                .with_dependencies(vec!["s1".into()])
                .with_compensation(recording_compensation(&order, "s2"))
                .with_idempotency_key("undo-s2"),
            SagaStep::new("s3", "third", fail_action("always"))
                .with_dependencies(vec!["s2".into()]),
        ],
    ));

    orch.recover().await.unwrap();
    let instance =
        wait_for_saga(&orch, "saga-2", SagaState::Compensated, Duration::from_secs(5)).await;
    // Only s1's compensation runs; s2's key was already applied.
    assert_eq!(*order.lock(), vec!["s1"]);
    assert!(instance.compensation_keys.contains(&"undo-s1".to_string()));
    assert!(instance.compensation_keys.contains(&"undo-s2".to_string()));
}

#[tokio::test]
async fn test_terminal_sagas_recover_immutable() {
    let wal: Arc<dyn SagaWal> = Arc::new(MemoryWal::new());
    wal.append(
        "saga-3",
        SagaWalEntry::Created {
            name: "done-flow".into(),
            step_ids: vec!["s1".into()],
        },
    )
    .await
    .unwrap();
    for (old, new) in [("created", "running"), ("running", "completed")] {
        wal.append(
            "saga-3",
            SagaWalEntry::StateChanged {
                old_state: old.into(),
                new_state: new.into(),
            },
        )
        .await
        .unwrap();
    }

    let orch = orchestrator(wal);
    orch.recover().await.unwrap();
    let instance = orch.get("saga-3").await.unwrap();
    assert_eq!(instance.state, SagaState::Completed);
    assert!(orch.compensate("saga-3").await.unwrap_err().is_conflict());
}
