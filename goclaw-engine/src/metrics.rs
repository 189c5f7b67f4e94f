//! Engine metrics, driven from state-tracker transition hooks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters. One instance lives for the engine's lifetime and
/// is fed exclusively by the state tracker and scheduler retry accounting.
#[derive(Default)]
pub struct EngineMetrics {
    workflows_submitted: AtomicU64,
    workflows_completed: AtomicU64,
    workflows_failed: AtomicU64,
    workflows_cancelled: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_cancelled: AtomicU64,
    task_retries: AtomicU64,
    task_run_total_ms: AtomicU64,
    task_run_observations: AtomicU64,
    events_published: AtomicU64,
    sagas_completed: AtomicU64,
    sagas_compensated: AtomicU64,
    sagas_compensation_failed: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_workflow_submitted(&self) {
        self.workflows_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_workflow_terminal(&self, status: goclaw_core::WorkflowStatus) {
        use goclaw_core::WorkflowStatus::*;
        match status {
            Completed => self.workflows_completed.fetch_add(1, Ordering::Relaxed),
            Failed => self.workflows_failed.fetch_add(1, Ordering::Relaxed),
            Cancelled => self.workflows_cancelled.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    pub fn record_task_terminal(&self, status: goclaw_core::TaskStatus, run_duration_ms: Option<u64>) {
        use goclaw_core::TaskStatus::*;
        match status {
            Completed => self.tasks_completed.fetch_add(1, Ordering::Relaxed),
            Failed => self.tasks_failed.fetch_add(1, Ordering::Relaxed),
            Cancelled => self.tasks_cancelled.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        if let Some(ms) = run_duration_ms {
            self.task_run_total_ms.fetch_add(ms, Ordering::Relaxed);
            self.task_run_observations.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_task_retry(&self) {
        self.task_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_saga_terminal(&self, state: &str) {
        match state {
            "completed" => self.sagas_completed.fetch_add(1, Ordering::Relaxed),
            "compensated" => self.sagas_compensated.fetch_add(1, Ordering::Relaxed),
            "compensation-failed" => self
                .sagas_compensation_failed
                .fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let observations = self.task_run_observations.load(Ordering::Relaxed);
        let avg_task_run_ms = if observations > 0 {
            self.task_run_total_ms.load(Ordering::Relaxed) / observations
        } else {
            0
        };
        MetricsSnapshot {
            workflows_submitted: self.workflows_submitted.load(Ordering::Relaxed),
            workflows_completed: self.workflows_completed.load(Ordering::Relaxed),
            workflows_failed: self.workflows_failed.load(Ordering::Relaxed),
            workflows_cancelled: self.workflows_cancelled.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            task_retries: self.task_retries.load(Ordering::Relaxed),
            avg_task_run_ms,
            events_published: self.events_published.load(Ordering::Relaxed),
            sagas_completed: self.sagas_completed.load(Ordering::Relaxed),
            sagas_compensated: self.sagas_compensated.load(Ordering::Relaxed),
            sagas_compensation_failed: self.sagas_compensation_failed.load(Ordering::Relaxed),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub workflows_submitted: u64,
    pub workflows_completed: u64,
    pub workflows_failed: u64,
    pub workflows_cancelled: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub task_retries: u64,
    pub avg_task_run_ms: u64,
    pub events_published: u64,
    pub sagas_completed: u64,
    pub sagas_compensated: u64,
    pub sagas_compensation_failed: u64,
    pub timestamp: DateTime<Utc>,
}
