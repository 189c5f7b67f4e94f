//! Lanes: bounded, rate-limited worker pools that own execution concurrency.
//!
//! A lane admits tasks through a strict pipeline — closed check, token
//! bucket, bounded enqueue, backpressure policy — and counts exactly one of
//! `accepted | rejected | redirected | dropped` per submission. Workers
//! dequeue in FIFO or priority order and execute with panic recovery.

mod limiter;
pub mod manager;
mod queue;

pub use manager::LaneManager;

use futures::future::BoxFuture;
use futures::FutureExt;
use goclaw_core::config::{BackpressurePolicy, LaneConfig};
use goclaw_core::{GoclawError, Result};
use limiter::RateGate;
use parking_lot::{Mutex, RwLock};
use queue::{QueuedTask, TaskQueue};
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long a dynamically scaled worker idles before retiring.
const DYNAMIC_IDLE_TIMEOUT: Duration = Duration::from_millis(500);

/// Terminal outcome of one executed lane task, as reported by its closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed,
    Cancelled,
}

pub type ExecuteFn = Box<dyn FnOnce() -> BoxFuture<'static, TaskOutcome> + Send>;

/// A unit of work routed to a lane.
pub struct LaneTask {
    pub workflow_id: String,
    pub task_id: String,
    /// Routing key resolved by the lane manager
    pub lane: String,
    pub priority: i32,
    pub execute: ExecuteFn,
}

impl LaneTask {
    pub fn new(
        workflow_id: impl Into<String>,
        task_id: impl Into<String>,
        lane: impl Into<String>,
        priority: i32,
        execute: ExecuteFn,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            task_id: task_id.into(),
            lane: lane.into(),
            priority,
            execute,
        }
    }
}

/// Point-in-time lane statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LaneStats {
    pub accepted: u64,
    pub rejected: u64,
    pub redirected: u64,
    pub dropped: u64,
    pub completed: u64,
    pub failed: u64,
    /// Tasks queued, not yet picked up
    pub pending: u64,
    /// Tasks currently executing
    pub inflight: u64,
    pub wait_observations: u64,
    pub wait_total_ms: u64,
}

#[derive(Default, Debug)]
struct StatsInner {
    accepted: AtomicU64,
    rejected: AtomicU64,
    redirected: AtomicU64,
    dropped: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    inflight: AtomicU64,
    wait_observations: AtomicU64,
    wait_total_ms: AtomicU64,
}

struct LaneState {
    queue: TaskQueue,
    idle_workers: usize,
}

/// A bounded queue plus worker pool. Construct with [`Lane::start`].
pub struct Lane {
    name: String,
    config: LaneConfig,
    state: Mutex<LaneState>,
    /// Signaled once per enqueued item (permit-storing)
    items: Notify,
    /// Signaled when queue space or an idle worker appears
    space: Notify,
    shutdown: CancellationToken,
    closed: AtomicBool,
    limiter: Option<RateGate>,
    seq: AtomicU64,
    stats: StatsInner,
    base_workers: usize,
    current_workers: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    redirect_target: RwLock<Option<Arc<Lane>>>,
    self_ref: OnceLock<Weak<Lane>>,
}

impl std::fmt::Debug for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lane").field("name", &self.name).finish()
    }
}

impl Lane {
    /// Create the lane and start its worker pool.
    pub fn start(config: LaneConfig) -> Arc<Self> {
        let base_workers = if config.enable_dynamic_workers {
            config.min_concurrency.unwrap_or(1)
        } else {
            config.max_concurrency
        };
        let limiter = RateGate::new(config.rate_limit);
        let lane = Arc::new(Self {
            name: config.name.clone(),
            state: Mutex::new(LaneState {
                queue: TaskQueue::new(config.priority_ordering),
                idle_workers: 0,
            }),
            items: Notify::new(),
            space: Notify::new(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            limiter,
            seq: AtomicU64::new(0),
            stats: StatsInner::default(),
            base_workers,
            current_workers: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
            redirect_target: RwLock::new(None),
            self_ref: OnceLock::new(),
            config,
        });
        let _ = lane.self_ref.set(Arc::downgrade(&lane));
        for _ in 0..base_workers {
            lane.spawn_worker(false);
        }
        debug!(lane = %lane.name, workers = base_workers, "lane started");
        lane
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &LaneConfig {
        &self.config
    }

    /// Wire the redirect target after all lanes are registered.
    pub(crate) fn set_redirect_target(&self, target: Arc<Lane>) {
        *self.redirect_target.write() = Some(target);
    }

    /// Submit one task. Exactly one backpressure outcome is counted.
    ///
    /// Returns `Ok(())` on acceptance (or successful redirect), a
    /// `Rejected`/`Dropped` error otherwise, or `Cancelled` when the caller
    /// context is cancelled while blocked.
    pub fn submit<'a>(
        &'a self,
        ctx: &'a CancellationToken,
        task: LaneTask,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(self.reject("lane closed"));
            }

            if let Some(gate) = &self.limiter {
                tokio::select! {
                    _ = gate.acquire() => {}
                    _ = ctx.cancelled() => {
                        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(GoclawError::cancelled("submission cancelled while rate limited"));
                    }
                    _ = self.shutdown.cancelled() => {
                        return Err(self.reject("lane closed"));
                    }
                }
            }

            match self.config.backpressure.clone() {
                BackpressurePolicy::Block => self.enqueue_blocking(ctx, task).await,
                BackpressurePolicy::Drop => {
                    let mut st = self.state.lock();
                    if self.has_space_strict(&st) {
                        self.push_locked(&mut st, task);
                        Ok(())
                    } else {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        Err(GoclawError::Dropped {
                            lane: self.name.clone(),
                        })
                    }
                }
                BackpressurePolicy::Redirect { target } => {
                    {
                        let mut st = self.state.lock();
                        if self.has_space_strict(&st) {
                            self.push_locked(&mut st, task);
                            return Ok(());
                        }
                    }
                    let resolved = self.redirect_target.read().clone();
                    match resolved {
                        Some(next) => {
                            let forward: BoxFuture<'_, Result<()>> =
                                Box::pin(next.submit(ctx, task));
                            match forward.await {
                                Ok(()) => {
                                    // Counted only because the target accepted.
                                    self.stats.redirected.fetch_add(1, Ordering::Relaxed);
                                    Ok(())
                                }
                                Err(err) => {
                                    debug!(lane = %self.name, target = %target, %err, "redirect refused, reclassifying as dropped");
                                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                                    Err(GoclawError::Dropped {
                                        lane: self.name.clone(),
                                    })
                                }
                            }
                        }
                        None => {
                            warn!(lane = %self.name, target = %target, "redirect target not registered");
                            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                            Err(GoclawError::Dropped {
                                lane: self.name.clone(),
                            })
                        }
                    }
                }
            }
        }
        .boxed()
    }

    async fn enqueue_blocking(&self, ctx: &CancellationToken, task: LaneTask) -> Result<()> {
        let mut slot = Some(task);
        loop {
            {
                let mut st = self.state.lock();
                if self.shutdown.is_cancelled() {
                    drop(st);
                    return Err(self.reject("lane closed"));
                }
                if self.has_space_block(&st) {
                    self.push_locked(&mut st, slot.take().unwrap());
                    return Ok(());
                }
            }
            tokio::select! {
                _ = self.space.notified() => {}
                _ = ctx.cancelled() => {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(GoclawError::cancelled("submission cancelled while waiting for queue space"));
                }
                _ = self.shutdown.cancelled() => {
                    return Err(self.reject("lane closed"));
                }
            }
        }
    }

    fn reject(&self, reason: &str) -> GoclawError {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        GoclawError::Rejected {
            lane: self.name.clone(),
            reason: reason.to_string(),
        }
    }

    fn has_space_strict(&self, st: &LaneState) -> bool {
        st.queue.len() < self.config.capacity
    }

    /// Block policy additionally allows direct handoff to an idle worker
    /// when the lane has no buffering at all.
    fn has_space_block(&self, st: &LaneState) -> bool {
        if self.config.capacity > 0 {
            st.queue.len() < self.config.capacity
        } else {
            st.queue.len() < st.idle_workers
        }
    }

    fn push_locked(&self, st: &mut LaneState, task: LaneTask) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        st.queue.push(QueuedTask::new(task, seq));
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        self.items.notify_one();

        if self.config.enable_dynamic_workers {
            let current = self.current_workers.load(Ordering::Relaxed);
            if current < self.config.max_concurrency && st.queue.len() > current {
                self.spawn_worker(true);
            }
        }
    }

    fn spawn_worker(&self, dynamic: bool) {
        let Some(lane) = self.self_ref.get().and_then(Weak::upgrade) else {
            return;
        };
        self.current_workers.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(async move {
            lane.worker_loop(dynamic).await;
        });
        self.workers.lock().push(handle);
    }

    async fn worker_loop(self: Arc<Self>, dynamic: bool) {
        loop {
            let task = {
                let mut st = self.state.lock();
                match st.queue.pop() {
                    Some(task) => Some(task),
                    None if self.shutdown.is_cancelled() => {
                        self.current_workers.fetch_sub(1, Ordering::Relaxed);
                        return;
                    }
                    None => {
                        st.idle_workers += 1;
                        None
                    }
                }
            };

            match task {
                Some(task) => {
                    self.space.notify_one();
                    self.run_task(task).await;
                }
                None => {
                    // A no-buffer submitter can hand off now.
                    self.space.notify_one();
                    let got_signal = self.wait_for_item(dynamic).await;
                    {
                        let mut st = self.state.lock();
                        st.idle_workers -= 1;
                    }
                    if !got_signal && self.try_retire_dynamic() {
                        return;
                    }
                }
            }
        }
    }

    /// Returns false only when a dynamic worker timed out while idle.
    async fn wait_for_item(&self, dynamic: bool) -> bool {
        if dynamic {
            tokio::select! {
                _ = self.items.notified() => true,
                _ = self.shutdown.cancelled() => true,
                _ = tokio::time::sleep(DYNAMIC_IDLE_TIMEOUT) => false,
            }
        } else {
            tokio::select! {
                _ = self.items.notified() => {}
                _ = self.shutdown.cancelled() => {}
            }
            true
        }
    }

    fn try_retire_dynamic(&self) -> bool {
        if !self.state.lock().queue.is_empty() {
            return false;
        }
        let current = self.current_workers.load(Ordering::Relaxed);
        if current > self.base_workers {
            self.current_workers.fetch_sub(1, Ordering::Relaxed);
            debug!(lane = %self.name, "retiring idle dynamic worker");
            return true;
        }
        false
    }

    async fn run_task(&self, task: QueuedTask) {
        let wait = task.enqueued_at.elapsed();
        self.stats.wait_observations.fetch_add(1, Ordering::Relaxed);
        self.stats
            .wait_total_ms
            .fetch_add(wait.as_millis() as u64, Ordering::Relaxed);
        self.stats.inflight.fetch_add(1, Ordering::Relaxed);

        let workflow_id = task.workflow_id.clone();
        let task_id = task.task_id.clone();
        let outcome = AssertUnwindSafe((task.execute)()).catch_unwind().await;
        match outcome {
            Ok(TaskOutcome::Completed) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(TaskOutcome::Failed) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(TaskOutcome::Cancelled) => {}
            Err(_) => {
                // The execute closure recovers user panics itself; this
                // guards the worker against anything that slipped through.
                warn!(lane = %self.name, %workflow_id, %task_id, "task panicked in worker");
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.stats.inflight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Snapshot of the lane's counters and queue depths.
    pub fn stats(&self) -> LaneStats {
        let pending = self.state.lock().queue.len() as u64;
        LaneStats {
            accepted: self.stats.accepted.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            redirected: self.stats.redirected.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            pending,
            inflight: self.stats.inflight.load(Ordering::Relaxed),
            wait_observations: self.stats.wait_observations.load(Ordering::Relaxed),
            wait_total_ms: self.stats.wait_total_ms.load(Ordering::Relaxed),
        }
    }

    /// Close the lane: refuse new submissions, wake blocked submitters with
    /// a reject, drain queued tasks, and wait for workers. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();
        self.items.notify_waiters();
        self.space.notify_waiters();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        debug!(lane = %self.name, "lane closed");
        Ok(())
    }
}
