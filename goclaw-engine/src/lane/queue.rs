//! Bounded ordered containers backing a lane.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::time::Instant;

use super::{LaneTask, TaskOutcome};
use futures::future::BoxFuture;

/// A task admitted into the queue, stamped with its enqueue sequence and
/// timestamp.
pub(crate) struct QueuedTask {
    pub workflow_id: String,
    pub task_id: String,
    pub priority: i32,
    pub seq: u64,
    pub enqueued_at: Instant,
    pub execute: Box<dyn FnOnce() -> BoxFuture<'static, TaskOutcome> + Send>,
}

impl QueuedTask {
    pub(crate) fn new(task: LaneTask, seq: u64) -> Self {
        Self {
            workflow_id: task.workflow_id,
            task_id: task.task_id,
            priority: task.priority,
            seq,
            enqueued_at: Instant::now(),
            execute: task.execute,
        }
    }
}

pub(crate) struct Prioritized(QueuedTask);

impl PartialEq for Prioritized {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority && self.0.seq == other.0.seq
    }
}

impl Eq for Prioritized {}

impl PartialOrd for Prioritized {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Prioritized {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: highest priority first; equal priorities pop in FIFO
        // order of the enqueue sequence.
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

/// FIFO or priority-ordered queue; the bound is enforced by the lane.
pub(crate) enum TaskQueue {
    Fifo(VecDeque<QueuedTask>),
    Priority(BinaryHeap<Prioritized>),
}

impl TaskQueue {
    pub(crate) fn new(priority_ordering: bool) -> Self {
        if priority_ordering {
            Self::Priority(BinaryHeap::new())
        } else {
            Self::Fifo(VecDeque::new())
        }
    }

    pub(crate) fn push(&mut self, task: QueuedTask) {
        match self {
            Self::Fifo(q) => q.push_back(task),
            Self::Priority(h) => h.push(Prioritized(task)),
        }
    }

    pub(crate) fn pop(&mut self) -> Option<QueuedTask> {
        match self {
            Self::Fifo(q) => q.pop_front(),
            Self::Priority(h) => h.pop().map(|p| p.0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Fifo(q) => q.len(),
            Self::Priority(h) => h.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
