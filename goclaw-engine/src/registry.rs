//! Named task handler registry.
//!
//! Task closures cannot be persisted, so recovery re-binds executable
//! functions to recovered tasks by task name. Handlers registered here are
//! also usable at submission time in place of inline closures.

use dashmap::DashMap;
use goclaw_core::{TaskFn, TaskSpec};
use std::collections::HashMap;

#[derive(Default)]
pub struct TaskHandlerRegistry {
    handlers: DashMap<String, TaskFn>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a task name. Re-registration replaces.
    pub fn register(&self, name: impl Into<String>, handler: TaskFn) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<TaskFn> {
        self.handlers.get(name).map(|h| h.clone())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Map task IDs to registered handlers by task name. Returns `None`
    /// unless every task resolves, since partial execution is useless.
    pub fn resolve(&self, specs: &[TaskSpec]) -> Option<HashMap<String, TaskFn>> {
        let mut handlers = HashMap::with_capacity(specs.len());
        for spec in specs {
            handlers.insert(spec.id.clone(), self.get(&spec.name)?);
        }
        Some(handlers)
    }
}
