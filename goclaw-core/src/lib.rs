//! Core types and abstractions for the Goclaw workflow orchestration engine.
//!
//! This crate provides the foundational data model, error taxonomy,
//! configuration, and event envelopes used across all Goclaw components.

pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::{BackpressurePolicy, GoclawConfig, LaneConfig, SagaConfig, StorageKind};
pub use error::{GoclawError, Result};
pub use events::{EventEnvelope, EventKind};
pub use types::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{BackpressurePolicy, GoclawConfig, LaneConfig, StorageKind};
    pub use crate::error::{GoclawError, Result};
    pub use crate::events::{EventEnvelope, EventKind};
    pub use crate::types::*;
}
