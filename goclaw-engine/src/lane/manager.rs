//! Registry of named lanes; routes submissions by lane name.

use super::{Lane, LaneStats, LaneTask};
use dashmap::DashMap;
use goclaw_core::config::{BackpressurePolicy, LaneConfig};
use goclaw_core::{GoclawError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct LaneManager {
    lanes: DashMap<String, Arc<Lane>>,
    closed: AtomicBool,
}

impl LaneManager {
    pub fn new() -> Self {
        Self {
            lanes: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Start all configured lanes, then wire redirect targets.
    pub fn from_configs(configs: &[LaneConfig]) -> Result<Self> {
        let manager = Self::new();
        for config in configs {
            manager.register(config.clone())?;
        }
        Ok(manager)
    }

    /// Register and start one lane. Fails on a duplicate name or after close.
    pub fn register(&self, config: LaneConfig) -> Result<Arc<Lane>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GoclawError::lifecycle("lane manager is closed"));
        }
        config.validate()?;
        if self.lanes.contains_key(&config.name) {
            return Err(GoclawError::conflict(format!(
                "lane '{}' is already registered",
                config.name
            )));
        }
        let lane = Lane::start(config);
        self.lanes.insert(lane.name().to_string(), lane.clone());
        self.wire_redirects();
        info!(lane = %lane.name(), "registered lane");
        Ok(lane)
    }

    /// Resolve redirect targets among currently registered lanes.
    fn wire_redirects(&self) {
        for entry in self.lanes.iter() {
            if let BackpressurePolicy::Redirect { target } = &entry.value().config().backpressure {
                if let Some(target_lane) = self.lanes.get(target) {
                    entry.value().set_redirect_target(target_lane.clone());
                }
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Lane>> {
        self.lanes.get(name).map(|l| l.clone())
    }

    /// Route a task to its lane. Unknown lanes are `NotFound`.
    pub async fn submit(&self, ctx: &CancellationToken, task: LaneTask) -> Result<()> {
        let lane = self
            .get(&task.lane)
            .ok_or_else(|| GoclawError::not_found("lane", &task.lane))?;
        lane.submit(ctx, task).await
    }

    /// Per-lane statistics snapshot.
    pub fn stats(&self) -> HashMap<String, LaneStats> {
        self.lanes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    /// Close every lane exactly once. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for entry in self.lanes.iter() {
            entry.value().close().await?;
        }
        info!("lane manager closed");
        Ok(())
    }
}

impl Default for LaneManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lane::TaskOutcome;
    use std::sync::atomic::AtomicUsize;

    fn counting_task(lane: &str, n: &Arc<AtomicUsize>) -> LaneTask {
        let n = n.clone();
        LaneTask::new("wf", "t", lane, 0, Box::new(move || {
            Box::pin(async move {
                n.fetch_add(1, Ordering::SeqCst);
                TaskOutcome::Completed
            })
        }))
    }

    #[tokio::test]
    async fn test_routes_by_lane_name() {
        let manager = LaneManager::new();
        manager.register(LaneConfig::named("a")).unwrap();
        manager.register(LaneConfig::named("b")).unwrap();

        let n = Arc::new(AtomicUsize::new(0));
        let ctx = CancellationToken::new();
        manager.submit(&ctx, counting_task("a", &n)).await.unwrap();
        manager.submit(&ctx, counting_task("b", &n)).await.unwrap();
        manager.close().await.unwrap();

        assert_eq!(n.load(Ordering::SeqCst), 2);
        let stats = manager.stats();
        assert_eq!(stats["a"].accepted, 1);
        assert_eq!(stats["b"].accepted, 1);
    }

    #[tokio::test]
    async fn test_unknown_lane_is_not_found() {
        let manager = LaneManager::new();
        let n = Arc::new(AtomicUsize::new(0));
        let err = manager
            .submit(&CancellationToken::new(), counting_task("ghost", &n))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let manager = LaneManager::new();
        manager.register(LaneConfig::named("a")).unwrap();
        assert!(manager.register(LaneConfig::named("a")).unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_close_closes_all_lanes_once() {
        let manager = LaneManager::new();
        manager.register(LaneConfig::named("a")).unwrap();
        manager.close().await.unwrap();
        manager.close().await.unwrap();

        let n = Arc::new(AtomicUsize::new(0));
        let err = manager
            .submit(&CancellationToken::new(), counting_task("a", &n))
            .await
            .unwrap_err();
        assert!(matches!(err, GoclawError::Rejected { .. }));
        assert!(manager.register(LaneConfig::named("b")).is_err());
    }

    #[tokio::test]
    async fn test_redirect_wired_regardless_of_registration_order() {
        let manager = LaneManager::new();
        manager
            .register(LaneConfig {
                name: "front".into(),
                capacity: 0,
                max_concurrency: 1,
                backpressure: BackpressurePolicy::Redirect {
                    target: "overflow".into(),
                },
                ..LaneConfig::default()
            })
            .unwrap();
        manager.register(LaneConfig::named("overflow")).unwrap();

        let n = Arc::new(AtomicUsize::new(0));
        let ctx = CancellationToken::new();
        manager.submit(&ctx, counting_task("front", &n)).await.unwrap();
        manager.close().await.unwrap();

        let stats = manager.stats();
        assert_eq!(stats["front"].redirected, 1);
        assert_eq!(stats["overflow"].accepted, 1);
        assert_eq!(n.load(Ordering::SeqCst), 1);
    }
}
