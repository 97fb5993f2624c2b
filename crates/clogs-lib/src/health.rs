//! Self-health of the server process
//!
//! Component status for `/healthz` and `/readyz`, the ingestion progress
//! window behind `/health`, and the liveness marker file read by the
//! `self-check` subcommand.

use crate::models::{now_millis, Timestamp};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Health status of a server component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Working, but some writes or ticks are failing
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: Timestamp,
}

impl ComponentHealth {
    fn with(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: now_millis(),
        }
    }

    pub fn healthy() -> Self {
        Self::with(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Overall component health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst of all component statuses; healthy when there are none
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        let mut has_degraded = false;

        for health in components.values() {
            match health.status {
                ComponentStatus::Unhealthy => return ComponentStatus::Unhealthy,
                ComponentStatus::Degraded => has_degraded = true,
                ComponentStatus::Healthy => {}
            }
        }

        if has_degraded {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const INGEST: &str = "ingest";
    pub const SWEEP: &str = "sweep";
    pub const STORE: &str = "store";
}

/// Tracks the health of server components
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn register(&self, name: &str) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), ComponentHealth::healthy());
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Current status of one component, if registered
    pub async fn status_of(&self, name: &str) -> Option<ComponentStatus> {
        self.components.read().await.get(name).map(|h| h.status)
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = *self.ready.read().await;
        let health = self.health().await;

        if !ready {
            ReadinessResponse {
                ready: false,
                reason: Some("Server not yet initialized".to_string()),
            }
        } else if health.status == ComponentStatus::Unhealthy {
            ReadinessResponse {
                ready: false,
                reason: Some("Critical component unhealthy".to_string()),
            }
        } else {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        }
    }
}

/// Timestamp of the last unit of work completed by the ingestion loop or sweep
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    last: Arc<AtomicI64>,
}

impl ProgressTracker {
    /// Starts out as if progress was just made, so a fresh server is not reported down
    pub fn new(now: Timestamp) -> Self {
        Self {
            last: Arc::new(AtomicI64::new(now)),
        }
    }

    pub fn mark(&self, now: Timestamp) {
        self.last.fetch_max(now, Ordering::Relaxed);
    }

    pub fn last_progress(&self) -> Timestamp {
        self.last.load(Ordering::Relaxed)
    }

    pub fn is_progressing(&self, now: Timestamp, window: Duration) -> bool {
        now - self.last_progress() <= window.as_millis() as i64
    }
}

/// Liveness marker file, touched after each successful sweep
#[derive(Debug, Clone)]
pub struct LivenessMarker {
    path: PathBuf,
}

impl LivenessMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the marker at startup, including parent directories
    pub async fn init(&self, now: Timestamp) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        self.touch(now)
            .await
            .with_context(|| format!("Failed to write liveness marker {}", self.path.display()))
    }

    pub async fn touch(&self, now: Timestamp) -> std::io::Result<()> {
        tokio::fs::write(&self.path, now.to_string()).await
    }

    /// Read the marker and report whether it was touched within `max_age`.
    /// A missing or unreadable marker counts as not alive.
    pub fn check(path: &Path, now: Timestamp, max_age: Duration) -> bool {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .map(|touched| now - touched <= max_age.as_millis() as i64)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_registry_initial_state() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_health_registry_degraded_store() {
        let registry = HealthRegistry::new();
        registry.register(components::INGEST).await;
        registry.register(components::STORE).await;

        registry.set_degraded(components::STORE, "writes failing").await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert_eq!(
            registry.status_of(components::STORE).await,
            Some(ComponentStatus::Degraded)
        );
    }

    #[tokio::test]
    async fn test_readiness_follows_flag_and_components() {
        let registry = HealthRegistry::new();
        registry.register(components::SWEEP).await;
        assert!(!registry.readiness().await.ready);

        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);

        registry.set_unhealthy(components::SWEEP, "stuck").await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());
    }

    #[test]
    fn test_progress_window() {
        let progress = ProgressTracker::new(1_000);
        assert!(progress.is_progressing(5_000, Duration::from_secs(5)));
        assert!(!progress.is_progressing(7_000, Duration::from_secs(5)));

        progress.mark(6_500);
        progress.mark(2_000);
        assert_eq!(progress.last_progress(), 6_500);
        assert!(progress.is_progressing(7_000, Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_liveness_marker_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("alive");
        let marker = LivenessMarker::new(&path);

        assert!(!LivenessMarker::check(&path, 0, Duration::from_secs(10)));

        marker.init(1_000).await.unwrap();
        assert!(LivenessMarker::check(&path, 5_000, Duration::from_secs(10)));
        assert!(!LivenessMarker::check(&path, 20_000, Duration::from_secs(10)));

        marker.touch(19_000).await.unwrap();
        assert!(LivenessMarker::check(&path, 20_000, Duration::from_secs(10)));
    }
}
