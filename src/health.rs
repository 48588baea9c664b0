//! Component health rollup: folds the event bus into the per-component
//! `healthy | degraded | unhealthy` states the Read API's `/healthz`
//! reports, per spec §7 ("each component reports its own health with a
//! reason string").

use crate::bus::BusEvent;
use base::shutdown;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    fn rank(self) -> u8 {
        match self {
            HealthState::Healthy => 0,
            HealthState::Degraded => 1,
            HealthState::Unhealthy => 2,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ComponentHealth {
    pub state: HealthState,
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthState,
    pub components: HashMap<String, ComponentHealth>,
}

/// Shared, continuously-updated view of component health. Cheap to clone
/// (an `Arc<RwLock<..>>` inside); [`HealthRegistry::run`] is the only
/// writer, `snapshot` the Read API's only reader.
#[derive(Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        HealthRegistry { components: Arc::new(RwLock::new(HashMap::new())) }
    }

    async fn set(&self, component: impl Into<String>, state: HealthState, reason: Option<String>) {
        self.components.write().await.insert(component.into(), ComponentHealth { state, reason });
    }

    /// Overall status is the worst of any reported component; no components
    /// reported yet (nothing has happened) reads as healthy.
    pub async fn snapshot(&self) -> HealthSnapshot {
        let components = self.components.read().await.clone();
        let status = components.values().map(|c| c.state).max_by_key(|s| s.rank()).unwrap_or(HealthState::Healthy);
        HealthSnapshot { status, components }
    }

    /// Drains `rx` into component state until shutdown. `rx` must be
    /// subscribed before any service starts publishing, or its early
    /// `ServiceStarted` events are missed (the bus is fire-and-forget).
    pub async fn run(self, mut rx: broadcast::Receiver<BusEvent>, mut shutdown: shutdown::Receiver) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                event = rx.recv() => {
                    let Ok(event) = event else { continue };
                    self.apply(event).await;
                }
            }
        }
    }

    async fn apply(&self, event: BusEvent) {
        match event {
            BusEvent::ServiceStarted { name } => self.set(name, HealthState::Healthy, None).await,
            BusEvent::ServiceStopped { name } => self.set(name, HealthState::Healthy, None).await,
            BusEvent::ServiceError { name, message } => self.set(name, HealthState::Unhealthy, Some(message)).await,
            BusEvent::CameraConnected { camera_id } => {
                self.set(format!("camera:{camera_id}"), HealthState::Healthy, None).await
            }
            BusEvent::CameraDisconnected { camera_id } => {
                self.set(
                    format!("camera:{camera_id}"),
                    HealthState::Degraded,
                    Some("disconnected, reconnecting".to_string()),
                )
                .await
            }
            BusEvent::StorageWarning { percent_used } => {
                self.set("storage", HealthState::Degraded, Some(format!("disk at {percent_used}% used"))).await
            }
            BusEvent::StorageFull => {
                self.set("storage", HealthState::Unhealthy, Some("disk full, new clips rejected".to_string())).await
            }
            BusEvent::RelayFailed { event_id } => {
                self.set("relay", HealthState::Degraded, Some(format!("event {event_id} permanently rejected by relay")))
                    .await
            }
            BusEvent::CameraDiscovered { .. } | BusEvent::Detection { .. } | BusEvent::EventClosed { .. } | BusEvent::ClipRecorded { .. } => {}
        }
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn worst_component_state_wins_overall_status() {
        let registry = HealthRegistry::new();
        registry.set("camera:cam1", HealthState::Degraded, None).await;
        registry.set("storage", HealthState::Unhealthy, Some("disk full".to_string())).await;
        let snap = registry.snapshot().await;
        assert_eq!(snap.status, HealthState::Unhealthy);
        assert_eq!(snap.components.len(), 2);
    }

    #[tokio::test]
    async fn no_components_reported_is_healthy() {
        let registry = HealthRegistry::new();
        assert_eq!(registry.snapshot().await.status, HealthState::Healthy);
    }

    #[tokio::test]
    async fn storage_full_superseded_by_later_warning() {
        let registry = HealthRegistry::new();
        registry.apply(BusEvent::StorageFull).await;
        registry.apply(BusEvent::StorageWarning { percent_used: 80 }).await;
        let snap = registry.snapshot().await;
        assert_eq!(snap.components["storage"].state, HealthState::Degraded);
    }

    #[tokio::test]
    async fn service_error_marks_that_service_unhealthy_without_affecting_others() {
        let registry = HealthRegistry::new();
        registry.apply(BusEvent::ServiceStarted { name: "relay-uploader".to_string() }).await;
        registry.apply(BusEvent::ServiceError { name: "discovery:multicast".to_string(), message: "bind failed".to_string() }).await;
        let snap = registry.snapshot().await;
        assert_eq!(snap.components["relay-uploader"].state, HealthState::Healthy);
        assert_eq!(snap.components["discovery:multicast"].state, HealthState::Unhealthy);
        assert_eq!(snap.status, HealthState::Unhealthy);
    }
}
