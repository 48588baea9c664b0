//! The in-process event bus: best-effort pub/sub keyed by [`BusEvent`].
//! Built on `tokio::sync::broadcast` so a slow or absent subscriber can never
//! block a publisher — lagging subscribers just miss older events.

use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub enum BusEvent {
    ServiceStarted { name: String },
    ServiceStopped { name: String },
    ServiceError { name: String, message: String },
    CameraDiscovered { camera_id: String },
    CameraConnected { camera_id: String },
    CameraDisconnected { camera_id: String },
    EventClosed { event_id: Uuid },
    ClipRecorded { event_id: Uuid },
    Detection { camera_id: String, count: usize },
    StorageWarning { percent_used: u8 },
    StorageFull,
    RelayFailed { event_id: Uuid },
}

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct Bus(broadcast::Sender<BusEvent>);

impl Bus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Bus(tx)
    }

    /// Publishes an event. Never blocks; a subscriber that's lagged past the
    /// channel capacity simply misses it.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.0.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.0.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_does_not_error() {
        let bus = Bus::new();
        bus.publish(BusEvent::StorageFull);
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = Bus::new();
        let mut rx = bus.subscribe();
        bus.publish(BusEvent::CameraDiscovered { camera_id: "cam1".to_string() });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, BusEvent::CameraDiscovered { camera_id } if camera_id == "cam1"));
    }
}
