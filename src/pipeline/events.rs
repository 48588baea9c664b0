//! Event Engine: per-camera state machine translating detection batches into
//! `event` rows, and telling the Clip Recorder when to start/stop capturing.

use super::inference::Detection;
use base::Error;
use db::event::NewEvent;
use jiff::Timestamp;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

pub struct EventPolicy {
    pub close_gap: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
}

/// What the caller (the per-camera pipeline task) should do with the Clip
/// Recorder as a result of feeding in one detection batch.
#[derive(Debug, Eq, PartialEq)]
pub enum Transition {
    Started(Uuid),
    Extended(Uuid),
    /// The event was dropped as noise (shorter than `min_duration`); no clip
    /// row exists to finalize.
    DroppedAsNoise(Uuid),
    Closed(Uuid),
}

struct OpenEvent {
    id: Uuid,
    started_at: Timestamp,
    last_detection_at: Timestamp,
}

pub struct EventEngine {
    db: Arc<Mutex<db::Database>>,
    camera_id: String,
    policy: EventPolicy,
    open: Option<OpenEvent>,
}

impl EventEngine {
    pub fn new(db: Arc<Mutex<db::Database>>, camera_id: String, policy: EventPolicy) -> Self {
        EventEngine { db, camera_id, policy, open: None }
    }

    /// Feeds in the (possibly empty) filtered detection set for one sampled
    /// frame. `now` is the detection batch's timestamp.
    pub async fn on_batch(&mut self, detections: &[Detection], now: Timestamp) -> Result<Option<Transition>, Error> {
        if detections.is_empty() {
            return self.maybe_close(now).await;
        }

        let peak = detections.iter().map(|d| d.confidence).fold(0.0_f64, f64::max);
        let classes: Vec<String> = {
            let mut v: Vec<String> = detections.iter().map(|d| d.class.clone()).collect();
            v.sort();
            v.dedup();
            v
        };

        if let Some(open) = &mut self.open {
            let id = open.id;
            self.db.lock().await.event().extend(id, now, peak, &classes)?;
            open.last_detection_at = now;
            if now.duration_since(open.started_at).unsigned_abs() >= self.policy.max_duration {
                return self.close(now).await;
            }
            return Ok(Some(Transition::Extended(id)));
        }

        let id = Uuid::now_v7();
        let new_event = NewEvent {
            id,
            camera_id: self.camera_id.clone(),
            started_at: now,
            peak_confidence: peak,
            class_set: classes,
            poster_snapshot_id: None,
        };
        self.db.lock().await.event().open(&new_event)?;
        self.open = Some(OpenEvent { id, started_at: now, last_detection_at: now });
        Ok(Some(Transition::Started(id)))
    }

    async fn maybe_close(&mut self, now: Timestamp) -> Result<Option<Transition>, Error> {
        let Some(open) = &self.open else { return Ok(None) };
        if now.duration_since(open.last_detection_at).unsigned_abs() > self.policy.close_gap {
            return self.close(now).await;
        }
        Ok(None)
    }

    async fn close(&mut self, now: Timestamp) -> Result<Option<Transition>, Error> {
        let Some(open) = self.open.take() else { return Ok(None) };
        let duration = now.duration_since(open.started_at).unsigned_abs();
        if duration < self.policy.min_duration {
            // Too short to be real; the row stays (it's already persisted)
            // but the caller is told there's no clip to finalize.
            return Ok(Some(Transition::DroppedAsNoise(open.id)));
        }
        Ok(Some(Transition::Closed(open.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(db: Arc<Mutex<db::Database>>) -> EventEngine {
        EventEngine::new(
            db,
            "cam1".to_string(),
            EventPolicy {
                close_gap: Duration::from_secs(5),
                min_duration: Duration::from_secs(0),
                max_duration: Duration::from_secs(300),
            },
        )
    }

    fn det(class: &str, conf: f64) -> Detection {
        Detection { class: class.to_string(), confidence: conf, bbox: None }
    }

    #[tokio::test]
    async fn opens_extends_and_closes_on_gap() {
        let db = Arc::new(Mutex::new(db::testutil::open_in_memory()));
        let mut e = engine(db.clone());

        let t0 = Timestamp::from_second(1000).unwrap();
        let r = e.on_batch(&[det("person", 0.9)], t0).await.unwrap();
        assert!(matches!(r, Some(Transition::Started(_))));

        let t1 = Timestamp::from_second(1001).unwrap();
        let r = e.on_batch(&[det("vehicle", 0.95)], t1).await.unwrap();
        assert!(matches!(r, Some(Transition::Extended(_))));

        // Empty batch inside the close gap: no transition yet.
        let t2 = Timestamp::from_second(1003).unwrap();
        assert_eq!(e.on_batch(&[], t2).await.unwrap(), None);

        // Empty batch past the close gap: closes.
        let t3 = Timestamp::from_second(1010).unwrap();
        let r = e.on_batch(&[], t3).await.unwrap();
        assert!(matches!(r, Some(Transition::Closed(_))));

        let ev = db.lock().await.event().list(Some("cam1"), None, 10).unwrap();
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].peak_confidence, 0.95);
        assert_eq!(ev[0].class_set, vec!["person".to_string(), "vehicle".to_string()]);
    }

    #[tokio::test]
    async fn max_duration_forces_close_while_still_detecting() {
        let db = Arc::new(Mutex::new(db::testutil::open_in_memory()));
        let mut e = EventEngine::new(
            db,
            "cam1".to_string(),
            EventPolicy {
                close_gap: Duration::from_secs(5),
                min_duration: Duration::from_secs(0),
                max_duration: Duration::from_secs(10),
            },
        );
        let t0 = Timestamp::from_second(1000).unwrap();
        e.on_batch(&[det("person", 0.9)], t0).await.unwrap();
        let t1 = Timestamp::from_second(1011).unwrap();
        let r = e.on_batch(&[det("person", 0.9)], t1).await.unwrap();
        assert!(matches!(r, Some(Transition::Closed(_))));
    }

    #[tokio::test]
    async fn short_event_reported_as_noise() {
        let db = Arc::new(Mutex::new(db::testutil::open_in_memory()));
        let mut e = EventEngine::new(
            db,
            "cam1".to_string(),
            EventPolicy {
                close_gap: Duration::from_secs(1),
                min_duration: Duration::from_secs(5),
                max_duration: Duration::from_secs(300),
            },
        );
        let t0 = Timestamp::from_second(1000).unwrap();
        e.on_batch(&[det("person", 0.9)], t0).await.unwrap();
        let t1 = Timestamp::from_second(1002).unwrap();
        let r = e.on_batch(&[], t1).await.unwrap();
        assert!(matches!(r, Some(Transition::DroppedAsNoise(_))));
    }
}
