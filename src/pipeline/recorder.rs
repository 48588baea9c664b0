//! Clip Recorder: a per-camera rolling pre-roll buffer plus the active
//! capture it hands off to on an Event Engine trigger, sealed and persisted
//! on finalize.

use super::ingest::Frame;
use crate::crypto::CryptoService;
use crate::storage::StorageRoot;
use base::{err, Error, ErrorKind};
use bytes::Bytes;
use jiff::Timestamp;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

struct ActiveCapture {
    event_id: Uuid,
    clip_id: Uuid,
    started_at: Timestamp,
    ended_at: Timestamp,
    frames: Vec<Bytes>,
}

pub struct ClipRecorder {
    db: Arc<Mutex<db::Database>>,
    storage: Arc<StorageRoot>,
    crypto: Arc<CryptoService>,
    pre_roll: VecDeque<Bytes>,
    pre_roll_capacity: usize,
    active: Option<ActiveCapture>,
    clip_duration: Duration,
}

impl ClipRecorder {
    pub fn new(
        db: Arc<Mutex<db::Database>>,
        storage: Arc<StorageRoot>,
        crypto: Arc<CryptoService>,
        pre_event_duration_secs: f64,
        capture_fps: u32,
        clip_duration_secs: f64,
    ) -> Self {
        let pre_roll_capacity = ((pre_event_duration_secs * capture_fps as f64).ceil() as usize).max(1);
        ClipRecorder {
            db,
            storage,
            crypto,
            pre_roll: VecDeque::with_capacity(pre_roll_capacity),
            pre_roll_capacity,
            active: None,
            clip_duration: Duration::from_secs_f64(clip_duration_secs),
        }
    }

    /// Every captured frame passes through here, whether or not a capture is
    /// active: it keeps the pre-roll warm and, if active, extends the clip.
    pub fn push_frame(&mut self, frame: &Frame) {
        if self.pre_roll.len() >= self.pre_roll_capacity {
            self.pre_roll.pop_front();
        }
        self.pre_roll.push_back(frame.data.clone());
        if let Some(active) = &mut self.active {
            active.frames.push(frame.data.clone());
            active.ended_at = frame.captured_at;
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.active.is_some()
    }

    /// Starts a new capture seeded with the current pre-roll, or extends the
    /// one already running (at most one active capture per camera).
    pub fn start(&mut self, event_id: Uuid, now: Timestamp) {
        if let Some(active) = &mut self.active {
            active.ended_at = now;
            return;
        }
        let frames: Vec<Bytes> = self.pre_roll.iter().cloned().collect();
        self.active = Some(ActiveCapture { event_id, clip_id: Uuid::now_v7(), started_at: now, ended_at: now, frames });
    }

    /// Finalizes if `clip_duration` has elapsed since the capture started.
    pub async fn check_duration_elapsed(&mut self, now: Timestamp) -> Result<bool, Error> {
        let Some(active) = &self.active else { return Ok(false) };
        if now.duration_since(active.started_at).unsigned_abs() >= self.clip_duration {
            self.finalize().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// The Event Engine asked to stop (event closed). No-op if nothing is
    /// being captured for this event.
    pub async fn stop(&mut self, event_id: Uuid) -> Result<(), Error> {
        if self.active.as_ref().map(|a| a.event_id) == Some(event_id) {
            self.finalize().await?;
        }
        Ok(())
    }

    /// Writes the frame sequence to a temp file, seals it, renames into the
    /// date-bucketed clip tree, and inserts the `clip` row. A failure here
    /// means the event keeps `clip_id = null` and is left for the Relay
    /// Uploader to send metadata-only; it is the caller's job not to treat
    /// that as fatal.
    async fn finalize(&mut self) -> Result<(), Error> {
        let active = self.active.take().ok_or_else(|| err!(Internal, "finalize called with no active capture"))?;

        let mut unsealed = Vec::new();
        for frame in &active.frames {
            unsealed.extend_from_slice(frame);
        }
        let unsealed_size = unsealed.len() as i64;

        let final_path = self.storage.clip_path(active.clip_id, active.ended_at)?;
        let tmp_path = final_path.with_extension("mjpeg.tmp");
        self.storage.write_atomic(&tmp_path, &unsealed)?;

        let sealed = self.crypto.seal(&unsealed)?;
        self.storage.write_atomic(&final_path, &sealed)?;
        self.storage.remove_clip_file(&tmp_path)?;

        let clip = db::clip::Clip {
            id: active.clip_id,
            event_id: active.event_id,
            path: final_path.display().to_string(),
            unsealed_size,
            sealed_size: sealed.len() as i64,
            duration_ms: active.ended_at.duration_since(active.started_at).unsigned_abs().as_millis() as i64,
            started_at: active.started_at,
            ended_at: active.ended_at,
            key_hash: self.crypto.key_hash().to_string(),
        };
        let mut db = self.db.lock().await;
        db.clip().insert(&clip)?;
        db.event().set_clip(active.event_id, active.clip_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_at(secs: i64, byte: u8) -> Frame {
        Frame { data: Bytes::from(vec![byte; 4]), captured_at: Timestamp::from_second(secs).unwrap() }
    }

    fn recorder(dir: &std::path::Path) -> (ClipRecorder, Arc<Mutex<db::Database>>) {
        let storage = Arc::new(StorageRoot::open(dir).unwrap());
        let crypto = Arc::new(CryptoService::derive("secret", &[3u8; 32]).unwrap());
        let db = Arc::new(Mutex::new(db::testutil::open_in_memory()));
        (ClipRecorder::new(db.clone(), storage, crypto, 2.0, 10, 10.0), db)
    }

    #[test]
    fn pre_roll_evicts_oldest_once_full() {
        let dir = tempfile::tempdir().unwrap();
        let (mut r, _db) = recorder(dir.path());
        for i in 0..30 {
            r.push_frame(&frame_at(1000 + i, i as u8));
        }
        assert_eq!(r.pre_roll.len(), r.pre_roll_capacity);
    }

    #[tokio::test]
    async fn start_then_stop_persists_clip_and_links_event() {
        let dir = tempfile::tempdir().unwrap();
        let (mut r, db) = recorder(dir.path());
        let event_id = Uuid::now_v7();
        db.lock()
            .await
            .event()
            .open(&db::event::NewEvent {
                id: event_id,
                camera_id: "cam1".to_string(),
                started_at: Timestamp::from_second(1000).unwrap(),
                peak_confidence: 0.9,
                class_set: vec!["person".to_string()],
                poster_snapshot_id: None,
            })
            .unwrap();

        r.push_frame(&frame_at(999, 1));
        r.start(event_id, Timestamp::from_second(1000).unwrap());
        r.push_frame(&frame_at(1001, 2));
        r.push_frame(&frame_at(1002, 3));
        r.stop(event_id).await.unwrap();

        assert!(!r.is_capturing());
        let ev = db.lock().await.event().get(event_id).unwrap().unwrap();
        let clip_id = ev.clip_id.expect("clip should be linked");
        let clip = db.lock().await.clip().get(clip_id).unwrap().unwrap();
        assert_eq!(clip.event_id, event_id);
        assert!(clip.sealed_size > clip.unsealed_size as i64); // nonce + tag overhead
    }

    #[tokio::test]
    async fn second_trigger_while_active_extends_rather_than_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let (mut r, _db) = recorder(dir.path());
        let event_id = Uuid::now_v7();
        r.start(event_id, Timestamp::from_second(1000).unwrap());
        let first_clip_id = r.active.as_ref().unwrap().clip_id;
        r.start(event_id, Timestamp::from_second(1005).unwrap());
        assert_eq!(r.active.as_ref().unwrap().clip_id, first_clip_id);
    }
}
