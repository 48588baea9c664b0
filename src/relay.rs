//! Relay Uploader: a fixed worker pool dequeues finalized events from the
//! Local Index oldest-first and pushes them over the tunnel-protected RPC
//! stub [`RelayClient`]. Uploads are at-least-once; the server is expected
//! to deduplicate by `event_id`.
//!
//! Also carries [`LiveRelayStreamer`], the narrow on-demand live-video path:
//! general live relay is out of scope, but a relay-initiated, short-lived
//! stream request per event is not.

use crate::bus::{Bus, BusEvent};
use crate::crypto::CryptoService;
use crate::pipeline::LiveHandles;
use crate::storage::StorageRoot;
use async_trait::async_trait;
use base::shutdown;
use bytes::Bytes;
use db::event::{Event, RelayState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_WORKERS: usize = 2;
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30 * 60);
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEQUEUE_BATCH: u32 = 16;
const STREAM_POLL_INTERVAL: Duration = Duration::from_secs(5);
const STREAM_FRAME_INTERVAL: Duration = Duration::from_millis(500);

/// The payload sent to the off-site relay: the event row plus whatever
/// sealed bytes exist for it. Clip/poster are optional — a finalization
/// failure leaves `clip_id = null` and the event still uploads as
/// metadata-only (§4.4's failure note).
#[derive(Debug, Clone)]
pub struct UploadPayload {
    pub event: Event,
    pub sealed_clip: Option<Vec<u8>>,
    pub sealed_poster: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SendOutcome {
    Uploaded,
    Retryable,
    Permanent,
}

/// A relay-initiated request to stream one camera's live frames for a
/// bounded duration, tied to the event that prompted operator attention.
/// Covers the "no live video relay except on explicit, short-lived
/// request" carve-out: general live relay is out of scope, this narrow
/// on-demand path isn't.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub event_id: Uuid,
    pub camera_id: String,
    pub duration: Duration,
}

/// The RPC stub reaching the off-premise relay through the tunnel. The
/// tunnel itself is out of scope; an implementation only needs to turn a
/// payload into one of the three outcomes above.
#[async_trait]
pub trait RelayClient: Send + Sync {
    async fn send(&self, payload: UploadPayload) -> SendOutcome;

    /// Polls for pending live-stream requests. An empty vec means nothing
    /// to do; the default is a no-op for clients that never request live
    /// streaming.
    async fn poll_stream_requests(&self) -> Result<Vec<StreamRequest>, ()> {
        Ok(Vec::new())
    }

    /// Pushes one frame of an in-progress live stream.
    async fn push_stream_frame(&self, _event_id: Uuid, _frame: Bytes) -> SendOutcome {
        SendOutcome::Uploaded
    }
}

/// `reqwest`-backed client for a relay reachable as a plain HTTP endpoint
/// over the tunnel (no gRPC stack carried here; see DESIGN.md).
pub struct HttpRelayClient {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpRelayClient {
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        HttpRelayClient { http: reqwest::Client::new(), endpoint, timeout }
    }
}

#[async_trait]
impl RelayClient for HttpRelayClient {
    async fn send(&self, payload: UploadPayload) -> SendOutcome {
        let mut form = reqwest::multipart::Form::new()
            .text("event_id", payload.event.id.to_string())
            .text("camera_id", payload.event.camera_id.clone())
            .text("started_at", payload.event.started_at.to_string())
            .text("ended_at", payload.event.ended_at.to_string())
            .text("peak_confidence", payload.event.peak_confidence.to_string());
        if let Some(clip) = payload.sealed_clip {
            form = form.part("clip", reqwest::multipart::Part::bytes(clip).file_name("clip.sealed"));
        }
        if let Some(poster) = payload.sealed_poster {
            form = form.part("poster", reqwest::multipart::Part::bytes(poster).file_name("poster.sealed"));
        }

        let result = self.http.post(&self.endpoint).timeout(self.timeout).multipart(form).send().await;
        let response = match result {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return SendOutcome::Retryable,
            Err(_) => return SendOutcome::Retryable,
        };
        let status = response.status();
        if status.is_success() {
            SendOutcome::Uploaded
        } else if status.is_client_error() {
            SendOutcome::Permanent
        } else {
            SendOutcome::Retryable
        }
    }

    async fn poll_stream_requests(&self) -> Result<Vec<StreamRequest>, ()> {
        #[derive(serde::Deserialize)]
        struct Wire {
            event_id: Uuid,
            camera_id: String,
            duration_secs: u64,
        }
        let url = format!("{}/stream-requests", self.endpoint);
        let response = self.http.get(&url).timeout(self.timeout).send().await.map_err(|_| ())?;
        if !response.status().is_success() {
            return Ok(Vec::new());
        }
        let wire: Vec<Wire> = response.json().await.map_err(|_| ())?;
        Ok(wire
            .into_iter()
            .map(|w| StreamRequest { event_id: w.event_id, camera_id: w.camera_id, duration: Duration::from_secs(w.duration_secs) })
            .collect())
    }

    async fn push_stream_frame(&self, event_id: Uuid, frame: Bytes) -> SendOutcome {
        let url = format!("{}/stream/{event_id}", self.endpoint);
        let result = self.http.post(&url).timeout(self.timeout).header("content-type", "image/jpeg").body(frame).send().await;
        match result {
            Ok(r) if r.status().is_success() => SendOutcome::Uploaded,
            Ok(r) if r.status().is_client_error() => SendOutcome::Permanent,
            _ => SendOutcome::Retryable,
        }
    }
}

/// Watches for relay-initiated live-stream requests and, for each one,
/// pushes frames from the camera's existing live-preview channel (the same
/// one the Read API's MJPEG endpoint reads from) for the requested duration.
pub struct LiveRelayStreamer {
    client: Arc<dyn RelayClient>,
    live: LiveHandles,
}

impl LiveRelayStreamer {
    pub fn new(client: Arc<dyn RelayClient>, live: LiveHandles) -> Arc<Self> {
        Arc::new(LiveRelayStreamer { client, live })
    }

    pub async fn run(self: Arc<Self>, mut shutdown: shutdown::Receiver) {
        loop {
            match self.client.poll_stream_requests().await {
                Ok(requests) => {
                    for req in requests {
                        let this = self.clone();
                        let child_shutdown = shutdown.clone();
                        tokio::spawn(this.stream_one(req, child_shutdown));
                    }
                }
                Err(()) => debug!("live-stream request poll failed"),
            }
            if shutdown.race(tokio::time::sleep(STREAM_POLL_INTERVAL)).await.is_err() {
                return;
            }
        }
    }

    async fn stream_one(self: Arc<Self>, req: StreamRequest, mut shutdown: shutdown::Receiver) {
        let rx = {
            let live = self.live.lock().await;
            match live.get(&req.camera_id) {
                Some(handle) => handle.latest_frame.clone(),
                None => return,
            }
        };
        info!(event_id = %req.event_id, camera_id = %req.camera_id, duration_secs = req.duration.as_secs(), "live relay stream starting");
        let deadline = tokio::time::Instant::now() + req.duration;
        loop {
            if tokio::time::Instant::now() >= deadline || shutdown.check().is_err() {
                break;
            }
            if let Some(frame) = rx.borrow().clone() {
                if self.client.push_stream_frame(req.event_id, frame.data).await == SendOutcome::Permanent {
                    warn!(event_id = %req.event_id, "live relay stream rejected by relay, stopping early");
                    break;
                }
            }
            if shutdown.race(tokio::time::sleep(STREAM_FRAME_INTERVAL)).await.is_err() {
                break;
            }
        }
        info!(event_id = %req.event_id, "live relay stream ended");
    }
}

/// Per-event backoff state, held only in memory: a worker that dies loses
/// its accrued backoff, which is fine — the event just gets retried sooner.
struct Backoff {
    next_attempt_allowed: std::time::Instant,
    delay: Duration,
}

impl Backoff {
    fn fresh() -> Self {
        Backoff { next_attempt_allowed: std::time::Instant::now(), delay: BACKOFF_INITIAL }
    }

    fn ready(&self) -> bool {
        std::time::Instant::now() >= self.next_attempt_allowed
    }

    fn bump(&mut self) {
        self.delay = (self.delay * 2).min(BACKOFF_MAX);
        self.next_attempt_allowed = std::time::Instant::now() + self.delay;
    }
}

pub struct RelayUploader {
    db: Arc<Mutex<db::Database>>,
    storage: Arc<StorageRoot>,
    crypto: Arc<CryptoService>,
    client: Arc<dyn RelayClient>,
    bus: Bus,
    workers: usize,
    backoffs: Mutex<HashMap<uuid::Uuid, Backoff>>,
}

impl RelayUploader {
    pub fn new(
        db: Arc<Mutex<db::Database>>,
        storage: Arc<StorageRoot>,
        crypto: Arc<CryptoService>,
        client: Arc<dyn RelayClient>,
        bus: Bus,
        workers: Option<usize>,
    ) -> Arc<Self> {
        Arc::new(RelayUploader {
            db,
            storage,
            crypto,
            client,
            bus,
            workers: workers.unwrap_or(DEFAULT_WORKERS).max(1),
            backoffs: Mutex::new(HashMap::new()),
        })
    }

    pub async fn run(self: Arc<Self>, mut shutdown: shutdown::Receiver) {
        let mut tasks = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers {
            let this = self.clone();
            let rx = shutdown.clone();
            tasks.push(tokio::spawn(this.worker_loop(worker_id, rx)));
        }
        shutdown.cancelled().await;
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, mut shutdown: shutdown::Receiver) {
        loop {
            if shutdown.check().is_err() {
                return;
            }
            match self.dequeue_one().await {
                Some(event) => self.attempt(&event).await,
                None => {
                    if shutdown.race(tokio::time::sleep(IDLE_POLL_INTERVAL)).await.is_err() {
                        return;
                    }
                }
            }
            debug!(worker_id, "relay worker idle tick");
        }
    }

    /// Picks the oldest pending/failed event whose backoff has elapsed and
    /// claims it. Scans a small batch rather than the whole table so one
    /// stuck event doesn't starve the others behind it; claiming (not just
    /// reading) the winning candidate is what keeps two workers from
    /// `attempt()`-ing the same event at once.
    async fn dequeue_one(&self) -> Option<Event> {
        let candidates = {
            let mut db = self.db.lock().await;
            db.event().list_for_relay(DEQUEUE_BATCH).ok()?
        };
        let ready_ids: Vec<_> = {
            let backoffs = self.backoffs.lock().await;
            candidates
                .into_iter()
                .filter(|event| backoffs.get(&event.id).map(Backoff::ready).unwrap_or(true))
                .map(|event| event.id)
                .collect()
        };
        let mut db = self.db.lock().await;
        for id in ready_ids {
            if let Ok(Some(event)) = db.event().claim(id) {
                return Some(event);
            }
            // Another worker claimed it first (or a concurrent writer moved
            // it out of pending/failed); try the next candidate.
        }
        None
    }

    async fn attempt(&self, event: &Event) {
        let sealed_clip = self.load_sealed_clip(event).await;
        let payload = UploadPayload { event: event.clone(), sealed_clip, sealed_poster: None };

        let outcome = self.client.send(payload).await;
        let mut db = self.db.lock().await;
        match outcome {
            SendOutcome::Uploaded => {
                if let Err(e) = db.event().set_relay_state(event.id, RelayState::Uploaded) {
                    warn!(event_id = %event.id, error = %e, "failed to record relay upload");
                }
                self.backoffs.lock().await.remove(&event.id);
                info!(event_id = %event.id, "event uploaded to relay");
            }
            SendOutcome::Retryable => {
                if let Err(e) = db.event().record_retry(event.id) {
                    warn!(event_id = %event.id, error = %e, "failed to record relay retry");
                }
                let mut backoffs = self.backoffs.lock().await;
                backoffs.entry(event.id).or_insert_with(Backoff::fresh).bump();
                debug!(event_id = %event.id, "relay upload failed, retrying with backoff");
            }
            SendOutcome::Permanent => {
                if let Err(e) = db.event().set_relay_state(event.id, RelayState::Failed) {
                    warn!(event_id = %event.id, error = %e, "failed to record relay failure");
                }
                self.backoffs.lock().await.remove(&event.id);
                self.bus.publish(BusEvent::RelayFailed { event_id: event.id });
                warn!(event_id = %event.id, "relay upload permanently rejected");
            }
        }
    }

    async fn load_sealed_clip(&self, event: &Event) -> Option<Vec<u8>> {
        let clip_id = event.clip_id?;
        let clip = { self.db.lock().await.clip().get(clip_id).ok()?? };
        let path = std::path::Path::new(&clip.path);
        std::fs::read(path).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::event::NewEvent;
    use jiff::Timestamp;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct ScriptedClient {
        outcomes: Mutex<Vec<SendOutcome>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RelayClient for ScriptedClient {
        async fn send(&self, _payload: UploadPayload) -> SendOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().await;
            if outcomes.is_empty() {
                SendOutcome::Retryable
            } else {
                outcomes.remove(0)
            }
        }
    }

    fn uploader_with(
        db: Arc<Mutex<db::Database>>,
        outcomes: Vec<SendOutcome>,
    ) -> (Arc<RelayUploader>, Arc<ScriptedClient>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(StorageRoot::open(dir.path()).unwrap());
        let crypto = Arc::new(CryptoService::derive("secret", &[7u8; 32]).unwrap());
        let client = Arc::new(ScriptedClient { outcomes: Mutex::new(outcomes), calls: AtomicUsize::new(0) });
        let uploader = RelayUploader::new(db, storage, crypto, client.clone(), Bus::new(), Some(1));
        (uploader, client)
    }

    async fn seed_event(db: &Arc<Mutex<db::Database>>, camera_id: &str) -> Uuid {
        let id = Uuid::now_v7();
        let mut guard = db.lock().await;
        guard
            .camera()
            .register(&db::camera::Observation {
                id: camera_id.to_string(),
                transport: db::camera::Transport::LocalDevice,
                connection: "/dev/video0".to_string(),
                manufacturer: None,
                model: None,
                has_ptz: false,
                has_snapshot: true,
                has_video: true,
                observed_at: Timestamp::now(),
            })
            .unwrap();
        guard
            .event()
            .open(&NewEvent {
                id,
                camera_id: camera_id.to_string(),
                started_at: Timestamp::now(),
                peak_confidence: 0.9,
                class_set: vec!["person".to_string()],
                poster_snapshot_id: None,
            })
            .unwrap();
        id
    }

    #[tokio::test]
    async fn successful_send_marks_event_uploaded() {
        let db = Arc::new(Mutex::new(db::testutil::open_in_memory()));
        let event_id = seed_event(&db, "cam1").await;
        let (uploader, client) = uploader_with(db.clone(), vec![SendOutcome::Uploaded]);

        let event = db.lock().await.event().get(event_id).unwrap().unwrap();
        uploader.attempt(&event).await;

        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        let updated = db.lock().await.event().get(event_id).unwrap().unwrap();
        assert_eq!(updated.relay_state, RelayState::Uploaded);
    }

    #[tokio::test]
    async fn permanent_failure_marks_failed_and_publishes_bus_event() {
        let db = Arc::new(Mutex::new(db::testutil::open_in_memory()));
        let event_id = seed_event(&db, "cam1").await;
        let (uploader, _client) = uploader_with(db.clone(), vec![SendOutcome::Permanent]);
        let mut bus_rx = uploader.bus.subscribe();

        let event = db.lock().await.event().get(event_id).unwrap().unwrap();
        uploader.attempt(&event).await;

        let updated = db.lock().await.event().get(event_id).unwrap().unwrap();
        assert_eq!(updated.relay_state, RelayState::Failed);
        let published = bus_rx.recv().await.unwrap();
        assert!(matches!(published, BusEvent::RelayFailed { event_id: id } if id == event_id));
    }

    #[tokio::test]
    async fn retryable_failure_leaves_pending_and_bumps_attempts() {
        let db = Arc::new(Mutex::new(db::testutil::open_in_memory()));
        let event_id = seed_event(&db, "cam1").await;
        let (uploader, _client) = uploader_with(db.clone(), vec![SendOutcome::Retryable]);

        let event = db.lock().await.event().get(event_id).unwrap().unwrap();
        uploader.attempt(&event).await;

        let updated = db.lock().await.event().get(event_id).unwrap().unwrap();
        assert_eq!(updated.relay_state, RelayState::Pending);
        assert_eq!(updated.relay_attempts, 1);
        assert!(!uploader.backoffs.lock().await.is_empty());
    }

    #[tokio::test]
    async fn dequeue_skips_events_still_in_backoff() {
        let db = Arc::new(Mutex::new(db::testutil::open_in_memory()));
        let event_id = seed_event(&db, "cam1").await;
        let (uploader, _client) = uploader_with(db.clone(), vec![]);

        uploader.backoffs.lock().await.insert(
            event_id,
            Backoff { next_attempt_allowed: std::time::Instant::now() + Duration::from_secs(60), delay: BACKOFF_INITIAL },
        );
        assert!(uploader.dequeue_one().await.is_none());
    }

    struct StreamingClient {
        frames_received: AtomicUsize,
    }

    #[async_trait]
    impl RelayClient for StreamingClient {
        async fn send(&self, _payload: UploadPayload) -> SendOutcome {
            SendOutcome::Uploaded
        }

        async fn push_stream_frame(&self, _event_id: Uuid, _frame: Bytes) -> SendOutcome {
            self.frames_received.fetch_add(1, Ordering::SeqCst);
            SendOutcome::Uploaded
        }
    }

    #[tokio::test]
    async fn live_stream_pushes_frames_until_duration_elapses() {
        use crate::pipeline::sampler::LatestFrame;
        use crate::pipeline::{PipelineHandle, State};
        use tokio::sync::watch;

        let (frame_tx, frame_rx) = watch::channel(Some(LatestFrame { data: Bytes::from_static(b"jpeg"), captured_at: jiff::Timestamp::now() }));
        let (_state_tx, state_rx) = watch::channel(State::Streaming);
        let live: LiveHandles = Arc::new(Mutex::new(std::collections::HashMap::new()));
        live.lock().await.insert("cam1".to_string(), PipelineHandle { latest_frame: frame_rx, state: state_rx });
        let _keep_alive = frame_tx;

        let client = Arc::new(StreamingClient { frames_received: AtomicUsize::new(0) });
        let streamer = LiveRelayStreamer::new(client.clone(), live);
        let req = StreamRequest { event_id: Uuid::now_v7(), camera_id: "cam1".to_string(), duration: Duration::from_millis(1600) };
        let (_tx, shutdown_rx) = base::shutdown::channel();

        streamer.stream_one(req, shutdown_rx).await;
        assert!(client.frames_received.load(Ordering::SeqCst) >= 2);
    }
}
