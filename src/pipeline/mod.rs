//! Per-camera pipeline: wires Stream Ingest, Frame Sampler, Inference
//! Client, Event Engine, and Clip Recorder into the state machine each
//! camera's capture task runs.

pub mod events;
pub mod ingest;
pub mod inference;
pub mod recorder;
pub mod sampler;

use crate::bus::{Bus, BusEvent};
use crate::camera::PipelineFactory;
use crate::crypto::CryptoService;
use crate::storage::StorageRoot;
use base::shutdown;
use db::camera::Camera;
use events::{EventEngine, EventPolicy, Transition};
use ingest::{IngestFailure, Opener};
use inference::InferenceClient;
use recorder::ClipRecorder;
use sampler::{LatestFrame, Sampler};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Idle,
    Connecting,
    Streaming,
    Stopped,
}

#[derive(Clone)]
pub struct PipelineConfig {
    pub capture_fps: u32,
    pub connect_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub stall_timeout: Duration,
    pub inference_interval_secs: f64,
    pub inference_timeout: Duration,
    pub inference_retries: u32,
    pub confidence_threshold: f64,
    pub enabled_classes: Vec<String>,
    pub event_policy_close_gap: Duration,
    pub event_policy_min_duration: Duration,
    pub event_policy_max_duration: Duration,
    pub pre_event_duration_secs: f64,
    pub clip_duration_secs: f64,
    pub inference_endpoint: String,
}

/// Live state exposed to the Read API: the latest frame and current
/// lifecycle [`State`], independent of whether inference is currently due.
pub struct PipelineHandle {
    pub latest_frame: watch::Receiver<Option<LatestFrame>>,
    pub state: watch::Receiver<State>,
}

/// Keyed by camera id, so the Read API can find a running pipeline's live
/// frame/state without going through the Camera Manager.
pub type LiveHandles = Arc<Mutex<std::collections::HashMap<String, PipelineHandle>>>;

pub struct DefaultPipelineFactory {
    pub db: Arc<Mutex<db::Database>>,
    pub storage: Arc<StorageRoot>,
    pub crypto: Arc<CryptoService>,
    pub bus: Bus,
    pub opener: Arc<dyn Opener>,
    pub config: PipelineConfig,
    pub live: LiveHandles,
}

#[async_trait::async_trait]
impl PipelineFactory for DefaultPipelineFactory {
    fn start(&self, camera: Camera, shutdown: shutdown::Receiver) -> tokio::task::JoinHandle<()> {
        let db = self.db.clone();
        let storage = self.storage.clone();
        let crypto = self.crypto.clone();
        let bus = self.bus.clone();
        let opener = self.opener.clone();
        let config = self.config.clone();
        let live = self.live.clone();
        let camera_id = camera.id.clone();

        let (sampler, sampler_handle) = Sampler::new(config.inference_interval_secs);
        let (state_tx, state_rx) = watch::channel(State::Idle);
        let handle = PipelineHandle { latest_frame: sampler_handle.latest_rx, state: state_rx };

        tokio::spawn(async move {
            live.lock().await.insert(camera_id.clone(), handle);
            run(camera, db, storage, crypto, bus, opener, config, shutdown, sampler, state_tx).await;
            live.lock().await.remove(&camera_id);
        })
    }
}

fn connection_url(camera: &Camera) -> String {
    match (&camera.credentials_user, &camera.credentials_pass) {
        (Some(user), Some(pass)) if camera.connection.contains("://") => {
            let scheme_end = camera.connection.find("://").unwrap() + 3;
            format!("{}{}:{}@{}", &camera.connection[..scheme_end], user, pass, &camera.connection[scheme_end..])
        }
        _ => camera.connection.clone(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    camera: Camera,
    db: Arc<Mutex<db::Database>>,
    storage: Arc<StorageRoot>,
    crypto: Arc<CryptoService>,
    bus: Bus,
    opener: Arc<dyn Opener>,
    config: PipelineConfig,
    mut shutdown: shutdown::Receiver,
    mut sampler: Sampler,
    state_tx: watch::Sender<State>,
) {
    let camera_id = camera.id.clone();
    let inference = InferenceClient::new(
        config.inference_endpoint.clone(),
        config.inference_timeout,
        config.inference_retries,
        config.confidence_threshold,
        config.enabled_classes.clone(),
    );
    let mut events = EventEngine::new(
        db.clone(),
        camera_id.clone(),
        EventPolicy {
            close_gap: config.event_policy_close_gap,
            min_duration: config.event_policy_min_duration,
            max_duration: config.event_policy_max_duration,
        },
    );
    let mut recorder = ClipRecorder::new(
        db,
        storage,
        crypto,
        config.pre_event_duration_secs,
        config.capture_fps,
        config.clip_duration_secs,
    );

    let mut backoff = config.reconnect_initial;
    let connection = connection_url(&camera);

    'reconnect: loop {
        if shutdown.check().is_err() {
            break;
        }
        let _ = state_tx.send(State::Connecting);
        let mut stream = match opener.open(&connection, config.capture_fps) {
            Ok(s) => s,
            Err(e) => {
                warn!(camera_id = %camera_id, error = %e, "ingest subprocess failed to start");
                if shutdown.race(tokio::time::sleep(backoff)).await.is_err() {
                    break;
                }
                backoff = (backoff * 2).min(config.reconnect_max);
                continue 'reconnect;
            }
        };

        let mut first_frame = true;

        loop {
            let read_timeout = if first_frame { config.connect_timeout } else { config.stall_timeout };
            let next = shutdown.race(tokio::time::timeout(read_timeout, stream.next_frame()));
            let outcome = match next.await {
                Err(_shutdown) => {
                    stream.stop().await;
                    break 'reconnect;
                }
                Ok(Err(_timeout)) => {
                    debug!(camera_id = %camera_id, first_frame, "read timed out, reconnecting");
                    break;
                }
                Ok(Ok(result)) => result,
            };

            if first_frame {
                let _ = state_tx.send(State::Streaming);
                backoff = config.reconnect_initial;
                bus.publish(BusEvent::CameraConnected { camera_id: camera_id.clone() });
                first_frame = false;
            }

            let frame = match outcome {
                Ok(frame) => frame,
                Err(IngestFailure::Stopped) => {
                    stream.stop().await;
                    break 'reconnect;
                }
                Err(e) => {
                    warn!(camera_id = %camera_id, error = %e, "ingest read failed, reconnecting");
                    break;
                }
            };

            recorder.push_frame(&frame);
            let Some(for_inference) = sampler.observe(frame) else {
                continue;
            };

            let detections = match inference.infer(for_inference.data).await {
                Ok(d) => d,
                Err(e) => {
                    debug!(camera_id = %camera_id, error = %e, "inference call failed");
                    continue;
                }
            };
            if !detections.is_empty() {
                bus.publish(BusEvent::Detection { camera_id: camera_id.clone(), count: detections.len() });
            }

            match events.on_batch(&detections, for_inference.captured_at).await {
                Ok(Some(Transition::Started(event_id))) => {
                    recorder.start(event_id, for_inference.captured_at);
                }
                Ok(Some(Transition::Extended(event_id))) => {
                    recorder.start(event_id, for_inference.captured_at);
                }
                Ok(Some(Transition::Closed(event_id))) => {
                    if let Err(e) = recorder.stop(event_id).await {
                        warn!(camera_id = %camera_id, error = %e, "clip finalize failed, event left without a clip");
                    } else {
                        bus.publish(BusEvent::ClipRecorded { event_id });
                    }
                    bus.publish(BusEvent::EventClosed { event_id });
                }
                Ok(Some(Transition::DroppedAsNoise(event_id))) => {
                    if let Err(e) = recorder.stop(event_id).await {
                        warn!(camera_id = %camera_id, error = %e, "clip finalize failed, event left without a clip");
                    }
                    bus.publish(BusEvent::EventClosed { event_id });
                }
                Ok(None) => {}
                Err(e) => warn!(camera_id = %camera_id, error = %e, "event engine write failed"),
            }

            if let Ok(true) = recorder.check_duration_elapsed(for_inference.captured_at).await {
                debug!(camera_id = %camera_id, "clip duration elapsed, finalized mid-event");
            }
        }

        bus.publish(BusEvent::CameraDisconnected { camera_id: camera_id.clone() });
    }

    let _ = state_tx.send(State::Stopped);
    info!(camera_id = %camera_id, "pipeline stopped");
}
