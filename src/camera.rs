//! Camera Manager: owns the persisted camera roster, reconciles Discovery's
//! observations against it, and enforces the at-most-one-running-pipeline-
//! per-camera invariant.
//!
//! Pipeline lifecycle is behind [`PipelineFactory`] so this module never
//! needs to know what a pipeline actually does (Stream Ingest, Frame
//! Sampler, ...) — it only starts one, holds its shutdown handle, and stops
//! it. This mirrors the teacher's general pattern of an `Opener`-style
//! trait seam at service boundaries, used elsewhere for testability.

use crate::config::CameraConfig;
use crate::discovery::ObservationReceiver;
use base::{shutdown, Error, ErrorKind, ResultExt};
use db::camera::Camera;
use jiff::Timestamp;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Starts and owns the lifetime of a per-camera pipeline task.
#[async_trait::async_trait]
pub trait PipelineFactory: Send + Sync {
    fn start(&self, camera: Camera, shutdown: shutdown::Receiver) -> tokio::task::JoinHandle<()>;
}

struct RunningPipeline {
    shutdown_tx: shutdown::Sender,
    task: tokio::task::JoinHandle<()>,
}

pub struct CameraManager<F: PipelineFactory> {
    db: Arc<Mutex<db::Database>>,
    pipelines: Mutex<HashMap<String, RunningPipeline>>,
    factory: F,
    missing_grace: std::time::Duration,
    camera_configs: HashMap<String, CameraConfig>,
}

impl<F: PipelineFactory> CameraManager<F> {
    pub fn new(
        db: Arc<Mutex<db::Database>>,
        factory: F,
        missing_grace: std::time::Duration,
        camera_configs: &[CameraConfig],
    ) -> Self {
        CameraManager {
            db,
            pipelines: Mutex::new(HashMap::new()),
            factory,
            missing_grace,
            camera_configs: camera_configs.iter().map(|c| (c.camera_id.clone(), c.clone())).collect(),
        }
    }

    pub async fn list(&self) -> Result<Vec<Camera>, Error> {
        self.db.lock().await.camera().list()
    }

    pub async fn enable(&self, id: &str) -> Result<(), Error> {
        self.db.lock().await.camera().set_enabled(id, true)?;
        self.ensure_pipeline(id).await
    }

    pub async fn disable(&self, id: &str) -> Result<(), Error> {
        self.db.lock().await.camera().set_enabled(id, false)?;
        self.stop_pipeline(id).await;
        Ok(())
    }

    /// Stops the pipeline and soft-deletes the row; historical events are
    /// retained.
    pub async fn remove(&self, id: &str) -> Result<(), Error> {
        self.stop_pipeline(id).await;
        self.db.lock().await.camera().remove(id)
    }

    /// Registers a camera on an explicit operator command, distinct from the
    /// discovery-driven [`Self::reconcile`] path: an operator may know about
    /// a camera (e.g. one behind a firewall that multicast/local-device
    /// probing can't see) before Discovery ever observes it.
    pub async fn register(&self, obs: db::camera::Observation) -> Result<(), Error> {
        let id = obs.id.clone();
        self.db.lock().await.camera().register(&obs)?;
        self.apply_camera_config(&id).await?;
        self.ensure_pipeline(&id).await
    }

    /// Drives reconciliation off Discovery's observation stream until the
    /// channel closes or shutdown is requested. One reconciliation pass
    /// covers everything observed since the previous pass, so a burst of
    /// per-camera observations from a single discovery tick becomes one
    /// `camera::Store::reconcile` call.
    pub async fn run(self: Arc<Self>, mut obs_rx: ObservationReceiver, mut shutdown: shutdown::Receiver) {
        let mut batch = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    break;
                }
                received = obs_rx.recv() => {
                    let Some(obs) = received else { break };
                    batch.push(obs);
                    while let Ok(obs) = obs_rx.try_recv() {
                        batch.push(obs);
                    }
                    let observed = std::mem::take(&mut batch);
                    if let Err(e) = self.reconcile(observed).await {
                        warn!(error = %e, "camera reconciliation failed");
                    }
                }
            }
        }
        info!("camera manager reconciliation loop exiting");
    }

    async fn reconcile(&self, observed: Vec<db::camera::Observation>) -> Result<(), Error> {
        let outcome = self.db.lock().await.camera().reconcile(&observed)?;

        for id in &outcome.new {
            self.apply_camera_config(id).await?;
            self.ensure_pipeline(id).await?;
        }
        for id in &outcome.still_present {
            self.ensure_pipeline(id).await?;
        }
        for id in &outcome.missing {
            self.handle_missing(id).await?;
        }
        Ok(())
    }

    /// Applies an operator-supplied `[[cameras]]` block (credentials,
    /// enabled override) the first time a matching camera is discovered.
    async fn apply_camera_config(&self, id: &str) -> Result<(), Error> {
        let Some(cfg) = self.camera_configs.get(id) else {
            return Ok(());
        };
        let store_has_creds = cfg.username.is_some() || cfg.password.is_some();
        let db = self.db.lock().await;
        if store_has_creds {
            db.camera()
                .set_credentials(id, cfg.username.as_deref(), cfg.password.as_deref())?;
        }
        if !cfg.enabled {
            db.camera().set_enabled(id, false)?;
        }
        Ok(())
    }

    async fn ensure_pipeline(&self, id: &str) -> Result<(), Error> {
        let camera = self
            .db
            .lock()
            .await
            .camera()
            .get(id)?
            .ok_or_else(|| base::err!(NotFound, "camera {id} disappeared mid-reconciliation"))?;
        if !camera.enabled {
            return Ok(());
        }
        let mut pipelines = self.pipelines.lock().await;
        if pipelines.contains_key(id) {
            return Ok(());
        }
        let (tx, rx) = shutdown::channel();
        let task = self.factory.start(camera, rx);
        pipelines.insert(id.to_string(), RunningPipeline { shutdown_tx: tx, task });
        info!(camera_id = id, "pipeline started");
        Ok(())
    }

    async fn stop_pipeline(&self, id: &str) {
        let running = self.pipelines.lock().await.remove(id);
        if let Some(running) = running {
            running.shutdown_tx.shutdown();
            if let Err(e) = running.task.await {
                warn!(camera_id = id, error = %e, "pipeline task panicked during teardown");
            }
            info!(camera_id = id, "pipeline stopped");
        }
    }

    /// A camera absent from this tick's observations is not torn down on a
    /// single miss: it is marked `stale` and only torn down once
    /// `missing_grace` has elapsed since `last_seen`.
    async fn handle_missing(&self, id: &str) -> Result<(), Error> {
        let camera = {
            let db = self.db.lock().await;
            let Some(camera) = db.camera().get(id)? else {
                return Ok(());
            };
            if camera.status != db::camera::Status::Stale {
                db.camera().mark_stale(id)?;
            }
            camera
        };
        let elapsed = Timestamp::now().duration_since(camera.last_seen);
        if elapsed.unsigned_abs() >= self.missing_grace {
            self.stop_pipeline(id).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::camera::{Observation, Transport};

    struct NoopFactory;

    #[async_trait::async_trait]
    impl PipelineFactory for NoopFactory {
        fn start(&self, _camera: Camera, mut shutdown: shutdown::Receiver) -> tokio::task::JoinHandle<()> {
            tokio::spawn(async move {
                shutdown.cancelled().await;
            })
        }
    }

    fn obs(id: &str) -> Observation {
        Observation {
            id: id.to_string(),
            transport: Transport::LocalDevice,
            connection: "/dev/video0".to_string(),
            manufacturer: None,
            model: None,
            has_ptz: false,
            has_snapshot: true,
            has_video: true,
            observed_at: Timestamp::now(),
        }
    }

    fn manager() -> Arc<CameraManager<NoopFactory>> {
        let db = db::testutil::open_in_memory();
        Arc::new(CameraManager::new(
            Arc::new(Mutex::new(db)),
            NoopFactory,
            std::time::Duration::from_secs(3600),
            &[],
        ))
    }

    #[tokio::test]
    async fn reconcile_starts_pipeline_for_new_camera() {
        let mgr = manager();
        mgr.reconcile(vec![obs("cam1")]).await.unwrap();
        assert!(mgr.pipelines.lock().await.contains_key("cam1"));
        let cams = mgr.list().await.unwrap();
        assert_eq!(cams.len(), 1);
    }

    #[tokio::test]
    async fn missing_camera_marked_stale_before_teardown() {
        let mgr = manager();
        mgr.reconcile(vec![obs("cam1")]).await.unwrap();
        mgr.reconcile(vec![]).await.unwrap();
        let cam = mgr.db.lock().await.camera().get("cam1").unwrap().unwrap();
        assert_eq!(cam.status, db::camera::Status::Stale);
        // Within the grace period, the pipeline is still running.
        assert!(mgr.pipelines.lock().await.contains_key("cam1"));
    }

    #[tokio::test]
    async fn disable_stops_pipeline() {
        let mgr = manager();
        mgr.reconcile(vec![obs("cam1")]).await.unwrap();
        mgr.disable("cam1").await.unwrap();
        assert!(!mgr.pipelines.lock().await.contains_key("cam1"));
        let cam = mgr.db.lock().await.camera().get("cam1").unwrap().unwrap();
        assert!(!cam.enabled);
    }

    #[tokio::test]
    async fn remove_retains_row_as_soft_deleted() {
        let mgr = manager();
        mgr.reconcile(vec![obs("cam1")]).await.unwrap();
        mgr.remove("cam1").await.unwrap();
        assert!(!mgr.pipelines.lock().await.contains_key("cam1"));
        assert!(mgr.db.lock().await.camera().get("cam1").unwrap().is_none());
    }
}
