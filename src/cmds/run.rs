//! Foreground service: loads config, brings up every subsystem through the
//! [`crate::orchestrator::Orchestrator`], and runs until an external signal
//! or a fatal startup failure.

use crate::bus::Bus;
use crate::camera::CameraManager;
use crate::config::Config;
use crate::crypto::{self, CryptoService};
use crate::health::HealthRegistry;
use crate::orchestrator::Orchestrator;
use crate::pipeline::{DefaultPipelineFactory, PipelineConfig};
use crate::relay::{HttpRelayClient, LiveRelayStreamer, RelayClient, RelayUploader};
use crate::storage::StorageRoot;
use crate::{discovery, web};
use base::{Error, ResultExt};
use bpaf::Bpaf;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
/// Runs the edge service in the foreground until signalled to stop.
pub struct Args {
    /// Path to the TOML configuration file.
    #[bpaf(long("config"), argument("PATH"), fallback(PathBuf::from("/etc/sentryedge.toml")))]
    config: PathBuf,
}

/// Exit codes per the persisted config/storage/dependency contract: 0 clean
/// shutdown, 1 config invalid, 2 storage init failure, 3 a fatal dependency
/// (the capture binary) is missing.
pub fn run(args: Args) -> Result<i32, Error> {
    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            base::tracing_setup::install(base::tracing_setup::LogFormat::Text);
            error!(error = %e, path = %args.config.display(), "config invalid");
            return Ok(1);
        }
    };
    base::tracing_setup::install(config.log_format());

    if !capture_binary_available() {
        error!("ffmpeg not found on PATH; install it before running the service");
        return Ok(3);
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .err_kind(base::ErrorKind::Internal)?;
    rt.block_on(run_async(args.config, config))
}

fn capture_binary_available() -> bool {
    std::process::Command::new("ffmpeg")
        .arg("-version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok()
}

async fn run_async(config_path: PathBuf, config: Config) -> Result<i32, Error> {
    let storage = match StorageRoot::open(&config.data_dir) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "storage init failed");
            return Ok(2);
        }
    };

    let db = match db::open(&storage.index_db_path()) {
        Ok(d) => Arc::new(Mutex::new(d)),
        Err(e) => {
            error!(error = %e, "local index init failed");
            return Ok(2);
        }
    };

    let crypto = if config.encryption.enabled {
        let user_secret = config
            .encryption
            .user_secret
            .as_deref()
            .expect("validated: user_secret set when encryption.enabled");
        let salt_path = storage.salt_path(&config.encryption.salt_path);
        let salt = crypto::load_or_create_salt(&salt_path)?;
        Arc::new(CryptoService::derive(user_secret, &salt)?)
    } else {
        // A fixed all-zero salt/secret still seals clips at rest (spec §4.7
        // has no "encryption disabled" clip format); it just isn't operator
        // controlled.
        let salt = crypto::load_or_create_salt(&storage.salt_path(std::path::Path::new("crypto/salt")))?;
        Arc::new(CryptoService::derive("sentryedge-default", &salt)?)
    };

    let bus = Bus::new();
    let mut orchestrator = Orchestrator::new(bus.clone());

    // Subscribed before any other service is spawned so no early
    // `ServiceStarted` is missed (the bus drops events with no subscriber).
    let health = HealthRegistry::new();
    {
        let health_rx = bus.subscribe();
        let health = health.clone();
        orchestrator.spawn("health", move |shutdown| health.run(health_rx, shutdown));
    }

    let (obs_tx, obs_rx) = discovery::channel(config.discovery.probe_window_secs.max(1) as usize * 8);
    let discovery_cfg = config.discovery.clone();
    {
        let obs_tx = obs_tx.clone();
        let cfg = discovery_cfg.clone();
        orchestrator.spawn("discovery:multicast", move |shutdown| {
            crate::discovery::multicast::run(obs_tx, cfg, shutdown)
        });
    }
    {
        let cfg = discovery_cfg.clone();
        orchestrator.spawn("discovery:device", move |shutdown| {
            crate::discovery::device::run(obs_tx, cfg, shutdown)
        });
    }

    let live = Arc::new(Mutex::new(std::collections::HashMap::new()));
    let pipeline_config = PipelineConfig {
        capture_fps: config.capture_fps,
        connect_timeout: Duration::from_secs(config.rtsp.timeout_secs),
        reconnect_initial: Duration::from_secs(config.rtsp.reconnect_interval_secs),
        reconnect_max: Duration::from_secs(config.rtsp.reconnect_max_secs),
        stall_timeout: Duration::from_secs(config.rtsp.stall_timeout_secs),
        inference_interval_secs: config.inference_interval_secs,
        inference_timeout: Duration::from_secs(config.inference_timeout_secs),
        inference_retries: config.inference_retries,
        confidence_threshold: config.confidence_threshold,
        enabled_classes: config.enabled_classes.clone(),
        event_policy_close_gap: Duration::from_secs_f64(config.event_close_gap_secs),
        event_policy_min_duration: Duration::from_secs_f64(config.min_event_duration_secs),
        event_policy_max_duration: Duration::from_secs_f64(config.max_event_duration_secs),
        pre_event_duration_secs: config.pre_event_duration_secs,
        clip_duration_secs: config.clip_duration_secs,
        inference_endpoint: config.inference_endpoint.clone().unwrap_or_default(),
    };
    let factory = DefaultPipelineFactory {
        db: db.clone(),
        storage: storage.clone(),
        crypto: crypto.clone(),
        bus: bus.clone(),
        opener: Arc::new(crate::pipeline::ingest::SubprocessOpener),
        config: pipeline_config,
        live: live.clone(),
    };
    let camera_manager = Arc::new(CameraManager::new(
        db.clone(),
        factory,
        Duration::from_secs(config.discovery.missing_grace_secs),
        &config.cameras,
    ));
    {
        let camera_manager = camera_manager.clone();
        orchestrator.spawn("camera-manager", move |shutdown| async move {
            camera_manager.run(obs_rx, shutdown).await;
        });
    }

    if config.relay.enabled {
        let endpoint = config.relay.endpoint.clone().expect("validated: set when relay.enabled");
        let client: Arc<dyn RelayClient> = Arc::new(HttpRelayClient::new(endpoint, Duration::from_secs(30)));
        let uploader = RelayUploader::new(db.clone(), storage.clone(), crypto.clone(), client.clone(), bus.clone(), Some(config.relay.workers));
        orchestrator.spawn("relay-uploader", move |shutdown| async move {
            uploader.run(shutdown).await;
        });

        let streamer = LiveRelayStreamer::new(client, live.clone());
        orchestrator.spawn("relay-live-streamer", move |shutdown| async move {
            streamer.run(shutdown).await;
        });
    }

    {
        let storage = storage.clone();
        let storage_cfg = config.storage.clone();
        let db = db.clone();
        let bus = bus.clone();
        orchestrator.spawn("retention-sweeper", move |shutdown| {
            crate::orchestrator::run_retention_sweep(db, storage, storage_cfg, bus, shutdown)
        });
    }

    {
        let bind: std::net::SocketAddr = config
            .read_api_bind
            .parse()
            .map_err(|e| base::err!(ConfigInvalid, "read_api_bind {}: {e}", config.read_api_bind))?;
        let app_state = Arc::new(web::AppState { db: db.clone(), live: live.clone(), health: health.clone() });
        orchestrator.spawn("read-api", move |shutdown| async move {
            if let Err(e) = web::run(bind, app_state, shutdown).await {
                warn!(error = %e, "read API exited with error");
            }
        });
    }

    {
        let current = Arc::new(RwLock::new(config));
        let on_change = |old: &Config, new: &Config| {
            // Most fields (rtsp timeouts, clip durations, inference thresholds,
            // relay/storage settings) are baked into the pipeline factory,
            // camera manager, and uploader at startup above and only take
            // effect after a restart. Log what changed so an operator knows
            // whether a restart is needed; nothing here mutates running state.
            if old.log.format != new.log.format || old.log.level != new.log.level {
                warn!("log config changed; restart to apply");
            }
            info!("config file changed on disk; most settings require a restart to take effect");
        };
        orchestrator.spawn("config-reload", move |shutdown| {
            crate::orchestrator::run_config_reload(config_path, current, on_change, shutdown)
        });
    }

    info!("sentryedge ready");
    wait_for_signal().await;
    info!("shutdown requested, stopping services");
    orchestrator.shutdown().await;
    info!("clean shutdown");
    Ok(0)
}

/// Waits for SIGINT/SIGTERM. A second signal while shutdown is already in
/// progress forces an immediate exit rather than waiting on a stuck service.
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = int.recv() => {}
        _ = term.recv() => {}
    }
    tokio::spawn(async move {
        tokio::select! {
            _ = int.recv() => {}
            _ = term.recv() => {}
        }
        error!("second shutdown signal received, forcing exit");
        std::process::exit(130);
    });
}
