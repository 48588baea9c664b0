//! Service Orchestrator: owns the event bus, starts every long-lived service
//! in dependency order, and tears them down in reverse on shutdown.
//!
//! Grounded on the teacher's top-level `cmds::run` service-wiring shape
//! (spawn a task per subsystem, hold its join handle, wait on shutdown) but
//! generalized into a small registry so `main.rs` doesn't have to hand-write
//! the startup/shutdown ordering itself.

use crate::bus::{Bus, BusEvent};
use crate::config::{Config, StorageConfig};
use crate::storage::StorageRoot;
use base::shutdown;
use jiff::{Span, Timestamp};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const DEFAULT_STOP_DEADLINE: Duration = Duration::from_secs(10);
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
const CONFIG_RELOAD_INTERVAL: Duration = Duration::from_secs(30);

struct RunningService {
    name: &'static str,
    shutdown_tx: shutdown::Sender,
    task: tokio::task::JoinHandle<()>,
}

/// Registers services in startup order and stops them in the reverse order
/// on [`Orchestrator::shutdown`]. A service that doesn't stop within
/// `stop_deadline` is abandoned (logged, not waited on further) rather than
/// holding up the rest of the teardown.
pub struct Orchestrator {
    services: Vec<RunningService>,
    pub bus: Bus,
    stop_deadline: Duration,
}

impl Orchestrator {
    pub fn new(bus: Bus) -> Self {
        Orchestrator { services: Vec::new(), bus, stop_deadline: DEFAULT_STOP_DEADLINE }
    }

    /// Spawns `f` with its own shutdown receiver and records it under `name`
    /// in registration order. Call once per service, in startup order.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, f: F)
    where
        F: FnOnce(shutdown::Receiver) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = shutdown::channel();
        let task = tokio::spawn(f(rx));
        self.services.push(RunningService { name, shutdown_tx: tx, task });
        info!(service = name, "started");
        self.bus.publish(BusEvent::ServiceStarted { name: name.to_string() });
    }

    /// Stops every registered service in reverse registration order, each
    /// given up to `stop_deadline` to exit before being abandoned.
    pub async fn shutdown(self) {
        for service in self.services.into_iter().rev() {
            service.shutdown_tx.shutdown();
            match tokio::time::timeout(self.stop_deadline, service.task).await {
                Ok(Ok(())) => {
                    info!(service = service.name, "stopped");
                    self.bus.publish(BusEvent::ServiceStopped { name: service.name.to_string() });
                }
                Ok(Err(e)) => {
                    warn!(service = service.name, error = %e, "service task panicked during shutdown");
                    self.bus.publish(BusEvent::ServiceError { name: service.name.to_string(), message: e.to_string() });
                }
                Err(_) => {
                    warn!(service = service.name, deadline_secs = self.stop_deadline.as_secs(), "service did not stop in time, abandoning");
                    self.bus.publish(BusEvent::ServiceError {
                        name: service.name.to_string(),
                        message: "did not stop within shutdown deadline".to_string(),
                    });
                }
            }
        }
    }
}

/// Hourly retention sweep: age rule first, then the disk-usage watermark
/// rule, deleting each clip's file before its row so the index never points
/// at a file that's already gone.
pub async fn run_retention_sweep(
    db: Arc<Mutex<db::Database>>,
    storage: Arc<StorageRoot>,
    storage_cfg: StorageConfig,
    bus: Bus,
    mut shutdown: shutdown::Receiver,
) {
    loop {
        if let Err(e) = sweep_once(&db, &storage, &storage_cfg, &bus).await {
            warn!(error = %e, "retention sweep failed");
        }
        if shutdown.race(tokio::time::sleep(RETENTION_SWEEP_INTERVAL)).await.is_err() {
            return;
        }
    }
}

async fn sweep_once(
    db: &Arc<Mutex<db::Database>>,
    storage: &Arc<StorageRoot>,
    storage_cfg: &StorageConfig,
    bus: &Bus,
) -> Result<(), base::Error> {
    let max_age = Span::try_from(Duration::from_secs(storage_cfg.retention_days as u64 * 86_400))
        .expect("retention_days fits in a jiff::Span");
    let cutoff = Timestamp::now() - max_age;

    let aged = { db.lock().await.clip().list_older_than(cutoff)? };
    for clip in &aged {
        delete_clip(db, storage, clip.id, &clip.path).await?;
    }
    if !aged.is_empty() {
        debug!(count = aged.len(), "retention sweep: age rule deleted clips");
    }

    let mut percent = storage.disk_usage_percent()?;
    if percent > storage_cfg.max_disk_usage_percent {
        bus.publish(BusEvent::StorageWarning { percent_used: percent });
        let oldest = { db.lock().await.clip().list_oldest_first()? };
        for clip in oldest {
            if percent <= storage_cfg.max_disk_usage_percent {
                break;
            }
            delete_clip(db, storage, clip.id, &clip.path).await?;
            percent = storage.disk_usage_percent()?;
        }
        if percent >= 100 {
            bus.publish(BusEvent::StorageFull);
        }
    }
    Ok(())
}

async fn delete_clip(
    db: &Arc<Mutex<db::Database>>,
    storage: &Arc<StorageRoot>,
    clip_id: uuid::Uuid,
    path: &str,
) -> Result<(), base::Error> {
    storage.remove_clip_file(std::path::Path::new(path))?;
    db.lock().await.clip().delete(clip_id)?;
    Ok(())
}

/// Config hot-reload: polls `path` on an interval, and on each change hands
/// `(old, new)` to `on_change` under a write lock. A config that fails
/// [`Config::validate`] is rejected atomically; the config behind `current`
/// stays in effect.
pub async fn run_config_reload<F>(
    path: std::path::PathBuf,
    current: Arc<RwLock<Config>>,
    on_change: F,
    mut shutdown: shutdown::Receiver,
) where
    F: Fn(&Config, &Config) + Send + Sync,
{
    loop {
        if shutdown.race(tokio::time::sleep(CONFIG_RELOAD_INTERVAL)).await.is_err() {
            return;
        }
        match Config::load(&path) {
            Ok(new) => {
                let mut guard = current.write().await;
                if config_differs(&guard, &new) {
                    info!(?path, "config changed, reloading");
                    on_change(&guard, &new);
                    *guard = new;
                }
            }
            Err(e) => warn!(?path, error = %e, "config reload rejected, keeping prior config in effect"),
        }
    }
}

fn config_differs(old: &Config, new: &Config) -> bool {
    serde_json::to_string(old).ok() != serde_json::to_string(new).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_stops_services_in_reverse_order() {
        let order = std::sync::Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let mut orch = Orchestrator::new(Bus::new());

        for name in ["a", "b", "c"] {
            let order = order.clone();
            orch.spawn(name, move |mut shutdown| async move {
                shutdown.cancelled().await;
                order.lock().await.push(name);
            });
        }
        orch.shutdown().await;
        assert_eq!(*order.lock().await, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn slow_service_is_abandoned_not_awaited_forever() {
        let mut orch = Orchestrator::new(Bus::new());
        orch.stop_deadline = Duration::from_millis(50);
        orch.spawn("stuck", |_shutdown| async move {
            std::future::pending::<()>().await;
        });
        let start = std::time::Instant::now();
        orch.shutdown().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
