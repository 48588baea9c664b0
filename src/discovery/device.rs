//! The local-device probe: scans `discovery.device_root` (`/dev` by default)
//! for `video[0-9]+` character devices and publishes an [`Observation`] for
//! each one that answers a capability query.
//!
//! The actual ioctl query is behind [`CapabilityProbe`] so tests can run
//! without a real V4L2 device node (see `DESIGN.md`'s open-question log:
//! no `v4l`/`v4l2` crate dependency, just the one ioctl this tree needs).

use super::ObservationSender;
use crate::config::DiscoveryConfig;
use db::camera::{Observation, Transport};
use jiff::Timestamp;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// What the probe learns about a `/dev/videoN` node. A real implementation
/// issues `VIDIOC_QUERYCAP`; tests substitute a fake.
pub trait CapabilityProbe: Send + Sync {
    fn probe(&self, path: &Path) -> Option<DeviceCaps>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceCaps {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub has_video: bool,
}

/// Issues `VIDIOC_QUERYCAP` against the device node and reads back the
/// driver/card fields from `struct v4l2_capability`.
pub struct V4l2Probe;

// Layout of `struct v4l2_capability` from <linux/videodev2.h>, trimmed to
// the fields this probe reads.
#[repr(C)]
struct V4l2Capability {
    driver: [u8; 16],
    card: [u8; 32],
    bus_info: [u8; 32],
    version: u32,
    capabilities: u32,
    device_caps: u32,
    reserved: [u32; 3],
}

nix::ioctl_read!(video_query_cap, b'V', 0, V4l2Capability);

impl CapabilityProbe for V4l2Probe {
    fn probe(&self, path: &Path) -> Option<DeviceCaps> {
        use std::os::fd::AsRawFd;
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path).ok()?;
        let mut cap = std::mem::MaybeUninit::<V4l2Capability>::zeroed();
        // SAFETY: `cap` is a valid, zeroed, appropriately-sized buffer for the
        // duration of the ioctl call.
        let rc = unsafe { video_query_cap(file.as_raw_fd(), cap.as_mut_ptr()) };
        if rc.is_err() {
            return None;
        }
        let cap = unsafe { cap.assume_init() };
        let driver = cstr_field(&cap.driver);
        let card = cstr_field(&cap.card);
        Some(DeviceCaps {
            manufacturer: driver,
            model: card,
            has_video: true,
        })
    }
}

fn cstr_field(raw: &[u8]) -> Option<String> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let s = String::from_utf8_lossy(&raw[..end]).trim().to_string();
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Lists `device_root/video[0-9]+` entries, sorted by number.
fn list_video_devices(device_root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(device_root) else {
        return out;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(suffix) = name.strip_prefix("video") else { continue };
        if !suffix.chars().all(|c| c.is_ascii_digit()) || suffix.is_empty() {
            continue;
        }
        out.push(entry.path());
    }
    out.sort();
    out
}

async fn scan_once(tx: &ObservationSender, cfg: &DiscoveryConfig, probe: &dyn CapabilityProbe) {
    for path in list_video_devices(&cfg.device_root) {
        let Some(caps) = probe.probe(&path) else {
            debug!(path = %path.display(), "video device did not answer capability query");
            continue;
        };
        if !caps.has_video {
            continue;
        }
        let id = path.display().to_string();
        let obs = Observation {
            id,
            transport: Transport::LocalDevice,
            connection: path.display().to_string(),
            manufacturer: caps.manufacturer,
            model: caps.model,
            has_ptz: false,
            has_snapshot: true,
            has_video: true,
            observed_at: Timestamp::now(),
        };
        if tx.send(obs).await.is_err() {
            warn!("observation channel closed, stopping device scan early");
            return;
        }
    }
}

/// Runs the local-device probe loop with a real [`V4l2Probe`].
pub async fn run(tx: ObservationSender, cfg: DiscoveryConfig, shutdown: base::shutdown::Receiver) {
    run_with_probe(tx, cfg, shutdown, &V4l2Probe).await
}

async fn run_with_probe(
    tx: ObservationSender,
    cfg: DiscoveryConfig,
    mut shutdown: base::shutdown::Receiver,
    probe: &dyn CapabilityProbe,
) {
    loop {
        scan_once(&tx, &cfg, probe).await;
        if shutdown
            .race(tokio::time::sleep(Duration::from_secs(cfg.interval_secs)))
            .await
            .is_err()
        {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeProbe {
        caps: std::collections::HashMap<PathBuf, DeviceCaps>,
    }

    impl CapabilityProbe for FakeProbe {
        fn probe(&self, path: &Path) -> Option<DeviceCaps> {
            self.caps.get(path).cloned()
        }
    }

    #[test]
    fn lists_only_video_n_entries_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["video0", "video10", "video2", "videoX", "not-a-device", "videocard"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let found = list_video_devices(dir.path());
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["video0", "video10", "video2"]);
    }

    #[tokio::test]
    async fn scan_skips_devices_with_no_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("video0"), b"").unwrap();
        std::fs::write(dir.path().join("video1"), b"").unwrap();

        let mut caps = std::collections::HashMap::new();
        caps.insert(
            dir.path().join("video1"),
            DeviceCaps {
                manufacturer: Some("Acme".to_string()),
                model: Some("Cam 9000".to_string()),
                has_video: true,
            },
        );
        let probe = FakeProbe { caps };

        let cfg = DiscoveryConfig {
            interval_secs: 300,
            probe_window_secs: 3,
            missing_grace_secs: 3600,
            device_root: dir.path().to_owned(),
        };
        let (tx, mut rx) = super::super::channel(4);
        scan_once(&tx, &cfg, &probe).await;
        drop(tx);

        let mut observed = Vec::new();
        while let Some(obs) = rx.recv().await {
            observed.push(obs);
        }
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0].model.as_deref(), Some("Cam 9000"));
        assert_eq!(observed[0].transport, Transport::LocalDevice);
    }
}
