//! Storage Root: owns `data_dir`, its exclusive lock, the clip/snapshot
//! directory layout, atomic writes, and disk-usage queries for the
//! retention sweeper.
//!
//! Grounded on the teacher's `cmds::open_dir`/`dir::Fd` flock discipline
//! (`src/cmds/mod.rs`), simplified to plain `std::fs` + `nix::fcntl::flock`
//! instead of a raw-fd `dir::Fd` type, since this tree has no need to reopen
//! the directory by file descriptor for recording-file creation the way
//! Moonfire's sample-file writer does.

use base::{err, Error, ErrorKind, ResultExt};
use jiff::Timestamp;
use nix::fcntl::{flock, FlockArg};
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

pub struct StorageRoot {
    data_dir: PathBuf,
    _lock: File,
}

impl StorageRoot {
    /// Opens (creating if necessary) `data_dir`, lays out the `clips/` and
    /// `snapshots/` subdirectories, and takes an exclusive flock for the
    /// lifetime of the returned value.
    pub fn open(data_dir: &Path) -> Result<Self, Error> {
        std::fs::create_dir_all(data_dir)
            .err_kind_msg(ErrorKind::StorageInitFailed, format!("creating data_dir {}", data_dir.display()))?;
        let lock = File::open(data_dir)
            .err_kind_msg(ErrorKind::StorageInitFailed, format!("opening data_dir {}", data_dir.display()))?;
        flock(lock.as_raw_fd(), FlockArg::LockExclusiveNonblock).map_err(|e| {
            err!(
                StorageInitFailed,
                "unable to get exclusive lock on data_dir {}: {e} (is another instance running?)",
                data_dir.display()
            )
        })?;

        for sub in ["clips", "snapshots", "crypto"] {
            std::fs::create_dir_all(data_dir.join(sub)).err_kind(ErrorKind::StorageInitFailed)?;
        }

        Ok(StorageRoot {
            data_dir: data_dir.to_owned(),
            _lock: lock,
        })
    }

    pub fn index_db_path(&self) -> PathBuf {
        self.data_dir.join("index.db")
    }

    pub fn salt_path(&self, configured: &Path) -> PathBuf {
        if configured.is_absolute() {
            configured.to_owned()
        } else {
            self.data_dir.join(configured)
        }
    }

    pub fn snapshot_path(&self, snapshot_id: uuid::Uuid) -> PathBuf {
        self.data_dir.join("snapshots").join(format!("{snapshot_id}.jpg"))
    }

    /// `clips/YYYY/MM/DD/<clip_id>.sealed`, per spec's persisted layout.
    pub fn clip_path(&self, clip_id: uuid::Uuid, ended_at: Timestamp) -> Result<PathBuf, Error> {
        let zoned = ended_at.to_zoned(jiff::tz::TimeZone::UTC);
        let dir = self
            .data_dir
            .join("clips")
            .join(format!("{:04}", zoned.year()))
            .join(format!("{:02}", zoned.month()))
            .join(format!("{:02}", zoned.day()));
        std::fs::create_dir_all(&dir).err_kind(ErrorKind::ClipFinalizeFailed)?;
        Ok(dir.join(format!("{clip_id}.sealed")))
    }

    /// Writes `bytes` to `path` atomically: write to a sibling temp file,
    /// `fsync`, then rename over the destination.
    pub fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), Error> {
        let tmp = path.with_extension("tmp");
        {
            let mut f = File::create(&tmp).err_kind(ErrorKind::ClipFinalizeFailed)?;
            use std::io::Write;
            f.write_all(bytes).err_kind(ErrorKind::ClipFinalizeFailed)?;
            f.sync_all().err_kind(ErrorKind::ClipFinalizeFailed)?;
        }
        std::fs::rename(&tmp, path).err_kind(ErrorKind::ClipFinalizeFailed)?;
        Ok(())
    }

    /// Removes a clip's sealed file. Tolerates the file already being gone
    /// (index and disk may have already been reconciled by a prior sweep
    /// that crashed between unlink and row delete).
    pub fn remove_clip_file(&self, path: &Path) -> Result<(), Error> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).err_kind(ErrorKind::Internal),
        }
    }

    /// Percentage (0-100) of the filesystem backing `data_dir` currently in use.
    pub fn disk_usage_percent(&self) -> Result<u8, Error> {
        let stat = nix::sys::statvfs::statvfs(&self.data_dir).err_kind(ErrorKind::Internal)?;
        let total = stat.blocks() as u64 * stat.fragment_size();
        let free = stat.blocks_free() as u64 * stat.fragment_size();
        if total == 0 {
            return Ok(0);
        }
        let used = total.saturating_sub(free);
        Ok(((used as u128 * 100) / total as u128) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lays_out_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let root = StorageRoot::open(dir.path()).unwrap();
        assert!(dir.path().join("clips").is_dir());
        assert!(dir.path().join("snapshots").is_dir());
        assert!(dir.path().join("crypto").is_dir());
        assert_eq!(root.index_db_path(), dir.path().join("index.db"));
    }

    #[test]
    fn second_open_fails_lock() {
        let dir = tempfile::tempdir().unwrap();
        let _root = StorageRoot::open(dir.path()).unwrap();
        let err = StorageRoot::open(dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageInitFailed);
    }

    #[test]
    fn write_atomic_leaves_no_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = StorageRoot::open(dir.path()).unwrap();
        let path = dir.path().join("clips").join("x.sealed");
        root.write_atomic(&path, b"hello").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn clip_path_is_date_bucketed() {
        let dir = tempfile::tempdir().unwrap();
        let root = StorageRoot::open(dir.path()).unwrap();
        let id = uuid::Uuid::nil();
        let t = Timestamp::from_second(1_700_000_000).unwrap(); // 2023-11-14
        let path = root.clip_path(id, t).unwrap();
        assert!(path.starts_with(dir.path().join("clips").join("2023").join("11").join("14")));
    }
}
