//! Offline consistency check between the local index and the clip tree on
//! disk: every `clip` row should have a file at `path`, and vice versa isn't
//! checked (an orphan file is harmless; the retention sweeper never looks at
//! the filesystem independent of the index).

use crate::config::Config;
use crate::storage::StorageRoot;
use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Bpaf, Debug)]
#[bpaf(command("check"))]
/// Verifies the local index and clip tree agree, without starting the service.
pub struct Args {
    #[bpaf(long("config"), argument("PATH"), fallback(PathBuf::from("/etc/sentryedge.toml")))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    base::tracing_setup::install(base::tracing_setup::LogFormat::Text);
    let config = Config::load(&args.config)?;
    let storage = StorageRoot::open(&config.data_dir)?;
    let mut db = db::open(&storage.index_db_path())?;

    let clips = db.clip().list_oldest_first()?;
    let mut missing = 0usize;
    for clip in &clips {
        if !std::path::Path::new(&clip.path).is_file() {
            error!(clip_id = %clip.id, path = %clip.path, "clip file missing from disk");
            missing += 1;
        }
    }

    info!(checked = clips.len(), missing, "clip consistency check complete");
    Ok(if missing == 0 { 0 } else { 1 })
}
