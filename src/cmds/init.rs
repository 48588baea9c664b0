//! Creates `data_dir`'s directory layout, the local index, and (if
//! encryption is enabled) the salt file, then exits. Safe to run against an
//! already-initialized directory.

use crate::config::Config;
use crate::crypto;
use crate::storage::StorageRoot;
use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use tracing::info;

#[derive(Bpaf, Debug)]
#[bpaf(command("init"))]
/// Creates the data directory layout described by a config file.
pub struct Args {
    #[bpaf(long("config"), argument("PATH"), fallback(PathBuf::from("/etc/sentryedge.toml")))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    base::tracing_setup::install(base::tracing_setup::LogFormat::Text);
    let config = Config::load(&args.config)?;

    let storage = StorageRoot::open(&config.data_dir)?;
    info!(data_dir = %config.data_dir.display(), "storage root ready");

    let _db = db::open(&storage.index_db_path())?;
    info!(path = %storage.index_db_path().display(), "local index ready");

    if config.encryption.enabled {
        let salt_path = storage.salt_path(&config.encryption.salt_path);
        crypto::load_or_create_salt(&salt_path)?;
        info!(path = %salt_path.display(), "salt ready");
    }

    Ok(0)
}
