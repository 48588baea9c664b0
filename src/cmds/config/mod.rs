//! Prints the effective configuration (defaults merged with the file and
//! any `EDGE_*` overrides) as JSON, validating it in the process. Useful for
//! confirming what a hot-reload would actually apply.

use crate::config::Config;
use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;

#[derive(Bpaf, Debug)]
#[bpaf(command("config"))]
/// Prints and validates the effective configuration.
pub struct Args {
    #[bpaf(long("config"), argument("PATH"), fallback(PathBuf::from("/etc/sentryedge.toml")))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = Config::load(&args.config)?;
    let text = serde_json::to_string_pretty(&config)
        .map_err(|e| base::err!(Internal, "serializing effective config: {e}"))?;
    println!("{text}");
    Ok(0)
}
