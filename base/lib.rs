// Ambient, dependency-light helpers shared by every crate in the workspace:
// error kinds, a mockable clock, graceful shutdown plumbing, string codecs, and
// `tracing` setup. Nothing here knows about cameras, events, or clips.

pub mod clock;
mod error;
pub mod shutdown;
pub mod strutil;
pub mod tracing_setup;

pub use crate::error::{err, Error, ErrorKind, ResultExt};
