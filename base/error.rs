//! A single error type shared across the workspace.
//!
//! Components don't define their own error enums; they classify failures into
//! a shared [`ErrorKind`] and attach a message and (optionally) a source. This
//! mirrors the "kinds, not types" policy: callers match on `kind()` to decide
//! whether to retry, degrade, or propagate, and the `Display` impl gives a
//! human a full causal chain.

use std::fmt;

/// Coarse classification of a failure, used for retry/backoff/propagation
/// policy rather than for programmatic matching on specifics.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Startup configuration failed validation. Fatal; refuse to start.
    ConfigInvalid,
    /// Storage root or local index could not be opened/initialized.
    StorageInitFailed,
    /// A camera's stream could not be reached (connection refused, DNS, etc).
    CameraUnreachable,
    /// A camera or the inference endpoint rejected our credentials.
    AuthFailed,
    /// The capture subprocess produced output that didn't parse as JPEG.
    MalformedStream,
    /// An inference call exceeded its deadline.
    InferenceTimeout,
    /// The inference endpoint returned a non-retryable 4xx.
    InferenceRejected,
    /// A clip could not be finalized (disk full, seal failure).
    ClipFinalizeFailed,
    /// The relay endpoint is unreachable through the tunnel.
    RelayUnavailable,
    /// The relay endpoint permanently rejected an upload.
    RelayRejected,
    /// The data key could not be derived from the user secret and salt.
    KeyDerivationFailed,
    /// Not found (row, file, camera, etc).
    NotFound,
    /// Input was malformed in a way not covered by a more specific kind.
    InvalidArgument,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConfigInvalid => "config invalid",
            ErrorKind::StorageInitFailed => "storage init failed",
            ErrorKind::CameraUnreachable => "camera unreachable",
            ErrorKind::AuthFailed => "auth failed",
            ErrorKind::MalformedStream => "malformed stream",
            ErrorKind::InferenceTimeout => "inference timeout",
            ErrorKind::InferenceRejected => "inference rejected",
            ErrorKind::ClipFinalizeFailed => "clip finalize failed",
            ErrorKind::RelayUnavailable => "relay unavailable",
            ErrorKind::RelayRejected => "relay rejected",
            ErrorKind::KeyDerivationFailed => "key derivation failed",
            ErrorKind::NotFound => "not found",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::Internal => "internal error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The workspace-wide error type: a kind, a message, and an optional source.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Error {
            kind,
            msg: Some(msg.into()),
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Returns a `Display` that prints this error and every `source()` in its chain.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            kind,
            msg: None,
            source: None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.msg {
            Some(m) => write!(f, "{}: {}", self.kind, m),
            None => fmt::Display::fmt(&self.kind, f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

pub struct Chain<'a>(&'a Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut cause = std::error::Error::source(self.0);
        while let Some(c) = cause {
            write!(f, "\ncaused by: {c}")?;
            cause = c.source();
        }
        Ok(())
    }
}

/// Extension methods for attaching an [`ErrorKind`] to an arbitrary `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind, keeping it as the `source()`.
    ///
    /// ```
    /// use sentryedge_base::{ErrorKind, ResultExt};
    /// use std::io::Read;
    /// let mut buf = [0u8; 1];
    /// let r = std::io::Cursor::new("").read_exact(&mut buf[..]).err_kind(ErrorKind::Internal);
    /// assert_eq!(r.unwrap_err().kind(), ErrorKind::Internal);
    /// ```
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;

    /// Like [`ResultExt::err_kind`] but with an explicit message, discarding the
    /// original `Display` (it's kept as `source()`).
    fn err_kind_msg(self, k: ErrorKind, msg: impl Into<String>) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| {
            let msg = e.to_string();
            Error {
                kind: k,
                msg: Some(msg),
                source: Some(Box::new(e)),
            }
        })
    }

    fn err_kind_msg(self, k: ErrorKind, msg: impl Into<String>) -> Result<T, Error> {
        self.map_err(|e| Error {
            kind: k,
            msg: Some(msg.into()),
            source: Some(Box::new(e)),
        })
    }
}

/// Shorthand for constructing an [`Error`] with a formatted message, e.g.
/// `return Err(err!(CameraUnreachable, "{camera_id}: connection refused"))`.
#[macro_export]
macro_rules! err {
    ($kind:ident, $fmt:expr $(, $arg:expr)* $(,)?) => {
        $crate::Error::new($crate::ErrorKind::$kind, format!($fmt $(, $arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_includes_sources() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk exploded");
        let e: Error = Err::<(), _>(io_err)
            .err_kind_msg(ErrorKind::ClipFinalizeFailed, "sealing clip")
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::ClipFinalizeFailed);
        let chained = e.chain().to_string();
        assert!(chained.contains("sealing clip"), "{chained}");
        assert!(chained.contains("disk exploded"), "{chained}");
    }

    #[test]
    fn err_macro_sets_kind() {
        let e = err!(AuthFailed, "camera {} needs credentials", 42);
        assert_eq!(e.kind(), ErrorKind::AuthFailed);
        assert_eq!(e.to_string(), "auth failed: camera 42 needs credentials");
    }
}
