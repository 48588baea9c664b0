//! Cooperative cancellation, propagated through the program as a `Context`.
//!
//! Every long-lived task accepts a [`Receiver`] and returns promptly once
//! [`Sender`] is dropped (or [`Sender::shutdown`] is called). No task blocks a
//! global resource without racing against this signal.

use tokio::sync::watch;

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

pub struct Sender(watch::Sender<bool>);

impl Sender {
    /// Requests shutdown. Idempotent; also happens automatically on drop.
    pub fn shutdown(&self) {
        // Only the value matters; `send` fails only if every Receiver is gone.
        let _ = self.0.send(true);
    }
}

#[derive(Clone)]
pub struct Receiver(watch::Receiver<bool>);

impl Receiver {
    /// Returns `Err` if shutdown has already been requested.
    pub fn check(&self) -> Result<(), ShutdownError> {
        if *self.0.borrow() {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }

    /// Resolves once shutdown is requested. Cheap to call repeatedly in a
    /// `tokio::select!` loop; cloning the receiver is cheap too.
    pub async fn cancelled(&mut self) {
        if *self.0.borrow() {
            return;
        }
        // `changed()` only returns Err if the Sender was dropped without ever
        // sending, which `channel()` below prevents by holding the initial value.
        let _ = self.0.changed().await;
    }

    /// Runs `fut` to completion, or returns `Err(ShutdownError)` if shutdown is
    /// requested first. This is the building block for every suspension point
    /// in the pipeline (subprocess wait, HTTP call, index write).
    pub async fn race<F: std::future::Future>(&mut self, fut: F) -> Result<F::Output, ShutdownError> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(ShutdownError),
            out = fut => Ok(out),
        }
    }
}

/// Returns a sender and receiver for graceful shutdown.
///
/// Dropping (or explicitly triggering) the sender requests shutdown for every
/// clone of the receiver.
pub fn channel() -> (Sender, Receiver) {
    let (tx, rx) = watch::channel(false);
    (Sender(tx), Receiver(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_reflects_shutdown() {
        let (tx, rx) = channel();
        rx.check().unwrap();
        tx.shutdown();
        rx.check().unwrap_err();
    }

    #[tokio::test]
    async fn race_short_circuits_on_shutdown() {
        let (tx, mut rx) = channel();
        tx.shutdown();
        let r = rx.race(std::future::pending::<()>()).await;
        assert!(r.is_err());
    }

    #[tokio::test]
    async fn race_returns_future_output_first() {
        let (_tx, mut rx) = channel();
        let r = rx.race(async { 42 }).await;
        assert_eq!(r.unwrap(), 42);
    }
}
