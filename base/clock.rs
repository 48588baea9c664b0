//! Clock interface and implementations, kept abstract for testability.
//!
//! Every component that reasons about elapsed time (backoff, stall timeouts,
//! event-close gaps, retention) takes a `C: Clocks` rather than calling
//! `jiff::Timestamp::now()` directly, so tests can drive time deterministically.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use jiff::{Span, Timestamp};
use tracing::warn;

/// Abstract interface to the system clock.
pub trait Clocks: Send + Sync + 'static {
    /// The current wall-clock time.
    fn now(&self) -> Timestamp;

    /// Causes the current (async) task to sleep for the specified duration.
    ///
    /// Implemented with `tokio::time::sleep` for `RealClocks`; `SimulatedClocks`
    /// advances its internal clock instantly instead of actually sleeping.
    fn sleep(&self, how_long: Duration) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks;

impl Clocks for RealClocks {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }

    fn sleep(&self, how_long: Duration) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(how_long))
    }
}

/// Simulated clock for unit tests: `sleep` advances the clock rather than
/// blocking, so tests of backoff/timeout logic run instantly.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<Mutex<Timestamp>>);

impl SimulatedClocks {
    pub fn new(start: Timestamp) -> Self {
        SimulatedClocks(Arc::new(Mutex::new(start)))
    }

    pub fn advance(&self, by: Duration) {
        let mut t = self.0.lock().unwrap();
        *t = *t + Span::try_from(by).expect("duration should fit in a jiff::Span");
    }
}

impl Clocks for SimulatedClocks {
    fn now(&self) -> Timestamp {
        *self.0.lock().unwrap()
    }

    fn sleep(&self, how_long: Duration) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        self.advance(how_long);
        Box::pin(std::future::ready(()))
    }
}

/// Logs a warning if the guard lives "too long" before being dropped, using the
/// label produced by `label_f`. Useful for flagging suspiciously slow I/O
/// (subprocess spawn, index write, seal) without wiring a span through call sites.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: Timestamp,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.now(),
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed = self.clocks.now().duration_since(self.start);
        if elapsed.as_secs() >= 1 {
            let label_f = self.label_f.take().unwrap();
            warn!(took = ?elapsed, "{} took longer than expected", label_f().as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_clock_advances_on_sleep() {
        let clocks = SimulatedClocks::new(Timestamp::from_second(0).unwrap());
        let start = clocks.now();
        futures_lite_block_on(clocks.sleep(Duration::from_secs(5)));
        assert_eq!(clocks.now().duration_since(start).as_secs(), 5);
    }

    /// Polls a future to completion without pulling in a dev-dependency on
    /// an executor; `SimulatedClocks::sleep` never actually yields.
    fn futures_lite_block_on<F: std::future::Future<Output = ()>>(f: F) {
        let mut f = Box::pin(f);
        let waker = futures::task::noop_waker();
        let mut cx = std::task::Context::from_waker(&waker);
        loop {
            if f.as_mut().poll(&mut cx).is_ready() {
                return;
            }
        }
    }
}
