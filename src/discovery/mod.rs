//! Discovery: two independent probes producing [`Observation`]s into a
//! common roster, consumed by the Camera Manager. Probe failures are
//! non-fatal; each probe just reports its last error and continues on
//! schedule (empty roster is a valid outcome).

pub mod device;
pub mod multicast;

use db::camera::Observation;
use tokio::sync::mpsc;

/// Shared sink both probes publish [`Observation`]s onto.
pub type ObservationSender = mpsc::Sender<Observation>;
pub type ObservationReceiver = mpsc::Receiver<Observation>;

pub fn channel(capacity: usize) -> (ObservationSender, ObservationReceiver) {
    mpsc::channel(capacity)
}
