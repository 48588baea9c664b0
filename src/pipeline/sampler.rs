//! Frame Sampler: a single-slot "latest frame" cache plus a rate gate that
//! decides which frames are worth sending to inference.
//!
//! Never queues — a frame that arrives before `inference_interval` has
//! elapsed since the last one forwarded is kept only as the live-preview
//! frame and dropped from the inference path.

use super::ingest::Frame;
use bytes::Bytes;
use jiff::Timestamp;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Clone)]
pub struct LatestFrame {
    pub data: Bytes,
    pub captured_at: Timestamp,
}

pub struct Sampler {
    inference_interval: Duration,
    last_sent: Option<Timestamp>,
    latest_tx: watch::Sender<Option<LatestFrame>>,
}

pub struct SamplerHandle {
    pub latest_rx: watch::Receiver<Option<LatestFrame>>,
}

impl Sampler {
    /// `inference_interval_secs == 0.0` forwards every frame (no gating).
    pub fn new(inference_interval_secs: f64) -> (Self, SamplerHandle) {
        let (tx, rx) = watch::channel(None);
        let sampler = Sampler {
            inference_interval: Duration::from_secs_f64(inference_interval_secs.max(0.0)),
            last_sent: None,
            latest_tx: tx,
        };
        (sampler, SamplerHandle { latest_rx: rx })
    }

    /// Publishes `frame` as the live-preview frame, and returns it again if
    /// it should also be forwarded to inference this time.
    pub fn observe(&mut self, frame: Frame) -> Option<Frame> {
        let captured_at = frame.captured_at;
        let _ = self.latest_tx.send(Some(LatestFrame { data: frame.data.clone(), captured_at }));

        let due = match self.last_sent {
            None => true,
            Some(last) => captured_at.duration_since(last).unsigned_abs() >= self.inference_interval,
        };
        if due {
            self.last_sent = Some(captured_at);
            Some(frame)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_at(secs: i64) -> Frame {
        Frame { data: Bytes::from_static(b"x"), captured_at: Timestamp::from_second(secs).unwrap() }
    }

    #[test]
    fn first_frame_is_always_forwarded() {
        let (mut s, _h) = Sampler::new(1.0);
        assert!(s.observe(frame_at(1000)).is_some());
    }

    #[test]
    fn gates_frames_inside_the_interval() {
        let (mut s, _h) = Sampler::new(1.0);
        assert!(s.observe(frame_at(1000)).is_some());
        assert!(s.observe(frame_at(1000)).is_none()); // same instant, inside interval
    }

    #[test]
    fn forwards_again_once_interval_elapses() {
        let (mut s, _h) = Sampler::new(1.0);
        assert!(s.observe(frame_at(1000)).is_some());
        assert!(s.observe(frame_at(1001)).is_some());
    }

    #[test]
    fn zero_interval_forwards_every_frame() {
        let (mut s, _h) = Sampler::new(0.0);
        assert!(s.observe(frame_at(1000)).is_some());
        assert!(s.observe(frame_at(1000)).is_some());
    }

    #[tokio::test]
    async fn latest_frame_updates_even_when_gated() {
        let (mut s, h) = Sampler::new(1.0);
        s.observe(frame_at(1000));
        s.observe(frame_at(1000));
        assert_eq!(h.latest_rx.borrow().as_ref().unwrap().captured_at, Timestamp::from_second(1000).unwrap());
    }
}
