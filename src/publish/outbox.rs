use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use super::payload::OutgoingPayload;

/// Outcome of handing a payload to the outbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OfferOutcome {
    Queued,
    /// The outbox was full; its oldest payload was evicted.
    EvictedOldest,
}

/// Bounded handoff between the result sink and the publisher.
///
/// Offering never blocks. The handle keeps a receiver clone so it can evict
/// the oldest payload when the publisher falls behind.
#[derive(Clone)]
pub struct Outbox {
    tx: Sender<OutgoingPayload>,
    rx: Receiver<OutgoingPayload>,
    evicted: Arc<AtomicU64>,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn offer(&self, payload: OutgoingPayload) -> OfferOutcome {
        let mut payload = payload;
        let mut outcome = OfferOutcome::Queued;
        loop {
            match self.tx.try_send(payload) {
                // `self.rx` keeps the channel connected.
                Ok(()) | Err(TrySendError::Disconnected(_)) => return outcome,
                Err(TrySendError::Full(back)) => {
                    payload = back;
                    if self.rx.try_recv().is_ok() {
                        self.evicted.fetch_add(1, Ordering::Relaxed);
                        outcome = OfferOutcome::EvictedOldest;
                    }
                }
            }
        }
    }

    pub(crate) fn receiver(&self) -> Receiver<OutgoingPayload> {
        self.rx.clone()
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::occupancy::Summary;
    use chrono::Utc;

    fn payload(camera: &str) -> OutgoingPayload {
        OutgoingPayload {
            event: OutgoingPayload::EVENT,
            camera: camera.to_string(),
            timestamp: 0.0,
            summary: Summary::from_zones(camera, Utc::now(), &[]),
            segments: Vec::new(),
        }
    }

    #[test]
    fn full_outbox_evicts_oldest() {
        let outbox = Outbox::new(2);
        assert_eq!(outbox.offer(payload("a")), OfferOutcome::Queued);
        assert_eq!(outbox.offer(payload("b")), OfferOutcome::Queued);
        assert_eq!(outbox.offer(payload("c")), OfferOutcome::EvictedOldest);
        assert_eq!(outbox.evicted(), 1);

        let rx = outbox.receiver();
        let cameras: Vec<String> = rx.try_iter().map(|p| p.camera).collect();
        assert_eq!(cameras, vec!["b", "c"]);
    }

    #[test]
    fn offer_keeps_working_after_the_publisher_receiver_is_gone() {
        let outbox = Outbox::new(1);
        drop(outbox.receiver());
        assert_eq!(outbox.offer(payload("a")), OfferOutcome::Queued);
        assert_eq!(outbox.offer(payload("b")), OfferOutcome::EvictedOldest);
        assert_eq!(outbox.len(), 1);
    }
}
