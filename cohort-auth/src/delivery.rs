//! Ordered delivery.
//!
//! The transport numbers every outbound message; this buffer re-assembles
//! the inbound side into a gap-free sequence, dropping duplicates and
//! holding early arrivals until the gap before them closes. The machine
//! downstream only ever sees index order.

use std::collections::BTreeMap;

use crate::message::{Envelope, Message};

/// Reassembly buffer for one inbound direction.
#[derive(Debug, Default)]
pub struct DeliveryBuffer {
    next_expected: u64,
    pending: BTreeMap<u64, Message>,
}

impl DeliveryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one numbered message and return everything that is now
    /// deliverable, in index order.
    ///
    /// - index below the cursor: duplicate or replay, dropped;
    /// - index above the cursor: parked until the gap closes;
    /// - index at the cursor: delivered, along with any parked run that
    ///   follows contiguously.
    pub fn push(&mut self, envelope: Envelope) -> Vec<Message> {
        let Envelope { index, message } = envelope;
        if index < self.next_expected {
            return Vec::new();
        }
        if index > self.next_expected {
            self.pending.insert(index, message);
            return Vec::new();
        }

        let mut ready = vec![message];
        self.next_expected += 1;
        while let Some(message) = self.pending.remove(&self.next_expected) {
            ready.push(message);
            self.next_expected += 1;
        }
        ready
    }

    /// The index the buffer is waiting for.
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// How many messages are parked beyond a gap.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(index: u64) -> Envelope {
        Envelope::new(index, Message::Update {
            root: "r".into(),
            head: format!("h{index}"),
            hashes: vec![],
        })
    }

    fn heads(ready: &[Message]) -> Vec<String> {
        ready
            .iter()
            .map(|m| match m {
                Message::Update { head, .. } => head.clone(),
                _ => unreachable!(),
            })
            .collect()
    }

    #[test]
    fn in_order_passes_straight_through() {
        let mut buf = DeliveryBuffer::new();
        assert_eq!(heads(&buf.push(env(0))), ["h0"]);
        assert_eq!(heads(&buf.push(env(1))), ["h1"]);
        assert_eq!(buf.next_expected(), 2);
    }

    #[test]
    fn out_of_order_is_resequenced() {
        let mut buf = DeliveryBuffer::new();
        assert!(buf.push(env(1)).is_empty());
        assert_eq!(heads(&buf.push(env(0))), ["h0", "h1"]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn drains_a_contiguous_run() {
        let mut buf = DeliveryBuffer::new();
        assert!(buf.push(env(2)).is_empty());
        assert!(buf.push(env(1)).is_empty());
        assert!(buf.push(env(4)).is_empty());
        assert_eq!(heads(&buf.push(env(0))), ["h0", "h1", "h2"]);
        // 4 stays parked behind the 3 gap.
        assert_eq!(buf.pending_len(), 1);
        assert_eq!(heads(&buf.push(env(3))), ["h3", "h4"]);
    }

    #[test]
    fn duplicates_are_dropped() {
        let mut buf = DeliveryBuffer::new();
        assert_eq!(buf.push(env(0)).len(), 1);
        assert!(buf.push(env(0)).is_empty());
        // A stale replay below the cursor is also dropped.
        assert_eq!(buf.push(env(1)).len(), 1);
        assert!(buf.push(env(0)).is_empty());
    }

    #[test]
    fn gap_that_never_closes_stalls() {
        let mut buf = DeliveryBuffer::new();
        assert!(buf.push(env(5)).is_empty());
        assert!(buf.push(env(6)).is_empty());
        assert_eq!(buf.next_expected(), 0);
        assert_eq!(buf.pending_len(), 2);
    }
}
