//! Outbound reliable queue: unacknowledged messages awaiting a cumulative or
//! selective acknowledgement, with RTO-driven retransmission scheduling.

use crate::rtt::RttEstimator;
use crate::shared::seq_less_equal;
use indexmap::IndexMap;
use std::time::Instant;

pub const DEFAULT_CAPACITY: usize = 256;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// An unacknowledged reliable message. `attempts` counts the initial send.
#[derive(Debug, Clone)]
pub struct Entry {
    pub sequence: u32,
    pub type_id: u16,
    pub payload: Vec<u8>,
    pub last_send: Instant,
    pub attempts: u32,
}

/// Messages that are due for retransmission in this tick, and messages whose
/// attempt budget ran out and were dropped from the queue.
pub struct Candidates {
    pub resend: Vec<Entry>,
    pub expired: Vec<Entry>,
}

/// Insertion-ordered queue of unacked entries. Insertion order equals
/// sequence order, since sequences are assigned monotonically.
pub struct OutboundQueue {
    entries: IndexMap<u32, Entry>,
    capacity: usize,
    max_attempts: u32,
}

impl OutboundQueue {
    #[inline]
    pub fn new(capacity: usize, max_attempts: u32) -> OutboundQueue {
        OutboundQueue {
            entries: IndexMap::with_capacity(capacity),
            capacity,
            max_attempts,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Tracks a freshly sent reliable message. Returns false when the queue
    /// is at capacity and the caller must surface backpressure.
    pub fn enqueue(&mut self, sequence: u32, type_id: u16, payload: Vec<u8>, now: Instant) -> bool {
        if self.is_full() {
            return false;
        }

        let previous = self.entries.insert(
            sequence,
            Entry {
                sequence,
                type_id,
                payload,
                last_send: now,
                attempts: 1,
            },
        );

        debug_assert!(previous.is_none(), "Duplicate outbound sequence");

        true
    }

    /// Removes every entry with a sequence at or before `ack`, modulo
    /// wraparound. Returns the number of entries retired.
    pub fn ack_cumulative(&mut self, ack: u32) -> usize {
        let before = self.entries.len();
        self.entries.retain(|&sequence, _| !seq_less_equal(sequence, ack));
        before - self.entries.len()
    }

    /// Cumulative ack plus removal of each entry singled out by the bitmap:
    /// bit k acknowledges sequence `base + 1 + k`.
    pub fn ack_selective(&mut self, base: u32, bitmap: u32) -> usize {
        let mut retired = self.ack_cumulative(base);

        for bit in 0..32 {
            if bitmap & (1 << bit) != 0 {
                let sequence = base.wrapping_add(1 + bit);
                if self.entries.shift_remove(&sequence).is_some() {
                    retired += 1;
                }
            }
        }

        retired
    }

    /// Splits the queue into entries due for retransmission and entries that
    /// exhausted their attempt budget. Expired entries are removed; the
    /// caller must report them upward. Resend candidates stay queued and the
    /// caller invokes `mark_retransmitted` once each is back on the wire.
    pub fn candidates(&mut self, now: Instant, rtt: &RttEstimator) -> Candidates {
        let mut resend = Vec::new();
        let mut expired_sequences = Vec::new();

        for entry in self.entries.values() {
            if now.duration_since(entry.last_send) < rtt.rto(entry.attempts - 1) {
                continue;
            }

            if entry.attempts >= self.max_attempts {
                expired_sequences.push(entry.sequence);
            } else {
                resend.push(entry.clone());
            }
        }

        let mut expired = Vec::with_capacity(expired_sequences.len());
        for sequence in expired_sequences {
            if let Some(entry) = self.entries.shift_remove(&sequence) {
                expired.push(entry);
            }
        }

        Candidates { resend, expired }
    }

    /// Records a retransmission: bumps the attempt count and the last-send
    /// timestamp so the next RTO doubles.
    pub fn mark_retransmitted(&mut self, sequence: u32, now: Instant) {
        if let Some(entry) = self.entries.get_mut(&sequence) {
            entry.attempts += 1;
            entry.last_send = now;
        }
    }
}
