//! The reliability engine: assigns sequences, folds acknowledgements into
//! outgoing traffic, schedules retransmissions and delivers reliable
//! messages in sender order exactly once.

use crate::inbound::{InboundBuffer, Verdict};
use crate::outbound::{Entry, OutboundQueue};
use crate::rtt::RttEstimator;
use crate::shared::{NetError, NetResult};
use crate::wire::Packet;
use std::time::{Duration, Instant};

/// Acks may linger this long waiting for an outgoing Data packet to ride on.
const ACK_DELAY: Duration = Duration::from_millis(10);

/// Packets produced by a tick, plus messages whose retransmission budget ran
/// out. The caller treats expirations as session degradation.
pub struct TickOutput {
    pub packets: Vec<Packet>,
    pub expired: Vec<Entry>,
}

pub struct Reliability {
    rtt: RttEstimator,
    outbound: OutboundQueue,
    inbound: InboundBuffer,
    next_outbound_seq: u32,
    ack_pending: bool,
    last_ack_sent: Option<Instant>,
}

impl Reliability {
    pub fn new(queue_capacity: usize, max_attempts: u32) -> Reliability {
        Reliability {
            rtt: RttEstimator::new(),
            outbound: OutboundQueue::new(queue_capacity, max_attempts),
            inbound: InboundBuffer::new(queue_capacity),
            next_outbound_seq: 0,
            ack_pending: false,
            last_ack_sent: None,
        }
    }

    /// Feeds a heartbeat-derived round trip sample. Retransmitted segments
    /// never produce samples, so the estimate stays unskewed.
    #[inline]
    pub fn sample_rtt(&mut self, rtt_ms: i64) {
        self.rtt.sample(rtt_ms);
    }

    #[inline]
    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.rtt.smoothed()
    }

    /// Number of reliable messages awaiting acknowledgement.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.outbound.len()
    }

    /// Highest consecutively received sequence, for resumption handshakes.
    #[inline]
    pub fn last_received(&self) -> Option<u32> {
        self.inbound.cumulative_ack()
    }

    /// Builds a reliable Data packet, tracking it for retransmission.
    /// Fails with `QueueFull` when the unacked window is exhausted.
    pub fn send_reliable(&mut self, type_id: u16, payload: Vec<u8>, now: Instant) -> NetResult<Packet> {
        if self.outbound.is_full() {
            return Err(NetError::QueueFull);
        }

        let sequence = self.next_outbound_seq;
        self.next_outbound_seq = self.next_outbound_seq.wrapping_add(1);

        self.outbound.enqueue(sequence, type_id, payload.clone(), now);

        Ok(Packet::Data {
            sequence: Some(sequence),
            ack: self.take_piggyback(now),
            type_id,
            payload,
        })
    }

    /// Builds a fire-and-forget Data packet. No sequence is assigned and the
    /// inbound buffer on the far side will bypass it.
    pub fn send_unreliable(&mut self, type_id: u16, payload: Vec<u8>, now: Instant) -> Packet {
        Packet::Data {
            sequence: None,
            ack: self.take_piggyback(now),
            type_id,
            payload,
        }
    }

    /// Processes an incoming Data packet and returns the messages that became
    /// deliverable, in order. Unreliable messages pass straight through.
    pub fn receive_data(
        &mut self,
        sequence: Option<u32>,
        ack: Option<u32>,
        type_id: u16,
        payload: Vec<u8>,
    ) -> Vec<(u16, Vec<u8>)> {
        // Piggybacked acks always carry an implicit zero bitmap.
        if let Some(ack) = ack {
            self.outbound.ack_selective(ack, 0);
        }

        let sequence = match sequence {
            Some(sequence) => sequence,
            None => return vec![(type_id, payload)],
        };

        match self.inbound.receive(sequence, type_id, payload) {
            Verdict::Accepted => {
                self.ack_pending = true;
                self.inbound.drain()
            }
            Verdict::Duplicate | Verdict::TooOld => {
                // The remote is retransmitting; re-advertise our progress.
                self.ack_pending = true;
                Vec::new()
            }
            Verdict::BufferFull => {
                self.ack_pending = true;
                Vec::new()
            }
        }
    }

    /// Processes a standalone Ack and returns the number of entries retired.
    pub fn receive_ack(&mut self, sequence: u32, bitmap: u32) -> usize {
        self.outbound.ack_selective(sequence, bitmap)
    }

    /// Drives retransmission and delayed acknowledgement.
    pub fn tick(&mut self, now: Instant) -> TickOutput {
        let candidates = self.outbound.candidates(now, &self.rtt);

        let mut packets = Vec::with_capacity(candidates.resend.len() + 1);

        for entry in candidates.resend {
            let packet = Packet::Data {
                sequence: Some(entry.sequence),
                ack: self.take_piggyback(now),
                type_id: entry.type_id,
                payload: entry.payload,
            };

            self.outbound.mark_retransmitted(entry.sequence, now);
            packets.push(packet);
        }

        if self.ack_pending && self.ack_delay_elapsed(now) {
            if let Some(sequence) = self.inbound.cumulative_ack() {
                packets.push(Packet::Ack {
                    sequence,
                    bitmap: self.inbound.selective_bitmap(),
                });
                self.ack_pending = false;
                self.last_ack_sent = Some(now);
            }
        }

        TickOutput {
            packets,
            expired: candidates.expired,
        }
    }

    /// Attaches the pending cumulative ack to an outgoing Data packet, if one
    /// is due. Clearing the flag here suppresses the standalone Ack.
    fn take_piggyback(&mut self, now: Instant) -> Option<u32> {
        if !self.ack_pending {
            return None;
        }

        let ack = self.inbound.cumulative_ack()?;

        self.ack_pending = false;
        self.last_ack_sent = Some(now);

        Some(ack)
    }

    #[inline]
    fn ack_delay_elapsed(&self, now: Instant) -> bool {
        match self.last_ack_sent {
            Some(sent) => now.duration_since(sent) >= ACK_DELAY,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Reliability {
        Reliability::new(8, 3)
    }

    fn data_parts(packet: Packet) -> (Option<u32>, Option<u32>, u16, Vec<u8>) {
        match packet {
            Packet::Data {
                sequence,
                ack,
                type_id,
                payload,
            } => (sequence, ack, type_id, payload),
            other => panic!("Expected Data, got {:?}", other),
        }
    }

    #[test]
    fn test_reliable_sequences_are_monotonic() {
        let now = Instant::now();
        let mut engine = engine();

        for expected in 0..3u32 {
            let packet = engine.send_reliable(1, vec![], now).unwrap();
            let (sequence, _, _, _) = data_parts(packet);
            assert_eq!(sequence, Some(expected));
        }

        assert_eq!(engine.in_flight(), 3);
    }

    #[test]
    fn test_backpressure_when_queue_full() {
        let now = Instant::now();
        let mut engine = engine();

        for _ in 0..8 {
            engine.send_reliable(1, vec![], now).unwrap();
        }

        assert_eq!(
            engine.send_reliable(1, vec![], now).unwrap_err(),
            NetError::QueueFull
        );
    }

    #[test]
    fn test_unreliable_has_no_sequence() {
        let now = Instant::now();
        let mut engine = engine();

        let (sequence, ack, type_id, payload) =
            data_parts(engine.send_unreliable(9, vec![1, 2], now));

        assert_eq!(sequence, None);
        assert_eq!(ack, None);
        assert_eq!(type_id, 9);
        assert_eq!(payload, vec![1, 2]);
    }

    #[test]
    fn test_in_order_delivery_and_piggyback() {
        let now = Instant::now();
        let mut engine = engine();

        let delivered = engine.receive_data(Some(0), None, 5, vec![10]);
        assert_eq!(delivered, vec![(5, vec![10])]);

        // The next outgoing packet carries the ack.
        let (_, ack, _, _) = data_parts(engine.send_reliable(1, vec![], now).unwrap());
        assert_eq!(ack, Some(0));

        // And the pending flag is consumed.
        let (_, ack, _, _) = data_parts(engine.send_reliable(1, vec![], now).unwrap());
        assert_eq!(ack, None);
    }

    #[test]
    fn test_out_of_order_held_back() {
        let mut engine = engine();

        assert!(engine.receive_data(Some(1), None, 5, vec![1]).is_empty());
        assert_eq!(
            engine.receive_data(Some(0), None, 5, vec![0]),
            vec![(5, vec![0]), (5, vec![1])]
        );
    }

    #[test]
    fn test_unreliable_bypasses_ordering() {
        let mut engine = engine();

        // A reliable gap is waiting, but unreliable traffic flows through.
        assert!(engine.receive_data(Some(1), None, 5, vec![1]).is_empty());
        assert_eq!(
            engine.receive_data(None, None, 6, vec![99]),
            vec![(6, vec![99])]
        );
    }

    #[test]
    fn test_duplicate_triggers_reack() {
        let now = Instant::now();
        let mut engine = engine();

        engine.receive_data(Some(0), None, 5, vec![]);
        let _ = engine.tick(now); // standalone ack flushes

        // A retransmitted duplicate arrives; progress must be re-advertised.
        assert!(engine.receive_data(Some(0), None, 5, vec![]).is_empty());

        let output = engine.tick(now + ACK_DELAY);
        assert_eq!(
            output.packets,
            vec![Packet::Ack {
                sequence: 0,
                bitmap: 0
            }]
        );
    }

    #[test]
    fn test_standalone_ack_respects_delay() {
        let now = Instant::now();
        let mut engine = engine();

        engine.receive_data(Some(0), None, 5, vec![]);

        // First ever ack: no prior send time, emitted immediately.
        let output = engine.tick(now);
        assert_eq!(output.packets.len(), 1);

        engine.receive_data(Some(1), None, 5, vec![]);

        // Within the delay window nothing is emitted.
        let output = engine.tick(now + Duration::from_millis(5));
        assert!(output.packets.is_empty());

        let output = engine.tick(now + Duration::from_millis(11));
        assert_eq!(
            output.packets,
            vec![Packet::Ack {
                sequence: 1,
                bitmap: 0
            }]
        );
    }

    #[test]
    fn test_standalone_ack_carries_gap_bitmap() {
        let now = Instant::now();
        let mut engine = engine();

        engine.receive_data(Some(0), None, 5, vec![]);
        engine.receive_data(Some(2), None, 5, vec![]);

        let output = engine.tick(now);
        assert_eq!(
            output.packets,
            vec![Packet::Ack {
                sequence: 0,
                bitmap: 0b10
            }]
        );
    }

    #[test]
    fn test_piggybacked_ack_retires_outbound() {
        let now = Instant::now();
        let mut engine = engine();

        engine.send_reliable(1, vec![], now).unwrap();
        engine.send_reliable(1, vec![], now).unwrap();

        engine.receive_data(None, Some(1), 6, vec![]);

        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn test_selective_ack_retires_outbound() {
        let now = Instant::now();
        let mut engine = engine();

        for _ in 0..4 {
            engine.send_reliable(1, vec![], now).unwrap();
        }

        // Cumulative 0, selective bit for sequence 2.
        assert_eq!(engine.receive_ack(0, 0b10), 2);
        assert_eq!(engine.in_flight(), 2);
    }

    #[test]
    fn test_retransmit_rebuilds_original_packet() {
        let now = Instant::now();
        let mut engine = engine();

        engine.sample_rtt(100);
        engine.send_reliable(7, vec![42], now).unwrap();

        let output = engine.tick(now + Duration::from_millis(200));
        assert_eq!(output.packets.len(), 1);

        let (sequence, _, type_id, payload) = data_parts(output.packets[0].clone());
        assert_eq!(sequence, Some(0));
        assert_eq!(type_id, 7);
        assert_eq!(payload, vec![42]);
    }

    #[test]
    fn test_expired_entries_surface() {
        let now = Instant::now();
        let mut engine = engine();

        engine.sample_rtt(100);
        engine.send_reliable(7, vec![], now).unwrap();

        let mut clock = now;
        loop {
            clock += Duration::from_secs(3);
            let output = engine.tick(clock);

            if !output.expired.is_empty() {
                assert_eq!(output.expired[0].sequence, 0);
                break;
            }

            assert!(!output.packets.is_empty(), "Entry neither resent nor expired");
        }

        assert_eq!(engine.in_flight(), 0);
    }
}
