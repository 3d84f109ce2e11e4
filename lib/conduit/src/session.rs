//! Per-connection state machine. A session owns its envelope and reliability
//! engine; both survive DISCONNECTED periods so that a resumed connection
//! continues its sequence numbering where it left off.

use crate::envelope::Envelope;
use crate::protocol::record::Record;
use crate::protocol::registry::Protocol;
use crate::reliability::Reliability;
use crate::shared::{NetError, NetResult, Token};
use crate::wire::{DisconnectReason, Packet};
use keel::logging::{self, Logger};
use keel::time;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    Connected,
    Disconnected,
}

/// Per-message delivery contract.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Delivery {
    Reliable,
    Unreliable,
}

/// Tunables shared by every session of an endpoint.
#[derive(Debug, Copy, Clone)]
pub struct Settings {
    pub heartbeat_interval: Duration,
    pub timeout: Duration,
    pub queue_capacity: usize,
    pub max_attempts: u32,
}

/// Result of feeding one decrypted datagram into a session.
#[derive(Debug)]
pub enum Inbound {
    /// Application messages that became deliverable, in order.
    Messages(Vec<(u16, Vec<u8>)>),
    /// The remote closed the connection.
    Disconnected(DisconnectReason, String),
    /// Control traffic, fully handled internally.
    Handled,
}

pub struct Session {
    token: Token,
    remote: SocketAddr,
    state: SessionState,
    envelope: Envelope,
    reliability: Reliability,
    protocol: Arc<Protocol>,
    egress: Vec<Vec<u8>>,
    attachment: Option<Box<dyn Any>>,

    epoch: Instant,
    current_time: Instant,
    last_activity: Instant,
    last_heartbeat_sent: Instant,

    heartbeat_interval: Duration,
    timeout: Duration,

    packets_sent: u64,
    packets_received: u64,

    log: Logger,
}

impl Session {
    pub fn new(
        token: Token,
        remote: SocketAddr,
        envelope: Envelope,
        protocol: Arc<Protocol>,
        settings: Settings,
        epoch: Instant,
        now: Instant,
        log: &Logger,
    ) -> Session {
        let session_log = log.new(logging::o!("remote" => remote.to_string()));

        logging::debug!(session_log, "session created";
                        "context" => "new",
                        "token" => ?token,
                        "heartbeat_interval" => ?settings.heartbeat_interval,
                        "timeout" => ?settings.timeout);

        Session {
            token,
            remote,
            state: SessionState::Connected,
            envelope,
            reliability: Reliability::new(settings.queue_capacity, settings.max_attempts),
            protocol,
            egress: Vec::new(),
            attachment: None,
            epoch,
            current_time: now,
            last_activity: now,
            last_heartbeat_sent: now,
            heartbeat_interval: settings.heartbeat_interval,
            timeout: settings.timeout,
            packets_sent: 0,
            packets_received: 0,
            log: session_log,
        }
    }

    #[inline]
    pub fn token(&self) -> &Token {
        &self.token
    }

    #[inline]
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    #[inline]
    pub fn attachment(&self) -> Option<&(dyn Any)> {
        self.attachment.as_deref()
    }

    #[inline]
    pub fn set_attachment(&mut self, attachment: Box<dyn Any>) {
        self.attachment = Some(attachment);
    }

    #[inline]
    pub fn take_attachment(&mut self) -> Option<Box<dyn Any>> {
        self.attachment.take()
    }

    #[inline]
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    #[inline]
    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    #[inline]
    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.reliability.smoothed_rtt()
    }

    /// Highest consecutively received reliable sequence, advertised during
    /// resumption.
    #[inline]
    pub fn last_received(&self) -> Option<u32> {
        self.reliability.last_received()
    }

    /// Resumption wire form of the receive progress: one past the highest
    /// consecutively received sequence, zero when nothing has arrived yet.
    #[inline]
    pub fn next_expected_wire(&self) -> u32 {
        self.reliability
            .last_received()
            .map_or(0, |sequence| sequence.wrapping_add(1))
    }

    /// Applies the peer's advertised receive progress from a resumption
    /// handshake, retiring outbound entries the peer already holds.
    #[inline]
    pub fn resume_ack(&mut self, next_expected: u32) {
        if next_expected != 0 {
            self.reliability.receive_ack(next_expected.wrapping_sub(1), 0);
        }
    }

    /// Number of reliable messages awaiting acknowledgement.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.reliability.in_flight()
    }

    /// Sends a typed message. Reliable sends fail with `QueueFull` when the
    /// unacked window is exhausted.
    pub fn send<T: Record>(&mut self, record: &T, delivery: Delivery) -> NetResult<()> {
        if self.state != SessionState::Connected {
            return Err(NetError::Protocol("Session is not connected".to_string()));
        }

        let protocol = Arc::clone(&self.protocol);
        let (type_id, payload) = protocol.encode(record)?;

        let packet = match delivery {
            Delivery::Reliable => self.reliability.send_reliable(type_id, payload, self.current_time)?,
            Delivery::Unreliable => self.reliability.send_unreliable(type_id, payload, self.current_time),
        };

        self.seal_and_queue(packet)
    }

    /// Non-raising variant of `send`: false signals backpressure (or any
    /// other send failure) and the caller decides whether to drop or retry.
    #[inline]
    pub fn try_send<T: Record>(&mut self, record: &T, delivery: Delivery) -> bool {
        self.send(record, delivery).is_ok()
    }

    /// Gracefully closes the session with a Disconnect notice.
    pub fn close(&mut self, message: &str) {
        self.disconnect_with(DisconnectReason::Normal, message);
    }

    /// Emits a Disconnect with the given reason and transitions to
    /// DISCONNECTED. The session object lingers for resumption until the
    /// timeout elapses.
    pub fn disconnect_with(&mut self, reason: DisconnectReason, message: &str) {
        if self.state != SessionState::Connected {
            return;
        }

        logging::debug!(self.log, "closing session";
                        "context" => "close",
                        "token" => ?self.token,
                        "reason" => ?reason,
                        "packets_sent" => self.packets_sent,
                        "packets_received" => self.packets_received);

        let packet = Packet::Disconnect {
            reason,
            message: message.to_string(),
        };

        // Best effort: a failed notice still leaves the session closed.
        drop(self.seal_and_queue(packet));

        self.state = SessionState::Disconnected;
    }

    /// Marks the session disconnected without emitting a notice. Used when
    /// the remote is presumed unreachable.
    pub fn mark_disconnected(&mut self) {
        if self.state == SessionState::Connected {
            logging::debug!(self.log, "session lost"; "context" => "timeout", "token" => ?self.token);
            self.state = SessionState::Disconnected;
        }
    }

    /// Rebinds a resumed session to its new remote address and installs the
    /// envelope derived from the reconnection handshake.
    ///
    /// The previous envelope and its nonce counters are discarded, so any
    /// reliable messages still in flight under the old keys are lost on the
    /// wire; the reliability engine retransmits them under the new keys.
    pub fn resume(&mut self, envelope: Envelope, remote: SocketAddr, now: Instant) {
        logging::debug!(self.log, "session resumed";
                        "context" => "resume",
                        "token" => ?self.token,
                        "old_remote" => self.remote.to_string(),
                        "new_remote" => remote.to_string());

        self.envelope = envelope;
        self.remote = remote;
        self.state = SessionState::Connected;
        self.current_time = now;
        self.last_activity = now;
        self.last_heartbeat_sent = now;
        self.log = self.log.new(logging::o!("remote" => remote.to_string()));
    }

    /// Decrypts, decodes and processes one datagram from the remote.
    pub fn receive(&mut self, datagram: &[u8], now: Instant) -> NetResult<Inbound> {
        self.current_time = now;

        let plain = self.envelope.open(datagram)?;
        let packet = Packet::decode(&plain)?;

        self.last_activity = now;
        self.packets_received += 1;

        self.handle_packet(packet, now)
    }

    fn handle_packet(&mut self, packet: Packet, now: Instant) -> NetResult<Inbound> {
        match packet {
            Packet::Data {
                sequence,
                ack,
                type_id,
                payload,
            } => {
                let messages = self.reliability.receive_data(sequence, ack, type_id, payload);
                Ok(Inbound::Messages(messages))
            }
            Packet::Ack { sequence, bitmap } => {
                self.reliability.receive_ack(sequence, bitmap);
                Ok(Inbound::Handled)
            }
            Packet::Heartbeat { timestamp } => {
                let reply = Packet::HeartbeatAck {
                    echo: timestamp,
                    timestamp: time::millis_since(self.epoch, now),
                };
                self.seal_and_queue(reply)?;
                Ok(Inbound::Handled)
            }
            Packet::HeartbeatAck { echo, .. } => {
                let rtt_ms = time::millis_since(self.epoch, now) as i64 - echo as i64;
                self.reliability.sample_rtt(rtt_ms);
                Ok(Inbound::Handled)
            }
            Packet::Disconnect { reason, message } => {
                logging::debug!(self.log, "remote disconnected";
                                "context" => "receive",
                                "token" => ?self.token,
                                "reason" => ?reason);
                self.state = SessionState::Disconnected;
                Ok(Inbound::Disconnected(reason, message))
            }
            other => {
                logging::warn!(self.log, "unexpected packet inside session";
                               "context" => "receive",
                               "packet" => ?other);
                Err(NetError::Protocol("Unexpected packet for session state".to_string()))
            }
        }
    }

    /// Drives heartbeats, retransmissions and delayed acks. Called on every
    /// endpoint pump; internally rate limited by the heartbeat interval and
    /// the retransmission timeouts.
    pub fn tick(&mut self, now: Instant) {
        self.current_time = now;

        if self.state != SessionState::Connected {
            return;
        }

        if now.duration_since(self.last_heartbeat_sent) >= self.heartbeat_interval {
            let heartbeat = Packet::Heartbeat {
                timestamp: time::millis_since(self.epoch, now),
            };

            if self.seal_and_queue(heartbeat).is_err() {
                logging::warn!(self.log, "failed to queue heartbeat"; "context" => "tick");
            }

            self.last_heartbeat_sent = now;
        }

        let output = self.reliability.tick(now);

        if !output.expired.is_empty() {
            logging::warn!(self.log, "reliable messages expired without acknowledgement";
                           "context" => "tick",
                           "token" => ?self.token,
                           "expired" => output.expired.len());
        }

        for packet in output.packets {
            if self.seal_and_queue(packet).has_failed_and_logged(&self.log) {
                break;
            }
        }
    }

    /// True once the remote has been silent past the timeout while the
    /// session was CONNECTED.
    #[inline]
    pub fn timed_out(&self, now: Instant) -> bool {
        self.state == SessionState::Connected
            && now.duration_since(self.last_activity) >= self.timeout
    }

    /// True once a DISCONNECTED session has outlived its resumption grace
    /// period and must be destroyed.
    #[inline]
    pub fn expired(&self, now: Instant) -> bool {
        self.state == SessionState::Disconnected
            && now.duration_since(self.last_activity) >= self.timeout
    }

    /// Hands the accumulated sealed datagrams to the endpoint for transmission.
    #[inline]
    pub fn drain_egress(&mut self) -> Vec<Vec<u8>> {
        std::mem::replace(&mut self.egress, Vec::new())
    }

    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.egress.is_empty()
    }

    /// Encodes, seals and queues a packet for the endpoint pump.
    pub(crate) fn seal_and_queue(&mut self, packet: Packet) -> NetResult<()> {
        let plain = packet.encode()?;
        let datagram = self.envelope.seal(&plain)?;

        self.egress.push(datagram);
        self.packets_sent += 1;

        Ok(())
    }
}

trait LoggedResult {
    fn has_failed_and_logged(self, log: &Logger) -> bool;
}

impl LoggedResult for NetResult<()> {
    fn has_failed_and_logged(self, log: &Logger) -> bool {
        match self {
            Ok(()) => false,
            Err(error) => {
                logging::warn!(log, "failed to queue packet"; "context" => "tick", "error" => ?error);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Ephemeral;

    message_records! {
        family PING_RECORDS {
            "test.Ping" record Ping {
                value: i32,
            }
        }
    }

    fn protocol() -> Arc<Protocol> {
        Arc::new(Protocol::build(PING_RECORDS, &[]).unwrap())
    }

    fn settings() -> Settings {
        Settings {
            heartbeat_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(120),
            queue_capacity: 4,
            max_attempts: 3,
        }
    }

    fn envelope_pair() -> (Envelope, Envelope) {
        let ours = Ephemeral::generate();
        let theirs = Ephemeral::generate();

        (
            ours.derive(theirs.public()).unwrap().into_envelope(),
            theirs.derive(ours.public()).unwrap().into_envelope(),
        )
    }

    fn session(envelope: Envelope, now: Instant) -> Session {
        Session::new(
            [7u8; 16],
            "127.0.0.1:9000".parse().unwrap(),
            envelope,
            protocol(),
            settings(),
            now,
            now,
            &logging::discard(),
        )
    }

    #[test]
    fn test_send_produces_sealed_egress() {
        let now = Instant::now();
        let (ours, mut theirs) = envelope_pair();
        let mut session = session(ours, now);

        session.send(&Ping { value: 1 }, Delivery::Reliable).unwrap();

        let egress = session.drain_egress();
        assert_eq!(egress.len(), 1);
        assert_eq!(session.packets_sent(), 1);

        // The peer can open and decode the datagram.
        let plain = theirs.open(&egress[0]).unwrap();
        match Packet::decode(&plain).unwrap() {
            Packet::Data { sequence, .. } => assert_eq!(sequence, Some(0)),
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_send_backpressure_bubbles_up() {
        let now = Instant::now();
        let (ours, _) = envelope_pair();
        let mut session = session(ours, now);

        for _ in 0..4 {
            session.send(&Ping { value: 0 }, Delivery::Reliable).unwrap();
        }

        assert_eq!(
            session.send(&Ping { value: 0 }, Delivery::Reliable).unwrap_err(),
            NetError::QueueFull
        );
        assert!(!session.try_send(&Ping { value: 0 }, Delivery::Reliable));

        // Unreliable traffic is unaffected by the reliable window.
        assert!(session.try_send(&Ping { value: 0 }, Delivery::Unreliable));
    }

    #[test]
    fn test_send_fails_when_disconnected() {
        let now = Instant::now();
        let (ours, _) = envelope_pair();
        let mut session = session(ours, now);

        session.mark_disconnected();

        assert!(session.send(&Ping { value: 0 }, Delivery::Reliable).is_err());
    }

    #[test]
    fn test_close_emits_disconnect() {
        let now = Instant::now();
        let (ours, mut theirs) = envelope_pair();
        let mut session = session(ours, now);

        session.close("goodbye");

        assert_eq!(session.state(), SessionState::Disconnected);

        let egress = session.drain_egress();
        let plain = theirs.open(&egress[0]).unwrap();

        assert_eq!(
            Packet::decode(&plain).unwrap(),
            Packet::Disconnect {
                reason: DisconnectReason::Normal,
                message: "goodbye".to_string(),
            }
        );
    }

    #[test]
    fn test_heartbeat_cadence() {
        let now = Instant::now();
        let (ours, _) = envelope_pair();
        let mut session = session(ours, now);

        // Created "now": first heartbeat only after the interval elapses.
        session.tick(now + Duration::from_secs(1));
        assert!(!session.has_egress());

        session.tick(now + Duration::from_secs(5));
        assert_eq!(session.drain_egress().len(), 1);

        // And not again until another interval passes.
        session.tick(now + Duration::from_secs(6));
        assert!(!session.has_egress());
    }

    #[test]
    fn test_heartbeat_roundtrip_feeds_rtt() {
        let now = Instant::now();
        let (ours, theirs) = envelope_pair();
        let mut alice = session(ours, now);
        let mut bob = Session::new(
            [8u8; 16],
            "127.0.0.1:9001".parse().unwrap(),
            theirs,
            protocol(),
            settings(),
            now,
            now,
            &logging::discard(),
        );

        alice.tick(now + Duration::from_secs(5));
        let heartbeat = alice.drain_egress().remove(0);

        match bob.receive(&heartbeat, now + Duration::from_secs(5)).unwrap() {
            Inbound::Handled => {}
            other => panic!("Unexpected inbound {:?}", other),
        }

        let ack = bob.drain_egress().remove(0);
        alice
            .receive(&ack, now + Duration::from_millis(5080))
            .unwrap();

        assert_eq!(alice.smoothed_rtt(), Some(Duration::from_millis(80)));
    }

    #[test]
    fn test_remote_disconnect_transitions_state() {
        let now = Instant::now();
        let (ours, mut theirs) = envelope_pair();
        let mut session = session(ours, now);

        let notice = Packet::Disconnect {
            reason: DisconnectReason::Kicked,
            message: "misbehaving".to_string(),
        }
        .encode()
        .unwrap();
        let datagram = theirs.seal(&notice).unwrap();

        match session.receive(&datagram, now).unwrap() {
            Inbound::Disconnected(reason, message) => {
                assert_eq!(reason, DisconnectReason::Kicked);
                assert_eq!(message, "misbehaving");
            }
            other => panic!("Unexpected inbound {:?}", other),
        }

        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_timeout_and_expiry_windows() {
        let now = Instant::now();
        let (ours, _) = envelope_pair();
        let mut session = session(ours, now);

        assert!(!session.timed_out(now + Duration::from_secs(119)));
        assert!(session.timed_out(now + Duration::from_secs(120)));

        session.mark_disconnected();

        assert!(!session.expired(now + Duration::from_secs(119)));
        assert!(session.expired(now + Duration::from_secs(120)));
    }

    #[test]
    fn test_resume_replaces_envelope_and_rebinds() {
        let now = Instant::now();
        let (ours, _) = envelope_pair();
        let mut session = session(ours, now);

        session.send(&Ping { value: 1 }, Delivery::Reliable).unwrap();
        session.drain_egress();
        session.mark_disconnected();

        let (new_ours, mut new_theirs) = envelope_pair();
        let new_remote: SocketAddr = "10.0.0.5:4242".parse().unwrap();

        session.resume(new_ours, new_remote, now + Duration::from_secs(30));

        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.remote(), new_remote);

        // The unacked message retransmits under the new keys with its
        // original sequence.
        session.tick(now + Duration::from_secs(33));

        let egress = session.drain_egress();
        let retransmitted = egress
            .iter()
            .filter_map(|datagram| new_theirs.open(datagram).ok())
            .filter_map(|plain| match Packet::decode(&plain).unwrap() {
                Packet::Data { sequence, .. } => sequence,
                _ => None,
            })
            .collect::<Vec<_>>();

        assert_eq!(retransmitted, vec![0]);
    }

    #[test]
    fn test_attachment_storage() {
        let now = Instant::now();
        let (ours, _) = envelope_pair();
        let mut session = session(ours, now);

        session.set_attachment(Box::new(42i32));

        let value = session.attachment().unwrap().downcast_ref::<i32>().unwrap();
        assert_eq!(*value, 42);

        assert!(session.take_attachment().is_some());
        assert!(session.attachment().is_none());
    }
}
