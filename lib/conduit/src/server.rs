//! Server endpoint: accepts handshakes, routes datagrams to sessions and
//! dispatches decoded messages to the registered handlers.

use crate::config::ServerConfig;
use crate::handshake;
use crate::keys::Identity;
use crate::manager::{Pending, SessionId, SessionManager};
use crate::protocol::record::Record;
use crate::protocol::registry::Protocol;
use crate::session::{Delivery, Inbound, Session};
use crate::shared::{NetError, NetResult};
use crate::transport::{Transport, UdpTransport, MAX_DATAGRAM};
use crate::wire::{DisconnectReason, Packet, RejectReason, PROTOCOL_VERSION};
use keel::logging::{self, Logger};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Why a session left the CONNECTED state.
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectCause {
    /// The remote sent an explicit Disconnect.
    Remote(DisconnectReason, String),
    /// No packet arrived within the session timeout.
    Timeout,
}

type MessageHandler = Box<dyn FnMut(&mut Session, Box<dyn Any>) -> NetResult<()>>;
type SessionCallback = Box<dyn FnMut(&mut Session)>;
type DisconnectCallback = Box<dyn FnMut(&mut Session, &DisconnectCause)>;
type ExpiryCallback = Box<dyn FnMut(Session)>;
type ErrorCallback = Box<dyn FnMut(&mut Session, &NetError)>;

pub struct Server<T: Transport> {
    transport: T,
    config: ServerConfig,
    identity: Identity,
    protocol: Arc<Protocol>,
    manager: SessionManager,

    handlers: hashbrown::HashMap<u16, MessageHandler>,
    on_session_started: Option<SessionCallback>,
    on_session_reconnected: Option<SessionCallback>,
    on_session_disconnected: Option<DisconnectCallback>,
    on_session_expired: Option<ExpiryCallback>,
    on_error: Option<ErrorCallback>,

    accepting: bool,
    running: bool,

    epoch: Instant,
    last_sweep: Instant,

    recv_buffer: Vec<u8>,
    log: Logger,
}

impl Server<UdpTransport> {
    /// Binds a UDP socket per the configuration.
    pub fn bind<'a, L: Into<Option<&'a Logger>>>(
        config: ServerConfig,
        protocol: Protocol,
        log: L,
    ) -> NetResult<Server<UdpTransport>> {
        let transport = UdpTransport::bind(&config.bind_address())?;
        Ok(Server::new(config, protocol, transport, log))
    }
}

impl<T: Transport> Server<T> {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        config: ServerConfig,
        protocol: Protocol,
        transport: T,
        log: L,
    ) -> Server<T> {
        let server_log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "server")),
            None => logging::discard(),
        };

        let now = Instant::now();
        let identity = config.identity();

        Server {
            transport,
            config,
            identity,
            protocol: Arc::new(protocol),
            manager: SessionManager::new(&server_log),
            handlers: hashbrown::HashMap::new(),
            on_session_started: None,
            on_session_reconnected: None,
            on_session_disconnected: None,
            on_session_expired: None,
            on_error: None,
            accepting: false,
            running: false,
            epoch: now,
            last_sweep: now,
            recv_buffer: vec![0u8; MAX_DATAGRAM],
            log: server_log,
        }
    }

    /// Starts accepting handshakes.
    pub fn start(&mut self) {
        self.running = true;
        self.accepting = true;

        logging::info!(self.log, "server started";
                       "context" => "start",
                       "address" => ?self.transport.local_addr().ok());
    }

    /// Stops accepting new handshakes; established sessions continue.
    pub fn stop(&mut self) {
        self.accepting = false;
        logging::info!(self.log, "server stopped accepting"; "context" => "stop");
    }

    /// Graceful shutdown: notifies every session and destroys all state.
    pub fn close(&mut self) {
        logging::info!(self.log, "server closing";
                       "context" => "close",
                       "sessions" => self.manager.len());

        for id in self.manager.live_ids() {
            if let Some(session) = self.manager.get_mut(id) {
                session.disconnect_with(DisconnectReason::Shutdown, "Server shutting down");
            }
        }

        self.flush_egress();

        for id in self.manager.live_ids() {
            self.manager.remove(id);
        }

        self.accepting = false;
        self.running = false;
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running
    }

    #[inline]
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    #[inline]
    pub fn session_count(&self) -> usize {
        self.manager.len()
    }

    #[inline]
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.manager.live_ids()
    }

    #[inline]
    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.manager.get(id)
    }

    #[inline]
    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.manager.get_mut(id)
    }

    /// Registers a typed message handler. Handler errors are routed to the
    /// error callback and never interrupt dispatch.
    pub fn on_message<R, F>(&mut self, mut handler: F) -> NetResult<()>
    where
        R: Record + 'static,
        F: FnMut(&mut Session, R) -> NetResult<()> + 'static,
    {
        let type_id = Protocol::type_id::<R>(&self.protocol)?;

        let adapter: MessageHandler = Box::new(move |session, erased| {
            let record = erased
                .downcast::<R>()
                .map_err(|_| NetError::Serialization)?;
            handler(session, *record)
        });

        self.handlers.insert(type_id, adapter);
        Ok(())
    }

    pub fn on_session_started<F: FnMut(&mut Session) + 'static>(&mut self, callback: F) {
        self.on_session_started = Some(Box::new(callback));
    }

    pub fn on_session_reconnected<F: FnMut(&mut Session) + 'static>(&mut self, callback: F) {
        self.on_session_reconnected = Some(Box::new(callback));
    }

    pub fn on_session_disconnected<F: FnMut(&mut Session, &DisconnectCause) + 'static>(
        &mut self,
        callback: F,
    ) {
        self.on_session_disconnected = Some(Box::new(callback));
    }

    pub fn on_session_expired<F: FnMut(Session) + 'static>(&mut self, callback: F) {
        self.on_session_expired = Some(Box::new(callback));
    }

    pub fn on_error<F: FnMut(&mut Session, &NetError) + 'static>(&mut self, callback: F) {
        self.on_error = Some(Box::new(callback));
    }

    /// Sends a message to every CONNECTED session. Backpressured sessions
    /// are skipped silently.
    pub fn broadcast<R: Record>(&mut self, record: &R, delivery: Delivery) {
        for id in self.manager.live_ids() {
            if let Some(session) = self.manager.get_mut(id) {
                if session.is_connected() {
                    session.try_send(record, delivery);
                }
            }
        }
    }

    /// One pump of the endpoint loop: drains the socket, drives session
    /// ticks and timers, sweeps expired state and flushes outgoing traffic.
    pub fn sync(&mut self, now: Instant) {
        if !self.running {
            return;
        }

        self.pump_incoming(now);
        self.drive_sessions(now);

        if now.duration_since(self.last_sweep) >= SWEEP_INTERVAL {
            self.sweep(now);
            self.last_sweep = now;
        }

        self.flush_egress();
    }

    fn pump_incoming(&mut self, now: Instant) {
        loop {
            let (size, source) = match self.transport.recv_from(&mut self.recv_buffer) {
                Ok(received) => received,
                Err(NetError::Wait) => break,
                Err(error) => {
                    logging::warn!(self.log, "socket receive failed";
                                   "context" => "pump",
                                   "error" => ?error);
                    break;
                }
            };

            let datagram = self.recv_buffer[..size].to_vec();
            self.route(&datagram, source, now);
        }
    }

    /// Datagram routing: plain ClientHello opens a handshake, a pending
    /// handshake consumes the Connect, an established session gets
    /// everything else. Unattributable datagrams are dropped.
    fn route(&mut self, datagram: &[u8], source: SocketAddr, now: Instant) {
        if let Ok(Packet::ClientHello { version, public_key }) = Packet::decode(datagram) {
            self.handle_client_hello(version, public_key, source, now);
            return;
        }

        if self.manager.has_pending(source) {
            self.handle_pending_datagram(datagram, source, now);
            return;
        }

        if let Some(id) = self.manager.lookup_addr(source) {
            self.handle_session_datagram(id, datagram, now);
            return;
        }

        logging::trace!(self.log, "dropping unattributable datagram";
                        "context" => "route",
                        "source" => source.to_string(),
                        "size" => datagram.len());
    }

    fn handle_client_hello(
        &mut self,
        version: u8,
        client_public: [u8; 32],
        source: SocketAddr,
        now: Instant,
    ) {
        if !self.accepting {
            logging::debug!(self.log, "ignoring hello while not accepting";
                            "context" => "handshake",
                            "source" => source.to_string());
            return;
        }

        if version != PROTOCOL_VERSION {
            logging::debug!(self.log, "unsupported hello version";
                            "context" => "handshake",
                            "source" => source.to_string(),
                            "version" => version);
            return;
        }

        let (hello, envelope) = match handshake::server_hello(&self.identity, &client_public) {
            Ok(response) => response,
            Err(error) => {
                logging::warn!(self.log, "handshake derivation failed";
                               "context" => "handshake",
                               "source" => source.to_string(),
                               "error" => ?error);
                return;
            }
        };

        // A repeated hello from the same address replaces the prior attempt.
        self.manager.put_pending(
            source,
            Pending {
                envelope,
                created: now,
            },
        );

        match hello.encode() {
            Ok(bytes) => self.send_raw(&bytes, source),
            Err(error) => {
                logging::warn!(self.log, "failed to encode hello";
                               "context" => "handshake",
                               "error" => ?error);
            }
        }
    }

    fn handle_pending_datagram(&mut self, datagram: &[u8], source: SocketAddr, now: Instant) {
        let mut pending = match self.manager.take_pending(source) {
            Some(pending) => pending,
            None => return,
        };

        // An undecryptable or malformed packet burns the pending handshake.
        let connect = pending
            .envelope
            .open(datagram)
            .and_then(|plain| Packet::decode(&plain));

        match connect {
            Ok(Packet::Connect {
                protocol_hash,
                resume,
            }) => self.handle_connect(pending.envelope, protocol_hash, resume, source, now),
            Ok(other) => {
                logging::debug!(self.log, "unexpected packet during handshake";
                                "context" => "handshake",
                                "source" => source.to_string(),
                                "packet" => ?other);
            }
            Err(error) => {
                logging::debug!(self.log, "dropping pending handshake";
                                "context" => "handshake",
                                "source" => source.to_string(),
                                "error" => ?error);
            }
        }
    }

    fn handle_connect(
        &mut self,
        envelope: crate::envelope::Envelope,
        protocol_hash: [u8; 32],
        resume: Option<crate::wire::Resume>,
        source: SocketAddr,
        now: Instant,
    ) {
        if &protocol_hash != self.protocol.hash() {
            self.reject(
                envelope,
                RejectReason::ProtocolMismatch,
                "Protocol hash mismatch",
                source,
            );
            return;
        }

        match resume {
            Some(resume) => self.resume_session(envelope, resume, source, now),
            None => self.accept_session(envelope, source, now),
        }
    }

    fn resume_session(
        &mut self,
        envelope: crate::envelope::Envelope,
        resume: crate::wire::Resume,
        source: SocketAddr,
        now: Instant,
    ) {
        let id = match self.manager.lookup_token(&resume.token) {
            Some(id) => id,
            None => {
                self.reject(
                    envelope,
                    RejectReason::InvalidToken,
                    "Unknown session token",
                    source,
                );
                return;
            }
        };

        let connected = self
            .manager
            .get(id)
            .map_or(false, Session::is_connected);

        if connected {
            // A concurrent claim on a live session is a duplicate or an attack.
            self.reject(
                envelope,
                RejectReason::InvalidToken,
                "Session is still connected",
                source,
            );
            return;
        }

        let session = match self.manager.get_mut(id) {
            Some(session) => session,
            None => return,
        };

        let old_remote = session.remote();
        session.resume(envelope, source, now);
        session.resume_ack(resume.last_received_seq);

        let accept = Packet::Accept {
            token: resume.token,
            heartbeat_ms: self.config.heartbeat_interval_ms as u32,
            timeout_ms: self.config.session_timeout_ms as u32,
            last_received_seq: session.next_expected_wire(),
        };

        if let Err(error) = session.seal_and_queue(accept) {
            logging::warn!(self.log, "failed to queue accept";
                           "context" => "handshake",
                           "error" => ?error);
        }

        self.manager.rebind(id, old_remote, source);

        if let Some(callback) = self.on_session_reconnected.as_mut() {
            if let Some(session) = self.manager.get_mut(id) {
                callback(session);
            }
        }
    }

    fn accept_session(
        &mut self,
        envelope: crate::envelope::Envelope,
        source: SocketAddr,
        now: Instant,
    ) {
        if let Some(limit) = self.config.max_connections {
            if self.manager.connected_count() >= limit {
                self.reject(envelope, RejectReason::ServerFull, "Server is full", source);
                return;
            }
        }

        let token = self.manager.generate_token();

        let mut session = Session::new(
            token,
            source,
            envelope,
            Arc::clone(&self.protocol),
            self.config.session_settings(),
            self.epoch,
            now,
            &self.log,
        );

        let accept = Packet::Accept {
            token,
            heartbeat_ms: self.config.heartbeat_interval_ms as u32,
            timeout_ms: self.config.session_timeout_ms as u32,
            last_received_seq: 0,
        };

        if let Err(error) = session.seal_and_queue(accept) {
            logging::warn!(self.log, "failed to queue accept";
                           "context" => "handshake",
                           "error" => ?error);
            return;
        }

        let id = self.manager.register(session);

        if let Some(callback) = self.on_session_started.as_mut() {
            if let Some(session) = self.manager.get_mut(id) {
                callback(session);
            }
        }
    }

    fn reject(
        &mut self,
        mut envelope: crate::envelope::Envelope,
        reason: RejectReason,
        message: &str,
        source: SocketAddr,
    ) {
        logging::debug!(self.log, "rejecting connection";
                        "context" => "handshake",
                        "source" => source.to_string(),
                        "reason" => ?reason);

        let packet = Packet::Reject {
            reason,
            message: message.to_string(),
        };

        let sealed = packet
            .encode()
            .and_then(|plain| envelope.seal(&plain));

        match sealed {
            Ok(datagram) => self.send_raw(&datagram, source),
            Err(error) => {
                logging::warn!(self.log, "failed to seal reject";
                               "context" => "handshake",
                               "error" => ?error);
            }
        }
    }

    fn handle_session_datagram(&mut self, id: SessionId, datagram: &[u8], now: Instant) {
        let session = match self.manager.get_mut(id) {
            Some(session) => session,
            None => return,
        };

        match session.receive(datagram, now) {
            Ok(Inbound::Messages(messages)) => self.dispatch_messages(id, messages),
            Ok(Inbound::Disconnected(reason, message)) => {
                let cause = DisconnectCause::Remote(reason, message);
                if let Some(callback) = self.on_session_disconnected.as_mut() {
                    if let Some(session) = self.manager.get_mut(id) {
                        callback(session, &cause);
                    }
                }
            }
            Ok(Inbound::Handled) => {}
            Err(error) => {
                // Decrypt and decode failures are local to the datagram;
                // an established session is never torn down for them.
                logging::debug!(self.log, "dropping session datagram";
                                "context" => "receive",
                                "session_id" => id,
                                "error" => ?error);
            }
        }
    }

    fn dispatch_messages(&mut self, id: SessionId, messages: Vec<(u16, Vec<u8>)>) {
        for (type_id, payload) in messages {
            if Protocol::is_server_record(type_id) {
                logging::warn!(self.log, "client sent a server-direction record";
                               "context" => "dispatch",
                               "type_id" => type_id);
                continue;
            }

            let erased = match self.protocol.decode(type_id, &payload) {
                Ok(erased) => erased,
                Err(error) => {
                    logging::warn!(self.log, "failed to decode message";
                                   "context" => "dispatch",
                                   "type_id" => type_id,
                                   "error" => ?error);
                    continue;
                }
            };

            let handler = match self.handlers.get_mut(&type_id) {
                Some(handler) => handler,
                None => {
                    logging::debug!(self.log, "no handler for message";
                                    "context" => "dispatch",
                                    "type_id" => type_id);
                    continue;
                }
            };

            let session = match self.manager.get_mut(id) {
                Some(session) => session,
                None => return,
            };

            if let Err(error) = handler(session, erased) {
                logging::warn!(self.log, "message handler failed";
                               "context" => "dispatch",
                               "type_id" => type_id,
                               "error" => ?error);

                if let Some(callback) = self.on_error.as_mut() {
                    if let Some(session) = self.manager.get_mut(id) {
                        callback(session, &error);
                    }
                }
            }
        }
    }

    fn drive_sessions(&mut self, now: Instant) {
        for id in self.manager.live_ids() {
            let timed_out = {
                let session = match self.manager.get_mut(id) {
                    Some(session) => session,
                    None => continue,
                };

                session.tick(now);
                session.timed_out(now)
            };

            if timed_out {
                if let Some(session) = self.manager.get_mut(id) {
                    session.mark_disconnected();
                }

                if let Some(callback) = self.on_session_disconnected.as_mut() {
                    if let Some(session) = self.manager.get_mut(id) {
                        callback(session, &DisconnectCause::Timeout);
                    }
                }
            }
        }
    }

    fn sweep(&mut self, now: Instant) {
        for session in self.manager.sweep(now) {
            logging::debug!(self.log, "session expired";
                            "context" => "sweep",
                            "token" => ?session.token());

            if let Some(callback) = self.on_session_expired.as_mut() {
                callback(session);
            }
        }
    }

    fn flush_egress(&mut self) {
        for id in self.manager.live_ids() {
            let (datagrams, remote) = match self.manager.get_mut(id) {
                Some(session) if session.has_egress() => (session.drain_egress(), session.remote()),
                _ => continue,
            };

            for datagram in datagrams {
                self.send_raw(&datagram, remote);
            }
        }
    }

    fn send_raw(&mut self, datagram: &[u8], target: SocketAddr) {
        if let Err(error) = self.transport.send_to(datagram, target) {
            if error != NetError::Wait {
                logging::warn!(self.log, "socket send failed";
                               "context" => "send",
                               "target" => target.to_string(),
                               "error" => ?error);
            }
        }
    }
}
