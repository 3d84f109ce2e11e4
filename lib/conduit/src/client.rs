//! Client endpoint: a single-session driver with handshake retry and
//! session resumption.

use crate::config::ClientConfig;
use crate::envelope::Envelope;
use crate::handshake::{self, HANDSHAKE_TIMEOUT, HELLO_RETRY_INTERVAL};
use crate::keys::Ephemeral;
use crate::protocol::record::Record;
use crate::protocol::registry::Protocol;
use crate::server::DisconnectCause;
use crate::session::{Delivery, Inbound, Session, Settings};
use crate::shared::{NetError, NetResult, Token};
use crate::transport::{Transport, UdpTransport, MAX_DATAGRAM};
use crate::wire::{Packet, Resume};
use keel::logging::{self, Logger};
use std::any::Any;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClientState {
    Disconnected,
    AwaitingServerHello,
    AwaitingAccept,
    Connected,
}

type MessageHandler = Box<dyn FnMut(&mut Session, Box<dyn Any>) -> NetResult<()>>;

pub struct Client<T: Transport> {
    transport: T,
    server_addr: SocketAddr,
    config: ClientConfig,
    protocol: Arc<Protocol>,

    state: ClientState,
    ephemeral: Option<Ephemeral>,
    envelope: Option<Envelope>,
    session: Option<Session>,
    remembered: Option<Token>,

    handshake_started: Option<Instant>,
    last_hello_sent: Option<Instant>,

    handlers: hashbrown::HashMap<u16, MessageHandler>,
    on_connected: Option<Box<dyn FnMut(&mut Session)>>,
    on_disconnected: Option<Box<dyn FnMut(&DisconnectCause)>>,
    on_connection_failed: Option<Box<dyn FnMut(&NetError)>>,
    on_error: Option<Box<dyn FnMut(&mut Session, &NetError)>>,

    epoch: Instant,
    recv_buffer: Vec<u8>,
    log: Logger,
}

impl Client<UdpTransport> {
    /// Binds an ephemeral UDP port and resolves the configured server
    /// address.
    pub fn open<'a, L: Into<Option<&'a Logger>>>(
        config: ClientConfig,
        protocol: Protocol,
        log: L,
    ) -> NetResult<Client<UdpTransport>> {
        let server_addr = config
            .server_address()
            .to_socket_addrs()?
            .next()
            .ok_or(NetError::AddrParse)?;

        let transport = UdpTransport::bind("0.0.0.0:0")?;

        Ok(Client::new(config, protocol, transport, server_addr, log))
    }
}

impl<T: Transport> Client<T> {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        config: ClientConfig,
        protocol: Protocol,
        transport: T,
        server_addr: SocketAddr,
        log: L,
    ) -> Client<T> {
        let client_log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "client")),
            None => logging::discard(),
        };

        Client {
            transport,
            server_addr,
            config,
            protocol: Arc::new(protocol),
            state: ClientState::Disconnected,
            ephemeral: None,
            envelope: None,
            session: None,
            remembered: None,
            handshake_started: None,
            last_hello_sent: None,
            handlers: hashbrown::HashMap::new(),
            on_connected: None,
            on_disconnected: None,
            on_connection_failed: None,
            on_error: None,
            epoch: Instant::now(),
            recv_buffer: vec![0u8; MAX_DATAGRAM],
            log: client_log,
        }
    }

    #[inline]
    pub fn state(&self) -> ClientState {
        self.state
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    /// The session token received at Accept; remembered across disconnects
    /// for resumption.
    #[inline]
    pub fn token(&self) -> Option<&Token> {
        self.remembered.as_ref()
    }

    #[inline]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    #[inline]
    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    #[inline]
    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.session.as_ref().and_then(Session::smoothed_rtt)
    }

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

    pub fn on_connected<F: FnMut(&mut Session) + 'static>(&mut self, callback: F) {
        self.on_connected = Some(Box::new(callback));
    }

    pub fn on_disconnected<F: FnMut(&DisconnectCause) + 'static>(&mut self, callback: F) {
        self.on_disconnected = Some(Box::new(callback));
    }

    pub fn on_connection_failed<F: FnMut(&NetError) + 'static>(&mut self, callback: F) {
        self.on_connection_failed = Some(Box::new(callback));
    }

    pub fn on_error<F: FnMut(&mut Session, &NetError) + 'static>(&mut self, callback: F) {
        self.on_error = Some(Box::new(callback));
    }

    /// Initiates the handshake. If a token is remembered from an earlier
    /// connection, the eventual Connect asks the server to resume it.
    pub fn connect(&mut self, now: Instant) -> NetResult<()> {
        if self.state != ClientState::Disconnected {
            return Err(NetError::Protocol("Connection already in progress".to_string()));
        }

        logging::info!(self.log, "connecting";
                       "context" => "connect",
                       "server" => self.server_addr.to_string(),
                       "resuming" => self.remembered.is_some());

        self.ephemeral = Some(Ephemeral::generate());
        self.handshake_started = Some(now);
        self.send_hello(now);
        self.state = ClientState::AwaitingServerHello;

        Ok(())
    }

    /// Gracefully leaves the session. The token stays remembered, so a
    /// later `connect` resumes the server-side session if it still exists.
    pub fn disconnect(&mut self) {
        if let Some(session) = self.session.as_mut() {
            if session.is_connected() {
                session.close("Client disconnect");
            }
        }

        self.flush_session_egress();
        self.state = ClientState::Disconnected;
    }

    pub fn send<R: Record>(&mut self, record: &R, delivery: Delivery) -> NetResult<()> {
        if self.state != ClientState::Connected {
            return Err(NetError::Protocol("Client is not connected".to_string()));
        }

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| NetError::Protocol("Client has no session".to_string()))?;

        session.send(record, delivery)
    }

    #[inline]
    pub fn try_send<R: Record>(&mut self, record: &R, delivery: Delivery) -> bool {
        self.send(record, delivery).is_ok()
    }

    /// One pump of the endpoint loop.
    pub fn sync(&mut self, now: Instant) {
        self.pump_incoming(now);
        self.drive_timers(now);
        self.flush_session_egress();
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

            if source != self.server_addr {
                continue;
            }

            let datagram = self.recv_buffer[..size].to_vec();
            self.route(&datagram, now);
        }
    }

    fn route(&mut self, datagram: &[u8], now: Instant) {
        match self.state {
            ClientState::AwaitingServerHello => self.handle_server_hello(datagram, now),
            ClientState::AwaitingAccept => self.handle_accept(datagram, now),
            ClientState::Connected => self.handle_session_datagram(datagram, now),
            ClientState::Disconnected => {}
        }
    }

    fn handle_server_hello(&mut self, datagram: &[u8], now: Instant) {
        let (version, public_key, signature) = match Packet::decode(datagram) {
            Ok(Packet::ServerHello {
                version,
                public_key,
                signature,
            }) => (version, public_key, signature),
            _ => return,
        };

        let ephemeral = match self.ephemeral.as_ref() {
            Some(ephemeral) => ephemeral,
            None => return,
        };

        let envelope = match handshake::process_server_hello(
            ephemeral,
            version,
            &public_key,
            &signature,
            &self.config.server_public_key,
        ) {
            Ok(envelope) => envelope,
            Err(error) => {
                self.fail_connection(error);
                return;
            }
        };

        self.envelope = Some(envelope);
        self.send_connect(now);
        self.state = ClientState::AwaitingAccept;
    }

    fn send_connect(&mut self, _now: Instant) {
        let resume = match (&self.remembered, &self.session) {
            (Some(token), Some(session)) => Some(Resume {
                token: *token,
                last_received_seq: session.next_expected_wire(),
            }),
            _ => None,
        };

        let connect = Packet::Connect {
            protocol_hash: *self.protocol.hash(),
            resume,
        };

        let sealed = connect.encode().and_then(|plain| {
            self.envelope
                .as_mut()
                .ok_or_else(|| NetError::Protocol("No handshake envelope".to_string()))?
                .seal(&plain)
        });

        match sealed {
            Ok(datagram) => self.send_raw(&datagram),
            Err(error) => {
                logging::warn!(self.log, "failed to build connect";
                               "context" => "handshake",
                               "error" => ?error);
            }
        }
    }

    fn handle_accept(&mut self, datagram: &[u8], now: Instant) {
        let envelope = match self.envelope.as_mut() {
            Some(envelope) => envelope,
            None => return,
        };

        let packet = envelope.open(datagram).and_then(|plain| Packet::decode(&plain));

        match packet {
            Ok(Packet::Accept {
                token,
                heartbeat_ms,
                timeout_ms,
                last_received_seq,
            }) => {
                let envelope = self.envelope.take().expect("Envelope checked above");

                let resuming = self.remembered == Some(token) && self.session.is_some();

                if resuming {
                    let session = self.session.as_mut().expect("Session checked above");
                    session.resume(envelope, self.server_addr, now);
                    session.resume_ack(last_received_seq);
                } else {
                    self.session = Some(Session::new(
                        token,
                        self.server_addr,
                        envelope,
                        Arc::clone(&self.protocol),
                        Settings {
                            heartbeat_interval: Duration::from_millis(u64::from(heartbeat_ms)),
                            timeout: Duration::from_millis(u64::from(timeout_ms)),
                            queue_capacity: self.config.max_reliable_queue_size,
                            max_attempts: crate::outbound::DEFAULT_MAX_ATTEMPTS,
                        },
                        self.epoch,
                        now,
                        &self.log,
                    ));
                }

                self.remembered = Some(token);
                self.ephemeral = None;
                self.handshake_started = None;
                self.state = ClientState::Connected;

                logging::info!(self.log, "connected";
                               "context" => "handshake",
                               "resumed" => resuming);

                if let Some(callback) = self.on_connected.as_mut() {
                    if let Some(session) = self.session.as_mut() {
                        callback(session);
                    }
                }
            }
            Ok(Packet::Reject { reason, message }) => {
                // A rejected token is gone for good; do not offer it again.
                if reason == crate::wire::RejectReason::InvalidToken
                    || reason == crate::wire::RejectReason::SessionExpired
                {
                    self.remembered = None;
                    self.session = None;
                }

                self.fail_connection(NetError::Protocol(format!(
                    "Connection rejected ({:?}): {}",
                    reason, message
                )));
            }
            Ok(_) => {}
            Err(error) => {
                logging::debug!(self.log, "dropping handshake datagram";
                                "context" => "handshake",
                                "error" => ?error);
            }
        }
    }

    fn handle_session_datagram(&mut self, datagram: &[u8], now: Instant) {
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return,
        };

        match session.receive(datagram, now) {
            Ok(Inbound::Messages(messages)) => self.dispatch_messages(messages),
            Ok(Inbound::Disconnected(reason, message)) => {
                self.state = ClientState::Disconnected;
                if let Some(callback) = self.on_disconnected.as_mut() {
                    callback(&DisconnectCause::Remote(reason, message));
                }
            }
            Ok(Inbound::Handled) => {}
            Err(error) => {
                logging::debug!(self.log, "dropping session datagram";
                                "context" => "receive",
                                "error" => ?error);
            }
        }
    }

    fn dispatch_messages(&mut self, messages: Vec<(u16, Vec<u8>)>) {
        for (type_id, payload) in messages {
            if !Protocol::is_server_record(type_id) {
                logging::warn!(self.log, "server sent a client-direction record";
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

            let session = match self.session.as_mut() {
                Some(session) => session,
                None => return,
            };

            if let Err(error) = handler(session, erased) {
                logging::warn!(self.log, "message handler failed";
                               "context" => "dispatch",
                               "type_id" => type_id,
                               "error" => ?error);

                if let Some(callback) = self.on_error.as_mut() {
                    if let Some(session) = self.session.as_mut() {
                        callback(session, &error);
                    }
                }
            }
        }
    }

    fn drive_timers(&mut self, now: Instant) {
        match self.state {
            ClientState::AwaitingServerHello | ClientState::AwaitingAccept => {
                if let Some(started) = self.handshake_started {
                    if now.duration_since(started) >= HANDSHAKE_TIMEOUT {
                        self.fail_connection(NetError::Timeout);
                        return;
                    }
                }

                // Any lost handshake packet is recovered by restarting from
                // the hello; the server replaces the stale pending state.
                let resend_due = self
                    .last_hello_sent
                    .map_or(true, |sent| now.duration_since(sent) >= HELLO_RETRY_INTERVAL);

                if resend_due {
                    self.send_hello(now);
                    self.envelope = None;
                    self.state = ClientState::AwaitingServerHello;
                }
            }
            ClientState::Connected => {
                let timed_out = match self.session.as_mut() {
                    Some(session) => {
                        session.tick(now);
                        session.timed_out(now)
                    }
                    None => false,
                };

                if timed_out {
                    if let Some(session) = self.session.as_mut() {
                        session.mark_disconnected();
                    }

                    self.state = ClientState::Disconnected;

                    if let Some(callback) = self.on_disconnected.as_mut() {
                        callback(&DisconnectCause::Timeout);
                    }
                }
            }
            ClientState::Disconnected => {}
        }
    }

    fn send_hello(&mut self, now: Instant) {
        let hello = match self.ephemeral.as_ref() {
            Some(ephemeral) => handshake::client_hello(ephemeral),
            None => return,
        };

        match hello.encode() {
            Ok(bytes) => self.send_raw(&bytes),
            Err(error) => {
                logging::warn!(self.log, "failed to encode hello";
                               "context" => "handshake",
                               "error" => ?error);
            }
        }

        self.last_hello_sent = Some(now);
    }

    fn fail_connection(&mut self, error: NetError) {
        logging::warn!(self.log, "connection failed";
                       "context" => "handshake",
                       "error" => ?error);

        self.state = ClientState::Disconnected;
        self.ephemeral = None;
        self.envelope = None;
        self.handshake_started = None;

        if let Some(callback) = self.on_connection_failed.as_mut() {
            callback(&error);
        }
    }

    fn flush_session_egress(&mut self) {
        let datagrams = match self.session.as_mut() {
            Some(session) if session.has_egress() => session.drain_egress(),
            _ => return,
        };

        for datagram in datagrams {
            self.send_raw(&datagram);
        }
    }

    fn send_raw(&mut self, datagram: &[u8]) {
        if let Err(error) = self.transport.send_to(datagram, self.server_addr) {
            if error != NetError::Wait {
                logging::warn!(self.log, "socket send failed";
                               "context" => "send",
                               "error" => ?error);
            }
        }
    }
}
