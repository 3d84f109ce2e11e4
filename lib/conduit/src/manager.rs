//! Server-side bookkeeping: sessions indexed by token and by remote
//! address, pending handshakes keyed by address, and the expiry sweep.

use crate::envelope::Envelope;
use crate::session::Session;
use crate::shared::Token;
use hashbrown::HashMap;
use indexmap::IndexSet;
use keel::crypto;
use keel::logging::{self, Logger};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A pending handshake lives at most this long between ClientHello and Connect.
pub const PENDING_LIFETIME: Duration = Duration::from_secs(30);

pub type SessionId = usize;

/// Server state held between ServerHello and Connect. The ephemeral secret
/// is consumed during derivation; only the resulting envelope remains.
pub struct Pending {
    pub envelope: Envelope,
    pub created: Instant,
}

pub struct SessionManager {
    slots: Vec<Option<Session>>,
    free: Vec<SessionId>,
    live: IndexSet<SessionId>,
    by_token: HashMap<Token, SessionId>,
    by_addr: HashMap<SocketAddr, SessionId>,
    pending: HashMap<SocketAddr, Pending>,
    log: Logger,
}

impl SessionManager {
    pub fn new(log: &Logger) -> SessionManager {
        SessionManager {
            slots: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            by_token: HashMap::new(),
            by_addr: HashMap::new(),
            pending: HashMap::new(),
            log: log.new(logging::o!()),
        }
    }

    /// Number of tracked sessions, connected or lingering for resumption.
    #[inline]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Number of sessions currently in the CONNECTED state, for admission
    /// control.
    pub fn connected_count(&self) -> usize {
        self.live
            .iter()
            .filter(|&&id| self.slots[id].as_ref().map_or(false, Session::is_connected))
            .count()
    }

    /// Generates a token that is unique among the sessions of this server.
    pub fn generate_token(&self) -> Token {
        loop {
            let mut token = [0u8; 16];
            crypto::random_bytes(&mut token);

            if !self.by_token.contains_key(&token) {
                return token;
            }
        }
    }

    /// Registers a freshly accepted session under its token and address.
    pub fn register(&mut self, session: Session) -> SessionId {
        let token = *session.token();
        let remote = session.remote();

        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(session);
                id
            }
            None => {
                self.slots.push(Some(session));
                self.slots.len() - 1
            }
        };

        self.live.insert(id);
        self.by_token.insert(token, id);

        if let Some(stale) = self.by_addr.insert(remote, id) {
            logging::warn!(self.log, "address index displaced a session";
                           "context" => "register",
                           "address" => remote.to_string(),
                           "displaced" => stale);
        }

        logging::debug!(self.log, "session registered";
                        "context" => "register",
                        "session_id" => id,
                        "sessions" => self.live.len());

        id
    }

    #[inline]
    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    #[inline]
    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    #[inline]
    pub fn lookup_addr(&self, addr: SocketAddr) -> Option<SessionId> {
        self.by_addr.get(&addr).copied()
    }

    #[inline]
    pub fn lookup_token(&self, token: &Token) -> Option<SessionId> {
        self.by_token.get(token).copied()
    }

    /// Snapshot of the live session ids, safe to iterate while sessions are
    /// mutated.
    #[inline]
    pub fn live_ids(&self) -> Vec<SessionId> {
        self.live.iter().copied().collect()
    }

    /// Atomically re-points the address index after a reconnect rebind.
    pub fn rebind(&mut self, id: SessionId, old: SocketAddr, new: SocketAddr) {
        if self.by_addr.get(&old) == Some(&id) {
            self.by_addr.remove(&old);
        }

        if let Some(stale) = self.by_addr.insert(new, id) {
            if stale != id {
                logging::warn!(self.log, "rebind displaced a session";
                               "context" => "rebind",
                               "address" => new.to_string(),
                               "displaced" => stale);
            }
        }
    }

    /// Unindexes and returns a session, e.g. on expiry or shutdown.
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let session = self.slots.get_mut(id).and_then(Option::take)?;

        self.live.remove(&id);
        self.free.push(id);
        self.by_token.remove(session.token());

        if self.by_addr.get(&session.remote()) == Some(&id) {
            self.by_addr.remove(&session.remote());
        }

        logging::debug!(self.log, "session removed";
                        "context" => "remove",
                        "session_id" => id,
                        "sessions" => self.live.len());

        Some(session)
    }

    /// Stores a pending handshake, replacing any prior one from the same
    /// address.
    #[inline]
    pub fn put_pending(&mut self, addr: SocketAddr, pending: Pending) {
        self.pending.insert(addr, pending);
    }

    #[inline]
    pub fn has_pending(&self, addr: SocketAddr) -> bool {
        self.pending.contains_key(&addr)
    }

    #[inline]
    pub fn take_pending(&mut self, addr: SocketAddr) -> Option<Pending> {
        self.pending.remove(&addr)
    }

    /// Destroys sessions whose resumption grace period ran out and prunes
    /// stale pending handshakes. Returns the expired sessions so the caller
    /// can emit events.
    pub fn sweep(&mut self, now: Instant) -> Vec<Session> {
        let expired_ids: Vec<SessionId> = self
            .live
            .iter()
            .copied()
            .filter(|&id| {
                self.slots[id]
                    .as_ref()
                    .map_or(false, |session| session.expired(now))
            })
            .collect();

        let mut expired = Vec::with_capacity(expired_ids.len());
        for id in expired_ids {
            if let Some(session) = self.remove(id) {
                expired.push(session);
            }
        }

        self.pending
            .retain(|_, pending| now.duration_since(pending.created) < PENDING_LIFETIME);

        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Ephemeral;
    use crate::protocol::registry::Protocol;
    use crate::session::Settings;
    use std::sync::Arc;

    fn envelope() -> Envelope {
        let ours = Ephemeral::generate();
        let theirs = Ephemeral::generate();
        ours.derive(theirs.public()).unwrap().into_envelope()
    }

    fn session(token: Token, addr: &str, now: Instant) -> Session {
        Session::new(
            token,
            addr.parse().unwrap(),
            envelope(),
            Arc::new(Protocol::build(&[], &[]).unwrap()),
            Settings {
                heartbeat_interval: Duration::from_secs(5),
                timeout: Duration::from_secs(120),
                queue_capacity: 4,
                max_attempts: 3,
            },
            now,
            now,
            &logging::discard(),
        )
    }

    fn manager() -> SessionManager {
        SessionManager::new(&logging::discard())
    }

    #[test]
    fn test_register_and_lookup() {
        let now = Instant::now();
        let mut manager = manager();

        let id = manager.register(session([1; 16], "127.0.0.1:5000", now));

        assert_eq!(manager.len(), 1);
        assert_eq!(manager.lookup_token(&[1; 16]), Some(id));
        assert_eq!(manager.lookup_addr("127.0.0.1:5000".parse().unwrap()), Some(id));
        assert!(manager.get(id).is_some());
    }

    #[test]
    fn test_slot_reuse_after_removal() {
        let now = Instant::now();
        let mut manager = manager();

        let first = manager.register(session([1; 16], "127.0.0.1:5000", now));
        manager.remove(first);

        let second = manager.register(session([2; 16], "127.0.0.1:5001", now));

        assert_eq!(first, second);
        assert_eq!(manager.lookup_token(&[1; 16]), None);
        assert_eq!(manager.lookup_token(&[2; 16]), Some(second));
    }

    #[test]
    fn test_generated_tokens_unique() {
        let manager = manager();
        let mut seen = hashbrown::HashSet::new();

        for _ in 0..4096 {
            assert!(seen.insert(manager.generate_token()));
        }
    }

    #[test]
    fn test_rebind_moves_address_index() {
        let now = Instant::now();
        let mut manager = manager();

        let old: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let new: SocketAddr = "10.1.1.1:6000".parse().unwrap();

        let id = manager.register(session([1; 16], "127.0.0.1:5000", now));
        manager.rebind(id, old, new);

        assert_eq!(manager.lookup_addr(old), None);
        assert_eq!(manager.lookup_addr(new), Some(id));
    }

    #[test]
    fn test_sweep_destroys_expired_sessions() {
        let now = Instant::now();
        let mut manager = manager();

        let id = manager.register(session([1; 16], "127.0.0.1:5000", now));
        manager.get_mut(id).unwrap().mark_disconnected();

        assert!(manager.sweep(now + Duration::from_secs(60)).is_empty());

        let expired = manager.sweep(now + Duration::from_secs(120));

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].token(), &[1; 16]);
        assert_eq!(manager.len(), 0);
        assert_eq!(manager.lookup_token(&[1; 16]), None);
    }

    #[test]
    fn test_connected_sessions_are_not_swept() {
        let now = Instant::now();
        let mut manager = manager();

        manager.register(session([1; 16], "127.0.0.1:5000", now));

        assert!(manager.sweep(now + Duration::from_secs(600)).is_empty());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_pending_replacement_and_pruning() {
        let now = Instant::now();
        let mut manager = manager();
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        manager.put_pending(
            addr,
            Pending {
                envelope: envelope(),
                created: now,
            },
        );
        manager.put_pending(
            addr,
            Pending {
                envelope: envelope(),
                created: now + Duration::from_secs(10),
            },
        );

        assert!(manager.has_pending(addr));

        // The replacement resets the clock: not pruned at the original deadline.
        manager.sweep(now + Duration::from_secs(35));
        assert!(manager.has_pending(addr));

        manager.sweep(now + Duration::from_secs(41));
        assert!(!manager.has_pending(addr));
    }

    #[test]
    fn test_connected_count() {
        let now = Instant::now();
        let mut manager = manager();

        let first = manager.register(session([1; 16], "127.0.0.1:5000", now));
        manager.register(session([2; 16], "127.0.0.1:5001", now));

        assert_eq!(manager.connected_count(), 2);

        manager.get_mut(first).unwrap().mark_disconnected();

        assert_eq!(manager.connected_count(), 1);
        assert_eq!(manager.len(), 2);
    }
}
