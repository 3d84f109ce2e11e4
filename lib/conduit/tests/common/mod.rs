//! In-memory network router for protocol scenarios: per-endpoint inboxes
//! with configurable loss, duplication, delay and targeted one-shot drops
//! or corruption, all driven by a deterministic seed and a virtual clock.

use conduit::shared::{NetError, NetResult};
use conduit::transport::Transport;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub struct Router {
    now: Instant,
    rng: StdRng,
    inboxes: HashMap<SocketAddr, VecDeque<(Vec<u8>, SocketAddr)>>,
    in_flight: Vec<(Instant, SocketAddr, SocketAddr, Vec<u8>)>,

    loss_rate: f64,
    delay_range_ms: Option<(u64, u64)>,
    duplicate_every: Option<u64>,

    delivered: u64,
    send_counts: HashMap<SocketAddr, u64>,
    drops: HashMap<SocketAddr, HashSet<u64>>,
    corruptions: HashMap<(SocketAddr, u64), usize>,
}

impl Router {
    fn new(seed: u64, now: Instant) -> Router {
        Router {
            now,
            rng: StdRng::seed_from_u64(seed),
            inboxes: HashMap::new(),
            in_flight: Vec::new(),
            loss_rate: 0.0,
            delay_range_ms: None,
            duplicate_every: None,
            delivered: 0,
            send_counts: HashMap::new(),
            drops: HashMap::new(),
            corruptions: HashMap::new(),
        }
    }

    pub fn set_loss_rate(&mut self, rate: f64) {
        self.loss_rate = rate;
    }

    pub fn set_delay_range_ms(&mut self, low: u64, high: u64) {
        self.delay_range_ms = Some((low, high));
    }

    pub fn set_duplicate_every(&mut self, n: u64) {
        self.duplicate_every = Some(n);
    }

    /// Drops the `n`th datagram (0-based) ever sent from `from`.
    pub fn drop_nth_from(&mut self, from: SocketAddr, n: u64) {
        self.drops.entry(from).or_insert_with(HashSet::new).insert(n);
    }

    /// Flips one byte of the `n`th datagram sent from `from`.
    pub fn corrupt_nth_from(&mut self, from: SocketAddr, n: u64, offset: usize) {
        self.corruptions.insert((from, n), offset);
    }

    fn register(&mut self, addr: SocketAddr) {
        self.inboxes.entry(addr).or_insert_with(VecDeque::new);
    }

    fn advance(&mut self, now: Instant) {
        self.now = now;

        let mut index = 0;
        while index < self.in_flight.len() {
            if self.in_flight[index].0 <= now {
                let (_, to, from, bytes) = self.in_flight.swap_remove(index);
                self.deliver(to, from, bytes);
            } else {
                index += 1;
            }
        }
    }

    fn send(&mut self, from: SocketAddr, to: SocketAddr, mut bytes: Vec<u8>) {
        let index = {
            let counter = self.send_counts.entry(from).or_insert(0);
            let index = *counter;
            *counter += 1;
            index
        };

        if let Some(drops) = self.drops.get_mut(&from) {
            if drops.remove(&index) {
                return;
            }
        }

        if let Some(offset) = self.corruptions.remove(&(from, index)) {
            if offset < bytes.len() {
                bytes[offset] ^= 0x01;
            }
        }

        if self.loss_rate > 0.0 && self.rng.gen_bool(self.loss_rate) {
            return;
        }

        let copies = match self.duplicate_every {
            Some(n) if n > 0 && (self.delivered + 1) % n == 0 => 2,
            _ => 1,
        };
        self.delivered += 1;

        for _ in 0..copies {
            match self.delay_range_ms {
                Some((low, high)) => {
                    let delay = if high > low {
                        self.rng.gen_range(low, high + 1)
                    } else {
                        low
                    };
                    let due = self.now + Duration::from_millis(delay);
                    self.in_flight.push((due, to, from, bytes.clone()));
                }
                None => self.deliver(to, from, bytes.clone()),
            }
        }
    }

    fn deliver(&mut self, to: SocketAddr, from: SocketAddr, bytes: Vec<u8>) {
        if let Some(inbox) = self.inboxes.get_mut(&to) {
            inbox.push_back((bytes, from));
        }
    }

    fn recv(&mut self, addr: SocketAddr, buffer: &mut [u8]) -> NetResult<(usize, SocketAddr)> {
        let inbox = self.inboxes.get_mut(&addr).ok_or(NetError::Wait)?;

        match inbox.pop_front() {
            Some((bytes, from)) => {
                let size = bytes.len().min(buffer.len());
                buffer[..size].copy_from_slice(&bytes[..size]);
                Ok((size, from))
            }
            None => Err(NetError::Wait),
        }
    }
}

/// One endpoint's view of the router.
pub struct SimTransport {
    addr: SocketAddr,
    router: Rc<RefCell<Router>>,
}

impl Transport for SimTransport {
    fn send_to(&mut self, datagram: &[u8], addr: SocketAddr) -> NetResult<()> {
        self.router.borrow_mut().send(self.addr, addr, datagram.to_vec());
        Ok(())
    }

    fn recv_from(&mut self, buffer: &mut [u8]) -> NetResult<(usize, SocketAddr)> {
        self.router.borrow_mut().recv(self.addr, buffer)
    }

    fn local_addr(&self) -> NetResult<SocketAddr> {
        Ok(self.addr)
    }
}

/// Virtual-clock harness around the router.
pub struct Sim {
    pub router: Rc<RefCell<Router>>,
    pub now: Instant,
}

impl Sim {
    pub fn new(seed: u64) -> Sim {
        let now = Instant::now();

        Sim {
            router: Rc::new(RefCell::new(Router::new(seed, now))),
            now,
        }
    }

    pub fn endpoint(&self, addr: &str) -> SimTransport {
        let addr: SocketAddr = addr.parse().unwrap();
        self.router.borrow_mut().register(addr);

        SimTransport {
            addr,
            router: Rc::clone(&self.router),
        }
    }

    /// Advances the virtual clock and releases delayed datagrams that came
    /// due.
    pub fn advance(&mut self, dt: Duration) {
        self.now += dt;
        self.router.borrow_mut().advance(self.now);
    }
}
