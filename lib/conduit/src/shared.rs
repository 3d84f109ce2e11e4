use std::io;
use std::net;

/// Opaque identifier a client uses to resume a server side session.
pub type Token = [u8; 16];

pub type NetResult<T> = Result<T, NetError>;

/// Closed set of protocol error conditions. `Wait` is the only non-fatal
/// variant: the operation cannot make progress right now and should be
/// retried on the next pump.
#[derive(Debug, Clone, PartialEq)]
pub enum NetError {
    Wait,
    /// The decoder rejected the wire bytes. The datagram is dropped.
    MalformedPacket,
    /// AEAD authentication failure or nonce counter outside the window.
    DecryptionFailed,
    /// Version/signature/hash mismatch or an illegal state transition.
    Protocol(String),
    /// The reliable outbound queue is at capacity.
    QueueFull,
    /// No traffic within the session or handshake deadline.
    Timeout,
    /// Admission control denied the connection.
    ServerFull,
    /// A record could not be encoded or decoded.
    Serialization,
    AddrParse,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            kind => NetError::Io(kind),
        }
    }
}

impl From<net::AddrParseError> for NetError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetError::AddrParse
    }
}

/// Wraparound-safe sequence comparison: true iff `a` precedes `b` in 32-bit
/// modular order. Well defined as long as the two sequences are less than
/// half the space apart.
#[inline]
pub fn seq_less_than(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) & 0x8000_0000 != 0
}

/// True iff `a` precedes or equals `b` in 32-bit modular order.
#[inline]
pub fn seq_less_equal(a: u32, b: u32) -> bool {
    a == b || seq_less_than(a, b)
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetError::Wait) => false,
            _ => true,
        }
    }
}

/// Augmented `io::Write` that is aware of the amount of remaining free capacity
/// in the destination.
pub trait SizedWrite: io::Write {
    /// Remaining free capacity in the destination.
    fn free_capacity(&self) -> usize;
}

/// Augmented `io::Read` that is aware of the amount of remaining data in the source.
pub trait SizedRead: io::Read {
    /// Remaining data in the source.
    fn remaining_data(&self) -> usize;
}

impl SizedWrite for io::Cursor<&mut [u8]> {
    #[inline]
    fn free_capacity(&self) -> usize {
        self.get_ref().len().saturating_sub(self.position() as usize)
    }
}

/// Growable destination for whole-datagram encoding.
impl SizedWrite for Vec<u8> {
    #[inline]
    fn free_capacity(&self) -> usize {
        usize::max_value() - self.len()
    }
}

impl SizedRead for io::Cursor<&[u8]> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len().saturating_sub(self.position() as usize)
    }
}
