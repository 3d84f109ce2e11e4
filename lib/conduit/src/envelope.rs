//! AEAD envelope wrapping all post-handshake datagrams. Both directions use
//! the same derived key and nonce base; they are kept apart by independent
//! monotonic counters folded into the nonce.

use crate::shared::{NetError, NetResult};
use byteorder::{ByteOrder, LittleEndian};
use keel::crypto;

/// Counters this far below the expected receive counter are rejected as replays.
const REPLAY_WINDOW: u64 = 1000;
/// Counters this far above the expected receive counter are rejected as outliers.
const OUTLIER_CAP: u64 = 10_000;

pub const ENVELOPE_OVERHEAD: usize = crypto::NONCE_SIZE + crypto::MAC_SIZE;

/// Per-session encryption context. Survives DISCONNECTED periods; a resumed
/// session installs a freshly derived context instead of rewinding this one.
#[derive(Debug)]
pub struct Envelope {
    key: [u8; crypto::KEY_SIZE],
    nonce_base: [u8; crypto::NONCE_SIZE],
    /// Next counter to use on the send side.
    send_counter: u64,
    /// Highest counter seen + 1 on the receive side.
    recv_expected: u64,
}

impl Envelope {
    #[inline]
    pub fn new(key: [u8; crypto::KEY_SIZE], nonce_base: [u8; crypto::NONCE_SIZE]) -> Envelope {
        Envelope {
            key,
            nonce_base,
            send_counter: 0,
            recv_expected: 0,
        }
    }

    /// Encrypts a plaintext packet into `[nonce || ciphertext+tag]` and
    /// advances the send counter.
    pub fn seal(&mut self, plain: &[u8]) -> NetResult<Vec<u8>> {
        let nonce = self.nonce_for(self.send_counter);

        let mut datagram = vec![0u8; crypto::NONCE_SIZE + plain.len() + crypto::MAC_SIZE];
        datagram[..crypto::NONCE_SIZE].copy_from_slice(&nonce);

        if !crypto::encrypt(&mut datagram[crypto::NONCE_SIZE..], plain, &nonce, &self.key) {
            return Err(NetError::DecryptionFailed);
        }

        self.send_counter += 1;

        Ok(datagram)
    }

    /// Authenticates and decrypts `[nonce || ciphertext+tag]`. The receive
    /// expectation only advances after the tag verifies, so a forged counter
    /// cannot perturb the window.
    pub fn open(&mut self, datagram: &[u8]) -> NetResult<Vec<u8>> {
        if datagram.len() < ENVELOPE_OVERHEAD {
            return Err(NetError::DecryptionFailed);
        }

        let mut nonce = [0u8; crypto::NONCE_SIZE];
        nonce.copy_from_slice(&datagram[..crypto::NONCE_SIZE]);

        let counter = self.extract_counter(&nonce);

        if counter < self.recv_expected && self.recv_expected - counter >= REPLAY_WINDOW {
            return Err(NetError::DecryptionFailed);
        }

        if counter > self.recv_expected && counter - self.recv_expected > OUTLIER_CAP {
            return Err(NetError::DecryptionFailed);
        }

        let cipher = &datagram[crypto::NONCE_SIZE..];
        let mut plain = vec![0u8; cipher.len() - crypto::MAC_SIZE];

        if !crypto::decrypt(&mut plain, cipher, &nonce, &self.key) {
            return Err(NetError::DecryptionFailed);
        }

        if counter + 1 > self.recv_expected {
            self.recv_expected = counter + 1;
        }

        Ok(plain)
    }

    /// The nonce base with the counter XORed into the low 8 bytes,
    /// little-endian. The high 4 bytes of the base pass through unchanged.
    #[inline]
    fn nonce_for(&self, counter: u64) -> [u8; crypto::NONCE_SIZE] {
        let mut nonce = self.nonce_base;

        let mut counter_bytes = [0u8; 8];
        LittleEndian::write_u64(&mut counter_bytes, counter);

        for (nonce_byte, counter_byte) in nonce.iter_mut().zip(counter_bytes.iter()) {
            *nonce_byte ^= counter_byte;
        }

        nonce
    }

    #[inline]
    fn extract_counter(&self, nonce: &[u8; crypto::NONCE_SIZE]) -> u64 {
        let mut counter_bytes = [0u8; 8];

        for (index, counter_byte) in counter_bytes.iter_mut().enumerate() {
            *counter_byte = nonce[index] ^ self.nonce_base[index];
        }

        LittleEndian::read_u64(&counter_bytes)
    }
}
