//! Handshake key material: ephemeral X25519 exchange, HKDF-SHA256 session
//! key derivation and the server's long-term Ed25519 identity.

use crate::envelope::Envelope;
use crate::shared::{NetError, NetResult};
use keel::crypto;

pub const HKDF_SALT: &[u8] = b"clientserver-v1";
const INFO_ENCRYPTION: &[u8] = b"encryption";
const INFO_NONCE: &[u8] = b"nonce";

pub type PublicKey = [u8; crypto::EXCHANGE_SIZE];
pub type Signature = [u8; crypto::SIGNATURE_SIZE];
pub type SignPublicKey = [u8; crypto::SIGN_PUBLIC_SIZE];
pub type SignSecretKey = [u8; crypto::SIGN_SECRET_SIZE];

/// One side's ephemeral X25519 keypair, generated per handshake and
/// discarded once the session keys are derived.
pub struct Ephemeral {
    public: PublicKey,
    secret: [u8; crypto::EXCHANGE_SCALAR_SIZE],
}

impl Ephemeral {
    #[inline]
    pub fn generate() -> Ephemeral {
        let (public, secret) = crypto::exchange_keypair();
        Ephemeral { public, secret }
    }

    #[inline]
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Completes the exchange against the peer's ephemeral public key and
    /// expands the shared secret into session keys. Fails on degenerate
    /// peer keys.
    pub fn derive(&self, peer_public: &PublicKey) -> NetResult<SessionKeys> {
        let mut shared = [0u8; crypto::EXCHANGE_SIZE];

        if !crypto::exchange(&mut shared, &self.secret, peer_public) {
            return Err(NetError::Protocol("Key exchange failed".to_string()));
        }

        let mut key = [0u8; crypto::KEY_SIZE];
        let mut nonce_base = [0u8; crypto::NONCE_SIZE];

        crypto::hkdf_sha256(HKDF_SALT, &shared, INFO_ENCRYPTION, &mut key);
        crypto::hkdf_sha256(HKDF_SALT, &shared, INFO_NONCE, &mut nonce_base);

        Ok(SessionKeys { key, nonce_base })
    }
}

/// Symmetric material derived from the handshake. Both directions share the
/// key and nonce base; the envelope separates them by counter.
pub struct SessionKeys {
    pub key: [u8; crypto::KEY_SIZE],
    pub nonce_base: [u8; crypto::NONCE_SIZE],
}

impl SessionKeys {
    #[inline]
    pub fn into_envelope(self) -> Envelope {
        Envelope::new(self.key, self.nonce_base)
    }
}

/// The server's long-term Ed25519 signing identity. The public half is
/// distributed to clients out of band.
pub struct Identity {
    public: SignPublicKey,
    secret: SignSecretKey,
}

impl Identity {
    #[inline]
    pub fn generate() -> Identity {
        let (public, secret) = crypto::sign_keypair();
        Identity { public, secret }
    }

    #[inline]
    pub fn from_secret(public: SignPublicKey, secret: SignSecretKey) -> Identity {
        Identity { public, secret }
    }

    #[inline]
    pub fn public(&self) -> &SignPublicKey {
        &self.public
    }

    /// Signs an ephemeral public key for the `ServerHello`.
    #[inline]
    pub fn sign_ephemeral(&self, ephemeral: &PublicKey) -> Signature {
        crypto::sign(ephemeral, &self.secret)
    }
}

/// Generates a fresh (public, secret) Ed25519 pair for provisioning a
/// server identity.
#[inline]
pub fn generate_signing_keypair() -> (SignPublicKey, SignSecretKey) {
    crypto::sign_keypair()
}

/// Client-side verification of the server's signature over its ephemeral key.
#[inline]
pub fn verify_ephemeral(
    signature: &Signature,
    ephemeral: &PublicKey,
    server_public: &SignPublicKey,
) -> bool {
    crypto::verify(signature, ephemeral, server_public)
}
