//! The four-packet handshake: ClientHello, ServerHello, Connect and
//! Accept/Reject. This module owns the key-exchange choreography; the
//! endpoints own the surrounding state machines.

use crate::envelope::Envelope;
use crate::keys::{self, Ephemeral, Identity, PublicKey, Signature, SignPublicKey};
use crate::shared::{NetError, NetResult};
use crate::wire::{Packet, PROTOCOL_VERSION};
use std::time::Duration;

/// Client-side deadline for the whole exchange; the server applies the same
/// bound to pending handshakes.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// ClientHello retransmission period while no ServerHello has arrived.
pub const HELLO_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Builds the opening packet around a fresh client ephemeral.
#[inline]
pub fn client_hello(ephemeral: &Ephemeral) -> Packet {
    Packet::ClientHello {
        version: PROTOCOL_VERSION,
        public_key: *ephemeral.public(),
    }
}

/// Server side of the exchange: generates an ephemeral, signs it with the
/// long-term identity and derives the session envelope against the client's
/// ephemeral key. Returns the ServerHello to send in the clear.
pub fn server_hello(identity: &Identity, client_public: &PublicKey) -> NetResult<(Packet, Envelope)> {
    let ephemeral = Ephemeral::generate();
    let signature = identity.sign_ephemeral(ephemeral.public());
    let envelope = ephemeral.derive(client_public)?.into_envelope();

    let packet = Packet::ServerHello {
        version: PROTOCOL_VERSION,
        public_key: *ephemeral.public(),
        signature,
    };

    Ok((packet, envelope))
}

/// Client side of the exchange: authenticates the ServerHello against the
/// pre-shared server public key and derives the session envelope. Key
/// derivation is never attempted for an unverified peer.
pub fn process_server_hello(
    ephemeral: &Ephemeral,
    version: u8,
    server_ephemeral: &PublicKey,
    signature: &Signature,
    server_identity: &SignPublicKey,
) -> NetResult<Envelope> {
    if version != PROTOCOL_VERSION {
        return Err(NetError::Protocol(format!(
            "Unsupported protocol version {}",
            version
        )));
    }

    if !keys::verify_ephemeral(signature, server_ephemeral, server_identity) {
        return Err(NetError::Protocol("Server signature invalid".to_string()));
    }

    Ok(ephemeral.derive(server_ephemeral)?.into_envelope())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unpack_hello(packet: Packet) -> (u8, PublicKey, Signature) {
        match packet {
            Packet::ServerHello {
                version,
                public_key,
                signature,
            } => (version, public_key, signature),
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_full_exchange_agrees() {
        let identity = Identity::generate();
        let client_ephemeral = Ephemeral::generate();

        let (hello, mut server_envelope) =
            server_hello(&identity, client_ephemeral.public()).unwrap();
        let (version, server_ephemeral, signature) = unpack_hello(hello);

        let mut client_envelope = process_server_hello(
            &client_ephemeral,
            version,
            &server_ephemeral,
            &signature,
            identity.public(),
        )
        .unwrap();

        let datagram = client_envelope.seal(b"connect").unwrap();
        assert_eq!(server_envelope.open(&datagram).unwrap(), b"connect");
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let identity = Identity::generate();
        let client_ephemeral = Ephemeral::generate();

        let (hello, _) = server_hello(&identity, client_ephemeral.public()).unwrap();
        let (_, server_ephemeral, signature) = unpack_hello(hello);

        let result = process_server_hello(
            &client_ephemeral,
            PROTOCOL_VERSION + 1,
            &server_ephemeral,
            &signature,
            identity.public(),
        );

        assert!(result.is_err());
    }

    #[test]
    fn test_tampered_signature_rejected_with_expected_reason() {
        let identity = Identity::generate();
        let client_ephemeral = Ephemeral::generate();

        let (hello, _) = server_hello(&identity, client_ephemeral.public()).unwrap();
        let (version, server_ephemeral, mut signature) = unpack_hello(hello);

        signature[10] ^= 0x04;

        let result = process_server_hello(
            &client_ephemeral,
            version,
            &server_ephemeral,
            &signature,
            identity.public(),
        );

        assert_eq!(
            result.unwrap_err(),
            NetError::Protocol("Server signature invalid".to_string())
        );
    }

    #[test]
    fn test_wrong_preshared_key_rejected() {
        let identity = Identity::generate();
        let impostor = Identity::generate();
        let client_ephemeral = Ephemeral::generate();

        let (hello, _) = server_hello(&identity, client_ephemeral.public()).unwrap();
        let (version, server_ephemeral, signature) = unpack_hello(hello);

        let result = process_server_hello(
            &client_ephemeral,
            version,
            &server_ephemeral,
            &signature,
            impostor.public(),
        );

        assert!(result.is_err());
    }

    #[test]
    fn test_client_hello_carries_ephemeral() {
        let ephemeral = Ephemeral::generate();

        assert_eq!(
            client_hello(&ephemeral),
            Packet::ClientHello {
                version: PROTOCOL_VERSION,
                public_key: *ephemeral.public(),
            }
        );
    }
}
