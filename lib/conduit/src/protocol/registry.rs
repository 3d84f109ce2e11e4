//! Message-type registry: assigns stable 16-bit identifiers to the two
//! record families and computes the protocol hash both sides compare during
//! the handshake.

use crate::protocol::record::Record;
use crate::shared::{NetError, NetResult};
use hashbrown::HashMap;
use keel::crypto::{self, Sha256};
use std::any::Any;

/// High bit of a type id encodes the direction: set for server records.
pub const DIRECTION_BIT: u16 = 0x8000;

const FAMILY_CAPACITY: usize = 0x8000;

/// One concrete record within a family. Produced by `message_records!`.
#[derive(Copy, Clone)]
pub struct RecordEntry {
    pub fq_name: &'static str,
    pub fields: fn() -> Vec<(&'static str, String)>,
    pub decode: fn(&[u8]) -> NetResult<Box<dyn Any>>,
}

/// An immutable registry built from the client-to-server and
/// server-to-client families. Identifiers are assigned in fully-qualified
/// name order, clients from 0x0000 and servers from 0x8000.
#[derive(Clone)]
pub struct Protocol {
    ids: HashMap<&'static str, u16>,
    entries: HashMap<u16, RecordEntry>,
    hash: [u8; crypto::HASH_SIZE],
}

impl Protocol {
    pub fn build(client: &[RecordEntry], server: &[RecordEntry]) -> NetResult<Protocol> {
        if client.len() > FAMILY_CAPACITY || server.len() > FAMILY_CAPACITY {
            return Err(NetError::Protocol("Message family too large".to_string()));
        }

        let client_sorted = sort_family(client)?;
        let server_sorted = sort_family(server)?;

        let mut ids = HashMap::new();
        let mut entries = HashMap::new();

        for (index, entry) in client_sorted.iter().enumerate() {
            let id = index as u16;
            ids.insert(entry.fq_name, id);
            entries.insert(id, *entry);
        }

        for (index, entry) in server_sorted.iter().enumerate() {
            let id = DIRECTION_BIT | index as u16;
            if ids.insert(entry.fq_name, id).is_some() {
                return Err(NetError::Protocol(format!(
                    "Record {} appears in both families",
                    entry.fq_name
                )));
            }
            entries.insert(id, *entry);
        }

        let hash = hash_families(&client_sorted, &server_sorted);

        Ok(Protocol { ids, entries, hash })
    }

    /// SHA-256 over every record's name and field layout. Equal on both
    /// sides exactly when the protocols match structurally.
    #[inline]
    pub fn hash(&self) -> &[u8; crypto::HASH_SIZE] {
        &self.hash
    }

    /// The identifier assigned to a record type, if it is registered.
    #[inline]
    pub fn type_id<T: Record>(&self) -> NetResult<u16> {
        self.ids
            .get(T::FQ_NAME)
            .copied()
            .ok_or_else(|| NetError::Protocol(format!("Unregistered record {}", T::FQ_NAME)))
    }

    /// Encodes a record into (type id, payload bytes).
    pub fn encode<T: Record>(&self, record: &T) -> NetResult<(u16, Vec<u8>)> {
        let type_id = self.type_id::<T>()?;

        let mut payload = Vec::new();
        record.encode(&mut payload)?;

        Ok((type_id, payload))
    }

    /// Decodes a payload into the registered record type, type-erased for
    /// dispatch through the handler map.
    pub fn decode(&self, type_id: u16, payload: &[u8]) -> NetResult<Box<dyn Any>> {
        let entry = self
            .entries
            .get(&type_id)
            .ok_or_else(|| NetError::Protocol(format!("Unknown message type {:#06x}", type_id)))?;

        (entry.decode)(payload)
    }

    #[inline]
    pub fn is_server_record(type_id: u16) -> bool {
        type_id & DIRECTION_BIT != 0
    }
}

fn sort_family(family: &[RecordEntry]) -> NetResult<Vec<RecordEntry>> {
    let mut sorted = family.to_vec();
    sorted.sort_by(|a, b| a.fq_name.cmp(b.fq_name));

    for window in sorted.windows(2) {
        if window[0].fq_name == window[1].fq_name {
            return Err(NetError::Protocol(format!(
                "Duplicate record {}",
                window[0].fq_name
            )));
        }
    }

    Ok(sorted)
}

fn hash_families(client: &[RecordEntry], server: &[RecordEntry]) -> [u8; crypto::HASH_SIZE] {
    let mut hasher = Sha256::new();

    for entry in client.iter().chain(server.iter()) {
        hasher.update(entry.fq_name.as_bytes());

        for (field_name, descriptor) in (entry.fields)() {
            hasher.update(field_name.as_bytes());
            hasher.update(descriptor.as_bytes());
        }
    }

    hasher.finalize()
}
