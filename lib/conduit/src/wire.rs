//! Datagram packet codec. Every packet starts with a single type tag byte,
//! integers are big-endian, strings carry a 2-byte length prefix.

use crate::shared::{NetError, NetResult, Token};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

pub const PROTOCOL_VERSION: u8 = 1;

const TAG_CLIENT_HELLO: u8 = 0x01;
const TAG_SERVER_HELLO: u8 = 0x02;
const TAG_CONNECT: u8 = 0x10;
const TAG_ACCEPT: u8 = 0x11;
const TAG_REJECT: u8 = 0x12;
const TAG_DATA: u8 = 0x20;
const TAG_ACK: u8 = 0x21;
const TAG_HEARTBEAT: u8 = 0x30;
const TAG_HEARTBEAT_ACK: u8 = 0x31;
const TAG_DISCONNECT: u8 = 0x40;

const DATA_FLAG_RELIABLE: u8 = 0b0000_0001;
const DATA_FLAG_HAS_ACK: u8 = 0b0000_0010;
const DATA_FLAG_MASK: u8 = DATA_FLAG_RELIABLE | DATA_FLAG_HAS_ACK;

const MAX_MESSAGE_LEN: usize = u16::max_value() as usize;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RejectReason {
    ProtocolMismatch = 0x01,
    ServerFull = 0x02,
    SessionExpired = 0x03,
    InvalidToken = 0x04,
    AuthFailed = 0x05,
}

impl RejectReason {
    #[inline]
    fn from_code(code: u8) -> NetResult<RejectReason> {
        match code {
            0x01 => Ok(RejectReason::ProtocolMismatch),
            0x02 => Ok(RejectReason::ServerFull),
            0x03 => Ok(RejectReason::SessionExpired),
            0x04 => Ok(RejectReason::InvalidToken),
            0x05 => Ok(RejectReason::AuthFailed),
            _ => Err(NetError::MalformedPacket),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DisconnectReason {
    Normal = 0x00,
    Kicked = 0x01,
    ProtocolError = 0x02,
    Shutdown = 0x03,
}

impl DisconnectReason {
    #[inline]
    fn from_code(code: u8) -> NetResult<DisconnectReason> {
        match code {
            0x00 => Ok(DisconnectReason::Normal),
            0x01 => Ok(DisconnectReason::Kicked),
            0x02 => Ok(DisconnectReason::ProtocolError),
            0x03 => Ok(DisconnectReason::Shutdown),
            _ => Err(NetError::MalformedPacket),
        }
    }
}

/// Session resumption request carried by a reconnecting `Connect`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Resume {
    pub token: Token,
    pub last_received_seq: u32,
}

/// The closed set of packet variants exchanged on the wire. `ClientHello`
/// and `ServerHello` travel in the clear, everything else inside the AEAD
/// envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    ClientHello {
        version: u8,
        public_key: [u8; 32],
    },
    ServerHello {
        version: u8,
        public_key: [u8; 32],
        signature: [u8; 64],
    },
    Connect {
        protocol_hash: [u8; 32],
        resume: Option<Resume>,
    },
    Accept {
        token: Token,
        heartbeat_ms: u32,
        timeout_ms: u32,
        last_received_seq: u32,
    },
    Reject {
        reason: RejectReason,
        message: String,
    },
    Data {
        /// Present exactly when the message is reliable.
        sequence: Option<u32>,
        /// Piggybacked cumulative acknowledgement.
        ack: Option<u32>,
        type_id: u16,
        payload: Vec<u8>,
    },
    Ack {
        sequence: u32,
        bitmap: u32,
    },
    Heartbeat {
        timestamp: u64,
    },
    HeartbeatAck {
        echo: u64,
        timestamp: u64,
    },
    Disconnect {
        reason: DisconnectReason,
        message: String,
    },
}

impl Packet {
    /// Encodes the packet into a fresh datagram buffer.
    pub fn encode(&self) -> NetResult<Vec<u8>> {
        let mut buffer = Vec::with_capacity(64);

        match self {
            Packet::ClientHello { version, public_key } => {
                buffer.write_u8(TAG_CLIENT_HELLO)?;
                buffer.write_u8(*version)?;
                buffer.write_all(public_key)?;
            }
            Packet::ServerHello {
                version,
                public_key,
                signature,
            } => {
                buffer.write_u8(TAG_SERVER_HELLO)?;
                buffer.write_u8(*version)?;
                buffer.write_all(public_key)?;
                buffer.write_all(&signature[..])?;
            }
            Packet::Connect { protocol_hash, resume } => {
                buffer.write_u8(TAG_CONNECT)?;
                buffer.write_all(protocol_hash)?;
                match resume {
                    Some(resume) => {
                        buffer.write_u8(resume.token.len() as u8)?;
                        buffer.write_all(&resume.token)?;
                        buffer.write_u32::<BigEndian>(resume.last_received_seq)?;
                    }
                    None => buffer.write_u8(0)?,
                }
            }
            Packet::Accept {
                token,
                heartbeat_ms,
                timeout_ms,
                last_received_seq,
            } => {
                buffer.write_u8(TAG_ACCEPT)?;
                buffer.write_all(token)?;
                buffer.write_u32::<BigEndian>(*heartbeat_ms)?;
                buffer.write_u32::<BigEndian>(*timeout_ms)?;
                buffer.write_u32::<BigEndian>(*last_received_seq)?;
            }
            Packet::Reject { reason, message } => {
                buffer.write_u8(TAG_REJECT)?;
                buffer.write_u8(*reason as u8)?;
                write_string(&mut buffer, message)?;
            }
            Packet::Data {
                sequence,
                ack,
                type_id,
                payload,
            } => {
                buffer.write_u8(TAG_DATA)?;

                let mut flags = 0u8;
                if sequence.is_some() {
                    flags |= DATA_FLAG_RELIABLE;
                }
                if ack.is_some() {
                    flags |= DATA_FLAG_HAS_ACK;
                }
                buffer.write_u8(flags)?;

                if let Some(sequence) = sequence {
                    buffer.write_u32::<BigEndian>(*sequence)?;
                }
                if let Some(ack) = ack {
                    buffer.write_u32::<BigEndian>(*ack)?;
                }
                buffer.write_u16::<BigEndian>(*type_id)?;
                buffer.write_all(payload)?;
            }
            Packet::Ack { sequence, bitmap } => {
                buffer.write_u8(TAG_ACK)?;
                buffer.write_u32::<BigEndian>(*sequence)?;
                buffer.write_u32::<BigEndian>(*bitmap)?;
            }
            Packet::Heartbeat { timestamp } => {
                buffer.write_u8(TAG_HEARTBEAT)?;
                buffer.write_u64::<BigEndian>(*timestamp)?;
            }
            Packet::HeartbeatAck { echo, timestamp } => {
                buffer.write_u8(TAG_HEARTBEAT_ACK)?;
                buffer.write_u64::<BigEndian>(*echo)?;
                buffer.write_u64::<BigEndian>(*timestamp)?;
            }
            Packet::Disconnect { reason, message } => {
                buffer.write_u8(TAG_DISCONNECT)?;
                buffer.write_u8(*reason as u8)?;
                write_string(&mut buffer, message)?;
            }
        }

        Ok(buffer)
    }

    /// Decodes a datagram. Fails with `MalformedPacket` on an unknown tag,
    /// insufficient data or an unknown enum code.
    pub fn decode(datagram: &[u8]) -> NetResult<Packet> {
        let mut stream = Cursor::new(datagram);
        let tag = read_u8(&mut stream)?;

        let packet = match tag {
            TAG_CLIENT_HELLO => Packet::ClientHello {
                version: read_u8(&mut stream)?,
                public_key: read_array_32(&mut stream)?,
            },
            TAG_SERVER_HELLO => Packet::ServerHello {
                version: read_u8(&mut stream)?,
                public_key: read_array_32(&mut stream)?,
                signature: read_array_64(&mut stream)?,
            },
            TAG_CONNECT => {
                let protocol_hash = read_array_32(&mut stream)?;
                let resume = match read_u8(&mut stream)? {
                    0 => None,
                    16 => Some(Resume {
                        token: read_array_16(&mut stream)?,
                        last_received_seq: read_u32(&mut stream)?,
                    }),
                    _ => return Err(NetError::MalformedPacket),
                };

                Packet::Connect { protocol_hash, resume }
            }
            TAG_ACCEPT => Packet::Accept {
                token: read_array_16(&mut stream)?,
                heartbeat_ms: read_u32(&mut stream)?,
                timeout_ms: read_u32(&mut stream)?,
                last_received_seq: read_u32(&mut stream)?,
            },
            TAG_REJECT => Packet::Reject {
                reason: RejectReason::from_code(read_u8(&mut stream)?)?,
                message: read_string(&mut stream)?,
            },
            TAG_DATA => {
                let flags = read_u8(&mut stream)?;

                if flags & !DATA_FLAG_MASK != 0 {
                    return Err(NetError::MalformedPacket);
                }

                let sequence = match flags & DATA_FLAG_RELIABLE != 0 {
                    true => Some(read_u32(&mut stream)?),
                    false => None,
                };
                let ack = match flags & DATA_FLAG_HAS_ACK != 0 {
                    true => Some(read_u32(&mut stream)?),
                    false => None,
                };
                let type_id = read_u16(&mut stream)?;

                let mut payload = Vec::with_capacity(remaining(&stream));
                stream.read_to_end(&mut payload).map_err(|_| NetError::MalformedPacket)?;

                Packet::Data {
                    sequence,
                    ack,
                    type_id,
                    payload,
                }
            }
            TAG_ACK => Packet::Ack {
                sequence: read_u32(&mut stream)?,
                bitmap: read_u32(&mut stream)?,
            },
            TAG_HEARTBEAT => Packet::Heartbeat {
                timestamp: read_u64(&mut stream)?,
            },
            TAG_HEARTBEAT_ACK => Packet::HeartbeatAck {
                echo: read_u64(&mut stream)?,
                timestamp: read_u64(&mut stream)?,
            },
            TAG_DISCONNECT => Packet::Disconnect {
                reason: DisconnectReason::from_code(read_u8(&mut stream)?)?,
                message: read_string(&mut stream)?,
            },
            _ => return Err(NetError::MalformedPacket),
        };

        // Trailing bytes mean the datagram was not what the tag claimed.
        if remaining(&stream) != 0 {
            return Err(NetError::MalformedPacket);
        }

        Ok(packet)
    }
}

#[inline]
fn remaining(stream: &Cursor<&[u8]>) -> usize {
    stream.get_ref().len().saturating_sub(stream.position() as usize)
}

#[inline]
fn read_u8(stream: &mut Cursor<&[u8]>) -> NetResult<u8> {
    stream.read_u8().map_err(|_| NetError::MalformedPacket)
}

#[inline]
fn read_u16(stream: &mut Cursor<&[u8]>) -> NetResult<u16> {
    stream.read_u16::<BigEndian>().map_err(|_| NetError::MalformedPacket)
}

#[inline]
fn read_u32(stream: &mut Cursor<&[u8]>) -> NetResult<u32> {
    stream.read_u32::<BigEndian>().map_err(|_| NetError::MalformedPacket)
}

#[inline]
fn read_u64(stream: &mut Cursor<&[u8]>) -> NetResult<u64> {
    stream.read_u64::<BigEndian>().map_err(|_| NetError::MalformedPacket)
}

#[inline]
fn read_array_16(stream: &mut Cursor<&[u8]>) -> NetResult<[u8; 16]> {
    let mut array = [0u8; 16];
    stream.read_exact(&mut array).map_err(|_| NetError::MalformedPacket)?;
    Ok(array)
}

#[inline]
fn read_array_32(stream: &mut Cursor<&[u8]>) -> NetResult<[u8; 32]> {
    let mut array = [0u8; 32];
    stream.read_exact(&mut array).map_err(|_| NetError::MalformedPacket)?;
    Ok(array)
}

#[inline]
fn read_array_64(stream: &mut Cursor<&[u8]>) -> NetResult<[u8; 64]> {
    let mut array = [0u8; 64];
    stream.read_exact(&mut array).map_err(|_| NetError::MalformedPacket)?;
    Ok(array)
}

#[inline]
fn write_string(buffer: &mut Vec<u8>, message: &str) -> NetResult<()> {
    if message.len() > MAX_MESSAGE_LEN {
        return Err(NetError::Serialization);
    }

    buffer.write_u16::<BigEndian>(message.len() as u16)?;
    buffer.write_all(message.as_bytes())?;
    Ok(())
}

#[inline]
fn read_string(stream: &mut Cursor<&[u8]>) -> NetResult<String> {
    let length = read_u16(stream)? as usize;

    if remaining(stream) < length {
        return Err(NetError::MalformedPacket);
    }

    let mut bytes = vec![0u8; length];
    stream.read_exact(&mut bytes).map_err(|_| NetError::MalformedPacket)?;

    String::from_utf8(bytes).map_err(|_| NetError::MalformedPacket)
}
