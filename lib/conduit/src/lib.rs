//! `conduit` is a connection-oriented, encrypted, selectively-reliable
//! datagram protocol over UDP. Applications exchange typed records with
//! per-message delivery contracts across sessions that survive address
//! changes and transient disconnects.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

#[macro_use]
pub mod protocol;

pub mod shared;
pub mod wire;
pub mod envelope;
pub mod keys;
pub mod rtt;
pub mod outbound;
pub mod inbound;
pub mod reliability;
pub mod session;
pub mod handshake;
pub mod manager;
pub mod transport;
pub mod config;
pub mod server;
pub mod client;

pub mod prelude {
    pub use crate::client::{Client, ClientState};
    pub use crate::config::{ClientConfig, ServerConfig};
    pub use crate::protocol::record::{Bytes, Codec, Record};
    pub use crate::protocol::registry::Protocol;
    pub use crate::server::{DisconnectCause, Server};
    pub use crate::session::{Delivery, Session, SessionState};
    pub use crate::shared::{NetError, NetResult, SizedRead, SizedWrite, Token};
    pub use crate::transport::{Transport, UdpTransport};
    pub use crate::wire::{DisconnectReason, RejectReason};
}
