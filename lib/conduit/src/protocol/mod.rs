//! Application message surface: the record codec contract, the family
//! definition macros and the registry computing type ids and the protocol
//! hash.

#[macro_use]
pub mod macros;
pub mod record;
pub mod registry;
