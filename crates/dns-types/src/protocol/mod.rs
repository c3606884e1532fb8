//! Wire-format DNS messages: the types, and total functions between
//! them and octets.

pub mod deserialise;
pub mod serialise;
pub mod types;
