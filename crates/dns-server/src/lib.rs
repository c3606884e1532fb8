#![warn(clippy::pedantic)]
// Don't care enough to fix
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::similar_names)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::wildcard_imports)]

//! The serving core of the `zoned` authoritative name server.
//!
//! The pieces fit together like this: transports (`pipeline` for UDP,
//! `tcp`, `quic`) receive wire messages and drive the query `layer`;
//! the server-side layer implementation in `process` resolves
//! questions against the zone snapshot published through `catalog`;
//! `requestor` drives the same layer abstraction in the client
//! direction for outbound NOTIFY.

pub mod catalog;
pub mod layer;
pub mod metrics;
pub mod pipeline;
pub mod process;
pub mod quic;
pub mod requestor;
pub mod tcp;

use std::fmt;
use std::io;

/// What the serving core reports to the enclosing process.  The core
/// never exits the process itself.
#[derive(Debug)]
pub enum ServerError {
    /// A configuration value or handed-in socket that cannot be used.
    InvalidArgument(String),
    /// A resource limit was exhausted.
    ResourceExhausted(String),
    /// A socket operation failed in a way that is not recoverable
    /// within the serving loop.
    Network(io::Error),
    /// A protocol-level invariant was violated by a peer or by
    /// configuration material (e.g. unusable TLS keys).
    Protocol(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServerError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            ServerError::ResourceExhausted(msg) => write!(f, "resource exhausted: {msg}"),
            ServerError::Network(error) => write!(f, "network error: {error}"),
            ServerError::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Network(error) => Some(error),
            _ => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(error: io::Error) -> Self {
        ServerError::Network(error)
    }
}
