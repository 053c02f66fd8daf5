//! Per-stream halves of the protocol.
//!
//! [`server`] answers requests arriving on a stream the peer opened, [`client`]
//! issues requests on the stream this side opened. [`message`] turns a
//! message-oriented connection into the byte stream both run on.

pub(crate) mod client;
pub mod message;
pub(crate) mod server;
