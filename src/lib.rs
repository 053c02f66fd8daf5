//! Bidirectional RPC over one multiplexed byte-stream connection.
//!
//! An [`Endpoint`] wraps a single transport (a TCP socket, a WebSocket adapted
//! with [`MessageIo`], an in-memory pipe...) in a yamux session. Each side
//! opens one stream for its own outgoing calls and serves every stream the
//! peer opens, so both peers can register [`Service`]s and call each other at
//! the same time.

pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
mod macros;
pub mod net;
pub mod types;

pub use config::Config;
pub use dispatcher::{DispatchError, RegisterError, RpcFunctionInfo, Service, Signature};
pub use endpoint::{Builder, Endpoint, Role};
pub use error::{Error, Result};
pub use futures::future::BoxFuture;
pub use net::message::{Frame, MessageIo};

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

/// A function the peer can call by name.
///
/// Plain async closures can be registered with [`Service::method`]; implement
/// this trait for handlers that carry their own state.
pub trait RpcFunction: Send + Sync + 'static {
    type Args: DeserializeOwned + Send + 'static;
    type Reply: Serialize + Send + 'static;
    type Error: fmt::Display + Send + 'static;

    /// Method name, without the service prefix.
    fn name(&self) -> &str;

    fn call(&self, args: Self::Args) -> BoxFuture<'_, Result<Self::Reply, Self::Error>>;
}
