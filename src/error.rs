use crate::dispatcher::{DispatchError, RegisterError};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The multiplexed session could not open the outbound stream.
    #[error("opening session stream: {0}")]
    Session(String),

    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),

    /// The outbound stream failed; every call waiting on it fails with this.
    #[error("connection lost: {0}")]
    Disconnected(String),

    #[error("endpoint is closed")]
    Closed,

    /// The peer answered with an error instead of a reply.
    #[error("remote: {0}")]
    Remote(#[from] DispatchError),

    #[error(transparent)]
    Register(#[from] RegisterError),
}
