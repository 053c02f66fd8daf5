use crate::dispatcher::DispatchError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Sequence number correlating a [`Request`] with its [`Response`].
///
/// Scoped to one call engine; each side of a connection numbers its own calls.
pub type Seq = u64;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub(crate) struct Request {
    pub seq: Seq,
    /// Qualified `Service.Method` name.
    pub method: String,
    /// bincode-encoded argument value.
    pub args: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub(crate) struct Response {
    pub seq: Seq,
    /// bincode-encoded reply, or the reason the call failed.
    pub result: Result<Vec<u8>, DispatchError>,
}

/// Encodes an argument or reply payload.
pub(crate) fn encode<T>(value: &T) -> Result<Vec<u8>, bincode::Error>
where
    T: Serialize + ?Sized,
{
    bincode::serialize(value)
}

/// Decodes an argument or reply payload.
pub(crate) fn decode<T>(payload: &[u8]) -> Result<T, bincode::Error>
where
    T: DeserializeOwned,
{
    bincode::deserialize(payload)
}
