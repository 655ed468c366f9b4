//! Transport abstraction for delivering chat payloads to peers.
//!
//! The chat engine only needs to hand a [`ChatPayload`] to a peer; how it
//! gets there (direct connection, relay, store-and-forward) is the
//! transport's business. [`loopback::LoopbackTransport`] is an in-process
//! implementation used by tests and the simulation binary.

pub mod loopback;

use std::fmt;

use bazaar_chat_proto::message::{ChatPayload, MessageType};

/// Identifier of a marketplace node.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap a peer id (a base58 multihash on the real network).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The link to the peer is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// No route to the peer right now.
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),

    /// The payload could not be encoded for the wire.
    #[error("payload encoding failed: {0}")]
    Codec(#[from] bazaar_chat_proto::codec::CodecError),
}

/// Async transport for chat payloads.
///
/// A successful return means the payload was handed to the peer's node (or
/// its store-and-forward proxy); it is not a read receipt.
pub trait Transport: Send + Sync {
    /// Send a payload of the given type to `peer`.
    fn send(
        &self,
        message_type: MessageType,
        peer: &PeerId,
        payload: &ChatPayload,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;
}

impl<T: Transport> Transport for std::sync::Arc<T> {
    async fn send(
        &self,
        message_type: MessageType,
        peer: &PeerId,
        payload: &ChatPayload,
    ) -> Result<(), TransportError> {
        (**self).send(message_type, peer, payload).await
    }
}
