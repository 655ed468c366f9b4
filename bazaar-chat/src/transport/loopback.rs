//! In-process transport linking two chat engines.
//!
//! Uses in-process [`tokio::sync::mpsc`] channels to simulate the link
//! between two nodes. Created via [`LoopbackTransport::create_pair`],
//! which returns two connected endpoints: sending on one delivers a
//! [`DirectMessage`] to the other.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};

use bazaar_chat_proto::codec;
use bazaar_chat_proto::message::{ChatPayload, DirectMessage, MessageType};

use super::{PeerId, Transport, TransportError};

/// One end of an in-process link between two peers.
///
/// Payloads are postcard-encoded on send and decoded on [`recv`](Self::recv),
/// so the receiving side sees exactly what a network transport would hand
/// over.
pub struct LoopbackTransport {
    /// Peer this endpoint speaks for.
    local_id: PeerId,
    /// The only peer reachable from here.
    remote_id: PeerId,
    /// Sender for outgoing frames (delivers to the remote's receiver).
    tx: mpsc::Sender<Vec<u8>>,
    /// Receiver for incoming frames (fed by the remote's sender).
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    /// When set, every send fails with [`TransportError::Unreachable`].
    offline: AtomicBool,
}

impl LoopbackTransport {
    /// Two connected endpoints: the first speaks for `id_a`, the second for
    /// `id_b`. Each direction queues up to `buffer` frames.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use bazaar_chat::transport::loopback::LoopbackTransport;
    /// use bazaar_chat::transport::PeerId;
    ///
    /// let (buyer, vendor) = LoopbackTransport::create_pair(
    ///     PeerId::new("QmBuyer"),
    ///     PeerId::new("QmVendor"),
    ///     32,
    /// );
    /// ```
    #[must_use]
    pub fn create_pair(id_a: PeerId, id_b: PeerId, buffer: usize) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(buffer);
        let (tx_b, rx_b) = mpsc::channel(buffer);

        let a = Self {
            local_id: id_a.clone(),
            remote_id: id_b.clone(),
            tx: tx_b,
            rx: Mutex::new(rx_a),
            offline: AtomicBool::new(false),
        };

        let b = Self {
            local_id: id_b,
            remote_id: id_a,
            tx: tx_a,
            rx: Mutex::new(rx_b),
            offline: AtomicBool::new(false),
        };

        (a, b)
    }

    /// Simulate the remote node going offline (or coming back).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Identity of the local endpoint.
    #[must_use]
    pub const fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Receive the next direct message sent by the remote endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the remote endpoint
    /// is dropped, or [`TransportError::Codec`] for an undecodable frame.
    pub async fn recv(&self) -> Result<DirectMessage, TransportError> {
        let frame = {
            let mut rx = self.rx.lock().await;
            rx.recv().await.ok_or(TransportError::ConnectionClosed)?
        };
        Ok(codec::decode_direct(&frame)?)
    }
}

impl Transport for LoopbackTransport {
    async fn send(
        &self,
        message_type: MessageType,
        peer: &PeerId,
        payload: &ChatPayload,
    ) -> Result<(), TransportError> {
        if *peer != self.remote_id || self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(peer.clone()));
        }

        let direct = DirectMessage {
            message_type,
            peer_id: self.local_id.as_str().to_string(),
            payload: codec::encode_payload(payload)?,
        };
        let frame = codec::encode_direct(&direct)?;

        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}
