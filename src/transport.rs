//! The narrow duplex-transport interface the session core consumes (spec.md
//! §6.2). The real "hypercore-protocol"-style framed transport is an
//! external collaborator; this module only declares the contract plus an
//! in-memory `PipeTransport` pair used by tests, grounded in the teacher's
//! `PipeTransport`/`LoopbackTransport` (`tests/feature_suite.rs`,
//! `session/mod.rs`).

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::ProtocolError;

/// Events a [`Transport`] delivers to the owning [`crate::session::Session`].
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Fired once after both endpoints' keys/ids/user-data are established.
    Handshake,
    /// A framed payload for a named extension channel.
    Frame { extension: String, payload: Vec<u8> },
    /// The peer's feed/discovery key arrived.
    Feed([u8; 32]),
    /// The stream ended; no further events will be delivered.
    Closed,
}

/// The capability the session core needs from a duplex transport.
///
/// Discovery/dialing, authentication, and the actual framing wire format are
/// all the transport's concern; the core only drives this narrow interface.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_id(&self) -> [u8; 32];
    fn remote_id(&self) -> Option<[u8; 32]>;
    fn set_local_user_data(&self, data: Vec<u8>);
    fn remote_user_data(&self) -> Option<Vec<u8>>;
    /// Sets the full, already-sorted, advertised extension name list.
    fn set_extensions(&self, names: Vec<String>);

    /// Kicks off the transport-level handshake; the resulting
    /// [`TransportEvent::Handshake`] arrives through [`Transport::recv_event`].
    async fn start_handshake(&self) -> Result<(), ProtocolError>;

    /// Announces a topic/feed key to the peer.
    async fn feed(&self, key: [u8; 32]) -> Result<(), ProtocolError>;

    /// Writes a framed payload tagged with `extension`.
    async fn send_frame(&self, extension: &str, bytes: Vec<u8>) -> Result<(), ProtocolError>;

    /// Awaits the next transport event, in arrival order. Returns
    /// `TransportEvent::Closed` forever once the stream has ended.
    async fn recv_event(&self) -> TransportEvent;

    /// Tears down the underlying connection. Idempotent.
    async fn close(&self);
}

#[derive(Debug, Clone)]
enum Wire {
    Handshake { id: [u8; 32], user_data: Vec<u8> },
    Frame { extension: String, payload: Vec<u8> },
    Feed([u8; 32]),
    /// End-of-stream sentinel; propagates a one-sided `close()` to the peer
    /// so its `recv_event` observes `TransportEvent::Closed` instead of
    /// blocking on the channel forever.
    Closed,
}

struct PipeState {
    local_id: [u8; 32],
    remote_id: Option<[u8; 32]>,
    local_user_data: Vec<u8>,
    remote_user_data: Option<Vec<u8>>,
    closed: bool,
    /// The last name list handed to `set_extensions`, kept around purely so
    /// tests can assert on it; a real transport would advertise this over
    /// the wire instead of just recording it.
    advertised_extensions: Vec<String>,
}

/// An in-memory duplex [`Transport`] useful for unit tests: two instances
/// returned by [`PipeTransport::pair`] are wired directly to each other over
/// `tokio::sync::mpsc` channels, mirroring the teacher's loopback transports.
pub struct PipeTransport {
    tx: mpsc::Sender<Wire>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Wire>>,
    state: Mutex<PipeState>,
}

impl PipeTransport {
    pub fn pair() -> (Arc<PipeTransport>, Arc<PipeTransport>) {
        let (a_tx, a_rx) = mpsc::channel(64);
        let (b_tx, b_rx) = mpsc::channel(64);
        let a = Arc::new(PipeTransport {
            tx: b_tx,
            rx: tokio::sync::Mutex::new(a_rx),
            state: Mutex::new(PipeState {
                local_id: rand::random(),
                remote_id: None,
                local_user_data: Vec::new(),
                remote_user_data: None,
                closed: false,
                advertised_extensions: Vec::new(),
            }),
        });
        let b = Arc::new(PipeTransport {
            tx: a_tx,
            rx: tokio::sync::Mutex::new(b_rx),
            state: Mutex::new(PipeState {
                local_id: rand::random(),
                remote_id: None,
                local_user_data: Vec::new(),
                remote_user_data: None,
                closed: false,
                advertised_extensions: Vec::new(),
            }),
        });
        (a, b)
    }

    /// The last name list this transport was handed via `set_extensions`,
    /// for tests asserting on the sorted-advertised-name invariant.
    pub fn advertised_extensions(&self) -> Vec<String> {
        self.state.lock().advertised_extensions.clone()
    }
}

#[async_trait]
impl Transport for PipeTransport {
    fn local_id(&self) -> [u8; 32] {
        self.state.lock().local_id
    }

    fn remote_id(&self) -> Option<[u8; 32]> {
        self.state.lock().remote_id
    }

    fn set_local_user_data(&self, data: Vec<u8>) {
        self.state.lock().local_user_data = data;
    }

    fn remote_user_data(&self) -> Option<Vec<u8>> {
        self.state.lock().remote_user_data.clone()
    }

    fn set_extensions(&self, names: Vec<String>) {
        self.state.lock().advertised_extensions = names;
    }

    async fn start_handshake(&self) -> Result<(), ProtocolError> {
        let (id, user_data) = {
            let state = self.state.lock();
            (state.local_id, state.local_user_data.clone())
        };
        self.tx
            .send(Wire::Handshake { id, user_data })
            .await
            .map_err(|_| ProtocolError::ConnectionInvalid("peer transport closed".into()))
    }

    async fn feed(&self, key: [u8; 32]) -> Result<(), ProtocolError> {
        self.tx
            .send(Wire::Feed(key))
            .await
            .map_err(|_| ProtocolError::ConnectionInvalid("peer transport closed".into()))
    }

    async fn send_frame(&self, extension: &str, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        self.tx
            .send(Wire::Frame {
                extension: extension.to_string(),
                payload: bytes,
            })
            .await
            .map_err(|_| ProtocolError::ConnectionInvalid("peer transport closed".into()))
    }

    async fn recv_event(&self) -> TransportEvent {
        if self.state.lock().closed {
            return TransportEvent::Closed;
        }
        let next = self.rx.lock().await.recv().await;
        match next {
            Some(Wire::Handshake { id, user_data }) => {
                let mut state = self.state.lock();
                state.remote_id = Some(id);
                state.remote_user_data = Some(user_data);
                TransportEvent::Handshake
            }
            Some(Wire::Frame { extension, payload }) => {
                TransportEvent::Frame { extension, payload }
            }
            Some(Wire::Feed(key)) => TransportEvent::Feed(key),
            Some(Wire::Closed) | None => {
                self.state.lock().closed = true;
                TransportEvent::Closed
            }
        }
    }

    async fn close(&self) {
        self.state.lock().closed = true;
        // Best-effort: if the peer already dropped its receiver this is a
        // no-op, which is fine since its own `recv_event` already treats a
        // closed channel the same as an explicit `Wire::Closed`.
        let _ = self.tx.send(Wire::Closed).await;
    }
}
