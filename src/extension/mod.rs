//! Per-channel request/response runtime multiplexed over a [`crate::session::Session`].
//!
//! Mirrors the teacher's per-layer handler pattern (`HandshakeTransport`,
//! `FrameTransport`): a small object-safe trait (`ExtensionObject`) the
//! [`crate::session::Session`] drives without knowing the concrete payload
//! schema, plus a generic, user-facing `Extension<S>` that owns the typed
//! send/handler API.

pub mod init;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngCore;
use tokio::sync::oneshot;
use tracing::warn;

use crate::codec::{Codec, Envelope, Options, Schema, WireError};
use crate::error::ProtocolError;
use crate::session::Session;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Per-instance send/receive/error counters (spec.md §4.2 "Stats").
#[derive(Debug, Default)]
pub struct Stats {
    pub send: AtomicU64,
    pub receive: AtomicU64,
    pub error: AtomicU64,
}

impl Stats {
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.send.load(Ordering::Relaxed),
            self.receive.load(Ordering::Relaxed),
            self.error.load(Ordering::Relaxed),
        )
    }
}

/// The `New -> Open -> Initialized -> Handshaken -> Running -> Closed`
/// lifecycle of spec.md §4.2, driven exclusively by the owning Session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionState {
    New,
    Open,
    Initialized,
    Handshaken,
    Running,
    Closed,
}

enum CallState<S> {
    Pending(oneshot::Sender<Result<Option<S>, ProtocolError>>),
    /// Left behind once a response has already matched this id, so a
    /// spurious duplicate is recognized and dropped instead of being handed
    /// to the user handler as a new unsolicited message. Logged: a second
    /// response for the same id is unexpected peer behavior.
    Done,
    /// Left behind once the local wait timed out with no response ever
    /// seen. A response that arrives afterward is expected peer behavior
    /// (it just lost the race), so it's dropped silently and doesn't bump
    /// the error counter (spec.md §4.2 tie-breaks).
    Expired,
}

type InitHandler = Arc<dyn Fn() -> BoxFuture<'static, Result<(), ProtocolError>> + Send + Sync>;
type HandshakeHandler =
    Arc<dyn Fn() -> BoxFuture<'static, Result<(), ProtocolError>> + Send + Sync>;
type FeedHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;
type CloseHandler = Arc<dyn Fn(Option<ProtocolError>) -> BoxFuture<'static, ()> + Send + Sync>;

type MessageHandler<S> =
    Arc<dyn Fn(Session, S, Options) -> BoxFuture<'static, Result<Option<S>, ProtocolError>> + Send + Sync>;

struct Handlers<S> {
    on_init: Option<InitHandler>,
    on_handshake: Option<HandshakeHandler>,
    on_message: Option<MessageHandler<S>>,
    on_feed: Option<FeedHandler>,
    on_close: Option<CloseHandler>,
}

impl<S> Default for Handlers<S> {
    fn default() -> Self {
        Handlers {
            on_init: None,
            on_handshake: None,
            on_message: None,
            on_feed: None,
            on_close: None,
        }
    }
}

struct Inner<S> {
    name: String,
    codec: Codec<S>,
    timeout_ms: u64,
    handlers: Mutex<Handlers<S>>,
    pending: Mutex<HashMap<[u8; 32], CallState<S>>>,
    state: Mutex<ExtensionState>,
    session: Mutex<Option<Session>>,
    stats: Stats,
}

/// A named, typed request/response/one-way channel multiplexed over a
/// [`Session`]. Cheap to clone (an `Arc` handle), matching the teacher's
/// `AlnpSession`/`AlnpStream` convention of `#[derive(Clone)]` wrappers
/// around `Arc`-shared interior state.
pub struct Extension<S: Schema = Vec<u8>> {
    inner: Arc<Inner<S>>,
}

impl<S: Schema> Clone for Extension<S> {
    fn clone(&self) -> Self {
        Extension {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Schema> Extension<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_timeout(name, DEFAULT_TIMEOUT_MS)
    }

    pub fn with_timeout(name: impl Into<String>, timeout_ms: u64) -> Self {
        Extension {
            inner: Arc::new(Inner {
                name: name.into(),
                codec: Codec::new(),
                timeout_ms,
                handlers: Mutex::new(Handlers::default()),
                pending: Mutex::new(HashMap::new()),
                state: Mutex::new(ExtensionState::New),
                session: Mutex::new(None),
                stats: Stats::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        self.inner.stats.snapshot()
    }

    pub fn state(&self) -> ExtensionState {
        *self.inner.state.lock()
    }

    pub fn set_on_init<F, Fut>(&self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProtocolError>> + Send + 'static,
    {
        self.inner.handlers.lock().on_init = Some(Arc::new(move || Box::pin(f())));
        self.clone()
    }

    pub fn set_on_handshake<F, Fut>(&self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProtocolError>> + Send + 'static,
    {
        self.inner.handlers.lock().on_handshake = Some(Arc::new(move || Box::pin(f())));
        self.clone()
    }

    pub fn set_on_message<F, Fut>(&self, f: F) -> Self
    where
        F: Fn(Session, S, Options) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<S>, ProtocolError>> + Send + 'static,
    {
        self.inner.handlers.lock().on_message =
            Some(Arc::new(move |session, data, options| Box::pin(f(session, data, options))));
        self.clone()
    }

    pub fn set_on_feed<F, Fut>(&self, f: F) -> Self
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.handlers.lock().on_feed = Some(Arc::new(move |key| Box::pin(f(key))));
        self.clone()
    }

    pub fn set_on_close<F, Fut>(&self, f: F) -> Self
    where
        F: Fn(Option<ProtocolError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.handlers.lock().on_close = Some(Arc::new(move |err| Box::pin(f(err))));
        self.clone()
    }

    /// Sends a request (or, with `oneway: true`, a fire-and-forget message)
    /// on this extension.
    pub async fn send(&self, message: S, options: Options) -> Result<Option<S>, ProtocolError> {
        if self.state() == ExtensionState::Closed {
            return Err(ProtocolError::Closed);
        }
        let session = self
            .inner
            .session
            .lock()
            .clone()
            .ok_or_else(|| ProtocolError::InvalidArgument("extension not open".into()))?;

        let mut id = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut id);

        let envelope = Envelope {
            id,
            data: Some(message),
            options,
            error: None,
        };
        let bytes = self
            .inner
            .codec
            .encode(&envelope)
            .map_err(|e| ProtocolError::System(e.to_string()))?;

        if options.oneway {
            session.write_frame(&self.inner.name, bytes).await?;
            self.inner.stats.send.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, CallState::Pending(tx));

        session.write_frame(&self.inner.name, bytes).await?;
        self.inner.stats.send.fetch_add(1, Ordering::Relaxed);

        let timeout = Duration::from_millis(self.inner.timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                // Sender dropped without a result: extension was closed
                // mid-flight (onClose rejects all pending calls directly,
                // so this path should be rare).
                Err(ProtocolError::Closed)
            }
            Err(_) => {
                if let Some(CallState::Pending(_)) = self
                    .inner
                    .pending
                    .lock()
                    .insert(id, CallState::Expired)
                {
                    self.inner.stats.error.fetch_add(1, Ordering::Relaxed);
                }
                Err(ProtocolError::RequestTimeout)
            }
        }
    }

    /// Convenience for a non-oneway request/response round trip.
    pub async fn request(&self, message: S) -> Result<Option<S>, ProtocolError> {
        self.send(message, Options { oneway: false }).await
    }

    /// Convenience for a fire-and-forget send.
    pub async fn notify(&self, message: S) -> Result<(), ProtocolError> {
        self.send(message, Options { oneway: true }).await.map(|_| ())
    }
}

#[async_trait]
impl<S: Schema> ExtensionObject for Extension<S> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn open(&self, session: Session) -> Result<(), ProtocolError> {
        let mut state = self.inner.state.lock();
        if *state != ExtensionState::New {
            return Err(ProtocolError::AlreadyOpen);
        }
        *self.inner.session.lock() = Some(session);
        *state = ExtensionState::Open;
        Ok(())
    }

    async fn on_init(&self) -> Result<(), ProtocolError> {
        let handler = self.inner.handlers.lock().on_init.clone();
        if let Some(handler) = handler {
            handler().await?;
        }
        *self.inner.state.lock() = ExtensionState::Initialized;
        Ok(())
    }

    async fn on_handshake(&self) -> Result<(), ProtocolError> {
        let handler = self.inner.handlers.lock().on_handshake.clone();
        if let Some(handler) = handler {
            handler().await?;
        }
        *self.inner.state.lock() = ExtensionState::Running;
        Ok(())
    }

    async fn on_message(&self, raw: &[u8]) {
        self.inner.stats.receive.fetch_add(1, Ordering::Relaxed);
        let envelope = self.inner.codec.decode(raw);

        // A pending-call match always takes priority over handler dispatch.
        let matched = {
            let mut pending = self.inner.pending.lock();
            match pending.get_mut(&envelope.id) {
                Some(slot @ CallState::Pending(_)) => {
                    let CallState::Pending(tx) =
                        std::mem::replace(slot, CallState::Done)
                    else {
                        unreachable!()
                    };
                    Some(tx)
                }
                Some(CallState::Done) => {
                    warn!(
                        extension = %self.inner.name,
                        id = %hex(&envelope.id),
                        "dropping duplicate response for an id already matched"
                    );
                    return;
                }
                Some(CallState::Expired) => {
                    // The wait already timed out locally; this response just
                    // lost the race. Drop silently, no counters touched.
                    return;
                }
                None => None,
            }
        };

        if let Some(tx) = matched {
            let result = if let Some(err) = envelope.error {
                Err(ProtocolError::from_wire(&err.code, err.message))
            } else {
                Ok(envelope.data)
            };
            let _ = tx.send(result);
            return;
        }

        let Some(data) = envelope.data else {
            warn!(extension = %self.inner.name, "dropping unparseable frame");
            return;
        };

        let handler = self.inner.handlers.lock().on_message.clone();
        let Some(handler) = handler else {
            self.inner.stats.error.fetch_add(1, Ordering::Relaxed);
            warn!(extension = %self.inner.name, "no handler installed for incoming request");
            if !envelope.options.oneway {
                self.reply_error(envelope.id, ProtocolError::NoHandler).await;
            }
            return;
        };

        let session = match self.inner.session.lock().clone() {
            Some(s) => s,
            None => return,
        };

        let oneway = envelope.options.oneway;
        match handler(session, data, envelope.options).await {
            Ok(response) => {
                if !oneway {
                    self.reply_ok(envelope.id, response).await;
                }
            }
            Err(err) => {
                self.inner.stats.error.fetch_add(1, Ordering::Relaxed);
                if !oneway {
                    self.reply_error(envelope.id, err).await;
                }
            }
        }
    }

    async fn on_feed(&self, discovery_key: &[u8]) {
        let handler = self.inner.handlers.lock().on_feed.clone();
        if let Some(handler) = handler {
            handler(discovery_key.to_vec()).await;
        }
    }

    async fn on_close(&self, err: Option<ProtocolError>) {
        *self.inner.state.lock() = ExtensionState::Closed;
        let handler = self.inner.handlers.lock().on_close.clone();
        if let Some(handler) = handler {
            handler(err.clone()).await;
        }
        let mut pending = self.inner.pending.lock();
        for (_, slot) in pending.drain() {
            if let CallState::Pending(tx) = slot {
                let _ = tx.send(Err(err.clone().unwrap_or(ProtocolError::Closed)));
            }
        }
        *self.inner.session.lock() = None;
    }
}

impl<S: Schema> Extension<S> {
    async fn reply_ok(&self, id: [u8; 32], data: Option<S>) {
        self.reply(id, data, None).await;
    }

    async fn reply_error(&self, id: [u8; 32], err: ProtocolError) {
        let (code, message) = err.to_wire();
        self.reply(id, None, Some(WireError { code, message })).await;
    }

    async fn reply(&self, id: [u8; 32], data: Option<S>, error: Option<WireError>) {
        let Some(session) = self.inner.session.lock().clone() else {
            return;
        };
        let envelope = Envelope {
            id,
            data,
            options: Options { oneway: false },
            error,
        };
        match self.inner.codec.encode(&envelope) {
            Ok(bytes) => {
                if session.write_frame(&self.inner.name, bytes).await.is_ok() {
                    self.inner.stats.send.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => warn!(extension = %self.inner.name, error = %e, "failed to encode response"),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Object-safe facade the [`Session`] drives without knowing an extension's
/// concrete payload schema.
#[async_trait]
pub trait ExtensionObject: Send + Sync {
    fn name(&self) -> &str;
    async fn open(&self, session: Session) -> Result<(), ProtocolError>;
    async fn on_init(&self) -> Result<(), ProtocolError>;
    async fn on_handshake(&self) -> Result<(), ProtocolError>;
    async fn on_message(&self, raw: &[u8]);
    async fn on_feed(&self, discovery_key: &[u8]);
    async fn on_close(&self, err: Option<ProtocolError>);
}
