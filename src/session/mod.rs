//! The peer session core (spec.md §4.4): owns the transport, the ordered
//! extension registry, and the single background task that drives the
//! open -> init-gate -> handshake -> running lifecycle and demultiplexes
//! frames.
//!
//! Shaped after the teacher's `AlnpSession`: a `Clone`-able handle around an
//! `Arc`-shared interior, with the actual handshake driven by a dedicated
//! async routine (`connect`/`accept` there, a single `init`/background task
//! here since this protocol's handshake is symmetric).

pub mod state;

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::warn;

use crate::codec::Schema;
use crate::error::ProtocolError;
use crate::extension::init::{InitExtension, INIT_EXTENSION_NAME};
use crate::extension::{BoxFuture, Extension, ExtensionObject};
use crate::transport::{Transport, TransportEvent};
use state::SessionState;

/// Free-form peer/session metadata visible to extension handlers, keyed by
/// name (spec.md's dynamically-typed `context` object).
pub type Context = HashMap<String, Value>;

type HandshakeHandler = Arc<dyn Fn(Session) -> BoxFuture<'static, Result<(), ProtocolError>> + Send + Sync>;

/// Maps a raw discovery key to the topic's public key. Defaults to identity;
/// a `None` return means the key is unrecognized.
pub type DiscoveryToPublicKey = Arc<dyn Fn([u8; 32]) -> Option<[u8; 32]> + Send + Sync>;

#[derive(Clone)]
pub struct SessionOptions {
    /// Bounds the init-gate wait (spec.md §4.4's `initTimeout`) and, since
    /// this implementation has no separate cancellation primitive, doubles
    /// as the overall bound [`Session::init`] waits for the handshake to
    /// complete before giving up with [`ProtocolError::RequestTimeout`].
    pub init_timeout_ms: u64,
    /// Resolves a discovery key seen on the wire to the topic's public key
    /// (spec.md §4.4's feed/topic bootstrap). Identity by default.
    pub discovery_to_public_key: DiscoveryToPublicKey,
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("init_timeout_ms", &self.init_timeout_ms)
            .field("discovery_to_public_key", &"<fn>")
            .finish()
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            init_timeout_ms: 5000,
            discovery_to_public_key: Arc::new(Some),
        }
    }
}

/// Lifecycle notifications any observer can subscribe to (spec.md §9).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ExtensionsInitialized,
    Handshake,
    Closed,
    /// Carries the original, code-bearing error rather than a flattened
    /// string so observers (including `Session::init`'s own caller) see the
    /// same `ProtocolError` variant the failure actually originated as.
    Error(ProtocolError),
}

struct Registry {
    open: bool,
    order: Vec<String>,
    by_name: HashMap<String, Arc<dyn ExtensionObject>>,
    /// Mirrors `by_name` but keeps each extension's concrete `Extension<S>`
    /// handle (type-erased via `Any`) so `Session::get_extension` can hand
    /// back the typed value a caller registered, not just the object-safe
    /// facade `by_name` uses for dispatch.
    typed: HashMap<String, Box<dyn Any + Send + Sync>>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    options: SessionOptions,
    registry: Mutex<Registry>,
    state: Mutex<SessionState>,
    context: Mutex<Context>,
    local_data: Mutex<Value>,
    handshake_handlers: Mutex<Vec<HandshakeHandler>>,
    init: InitExtension,
    events: broadcast::Sender<SessionEvent>,
    task: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
    /// Serializes writes onto the transport so interleaved `Extension::send`
    /// calls from different tasks never race each other's frames.
    writer: AsyncMutex<()>,
    torn_down: AtomicBool,
    /// The topic this side resolved to, either supplied to `init` or
    /// learned from the peer's first `Feed` event.
    resolved_topic: Mutex<Option<[u8; 32]>>,
    /// Whether the bootstrap `Feed` event has been consumed yet.
    feed_bootstrapped: AtomicBool,
}

/// A handle to a running (or not-yet-opened) peer session. Cheap to clone.
#[derive(Clone)]
pub struct Session(Arc<Inner>);

impl Session {
    pub fn new(transport: Arc<dyn Transport>, options: SessionOptions) -> Self {
        let (events, _rx) = broadcast::channel(64);
        let init = InitExtension::new();
        let mut order = Vec::new();
        let mut by_name: HashMap<String, Arc<dyn ExtensionObject>> = HashMap::new();
        let mut typed: HashMap<String, Box<dyn Any + Send + Sync>> = HashMap::new();
        order.push(INIT_EXTENSION_NAME.to_string());
        by_name.insert(
            INIT_EXTENSION_NAME.to_string(),
            Arc::new(init.extension()) as Arc<dyn ExtensionObject>,
        );
        typed.insert(
            INIT_EXTENSION_NAME.to_string(),
            Box::new(init.extension()) as Box<dyn Any + Send + Sync>,
        );

        Session(Arc::new(Inner {
            transport,
            options,
            registry: Mutex::new(Registry {
                open: false,
                order,
                by_name,
                typed,
            }),
            state: Mutex::new(SessionState::Open),
            context: Mutex::new(HashMap::new()),
            local_data: Mutex::new(Value::Null),
            handshake_handlers: Mutex::new(Vec::new()),
            init,
            events,
            task: AsyncMutex::new(None),
            writer: AsyncMutex::new(()),
            torn_down: AtomicBool::new(false),
            resolved_topic: Mutex::new(None),
            feed_bootstrapped: AtomicBool::new(false),
        }))
    }

    pub fn local_id(&self) -> [u8; 32] {
        self.0.transport.local_id()
    }

    pub fn remote_id(&self) -> Option<[u8; 32]> {
        self.0.transport.remote_id()
    }

    pub fn state(&self) -> SessionState {
        self.0.state.lock().clone()
    }

    pub fn context(&self) -> Context {
        self.0.context.lock().clone()
    }

    /// Replaces the whole context map in one call (spec.md §6.4's
    /// `setContext(map)`).
    pub fn set_context(&self, map: Context) {
        *self.0.context.lock() = map;
    }

    /// Convenience for setting a single context entry without clobbering
    /// the rest of the map.
    pub fn set_context_entry(&self, key: impl Into<String>, value: Value) {
        self.0.context.lock().insert(key.into(), value);
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.0.events.subscribe()
    }

    /// Sets this side's session data, visible to the peer via
    /// [`Session::remote_session_data`] after the handshake completes. Must
    /// be called before [`Session::init`].
    pub fn set_session_data(&self, data: Value) -> Result<(), ProtocolError> {
        if self.0.registry.lock().open {
            return Err(ProtocolError::AlreadyOpen);
        }
        let bytes = serde_json::to_vec(&data)
            .map_err(|e| ProtocolError::InvalidArgument(e.to_string()))?;
        self.0.transport.set_local_user_data(bytes);
        *self.0.local_data.lock() = data;
        Ok(())
    }

    pub fn session_data(&self) -> Value {
        self.0.local_data.lock().clone()
    }

    /// The peer's session data, available once the handshake has completed.
    /// Decode failures and "not yet handshaken" both fall back to `{}`.
    pub fn remote_session_data(&self) -> Value {
        self.0
            .context
            .lock()
            .get("remoteSessionData")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    /// Registers a user handshake callback; callbacks run sequentially,
    /// after the init gate passes and before any extension's `onHandshake`.
    pub fn set_handshake_handler<F, Fut>(&self, f: F) -> Self
    where
        F: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), ProtocolError>> + Send + 'static,
    {
        self.0
            .handshake_handlers
            .lock()
            .push(Arc::new(move |session| Box::pin(f(session))));
        self.clone()
    }

    /// Registers an extension. Must be called before [`Session::init`]; the
    /// registered name must be unique and must not be the reserved init
    /// extension name.
    pub fn add_extension<S: Schema>(&self, extension: Extension<S>) -> Result<(), ProtocolError> {
        let mut registry = self.0.registry.lock();
        if registry.open {
            return Err(ProtocolError::AlreadyOpen);
        }
        let name = extension.name().to_string();
        if name == INIT_EXTENSION_NAME {
            return Err(ProtocolError::InvalidArgument(format!(
                "'{name}' is a reserved extension name"
            )));
        }
        if registry.by_name.contains_key(&name) {
            return Err(ProtocolError::InvalidArgument(format!(
                "extension '{name}' already registered"
            )));
        }
        registry.order.push(name.clone());
        registry
            .typed
            .insert(name.clone(), Box::new(extension.clone()) as Box<dyn Any + Send + Sync>);
        registry
            .by_name
            .insert(name, Arc::new(extension) as Arc<dyn ExtensionObject>);
        Ok(())
    }

    /// Looks up a previously registered extension by name (spec.md §6.4's
    /// `getExtension(name)`), downcast back to its concrete payload type.
    /// Returns `None` if `name` isn't registered, or was registered with a
    /// different `S` than the caller asks for here.
    pub fn get_extension<S: Schema>(&self, name: &str) -> Option<Extension<S>> {
        self.0
            .registry
            .lock()
            .typed
            .get(name)
            .and_then(|boxed| boxed.downcast_ref::<Extension<S>>())
            .cloned()
    }

    /// Marks the session started, with an optional initial topic fed to the
    /// peer immediately once registered. Idempotent: a session that is
    /// already open (or already finished opening) is left alone and this
    /// call simply waits on — or replays — the same outcome, so callers
    /// don't need to track whether they were first to initialize a shared
    /// session handle.
    pub async fn init(&self, topic: Option<[u8; 32]>) -> Result<(), ProtocolError> {
        match self.state() {
            SessionState::Running { .. } => return Ok(()),
            SessionState::Closed => return Err(ProtocolError::Closed),
            SessionState::Failed(msg) => return Err(ProtocolError::System(msg)),
            _ => {}
        }

        let already_open = {
            let mut registry = self.0.registry.lock();
            let was_open = registry.open;
            if !was_open {
                registry.open = true;
            }
            was_open
        };

        if already_open {
            let mut events = self.0.events.subscribe();
            Self::await_open_outcome(&mut events).await?;
        } else {
            self.open_inner(topic).await?;
        }

        Ok(())
    }

    async fn open_inner(&self, topic: Option<[u8; 32]>) -> Result<(), ProtocolError> {
        // Step 1: open every extension (including the built-in init gate),
        // in insertion order.
        let extensions = self.ordered_extensions();
        for extension in &extensions {
            extension
                .open(self.clone())
                .await
                .map_err(|e| ProtocolError::InitFailed(e.to_string()))?;
        }

        // Step 2: advertise every name, including the init extension's,
        // sorted lexicographically so both peers agree without coordination.
        // This only affects what's handed to the transport — `onInit`,
        // `onHandshake`, and friends still run in registration order.
        let mut advertised: Vec<String> = self.0.registry.lock().order.clone();
        advertised.sort();
        self.0.transport.set_extensions(advertised);

        // Feed/topic bootstrap: a caller-supplied topic is resolved and fed
        // to the peer immediately; an unresolvable topic is invalid up
        // front rather than waiting for a round trip to discover it.
        if let Some(topic) = topic {
            let resolved = (self.0.options.discovery_to_public_key)(topic);
            let Some(resolved) = resolved else {
                return Err(ProtocolError::ConnectionInvalid("key not found".into()));
            };
            *self.0.resolved_topic.lock() = Some(resolved);
            self.0.transport.feed(resolved).await?;
        }

        // Step 3: start the transport handshake and drive the lifecycle
        // from the background task; `init` itself only awaits the outcome.
        let mut events = self.0.events.subscribe();
        let session = self.clone();
        let handle = tokio::spawn(async move { session.run().await });
        *self.0.task.lock().await = Some(handle);

        let timeout = Duration::from_millis(self.0.options.init_timeout_ms);
        match tokio::time::timeout(timeout, Self::await_open_outcome(&mut events)).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::RequestTimeout),
        }
    }

    async fn await_open_outcome(
        events: &mut broadcast::Receiver<SessionEvent>,
    ) -> Result<(), ProtocolError> {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Handshake) => return Ok(()),
                Ok(SessionEvent::Error(err)) => return Err(err),
                Ok(SessionEvent::Closed) => {
                    return Err(ProtocolError::ConnectionInvalid(
                        "session closed before handshake completed".into(),
                    ))
                }
                Ok(SessionEvent::ExtensionsInitialized) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ProtocolError::System("session event bus closed".into()))
                }
            }
        }
    }

    /// Writes a frame for `extension`; used by [`Extension::send`].
    pub async fn write_frame(&self, extension: &str, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        let _guard = self.0.writer.lock().await;
        self.0.transport.send_frame(extension, bytes).await
    }

    /// Announces a topic/feed key to the peer.
    pub async fn feed(&self, key: [u8; 32]) -> Result<(), ProtocolError> {
        self.0.transport.feed(key).await
    }

    /// Closes the session: tears down the transport and runs every
    /// extension's `onClose` hook. Idempotent.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        self.0.transport.close().await;
        self.teardown(None).await;
        if let Some(handle) = self.0.task.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }

    fn ordered_extensions(&self) -> Vec<Arc<dyn ExtensionObject>> {
        let registry = self.0.registry.lock();
        registry
            .order
            .iter()
            .filter_map(|name| registry.by_name.get(name).cloned())
            .collect()
    }

    fn transition(&self, next: SessionState) -> Result<(), ProtocolError> {
        let mut state = self.0.state.lock();
        let current = state.clone();
        match current.transition(next) {
            Ok(updated) => {
                *state = updated;
                Ok(())
            }
            Err(e) => Err(ProtocolError::System(e.to_string())),
        }
    }

    async fn run(self) {
        self.transition(SessionState::Initializing {
            since: Instant::now(),
        })
        .ok();
        if let Err(e) = self.0.transport.start_handshake().await {
            self.fail(e).await;
            return;
        }
        loop {
            match self.0.transport.recv_event().await {
                TransportEvent::Handshake => {
                    if let Err(e) = self.on_transport_handshake().await {
                        self.fail(e).await;
                        return;
                    }
                }
                TransportEvent::Frame { extension, payload } => {
                    self.dispatch_frame(&extension, &payload).await;
                }
                TransportEvent::Feed(key) => {
                    self.dispatch_feed(key).await;
                }
                TransportEvent::Closed => {
                    self.teardown(None).await;
                    return;
                }
            }
        }
    }

    /// Steps 4-8 of spec.md §4.4's lifecycle algorithm, run once the
    /// transport's own handshake event arrives.
    async fn on_transport_handshake(&self) -> Result<(), ProtocolError> {
        if let Some(bytes) = self.0.transport.remote_user_data() {
            if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
                self.0
                    .context
                    .lock()
                    .insert("remoteSessionData".into(), value);
            }
        }

        let extensions = self.ordered_extensions();
        let user_extensions: Vec<_> = extensions
            .iter()
            .filter(|e| e.name() != INIT_EXTENSION_NAME)
            .cloned()
            .collect();

        for extension in &user_extensions {
            if let Err(e) = extension.on_init().await {
                self.0.init.break_gate().await;
                return Err(ProtocolError::InitFailed(e.to_string()));
            }
        }

        self.transition(SessionState::InitGate {
            since: Instant::now(),
        })?;
        let timeout = Duration::from_millis(self.0.options.init_timeout_ms);
        if !self.0.init.continue_gate(timeout).await? {
            return Err(ProtocolError::ConnectionInvalid(
                "init gate vetoed by peer".into(),
            ));
        }
        let _ = self.0.events.send(SessionEvent::ExtensionsInitialized);

        self.transition(SessionState::Handshaking {
            since: Instant::now(),
        })?;
        let handshake_handlers = self.0.handshake_handlers.lock().clone();
        for handler in &handshake_handlers {
            if let Err(e) = handler(self.clone()).await {
                return Err(ProtocolError::HandshakeFailed(e.to_string()));
            }
        }
        for extension in &user_extensions {
            extension.on_handshake().await?;
        }

        self.transition(SessionState::Running {
            since: Instant::now(),
        })?;
        let _ = self.0.events.send(SessionEvent::Handshake);
        Ok(())
    }

    async fn dispatch_frame(&self, name: &str, payload: &[u8]) {
        let extension = {
            let registry = self.0.registry.lock();
            registry.by_name.get(name).cloned()
        };
        match extension {
            Some(extension) => extension.on_message(payload).await,
            None => {
                warn!(extension = %name, "frame for unregistered extension, destroying stream");
                self.fail(ProtocolError::ExtensionMissing(name.to_string()))
                    .await;
            }
        }
    }

    /// Validates the first `Feed` event against this side's own resolved
    /// topic (or, if none was supplied to `init`, adopts it as one); later
    /// `Feed` events are plain discovery-key announcements dispatched to
    /// every extension's `onFeed`.
    async fn dispatch_feed(&self, key: [u8; 32]) {
        if !self.0.feed_bootstrapped.swap(true, Ordering::SeqCst) {
            let resolved = (self.0.options.discovery_to_public_key)(key);
            let outcome = {
                let mut resolved_topic = self.0.resolved_topic.lock();
                match (resolved, *resolved_topic) {
                    (None, _) => Err(ProtocolError::ConnectionInvalid("key not found".into())),
                    (Some(resolved), Some(expected)) if resolved != expected => Err(
                        ProtocolError::ConnectionInvalid("key not found".into()),
                    ),
                    (Some(resolved), None) => {
                        *resolved_topic = Some(resolved);
                        Ok(Some(resolved))
                    }
                    (Some(_), Some(_)) => Ok(None),
                }
            };
            match outcome {
                Err(e) => self.fail(e).await,
                Ok(Some(resolved)) => {
                    let _ = self.0.transport.feed(resolved).await;
                }
                Ok(None) => {}
            }
            return;
        }

        for extension in self.ordered_extensions() {
            extension.on_feed(&key).await;
        }
    }

    async fn fail(&self, err: ProtocolError) {
        {
            let mut state = self.0.state.lock();
            *state = SessionState::Failed(err.to_string());
        }
        let _ = self.0.events.send(SessionEvent::Error(err.clone()));
        self.teardown(Some(err)).await;
        self.0.transport.close().await;
    }

    async fn teardown(&self, err: Option<ProtocolError>) {
        if self.0.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.0.state.lock();
            if !state.is_terminal() {
                *state = SessionState::Closed;
            }
        }
        for extension in self.ordered_extensions() {
            extension.on_close(err.clone()).await;
        }
        let _ = self.0.events.send(SessionEvent::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PipeTransport;

    #[tokio::test]
    async fn init_with_no_extensions_completes_handshake() {
        let (a, b) = PipeTransport::pair();
        let session_a = Session::new(a, SessionOptions::default());
        let session_b = Session::new(b, SessionOptions::default());

        let (ra, rb) = tokio::join!(session_a.init(None), session_b.init(None));
        assert!(ra.is_ok());
        assert!(rb.is_ok());
        assert!(session_a.state().is_running());
        assert!(session_b.state().is_running());
    }

    #[tokio::test]
    async fn calling_init_twice_is_idempotent() {
        let (a, b) = PipeTransport::pair();
        let session_a = Session::new(a, SessionOptions::default());
        let session_b = Session::new(b, SessionOptions::default());

        let (ra, rb) = tokio::join!(session_a.init(None), session_b.init(None));
        assert!(ra.is_ok());
        assert!(rb.is_ok());

        assert!(session_a.init(None).await.is_ok());
    }

    #[tokio::test]
    async fn registering_an_extension_after_open_is_rejected() {
        let (a, _b) = PipeTransport::pair();
        let session = Session::new(a, SessionOptions::default());
        session.0.registry.lock().open = true;
        let ext: Extension<Vec<u8>> = Extension::new("test.echo");
        let result = session.add_extension(ext);
        assert!(matches!(result, Err(ProtocolError::AlreadyOpen)));
    }

    #[tokio::test]
    async fn reserved_init_name_is_rejected() {
        let (a, _b) = PipeTransport::pair();
        let session = Session::new(a, SessionOptions::default());
        let ext: Extension<Vec<u8>> = Extension::new(INIT_EXTENSION_NAME);
        let result = session.add_extension(ext);
        assert!(matches!(result, Err(ProtocolError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn get_extension_returns_the_registered_handle() {
        let (a, _b) = PipeTransport::pair();
        let session = Session::new(a, SessionOptions::default());
        let ext: Extension<Vec<u8>> = Extension::new("test.echo");
        session.add_extension(ext.clone()).unwrap();

        let found = session.get_extension::<Vec<u8>>("test.echo");
        assert!(found.is_some());
        assert_eq!(found.unwrap().name(), ext.name());

        assert!(session.get_extension::<Vec<u8>>("test.missing").is_none());
    }

    #[tokio::test]
    async fn set_context_replaces_the_whole_map() {
        let (a, _b) = PipeTransport::pair();
        let session = Session::new(a, SessionOptions::default());
        session.set_context_entry("a", Value::Bool(true));

        let mut map = Context::new();
        map.insert("b".into(), Value::Bool(true));
        session.set_context(map.clone());

        assert_eq!(session.context(), map);
    }

    #[tokio::test]
    async fn advertised_extension_names_are_sorted_lexicographically() {
        let (a, b) = PipeTransport::pair();
        let session_a = Session::new(a.clone(), SessionOptions::default());
        let session_b = Session::new(b, SessionOptions::default());

        session_a
            .add_extension(Extension::<Vec<u8>>::new("zzz.last"))
            .unwrap();
        session_a
            .add_extension(Extension::<Vec<u8>>::new("aaa.first"))
            .unwrap();

        let (ra, rb) = tokio::join!(session_a.init(None), session_b.init(None));
        ra.unwrap();
        rb.unwrap();

        let advertised = a.advertised_extensions();
        let mut expected = advertised.clone();
        expected.sort();
        assert_eq!(advertised, expected);
        assert_eq!(
            advertised,
            vec![
                "aaa.first".to_string(),
                INIT_EXTENSION_NAME.to_string(),
                "zzz.last".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn mismatched_topics_fail_before_handshake() {
        let (a, b) = PipeTransport::pair();
        let session_a = Session::new(a, SessionOptions::default());
        let session_b = Session::new(b, SessionOptions::default());

        let topic_a = [1u8; 32];
        let topic_b = [2u8; 32];
        let (ra, rb) = tokio::join!(session_a.init(Some(topic_a)), session_b.init(Some(topic_b)));

        assert!(ra.is_err());
        assert!(rb.is_err());
        assert!(matches!(session_a.state(), SessionState::Failed(_)));
        assert!(matches!(session_b.state(), SessionState::Failed(_)));
    }
}
