#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::error::Error as StdError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::Instant;

use backoff::backoff::{Backoff as _, Constant};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use url::Url;

use super::config::Config;
use super::error::WsError;
#[cfg(feature = "tungstenite")]
use super::scheduler::TokioScheduler;
use super::traits::{
    ConnectionId, EventSink, ReadyState, Scheduler, Transport, TransportEvent, TransportHandle,
};
#[cfg(feature = "tungstenite")]
use super::transport::TungsteniteTransport;
use crate::Result;
use crate::error::Error;

/// Error type a message callback may return.
pub type CallbackError = Box<dyn StdError + Send + Sync + 'static>;

type OpenCallback = Arc<dyn Fn() + Send + Sync>;
type MessageCallback = Arc<dyn Fn(&str) -> std::result::Result<(), CallbackError> + Send + Sync>;
type CloseCallback = Arc<dyn Fn(u16, &str) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport handle and no pending retry
    Disconnected,
    /// A transport handle exists but has not reported open yet
    Connecting,
    /// Successfully connected
    Open {
        /// When the connection was established
        since: Instant,
    },
    /// Waiting for the retry timer to fire
    RetryPending {
        /// Retries scheduled since the last successful open
        attempt: u32,
    },
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

#[derive(Default)]
struct Callbacks {
    on_open: Option<OpenCallback>,
    on_message: Option<MessageCallback>,
    on_close: Option<CloseCallback>,
    on_error: Option<ErrorCallback>,
}

/// The current handle. `handle` is `None` while the transport is still inside `open`.
struct Live<H> {
    id: ConnectionId,
    handle: Option<H>,
}

struct PendingRetry<K> {
    seq: u64,
    token: K,
}

struct Slots<H, K> {
    live: Option<Live<H>>,
    /// Handles closed through `close()` whose close notification has not arrived yet
    closing: Vec<ConnectionId>,
    retry: Option<PendingRetry<K>>,
    backoff: Constant,
    attempt: u32,
    next_connection: u64,
    next_retry: u64,
}

impl<H, K> Slots<H, K> {
    fn is_current(&self, id: ConnectionId) -> bool {
        self.live.as_ref().is_some_and(|live| live.id == id)
    }

    /// State to report once no handle is live.
    fn idle_state(&self) -> ConnectionState {
        if self.retry.is_some() {
            ConnectionState::RetryPending {
                attempt: self.attempt,
            }
        } else {
            ConnectionState::Disconnected
        }
    }
}

struct Inner<T: Transport, S: Scheduler> {
    endpoint: Url,
    config: Config,
    transport: T,
    scheduler: S,
    slots: Mutex<Slots<T::Handle, S::Token>>,
    callbacks: RwLock<Callbacks>,
    state_tx: watch::Sender<ConnectionState>,
}

impl<T: Transport, S: Scheduler> Drop for Inner<T, S> {
    fn drop(&mut self) {
        let slots = self
            .slots
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = slots.retry.take() {
            self.scheduler.cancel(pending.token);
        }
    }
}

/// Owns one logical WebSocket connection and reconnects it after every close.
///
/// The manager holds at most one transport handle and at most one pending
/// retry timer. When a close notification arrives the handle is cleared, the
/// on-close callback runs, and a retry is scheduled after the fixed
/// [`ReconnectConfig::delay`](super::config::ReconnectConfig::delay). A
/// successful open cancels any retry that is still pending. There is no retry
/// limit: an unreachable endpoint is retried forever.
///
/// Cloning is cheap and every clone drives the same connection. Callbacks run
/// on whichever thread delivers the transport event and never while the
/// manager holds a lock, so they may call back into the manager. A callback
/// that panics is logged and the connection carries on.
///
/// A callback that needs the manager should capture a
/// [`downgrade`](Self::downgrade)d handle. A strong clone stored in the
/// manager's own callback keeps it alive forever, so a pending retry is never
/// cancelled on drop.
///
/// # Example
///
/// ```ignore
/// let client = WebSocketClient::new("wss://example.com/feed", Config::default())?;
///
/// client.on_message(|text| {
///     println!("received {text}");
///     Ok::<_, CallbackError>(())
/// });
/// client.on_open({
///     let client = client.downgrade();
///     move || {
///         if let Some(client) = client.upgrade() {
///             client.send(&json!({ "type": "subscribe", "channel": "prices" }));
///         }
///     }
/// });
///
/// client.connect();
/// ```
pub struct ConnectionManager<T: Transport, S: Scheduler> {
    inner: Arc<Inner<T, S>>,
}

impl<T: Transport, S: Scheduler> Clone for ConnectionManager<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Non-owning handle to a [`ConnectionManager`].
pub struct WeakConnectionManager<T: Transport, S: Scheduler> {
    inner: Weak<Inner<T, S>>,
}

impl<T: Transport, S: Scheduler> WeakConnectionManager<T, S> {
    /// The manager, unless every strong handle has been dropped.
    #[must_use]
    pub fn upgrade(&self) -> Option<ConnectionManager<T, S>> {
        self.inner.upgrade().map(|inner| ConnectionManager { inner })
    }
}

impl<T: Transport, S: Scheduler> Clone for WeakConnectionManager<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T: Transport, S: Scheduler> fmt::Debug for WeakConnectionManager<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakConnectionManager")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl<T: Transport, S: Scheduler> fmt::Debug for ConnectionManager<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.inner.endpoint.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<T: Transport, S: Scheduler> ConnectionManager<T, S> {
    /// Create a manager for `endpoint` on top of the given transport and scheduler.
    ///
    /// Nothing is opened until [`connect`](Self::connect) is called. The
    /// endpoint must be a `ws://` or `wss://` URL.
    pub fn with_transport(
        endpoint: &str,
        config: Config,
        transport: T,
        scheduler: S,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint)?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "unsupported WebSocket scheme `{}` in {endpoint}",
                endpoint.scheme()
            )));
        }

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let backoff = config.reconnect.clone().into();

        Ok(Self {
            inner: Arc::new(Inner {
                endpoint,
                config,
                transport,
                scheduler,
                slots: Mutex::new(Slots {
                    live: None,
                    closing: Vec::new(),
                    retry: None,
                    backoff,
                    attempt: 0,
                    next_connection: 0,
                    next_retry: 0,
                }),
                callbacks: RwLock::new(Callbacks::default()),
                state_tx,
            }),
        })
    }

    /// Register the callback run when a connection opens, replacing any previous one.
    pub fn on_open<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks_mut().on_open = Some(Arc::new(callback));
    }

    /// Register the callback run for every text payload, replacing any previous one.
    ///
    /// An `Err` returned from the callback, or a panic inside it, is logged and
    /// swallowed; later messages are still delivered.
    pub fn on_message<F, E>(&self, callback: F)
    where
        F: Fn(&str) -> std::result::Result<(), E> + Send + Sync + 'static,
        E: Into<CallbackError> + 'static,
    {
        self.callbacks_mut().on_message =
            Some(Arc::new(move |text: &str| callback(text).map_err(Into::into)));
    }

    /// Register the callback run with the close code and reason, replacing any previous one.
    pub fn on_close<F>(&self, callback: F)
    where
        F: Fn(u16, &str) + Send + Sync + 'static,
    {
        self.callbacks_mut().on_close = Some(Arc::new(callback));
    }

    /// Register the callback run for transport errors, replacing any previous one.
    ///
    /// Errors do not trigger a reconnect by themselves; the transport follows
    /// them with a close notification.
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.callbacks_mut().on_error = Some(Arc::new(callback));
    }

    /// Open a new transport handle to the endpoint.
    ///
    /// A handle that is still live is dropped and its later events are ignored.
    pub fn connect(&self) {
        let id = {
            let mut slots = self.slots();
            let id = ConnectionId(slots.next_connection);
            slots.next_connection = slots.next_connection.saturating_add(1);

            if let Some(previous) = slots.live.replace(Live { id, handle: None }) {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    previous = %previous.id,
                    "Replacing a live WebSocket connection"
                );
                drop(previous);
            }
            self.publish(ConnectionState::Connecting);
            id
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.inner.endpoint, connection = %id, "Opening WebSocket");

        let handle = self.inner.transport.open(&self.inner.endpoint, self.sink(id));

        let mut slots = self.slots();
        if let Some(live) = slots.live.as_mut().filter(|live| live.id == id) {
            live.handle = Some(handle);
            return;
        }
        // Closed or replaced while the transport was opening.
        drop(slots);
        drop(handle);
    }

    /// Send `data` if the connection is open.
    ///
    /// Strings are sent verbatim; any other value is sent as its JSON
    /// encoding. When no open handle exists the call only logs a warning.
    /// Encoding and transmission failures are discarded.
    pub fn send<D: Serialize + ?Sized>(&self, data: &D) {
        let slots = self.slots();
        let Some(handle) = slots
            .live
            .as_ref()
            .and_then(|live| live.handle.as_ref())
            .filter(|handle| handle.ready_state() == ReadyState::Open)
        else {
            #[cfg(feature = "tracing")]
            tracing::warn!(endpoint = %self.inner.endpoint, "WebSocket is not open, cannot send data");
            return;
        };

        if let Err(e) = encode(data).and_then(|payload| handle.send(payload)) {
            #[cfg(feature = "tracing")]
            tracing::debug!(error = %e, "Discarding failed WebSocket send");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    /// Request closure of the current handle and forget it immediately.
    ///
    /// The close notification still arrives later and runs the on-close
    /// callback. It schedules a reconnect unless
    /// [`ReconnectConfig::after_manual_close`](super::config::ReconnectConfig::after_manual_close)
    /// is disabled. A retry that is already pending is left alone.
    pub fn close(&self, code: Option<u16>, reason: Option<&str>) {
        let live = {
            let mut slots = self.slots();
            let Some(live) = slots.live.take() else {
                return;
            };
            slots.closing.push(live.id);
            self.publish(slots.idle_state());
            live
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(connection = %live.id, ?code, ?reason, "Closing WebSocket");

        if let Some(handle) = &live.handle {
            handle.close(code, reason);
        }
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Whether a handle exists and reports [`ReadyState::Open`].
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.slots()
            .live
            .as_ref()
            .and_then(|live| live.handle.as_ref())
            .is_some_and(|handle| handle.ready_state() == ReadyState::Open)
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    /// Handle that does not keep the manager alive, for use inside its own callbacks.
    #[must_use]
    pub fn downgrade(&self) -> WeakConnectionManager<T, S> {
        WeakConnectionManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn handle_event(&self, id: ConnectionId, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.handle_open(id),
            TransportEvent::Message(text) => self.handle_message(id, &text),
            TransportEvent::Close { code, reason } => self.handle_close(id, code, &reason),
            TransportEvent::Error(error) => self.handle_error(id, &error),
        }
    }

    fn handle_open(&self, id: ConnectionId) {
        {
            let mut slots = self.slots();
            if !slots.is_current(id) {
                #[cfg(feature = "tracing")]
                tracing::debug!(connection = %id, "Ignoring open from a replaced connection");
                return;
            }
            slots.attempt = 0;
            slots.backoff.reset();
            self.publish(ConnectionState::Open {
                since: Instant::now(),
            });
        }

        #[cfg(feature = "tracing")]
        tracing::info!(endpoint = %self.inner.endpoint, connection = %id, "WebSocket connected");

        let callback = self.callbacks().on_open.clone();
        if let Some(callback) = callback {
            guarded("open", || callback());
        }

        let pending = self.slots().retry.take();
        if let Some(pending) = pending {
            #[cfg(feature = "tracing")]
            tracing::debug!("Connection opened, cancelling pending reconnect");
            self.inner.scheduler.cancel(pending.token);
        }
    }

    fn handle_message(&self, id: ConnectionId, text: &str) {
        if !self.slots().is_current(id) {
            #[cfg(feature = "tracing")]
            tracing::debug!(connection = %id, "Ignoring message from a replaced connection");
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(%text, "Received WebSocket text message");

        let Some(callback) = self.callbacks().on_message.clone() else {
            return;
        };

        guarded("message", || {
            if let Err(e) = callback(text) {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %e, "Message callback failed");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        });
    }

    fn handle_close(&self, id: ConnectionId, code: u16, reason: &str) {
        let manual = {
            let mut slots = self.slots();
            let manual = if slots.is_current(id) {
                slots.live = None;
                false
            } else if let Some(position) = slots.closing.iter().position(|closing| *closing == id)
            {
                slots.closing.swap_remove(position);
                true
            } else {
                #[cfg(feature = "tracing")]
                tracing::debug!(connection = %id, "Ignoring close from a replaced connection");
                return;
            };

            if slots.live.is_none() {
                self.publish(slots.idle_state());
            }
            manual
        };

        #[cfg(feature = "tracing")]
        tracing::info!(endpoint = %self.inner.endpoint, code, reason, "WebSocket closed");

        let callback = self.callbacks().on_close.clone();
        if let Some(callback) = callback {
            guarded("close", || callback(code, reason));
        }

        if manual && !self.inner.config.reconnect.after_manual_close {
            #[cfg(feature = "tracing")]
            tracing::debug!("Connection closed locally, not reconnecting");
            return;
        }

        self.reconnect();
    }

    fn handle_error(&self, id: ConnectionId, error: &Error) {
        if !self.slots().is_current(id) {
            #[cfg(feature = "tracing")]
            tracing::debug!(connection = %id, %error, "Ignoring error from a replaced connection");
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(connection = %id, %error, "WebSocket error");

        let callback = self.callbacks().on_error.clone();
        if let Some(callback) = callback {
            guarded("error", || callback(error));
        }
    }

    /// Arm the retry timer unless one is pending or a connection is already live.
    fn reconnect(&self) {
        let mut slots = self.slots();
        if slots.retry.is_some() || slots.live.is_some() {
            return;
        }

        let delay = slots
            .backoff
            .next_backoff()
            .unwrap_or(self.inner.config.reconnect.delay);
        let seq = slots.next_retry;
        slots.next_retry = slots.next_retry.saturating_add(1);
        slots.attempt = slots.attempt.saturating_add(1);

        let weak = self.downgrade();
        let token = self.inner.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(manager) = weak.upgrade() {
                    manager.fire_retry(seq);
                }
            }),
        );
        slots.retry = Some(PendingRetry { seq, token });
        self.publish(ConnectionState::RetryPending {
            attempt: slots.attempt,
        });

        #[cfg(feature = "tracing")]
        tracing::debug!(?delay, attempt = slots.attempt, "Scheduled reconnect");
    }

    fn fire_retry(&self, seq: u64) {
        {
            let mut slots = self.slots();
            if !slots.retry.as_ref().is_some_and(|pending| pending.seq == seq) {
                // Cancelled after the timer had already started running.
                return;
            }
            slots.retry = None;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.inner.endpoint, "Reconnecting");

        self.connect();
    }

    fn sink(&self, id: ConnectionId) -> EventSink {
        let weak = self.downgrade();
        EventSink::new(
            id,
            Arc::new(move |id: ConnectionId, event: TransportEvent| {
                if let Some(manager) = weak.upgrade() {
                    manager.handle_event(id, event);
                }
            }),
        )
    }

    fn publish(&self, state: ConnectionState) {
        self.inner.state_tx.send_replace(state);
    }

    fn slots(&self) -> MutexGuard<'_, Slots<T::Handle, S::Token>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn callbacks(&self) -> RwLockReadGuard<'_, Callbacks> {
        self.inner
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn callbacks_mut(&self) -> RwLockWriteGuard<'_, Callbacks> {
        self.inner
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// [`ConnectionManager`] over tokio-tungstenite sockets and tokio timers.
#[cfg(feature = "tungstenite")]
pub type WebSocketClient = ConnectionManager<TungsteniteTransport, TokioScheduler>;

#[cfg(feature = "tungstenite")]
#[expect(
    clippy::multiple_inherent_impl,
    reason = "The tokio-backed constructor only exists with the `tungstenite` feature"
)]
impl ConnectionManager<TungsteniteTransport, TokioScheduler> {
    /// Create a client for `endpoint` on the current tokio runtime.
    ///
    /// Nothing is opened until [`connect`](Self::connect) is called. Fails
    /// outside a tokio runtime or for a non-`ws`/`wss` endpoint.
    pub fn new(endpoint: &str, config: Config) -> Result<Self> {
        let transport = TungsteniteTransport::new(&config)?;
        let scheduler = TokioScheduler::new()?;
        Self::with_transport(endpoint, config, transport, scheduler)
    }
}

fn encode<D: Serialize + ?Sized>(data: &D) -> Result<String> {
    match serde_json::to_value(data).map_err(WsError::Serialize)? {
        Value::String(text) => Ok(text),
        value => Ok(value.to_string()),
    }
}

/// Run a consumer callback, logging a panic instead of unwinding into the transport.
fn guarded(callback: &'static str, run: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(run)) {
        #[cfg(feature = "tracing")]
        tracing::error!(
            callback,
            panic = panic_message(payload.as_ref()),
            "Callback panicked"
        );
        #[cfg(not(feature = "tracing"))]
        let _ = (callback, &payload);
    }
}

#[cfg(feature = "tracing")]
fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
