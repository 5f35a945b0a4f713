//! Seams between the connection manager and the outside world.
//!
//! A [`Transport`] opens sockets and reports their lifecycle through an
//! [`EventSink`]; a [`Scheduler`] runs the delayed retry. Production
//! implementations live in [`super::transport`] and [`super::scheduler`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::Result;
use crate::error::Error;

/// Identifies one opened transport handle for the lifetime of its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Status reported by a transport handle.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// The socket is being opened
    Connecting,
    /// The socket accepts outbound sends
    Open,
    /// A close has been requested but the socket has not finished closing
    Closing,
    /// The socket is closed or could not be opened
    Closed,
}

/// Lifecycle notification emitted by a transport.
#[non_exhaustive]
#[derive(Debug)]
pub enum TransportEvent {
    /// The socket is open and ready
    Open,
    /// A text payload arrived
    Message(String),
    /// The socket closed
    Close {
        /// Close status code (`1006` when the socket dropped without a close frame)
        code: u16,
        /// Close reason sent by the peer, possibly empty
        reason: String,
    },
    /// The transport reported an error; a `Close` is expected to follow
    Error(Error),
}

/// Receives the events of a single transport handle.
///
/// Cloning is cheap. A sink outliving its manager silently drops events.
#[derive(Clone)]
pub struct EventSink {
    id: ConnectionId,
    dispatch: Arc<dyn Fn(ConnectionId, TransportEvent) + Send + Sync>,
}

impl EventSink {
    pub(crate) fn new(
        id: ConnectionId,
        dispatch: Arc<dyn Fn(ConnectionId, TransportEvent) + Send + Sync>,
    ) -> Self {
        Self { id, dispatch }
    }

    /// Handle this sink reports for.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.dispatch)(self.id, event);
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").field("id", &self.id).finish()
    }
}

/// Opens sockets to an endpoint.
///
/// `open` must return without emitting events; the handle reports open,
/// message, close and error later through the given sink.
pub trait Transport: Send + Sync + 'static {
    type Handle: TransportHandle;

    fn open(&self, endpoint: &Url, events: EventSink) -> Self::Handle;
}

/// A single opened socket. Dropping the handle releases the socket.
///
/// None of these methods may emit events synchronously.
pub trait TransportHandle: Send + Sync + 'static {
    fn ready_state(&self) -> ReadyState;

    /// Queue a text payload. Only valid while [`ReadyState::Open`].
    fn send(&self, payload: String) -> Result<()>;

    /// Request closure with an optional status code and reason.
    fn close(&self, code: Option<u16>, reason: Option<&str>);
}

/// Delayed one-shot callbacks.
///
/// `schedule` must not run the task before returning.
pub trait Scheduler: Send + Sync + 'static {
    type Token: Send + 'static;

    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send + 'static>) -> Self::Token;

    fn cancel(&self, token: Self::Token);
}
