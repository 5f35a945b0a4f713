//! [`Transport`] backed by `tokio-tungstenite`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::config::Config;
use super::error::WsError;
use super::traits::{EventSink, ReadyState, Transport, TransportEvent, TransportHandle};
use crate::Result;
use crate::error::{Error, Kind};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reported when the socket ended without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;
/// Reported when the peer's close frame carried no status code.
const NO_STATUS_RECEIVED: u16 = 1005;

#[derive(Debug)]
enum Command {
    Send(String),
    Close {
        code: Option<u16>,
        reason: Option<String>,
    },
}

/// Opens one tokio task per socket on the runtime it was created in.
#[derive(Debug, Clone)]
pub struct TungsteniteTransport {
    runtime: Handle,
    connect_timeout: Duration,
    close_timeout: Duration,
}

impl TungsteniteTransport {
    /// Create a transport bound to the current tokio runtime, using the
    /// timeouts from `config`.
    ///
    /// Fails when called outside a runtime.
    pub fn new(config: &Config) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| Error::with_source(Kind::Internal, e))?;
        Ok(Self::with_runtime(runtime, config))
    }

    #[must_use]
    pub fn with_runtime(runtime: Handle, config: &Config) -> Self {
        Self {
            runtime,
            connect_timeout: config.connect_timeout,
            close_timeout: config.close_timeout,
        }
    }
}

impl Transport for TungsteniteTransport {
    type Handle = TungsteniteHandle;

    fn open(&self, endpoint: &Url, events: EventSink) -> Self::Handle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let ready = Arc::new(SharedReadyState::new(ReadyState::Connecting));

        self.runtime.spawn(run_socket(
            endpoint.clone(),
            self.connect_timeout,
            self.close_timeout,
            events,
            commands_rx,
            Arc::clone(&ready),
        ));

        TungsteniteHandle {
            commands_tx,
            ready,
        }
    }
}

/// Handle to a socket task. Dropping it closes the socket normally.
#[derive(Debug)]
pub struct TungsteniteHandle {
    commands_tx: mpsc::UnboundedSender<Command>,
    ready: Arc<SharedReadyState>,
}

impl TransportHandle for TungsteniteHandle {
    fn ready_state(&self) -> ReadyState {
        self.ready.load()
    }

    fn send(&self, payload: String) -> Result<()> {
        if self.ready.load() != ReadyState::Open {
            return Err(WsError::NotOpen.into());
        }
        self.commands_tx
            .send(Command::Send(payload))
            .map_err(|_e| WsError::ConnectionClosed)?;
        Ok(())
    }

    fn close(&self, code: Option<u16>, reason: Option<&str>) {
        if matches!(self.ready.load(), ReadyState::Closing | ReadyState::Closed) {
            return;
        }
        self.ready.store(ReadyState::Closing);
        _ = self.commands_tx.send(Command::Close {
            code,
            reason: reason.map(str::to_owned),
        });
    }
}

/// [`ReadyState`] shared between a handle and its socket task.
#[derive(Debug)]
struct SharedReadyState(AtomicU8);

impl SharedReadyState {
    fn new(state: ReadyState) -> Self {
        Self(AtomicU8::new(to_u8(state)))
    }

    fn load(&self) -> ReadyState {
        from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: ReadyState) {
        self.0.store(to_u8(state), Ordering::Release);
    }

    /// Move `from` -> `to`; false if the state was something else.
    fn transition(&self, from: ReadyState, to: ReadyState) -> bool {
        self.0
            .compare_exchange(to_u8(from), to_u8(to), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

const fn to_u8(state: ReadyState) -> u8 {
    match state {
        ReadyState::Connecting => 0,
        ReadyState::Open => 1,
        ReadyState::Closing => 2,
        ReadyState::Closed => 3,
    }
}

const fn from_u8(value: u8) -> ReadyState {
    match value {
        0 => ReadyState::Connecting,
        1 => ReadyState::Open,
        2 => ReadyState::Closing,
        _ => ReadyState::Closed,
    }
}

async fn run_socket(
    endpoint: Url,
    connect_timeout: Duration,
    close_timeout: Duration,
    events: EventSink,
    mut commands_rx: mpsc::UnboundedReceiver<Command>,
    ready: Arc<SharedReadyState>,
) {
    let stream = match timeout(connect_timeout, connect_async(endpoint.as_str())).await {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(e)) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(%endpoint, error = %e, "Unable to connect");
            fail(&events, &ready, e.into());
            return;
        }
        Err(_elapsed) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(%endpoint, ?connect_timeout, "Timed out connecting");
            fail(&events, &ready, WsError::Timeout.into());
            return;
        }
    };

    // A close requested while connecting suppresses the open notification.
    if ready.transition(ReadyState::Connecting, ReadyState::Open) {
        events.emit(TransportEvent::Open);
    }

    let (code, reason) = drive(stream, &events, &mut commands_rx, &ready, close_timeout).await;

    ready.store(ReadyState::Closed);
    events.emit(TransportEvent::Close { code, reason });
}

fn fail(events: &EventSink, ready: &SharedReadyState, error: Error) {
    ready.store(ReadyState::Closed);
    events.emit(TransportEvent::Error(error));
    events.emit(TransportEvent::Close {
        code: ABNORMAL_CLOSURE,
        reason: String::new(),
    });
}

/// Pump frames until the socket ends. Returns the close code and reason to report.
///
/// Once a close frame has been sent the peer has `close_timeout` to finish the
/// handshake; after that the socket is abandoned and reported as `1006`.
async fn drive(
    stream: WsStream,
    events: &EventSink,
    commands_rx: &mut mpsc::UnboundedReceiver<Command>,
    ready: &SharedReadyState,
    close_timeout: Duration,
) -> (u16, String) {
    let (mut write, mut read) = stream.split();
    let mut peer_close = None;
    let mut commands_open = true;
    let mut closing = false;
    let close_deadline = sleep(close_timeout);
    tokio::pin!(close_deadline);

    loop {
        tokio::select! {
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        events.emit(TransportEvent::Message(text.to_string()));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        ready.store(ReadyState::Closing);
                        if !closing {
                            close_deadline.as_mut().reset(Instant::now() + close_timeout);
                            closing = true;
                        }
                        peer_close = Some(frame.map_or_else(
                            || (NO_STATUS_RECEIVED, String::new()),
                            |frame| (u16::from(frame.code), frame.reason.to_string()),
                        ));
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(len = bytes.len(), "Ignoring binary WebSocket frame");
                        #[cfg(not(feature = "tracing"))]
                        let _ = &bytes;
                    }
                    Some(Ok(_)) => {
                        // Ping/Pong are answered by tungstenite itself.
                    }
                    Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed))
                    | None => break,
                    Some(Err(e)) => {
                        events.emit(TransportEvent::Error(e.into()));
                        return (ABNORMAL_CLOSURE, String::new());
                    }
                }
            }

            command = commands_rx.recv(), if commands_open => {
                match command {
                    Some(Command::Send(payload)) => {
                        if let Err(e) = write.send(Message::Text(payload.into())).await {
                            #[cfg(feature = "tracing")]
                            tracing::debug!(error = %e, "WebSocket write failed");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &e;
                        }
                    }
                    Some(Command::Close { code, reason }) => {
                        let frame = code.map(|code| CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.unwrap_or_default().into(),
                        });
                        close_deadline.as_mut().reset(Instant::now() + close_timeout);
                        closing = true;
                        if write.send(Message::Close(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Every handle is gone; close politely unless already closing.
                        commands_open = false;
                        if ready.transition(ReadyState::Open, ReadyState::Closing) {
                            close_deadline.as_mut().reset(Instant::now() + close_timeout);
                            closing = true;
                            if write.send(Message::Close(None)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }

            () = &mut close_deadline, if closing => {
                #[cfg(feature = "tracing")]
                tracing::warn!(?close_timeout, "Peer did not finish the close handshake");
                break;
            }
        }
    }

    peer_close.unwrap_or_else(|| (ABNORMAL_CLOSURE, String::new()))
}
