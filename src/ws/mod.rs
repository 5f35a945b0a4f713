//! Reconnecting WebSocket connection management.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: one logical connection with lifecycle callbacks and a
//!   fixed-interval reconnect timer
//! - [`Transport`] / [`TransportHandle`]: how sockets are opened and driven
//! - [`Scheduler`]: how the reconnect timer is armed and cancelled
//!
//! With the `tungstenite` feature, [`WebSocketClient`] wires the manager to
//! tokio-tungstenite sockets and tokio timers.
//!
//! # Example
//!
//! ```ignore
//! let client = WebSocketClient::new("wss://example.com/feed", Config::default())?;
//! client.on_message(|text| {
//!     println!("{text}");
//!     Ok::<_, CallbackError>(())
//! });
//! client.connect();
//! ```

pub mod config;
pub mod connection;
pub mod error;
#[cfg(feature = "tungstenite")]
pub mod scheduler;
pub mod traits;
#[cfg(feature = "tungstenite")]
pub mod transport;

#[cfg(feature = "tungstenite")]
pub use connection::WebSocketClient;
pub use connection::{CallbackError, ConnectionManager, ConnectionState, WeakConnectionManager};
#[cfg(feature = "tungstenite")]
pub use scheduler::TokioScheduler;
pub use traits::*;
#[cfg(feature = "tungstenite")]
pub use transport::{TungsteniteHandle, TungsteniteTransport};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
