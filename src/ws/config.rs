#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::backoff::Constant;

const DEFAULT_RECONNECT_DELAY_DURATION: Duration = Duration::from_millis(3000);
const DEFAULT_CONNECT_TIMEOUT_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_CLOSE_TIMEOUT_DURATION: Duration = Duration::from_secs(5);

/// Configuration for WebSocket client behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
    /// Maximum time a transport may spend opening a socket before it reports a failed attempt
    pub connect_timeout: Duration,
    /// How long a closing socket waits for the peer's close frame before it is
    /// reported closed with `1006`
    pub close_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_DURATION,
            close_timeout: DEFAULT_CLOSE_TIMEOUT_DURATION,
        }
    }
}

impl Config {
    /// Default configuration with a different reconnect delay.
    #[must_use]
    pub fn with_reconnect_delay(delay: Duration) -> Self {
        let mut config = Self::default();
        config.reconnect.delay = delay;
        config
    }
}

/// Configuration for automatic reconnection behavior.
///
/// Retries are unlimited and always wait the same `delay`.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Fixed wait between a close notification and the next connection attempt
    pub delay: Duration,
    /// Whether the close notification that follows an explicit
    /// [`close`](super::ConnectionManager::close) also schedules a reconnect.
    pub after_manual_close: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY_DURATION,
            after_manual_close: true,
        }
    }
}

impl From<ReconnectConfig> for Constant {
    fn from(config: ReconnectConfig) -> Self {
        Constant::new(config.delay)
    }
}
