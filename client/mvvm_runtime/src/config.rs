use std::time::Duration;

pub const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 5_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 25;
pub const DEFAULT_ERROR_HISTORY: usize = 256;
pub const DEFAULT_DIAL_TIMEOUT_MS: u64 = 10_000;

pub const RECONNECT_BACKOFF_ENV: &str = "MVVM_RECONNECT_BACKOFF_MS";
pub const POLL_INTERVAL_ENV: &str = "MVVM_POLL_INTERVAL_MS";
pub const ERROR_HISTORY_ENV: &str = "MVVM_ERROR_HISTORY";
pub const DIAL_TIMEOUT_ENV: &str = "MVVM_DIAL_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Fixed wait between a closed socket and the next connect attempt.
    pub reconnect_backoff: Duration,
    /// Read timeout of the I/O thread; bounds outbound latency while idle.
    pub poll_interval: Duration,
    pub error_history: usize,
    /// Upper bound on TCP connect plus the websocket handshake.
    pub dial_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_millis(DEFAULT_RECONNECT_BACKOFF_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            error_history: DEFAULT_ERROR_HISTORY,
            dial_timeout: Duration::from_millis(DEFAULT_DIAL_TIMEOUT_MS),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            reconnect_backoff: Duration::from_millis(parse_positive(
                lookup(RECONNECT_BACKOFF_ENV),
                DEFAULT_RECONNECT_BACKOFF_MS,
            )),
            poll_interval: Duration::from_millis(parse_positive(
                lookup(POLL_INTERVAL_ENV),
                DEFAULT_POLL_INTERVAL_MS,
            )),
            error_history: parse_positive(lookup(ERROR_HISTORY_ENV), DEFAULT_ERROR_HISTORY as u64)
                as usize,
            dial_timeout: Duration::from_millis(parse_positive(
                lookup(DIAL_TIMEOUT_ENV),
                DEFAULT_DIAL_TIMEOUT_MS,
            )),
        }
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_error_history(mut self, capacity: usize) -> Self {
        self.error_history = capacity.max(1);
        self
    }
}

fn parse_positive(raw: Option<String>, default: u64) -> u64 {
    raw.and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}
