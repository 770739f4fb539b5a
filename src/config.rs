use std::time::Duration;

pub const DEFAULT_RELAY_URL: &str = "ws://localhost:8765";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Tunables of a call handler. `Default` matches the browser handler this
/// engine interoperates with.
#[derive(Clone, Debug)]
pub struct HandlerConfig {
    /// Base URL of the relay; `/ws/{code}` is appended.
    pub relay_url: String,
    pub ice_servers: Vec<String>,
    /// Attempts of one bounded connect, first attempt included.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
    /// Spacing of the unbounded reconnect loop after an unclean close.
    pub reconnect_delay: Duration,
    pub gathering_timeout: Duration,
    pub answer_poll_attempts: u32,
    pub answer_poll_interval: Duration,
    pub ice_restart_timeout: Duration,
    /// Pause between teardown and re-dial in `reconnect()`.
    pub reconnect_drain: Duration,
    /// Answer incoming offers without waiting for `accept_incoming`.
    pub auto_answer: bool,
    pub event_capacity: usize,
    pub command_buffer: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            max_retries: 3,
            retry_delay: Duration::from_millis(2000),
            connect_timeout: Duration::from_millis(5000),
            reconnect_delay: Duration::from_millis(5000),
            gathering_timeout: Duration::from_millis(2000),
            answer_poll_attempts: 5,
            answer_poll_interval: Duration::from_millis(100),
            ice_restart_timeout: Duration::from_millis(5000),
            reconnect_drain: Duration::from_millis(1000),
            auto_answer: true,
            event_capacity: 100,
            command_buffer: 32,
        }
    }
}

impl HandlerConfig {
    pub fn with_relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = url.into();
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_auto_answer(mut self, auto_answer: bool) -> Self {
        self.auto_answer = auto_answer;
        self
    }

    /// Endpoint of the control channel for `code`.
    pub fn endpoint_for(&self, code: &str) -> String {
        format!(
            "{}/ws/{}",
            self.relay_url.trim_end_matches('/'),
            urlencoding::encode(code)
        )
    }
}
