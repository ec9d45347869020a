use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct DebugConfig {
    /// Deadline for ordinary bridge calls (module reads/writes, state polls).
    pub call_timeout: Duration,
    /// Deadline for attach and execution commands, which may block on the target.
    pub command_timeout: Duration,
    pub poll_interval: Duration,
    pub max_poll_backoff: Duration,
    /// Consecutive poll failures before a degraded-connectivity event.
    pub degraded_after: u32,
    pub retry_count: u32,
    pub retry_base_delay: Duration,
    /// Consecutive failed calls before the session is forced to disconnect.
    pub circuit_threshold: u32,
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
            max_poll_backoff: Duration::from_secs(30),
            degraded_after: 3,
            retry_count: 2,
            retry_base_delay: Duration::from_millis(500),
            circuit_threshold: 10,
            reconnect_attempts: 3,
            reconnect_backoff: Duration::from_secs(1),
        }
    }
}

impl DebugConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retries(mut self, count: u32, base_delay: Duration) -> Self {
        self.retry_count = count;
        self.retry_base_delay = base_delay;
        self
    }

    pub fn with_reconnect(mut self, attempts: u32, backoff: Duration) -> Self {
        self.reconnect_attempts = attempts;
        self.reconnect_backoff = backoff;
        self
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            call_timeout: env_millis("VBA_DEBUG_CALL_TIMEOUT_MS").unwrap_or(defaults.call_timeout),
            command_timeout: env_millis("VBA_DEBUG_COMMAND_TIMEOUT_MS")
                .unwrap_or(defaults.command_timeout),
            poll_interval: env_millis("VBA_DEBUG_POLL_INTERVAL_MS")
                .unwrap_or(defaults.poll_interval),
            retry_count: env_u32("VBA_DEBUG_RETRY_COUNT").unwrap_or(defaults.retry_count),
            reconnect_attempts: env_u32("VBA_DEBUG_RECONNECT_ATTEMPTS")
                .unwrap_or(defaults.reconnect_attempts),
            ..defaults
        }
    }
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse::<u32>().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}
