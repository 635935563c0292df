use std::time::Duration;

const DEFAULT_HEARTBEAT_MS: u64 = 15_000;
const DEFAULT_TICK_MS: u64 = 500;
const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 1_000;
const MAX_RECONNECT_BACKOFF_MS: u64 = 30_000;
const DEFAULT_NOTICE_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub heartbeat_ms: u64,
    /// Silence after which a participant is treated as gone.
    pub presence_grace_ms: u64,
    pub tick_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub max_reconnect_backoff_ms: u64,
    pub notice_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
            presence_grace_ms: DEFAULT_HEARTBEAT_MS * 3,
            tick_ms: DEFAULT_TICK_MS,
            reconnect_backoff_ms: DEFAULT_RECONNECT_BACKOFF_MS,
            max_reconnect_backoff_ms: MAX_RECONNECT_BACKOFF_MS,
            notice_buffer: DEFAULT_NOTICE_BUFFER,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let heartbeat_ms = env_u64("STILLPOINT_HEARTBEAT_MS").unwrap_or(DEFAULT_HEARTBEAT_MS);
        let presence_grace_ms =
            env_u64("STILLPOINT_PRESENCE_GRACE_MS").unwrap_or(heartbeat_ms.saturating_mul(3));
        let tick_ms = env_u64("STILLPOINT_TICK_MS").unwrap_or(DEFAULT_TICK_MS);
        let reconnect_backoff_ms =
            env_u64("STILLPOINT_RECONNECT_BACKOFF_MS").unwrap_or(DEFAULT_RECONNECT_BACKOFF_MS);
        let notice_buffer = std::env::var("STILLPOINT_NOTICE_BUFFER")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_NOTICE_BUFFER);
        Self {
            heartbeat_ms,
            presence_grace_ms,
            tick_ms,
            reconnect_backoff_ms,
            max_reconnect_backoff_ms: MAX_RECONNECT_BACKOFF_MS.max(reconnect_backoff_ms),
            notice_buffer,
        }
        .sanitized()
    }

    /// Clamp values that would stall the runner (zero intervals, grace
    /// shorter than one heartbeat).
    pub fn sanitized(mut self) -> Self {
        self.heartbeat_ms = self.heartbeat_ms.max(1);
        self.tick_ms = self.tick_ms.max(1);
        self.presence_grace_ms = self.presence_grace_ms.max(self.heartbeat_ms);
        self.reconnect_backoff_ms = self.reconnect_backoff_ms.max(1);
        self.max_reconnect_backoff_ms = self.max_reconnect_backoff_ms.max(self.reconnect_backoff_ms);
        self.notice_buffer = self.notice_buffer.max(1);
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Backoff before reconnect attempt `attempt` (0-based), doubling and capped.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX);
        let ms = self
            .reconnect_backoff_ms
            .saturating_mul(factor)
            .min(self.max_reconnect_backoff_ms);
        Duration::from_millis(ms)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
