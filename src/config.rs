//! Runtime configuration, loaded from environment variables.

use crate::ledger::DEFAULT_LEDGER_CAPACITY;

const DEFAULT_SAVE_DEBOUNCE_MS: u64 = 2000;
const DEFAULT_IO_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_BASE_MS: u64 = 500;
const DEFAULT_CHANNEL_QUEUE: usize = 256;

/// Tuning knobs for the sync service. Every field has a named default and
/// an environment override.
#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    /// Quiet period after the last edit before the debounced save fires.
    pub save_debounce_ms: u64,
    /// Bound on each load/save round-trip. No built-in retry.
    pub io_timeout_ms: u64,
    /// Change ledger bound; oldest records evicted beyond this.
    pub ledger_capacity: usize,
    /// Reconnect attempts before the realtime channel gives up.
    pub reconnect_attempts: u32,
    /// Base delay for jittered reconnect back-off.
    pub reconnect_base_ms: u64,
    /// Bounded command queue between callers and the channel task.
    pub channel_queue: usize,
}

impl SyncConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            save_debounce_ms: env_parse("MAPSYNC_SAVE_DEBOUNCE_MS", DEFAULT_SAVE_DEBOUNCE_MS),
            io_timeout_ms: env_parse("MAPSYNC_IO_TIMEOUT_MS", DEFAULT_IO_TIMEOUT_MS),
            ledger_capacity: env_parse("MAPSYNC_LEDGER_CAPACITY", DEFAULT_LEDGER_CAPACITY),
            reconnect_attempts: env_parse("MAPSYNC_RECONNECT_ATTEMPTS", DEFAULT_RECONNECT_ATTEMPTS),
            reconnect_base_ms: env_parse("MAPSYNC_RECONNECT_BASE_MS", DEFAULT_RECONNECT_BASE_MS),
            channel_queue: env_parse("MAPSYNC_CHANNEL_QUEUE", DEFAULT_CHANNEL_QUEUE),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            save_debounce_ms: DEFAULT_SAVE_DEBOUNCE_MS,
            io_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_base_ms: DEFAULT_RECONNECT_BASE_MS,
            channel_queue: DEFAULT_CHANNEL_QUEUE,
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
