//! Wall-clock and principal sources for ledger rows.

/// Supplies timestamps for history records and lock rows.
pub trait Clock: Send + Sync {
    /// Current time in microseconds since the Unix epoch.
    fn now_micros(&self) -> u64;
}

/// Clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        current_timestamp()
    }
}

/// Clock that always reports the same instant. Useful for reproducible ledgers in tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub u64);

impl Clock for FixedClock {
    fn now_micros(&self) -> u64 {
        self.0
    }
}

/// Current timestamp in microseconds since the Unix epoch.
///
/// A system clock set before the epoch reports zero.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Principal recorded as `installed_by` when none is configured.
pub fn default_principal() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
