//! Mutual exclusion over the schema history.
//!
//! Two strategies sit behind [`HistoryLock`]:
//!
//! - [`NativeLock`]: a blocking primitive, for backends that have one.
//! - Row lock ([`acquire_row_lock`]): a well-known lock row is inserted with a unique
//!   token and deleted on release. Competing lockers poll with bounded exponential
//!   backoff. Rows older than [`LockConfig::stale_after`] are presumed abandoned and
//!   reclaimed. While held, a heartbeat thread rewrites the row's timestamp every
//!   half expiry, so a live holder is never mistaken for a dead one.
//!
//! Either way the lock is released when the guard drops.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::current_timestamp;
use crate::error::{Error, Result};

/// How the ledger is locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Blocking lock primitive.
    Native,
    /// Polling lock row.
    PollingRow,
}

/// Lock acquisition settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// First delay between polls of a held row lock.
    pub poll_interval_ms: u64,
    /// Upper bound for the backoff between polls.
    pub max_poll_interval_ms: u64,
    /// Age after which a lock row is considered abandoned.
    pub stale_after_ms: u64,
    /// Give up acquiring after this long.
    pub acquire_timeout_ms: u64,
    /// Polls between "possible deadlock" warnings.
    pub warn_after_polls: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            max_poll_interval_ms: 1000,
            stale_after_ms: 10 * 60 * 1000,
            acquire_timeout_ms: 10 * 60 * 1000,
            warn_after_polls: 50,
        }
    }
}

impl LockConfig {
    /// Set the initial poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the maximum poll interval.
    pub fn with_max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the stale-lock expiry.
    pub fn with_stale_after(mut self, age: Duration) -> Self {
        self.stale_after_ms = age.as_millis() as u64;
        self
    }

    /// Set the acquire timeout.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Initial poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Maximum poll interval.
    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms.max(self.poll_interval_ms).max(1))
    }

    /// Stale-lock expiry.
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    /// Acquire timeout.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// How often a held lock row is refreshed: half the stale-lock expiry.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.stale_after() / 2).max(Duration::from_millis(1))
    }
}

/// Exclusive hold on the schema history. Released on drop.
pub struct HistoryLock<'a> {
    mode: LockMode,
    release: Option<Box<dyn FnOnce() + 'a>>,
}

impl<'a> HistoryLock<'a> {
    /// Guard that runs `release` when dropped.
    pub fn new(mode: LockMode, release: impl FnOnce() + 'a) -> Self {
        Self {
            mode,
            release: Some(Box::new(release)),
        }
    }

    /// The strategy that produced this lock.
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for HistoryLock<'_> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for HistoryLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryLock").field("mode", &self.mode).finish()
    }
}

/// In-process blocking lock.
#[derive(Default)]
pub struct NativeLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl NativeLock {
    /// Create an unheld lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock is free or `timeout` passes.
    pub fn acquire(&self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut held = self.held.lock();
        while *held {
            if self.released.wait_until(&mut held, deadline).timed_out() && *held {
                return Err(Error::LockTimeout {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        }
        *held = true;
        Ok(())
    }

    /// Release the lock and wake one waiter.
    pub fn release(&self) {
        *self.held.lock() = false;
        self.released.notify_one();
    }

    /// Acquire and wrap in a guard.
    pub fn guard(&self, timeout: Duration) -> Result<HistoryLock<'_>> {
        self.acquire(timeout)?;
        Ok(HistoryLock::new(LockMode::Native, move || self.release()))
    }
}

/// The lock row of the polling strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRow {
    /// Unique token of the holder.
    pub token: String,
    /// When the row was written (microseconds since epoch).
    pub acquired_on: u64,
}

impl LockRow {
    /// Byte encoding: 8-byte big-endian timestamp followed by the UTF-8 token.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.token.len());
        buf.extend_from_slice(&self.acquired_on.to_be_bytes());
        buf.extend_from_slice(self.token.as_bytes());
        buf
    }

    /// Decode from [`LockRow::encode`] output.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(Error::InvalidKey);
        }
        let (ts, token) = bytes.split_at(8);
        let mut ts_bytes = [0u8; 8];
        ts_bytes.copy_from_slice(ts);
        let token = String::from_utf8(token.to_vec()).map_err(|e| Error::Deserialization(e.to_string()))?;
        Ok(Self {
            token,
            acquired_on: u64::from_be_bytes(ts_bytes),
        })
    }
}

/// Storage for the single lock row.
pub trait LockTable: Send + Sync {
    /// Insert `row` if no lock row exists. Returns whether it was inserted.
    fn insert_lock_row(&self, row: &LockRow) -> Result<bool>;

    /// The current lock row, if any.
    fn current_lock_row(&self) -> Result<Option<LockRow>>;

    /// Replace `expected` with `row` if `expected` is still current.
    fn replace_lock_row(&self, expected: &LockRow, row: &LockRow) -> Result<bool>;

    /// Delete the lock row if it carries `token`. Returns whether it was deleted.
    fn delete_lock_row(&self, token: &str) -> Result<bool>;
}

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A token unique to this process and call.
pub fn generate_token() -> String {
    let seq = TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:x}-{:x}", std::process::id(), current_timestamp(), seq)
}

/// Poll until the lock row is ours.
pub fn acquire_row_lock<T: LockTable + ?Sized>(table: &T, config: &LockConfig) -> Result<LockRow> {
    let token = generate_token();
    let started = Instant::now();
    let stale_after_micros = config.stale_after().as_micros() as u64;
    let mut delay = config.poll_interval();
    let mut polls: u32 = 0;

    loop {
        let row = LockRow {
            token: token.clone(),
            acquired_on: current_timestamp(),
        };
        if table.insert_lock_row(&row)? {
            debug!(token = %row.token, polls, "Acquired schema history lock row");
            return Ok(row);
        }

        let holder = table.current_lock_row()?;
        if let Some(existing) = &holder {
            let age = row.acquired_on.saturating_sub(existing.acquired_on);
            if age > stale_after_micros {
                warn!(
                    holder = %existing.token,
                    age_ms = age / 1000,
                    "Reclaiming stale schema history lock row"
                );
                if table.replace_lock_row(existing, &row)? {
                    return Ok(row);
                }
                continue;
            }
        }

        let waited = started.elapsed();
        if waited >= config.acquire_timeout() {
            return Err(Error::LockTimeout {
                waited_ms: waited.as_millis() as u64,
            });
        }

        polls += 1;
        let holder_token = holder.map(|h| h.token).unwrap_or_default();
        if config.warn_after_polls > 0 && polls % config.warn_after_polls == 0 {
            warn!(
                holder = %holder_token,
                polls,
                "Still waiting for schema history lock, possible deadlock"
            );
        } else {
            debug!(holder = %holder_token, polls, "Waiting for schema history lock");
        }

        let remaining = config.acquire_timeout().saturating_sub(waited);
        thread::sleep(delay.min(remaining));
        delay = (delay * 2).min(config.max_poll_interval());
    }
}

/// Keeps a held lock row fresh until stopped.
struct Heartbeat {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    fn start<T: LockTable + ?Sized + 'static>(table: Arc<T>, mut row: LockRow, interval: Duration) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::spawn(move || {
            let mut next = Instant::now() + interval;
            while !shutdown_clone.load(Ordering::SeqCst) {
                let now = Instant::now();
                if now < next {
                    thread::park_timeout(next - now);
                    continue;
                }
                next = now + interval;

                let refreshed = LockRow {
                    token: row.token.clone(),
                    acquired_on: current_timestamp(),
                };
                match table.replace_lock_row(&row, &refreshed) {
                    Ok(true) => {
                        debug!(token = %row.token, "Refreshed schema history lock row");
                        row = refreshed;
                    }
                    Ok(false) => {
                        warn!(token = %row.token, "Schema history lock row was taken over while held");
                        return;
                    }
                    Err(e) => warn!(token = %row.token, error = %e, "Failed to refresh schema history lock row"),
                }
            }
        });

        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

/// Acquire the row lock and wrap it in a guard that refreshes the row while held and
/// deletes it on drop.
pub fn row_lock_guard<'a, T: LockTable + ?Sized + 'static>(
    table: Arc<T>,
    config: &LockConfig,
) -> Result<HistoryLock<'a>> {
    let row = acquire_row_lock(table.as_ref(), config)?;
    let token = row.token.clone();
    let heartbeat = Heartbeat::start(Arc::clone(&table), row, config.heartbeat_interval());

    Ok(HistoryLock::new(LockMode::PollingRow, move || {
        heartbeat.stop();
        match table.delete_lock_row(&token) {
            Ok(true) => {}
            Ok(false) => warn!(token = %token, "Schema history lock row was taken over before release"),
            Err(e) => warn!(token = %token, error = %e, "Failed to release schema history lock row"),
        }
    }))
}

/// Lock row kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryLockTable {
    row: Mutex<Option<LockRow>>,
}

impl MemoryLockTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockTable for MemoryLockTable {
    fn insert_lock_row(&self, row: &LockRow) -> Result<bool> {
        let mut current = self.row.lock();
        if current.is_some() {
            return Ok(false);
        }
        *current = Some(row.clone());
        Ok(true)
    }

    fn current_lock_row(&self) -> Result<Option<LockRow>> {
        Ok(self.row.lock().clone())
    }

    fn replace_lock_row(&self, expected: &LockRow, row: &LockRow) -> Result<bool> {
        let mut current = self.row.lock();
        if current.as_ref() != Some(expected) {
            return Ok(false);
        }
        *current = Some(row.clone());
        Ok(true)
    }

    fn delete_lock_row(&self, token: &str) -> Result<bool> {
        let mut current = self.row.lock();
        match current.as_ref() {
            Some(row) if row.token == token => {
                *current = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
