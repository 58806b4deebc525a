//! Retry of transient failures.
//!
//! Only wrap units of work that are fully rolled back on failure. The policy cannot
//! tell whether a retry would repeat side effects.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::{MigrationError, Result};

/// Retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub backoff_ms: u64,
    /// Upper bound for the doubling delay.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            backoff_ms: 100,
            max_backoff_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Set the attempt bound.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the initial backoff.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff_ms = backoff.as_millis() as u64;
        self
    }
}

type TransientPredicate = Arc<dyn Fn(&MigrationError) -> bool + Send + Sync>;

/// Runs a unit of work again while it fails transiently.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Duration,
    max_backoff: Duration,
    is_transient: TransientPredicate,
}

impl RetryPolicy {
    /// Policy from settings, retrying whatever [`MigrationError::is_transient`] accepts.
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms.max(config.backoff_ms)),
            is_transient: Arc::new(MigrationError::is_transient),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(&RetryConfig::default().with_max_attempts(1))
    }

    /// Replace the transient-error predicate.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&MigrationError) -> bool + Send + Sync + 'static,
    {
        self.is_transient = Arc::new(predicate);
        self
    }

    /// Attempt bound.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt bound is hit.
    ///
    /// Permanent failures come back unchanged on first occurrence. Exhaustion returns
    /// [`MigrationError::RetriesExhausted`] wrapping the last failure.
    pub fn execute<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if !(self.is_transient)(&e) => return Err(e),
                Err(e) if attempt >= self.max_attempts => {
                    if self.max_attempts == 1 {
                        return Err(e);
                    }
                    return Err(MigrationError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    thread::sleep(delay);
                    delay = (delay * 2).min(self.max_backoff);
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("max_backoff", &self.max_backoff)
            .finish_non_exhaustive()
    }
}
