//! Schema history: the durable, lockable ledger of migration outcomes.
//!
//! # Stores
//!
//! | Store              | Persistence | Native lock      | Row lock        |
//! |--------------------|-------------|------------------|-----------------|
//! | [`InMemoryHistory`] | none        | mutex + condvar  | [`MemoryLockTable`] |
//! | [`SledHistory`]     | sled trees  | in-process mutex | [`SledLockTable`] (CAS) |
//!
//! Ranks are assigned by the store on append, start at 1 and never repeat.

pub mod lock;
pub mod memory;
pub mod record;
pub mod sled_store;

pub use lock::{HistoryLock, LockConfig, LockMode, LockRow, LockTable, MemoryLockTable, NativeLock};
pub use memory::InMemoryHistory;
pub use record::{AttemptMarker, HistoryRecord, NewHistoryRecord, RecordUpdate};
pub use sled_store::{SledHistory, SledLockTable};

use crate::error::Result;

/// Durable, lockable ledger of [`HistoryRecord`]s.
pub trait SchemaHistoryStore: Send + Sync {
    /// Whether the ledger has been created.
    fn exists(&self) -> Result<bool>;

    /// Create the ledger. A no-op when it already exists, including when another
    /// caller created it concurrently.
    fn create_if_absent(&self) -> Result<()>;

    /// Take the exclusive hold on the ledger. Released when the guard drops.
    fn lock(&self, mode: LockMode, config: &LockConfig) -> Result<HistoryLock<'_>>;

    /// All rows, oldest first.
    fn all(&self) -> Result<Vec<HistoryRecord>>;

    /// Most recently installed successful row.
    fn latest(&self) -> Result<Option<HistoryRecord>> {
        Ok(self.all()?.into_iter().rev().find(|r| r.success))
    }

    /// Persist a row under the next rank and return that rank.
    fn append(&self, record: NewHistoryRecord) -> Result<u64>;

    /// Delete every failed row. Returns how many were removed.
    fn remove_failed(&self) -> Result<usize>;

    /// Rewrite description, kind and checksum of the row at `rank`.
    fn update(&self, rank: u64, update: RecordUpdate) -> Result<()>;

    /// Note that an attempt is starting.
    fn record_attempt(&self, marker: &AttemptMarker) -> Result<()>;

    /// Forget the in-flight attempt.
    fn clear_attempt(&self) -> Result<()>;

    /// An attempt that was started but never cleared.
    fn interrupted_attempt(&self) -> Result<Option<AttemptMarker>>;
}
