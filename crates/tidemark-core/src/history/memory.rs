//! In-memory schema history.

use std::sync::Arc;

use parking_lot::Mutex;

use super::lock::{row_lock_guard, HistoryLock, LockConfig, LockMode, MemoryLockTable, NativeLock};
use super::record::{AttemptMarker, HistoryRecord, NewHistoryRecord, RecordUpdate};
use super::SchemaHistoryStore;
use crate::error::{Error, Result};

#[derive(Default)]
struct Ledger {
    created: bool,
    records: Vec<HistoryRecord>,
    last_rank: u64,
    attempt: Option<AttemptMarker>,
}

/// Schema history held in process memory.
///
/// Shared between threads through an `Arc`, it behaves like one database seen by many
/// connections.
#[derive(Default)]
pub struct InMemoryHistory {
    ledger: Mutex<Ledger>,
    native: NativeLock,
    lock_table: Arc<MemoryLockTable>,
}

impl InMemoryHistory {
    /// An empty, not yet created ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage of the polling lock row.
    pub fn lock_table(&self) -> &MemoryLockTable {
        &self.lock_table
    }
}

impl SchemaHistoryStore for InMemoryHistory {
    fn exists(&self) -> Result<bool> {
        Ok(self.ledger.lock().created)
    }

    fn create_if_absent(&self) -> Result<()> {
        self.ledger.lock().created = true;
        Ok(())
    }

    fn lock(&self, mode: LockMode, config: &LockConfig) -> Result<HistoryLock<'_>> {
        match mode {
            LockMode::Native => self.native.guard(config.acquire_timeout()),
            LockMode::PollingRow => row_lock_guard(Arc::clone(&self.lock_table), config),
        }
    }

    fn all(&self) -> Result<Vec<HistoryRecord>> {
        Ok(self.ledger.lock().records.clone())
    }

    fn append(&self, record: NewHistoryRecord) -> Result<u64> {
        let mut ledger = self.ledger.lock();
        if !ledger.created {
            return Err(Error::InvalidData("schema history does not exist".into()));
        }
        ledger.last_rank += 1;
        let rank = ledger.last_rank;
        ledger.records.push(record.abbreviated().into_record(rank));
        Ok(rank)
    }

    fn remove_failed(&self) -> Result<usize> {
        let mut ledger = self.ledger.lock();
        let before = ledger.records.len();
        ledger.records.retain(|r| r.success);
        Ok(before - ledger.records.len())
    }

    fn update(&self, rank: u64, update: RecordUpdate) -> Result<()> {
        let mut ledger = self.ledger.lock();
        let record = ledger
            .records
            .iter_mut()
            .find(|r| r.installed_rank == rank)
            .ok_or_else(|| Error::InvalidData(format!("no schema history row with rank {}", rank)))?;
        update.apply_to(record);
        Ok(())
    }

    fn record_attempt(&self, marker: &AttemptMarker) -> Result<()> {
        self.ledger.lock().attempt = Some(marker.clone());
        Ok(())
    }

    fn clear_attempt(&self) -> Result<()> {
        self.ledger.lock().attempt = None;
        Ok(())
    }

    fn interrupted_attempt(&self) -> Result<Option<AttemptMarker>> {
        Ok(self.ledger.lock().attempt.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::lock::LockTable;
    use crate::migration::descriptor::MigrationKind;
    use crate::version::Version;
    use std::time::Duration;

    fn new_record(version: &str, success: bool) -> NewHistoryRecord {
        NewHistoryRecord {
            version: Some(Version::parse(version).unwrap()),
            description: format!("v{}", version),
            kind: MigrationKind::Versioned,
            script: format!("V{}__v.sql", version),
            checksum: None,
            installed_by: "test".into(),
            installed_on: 1,
            execution_time_ms: 0,
            success,
        }
    }

    #[test]
    fn test_create_if_absent_is_idempotent() {
        let store = InMemoryHistory::new();
        assert!(!store.exists().unwrap());
        store.create_if_absent().unwrap();
        store.create_if_absent().unwrap();
        assert!(store.exists().unwrap());
    }

    #[test]
    fn test_append_requires_ledger() {
        let store = InMemoryHistory::new();
        assert!(store.append(new_record("1", true)).is_err());
    }

    #[test]
    fn test_ranks_never_reused() {
        let store = InMemoryHistory::new();
        store.create_if_absent().unwrap();
        assert_eq!(store.append(new_record("1", true)).unwrap(), 1);
        assert_eq!(store.append(new_record("2", false)).unwrap(), 2);
        assert_eq!(store.remove_failed().unwrap(), 1);
        assert_eq!(store.append(new_record("2", true)).unwrap(), 3);

        let ranks: Vec<u64> = store.all().unwrap().iter().map(|r| r.installed_rank).collect();
        assert_eq!(ranks, vec![1, 3]);
    }

    #[test]
    fn test_latest_skips_failed() {
        let store = InMemoryHistory::new();
        store.create_if_absent().unwrap();
        store.append(new_record("1", true)).unwrap();
        store.append(new_record("2", false)).unwrap();
        assert_eq!(store.latest().unwrap().unwrap().installed_rank, 1);
    }

    #[test]
    fn test_update_row() {
        let store = InMemoryHistory::new();
        store.create_if_absent().unwrap();
        let rank = store.append(new_record("1", true)).unwrap();
        store
            .update(
                rank,
                RecordUpdate {
                    description: "renamed".into(),
                    kind: MigrationKind::Versioned,
                    checksum: None,
                },
            )
            .unwrap();
        assert_eq!(store.all().unwrap()[0].description, "renamed");
        assert!(store
            .update(
                99,
                RecordUpdate {
                    description: String::new(),
                    kind: MigrationKind::Versioned,
                    checksum: None
                }
            )
            .is_err());
    }

    #[test]
    fn test_both_lock_modes() {
        let store = InMemoryHistory::new();
        let config = LockConfig::default()
            .with_poll_interval(Duration::from_millis(1))
            .with_acquire_timeout(Duration::from_millis(20));

        let native = store.lock(LockMode::Native, &config).unwrap();
        assert!(store.lock(LockMode::Native, &config).is_err());
        drop(native);

        let row = store.lock(LockMode::PollingRow, &config).unwrap();
        assert!(store.lock_table().current_lock_row().unwrap().is_some());
        assert!(matches!(
            store.lock(LockMode::PollingRow, &config),
            Err(Error::LockTimeout { .. })
        ));
        drop(row);
        assert!(store.lock_table().current_lock_row().unwrap().is_none());
    }

    #[test]
    fn test_attempt_marker_lifecycle() {
        let store = InMemoryHistory::new();
        assert!(store.interrupted_attempt().unwrap().is_none());
        let marker = AttemptMarker {
            version: Some(Version::parse("1").unwrap()),
            description: "one".into(),
            kind: MigrationKind::Versioned,
            script: String::new(),
            checksum: None,
            transactional: true,
            installed_by: "test".into(),
            started_on: 5,
        };
        store.record_attempt(&marker).unwrap();
        assert_eq!(store.interrupted_attempt().unwrap(), Some(marker));
        store.clear_attempt().unwrap();
        assert!(store.interrupted_attempt().unwrap().is_none());
    }
}
