//! Schema history persisted in sled.
//!
//! Layout:
//!
//! - `history:records`: big-endian rank -> rkyv-encoded [`StoredRecord`]
//! - `history:meta`: creation flag, last assigned rank, in-flight attempt marker
//! - `history:lock`: the single lock row of the polling strategy
//!
//! Appends update the records and the rank counter in one multi-tree transaction, so a
//! crash can never leave a row without its rank or a rank without its row.

use std::sync::Arc;

use rkyv::{Archive, Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;

use super::lock::{row_lock_guard, HistoryLock, LockConfig, LockMode, LockRow, LockTable, NativeLock};
use super::record::{AttemptMarker, HistoryRecord, NewHistoryRecord, RecordUpdate};
use super::SchemaHistoryStore;
use crate::error::{Error, Result};
use crate::migration::descriptor::{Checksum, MigrationKind};
use crate::version::Version;

const CREATED_KEY: &[u8] = b"created";
const LAST_RANK_KEY: &[u8] = b"last_rank";
const ATTEMPT_KEY: &[u8] = b"attempt";
const LOCK_KEY: &[u8] = b"lock";

/// On-disk form of a [`HistoryRecord`].
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Insertion rank.
    pub installed_rank: u64,
    /// Version text.
    pub version: Option<String>,
    /// Description.
    pub description: String,
    /// Kind name.
    pub kind: String,
    /// Script identifier.
    pub script: String,
    /// Checksum text.
    pub checksum: Option<String>,
    /// Principal.
    pub installed_by: String,
    /// Timestamp (microseconds since epoch).
    pub installed_on: u64,
    /// Execution time in milliseconds.
    pub execution_time_ms: u64,
    /// Outcome.
    pub success: bool,
}

impl StoredRecord {
    fn from_record(record: &HistoryRecord) -> Self {
        Self {
            installed_rank: record.installed_rank,
            version: record.version.as_ref().and_then(|v| v.as_str().map(str::to_string)),
            description: record.description.clone(),
            kind: record.kind.as_str().to_string(),
            script: record.script.clone(),
            checksum: record.checksum.as_ref().map(|c| c.as_str().to_string()),
            installed_by: record.installed_by.clone(),
            installed_on: record.installed_on,
            execution_time_ms: record.execution_time_ms,
            success: record.success,
        }
    }

    fn into_record(self) -> Result<HistoryRecord> {
        Ok(HistoryRecord {
            installed_rank: self.installed_rank,
            version: decode_version(self.version)?,
            description: self.description,
            kind: decode_kind(&self.kind)?,
            script: self.script,
            checksum: self.checksum.map(Checksum::new),
            installed_by: self.installed_by,
            installed_on: self.installed_on,
            execution_time_ms: self.execution_time_ms,
            success: self.success,
        })
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// On-disk form of an [`AttemptMarker`].
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
struct StoredAttempt {
    version: Option<String>,
    description: String,
    kind: String,
    script: String,
    checksum: Option<String>,
    transactional: bool,
    installed_by: String,
    started_on: u64,
}

impl StoredAttempt {
    fn from_marker(marker: &AttemptMarker) -> Self {
        Self {
            version: marker.version.as_ref().and_then(|v| v.as_str().map(str::to_string)),
            description: marker.description.clone(),
            kind: marker.kind.as_str().to_string(),
            script: marker.script.clone(),
            checksum: marker.checksum.as_ref().map(|c| c.as_str().to_string()),
            transactional: marker.transactional,
            installed_by: marker.installed_by.clone(),
            started_on: marker.started_on,
        }
    }

    fn into_marker(self) -> Result<AttemptMarker> {
        Ok(AttemptMarker {
            version: decode_version(self.version)?,
            description: self.description,
            kind: decode_kind(&self.kind)?,
            script: self.script,
            checksum: self.checksum.map(Checksum::new),
            transactional: self.transactional,
            installed_by: self.installed_by,
            started_on: self.started_on,
        })
    }
}

fn decode_version(text: Option<String>) -> Result<Option<Version>> {
    text.map(|t| Version::parse(&t).map_err(|e| Error::InvalidData(e.to_string())))
        .transpose()
}

fn decode_kind(name: &str) -> Result<MigrationKind> {
    MigrationKind::from_name(name).ok_or_else(|| Error::InvalidData(format!("unknown migration kind {:?}", name)))
}

fn decode_rank(bytes: &[u8]) -> Result<u64> {
    let array: [u8; 8] = bytes.try_into().map_err(|_| Error::InvalidKey)?;
    Ok(u64::from_be_bytes(array))
}

/// Schema history stored in a sled database.
///
/// The native lock is process-local, which matches sled's single-process ownership of a
/// database directory.
pub struct SledHistory {
    records: sled::Tree,
    meta: sled::Tree,
    lock: Arc<SledLockTable>,
    native: NativeLock,
}

impl SledHistory {
    /// Tree holding ledger rows.
    pub const RECORDS_TREE: &'static str = "history:records";
    /// Tree holding ledger metadata.
    pub const META_TREE: &'static str = "history:meta";
    /// Tree holding the lock row.
    pub const LOCK_TREE: &'static str = "history:lock";

    /// Open the history trees in `db`.
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            records: db.open_tree(Self::RECORDS_TREE)?,
            meta: db.open_tree(Self::META_TREE)?,
            lock: Arc::new(SledLockTable {
                tree: db.open_tree(Self::LOCK_TREE)?,
            }),
            native: NativeLock::new(),
        })
    }

    /// Storage of the polling lock row.
    pub fn lock_table(&self) -> &SledLockTable {
        &self.lock
    }
}

impl SchemaHistoryStore for SledHistory {
    fn exists(&self) -> Result<bool> {
        Ok(self.meta.contains_key(CREATED_KEY)?)
    }

    fn create_if_absent(&self) -> Result<()> {
        // A lost race leaves the flag set by the winner, which is all we need.
        let _ = self
            .meta
            .compare_and_swap(CREATED_KEY, None::<&[u8]>, Some(vec![1u8]))?;
        self.meta.flush()?;
        Ok(())
    }

    fn lock(&self, mode: LockMode, config: &LockConfig) -> Result<HistoryLock<'_>> {
        match mode {
            LockMode::Native => self.native.guard(config.acquire_timeout()),
            LockMode::PollingRow => row_lock_guard(Arc::clone(&self.lock), config),
        }
    }

    fn all(&self) -> Result<Vec<HistoryRecord>> {
        let mut records = Vec::new();
        for entry in self.records.iter() {
            let (_, value) = entry?;
            records.push(StoredRecord::from_bytes(&value)?.into_record()?);
        }
        Ok(records)
    }

    fn latest(&self) -> Result<Option<HistoryRecord>> {
        for entry in self.records.iter().rev() {
            let (_, value) = entry?;
            let record = StoredRecord::from_bytes(&value)?;
            if record.success {
                return Ok(Some(record.into_record()?));
            }
        }
        Ok(None)
    }

    fn append(&self, record: NewHistoryRecord) -> Result<u64> {
        let record = record.abbreviated();

        let result: std::result::Result<u64, TransactionError<Error>> =
            (&self.records, &self.meta).transaction(|(records, meta)| {
                if meta.get(CREATED_KEY)?.is_none() {
                    return Err(ConflictableTransactionError::Abort(Error::InvalidData(
                        "schema history does not exist".into(),
                    )));
                }
                let last = match meta.get(LAST_RANK_KEY)? {
                    Some(bytes) => decode_rank(&bytes).map_err(ConflictableTransactionError::Abort)?,
                    None => 0,
                };
                let rank = last + 1;
                let bytes = StoredRecord::from_record(&record.clone().into_record(rank))
                    .to_bytes()
                    .map_err(ConflictableTransactionError::Abort)?;
                records.insert(rank.to_be_bytes().to_vec(), bytes)?;
                meta.insert(LAST_RANK_KEY.to_vec(), rank.to_be_bytes().to_vec())?;
                Ok(rank)
            });

        let rank = match result {
            Ok(rank) => rank,
            Err(TransactionError::Abort(e)) => return Err(e),
            Err(TransactionError::Storage(e)) => return Err(Error::Storage(e)),
        };
        self.records.flush()?;
        Ok(rank)
    }

    fn remove_failed(&self) -> Result<usize> {
        let mut failed = Vec::new();
        for entry in self.records.iter() {
            let (key, value) = entry?;
            if !StoredRecord::from_bytes(&value)?.success {
                failed.push(key);
            }
        }
        for key in &failed {
            self.records.remove(key)?;
        }
        self.records.flush()?;
        Ok(failed.len())
    }

    fn update(&self, rank: u64, update: RecordUpdate) -> Result<()> {
        let key = rank.to_be_bytes();
        let bytes = self
            .records
            .get(key)?
            .ok_or_else(|| Error::InvalidData(format!("no schema history row with rank {}", rank)))?;
        let mut record = StoredRecord::from_bytes(&bytes)?.into_record()?;
        update.apply_to(&mut record);
        self.records
            .insert(key, StoredRecord::from_record(&record).to_bytes()?)?;
        self.records.flush()?;
        Ok(())
    }

    fn record_attempt(&self, marker: &AttemptMarker) -> Result<()> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&StoredAttempt::from_marker(marker))
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))?;
        self.meta.insert(ATTEMPT_KEY, bytes)?;
        self.meta.flush()?;
        Ok(())
    }

    fn clear_attempt(&self) -> Result<()> {
        self.meta.remove(ATTEMPT_KEY)?;
        self.meta.flush()?;
        Ok(())
    }

    fn interrupted_attempt(&self) -> Result<Option<AttemptMarker>> {
        match self.meta.get(ATTEMPT_KEY)? {
            Some(bytes) => {
                let stored = rkyv::from_bytes::<StoredAttempt, rkyv::rancor::Error>(&bytes)
                    .map_err(|e| Error::Deserialization(e.to_string()))?;
                Ok(Some(stored.into_marker()?))
            }
            None => Ok(None),
        }
    }
}

/// The polling lock row, kept in its own tree.
pub struct SledLockTable {
    tree: sled::Tree,
}

impl LockTable for SledLockTable {
    fn insert_lock_row(&self, row: &LockRow) -> Result<bool> {
        let swapped = self
            .tree
            .compare_and_swap(LOCK_KEY, None::<&[u8]>, Some(row.encode()))?;
        Ok(swapped.is_ok())
    }

    fn current_lock_row(&self) -> Result<Option<LockRow>> {
        self.tree.get(LOCK_KEY)?.map(|bytes| LockRow::decode(&bytes)).transpose()
    }

    fn replace_lock_row(&self, expected: &LockRow, row: &LockRow) -> Result<bool> {
        let swapped = self
            .tree
            .compare_and_swap(LOCK_KEY, Some(expected.encode()), Some(row.encode()))?;
        Ok(swapped.is_ok())
    }

    fn delete_lock_row(&self, token: &str) -> Result<bool> {
        let Some(current) = self.current_lock_row()? else {
            return Ok(false);
        };
        if current.token != token {
            return Ok(false);
        }
        let swapped = self
            .tree
            .compare_and_swap(LOCK_KEY, Some(current.encode()), None::<Vec<u8>>)?;
        Ok(swapped.is_ok())
    }
}
