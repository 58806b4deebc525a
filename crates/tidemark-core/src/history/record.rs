//! Ledger rows.

use serde::{Deserialize, Serialize};

use crate::migration::descriptor::{Checksum, MigrationDescriptor, MigrationKey, MigrationKind};
use crate::version::Version;

/// Longest description kept in the ledger.
pub const MAX_DESCRIPTION_LEN: usize = 200;

/// Longest script identifier kept in the ledger.
pub const MAX_SCRIPT_LEN: usize = 1000;

/// One applied (or attempted) migration, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Insertion order, assigned by the store. Starts at 1, never reused.
    pub installed_rank: u64,
    /// Version, absent for repeatables.
    pub version: Option<Version>,
    /// Description.
    pub description: String,
    /// Migration kind.
    pub kind: MigrationKind,
    /// Script identifier.
    pub script: String,
    /// Content checksum, absent for kinds without content.
    pub checksum: Option<Checksum>,
    /// Principal that applied the migration.
    pub installed_by: String,
    /// When the attempt finished (microseconds since epoch).
    pub installed_on: u64,
    /// Wall time of the attempt in milliseconds.
    pub execution_time_ms: u64,
    /// Whether the attempt succeeded.
    pub success: bool,
}

impl HistoryRecord {
    /// Identity key. `None` only for a versioned kind stored without a version.
    pub fn key(&self) -> Option<MigrationKey> {
        MigrationKey::new(self.kind, self.version.as_ref(), &self.description)
    }

    /// Whether this row counts toward the current schema version.
    pub fn is_versioned(&self) -> bool {
        matches!(self.kind, MigrationKind::Versioned | MigrationKind::Baseline)
    }
}

/// A row to append. The store assigns the rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewHistoryRecord {
    /// Version, absent for repeatables.
    pub version: Option<Version>,
    /// Description.
    pub description: String,
    /// Migration kind.
    pub kind: MigrationKind,
    /// Script identifier.
    pub script: String,
    /// Content checksum.
    pub checksum: Option<Checksum>,
    /// Principal.
    pub installed_by: String,
    /// Timestamp (microseconds since epoch).
    pub installed_on: u64,
    /// Wall time of the attempt in milliseconds.
    pub execution_time_ms: u64,
    /// Whether the attempt succeeded.
    pub success: bool,
}

impl NewHistoryRecord {
    /// Row for an attempt at `descriptor`.
    pub fn for_descriptor(
        descriptor: &MigrationDescriptor,
        installed_by: impl Into<String>,
        installed_on: u64,
        execution_time_ms: u64,
        success: bool,
    ) -> Self {
        Self {
            version: descriptor.version().cloned(),
            description: descriptor.description().to_string(),
            kind: descriptor.kind(),
            script: descriptor.script().to_string(),
            checksum: descriptor.checksum().cloned(),
            installed_by: installed_by.into(),
            installed_on,
            execution_time_ms,
            success,
        }
    }

    /// Clip description and script to the ledger's column widths.
    pub fn abbreviated(mut self) -> Self {
        self.description = abbreviate(&self.description, MAX_DESCRIPTION_LEN);
        self.script = abbreviate(&self.script, MAX_SCRIPT_LEN);
        self
    }

    /// Attach the rank assigned by the store.
    pub fn into_record(self, installed_rank: u64) -> HistoryRecord {
        HistoryRecord {
            installed_rank,
            version: self.version,
            description: self.description,
            kind: self.kind,
            script: self.script,
            checksum: self.checksum,
            installed_by: self.installed_by,
            installed_on: self.installed_on,
            execution_time_ms: self.execution_time_ms,
            success: self.success,
        }
    }
}

/// Fields repair may rewrite on an existing row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordUpdate {
    /// New description.
    pub description: String,
    /// New kind.
    pub kind: MigrationKind,
    /// New checksum.
    pub checksum: Option<Checksum>,
}

impl RecordUpdate {
    /// Apply to a record in place.
    pub fn apply_to(&self, record: &mut HistoryRecord) {
        record.description = abbreviate(&self.description, MAX_DESCRIPTION_LEN);
        record.kind = self.kind;
        record.checksum = self.checksum.clone();
    }
}

/// Marker written before a migration runs and cleared once its outcome is appended.
///
/// Finding one on a later run means the process died mid-attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptMarker {
    /// Version of the attempted migration.
    pub version: Option<Version>,
    /// Description.
    pub description: String,
    /// Kind.
    pub kind: MigrationKind,
    /// Script identifier.
    pub script: String,
    /// Checksum.
    pub checksum: Option<Checksum>,
    /// Whether the attempt ran inside a rollback-capable transaction.
    pub transactional: bool,
    /// Principal.
    pub installed_by: String,
    /// When the attempt began (microseconds since epoch).
    pub started_on: u64,
}

impl AttemptMarker {
    /// Marker for an attempt at `descriptor`.
    pub fn for_descriptor(
        descriptor: &MigrationDescriptor,
        transactional: bool,
        installed_by: impl Into<String>,
        started_on: u64,
    ) -> Self {
        Self {
            version: descriptor.version().cloned(),
            description: descriptor.description().to_string(),
            kind: descriptor.kind(),
            script: descriptor.script().to_string(),
            checksum: descriptor.checksum().cloned(),
            transactional,
            installed_by: installed_by.into(),
            started_on,
        }
    }

    /// Identity key of the attempted migration.
    pub fn key(&self) -> Option<MigrationKey> {
        MigrationKey::new(self.kind, self.version.as_ref(), &self.description)
    }

    /// Failed ledger row standing in for the interrupted attempt.
    pub fn into_failed_record(self, installed_on: u64) -> NewHistoryRecord {
        NewHistoryRecord {
            version: self.version,
            description: self.description,
            kind: self.kind,
            script: self.script,
            checksum: self.checksum,
            installed_by: self.installed_by,
            installed_on,
            execution_time_ms: installed_on.saturating_sub(self.started_on) / 1000,
            success: false,
        }
    }
}

/// Truncate to `max` characters, ending in `...` when clipped.
pub fn abbreviate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut clipped: String = text.chars().take(keep).collect();
    clipped.push_str("...");
    clipped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abbreviate() {
        assert_eq!(abbreviate("short", 10), "short");
        assert_eq!(abbreviate("exactly-10", 10), "exactly-10");
        assert_eq!(abbreviate("this is too long", 10), "this is...");
        assert_eq!(abbreviate(&"x".repeat(500), MAX_DESCRIPTION_LEN).chars().count(), 200);
    }

    #[test]
    fn test_new_record_abbreviated() {
        let record = NewHistoryRecord {
            version: None,
            description: "d".repeat(250),
            kind: MigrationKind::Repeatable,
            script: "s".repeat(1200),
            checksum: None,
            installed_by: "ops".into(),
            installed_on: 1,
            execution_time_ms: 0,
            success: true,
        }
        .abbreviated();
        assert_eq!(record.description.len(), MAX_DESCRIPTION_LEN);
        assert!(record.description.ends_with("..."));
        assert_eq!(record.script.len(), MAX_SCRIPT_LEN);
    }

    #[test]
    fn test_record_key() {
        let record = NewHistoryRecord {
            version: Some(Version::parse("2").unwrap()),
            description: "two".into(),
            kind: MigrationKind::Baseline,
            script: String::new(),
            checksum: None,
            installed_by: "ops".into(),
            installed_on: 1,
            execution_time_ms: 0,
            success: true,
        }
        .into_record(7);
        assert_eq!(record.installed_rank, 7);
        assert!(record.is_versioned());
        assert_eq!(
            record.key(),
            Some(MigrationKey::Versioned(Version::parse("2").unwrap()))
        );
    }

    #[test]
    fn test_marker_into_failed_record() {
        let marker = AttemptMarker {
            version: Some(Version::parse("3").unwrap()),
            description: "three".into(),
            kind: MigrationKind::Versioned,
            script: "V3__three.sql".into(),
            checksum: Some(Checksum::new("abc")),
            transactional: false,
            installed_by: "ops".into(),
            started_on: 1_000_000,
        };
        let failed = marker.into_failed_record(3_500_000);
        assert!(!failed.success);
        assert_eq!(failed.execution_time_ms, 2500);
        assert_eq!(failed.script, "V3__three.sql");
    }
}
