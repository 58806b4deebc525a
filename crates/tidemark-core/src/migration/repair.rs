//! Ledger maintenance: repair and baseline.

use tracing::{info, warn};

use super::descriptor::MigrationKind;
use super::error::{MigrationError, Result};
use super::executor::MigrationExecutor;
use super::info::MigrationState;
use crate::history::{NewHistoryRecord, RecordUpdate};
use crate::version::Version;

/// What [`MigrationExecutor::repair`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Failed rows deleted.
    pub removed_failed: usize,
    /// Identities whose checksum, description or kind were realigned.
    pub aligned: Vec<String>,
    /// Whether an interrupted-attempt marker was dropped.
    pub interrupted_cleared: bool,
}

impl RepairReport {
    /// Whether repair found nothing to do.
    pub fn is_noop(&self) -> bool {
        self.removed_failed == 0 && self.aligned.is_empty() && !self.interrupted_cleared
    }
}

impl MigrationExecutor {
    /// Remove failed rows and realign applied rows with the resolvable migrations.
    ///
    /// The schema objects a partially applied migration left behind are not touched.
    pub fn repair(&self) -> Result<RepairReport> {
        let store = self.store();
        store.create_if_absent()?;
        let _lock = self.acquire_lock()?;
        let mut report = RepairReport::default();

        if let Some(marker) = store.interrupted_attempt()? {
            warn!(migration = ?marker.key(), "Clearing interrupted attempt marker");
            store.clear_attempt()?;
            report.interrupted_cleared = true;
        }

        report.removed_failed = store.remove_failed()?;

        let history = store.all()?;
        let infos = self.resolve(&history, &self.config().target);
        for info in infos.with_state(MigrationState::Success) {
            let (Some(descriptor), Some(record)) = (info.descriptor(), info.record()) else {
                continue;
            };
            if record.kind != MigrationKind::Versioned {
                continue;
            }
            let drifted = record.checksum.as_ref() != descriptor.checksum()
                || record.description != descriptor.description()
                || record.kind != descriptor.kind();
            if drifted {
                store.update(
                    record.installed_rank,
                    RecordUpdate {
                        description: descriptor.description().to_string(),
                        kind: descriptor.kind(),
                        checksum: descriptor.checksum().cloned(),
                    },
                )?;
                report.aligned.push(info.key().to_string());
            }
        }

        info!(
            removed_failed = report.removed_failed,
            aligned = report.aligned.len(),
            interrupted_cleared = report.interrupted_cleared,
            "Repair complete"
        );
        Ok(report)
    }

    /// Mark an existing schema as being at the configured baseline version.
    ///
    /// Returns the rank of the new row, or `None` when the same baseline is already
    /// recorded.
    pub fn baseline(&self) -> Result<Option<u64>> {
        let store = self.store();
        store.create_if_absent()?;
        let _lock = self.acquire_lock()?;

        let version = self.config().baseline_version.clone();
        let description = self.config().baseline_description.clone();
        if version.is_empty_schema() || version.is_latest() {
            return Err(MigrationError::BaselineConflict(format!(
                "{} is not a valid baseline version",
                version
            )));
        }

        let history = store.all()?;
        if let Some(existing) = history.iter().find(|r| r.kind == MigrationKind::Baseline) {
            if existing.version.as_ref() == Some(&version) && existing.description == description {
                info!(version = %version, "Baseline already recorded");
                return Ok(None);
            }
            return Err(MigrationError::BaselineConflict(format!(
                "schema history already has baseline {}",
                existing.version.as_ref().unwrap_or(&Version::EMPTY)
            )));
        }
        if !history.is_empty() {
            return Err(MigrationError::BaselineConflict(format!(
                "schema history already contains {} migration(s)",
                history.len()
            )));
        }

        let rank = store.append(NewHistoryRecord {
            version: Some(version.clone()),
            script: description.clone(),
            description,
            kind: MigrationKind::Baseline,
            checksum: None,
            installed_by: self.config().principal(),
            installed_on: self.now(),
            execution_time_ms: 0,
            success: true,
        })?;
        info!(version = %version, rank, "Baseline recorded");
        Ok(Some(rank))
    }
}
