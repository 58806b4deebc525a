//! Reconciled view of one migration: descriptor, ledger row, or both.

use std::fmt;

use super::descriptor::{Checksum, MigrationDescriptor, MigrationKey, MigrationKind};
use crate::history::HistoryRecord;
use crate::version::Version;

/// Derived state of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationState {
    /// Resolvable and waiting to be applied.
    Pending,
    /// Resolvable, but above the target version.
    AboveTarget,
    /// Resolvable, at or below the baseline. Never applied.
    BelowBaseline,
    /// The baseline marker row.
    Baseline,
    /// Excluded by an ignore pattern or by its executable.
    Ignored,
    /// Applied successfully, no longer resolvable.
    MissingSuccess,
    /// Failed, no longer resolvable.
    MissingFailed,
    /// Applied successfully.
    Success,
    /// Undo migration, listed but never applied by migrate.
    Available,
    /// Attempted and failed.
    Failed,
    /// Resolvable, below a version that is already applied.
    OutOfOrder,
    /// Applied successfully, newer than anything resolvable.
    FutureSuccess,
    /// Failed, newer than anything resolvable.
    FutureFailed,
    /// An older ledger row of an identity with a newer row.
    Superseded,
}

impl MigrationState {
    /// Human readable name.
    pub fn display_name(&self) -> &'static str {
        match self {
            MigrationState::Pending => "Pending",
            MigrationState::AboveTarget => "Above Target",
            MigrationState::BelowBaseline => "Below Baseline",
            MigrationState::Baseline => "Baseline",
            MigrationState::Ignored => "Ignored",
            MigrationState::MissingSuccess => "Missing",
            MigrationState::MissingFailed => "Failed (Missing)",
            MigrationState::Success => "Success",
            MigrationState::Available => "Available",
            MigrationState::Failed => "Failed",
            MigrationState::OutOfOrder => "Out of Order",
            MigrationState::FutureSuccess => "Future",
            MigrationState::FutureFailed => "Failed (Future)",
            MigrationState::Superseded => "Superseded",
        }
    }

    /// Whether a ledger row backs this state.
    pub fn is_applied(&self) -> bool {
        matches!(
            self,
            MigrationState::Baseline
                | MigrationState::MissingSuccess
                | MigrationState::MissingFailed
                | MigrationState::Success
                | MigrationState::Failed
                | MigrationState::FutureSuccess
                | MigrationState::FutureFailed
                | MigrationState::Superseded
        )
    }

    /// Whether this state records a failure.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            MigrationState::Failed | MigrationState::MissingFailed | MigrationState::FutureFailed
        )
    }

    /// Whether a descriptor is expected to back this state.
    pub fn is_resolved(&self) -> bool {
        !matches!(
            self,
            MigrationState::MissingSuccess
                | MigrationState::MissingFailed
                | MigrationState::FutureSuccess
                | MigrationState::FutureFailed
        )
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// One reconciled migration.
#[derive(Debug, Clone)]
pub struct MigrationInfo {
    key: MigrationKey,
    state: MigrationState,
    descriptor: Option<MigrationDescriptor>,
    record: Option<HistoryRecord>,
    applied_out_of_order: bool,
}

impl MigrationInfo {
    pub(crate) fn new(
        key: MigrationKey,
        state: MigrationState,
        descriptor: Option<MigrationDescriptor>,
        record: Option<HistoryRecord>,
    ) -> Self {
        debug_assert!(descriptor.is_some() || record.is_some());
        Self {
            key,
            state,
            descriptor,
            record,
            applied_out_of_order: false,
        }
    }

    pub(crate) fn with_applied_out_of_order(mut self, flag: bool) -> Self {
        self.applied_out_of_order = flag;
        self
    }

    /// Identity key.
    pub fn key(&self) -> &MigrationKey {
        &self.key
    }

    /// Derived state.
    pub fn state(&self) -> MigrationState {
        self.state
    }

    /// The resolvable side, if any.
    pub fn descriptor(&self) -> Option<&MigrationDescriptor> {
        self.descriptor.as_ref()
    }

    /// The ledger side, if any.
    pub fn record(&self) -> Option<&HistoryRecord> {
        self.record.as_ref()
    }

    /// Version, preferring the ledger.
    pub fn version(&self) -> Option<&Version> {
        match &self.record {
            Some(r) => r.version.as_ref(),
            None => self.descriptor.as_ref().and_then(|d| d.version()),
        }
    }

    /// Description, preferring the ledger.
    pub fn description(&self) -> &str {
        match (&self.record, &self.descriptor) {
            (Some(r), _) => &r.description,
            (None, Some(d)) => d.description(),
            (None, None) => "",
        }
    }

    /// Checksum, preferring the ledger.
    pub fn checksum(&self) -> Option<&Checksum> {
        match &self.record {
            Some(r) => r.checksum.as_ref(),
            None => self.descriptor.as_ref().and_then(|d| d.checksum()),
        }
    }

    /// Kind, preferring the ledger.
    pub fn kind(&self) -> MigrationKind {
        match (&self.record, &self.descriptor) {
            (Some(r), _) => r.kind,
            (None, Some(d)) => d.kind(),
            (None, None) => MigrationKind::Versioned,
        }
    }

    /// Script identifier, preferring the ledger.
    pub fn script(&self) -> &str {
        match (&self.record, &self.descriptor) {
            (Some(r), _) => &r.script,
            (None, Some(d)) => d.script(),
            (None, None) => "",
        }
    }

    /// Rank of the backing ledger row.
    pub fn installed_rank(&self) -> Option<u64> {
        self.record.as_ref().map(|r| r.installed_rank)
    }

    /// Whether the migration was applied after a higher version.
    pub fn applied_out_of_order(&self) -> bool {
        self.applied_out_of_order
    }
}

impl fmt::Display for MigrationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version() {
            Some(v) => write!(f, "{} | {} | {} | {}", v, self.description(), self.kind(), self.state),
            None => write!(f, "  | {} | {} | {}", self.description(), self.kind(), self.state),
        }
    }
}

/// Ordered migration infos plus the versions they were derived against.
#[derive(Debug, Clone)]
pub struct MigrationInfoSet {
    pub(crate) infos: Vec<MigrationInfo>,
    pub(crate) current_version: Version,
    pub(crate) last_applied: Version,
    pub(crate) last_resolved: Version,
    pub(crate) baseline: Option<Version>,
}

impl MigrationInfoSet {
    /// All infos in display order.
    pub fn all(&self) -> &[MigrationInfo] {
        &self.infos
    }

    /// Iterate in display order.
    pub fn iter(&self) -> std::slice::Iter<'_, MigrationInfo> {
        self.infos.iter()
    }

    /// Number of infos.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether nothing is resolvable and nothing is applied.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Highest successfully applied versioned or baseline version.
    pub fn current_version(&self) -> &Version {
        &self.current_version
    }

    /// Highest applied versioned version, failed rows included.
    pub fn last_applied(&self) -> &Version {
        &self.last_applied
    }

    /// Highest resolvable versioned version.
    pub fn last_resolved(&self) -> &Version {
        &self.last_resolved
    }

    /// Effective baseline version, if any.
    pub fn baseline(&self) -> Option<&Version> {
        self.baseline.as_ref()
    }

    /// The applied info at the current version.
    pub fn current(&self) -> Option<&MigrationInfo> {
        if self.current_version.is_empty_schema() {
            return None;
        }
        self.infos.iter().find(|i| {
            matches!(i.state(), MigrationState::Success | MigrationState::Baseline | MigrationState::FutureSuccess
                | MigrationState::MissingSuccess)
                && matches!(i.kind(), MigrationKind::Versioned | MigrationKind::Baseline)
                && i.version() == Some(&self.current_version)
        })
    }

    /// Infos in the given state.
    pub fn with_state(&self, state: MigrationState) -> impl Iterator<Item = &MigrationInfo> {
        self.infos.iter().filter(move |i| i.state() == state)
    }

    /// Pending infos.
    pub fn pending(&self) -> impl Iterator<Item = &MigrationInfo> {
        self.with_state(MigrationState::Pending)
    }

    /// Infos backed by a ledger row.
    pub fn applied(&self) -> impl Iterator<Item = &MigrationInfo> {
        self.infos.iter().filter(|i| i.state().is_applied())
    }

    /// Infos recording a failure.
    pub fn failed(&self) -> impl Iterator<Item = &MigrationInfo> {
        self.infos.iter().filter(|i| i.state().is_failed())
    }

    /// Info for an identity, ignoring superseded rows.
    pub fn get(&self, key: &MigrationKey) -> Option<&MigrationInfo> {
        self.infos
            .iter()
            .find(|i| i.key() == key && i.state() != MigrationState::Superseded)
    }
}

impl<'a> IntoIterator for &'a MigrationInfoSet {
    type Item = &'a MigrationInfo;
    type IntoIter = std::slice::Iter<'a, MigrationInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.infos.iter()
    }
}
