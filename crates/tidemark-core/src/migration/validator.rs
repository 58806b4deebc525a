//! Read-only drift detection between the ledger and resolvable migrations.
//!
//! Checks run in order and stop at the first class that finds something:
//!
//! 1. applied rows with no descriptor (missing, and future unless ignored)
//! 2. applied versions against resolved versions, position by position
//! 3. kind mismatches
//! 4. checksum and description mismatches
//! 5. failed rows
//!
//! No lock is taken; results may be stale while another process migrates.

use std::fmt;

use super::descriptor::{Checksum, MigrationKind};
use super::info::{MigrationInfoSet, MigrationState};
use crate::version::Version;

/// Class of a [`Discrepancy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscrepancyKind {
    /// Applied, no longer resolvable.
    Missing,
    /// Applied, newer than anything resolvable.
    Future,
    /// Applied and resolved versions disagree at a position.
    VersionMismatch,
    /// Applied and resolved kinds differ.
    KindMismatch,
    /// Applied and resolved checksums differ.
    ChecksumMismatch,
    /// Applied and resolved descriptions differ.
    DescriptionMismatch,
    /// The ledger records a failure.
    Failed,
}

/// One finding of the validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discrepancy {
    /// Class.
    pub kind: DiscrepancyKind,
    /// Identity of the migration concerned.
    pub identity: String,
    /// Human readable detail.
    pub message: String,
}

impl Discrepancy {
    fn new(kind: DiscrepancyKind, identity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            identity: identity.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.identity, self.message)
    }
}

/// Validation settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatePolicy {
    /// Unapplied migrations below the applied maximum are legitimate.
    pub out_of_order: bool,
    /// Do not report applied rows whose descriptor is gone.
    pub ignore_missing: bool,
    /// Do not report applied rows newer than every descriptor.
    pub ignore_future: bool,
}

/// Compares the ledger with resolvable migrations.
#[derive(Debug, Clone, Copy, Default)]
pub struct Validator {
    policy: ValidatePolicy,
}

impl Validator {
    /// Validator with the given policy.
    pub fn new(policy: ValidatePolicy) -> Self {
        Self { policy }
    }

    /// Every discrepancy of the first failing check class. Empty means clean.
    pub fn validate(&self, infos: &MigrationInfoSet) -> Vec<Discrepancy> {
        let checks: [fn(&Self, &MigrationInfoSet) -> Vec<Discrepancy>; 5] = [
            Self::check_unresolved,
            Self::check_versions,
            Self::check_kinds,
            Self::check_content,
            Self::check_failed,
        ];
        for check in checks {
            let found = check(self, infos);
            if !found.is_empty() {
                return found;
            }
        }
        Vec::new()
    }

    fn check_unresolved(&self, infos: &MigrationInfoSet) -> Vec<Discrepancy> {
        infos
            .iter()
            .filter_map(|info| {
                let identity = info.key().to_string();
                match info.state() {
                    MigrationState::MissingSuccess | MigrationState::MissingFailed if !self.policy.ignore_missing => {
                        Some(Discrepancy::new(
                            DiscrepancyKind::Missing,
                            identity,
                            "applied migration is not resolved locally",
                        ))
                    }
                    MigrationState::FutureSuccess | MigrationState::FutureFailed if !self.policy.ignore_future => {
                        Some(Discrepancy::new(
                            DiscrepancyKind::Future,
                            identity,
                            format!(
                                "applied migration is newer than the latest available version {}",
                                infos.last_resolved()
                            ),
                        ))
                    }
                    _ => None,
                }
            })
            .collect()
    }

    fn check_versions(&self, infos: &MigrationInfoSet) -> Vec<Discrepancy> {
        let mut applied: Vec<&Version> = infos
            .iter()
            .filter(|i| matches!(i.state(), MigrationState::Success | MigrationState::Failed))
            .filter(|i| i.kind() == MigrationKind::Versioned)
            .filter_map(|i| i.version())
            .collect();
        applied.sort();

        let Some(max_applied) = applied.last().copied() else {
            return Vec::new();
        };
        let baseline = infos.baseline();

        let mut resolved: Vec<&Version> = infos
            .iter()
            .filter(|i| i.state() != MigrationState::Superseded)
            .filter(|i| {
                !matches!(
                    i.state(),
                    MigrationState::Ignored | MigrationState::BelowBaseline | MigrationState::Available
                )
            })
            .filter(|i| !(self.policy.out_of_order && i.state() == MigrationState::OutOfOrder))
            .filter_map(|i| i.descriptor())
            .filter(|d| matches!(d.kind(), MigrationKind::Versioned | MigrationKind::Baseline))
            .filter_map(|d| d.version())
            .filter(|v| baseline.map_or(true, |b| *v > b) && *v <= max_applied)
            .collect();
        resolved.sort();

        let len = applied.len().max(resolved.len());
        for position in 0..len {
            let (a, r) = (applied.get(position), resolved.get(position));
            if a != r {
                let identity = match (a, r) {
                    (_, Some(r)) => format!("version {}", r),
                    (Some(a), None) => format!("version {}", a),
                    (None, None) => String::new(),
                };
                let describe = |v: Option<&&Version>| v.map_or_else(|| "nothing".to_string(), |v| v.to_string());
                return vec![Discrepancy::new(
                    DiscrepancyKind::VersionMismatch,
                    identity,
                    format!(
                        "position {} has applied {} but resolved {}",
                        position + 1,
                        describe(a),
                        describe(r)
                    ),
                )];
            }
        }
        Vec::new()
    }

    fn check_kinds(&self, infos: &MigrationInfoSet) -> Vec<Discrepancy> {
        infos
            .iter()
            .filter(|i| i.state() != MigrationState::Superseded)
            .filter_map(|i| Some((i, i.descriptor()?, i.record()?)))
            .filter(|(_, d, r)| r.kind != MigrationKind::Baseline && d.kind() != r.kind)
            .map(|(i, d, r)| {
                Discrepancy::new(
                    DiscrepancyKind::KindMismatch,
                    i.key().to_string(),
                    format!("applied as {} but resolved as {}", r.kind, d.kind()),
                )
            })
            .collect()
    }

    fn check_content(&self, infos: &MigrationInfoSet) -> Vec<Discrepancy> {
        let mut found = Vec::new();
        for info in infos.iter() {
            if info.state() != MigrationState::Success {
                continue;
            }
            let (Some(descriptor), Some(record)) = (info.descriptor(), info.record()) else {
                continue;
            };
            if descriptor.kind() != MigrationKind::Versioned {
                continue;
            }
            if descriptor.checksum() != record.checksum.as_ref() {
                let show = |c: Option<&Checksum>| c.map_or_else(|| "none".to_string(), |c| c.to_string());
                found.push(Discrepancy::new(
                    DiscrepancyKind::ChecksumMismatch,
                    info.key().to_string(),
                    format!(
                        "checksum mismatch: applied {} but resolved {}",
                        show(record.checksum.as_ref()),
                        show(descriptor.checksum())
                    ),
                ));
            }
            if descriptor.description() != record.description {
                found.push(Discrepancy::new(
                    DiscrepancyKind::DescriptionMismatch,
                    info.key().to_string(),
                    format!(
                        "description mismatch: applied {:?} but resolved {:?}",
                        record.description,
                        descriptor.description()
                    ),
                ));
            }
        }
        found
    }

    fn check_failed(&self, infos: &MigrationInfoSet) -> Vec<Discrepancy> {
        infos
            .iter()
            .filter(|i| i.state() == MigrationState::Failed)
            .map(|i| Discrepancy::new(DiscrepancyKind::Failed, i.key().to_string(), "migration failed"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryRecord;
    use crate::migration::descriptor::DescriptorSet;
    use crate::migration::resolver::{ResolvePolicy, StateResolver};
    use crate::migration::testing::*;

    fn validate(descriptors: &DescriptorSet, history: &[HistoryRecord], policy: ValidatePolicy) -> Vec<Discrepancy> {
        let infos = StateResolver::resolve(descriptors, history, &ResolvePolicy::default());
        Validator::new(policy).validate(&infos)
    }

    fn kinds(found: &[Discrepancy]) -> Vec<DiscrepancyKind> {
        found.iter().map(|d| d.kind).collect()
    }

    #[test]
    fn test_clean_ledger() {
        let descriptors = set(vec![versioned("1", "a"), versioned("2", "b"), repeatable("r", "x")]);
        let history = vec![applied(1, "1", "a", true), applied_repeatable(2, "r", "old")];
        assert!(validate(&descriptors, &history, ValidatePolicy::default()).is_empty());
    }

    #[test]
    fn test_checksum_drift() {
        let descriptors = set(vec![versioned("1", "xyz")]);
        let history = vec![applied(1, "1", "abc", true)];
        let found = validate(&descriptors, &history, ValidatePolicy::default());
        assert_eq!(kinds(&found), vec![DiscrepancyKind::ChecksumMismatch]);
        assert_eq!(found[0].identity, "version 1");
        assert!(found[0].to_string().contains("applied abc but resolved xyz"));
    }

    #[test]
    fn test_missing_short_circuits() {
        let descriptors = set(vec![versioned("1", "changed"), versioned("3", "c")]);
        let history = vec![applied(1, "1", "a", true), applied(2, "2", "gone", true)];
        let found = validate(&descriptors, &history, ValidatePolicy::default());
        assert_eq!(kinds(&found), vec![DiscrepancyKind::Missing]);

        let policy = ValidatePolicy {
            ignore_missing: true,
            ..Default::default()
        };
        let found = validate(&descriptors, &history, policy);
        assert_eq!(kinds(&found), vec![DiscrepancyKind::ChecksumMismatch]);
    }

    #[test]
    fn test_future_respects_policy() {
        let descriptors = set(vec![versioned("1", "a")]);
        let history = vec![applied(1, "1", "a", true), applied(2, "5", "f", true)];
        assert_eq!(
            kinds(&validate(&descriptors, &history, ValidatePolicy::default())),
            vec![DiscrepancyKind::Future]
        );
        let policy = ValidatePolicy {
            ignore_future: true,
            ..Default::default()
        };
        assert!(validate(&descriptors, &history, policy).is_empty());
    }

    #[test]
    fn test_unapplied_gap_is_version_mismatch() {
        let descriptors = set(vec![versioned("1", "a"), versioned("2", "b"), versioned("3", "c")]);
        let history = vec![applied(1, "1", "a", true), applied(2, "3", "c", true)];

        let found = validate(&descriptors, &history, ValidatePolicy::default());
        assert_eq!(kinds(&found), vec![DiscrepancyKind::VersionMismatch]);
        assert_eq!(found[0].identity, "version 2");

        let policy = ValidatePolicy {
            out_of_order: true,
            ..Default::default()
        };
        assert!(validate(&descriptors, &history, policy).is_empty());
    }

    #[test]
    fn test_pending_above_applied_is_fine() {
        let descriptors = set(vec![versioned("1", "a"), versioned("2", "b")]);
        let history = vec![applied(1, "1", "a", true)];
        assert!(validate(&descriptors, &history, ValidatePolicy::default()).is_empty());
    }

    #[test]
    fn test_kind_mismatch() {
        let descriptors = set(vec![versioned("1", "a")]);
        let mut row = applied(1, "1", "a", true);
        row.kind = MigrationKind::Undo;
        // An undo row keys apart from the versioned descriptor and shows up as missing.
        let found = validate(&descriptors, &[row], ValidatePolicy::default());
        assert_eq!(kinds(&found), vec![DiscrepancyKind::Missing]);

        let descriptors = set(vec![crate::migration::descriptor::MigrationDescriptor::baseline(
            v("1"),
            "v1",
            noop(),
        )
        .with_checksum(crate::migration::descriptor::Checksum::new("a"))]);
        let found = validate(&descriptors, &[applied(1, "1", "a", true)], ValidatePolicy::default());
        assert_eq!(kinds(&found), vec![DiscrepancyKind::KindMismatch]);
    }

    #[test]
    fn test_description_mismatch() {
        let descriptors = set(vec![versioned("1", "a")]);
        let mut row = applied(1, "1", "a", true);
        row.description = "renamed".into();
        let found = validate(&descriptors, &[row], ValidatePolicy::default());
        assert_eq!(kinds(&found), vec![DiscrepancyKind::DescriptionMismatch]);
    }

    #[test]
    fn test_failed_reported_last() {
        let descriptors = set(vec![versioned("1", "a"), versioned("2", "b")]);
        let history = vec![applied(1, "1", "a", true), applied(2, "2", "b", false)];
        let found = validate(&descriptors, &history, ValidatePolicy::default());
        assert_eq!(kinds(&found), vec![DiscrepancyKind::Failed]);
    }

    #[test]
    fn test_below_baseline_not_compared() {
        let descriptors = set(vec![versioned("1", "a"), versioned("2", "b"), versioned("3", "c")]);
        let history = vec![baseline_row(1, "2"), applied(2, "3", "c", true)];
        assert!(validate(&descriptors, &history, ValidatePolicy::default()).is_empty());
    }
}
