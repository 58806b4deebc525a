//! Merge of resolvable migrations with the ledger.
//!
//! [`StateResolver::resolve`] is a pure function: the same descriptors, rows and
//! policy always produce the same [`MigrationInfoSet`].

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::warn;

use super::descriptor::{DescriptorSet, MigrationDescriptor, MigrationKey, MigrationKind};
use super::info::{MigrationInfo, MigrationInfoSet, MigrationState};
use super::naming::glob_matches;
use crate::history::HistoryRecord;
use crate::version::Version;

/// Inputs to state derivation besides descriptors and rows.
#[derive(Debug, Clone)]
pub struct ResolvePolicy {
    /// Versioned migrations above this are [`MigrationState::AboveTarget`].
    pub target: Version,
    /// Script-name globs whose migrations are [`MigrationState::Ignored`].
    pub ignore_patterns: Vec<String>,
}

impl Default for ResolvePolicy {
    fn default() -> Self {
        Self {
            target: Version::LATEST,
            ignore_patterns: Vec::new(),
        }
    }
}

impl ResolvePolicy {
    /// Policy for `target` with no ignore patterns.
    pub fn new(target: Version) -> Self {
        Self {
            target,
            ..Default::default()
        }
    }

    /// Set the ignore patterns.
    pub fn with_ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.ignore_patterns = patterns;
        self
    }

    /// Whether `descriptor` is excluded from execution.
    pub fn is_ignored(&self, descriptor: &MigrationDescriptor) -> bool {
        !descriptor.executable().should_execute()
            || self
                .ignore_patterns
                .iter()
                .any(|p| glob_matches(p, descriptor.script()))
    }
}

struct Context<'a> {
    policy: &'a ResolvePolicy,
    last_applied: Version,
    last_resolved: Version,
    baseline: Option<Version>,
    /// Baseline taken from a pending baseline descriptor rather than a ledger row.
    planned_baseline: bool,
}

/// Derives [`MigrationInfo`] entries from descriptors and ledger rows.
pub struct StateResolver;

impl StateResolver {
    /// Reconcile `descriptors` with `history`.
    pub fn resolve(descriptors: &DescriptorSet, history: &[HistoryRecord], policy: &ResolvePolicy) -> MigrationInfoSet {
        let mut rows: Vec<&HistoryRecord> = history.iter().collect();
        rows.sort_by_key(|r| r.installed_rank);

        let mut applied: BTreeMap<MigrationKey, Vec<&HistoryRecord>> = BTreeMap::new();
        for record in rows.iter().copied() {
            match record.key() {
                Some(key) => applied.entry(key).or_default().push(record),
                None => warn!(
                    rank = record.installed_rank,
                    kind = %record.kind,
                    "Ignoring schema history row without a version"
                ),
            }
        }

        let current_version = rows
            .iter()
            .filter(|r| r.success && r.is_versioned())
            .filter_map(|r| r.version.clone())
            .max()
            .unwrap_or(Version::EMPTY);
        let last_applied = rows
            .iter()
            .filter(|r| r.is_versioned())
            .filter_map(|r| r.version.clone())
            .max()
            .unwrap_or(Version::EMPTY);
        let recorded_baseline = rows
            .iter()
            .rev()
            .find(|r| r.success && r.kind == MigrationKind::Baseline)
            .and_then(|r| r.version.clone());

        // On an untouched ledger the highest eligible baseline descriptor stands in for the baseline.
        let (baseline, planned_baseline) = match recorded_baseline {
            Some(v) => (Some(v), false),
            None if last_applied.is_empty_schema() => {
                let planned = descriptors
                    .iter()
                    .filter(|d| d.kind() == MigrationKind::Baseline && !policy.is_ignored(d))
                    .filter_map(|d| d.version().cloned())
                    .filter(|v| *v <= policy.target)
                    .max();
                let is_planned = planned.is_some();
                (planned, is_planned)
            }
            None => (None, false),
        };

        let ctx = Context {
            policy,
            last_applied,
            last_resolved: descriptors.latest_version(),
            baseline,
            planned_baseline,
        };

        let mut infos = Vec::with_capacity(descriptors.len() + rows.len());

        for descriptor in descriptors.iter() {
            let key = descriptor.key();
            if applied.contains_key(&key) {
                continue;
            }
            let state = Self::unapplied_state(descriptor, &ctx);
            infos.push(MigrationInfo::new(key, state, Some(descriptor.clone()), None));
        }

        for (key, records) in &applied {
            let Some((latest, older)) = records.split_last() else {
                continue;
            };
            for record in older {
                infos.push(MigrationInfo::new(
                    key.clone(),
                    MigrationState::Superseded,
                    None,
                    Some((*record).clone()),
                ));
            }

            let descriptor = descriptors.get(key);
            let state = Self::applied_state(latest, descriptor, &ctx);
            let out_of_order = state == MigrationState::Success
                && latest.kind == MigrationKind::Versioned
                && rows.iter().any(|other| {
                    other.installed_rank < latest.installed_rank
                        && other.kind == MigrationKind::Versioned
                        && other.version > latest.version
                });
            infos.push(
                MigrationInfo::new(key.clone(), state, descriptor.cloned(), Some((*latest).clone()))
                    .with_applied_out_of_order(out_of_order),
            );
        }

        infos.sort_by(display_order);

        MigrationInfoSet {
            infos,
            current_version,
            last_applied: ctx.last_applied,
            last_resolved: ctx.last_resolved,
            baseline: ctx.baseline,
        }
    }

    fn unapplied_state(descriptor: &MigrationDescriptor, ctx: &Context<'_>) -> MigrationState {
        if ctx.policy.is_ignored(descriptor) {
            return MigrationState::Ignored;
        }
        match descriptor.kind() {
            MigrationKind::Undo => MigrationState::Available,
            MigrationKind::Repeatable => MigrationState::Pending,
            MigrationKind::Baseline => {
                if ctx.planned_baseline && descriptor.version() == ctx.baseline.as_ref() {
                    MigrationState::Pending
                } else {
                    MigrationState::Available
                }
            }
            MigrationKind::Versioned => {
                let Some(version) = descriptor.version() else {
                    return MigrationState::Pending;
                };
                if ctx.baseline.as_ref().is_some_and(|b| version <= b) {
                    MigrationState::BelowBaseline
                } else if *version > ctx.policy.target {
                    MigrationState::AboveTarget
                } else if *version < ctx.last_applied {
                    MigrationState::OutOfOrder
                } else {
                    MigrationState::Pending
                }
            }
        }
    }

    fn applied_state(
        record: &HistoryRecord,
        descriptor: Option<&MigrationDescriptor>,
        ctx: &Context<'_>,
    ) -> MigrationState {
        if record.kind == MigrationKind::Baseline {
            return MigrationState::Baseline;
        }
        let Some(descriptor) = descriptor else {
            let future = !record.kind.is_repeatable()
                && record.version.as_ref().is_some_and(|v| *v > ctx.last_resolved);
            return match (future, record.success) {
                (true, true) => MigrationState::FutureSuccess,
                (true, false) => MigrationState::FutureFailed,
                (false, true) => MigrationState::MissingSuccess,
                (false, false) => MigrationState::MissingFailed,
            };
        };
        if !record.success {
            return MigrationState::Failed;
        }
        if descriptor.kind().is_repeatable() && descriptor.checksum() != record.checksum.as_ref() {
            return if ctx.policy.is_ignored(descriptor) {
                MigrationState::Ignored
            } else {
                MigrationState::Pending
            };
        }
        MigrationState::Success
    }
}

fn rank_or_max(info: &MigrationInfo) -> u64 {
    info.installed_rank().unwrap_or(u64::MAX)
}

/// Versioned family by version (undo after its versioned twin, then by rank), then
/// repeatables by description with the newest run first.
fn display_order(a: &MigrationInfo, b: &MigrationInfo) -> Ordering {
    match (a.key(), b.key()) {
        (MigrationKey::Repeatable(da), MigrationKey::Repeatable(db)) => {
            da.cmp(db).then_with(|| rank_or_max(b).cmp(&rank_or_max(a)))
        }
        (MigrationKey::Repeatable(_), _) => Ordering::Greater,
        (_, MigrationKey::Repeatable(_)) => Ordering::Less,
        (ka, kb) => ka
            .version()
            .cmp(&kb.version())
            .then_with(|| matches!(ka, MigrationKey::Undo(_)).cmp(&matches!(kb, MigrationKey::Undo(_))))
            .then_with(|| rank_or_max(a).cmp(&rank_or_max(b))),
    }
}
