//! Next-migration selection.

use super::descriptor::{MigrationDescriptor, MigrationKind};
use super::info::{MigrationInfoSet, MigrationState};

/// Result of one planning pass.
#[derive(Debug, Clone, Default)]
pub struct PlanDecision {
    /// The single migration to apply next, if any.
    pub next: Option<MigrationDescriptor>,
    /// Whether `next` lands below an already applied version.
    pub out_of_order: bool,
    /// Conditions worth reporting that did not block planning.
    pub warnings: Vec<String>,
}

/// Picks at most one migration to apply next.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionPlanner {
    out_of_order: bool,
}

impl ExecutionPlanner {
    /// Planner with the given out-of-order policy.
    pub fn new(out_of_order: bool) -> Self {
        Self { out_of_order }
    }

    /// Choose the next migration.
    ///
    /// The lowest pending versioned migration wins. Out-of-order migrations compete only
    /// when out-of-order mode is on; otherwise each one is reported as a warning.
    /// Repeatables follow once no versioned migration is eligible. A failed ledger entry
    /// or a schema newer than every resolvable migration halts planning with a warning.
    pub fn select(&self, infos: &MigrationInfoSet) -> PlanDecision {
        let mut decision = PlanDecision::default();

        if let Some(failed) = infos
            .iter()
            .find(|i| matches!(i.state(), MigrationState::Failed | MigrationState::MissingFailed))
        {
            decision.warnings.push(format!(
                "migration {} failed and must be repaired before planning can continue",
                failed.key()
            ));
            return decision;
        }

        let current = infos.current_version();
        if !current.is_empty_schema() && current > infos.last_resolved() {
            decision.warnings.push(format!(
                "schema is at version {} which is newer than the latest available migration {}",
                current,
                infos.last_resolved()
            ));
            return decision;
        }

        let mut versioned = None;
        for info in infos.iter() {
            let Some(descriptor) = info.descriptor() else {
                continue;
            };
            if descriptor.kind().is_repeatable() {
                continue;
            }
            match info.state() {
                MigrationState::Pending => {}
                MigrationState::OutOfOrder if self.out_of_order => {}
                MigrationState::OutOfOrder => {
                    decision.warnings.push(format!(
                        "resolved migration {} is below applied version {} and out-of-order is disabled",
                        info.key(),
                        infos.last_applied()
                    ));
                    continue;
                }
                _ => continue,
            }
            // Infos are sorted by version, so the first eligible entry is the lowest.
            if versioned.is_none() {
                versioned = Some((descriptor.clone(), info.state() == MigrationState::OutOfOrder));
            }
        }

        if let Some((descriptor, out_of_order)) = versioned {
            decision.next = Some(descriptor);
            decision.out_of_order = out_of_order;
            return decision;
        }

        decision.next = infos
            .iter()
            .filter(|i| i.state() == MigrationState::Pending)
            .filter_map(|i| i.descriptor())
            .find(|d| d.kind() == MigrationKind::Repeatable)
            .cloned();
        decision
    }
}
