//! Migration executor - the apply loop.
//!
//! Each step takes the ledger lock, reconciles state, applies at most one migration,
//! appends its outcome and releases the lock. The lock is never held across two
//! migrations, so waiting processes get a turn and see newly appended rows.

use std::cell::Cell;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::config::MigrateConfig;
use super::descriptor::{DescriptorSet, MigrationDescriptor, MigrationKind};
use super::error::{DatabaseState, MigrationError, Result};
use super::info::{MigrationInfo, MigrationInfoSet, MigrationState};
use super::planner::{ExecutionPlanner, PlanDecision};
use super::resolver::StateResolver;
use super::retry::RetryPolicy;
use super::validator::{Discrepancy, DiscrepancyKind, Validator};
use crate::backend::{Backend, BackendError};
use crate::clock::{Clock, SystemClock};
use crate::history::{AttemptMarker, HistoryLock, HistoryRecord, LockMode, NewHistoryRecord, SchemaHistoryStore};
use crate::version::Version;

/// One migration applied by a migrate run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    /// Version, absent for repeatables.
    pub version: Option<Version>,
    /// Description.
    pub description: String,
    /// Kind.
    pub kind: MigrationKind,
    /// Rank of the appended ledger row.
    pub installed_rank: u64,
    /// Wall time in milliseconds.
    pub execution_time_ms: u64,
    /// Applied below an already applied version.
    pub out_of_order: bool,
}

/// Outcome of a migrate run.
#[derive(Debug, Clone, Default)]
pub struct MigrateResult {
    /// Schema version before the run.
    pub initial_version: Version,
    /// Schema version after the run.
    pub target_version: Version,
    /// Number of migrations applied.
    pub migrations_executed: usize,
    /// Applied migrations, in order.
    pub migrations: Vec<AppliedMigration>,
    /// Non-fatal conditions seen along the way.
    pub warnings: Vec<String>,
    /// Wall time of the whole run in milliseconds.
    pub total_time_ms: u64,
}

enum Step {
    Applied(AppliedMigration),
    Done,
}

/// Drives migrations against one backend and its schema history.
pub struct MigrationExecutor {
    backend: Arc<dyn Backend>,
    store: Arc<dyn SchemaHistoryStore>,
    descriptors: DescriptorSet,
    config: MigrateConfig,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl MigrationExecutor {
    /// Create an executor.
    pub fn new(
        backend: Arc<dyn Backend>,
        store: Arc<dyn SchemaHistoryStore>,
        descriptors: DescriptorSet,
        config: MigrateConfig,
    ) -> Self {
        let retry = RetryPolicy::new(&config.retry);
        Self {
            backend,
            store,
            descriptors,
            config,
            retry,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used for ledger timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The configuration.
    pub fn config(&self) -> &MigrateConfig {
        &self.config
    }

    /// The resolvable migrations.
    pub fn descriptors(&self) -> &DescriptorSet {
        &self.descriptors
    }

    /// Reconciled view of every migration against the configured target.
    pub fn info(&self) -> Result<MigrationInfoSet> {
        let history = self.read_history()?;
        Ok(self.resolve(&history, &self.config.target))
    }

    /// The applied migration at the current schema version.
    pub fn current(&self) -> Result<Option<MigrationInfo>> {
        Ok(self.info()?.current().cloned())
    }

    /// Dry run: the migration [`apply_all`](Self::apply_all) would apply next.
    pub fn plan_next(&self, target: &Version) -> Result<Option<MigrationDescriptor>> {
        Ok(self.plan(target)?.next)
    }

    /// Dry run with the planner's warnings.
    pub fn plan(&self, target: &Version) -> Result<PlanDecision> {
        let history = self.read_history()?;
        let infos = self.resolve(&history, target);
        Ok(ExecutionPlanner::new(self.config.out_of_order).select(&infos))
    }

    /// Drift between the ledger and the resolvable migrations. Takes no lock.
    pub fn validate(&self) -> Result<Vec<Discrepancy>> {
        let history = self.read_history()?;
        let infos = self.resolve(&history, &self.config.target);
        Ok(Validator::new(self.config.validate_policy()).validate(&infos))
    }

    /// Apply everything pending up to the configured target.
    pub fn migrate(&self) -> Result<MigrateResult> {
        let target = self.config.target.clone();
        self.apply_all(&target)
    }

    /// Apply pending migrations up to `target`, one per lock acquisition.
    pub fn apply_all(&self, target: &Version) -> Result<MigrateResult> {
        let started = Instant::now();
        self.store.create_if_absent()?;

        if self.config.validate_on_migrate {
            let discrepancies: Vec<Discrepancy> = self
                .validate()?
                .into_iter()
                .filter(|d| d.kind != DiscrepancyKind::Failed)
                .collect();
            if !discrepancies.is_empty() {
                error!(count = discrepancies.len(), "Validation failed, refusing to migrate");
                return Err(MigrationError::Validation(discrepancies));
            }
        }

        if self.config.baseline_on_migrate && self.store.all()?.is_empty() {
            self.baseline()?;
        }

        let mut result = MigrateResult {
            initial_version: self.resolve(&self.store.all()?, target).current_version().clone(),
            ..Default::default()
        };
        info!(
            backend = self.backend.name(),
            version = %result.initial_version,
            "Current version of schema"
        );

        loop {
            match self.step(target, &mut result.warnings)? {
                Step::Applied(applied) => result.migrations.push(applied),
                Step::Done => break,
            }
        }

        result.migrations_executed = result.migrations.len();
        result.target_version = self.resolve(&self.store.all()?, target).current_version().clone();
        result.total_time_ms = started.elapsed().as_millis() as u64;

        if result.migrations_executed == 0 {
            info!(version = %result.target_version, "Schema is up to date, no migration necessary");
        } else {
            info!(
                count = result.migrations_executed,
                version = %result.target_version,
                elapsed_ms = result.total_time_ms,
                "Successfully applied migrations"
            );
        }
        Ok(result)
    }

    /// One locked step: reconcile, plan, apply at most one migration.
    fn step(&self, target: &Version, warnings: &mut Vec<String>) -> Result<Step> {
        let _lock = self.acquire_lock()?;
        self.recover_interrupted()?;

        let history = self.store.all()?;
        let infos = self.resolve(&history, target);
        self.check_failures(&infos, warnings)?;

        let decision = ExecutionPlanner::new(self.config.out_of_order).select(&infos);
        for warning in decision.warnings {
            if !warnings.contains(&warning) {
                warn!("{}", warning);
                warnings.push(warning);
            }
        }

        match decision.next {
            Some(descriptor) => Ok(Step::Applied(self.apply_one(&descriptor, decision.out_of_order)?)),
            None => Ok(Step::Done),
        }
    }

    pub(crate) fn store(&self) -> &dyn SchemaHistoryStore {
        self.store.as_ref()
    }

    pub(crate) fn acquire_lock(&self) -> Result<HistoryLock<'_>> {
        let mode = if self.backend.supports_native_locking() {
            LockMode::Native
        } else {
            LockMode::PollingRow
        };
        self.retry
            .execute(|| self.store.lock(mode, &self.config.lock).map_err(MigrationError::from))
    }

    pub(crate) fn read_history(&self) -> Result<Vec<HistoryRecord>> {
        if !self.store.exists()? {
            return Ok(Vec::new());
        }
        Ok(self.store.all()?)
    }

    pub(crate) fn resolve(&self, history: &[HistoryRecord], target: &Version) -> MigrationInfoSet {
        StateResolver::resolve(&self.descriptors, history, &self.config.resolve_policy(target))
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_micros()
    }

    fn check_failures(&self, infos: &MigrationInfoSet, warnings: &mut Vec<String>) -> Result<()> {
        if let Some(failed) = infos
            .iter()
            .find(|i| matches!(i.state(), MigrationState::Failed | MigrationState::MissingFailed))
        {
            error!(migration = %failed.key(), "Schema history contains a failed migration");
            return Err(MigrationError::FailedMigrationPresent {
                identity: failed.key().to_string(),
            });
        }

        let future_failed: Vec<&MigrationInfo> = infos.with_state(MigrationState::FutureFailed).collect();
        match future_failed.as_slice() {
            [] => Ok(()),
            [only] if self.config.ignore_future_migrations => {
                let warning = format!("detected failed future migration {}", only.key());
                if !warnings.contains(&warning) {
                    warn!("{}", warning);
                    warnings.push(warning);
                }
                Ok(())
            }
            [first, ..] => Err(MigrationError::FailedMigrationPresent {
                identity: first.key().to_string(),
            }),
        }
    }

    /// Resolve an attempt marker left behind by a process that died mid-migration.
    fn recover_interrupted(&self) -> Result<()> {
        let Some(marker) = self.store.interrupted_attempt()? else {
            return Ok(());
        };

        let key = marker.key();
        let recorded = self
            .store
            .all()?
            .iter()
            .any(|r| r.key() == key && r.installed_on >= marker.started_on);

        if recorded {
            debug!(migration = ?key, "Outcome of previous attempt already recorded");
        } else {
            // A transaction may have committed before the process died, so rollback cannot
            // be assumed. The row stays failed until repair.
            error!(
                migration = ?key,
                installed_by = %marker.installed_by,
                transactional = marker.transactional,
                "Recording interrupted attempt as failed, its outcome is unknown"
            );
            let now = self.now();
            self.store.append(marker.into_failed_record(now))?;
        }
        self.store.clear_attempt()?;
        Ok(())
    }

    fn apply_one(&self, descriptor: &MigrationDescriptor, out_of_order: bool) -> Result<AppliedMigration> {
        let transactional =
            self.backend.supports_ddl_transactions() && descriptor.executable().executes_in_transaction();
        let installed_by = self.config.principal();
        let identity = describe(descriptor);

        if out_of_order {
            warn!(migration = %identity, "Applying migration out of order");
        }
        info!(migration = %identity, transactional, "Migrating schema");

        self.store.record_attempt(&AttemptMarker::for_descriptor(
            descriptor,
            transactional,
            installed_by.clone(),
            self.now(),
        ))?;

        let started = Instant::now();
        let ran = Cell::new(false);
        let rolled_back = Cell::new(false);
        let outcome = if transactional {
            self.retry
                .execute(|| self.run_transactional(descriptor, &ran, &rolled_back))
        } else {
            self.run_ambient(descriptor, &ran)
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                let rank = self.store.append(NewHistoryRecord::for_descriptor(
                    descriptor,
                    installed_by,
                    self.now(),
                    elapsed_ms,
                    true,
                ))?;
                self.store.clear_attempt()?;
                info!(migration = %identity, rank, elapsed_ms, "Migration applied");
                Ok(AppliedMigration {
                    version: descriptor.version().cloned(),
                    description: descriptor.description().to_string(),
                    kind: descriptor.kind(),
                    installed_rank: rank,
                    execution_time_ms: elapsed_ms,
                    out_of_order,
                })
            }
            Err(err) if !ran.get() => {
                // Nothing ran, so there is no outcome to record.
                self.store.clear_attempt()?;
                Err(err)
            }
            Err(err) if rolled_back.get() => {
                // The database is consistent and nothing was applied; the next run may retry.
                self.store.clear_attempt()?;
                let state = DatabaseState::RolledBack;
                error!(migration = %identity, %state, error = %err, "Migration failed");
                Err(MigrationError::MigrationFailed {
                    identity,
                    cause: into_cause(err),
                    state,
                })
            }
            Err(err) => {
                let state = DatabaseState::PartiallyApplied;
                self.store.append(NewHistoryRecord::for_descriptor(
                    descriptor,
                    installed_by,
                    self.now(),
                    elapsed_ms,
                    false,
                ))?;
                self.store.clear_attempt()?;
                error!(migration = %identity, %state, error = %err, "Migration failed");
                Err(MigrationError::MigrationFailed {
                    identity,
                    cause: into_cause(err),
                    state,
                })
            }
        }
    }

    /// Run inside a transaction. `rolled_back` is set only once a rollback is confirmed;
    /// a failed commit or rollback leaves the outcome unknown.
    fn run_transactional(
        &self,
        descriptor: &MigrationDescriptor,
        ran: &Cell<bool>,
        rolled_back: &Cell<bool>,
    ) -> Result<()> {
        let mut conn = self.backend.connect().map_err(|e| self.backend_error(e))?;
        conn.begin().map_err(|e| self.backend_error(e))?;
        ran.set(true);
        rolled_back.set(false);
        match descriptor.executable().run(conn.as_mut()) {
            Ok(()) => conn.commit().map_err(|e| self.backend_error(e)),
            Err(e) => {
                match conn.rollback() {
                    Ok(()) => rolled_back.set(true),
                    Err(rollback) => warn!(error = %rollback, "Rollback failed"),
                }
                Err(self.backend_error(e))
            }
        }
    }

    fn run_ambient(&self, descriptor: &MigrationDescriptor, ran: &Cell<bool>) -> Result<()> {
        let mut conn = self.backend.connect().map_err(|e| self.backend_error(e))?;
        ran.set(true);
        descriptor
            .executable()
            .run(conn.as_mut())
            .map_err(|e| self.backend_error(e))
    }

    fn backend_error(&self, error: BackendError) -> MigrationError {
        let class = self.backend.classify(&error);
        MigrationError::backend(error, class)
    }
}

fn describe(descriptor: &MigrationDescriptor) -> String {
    match descriptor.version() {
        Some(v) if descriptor.description().is_empty() => format!("version {}", v),
        Some(v) => format!("version {} ({})", v, descriptor.description()),
        None => format!("repeatable {:?}", descriptor.description()),
    }
}

fn into_cause(error: MigrationError) -> BackendError {
    match error {
        MigrationError::Backend { source, .. } => source,
        MigrationError::RetriesExhausted { last, .. } => into_cause(*last),
        other => BackendError::new(other.to_string()),
    }
}
