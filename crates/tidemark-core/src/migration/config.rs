//! Migration engine configuration.

use serde::{Deserialize, Serialize};

use super::resolver::ResolvePolicy;
use super::retry::RetryConfig;
use super::validator::ValidatePolicy;
use crate::clock::default_principal;
use crate::history::LockConfig;
use crate::version::Version;

/// Configuration for [`MigrationExecutor`](super::MigrationExecutor).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrateConfig {
    /// Highest version migrate may apply.
    pub target: Version,
    /// Allow applying a migration below an already applied version.
    pub out_of_order: bool,
    /// Script-name globs to leave out.
    pub ignore_patterns: Vec<String>,
    /// Tolerate ledger rows newer than every resolvable migration.
    pub ignore_future_migrations: bool,
    /// Tolerate ledger rows whose migration is no longer resolvable.
    pub ignore_missing_migrations: bool,
    /// Validate before migrating.
    pub validate_on_migrate: bool,
    /// Baseline an empty ledger before migrating.
    pub baseline_on_migrate: bool,
    /// Version written by baseline.
    pub baseline_version: Version,
    /// Description written by baseline.
    pub baseline_description: String,
    /// Principal recorded in the ledger. Defaults to the OS user.
    pub installed_by: Option<String>,
    /// Lock acquisition.
    pub lock: LockConfig,
    /// Retry of transient failures.
    pub retry: RetryConfig,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            target: Version::LATEST,
            out_of_order: false,
            ignore_patterns: Vec::new(),
            ignore_future_migrations: true,
            ignore_missing_migrations: false,
            validate_on_migrate: true,
            baseline_on_migrate: false,
            baseline_version: Version::parse("1").unwrap_or(Version::EMPTY),
            baseline_description: "<< Baseline >>".to_string(),
            installed_by: None,
            lock: LockConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl MigrateConfig {
    /// Set the target version.
    pub fn with_target(mut self, target: Version) -> Self {
        self.target = target;
        self
    }

    /// Enable or disable out-of-order migrations.
    pub fn with_out_of_order(mut self, enabled: bool) -> Self {
        self.out_of_order = enabled;
        self
    }

    /// Add an ignore pattern.
    pub fn with_ignore_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.ignore_patterns.push(pattern.into());
        self
    }

    /// Tolerate future migrations.
    pub fn with_ignore_future_migrations(mut self, enabled: bool) -> Self {
        self.ignore_future_migrations = enabled;
        self
    }

    /// Tolerate missing migrations.
    pub fn with_ignore_missing_migrations(mut self, enabled: bool) -> Self {
        self.ignore_missing_migrations = enabled;
        self
    }

    /// Enable or disable validation before migrating.
    pub fn with_validate_on_migrate(mut self, enabled: bool) -> Self {
        self.validate_on_migrate = enabled;
        self
    }

    /// Baseline an empty ledger automatically.
    pub fn with_baseline_on_migrate(mut self, enabled: bool) -> Self {
        self.baseline_on_migrate = enabled;
        self
    }

    /// Set the baseline version and description.
    pub fn with_baseline(mut self, version: Version, description: impl Into<String>) -> Self {
        self.baseline_version = version;
        self.baseline_description = description.into();
        self
    }

    /// Set the recorded principal.
    pub fn with_installed_by(mut self, principal: impl Into<String>) -> Self {
        self.installed_by = Some(principal.into());
        self
    }

    /// Set the lock settings.
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Set the retry settings.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// The principal to record.
    pub fn principal(&self) -> String {
        self.installed_by.clone().unwrap_or_else(default_principal)
    }

    /// Resolution policy for `target`.
    pub fn resolve_policy(&self, target: &Version) -> ResolvePolicy {
        ResolvePolicy::new(target.clone()).with_ignore_patterns(self.ignore_patterns.clone())
    }

    /// Validation policy.
    pub fn validate_policy(&self) -> ValidatePolicy {
        ValidatePolicy {
            out_of_order: self.out_of_order,
            ignore_missing: self.ignore_missing_migrations,
            ignore_future: self.ignore_future_migrations,
        }
    }
}
