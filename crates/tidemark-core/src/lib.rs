//! Tidemark Core - schema history reconciliation and migration engine.
//!
//! This crate decides, for a target database, which schema migrations have been applied,
//! which are pending, and which one to apply next, then applies them one at a time under
//! an exclusive ledger lock.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tidemark_core::{
//!     DescriptorSet, InMemoryHistory, MemoryBackend, MigrateConfig, MigrationDescriptor,
//!     MigrationExecutor,
//! };
//!
//! # fn main() -> Result<(), tidemark_core::MigrationError> {
//! let descriptors = DescriptorSet::new([
//!     MigrationDescriptor::sql("V1__create_users.sql", "CREATE TABLE users (id INT)")?,
//!     MigrationDescriptor::sql("V2__add_email.sql", "ALTER TABLE users ADD email TEXT")?,
//! ])?;
//!
//! let executor = MigrationExecutor::new(
//!     Arc::new(MemoryBackend::new()),
//!     Arc::new(InMemoryHistory::new()),
//!     descriptors,
//!     MigrateConfig::default(),
//! );
//! let result = executor.migrate()?;
//! println!("schema now at {}", result.target_version);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod clock;
pub mod error;
pub mod history;
pub mod migration;
pub mod version;

pub use backend::{
    Backend, BackendError, Capabilities, Connection, ErrorClass, ErrorClassifier, MemoryBackend,
    SqlStateClassifier,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use error::Error;
pub use history::{
    HistoryRecord, InMemoryHistory, LockConfig, LockMode, SchemaHistoryStore, SledHistory,
};
pub use migration::{
    AppliedMigration, Checksum, DescriptorSet, Discrepancy, DiscrepancyKind, Executable,
    FnMigration, MigrateConfig, MigrateResult, MigrationDescriptor, MigrationError,
    MigrationExecutor, MigrationInfo, MigrationInfoSet, MigrationKey, MigrationKind,
    MigrationState, RepairReport, RetryConfig, RetryPolicy, SqlScript,
};
pub use version::{ParseVersionError, Version};
