//! Migration engine.
//!
//! Resolvable migrations ([`MigrationDescriptor`]) are reconciled against the ledger
//! ([`crate::history`]) into a [`MigrationInfoSet`]. The [`ExecutionPlanner`] picks at
//! most one migration from it, and the [`MigrationExecutor`] applies it under the
//! ledger lock, one migration per lock acquisition.
//!
//! # States
//!
//! | State          | Descriptor | Ledger row | Applied by migrate |
//! |----------------|------------|------------|--------------------|
//! | Pending        | yes        | no         | yes                |
//! | OutOfOrder     | yes        | no         | only if enabled    |
//! | AboveTarget    | yes        | no         | no                 |
//! | BelowBaseline  | yes        | no         | no                 |
//! | Ignored        | yes        | maybe      | no                 |
//! | Available      | yes        | no         | no                 |
//! | Success        | yes        | success    | -                  |
//! | Failed         | yes        | failure    | blocks migrate     |
//! | Missing*       | no         | yes        | -                  |
//! | Future*        | no         | yes        | -                  |
//! | Baseline       | maybe      | baseline   | -                  |
//! | Superseded     | maybe      | older row  | -                  |

pub mod config;
pub mod descriptor;
pub mod error;
pub mod executor;
pub mod info;
pub mod naming;
pub mod planner;
pub mod repair;
pub mod resolver;
pub mod retry;
pub mod validator;

pub use config::MigrateConfig;
pub use descriptor::{
    Checksum, DescriptorSet, Executable, FnMigration, MigrationDescriptor, MigrationKey, MigrationKind,
    SqlScript,
};
pub use error::{DatabaseState, MigrationError, Result};
pub use executor::{AppliedMigration, MigrateResult, MigrationExecutor};
pub use info::{MigrationInfo, MigrationInfoSet, MigrationState};
pub use naming::{parse_script_name, ScriptName};
pub use planner::{ExecutionPlanner, PlanDecision};
pub use repair::RepairReport;
pub use resolver::{ResolvePolicy, StateResolver};
pub use retry::{RetryConfig, RetryPolicy};
pub use validator::{Discrepancy, DiscrepancyKind, ValidatePolicy, Validator};
