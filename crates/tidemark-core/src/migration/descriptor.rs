//! Resolvable migrations.
//!
//! A [`MigrationDescriptor`] describes one migration that discovery found: its identity,
//! content checksum and an [`Executable`] handle. The engine never looks inside the
//! executable; it only runs it against a [`Connection`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::{MigrationError, Result};
use super::naming::{parse_script_name, ScriptName};
use crate::backend::{BackendError, Connection};
use crate::version::Version;

/// Kind of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationKind {
    /// Applied once, in version order.
    Versioned,
    /// Re-applied whenever its checksum changes.
    Repeatable,
    /// Marks a starting version without running anything.
    Baseline,
    /// Reverses a versioned migration. Listed, never applied by migrate.
    Undo,
}

impl MigrationKind {
    /// Stable name used in the persisted ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationKind::Versioned => "VERSIONED",
            MigrationKind::Repeatable => "REPEATABLE",
            MigrationKind::Baseline => "BASELINE",
            MigrationKind::Undo => "UNDO",
        }
    }

    /// Parse a persisted kind name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "VERSIONED" => Some(MigrationKind::Versioned),
            "REPEATABLE" => Some(MigrationKind::Repeatable),
            "BASELINE" => Some(MigrationKind::Baseline),
            "UNDO" => Some(MigrationKind::Undo),
            _ => None,
        }
    }

    /// Whether migrations of this kind are identified by description rather than version.
    pub fn is_repeatable(&self) -> bool {
        matches!(self, MigrationKind::Repeatable)
    }
}

impl fmt::Display for MigrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content hash of a migration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

impl Checksum {
    /// Wrap an existing checksum value.
    pub fn new(value: impl Into<String>) -> Self {
        Checksum(value.into())
    }

    /// Checksum of script text.
    ///
    /// A leading byte-order mark is ignored and line endings are normalized, so the same
    /// script checked out on different platforms hashes identically.
    pub fn of_script(text: &str) -> Self {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
        Self::of_bytes(normalized.as_bytes())
    }

    /// Checksum of raw bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Checksum(hex::encode(blake3::hash(bytes).as_bytes()))
    }

    /// The checksum as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity shared by a descriptor and the ledger rows that record it.
///
/// Versioned and baseline migrations share the version namespace. Undo migrations are
/// keyed separately so they can sit next to the versioned migration they reverse.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MigrationKey {
    /// Versioned or baseline migration.
    Versioned(Version),
    /// Undo of the given version.
    Undo(Version),
    /// Repeatable migration, by description.
    Repeatable(String),
}

impl MigrationKey {
    /// Key for a migration of `kind`. Returns `None` when a versioned kind lacks a version.
    pub fn new(kind: MigrationKind, version: Option<&Version>, description: &str) -> Option<Self> {
        match kind {
            MigrationKind::Repeatable => Some(MigrationKey::Repeatable(description.to_string())),
            MigrationKind::Undo => version.cloned().map(MigrationKey::Undo),
            MigrationKind::Versioned | MigrationKind::Baseline => version.cloned().map(MigrationKey::Versioned),
        }
    }

    /// The version, for versioned keys.
    pub fn version(&self) -> Option<&Version> {
        match self {
            MigrationKey::Versioned(v) | MigrationKey::Undo(v) => Some(v),
            MigrationKey::Repeatable(_) => None,
        }
    }
}

impl fmt::Display for MigrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationKey::Versioned(v) => write!(f, "version {}", v),
            MigrationKey::Undo(v) => write!(f, "undo version {}", v),
            MigrationKey::Repeatable(d) => write!(f, "repeatable {:?}", d),
        }
    }
}

/// Opaque unit of work run by the executor.
pub trait Executable: Send + Sync {
    /// Run against the given connection.
    fn run(&self, conn: &mut dyn Connection) -> std::result::Result<(), BackendError>;

    /// Whether the unit may be wrapped in a transaction.
    fn executes_in_transaction(&self) -> bool {
        true
    }

    /// Whether the unit should run at all in this environment.
    fn should_execute(&self) -> bool {
        true
    }
}

/// A list of SQL statements.
#[derive(Debug, Clone)]
pub struct SqlScript {
    statements: Vec<String>,
    transactional: bool,
}

impl SqlScript {
    /// Script made of the given statements.
    pub fn new<I, S>(statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            statements: statements.into_iter().map(Into::into).collect(),
            transactional: true,
        }
    }

    /// Split script text on `;`. No dialect awareness: semicolons inside literals split too.
    pub fn from_text(text: &str) -> Self {
        Self::new(
            text.split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>(),
        )
    }

    /// Run outside any transaction.
    pub fn non_transactional(mut self) -> Self {
        self.transactional = false;
        self
    }

    /// The statements in execution order.
    pub fn statements(&self) -> &[String] {
        &self.statements
    }
}

impl Executable for SqlScript {
    fn run(&self, conn: &mut dyn Connection) -> std::result::Result<(), BackendError> {
        for statement in &self.statements {
            conn.execute(statement)?;
        }
        Ok(())
    }

    fn executes_in_transaction(&self) -> bool {
        self.transactional
    }
}

/// Executable backed by a closure.
pub struct FnMigration<F> {
    f: F,
    transactional: bool,
}

impl<F> FnMigration<F>
where
    F: Fn(&mut dyn Connection) -> std::result::Result<(), BackendError> + Send + Sync,
{
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self { f, transactional: true }
    }

    /// Run outside any transaction.
    pub fn non_transactional(mut self) -> Self {
        self.transactional = false;
        self
    }
}

impl<F> Executable for FnMigration<F>
where
    F: Fn(&mut dyn Connection) -> std::result::Result<(), BackendError> + Send + Sync,
{
    fn run(&self, conn: &mut dyn Connection) -> std::result::Result<(), BackendError> {
        (self.f)(conn)
    }

    fn executes_in_transaction(&self) -> bool {
        self.transactional
    }
}

/// One resolvable migration.
#[derive(Clone)]
pub struct MigrationDescriptor {
    kind: MigrationKind,
    version: Option<Version>,
    description: String,
    script: String,
    checksum: Option<Checksum>,
    executable: Arc<dyn Executable>,
}

impl MigrationDescriptor {
    fn build(
        kind: MigrationKind,
        version: Option<Version>,
        description: impl Into<String>,
        executable: Arc<dyn Executable>,
    ) -> Self {
        Self {
            kind,
            version,
            description: description.into(),
            script: String::new(),
            checksum: None,
            executable,
        }
    }

    /// A versioned migration.
    pub fn versioned(version: Version, description: impl Into<String>, executable: Arc<dyn Executable>) -> Self {
        Self::build(MigrationKind::Versioned, Some(version), description, executable)
    }

    /// A repeatable migration.
    pub fn repeatable(description: impl Into<String>, executable: Arc<dyn Executable>) -> Self {
        Self::build(MigrationKind::Repeatable, None, description, executable)
    }

    /// A baseline migration.
    pub fn baseline(version: Version, description: impl Into<String>, executable: Arc<dyn Executable>) -> Self {
        Self::build(MigrationKind::Baseline, Some(version), description, executable)
    }

    /// An undo migration for `version`.
    pub fn undo(version: Version, description: impl Into<String>, executable: Arc<dyn Executable>) -> Self {
        Self::build(MigrationKind::Undo, Some(version), description, executable)
    }

    /// Build a descriptor from a conventionally named SQL script and its text.
    pub fn sql(name: &str, text: &str) -> Result<Self> {
        let ScriptName {
            kind,
            version,
            description,
        } = parse_script_name(name)?;
        let executable: Arc<dyn Executable> = Arc::new(SqlScript::from_text(text));
        Ok(Self::build(kind, version, description, executable)
            .with_script(name)
            .with_checksum(Checksum::of_script(text)))
    }

    /// Set the script identifier.
    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = script.into();
        self
    }

    /// Set the content checksum.
    pub fn with_checksum(mut self, checksum: Checksum) -> Self {
        self.checksum = Some(checksum);
        self
    }

    /// Migration kind.
    pub fn kind(&self) -> MigrationKind {
        self.kind
    }

    /// Version, `None` for repeatables.
    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    /// Description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Script identifier.
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Content checksum.
    pub fn checksum(&self) -> Option<&Checksum> {
        self.checksum.as_ref()
    }

    /// The executable handle.
    pub fn executable(&self) -> &Arc<dyn Executable> {
        &self.executable
    }

    /// Identity key.
    pub fn key(&self) -> MigrationKey {
        match (&self.kind, &self.version) {
            (MigrationKind::Undo, Some(v)) => MigrationKey::Undo(v.clone()),
            (MigrationKind::Versioned | MigrationKind::Baseline, Some(v)) => MigrationKey::Versioned(v.clone()),
            _ => MigrationKey::Repeatable(self.description.clone()),
        }
    }
}

impl fmt::Debug for MigrationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationDescriptor")
            .field("kind", &self.kind)
            .field("version", &self.version)
            .field("description", &self.description)
            .field("script", &self.script)
            .field("checksum", &self.checksum)
            .finish_non_exhaustive()
    }
}

/// Descriptors with unique identities, ordered by key.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSet {
    by_key: BTreeMap<MigrationKey, MigrationDescriptor>,
}

impl DescriptorSet {
    /// Index descriptors, rejecting duplicate identities.
    pub fn new(descriptors: impl IntoIterator<Item = MigrationDescriptor>) -> Result<Self> {
        let mut by_key: BTreeMap<MigrationKey, MigrationDescriptor> = BTreeMap::new();
        for descriptor in descriptors {
            let key = descriptor.key();
            if let Some(existing) = by_key.get(&key) {
                return Err(MigrationError::DuplicateMigration {
                    identity: key.to_string(),
                    first: existing.script().to_string(),
                    second: descriptor.script().to_string(),
                });
            }
            by_key.insert(key, descriptor);
        }
        Ok(Self { by_key })
    }

    /// Look up a descriptor by identity.
    pub fn get(&self, key: &MigrationKey) -> Option<&MigrationDescriptor> {
        self.by_key.get(key)
    }

    /// All descriptors in key order.
    pub fn iter(&self) -> impl Iterator<Item = &MigrationDescriptor> {
        self.by_key.values()
    }

    /// Number of descriptors.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Highest version among versioned and baseline descriptors, or [`Version::EMPTY`].
    pub fn latest_version(&self) -> Version {
        self.iter()
            .filter(|d| matches!(d.kind(), MigrationKind::Versioned | MigrationKind::Baseline))
            .filter_map(|d| d.version().cloned())
            .max()
            .unwrap_or(Version::EMPTY)
    }
}
