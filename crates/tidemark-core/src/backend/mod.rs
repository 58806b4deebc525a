//! Database backend seam.
//!
//! The migration engine never talks to a concrete database. It sees a [`Backend`]
//! that reports its capabilities, classifies its own errors, and hands out
//! [`Connection`]s able to run opaque statements inside or outside a transaction.

pub mod memory;

use std::fmt;

pub use memory::{MemoryBackend, MemoryConnection};

/// Error reported by a backend, optionally carrying a SQLSTATE-style code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    code: Option<String>,
    message: String,
}

impl BackendError {
    /// Create an error without a code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Create an error with a SQLSTATE-style code.
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// The error code, if the backend supplied one.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for BackendError {}

/// Whether a failure may succeed when attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Serialization conflict, deadlock, lock timeout and similar.
    Transient,
    /// Anything else. Never retried.
    Permanent,
}

/// Classifies backend errors for the retry policy.
pub trait ErrorClassifier: Send + Sync {
    /// Classify a backend error.
    fn classify(&self, error: &BackendError) -> ErrorClass;
}

/// Classifier keyed on SQLSTATE codes.
#[derive(Debug, Clone)]
pub struct SqlStateClassifier {
    transient_codes: Vec<String>,
}

impl SqlStateClassifier {
    /// Serialization failure, deadlock detected, lock not available.
    pub const DEFAULT_TRANSIENT_CODES: [&'static str; 3] = ["40001", "40P01", "55P03"];

    /// Classifier that treats only the given codes as transient.
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            transient_codes: codes.into_iter().map(Into::into).collect(),
        }
    }

    /// Add another transient code.
    pub fn with_transient_code(mut self, code: impl Into<String>) -> Self {
        self.transient_codes.push(code.into());
        self
    }
}

impl Default for SqlStateClassifier {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TRANSIENT_CODES)
    }
}

impl ErrorClassifier for SqlStateClassifier {
    fn classify(&self, error: &BackendError) -> ErrorClass {
        match error.code() {
            Some(code) if self.transient_codes.iter().any(|c| c == code) => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }
}

/// A live session against the target database.
pub trait Connection {
    /// Open a transaction.
    fn begin(&mut self) -> Result<(), BackendError>;

    /// Commit the open transaction.
    fn commit(&mut self) -> Result<(), BackendError>;

    /// Roll back the open transaction.
    fn rollback(&mut self) -> Result<(), BackendError>;

    /// Execute one statement.
    fn execute(&mut self, statement: &str) -> Result<(), BackendError>;
}

/// Capability flags of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Schema changes inside a transaction are rolled back with it.
    pub ddl_transactions: bool,
    /// A blocking lock primitive exists for the history ledger.
    pub native_locking: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            ddl_transactions: true,
            native_locking: true,
        }
    }
}

/// The target database as seen by the migration engine.
pub trait Backend: Send + Sync {
    /// Human readable backend name, used in log output.
    fn name(&self) -> &str;

    /// Capability flags.
    fn capabilities(&self) -> Capabilities;

    /// Classify an error raised by this backend.
    fn classify(&self, error: &BackendError) -> ErrorClass;

    /// Open a connection.
    fn connect(&self) -> Result<Box<dyn Connection + '_>, BackendError>;

    /// Whether DDL can be rolled back as part of a transaction.
    fn supports_ddl_transactions(&self) -> bool {
        self.capabilities().ddl_transactions
    }

    /// Whether the ledger can be locked natively instead of with a polling lock row.
    fn supports_native_locking(&self) -> bool {
        self.capabilities().native_locking
    }
}
