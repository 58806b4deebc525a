//! In-memory backend.
//!
//! Keeps a log of committed statements instead of a real schema. Capabilities can be
//! switched off to mimic engines without transactional DDL or native locks, and faults
//! can be injected per statement to exercise failure and retry paths.

use parking_lot::Mutex;

use super::{Backend, BackendError, Capabilities, Connection, ErrorClass, ErrorClassifier, SqlStateClassifier};

struct Fault {
    pattern: String,
    error: BackendError,
    /// `None` fails forever.
    remaining: Option<u32>,
}

#[derive(Default)]
struct MemoryState {
    committed: Vec<String>,
    faults: Vec<Fault>,
    connections_opened: u64,
}

/// Backend that records statements in memory.
pub struct MemoryBackend {
    name: String,
    capabilities: Capabilities,
    classifier: SqlStateClassifier,
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    /// A fully capable backend.
    pub fn new() -> Self {
        Self {
            name: "memory".to_string(),
            capabilities: Capabilities::default(),
            classifier: SqlStateClassifier::default(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Set the backend name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Toggle transactional DDL.
    pub fn with_ddl_transactions(mut self, enabled: bool) -> Self {
        self.capabilities.ddl_transactions = enabled;
        self
    }

    /// Toggle native locking.
    pub fn with_native_locking(mut self, enabled: bool) -> Self {
        self.capabilities.native_locking = enabled;
        self
    }

    /// Replace the error classifier.
    pub fn with_classifier(mut self, classifier: SqlStateClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Every statement containing `pattern` fails with `error`.
    pub fn fail_on(&self, pattern: impl Into<String>, error: BackendError) {
        self.state.lock().faults.push(Fault {
            pattern: pattern.into(),
            error,
            remaining: None,
        });
    }

    /// The next `times` statements containing `pattern` fail with `error`.
    pub fn fail_times(&self, pattern: impl Into<String>, times: u32, error: BackendError) {
        self.state.lock().faults.push(Fault {
            pattern: pattern.into(),
            error,
            remaining: Some(times),
        });
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Statements that took durable effect, in order.
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().committed.clone()
    }

    /// Number of connections handed out so far.
    pub fn connections_opened(&self) -> u64 {
        self.state.lock().connections_opened
    }

    fn check_faults(&self, statement: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        for fault in state.faults.iter_mut() {
            if !statement.contains(&fault.pattern) {
                continue;
            }
            match fault.remaining {
                None => return Err(fault.error.clone()),
                Some(0) => continue,
                Some(ref mut n) => {
                    *n -= 1;
                    return Err(fault.error.clone());
                }
            }
        }
        Ok(())
    }

    fn commit_statements(&self, statements: Vec<String>) {
        self.state.lock().committed.extend(statements);
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn classify(&self, error: &BackendError) -> ErrorClass {
        self.classifier.classify(error)
    }

    fn connect(&self) -> Result<Box<dyn Connection + '_>, BackendError> {
        self.state.lock().connections_opened += 1;
        Ok(Box::new(MemoryConnection {
            backend: self,
            pending: None,
        }))
    }
}

/// Connection to a [`MemoryBackend`].
///
/// Without transactional DDL every statement takes effect immediately, even inside
/// a transaction, the way DDL auto-commits on such engines.
pub struct MemoryConnection<'a> {
    backend: &'a MemoryBackend,
    pending: Option<Vec<String>>,
}

impl Connection for MemoryConnection<'_> {
    fn begin(&mut self) -> Result<(), BackendError> {
        if self.pending.is_some() {
            return Err(BackendError::new("transaction already open"));
        }
        self.pending = Some(Vec::new());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        let statements = self
            .pending
            .take()
            .ok_or_else(|| BackendError::new("no open transaction"))?;
        self.backend.commit_statements(statements);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), BackendError> {
        self.pending
            .take()
            .ok_or_else(|| BackendError::new("no open transaction"))?;
        Ok(())
    }

    fn execute(&mut self, statement: &str) -> Result<(), BackendError> {
        self.backend.check_faults(statement)?;
        match self.pending.as_mut() {
            Some(pending) if self.backend.capabilities.ddl_transactions => {
                pending.push(statement.to_string());
            }
            _ => self.backend.commit_statements(vec![statement.to_string()]),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_makes_statements_durable() {
        let backend = MemoryBackend::new();
        let mut conn = backend.connect().unwrap();
        conn.begin().unwrap();
        conn.execute("CREATE TABLE a").unwrap();
        assert!(backend.executed().is_empty());
        conn.commit().unwrap();
        assert_eq!(backend.executed(), vec!["CREATE TABLE a".to_string()]);
    }

    #[test]
    fn test_rollback_discards_statements() {
        let backend = MemoryBackend::new();
        let mut conn = backend.connect().unwrap();
        conn.begin().unwrap();
        conn.execute("CREATE TABLE a").unwrap();
        conn.rollback().unwrap();
        assert!(backend.executed().is_empty());
    }

    #[test]
    fn test_non_transactional_ddl_applies_immediately() {
        let backend = MemoryBackend::new().with_ddl_transactions(false);
        let mut conn = backend.connect().unwrap();
        conn.begin().unwrap();
        conn.execute("CREATE TABLE a").unwrap();
        conn.rollback().unwrap();
        assert_eq!(backend.executed(), vec!["CREATE TABLE a".to_string()]);
    }

    #[test]
    fn test_fail_times_then_succeed() {
        let backend = MemoryBackend::new();
        backend.fail_times("INSERT", 2, BackendError::with_code("40001", "conflict"));

        let mut conn = backend.connect().unwrap();
        assert!(conn.execute("INSERT 1").is_err());
        assert!(conn.execute("INSERT 1").is_err());
        assert!(conn.execute("INSERT 1").is_ok());
        assert_eq!(backend.executed().len(), 1);
    }

    #[test]
    fn test_fail_on_is_permanent() {
        let backend = MemoryBackend::new();
        backend.fail_on("DROP", BackendError::new("nope"));
        let mut conn = backend.connect().unwrap();
        for _ in 0..3 {
            assert_eq!(conn.execute("DROP TABLE a").unwrap_err().message(), "nope");
        }
        backend.clear_faults();
        assert!(conn.execute("DROP TABLE a").is_ok());
    }

    #[test]
    fn test_capabilities() {
        let backend = MemoryBackend::new()
            .with_ddl_transactions(false)
            .with_native_locking(false)
            .with_name("mysql-like");
        assert_eq!(backend.name(), "mysql-like");
        assert!(!backend.supports_ddl_transactions());
        assert!(!backend.supports_native_locking());
    }
}
