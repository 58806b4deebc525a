//! Integration tests for the migration engine.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tidemark_core::history::{AttemptMarker, HistoryLock, NewHistoryRecord, RecordUpdate, SchemaHistoryStore};
use tidemark_core::{
    BackendError, Connection, DescriptorSet, Error, FnMigration, HistoryRecord, InMemoryHistory,
    LockConfig, LockMode, MemoryBackend, MigrateConfig, MigrationDescriptor, MigrationError,
    MigrationExecutor, MigrationKey, MigrationState, RetryConfig, SledHistory, Version,
};

struct TestContext {
    backend: Arc<MemoryBackend>,
    store: Arc<dyn SchemaHistoryStore>,
    _db: Option<sled::Db>,
}

impl TestContext {
    fn in_memory() -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new()),
            store: Arc::new(InMemoryHistory::new()),
            _db: None,
        }
    }

    fn sled() -> Self {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = SledHistory::open(&db).unwrap();
        Self {
            backend: Arc::new(MemoryBackend::new()),
            store: Arc::new(store),
            _db: Some(db),
        }
    }

    fn with_backend(mut self, backend: MemoryBackend) -> Self {
        self.backend = Arc::new(backend);
        self
    }

    fn executor(&self, descriptors: DescriptorSet, config: MigrateConfig) -> MigrationExecutor {
        MigrationExecutor::new(self.backend.clone(), self.store.clone(), descriptors, config)
    }
}

fn v(s: &str) -> Version {
    Version::parse(s).unwrap()
}

fn config() -> MigrateConfig {
    MigrateConfig::default()
        .with_installed_by("integration")
        .with_lock(
            LockConfig::default()
                .with_poll_interval(Duration::from_millis(1))
                .with_max_poll_interval(Duration::from_millis(5)),
        )
        .with_retry(
            RetryConfig::default()
                .with_max_attempts(5)
                .with_backoff(Duration::from_millis(1)),
        )
}

fn scripts(names: &[(&str, &str)]) -> DescriptorSet {
    DescriptorSet::new(
        names
            .iter()
            .map(|(name, text)| MigrationDescriptor::sql(name, text).unwrap()),
    )
    .unwrap()
}

fn five_tables() -> DescriptorSet {
    scripts(&[
        ("V1__create_a.sql", "CREATE TABLE a"),
        ("V2__create_b.sql", "CREATE TABLE b"),
        ("V3__create_c.sql", "CREATE TABLE c"),
        ("V4__create_d.sql", "CREATE TABLE d"),
        ("V5__create_e.sql", "CREATE TABLE e"),
    ])
}

#[test]
fn test_migrate_converges() {
    let ctx = TestContext::in_memory();
    let executor = ctx.executor(five_tables(), config());

    let first = executor.migrate().unwrap();
    assert_eq!(first.migrations_executed, 5);
    assert_eq!(first.target_version, v("5"));

    let second = executor.migrate().unwrap();
    assert_eq!(second.migrations_executed, 0);
    assert_eq!(second.initial_version, v("5"));
    assert!(executor.plan_next(&Version::LATEST).unwrap().is_none());
}

#[test]
fn test_ranks_are_monotonic() {
    let ctx = TestContext::sled();
    let executor = ctx.executor(five_tables(), config());
    executor.migrate().unwrap();

    let ranks: Vec<u64> = ctx.store.all().unwrap().iter().map(|r| r.installed_rank).collect();
    assert_eq!(ranks, vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_info_is_deterministic() {
    let ctx = TestContext::in_memory();
    let executor = ctx.executor(five_tables(), config());
    executor.apply_all(&v("3")).unwrap();

    let render = || {
        executor
            .info()
            .unwrap()
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
    };
    let first = render();
    for _ in 0..5 {
        assert_eq!(render(), first);
    }
}

fn assert_no_double_apply(ctx: TestContext, threads: usize) {
    let ctx = Arc::new(ctx);
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let ctx = ctx.clone();
            thread::spawn(move || ctx.executor(five_tables(), config()).migrate().unwrap())
        })
        .collect();

    let executed: usize = handles
        .into_iter()
        .map(|h| h.join().unwrap().migrations_executed)
        .sum();
    assert_eq!(executed, 5);

    let rows = ctx.store.all().unwrap();
    assert_eq!(rows.len(), 5);
    assert!(rows.iter().all(|r| r.success));
    assert_eq!(ctx.backend.executed().len(), 5);
}

#[test]
fn test_concurrent_migrate_native_lock() {
    assert_no_double_apply(TestContext::in_memory(), 4);
}

#[test]
fn test_concurrent_migrate_row_lock() {
    let ctx = TestContext::in_memory().with_backend(MemoryBackend::new().with_native_locking(false));
    assert_no_double_apply(ctx, 4);
}

#[test]
fn test_concurrent_migrate_sled() {
    assert_no_double_apply(TestContext::sled(), 4);
}

#[test]
fn test_concurrent_migrate_sled_row_lock() {
    let ctx = TestContext::sled().with_backend(MemoryBackend::new().with_native_locking(false));
    assert_no_double_apply(ctx, 4);
}

#[test]
fn test_out_of_order_gap() {
    let ctx = TestContext::in_memory();
    ctx.executor(
        scripts(&[
            ("V1__create_a.sql", "CREATE TABLE a"),
            ("V3__create_c.sql", "CREATE TABLE c"),
        ]),
        config(),
    )
    .migrate()
    .unwrap();

    let with_gap = || {
        scripts(&[
            ("V1__create_a.sql", "CREATE TABLE a"),
            ("V2__create_b.sql", "CREATE TABLE b"),
            ("V3__create_c.sql", "CREATE TABLE c"),
        ])
    };

    let strict = ctx.executor(with_gap(), config().with_validate_on_migrate(false));
    assert!(strict.plan_next(&Version::LATEST).unwrap().is_none());
    assert_eq!(
        strict.info().unwrap().get(&MigrationKey::Versioned(v("2"))).unwrap().state(),
        MigrationState::OutOfOrder
    );
    let result = strict.migrate().unwrap();
    assert_eq!(result.migrations_executed, 0);
    assert_eq!(result.warnings.len(), 1);

    let lenient = ctx.executor(with_gap(), config().with_out_of_order(true));
    assert_eq!(
        lenient.plan_next(&Version::LATEST).unwrap().unwrap().version(),
        Some(&v("2"))
    );
    let result = lenient.migrate().unwrap();
    assert_eq!(result.migrations_executed, 1);
    assert!(result.migrations[0].out_of_order);
    assert_eq!(result.target_version, v("3"));

    let infos = lenient.info().unwrap();
    let two = infos.get(&MigrationKey::Versioned(v("2"))).unwrap();
    assert_eq!(two.state(), MigrationState::Success);
    assert!(two.applied_out_of_order());
}

#[test]
fn test_checksum_drift_is_reported() {
    let ctx = TestContext::sled();
    ctx.executor(scripts(&[("V1__create_a.sql", "CREATE TABLE a")]), config())
        .migrate()
        .unwrap();

    let edited = ctx.executor(
        scripts(&[("V1__create_a.sql", "CREATE TABLE a (id INT)")]),
        config(),
    );
    let found = edited.validate().unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].identity, "version 1");
    assert!(matches!(edited.migrate(), Err(MigrationError::Validation(_))));

    edited.repair().unwrap();
    assert!(edited.validate().unwrap().is_empty());
}

#[test]
fn test_line_endings_do_not_change_checksums() {
    let ctx = TestContext::in_memory();
    ctx.executor(
        scripts(&[("V1__create_a.sql", "CREATE TABLE a;\nCREATE TABLE b;\n")]),
        config(),
    )
    .migrate()
    .unwrap();

    let crlf = ctx.executor(
        scripts(&[("V1__create_a.sql", "CREATE TABLE a;\r\nCREATE TABLE b;\r\n")]),
        config(),
    );
    assert!(crlf.validate().unwrap().is_empty());
}

#[test]
fn test_repeatable_reruns_on_change() {
    let ctx = TestContext::in_memory();
    let set = |view: &str| {
        scripts(&[
            ("V1__create_a.sql", "CREATE TABLE a"),
            ("R__views.sql", view),
        ])
    };

    assert_eq!(
        ctx.executor(set("CREATE VIEW v AS SELECT 1"), config()).migrate().unwrap().migrations_executed,
        2
    );
    assert_eq!(
        ctx.executor(set("CREATE VIEW v AS SELECT 1"), config()).migrate().unwrap().migrations_executed,
        0
    );

    let changed = ctx.executor(set("CREATE VIEW v AS SELECT 2"), config());
    assert_eq!(changed.migrate().unwrap().migrations_executed, 1);

    let infos = changed.info().unwrap();
    let states: Vec<MigrationState> = infos.iter().map(|i| i.state()).collect();
    assert_eq!(
        states,
        vec![MigrationState::Success, MigrationState::Success, MigrationState::Superseded]
    );
}

#[test]
fn test_failure_halts_without_ddl_transactions() {
    let ctx = TestContext::in_memory().with_backend(MemoryBackend::new().with_ddl_transactions(false));
    ctx.backend.fail_on("broken", BackendError::new("syntax error near broken"));
    let executor = ctx.executor(
        scripts(&[
            ("V1__create_a.sql", "CREATE TABLE a"),
            ("V2__partial.sql", "CREATE TABLE b; broken"),
            ("V3__create_c.sql", "CREATE TABLE c"),
        ]),
        config(),
    );

    match executor.migrate() {
        Err(MigrationError::MigrationFailed { state, .. }) => {
            assert_eq!(state.to_string(), "partially applied")
        }
        other => panic!("unexpected outcome {:?}", other.map(|r| r.migrations_executed)),
    }
    assert!(matches!(
        executor.migrate(),
        Err(MigrationError::FailedMigrationPresent { .. })
    ));
    assert_eq!(
        ctx.backend.executed(),
        vec!["CREATE TABLE a".to_string(), "CREATE TABLE b".to_string()]
    );

    let infos = executor.info().unwrap();
    assert_eq!(infos.failed().count(), 1);
    assert_eq!(infos.current_version(), &v("1"));
}

#[test]
fn test_transient_failures_are_retried() {
    let ctx = TestContext::in_memory();
    ctx.backend
        .fail_times("CREATE TABLE b", 3, BackendError::with_code("40P01", "deadlock detected"));
    let executor = ctx.executor(five_tables(), config());

    let result = executor.migrate().unwrap();
    assert_eq!(result.migrations_executed, 5);
    assert!(ctx.store.all().unwrap().iter().all(|r| r.success));
}

#[test]
fn test_baseline_then_migrate() {
    let ctx = TestContext::sled();
    let executor = ctx.executor(
        five_tables(),
        config().with_baseline(v("3"), "existing schema"),
    );

    assert_eq!(executor.baseline().unwrap(), Some(1));
    let result = executor.migrate().unwrap();
    assert_eq!(result.initial_version, v("3"));
    assert_eq!(result.migrations_executed, 2);
    assert_eq!(
        ctx.backend.executed(),
        vec!["CREATE TABLE d".to_string(), "CREATE TABLE e".to_string()]
    );

    let infos = executor.info().unwrap();
    assert_eq!(infos.baseline(), Some(&v("3")));
    assert_eq!(infos.with_state(MigrationState::BelowBaseline).count(), 2);
}

#[test]
fn test_interrupted_attempt_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = MigrationDescriptor::sql("V1__create_a.sql", "CREATE TABLE a").unwrap();
    {
        let db = sled::open(dir.path()).unwrap();
        let store = SledHistory::open(&db).unwrap();
        store.create_if_absent().unwrap();
        store
            .record_attempt(&AttemptMarker::for_descriptor(&descriptor, false, "crashed", 5))
            .unwrap();
        db.flush().unwrap();
    }

    let db = sled::open(dir.path()).unwrap();
    let store: Arc<dyn SchemaHistoryStore> = Arc::new(SledHistory::open(&db).unwrap());
    let executor = MigrationExecutor::new(
        Arc::new(MemoryBackend::new()),
        store.clone(),
        DescriptorSet::new([descriptor]).unwrap(),
        config(),
    );

    assert!(matches!(
        executor.migrate(),
        Err(MigrationError::FailedMigrationPresent { .. })
    ));
    assert_eq!(store.all().unwrap().len(), 1);

    let report = executor.repair().unwrap();
    assert_eq!(report.removed_failed, 1);
    assert_eq!(executor.migrate().unwrap().migrations_executed, 1);
}

#[test]
fn test_target_and_ignore_patterns() {
    let ctx = TestContext::in_memory();
    let executor = ctx.executor(
        five_tables(),
        config()
            .with_target(v("4"))
            .with_ignore_pattern("V2__*"),
    );

    let result = executor.migrate().unwrap();
    assert_eq!(result.migrations_executed, 3);
    assert_eq!(result.target_version, v("4"));

    let infos = executor.info().unwrap();
    assert_eq!(
        infos.get(&MigrationKey::Versioned(v("2"))).unwrap().state(),
        MigrationState::Ignored
    );
    assert_eq!(
        infos.get(&MigrationKey::Versioned(v("5"))).unwrap().state(),
        MigrationState::AboveTarget
    );
}

fn slow_migration(runs: Arc<AtomicUsize>) -> DescriptorSet {
    let body = FnMigration::new(move |conn: &mut dyn Connection| {
        runs.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(400));
        conn.execute("CREATE TABLE slow")
    });
    DescriptorSet::new([MigrationDescriptor::versioned(v("1"), "slow", Arc::new(body))]).unwrap()
}

#[test]
fn test_lock_holder_outlives_stale_expiry() {
    let ctx = Arc::new(TestContext::in_memory().with_backend(MemoryBackend::new().with_native_locking(false)));
    let runs = Arc::new(AtomicUsize::new(0));
    let descriptors = slow_migration(runs.clone());
    let lock = LockConfig::default()
        .with_poll_interval(Duration::from_millis(1))
        .with_max_poll_interval(Duration::from_millis(5))
        .with_stale_after(Duration::from_millis(100))
        .with_acquire_timeout(Duration::from_secs(5));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let ctx = ctx.clone();
            let descriptors = descriptors.clone();
            let lock = lock.clone();
            thread::spawn(move || ctx.executor(descriptors, config().with_lock(lock)).migrate().unwrap())
        })
        .collect();
    let executed: usize = handles
        .into_iter()
        .map(|h| h.join().unwrap().migrations_executed)
        .sum();

    assert_eq!(executed, 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.backend.executed(), vec!["CREATE TABLE slow".to_string()]);
    assert_eq!(ctx.store.all().unwrap().len(), 1);
}

#[test]
fn test_rolled_back_failure_retries_without_repair() {
    let ctx = TestContext::sled();
    ctx.backend.fail_on("broken", BackendError::new("syntax error near broken"));
    let executor = ctx.executor(
        scripts(&[
            ("V1__create_a.sql", "CREATE TABLE a"),
            ("V2__fixed_later.sql", "CREATE TABLE b; broken"),
        ]),
        config(),
    );

    match executor.migrate() {
        Err(MigrationError::MigrationFailed { state, .. }) => assert_eq!(state.to_string(), "rolled back"),
        other => panic!("unexpected outcome {:?}", other.map(|r| r.migrations_executed)),
    }
    assert_eq!(executor.info().unwrap().failed().count(), 0);
    assert_eq!(executor.info().unwrap().current_version(), &v("1"));

    ctx.backend.clear_faults();
    let result = executor.migrate().unwrap();
    assert_eq!(result.migrations_executed, 1);
    assert_eq!(result.target_version, v("2"));
    assert!(ctx.store.all().unwrap().iter().all(|r| r.success));
}

/// Ledger whose first append fails, as if the process died right after the commit.
struct LostAppend {
    inner: InMemoryHistory,
    armed: AtomicBool,
}

impl SchemaHistoryStore for LostAppend {
    fn exists(&self) -> Result<bool, Error> {
        self.inner.exists()
    }

    fn create_if_absent(&self) -> Result<(), Error> {
        self.inner.create_if_absent()
    }

    fn lock(&self, mode: LockMode, config: &LockConfig) -> Result<HistoryLock<'_>, Error> {
        self.inner.lock(mode, config)
    }

    fn all(&self) -> Result<Vec<HistoryRecord>, Error> {
        self.inner.all()
    }

    fn append(&self, record: NewHistoryRecord) -> Result<u64, Error> {
        if self.armed.swap(false, Ordering::SeqCst) {
            return Err(Error::InvalidData("connection lost".into()));
        }
        self.inner.append(record)
    }

    fn remove_failed(&self) -> Result<usize, Error> {
        self.inner.remove_failed()
    }

    fn update(&self, rank: u64, update: RecordUpdate) -> Result<(), Error> {
        self.inner.update(rank, update)
    }

    fn record_attempt(&self, marker: &AttemptMarker) -> Result<(), Error> {
        self.inner.record_attempt(marker)
    }

    fn clear_attempt(&self) -> Result<(), Error> {
        self.inner.clear_attempt()
    }

    fn interrupted_attempt(&self) -> Result<Option<AttemptMarker>, Error> {
        self.inner.interrupted_attempt()
    }
}

#[test]
fn test_commit_without_ledger_row_is_not_reapplied() {
    let backend = Arc::new(MemoryBackend::new());
    let store = Arc::new(LostAppend {
        inner: InMemoryHistory::new(),
        armed: AtomicBool::new(true),
    });
    let executor = MigrationExecutor::new(
        backend.clone(),
        store.clone(),
        scripts(&[("V1__create_a.sql", "CREATE TABLE a")]),
        config(),
    );

    assert!(executor.migrate().is_err());
    assert_eq!(backend.executed(), vec!["CREATE TABLE a".to_string()]);
    assert!(store.interrupted_attempt().unwrap().is_some());

    assert!(matches!(
        executor.migrate(),
        Err(MigrationError::FailedMigrationPresent { .. })
    ));
    assert_eq!(backend.executed(), vec!["CREATE TABLE a".to_string()]);
    assert!(store.interrupted_attempt().unwrap().is_none());
    let rows = store.all().unwrap();
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].success);
}
