// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-memory implementations of the services a task talks to, for tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use prometheus::Registry;
use tracing_subscriber::EnvFilter;

use crate::config::all_dyncfgs;
use crate::depend::DependTaskKey;
use crate::dyncfg::ConfigSet;
use crate::error::{ErrorCode, RedefinitionError};
use crate::ids::{
    ColumnId, Deadline, LogStreamId, NodeAddr, PartitionId, SchemaVersion, SnapshotVersion,
    TableId, TabletId, TaskId, TenantId,
};
use crate::metrics::RedefinitionMetrics;
use crate::record::MemTaskRecordStore;
use crate::schema::{ColumnSchema, CompatMode, DataType, Partition, TableSchema};
use crate::service::{
    AutoincService, AutoincSyncParam, Catalog, ChecksumStore, ChildJobResult, DdlRpc,
    DdlTaskRequest, JobDescriptor, JobSubmitter, LocationService, LockMode, LockService,
    ServiceStatus, Services, SessionOptions, SnapshotService, SqlExecutor, TabletAutoincRpc,
    TransactionBarrier,
};
use crate::tablet_seq::TabletAutoincBatch;

/// Installs a test writer for `RUST_LOG` controlled logging. Safe to call
/// from every test.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn column(id: u64, name: &str, data_type: DataType) -> ColumnSchema {
    ColumnSchema::new(ColumnId(id), name, data_type)
}

/// A MySQL mode table `t{id}` in database `db`, with one partition per
/// tablet. A table with a single tablet isn't partitioned.
pub fn table(id: TableId, columns: Vec<ColumnSchema>, tablets: &[u64]) -> TableSchema {
    let is_partitioned = tablets.len() > 1;
    let partitions = tablets
        .iter()
        .enumerate()
        .map(|(i, tablet)| {
            let partition = if is_partitioned {
                // Unique across tables.
                PartitionId(i64::try_from(id.0 * 100_000).expect("small table id") + i as i64)
            } else {
                PartitionId(i64::try_from(id.0).expect("small table id"))
            };
            Partition {
                id: partition,
                tablet: TabletId(*tablet),
            }
        })
        .collect();
    TableSchema {
        id,
        name: format!("t{}", id.0),
        database_name: "db".into(),
        schema_version: SchemaVersion(1),
        compat_mode: CompatMode::MySql,
        is_tmp_table: false,
        is_partitioned,
        partitions,
        columns,
        aux_lob_meta_table: None,
        aux_lob_piece_table: None,
        association_table: None,
        constraints: Vec::new(),
        foreign_keys: Vec::new(),
        order_autoinc_mode: false,
    }
}

#[derive(Debug)]
pub struct FakeCatalog {
    tables: Mutex<BTreeMap<TableId, TableSchema>>,
    latest_schema_version: Mutex<SchemaVersion>,
}

impl Default for FakeCatalog {
    fn default() -> Self {
        FakeCatalog {
            tables: Mutex::default(),
            latest_schema_version: Mutex::new(SchemaVersion(i64::MAX)),
        }
    }
}

impl FakeCatalog {
    pub fn put(&self, schema: TableSchema) {
        self.tables.lock().unwrap().insert(schema.id, schema);
    }

    pub fn update(&self, table: TableId, f: impl FnOnce(&mut TableSchema)) {
        let mut tables = self.tables.lock().unwrap();
        f(tables.get_mut(&table).expect("known table"));
    }

    pub fn remove(&self, table: TableId) -> Option<TableSchema> {
        self.tables.lock().unwrap().remove(&table)
    }

    pub fn set_latest_schema_version(&self, version: SchemaVersion) {
        *self.latest_schema_version.lock().unwrap() = version;
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    async fn get_table_schema(
        &self,
        _tenant: TenantId,
        table: TableId,
    ) -> Result<Option<TableSchema>, RedefinitionError> {
        Ok(self.tables.lock().unwrap().get(&table).cloned())
    }

    async fn latest_schema_version(
        &self,
        _tenant: TenantId,
    ) -> Result<SchemaVersion, RedefinitionError> {
        Ok(*self.latest_schema_version.lock().unwrap())
    }

    async fn get_tablets(
        &self,
        _tenant: TenantId,
        table: TableId,
    ) -> Result<Vec<TabletId>, RedefinitionError> {
        let tables = self.tables.lock().unwrap();
        let schema = tables
            .get(&table)
            .ok_or(RedefinitionError::TableNotExist(table))?;
        Ok(schema.tablet_ids().collect())
    }
}

/// Records every statement, failing those matching a scripted pattern once.
#[derive(Debug, Default)]
pub struct FakeSql {
    failures: Mutex<Vec<(String, ErrorCode)>>,
    executed: Mutex<Vec<(String, SessionOptions)>>,
    transactions: Mutex<Vec<Vec<String>>>,
}

impl FakeSql {
    pub fn fail_once(&self, pattern: &str, code: ErrorCode) {
        self.failures
            .lock()
            .unwrap()
            .push((pattern.to_owned(), code));
    }

    pub fn executed(&self) -> Vec<(String, SessionOptions)> {
        self.executed.lock().unwrap().clone()
    }

    pub fn transactions(&self) -> Vec<Vec<String>> {
        self.transactions.lock().unwrap().clone()
    }

    fn scripted_failure(&self, sql: &str) -> Result<(), RedefinitionError> {
        let mut failures = self.failures.lock().unwrap();
        match failures.iter().position(|(pattern, _)| sql.contains(pattern.as_str())) {
            Some(i) => {
                let (pattern, code) = failures.remove(i);
                Err(RedefinitionError::from_code(
                    code,
                    format!("scripted failure of {pattern}"),
                ))
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SqlExecutor for FakeSql {
    async fn execute(
        &self,
        _tenant: TenantId,
        sql: &str,
        _deadline: Deadline,
        session: &SessionOptions,
    ) -> Result<u64, RedefinitionError> {
        self.scripted_failure(sql)?;
        self.executed
            .lock()
            .unwrap()
            .push((sql.to_owned(), session.clone()));
        Ok(1)
    }

    async fn execute_in_transaction(
        &self,
        _tenant: TenantId,
        statements: &[String],
        _deadline: Deadline,
    ) -> Result<u64, RedefinitionError> {
        for statement in statements {
            self.scripted_failure(statement)?;
        }
        self.transactions.lock().unwrap().push(statements.to_vec());
        Ok(u64::try_from(statements.len()).expect("few statements"))
    }
}

/// Re-entrant exclusive locks. A table can be made to report contention a
/// number of times before it is granted.
#[derive(Debug, Default)]
pub struct FakeLocks {
    locked: Mutex<BTreeSet<TableId>>,
    contention: Mutex<BTreeMap<TableId, usize>>,
}

impl FakeLocks {
    pub fn contend(&self, table: TableId, times: usize) {
        self.contention.lock().unwrap().insert(table, times);
    }

    pub fn locked(&self) -> BTreeSet<TableId> {
        self.locked.lock().unwrap().clone()
    }
}

#[async_trait]
impl LockService for FakeLocks {
    async fn lock_table(
        &self,
        _tenant: TenantId,
        table: TableId,
        _mode: LockMode,
        _schema_version: SchemaVersion,
        _deadline: Deadline,
    ) -> Result<(), RedefinitionError> {
        if let Some(times) = self.contention.lock().unwrap().get_mut(&table) {
            if *times > 0 {
                *times -= 1;
                return Err(RedefinitionError::LockConflict { table });
            }
        }
        self.locked.lock().unwrap().insert(table);
        Ok(())
    }

    async fn unlock_table(
        &self,
        _tenant: TenantId,
        table: TableId,
        _mode: LockMode,
        _schema_version: SchemaVersion,
        _deadline: Deadline,
    ) -> Result<(), RedefinitionError> {
        if self.locked.lock().unwrap().remove(&table) {
            Ok(())
        } else {
            Err(RedefinitionError::LockNotExist { table })
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeSnapshots {
    held: Mutex<BTreeMap<SnapshotVersion, BTreeSet<TabletId>>>,
    discarded: Mutex<BTreeSet<SnapshotVersion>>,
    acquire_failure: Mutex<Option<RedefinitionError>>,
}

impl FakeSnapshots {
    pub fn held(&self, version: SnapshotVersion) -> BTreeSet<TabletId> {
        self.held
            .lock()
            .unwrap()
            .get(&version)
            .cloned()
            .unwrap_or_default()
    }

    /// Drops every snapshot pinned on `tablets`, as dropping their table does.
    pub fn forget(&self, tablets: &[TabletId]) {
        let mut held = self.held.lock().unwrap();
        for set in held.values_mut() {
            for tablet in tablets {
                set.remove(tablet);
            }
        }
        held.retain(|_, set| !set.is_empty());
    }

    /// Makes the next acquire fail with `err`.
    pub fn fail_next_acquire(&self, err: RedefinitionError) {
        *self.acquire_failure.lock().unwrap() = Some(err);
    }

    /// Makes acquiring `version` fail as if it was already reclaimed.
    pub fn discard(&self, version: SnapshotVersion) {
        self.discarded.lock().unwrap().insert(version);
    }
}

#[async_trait]
impl SnapshotService for FakeSnapshots {
    async fn acquire(
        &self,
        _tenant: TenantId,
        _schema_version: SchemaVersion,
        snapshot: SnapshotVersion,
        tablets: &[TabletId],
        _deadline: Deadline,
    ) -> Result<(), RedefinitionError> {
        if let Some(err) = self.acquire_failure.lock().unwrap().take() {
            return Err(err);
        }
        if self.discarded.lock().unwrap().contains(&snapshot) {
            return Err(RedefinitionError::SnapshotDiscarded { version: snapshot });
        }
        let mut held = self.held.lock().unwrap();
        held.entry(snapshot).or_default().extend(tablets.iter().copied());
        Ok(())
    }

    async fn release(
        &self,
        _tenant: TenantId,
        snapshot: SnapshotVersion,
        tablets: &[TabletId],
        _deadline: Deadline,
    ) -> Result<(), RedefinitionError> {
        let mut held = self.held.lock().unwrap();
        if let Some(set) = held.get_mut(&snapshot) {
            for tablet in tablets {
                set.remove(tablet);
            }
            if set.is_empty() {
                held.remove(&snapshot);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeBarrier {
    ready: Mutex<Option<SnapshotVersion>>,
}

impl FakeBarrier {
    pub fn set_ready(&self, version: Option<SnapshotVersion>) {
        *self.ready.lock().unwrap() = version;
    }
}

#[async_trait]
impl TransactionBarrier for FakeBarrier {
    async fn try_wait(
        &self,
        _tenant: TenantId,
        _table: TableId,
        _schema_version: SchemaVersion,
    ) -> Result<Option<SnapshotVersion>, RedefinitionError> {
        Ok(*self.ready.lock().unwrap())
    }
}

/// A failure injected into the tablet auto-increment RPCs. Fires once.
#[derive(Clone, Debug)]
pub enum RpcFailure {
    /// The whole RPC to the leader of `log_stream` fails.
    WholeBatch {
        apply: bool,
        log_stream: LogStreamId,
        code: ErrorCode,
    },
    /// The RPC succeeds, but reports `code` for `tablet`.
    Tablet {
        apply: bool,
        tablet: TabletId,
        code: ErrorCode,
    },
}

/// Tablet locations and per-tablet auto-increment cursors. Tablet `t` lives
/// on log stream `t % 3`.
#[derive(Debug, Default)]
pub struct FakeCluster {
    cursors: Mutex<BTreeMap<TabletId, u64>>,
    failures: Mutex<VecDeque<RpcFailure>>,
    calls: AtomicUsize,
}

impl FakeCluster {
    pub fn set_cursor(&self, tablet: TabletId, value: u64) {
        self.cursors.lock().unwrap().insert(tablet, value);
    }

    pub fn cursor(&self, tablet: TabletId) -> Option<u64> {
        self.cursors.lock().unwrap().get(&tablet).copied()
    }

    /// The number of batch RPCs served.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn script(&self, failure: RpcFailure) {
        self.failures.lock().unwrap().push_back(failure);
    }

    fn take_batch_failure(&self, apply: bool, log_stream: LogStreamId) -> Option<ErrorCode> {
        let mut failures = self.failures.lock().unwrap();
        let i = failures.iter().position(|f| {
            matches!(f, RpcFailure::WholeBatch { apply: a, log_stream: ls, .. }
                if *a == apply && *ls == log_stream)
        })?;
        match failures.remove(i) {
            Some(RpcFailure::WholeBatch { code, .. }) => Some(code),
            _ => None,
        }
    }

    fn take_tablet_failure(&self, apply: bool, tablet: TabletId) -> Option<ErrorCode> {
        let mut failures = self.failures.lock().unwrap();
        let i = failures.iter().position(|f| {
            matches!(f, RpcFailure::Tablet { apply: a, tablet: t, .. }
                if *a == apply && *t == tablet)
        })?;
        match failures.remove(i) {
            Some(RpcFailure::Tablet { code, .. }) => Some(code),
            _ => None,
        }
    }
}

#[async_trait]
impl LocationService for FakeCluster {
    async fn log_stream_of(
        &self,
        _tenant: TenantId,
        tablet: TabletId,
        _force_renew: bool,
    ) -> Result<LogStreamId, RedefinitionError> {
        Ok(LogStreamId(i64::try_from(tablet.0 % 3).expect("small")))
    }

    async fn leader_of(
        &self,
        _tenant: TenantId,
        log_stream: LogStreamId,
        _force_renew: bool,
    ) -> Result<NodeAddr, RedefinitionError> {
        Ok(NodeAddr(format!("node-{log_stream}")))
    }
}

#[async_trait]
impl TabletAutoincRpc for FakeCluster {
    async fn batch_get(
        &self,
        _leader: &NodeAddr,
        _deadline: Deadline,
        mut batch: TabletAutoincBatch,
    ) -> Result<TabletAutoincBatch, RedefinitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = self.take_batch_failure(false, batch.log_stream) {
            return Err(RedefinitionError::from_code(code, "scripted batch failure"));
        }
        for param in &mut batch.params {
            match self.take_tablet_failure(false, param.source_tablet) {
                Some(code) => param.ret_code = code,
                None => {
                    param.cached_sequence_value = self.cursor(param.source_tablet).unwrap_or(0);
                    param.ret_code = ErrorCode::SUCCESS;
                }
            }
        }
        Ok(batch)
    }

    async fn batch_set(
        &self,
        _leader: &NodeAddr,
        _deadline: Deadline,
        mut batch: TabletAutoincBatch,
    ) -> Result<TabletAutoincBatch, RedefinitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = self.take_batch_failure(true, batch.log_stream) {
            return Err(RedefinitionError::from_code(code, "scripted batch failure"));
        }
        for param in &mut batch.params {
            match self.take_tablet_failure(true, param.dest_tablet) {
                Some(code) => param.ret_code = code,
                None => {
                    self.set_cursor(param.dest_tablet, param.cached_sequence_value);
                    param.ret_code = ErrorCode::SUCCESS;
                }
            }
        }
        Ok(batch)
    }
}

#[derive(Debug, Default)]
pub struct FakeAutoinc {
    sequences: Mutex<BTreeMap<(TableId, ColumnId), u64>>,
    syncs: Mutex<Vec<AutoincSyncParam>>,
}

impl FakeAutoinc {
    pub fn set_sequence(&self, table: TableId, column: ColumnId, value: u64) {
        self.sequences.lock().unwrap().insert((table, column), value);
    }

    pub fn syncs(&self) -> Vec<AutoincSyncParam> {
        self.syncs.lock().unwrap().clone()
    }
}

#[async_trait]
impl AutoincService for FakeAutoinc {
    async fn get_sequence_value(
        &self,
        _tenant: TenantId,
        table: TableId,
        column: ColumnId,
        _order_mode: bool,
        _deadline: Deadline,
    ) -> Result<u64, RedefinitionError> {
        let sequences = self.sequences.lock().unwrap();
        Ok(sequences.get(&(table, column)).copied().unwrap_or(1))
    }

    async fn sync_insert_value_global(
        &self,
        param: AutoincSyncParam,
        _deadline: Deadline,
    ) -> Result<(), RedefinitionError> {
        self.syncs.lock().unwrap().push(param);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeChecksums {
    checksums: Mutex<BTreeMap<TableId, BTreeMap<ColumnId, i64>>>,
}

impl FakeChecksums {
    pub fn put(&self, table: TableId, checksums: BTreeMap<ColumnId, i64>) {
        self.checksums.lock().unwrap().insert(table, checksums);
    }
}

#[async_trait]
impl ChecksumStore for FakeChecksums {
    async fn get_table_column_checksums(
        &self,
        _tenant: TenantId,
        _execution_id: i64,
        table: TableId,
        _task_id: TaskId,
    ) -> Result<BTreeMap<ColumnId, i64>, RedefinitionError> {
        let checksums = self.checksums.lock().unwrap();
        Ok(checksums.get(&table).cloned().unwrap_or_default())
    }
}

/// Accepts every job once. Tests play the scheduler by taking the pending
/// jobs and reporting their completion.
#[derive(Debug, Default)]
pub struct FakeJobs {
    submitted: Mutex<Vec<JobDescriptor>>,
    pending: Mutex<Vec<JobDescriptor>>,
    keys: Mutex<BTreeSet<DependTaskKey>>,
    results: Mutex<BTreeMap<DependTaskKey, ChildJobResult>>,
}

impl FakeJobs {
    pub fn submitted(&self) -> Vec<JobDescriptor> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn take_pending(&self) -> Vec<JobDescriptor> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }

    /// Records the result of the job replying under `key`, as the scheduler
    /// does before the job reports to its parent.
    pub fn finish(&self, key: DependTaskKey, ret_code: ErrorCode, reported_value: Option<u64>) {
        let result = ChildJobResult {
            ret_code,
            reported_value,
        };
        self.results.lock().unwrap().insert(key, result);
    }
}

#[async_trait]
impl JobSubmitter for FakeJobs {
    async fn submit(&self, job: JobDescriptor) -> Result<TaskId, RedefinitionError> {
        let key = job.reply_key();
        if !self.keys.lock().unwrap().insert(key) {
            return Err(RedefinitionError::EntryExist(key.to_string()));
        }
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(job.clone());
        self.pending.lock().unwrap().push(job);
        Ok(TaskId(1000 + i64::try_from(submitted.len()).expect("few jobs")))
    }

    async fn result(
        &self,
        _tenant: TenantId,
        _parent: TaskId,
        key: DependTaskKey,
    ) -> Result<Option<ChildJobResult>, RedefinitionError> {
        Ok(self.results.lock().unwrap().get(&key).copied())
    }
}

#[derive(Debug, Default)]
pub struct FakeDdl {
    requests: Mutex<Vec<DdlTaskRequest>>,
}

impl FakeDdl {
    pub fn requests(&self) -> Vec<DdlTaskRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl DdlRpc for FakeDdl {
    async fn execute_ddl_task(
        &self,
        request: DdlTaskRequest,
        _deadline: Deadline,
    ) -> Result<(), RedefinitionError> {
        self.requests.lock().unwrap().push(request);
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeStatus {
    in_service: AtomicBool,
}

impl Default for FakeStatus {
    fn default() -> Self {
        FakeStatus {
            in_service: AtomicBool::new(true),
        }
    }
}

impl FakeStatus {
    pub fn set_in_service(&self, in_service: bool) {
        self.in_service.store(in_service, Ordering::SeqCst);
    }
}

impl ServiceStatus for FakeStatus {
    fn in_service(&self) -> bool {
        self.in_service.load(Ordering::SeqCst)
    }
}

/// A complete set of fakes, with fresh metrics and default configs.
#[derive(Debug)]
pub struct FakeEnv {
    pub catalog: Arc<FakeCatalog>,
    pub sql: Arc<FakeSql>,
    pub locks: Arc<FakeLocks>,
    pub snapshots: Arc<FakeSnapshots>,
    pub barrier: Arc<FakeBarrier>,
    pub cluster: Arc<FakeCluster>,
    pub autoinc: Arc<FakeAutoinc>,
    pub checksums: Arc<FakeChecksums>,
    pub jobs: Arc<FakeJobs>,
    pub ddl: Arc<FakeDdl>,
    pub status: Arc<FakeStatus>,
    pub records: Arc<MemTaskRecordStore>,
    pub metrics: RedefinitionMetrics,
    pub configs: ConfigSet,
}

impl FakeEnv {
    pub fn new() -> Self {
        let metrics =
            RedefinitionMetrics::register_into(&Registry::new()).expect("fresh registry");
        FakeEnv {
            catalog: Arc::default(),
            sql: Arc::default(),
            locks: Arc::default(),
            snapshots: Arc::default(),
            barrier: Arc::default(),
            cluster: Arc::default(),
            autoinc: Arc::default(),
            checksums: Arc::default(),
            jobs: Arc::default(),
            ddl: Arc::default(),
            status: Arc::default(),
            records: Arc::new(MemTaskRecordStore::new()),
            metrics,
            configs: all_dyncfgs(ConfigSet::default()),
        }
    }

    /// Drops `table` the way a concurrent DDL does: its tablets, and the
    /// snapshots pinned on them, go away with it.
    pub fn drop_table(&self, table: TableId) {
        if let Some(schema) = self.catalog.remove(table) {
            let tablets: Vec<_> = schema.tablet_ids().collect();
            self.snapshots.forget(&tablets);
        }
    }

    pub fn services(&self) -> Services {
        Services {
            catalog: Arc::clone(&self.catalog) as Arc<dyn Catalog>,
            sql: Arc::clone(&self.sql) as Arc<dyn SqlExecutor>,
            locks: Arc::clone(&self.locks) as Arc<dyn LockService>,
            snapshots: Arc::clone(&self.snapshots) as Arc<dyn SnapshotService>,
            barrier: Arc::clone(&self.barrier) as Arc<dyn TransactionBarrier>,
            location: Arc::clone(&self.cluster) as Arc<dyn LocationService>,
            tablet_rpc: Arc::clone(&self.cluster) as Arc<dyn TabletAutoincRpc>,
            autoinc: Arc::clone(&self.autoinc) as Arc<dyn AutoincService>,
            checksums: Arc::clone(&self.checksums) as Arc<dyn ChecksumStore>,
            jobs: Arc::clone(&self.jobs) as Arc<dyn JobSubmitter>,
            ddl: Arc::clone(&self.ddl) as Arc<dyn DdlRpc>,
            status: Arc::clone(&self.status) as Arc<dyn ServiceStatus>,
            records: Arc::clone(&self.records) as Arc<dyn crate::record::TaskRecordStore>,
        }
    }
}
