// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Interfaces of the services a redefinition task coordinates.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::depend::DependTaskKey;
use crate::error::{ErrorCode, RedefinitionError};
use crate::ids::{
    ColumnId, ConstraintId, Deadline, ForeignKeyId, LogStreamId, NodeAddr, SchemaVersion,
    SnapshotVersion, TableId, TabletId, TaskId, TenantId,
};
use crate::record::TaskRecordStore;
use crate::schema::{CompatMode, DataType, SqlMode, TableSchema};
use crate::tablet_seq::TabletAutoincBatch;

/// Read access to the versioned schema catalog.
#[async_trait]
pub trait Catalog: Debug + Send + Sync {
    /// The latest schema of `table`, or `None` if it doesn't exist.
    async fn get_table_schema(
        &self,
        tenant: TenantId,
        table: TableId,
    ) -> Result<Option<TableSchema>, RedefinitionError>;

    async fn latest_schema_version(
        &self,
        tenant: TenantId,
    ) -> Result<SchemaVersion, RedefinitionError>;

    /// All tablets of `table`, in partition order.
    async fn get_tablets(
        &self,
        tenant: TenantId,
        table: TableId,
    ) -> Result<Vec<TabletId>, RedefinitionError>;

    async fn table_exists(
        &self,
        tenant: TenantId,
        table: TableId,
    ) -> Result<bool, RedefinitionError> {
        Ok(self.get_table_schema(tenant, table).await?.is_some())
    }
}

/// Options of the privileged session running generated statements.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub compat_mode: CompatMode,
    pub sql_mode: SqlMode,
    pub is_ddl: bool,
    pub source_table_hidden: bool,
    pub dest_table_hidden: bool,
    pub heap_table_ddl: bool,
}

impl SessionOptions {
    /// A plain DDL session in the given dialect.
    pub fn ddl(compat_mode: CompatMode, sql_mode: SqlMode) -> Self {
        SessionOptions {
            compat_mode,
            sql_mode,
            is_ddl: true,
            source_table_hidden: false,
            dest_table_hidden: true,
            heap_table_ddl: false,
        }
    }
}

/// Runs SQL as a privileged session.
#[async_trait]
pub trait SqlExecutor: Debug + Send + Sync {
    /// Runs a single statement, returning the number of affected rows.
    async fn execute(
        &self,
        tenant: TenantId,
        sql: &str,
        deadline: Deadline,
        session: &SessionOptions,
    ) -> Result<u64, RedefinitionError>;

    /// Runs all `statements` in one transaction, committing only if every
    /// one of them succeeds.
    async fn execute_in_transaction(
        &self,
        tenant: TenantId,
        statements: &[String],
        deadline: Deadline,
    ) -> Result<u64, RedefinitionError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    Share,
    Exclusive,
}

/// The cluster-wide table lock service.
#[async_trait]
pub trait LockService: Debug + Send + Sync {
    /// Locks `table` on behalf of the DDL at `schema_version`. Relocking a
    /// table already locked for the same schema version succeeds.
    async fn lock_table(
        &self,
        tenant: TenantId,
        table: TableId,
        mode: LockMode,
        schema_version: SchemaVersion,
        deadline: Deadline,
    ) -> Result<(), RedefinitionError>;

    async fn unlock_table(
        &self,
        tenant: TenantId,
        table: TableId,
        mode: LockMode,
        schema_version: SchemaVersion,
        deadline: Deadline,
    ) -> Result<(), RedefinitionError>;
}

/// Multi-version snapshots pinned across tablets.
#[async_trait]
pub trait SnapshotService: Debug + Send + Sync {
    /// Pins `snapshot` on every tablet, atomically. Fails with
    /// [`RedefinitionError::SnapshotDiscarded`] if the version was already
    /// reclaimed on any of them. Acquiring an already held snapshot succeeds.
    async fn acquire(
        &self,
        tenant: TenantId,
        schema_version: SchemaVersion,
        snapshot: SnapshotVersion,
        tablets: &[TabletId],
        deadline: Deadline,
    ) -> Result<(), RedefinitionError>;

    async fn release(
        &self,
        tenant: TenantId,
        snapshot: SnapshotVersion,
        tablets: &[TabletId],
        deadline: Deadline,
    ) -> Result<(), RedefinitionError>;
}

/// Tracks transactions that may still observe a table's old schema.
#[async_trait]
pub trait TransactionBarrier: Debug + Send + Sync {
    /// Returns the earliest snapshot version at which no transaction started
    /// under a schema older than `schema_version` can still be running, or
    /// `None` if such transactions are still in flight.
    async fn try_wait(
        &self,
        tenant: TenantId,
        table: TableId,
        schema_version: SchemaVersion,
    ) -> Result<Option<SnapshotVersion>, RedefinitionError>;
}

/// Resolves tablets to log streams and log streams to their leaders.
#[async_trait]
pub trait LocationService: Debug + Send + Sync {
    async fn log_stream_of(
        &self,
        tenant: TenantId,
        tablet: TabletId,
        force_renew: bool,
    ) -> Result<LogStreamId, RedefinitionError>;

    async fn leader_of(
        &self,
        tenant: TenantId,
        log_stream: LogStreamId,
        force_renew: bool,
    ) -> Result<NodeAddr, RedefinitionError>;
}

/// Batched per-tablet auto-increment cursor RPCs, served by the leader of the
/// log stream owning the tablets.
#[async_trait]
pub trait TabletAutoincRpc: Debug + Send + Sync {
    /// Reads the cursor of every source tablet in `batch`. The response
    /// carries one entry per requested tablet with its own result code.
    async fn batch_get(
        &self,
        leader: &NodeAddr,
        deadline: Deadline,
        batch: TabletAutoincBatch,
    ) -> Result<TabletAutoincBatch, RedefinitionError>;

    /// Writes the cursor of every destination tablet in `batch`.
    async fn batch_set(
        &self,
        leader: &NodeAddr,
        deadline: Deadline,
        batch: TabletAutoincBatch,
    ) -> Result<TabletAutoincBatch, RedefinitionError>;
}

/// Synchronizes a table's global auto-increment cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoincSyncParam {
    pub tenant: TenantId,
    pub table: TableId,
    pub column: ColumnId,
    pub column_type: DataType,
    pub partition_count: usize,
    pub order_mode: bool,
    /// The largest value that is no longer available to inserts.
    pub value_to_sync: u64,
}

/// The global auto-increment service.
#[async_trait]
pub trait AutoincService: Debug + Send + Sync {
    /// The next available value of the sequence backing `column`.
    async fn get_sequence_value(
        &self,
        tenant: TenantId,
        table: TableId,
        column: ColumnId,
        order_mode: bool,
        deadline: Deadline,
    ) -> Result<u64, RedefinitionError>;

    async fn sync_insert_value_global(
        &self,
        param: AutoincSyncParam,
        deadline: Deadline,
    ) -> Result<(), RedefinitionError>;
}

/// Per-column checksums computed while copying a table.
#[async_trait]
pub trait ChecksumStore: Debug + Send + Sync {
    async fn get_table_column_checksums(
        &self,
        tenant: TenantId,
        execution_id: i64,
        table: TableId,
        task_id: TaskId,
    ) -> Result<BTreeMap<ColumnId, i64>, RedefinitionError>;
}

/// A child job. Every job reports its completion under `reply_key` through
/// the parent's [`ChildTaskNotifier`](crate::depend::ChildTaskNotifier).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobDescriptor {
    /// Fails unless `table` is empty.
    CheckTableEmpty {
        tenant: TenantId,
        parent: TaskId,
        table: TableId,
        target: TableId,
        schema_version: SchemaVersion,
        reply_key: DependTaskKey,
    },
    /// Rewrites the values of a column newly turned into auto-increment.
    UpdateAutoincSequence {
        tenant: TenantId,
        parent: TaskId,
        table: TableId,
        target: TableId,
        schema_version: SchemaVersion,
        column: ColumnId,
        column_type: DataType,
        sql_mode: SqlMode,
        reply_key: DependTaskKey,
    },
    /// Validates a check constraint of the shadow table.
    CheckConstraint {
        tenant: TenantId,
        parent: TaskId,
        table: TableId,
        constraint: ConstraintId,
        schema_version: SchemaVersion,
        reply_key: DependTaskKey,
    },
    /// Builds and validates a foreign key of the shadow table.
    ForeignKey {
        tenant: TenantId,
        parent: TaskId,
        table: TableId,
        hidden_table: TableId,
        foreign_key: ForeignKeyId,
        name: String,
        validate: bool,
        schema_version: SchemaVersion,
        reply_key: DependTaskKey,
    },
}

impl JobDescriptor {
    pub fn reply_key(&self) -> DependTaskKey {
        match self {
            JobDescriptor::CheckTableEmpty { reply_key, .. }
            | JobDescriptor::UpdateAutoincSequence { reply_key, .. }
            | JobDescriptor::CheckConstraint { reply_key, .. }
            | JobDescriptor::ForeignKey { reply_key, .. } => *reply_key,
        }
    }
}

/// The result a finished child job left with the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildJobResult {
    pub ret_code: ErrorCode,
    pub reported_value: Option<u64>,
}

/// Schedules child jobs.
#[async_trait]
pub trait JobSubmitter: Debug + Send + Sync {
    /// Durably schedules `job`. Fails with [`RedefinitionError::EntryExist`]
    /// if an identical job was already scheduled.
    async fn submit(&self, job: JobDescriptor) -> Result<TaskId, RedefinitionError>;

    /// The result the job of `parent` replying under `key` finished with, or
    /// `None` while it runs. Results are kept until the parent's record is
    /// removed.
    async fn result(
        &self,
        tenant: TenantId,
        parent: TaskId,
        key: DependTaskKey,
    ) -> Result<Option<ChildJobResult>, RedefinitionError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DdlTaskType {
    /// Atomically exchanges the metadata of a table and its shadow table.
    SwapTable,
    /// Drops whatever is left of the table that lost the swap, or of the
    /// shadow table if the redefinition failed.
    CleanupGarbage,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DdlTaskRequest {
    pub task_type: DdlTaskType,
    pub tenant: TenantId,
    pub table: TableId,
    pub hidden_table: TableId,
    pub task_id: TaskId,
}

/// Executes metadata-only DDL on the local node.
#[async_trait]
pub trait DdlRpc: Debug + Send + Sync {
    async fn execute_ddl_task(
        &self,
        request: DdlTaskRequest,
        deadline: Deadline,
    ) -> Result<(), RedefinitionError>;
}

/// Whether this process still owns DDL scheduling.
pub trait ServiceStatus: Debug + Send + Sync {
    fn in_service(&self) -> bool;
}

/// Everything a redefinition task talks to.
#[derive(Clone, Debug)]
pub struct Services {
    pub catalog: Arc<dyn Catalog>,
    pub sql: Arc<dyn SqlExecutor>,
    pub locks: Arc<dyn LockService>,
    pub snapshots: Arc<dyn SnapshotService>,
    pub barrier: Arc<dyn TransactionBarrier>,
    pub location: Arc<dyn LocationService>,
    pub tablet_rpc: Arc<dyn TabletAutoincRpc>,
    pub autoinc: Arc<dyn AutoincService>,
    pub checksums: Arc<dyn ChecksumStore>,
    pub jobs: Arc<dyn JobSubmitter>,
    pub ddl: Arc<dyn DdlRpc>,
    pub status: Arc<dyn ServiceStatus>,
    pub records: Arc<dyn TaskRecordStore>,
}
