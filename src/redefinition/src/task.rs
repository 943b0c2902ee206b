// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The redefinition task state machine.
//!
//! A task moves through its [`TaskStatus`]es in order. Each call to
//! [`RedefinitionTask::advance`] runs the function of the current status
//! once; the function either makes the progress it can without waiting on
//! remote work and moves on to the next status, or returns leaving the
//! status unchanged, to be invoked again later. Every status function is
//! safe to invoke repeatedly, including after a restart from the persisted
//! [`TaskRecord`].
//!
//! Errors of a status function are classified by [`RedefinitionTask::advance`]:
//! retryable errors leave the task in its status until the retry budget is
//! exhausted, anything else moves the task to [`TaskStatus::Fail`]. Both
//! [`TaskStatus::Success`] and [`TaskStatus::Fail`] end in
//! [`RedefinitionTask::finish`], which releases everything the task holds and
//! removes its record.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::barrier::WaitTransEnd;
use crate::build::{BuildContext, build_reply_key, prepare_build_replica, spawn_build_replica};
use crate::checksum::{ChecksumValidator, build_column_mapping};
use crate::config::{
    REDEFINITION_BUILD_TIMEOUT, REDEFINITION_LOCK_CONTENTION_LOG_INTERVAL,
    REDEFINITION_MAX_RETRIES, REDEFINITION_RPC_TIMEOUT, REDEFINITION_STATS_BATCH_SIZE,
    autoinc_sync_timeout, estimated_timeout, sequence_rpc_timeout,
};
use crate::depend::{
    ChildTaskNotifier, DependJobKind, DependTaskKey, DependTaskStatus, DependentJobTracker,
};
use crate::dyncfg::ConfigSet;
use crate::error::{ErrorCode, RedefinitionError};
use crate::ids::{
    ColumnId, Deadline, SchemaVersion, SnapshotVersion, TableId, TaskId, TenantId, with_deadline,
};
use crate::kind::TaskKind;
use crate::metrics::RedefinitionMetrics;
use crate::record::{TaskProgress, TaskRecord};
use crate::schema::{AlterTableArg, ColumnNameMap, ConstraintKind, TableSchema};
use crate::service::{
    AutoincSyncParam, DdlTaskRequest, DdlTaskType, JobDescriptor, LockMode, Services,
};
use crate::snapshot::SnapshotCoordinator;
use crate::stats::StatsSync;
use crate::tablet_seq::TabletSequenceMigrator;

/// The statuses of a task, in the order it passes through them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Prepare,
    LockTable,
    CheckTableEmpty,
    BuildShadowData,
    ValidateChecksum,
    CopyDependents,
    ModifyAutoinc,
    TakeEffect,
    Success,
    /// Reachable from every other status.
    Fail,
}

impl TaskStatus {
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Prepare => "prepare",
            TaskStatus::LockTable => "lock_table",
            TaskStatus::CheckTableEmpty => "check_table_empty",
            TaskStatus::BuildShadowData => "build_shadow_data",
            TaskStatus::ValidateChecksum => "validate_checksum",
            TaskStatus::CopyDependents => "copy_dependents",
            TaskStatus::ModifyAutoinc => "modify_autoinc",
            TaskStatus::TakeEffect => "take_effect",
            TaskStatus::Success => "success",
            TaskStatus::Fail => "fail",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Fail)
    }
}

/// Steps already completed within a status, so that a repeated invocation
/// doesn't redo them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseFlags {
    pub snapshot_obtained: bool,
    pub table_empty_checked: bool,
    /// The shadow data build was dispatched at least once. A later dispatch
    /// runs under a new execution id.
    pub build_dispatched: bool,
    pub dependents_dispatched: bool,
    /// The global sequence of a column turned into auto-increment was synced.
    pub autoinc_modified: bool,
    /// The global auto-increment position was carried over to the shadow
    /// table.
    pub autoinc_synced: bool,
    pub tablet_autoinc_synced: bool,
    pub stats_synced: bool,
    pub table_swapped: bool,
}

/// The arguments a task is created with.
#[derive(Clone, Debug)]
pub struct TaskParams {
    pub tenant: TenantId,
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub source: TableId,
    pub target: TableId,
    pub schema_version: SchemaVersion,
    pub parent_task_id: Option<TaskId>,
    pub parallelism: u32,
    pub alter: AlterTableArg,
}

/// A redefinition of `source` into its shadow table `target`.
#[derive(Debug)]
pub struct RedefinitionTask {
    tenant: TenantId,
    task_id: TaskId,
    kind: TaskKind,
    source: TableId,
    target: TableId,
    schema_version: SchemaVersion,
    trace_id: Uuid,
    parent_task_id: Option<TaskId>,
    parallelism: u32,
    alter: AlterTableArg,

    status: TaskStatus,
    snapshot_version: SnapshotVersion,
    snapshot_held: bool,
    retry_count: u64,
    ret_code: ErrorCode,
    message: String,
    flags: PhaseFlags,
    execution_id: i64,
    /// Cleared once the task finished, or can't be driven by this process
    /// anymore.
    need_retry: bool,

    tracker: Arc<DependentJobTracker>,
    wait_trans_end: Option<WaitTransEnd>,
    tablet_seq: Option<TabletSequenceMigrator>,
    last_contention_log: Option<Instant>,

    services: Services,
    configs: ConfigSet,
    metrics: RedefinitionMetrics,
}

impl RedefinitionTask {
    /// Creates a task and persists its record. Nothing else is touched until
    /// the first call to [`Self::advance`].
    pub async fn create(
        params: TaskParams,
        services: Services,
        configs: ConfigSet,
        metrics: RedefinitionMetrics,
    ) -> Result<Self, RedefinitionError> {
        if params.source == params.target {
            return Err(RedefinitionError::InvalidArgument(format!(
                "table {} can't be redefined into itself",
                params.source
            )));
        }
        if params.parallelism == 0 {
            return Err(RedefinitionError::InvalidArgument(
                "parallelism must be positive".into(),
            ));
        }
        let now = Utc::now();
        let record = TaskRecord {
            tenant: params.tenant,
            task_id: params.task_id,
            kind: params.kind,
            source: params.source,
            target: params.target,
            schema_version: params.schema_version,
            trace_id: Uuid::new_v4(),
            parent_task_id: params.parent_task_id,
            parallelism: params.parallelism,
            alter: params.alter,
            status: TaskStatus::Prepare,
            snapshot_version: SnapshotVersion::INVALID,
            retry_count: 0,
            ret_code: ErrorCode::SUCCESS,
            message: String::new(),
            flags: PhaseFlags::default(),
            execution_id: 0,
            created_at: now,
            updated_at: now,
        };
        services.records.insert(record.clone()).await?;
        info!(
            task_id = %record.task_id, tenant_id = %record.tenant, kind = record.kind.name(),
            source = %record.source, target = %record.target, trace_id = %record.trace_id,
            "created redefinition task"
        );
        Ok(Self::from_record(record, services, configs, metrics))
    }

    /// Rebuilds a task from its persisted record.
    ///
    /// Child jobs are dispatched again, which the job scheduler deduplicates.
    /// Results reported to an earlier incarnation of the task are looked up
    /// at the scheduler.
    pub fn from_record(
        record: TaskRecord,
        services: Services,
        configs: ConfigSet,
        metrics: RedefinitionMetrics,
    ) -> Self {
        // The snapshot is pinned before the task leaves `LockTable`.
        let snapshot_held = record.snapshot_version.is_valid()
            && record.status > TaskStatus::LockTable
            && !record.status.is_terminal();
        RedefinitionTask {
            tenant: record.tenant,
            task_id: record.task_id,
            kind: record.kind,
            source: record.source,
            target: record.target,
            schema_version: record.schema_version,
            trace_id: record.trace_id,
            parent_task_id: record.parent_task_id,
            parallelism: record.parallelism,
            alter: record.alter,
            status: record.status,
            snapshot_version: record.snapshot_version,
            snapshot_held,
            retry_count: record.retry_count,
            ret_code: record.ret_code,
            message: record.message,
            flags: record.flags,
            execution_id: record.execution_id,
            need_retry: true,
            tracker: Arc::new(DependentJobTracker::new()),
            wait_trans_end: None,
            tablet_seq: None,
            last_contention_log: None,
            services,
            configs,
            metrics,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn parent_task_id(&self) -> Option<TaskId> {
        self.parent_task_id
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn snapshot_version(&self) -> SnapshotVersion {
        self.snapshot_version
    }

    pub fn snapshot_held(&self) -> bool {
        self.snapshot_held
    }

    pub fn retry_count(&self) -> u64 {
        self.retry_count
    }

    pub fn ret_code(&self) -> ErrorCode {
        self.ret_code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn flags(&self) -> &PhaseFlags {
        &self.flags
    }

    pub fn execution_id(&self) -> i64 {
        self.execution_id
    }

    /// Whether the driver should keep calling [`Self::advance`].
    pub fn need_retry(&self) -> bool {
        self.need_retry
    }

    /// The handle child jobs report their completion through.
    pub fn notifier(&self) -> ChildTaskNotifier {
        ChildTaskNotifier::new(self.task_id, Arc::clone(&self.tracker))
    }

    pub fn on_child_task_finish(
        &self,
        key: DependTaskKey,
        ret_code: ErrorCode,
    ) -> Result<(), RedefinitionError> {
        self.notifier().on_child_task_finish(key, ret_code)
    }

    /// Runs the function of the current status once.
    ///
    /// Returns an error only if the task can't make progress in this process
    /// anymore, or if persisting its state failed. Errors of the status
    /// function itself are absorbed into the task's state.
    #[instrument(level = "debug", skip_all, fields(task_id = %self.task_id, tenant_id = %self.tenant))]
    pub async fn advance(&mut self) -> Result<(), RedefinitionError> {
        if let Err(err) = self.check_health().await {
            if !self.need_retry {
                return Err(err);
            }
            return self.on_error(self.status, err).await;
        }

        let status = self.status;
        let start = Instant::now();
        let res = match status {
            TaskStatus::Prepare => self.prepare(TaskStatus::LockTable).await,
            TaskStatus::LockTable => self.lock_table(TaskStatus::CheckTableEmpty).await,
            TaskStatus::CheckTableEmpty => {
                self.check_table_empty(TaskStatus::BuildShadowData).await
            }
            TaskStatus::BuildShadowData => {
                self.build_shadow_data(TaskStatus::ValidateChecksum).await
            }
            TaskStatus::ValidateChecksum => {
                self.validate_checksum(TaskStatus::CopyDependents).await
            }
            TaskStatus::CopyDependents => self.copy_dependents(TaskStatus::ModifyAutoinc).await,
            TaskStatus::ModifyAutoinc => self.modify_autoinc(TaskStatus::TakeEffect).await,
            TaskStatus::TakeEffect => self.take_effect(TaskStatus::Success).await,
            TaskStatus::Success => self.success().await,
            TaskStatus::Fail => self.fail().await,
        };
        self.metrics
            .observe_phase(status.name(), start.elapsed().as_secs_f64());
        match res {
            Ok(()) => Ok(()),
            Err(err) => self.on_error(status, err).await,
        }
    }

    async fn on_error(
        &mut self,
        status: TaskStatus,
        err: RedefinitionError,
    ) -> Result<(), RedefinitionError> {
        if status.is_terminal() {
            warn!(task_id = %self.task_id, status = status.name(), error = %err, "failed to finish task");
            return Err(err);
        }
        let max_retries = u64::try_from(REDEFINITION_MAX_RETRIES.get(&self.configs))
            .unwrap_or(u64::MAX);
        if err.in_retry_white_list() && self.retry_count < max_retries {
            self.retry_count += 1;
            self.metrics.retry(status.name());
            debug!(
                task_id = %self.task_id, status = status.name(), retry_count = self.retry_count,
                error = %err, "retrying phase"
            );
            return self.persist_progress().await;
        }
        self.switch_to_fail(&err).await
    }

    /// Verifies the task may still run: this process must be in service, and
    /// both tables must exist. Picks up a `Fail` status set on the record
    /// from the outside.
    ///
    /// A non-retryable problem moves the task to `Fail`. Once the task is in
    /// a terminal status, reports success so that it can clean up.
    pub async fn check_health(&mut self) -> Result<(), RedefinitionError> {
        if !self.services.status.in_service() {
            self.need_retry = false;
            return Err(RedefinitionError::StateNotMatch(
                "redefinition scheduler is not in service".into(),
            ));
        }
        let res = self.check_health_inner().await;
        if let Err(err) = &res {
            if !err.in_retry_white_list() && !self.status.is_terminal() {
                self.switch_to_fail(err).await?;
            }
        }
        if self.status.is_terminal() {
            return Ok(());
        }
        res
    }

    async fn check_health_inner(&mut self) -> Result<(), RedefinitionError> {
        self.refresh_status().await?;
        if self.status.is_terminal() {
            return Ok(());
        }
        let latest = self
            .services
            .catalog
            .latest_schema_version(self.tenant)
            .await?;
        if latest < self.schema_version {
            return Err(RedefinitionError::from_code(
                ErrorCode::SCHEMA_EAGAIN,
                format!(
                    "local schema version {latest} is behind task schema version {}",
                    self.schema_version
                ),
            ));
        }
        for table in [self.source, self.target] {
            if !self.services.catalog.table_exists(self.tenant, table).await? {
                return Err(RedefinitionError::TableNotExist(table));
            }
        }
        Ok(())
    }

    /// Adopts a `Fail` status written to the record from the outside, e.g. by
    /// an operator cancelling the task.
    async fn refresh_status(&mut self) -> Result<(), RedefinitionError> {
        let Some(record) = self
            .services
            .records
            .get(self.tenant, self.task_id)
            .await?
        else {
            return Ok(());
        };
        if record.status == TaskStatus::Fail && self.status != TaskStatus::Fail {
            info!(task_id = %self.task_id, from = self.status.name(), "task was cancelled");
            let message = if record.message.is_empty() {
                "cancelled".to_owned()
            } else {
                record.message
            };
            let tracker = Arc::clone(&self.tracker);
            tracker.with_lock(|| {
                self.status = TaskStatus::Fail;
                self.ret_code = record.ret_code;
                self.message = message;
            });
            self.metrics.transition(TaskStatus::Fail.name());
        }
        Ok(())
    }

    fn rpc_deadline(&self) -> Deadline {
        Deadline::after(REDEFINITION_RPC_TIMEOUT.get(&self.configs))
    }

    async fn persist_progress(&self) -> Result<(), RedefinitionError> {
        let progress = TaskProgress {
            flags: self.flags.clone(),
            retry_count: self.retry_count,
            execution_id: self.execution_id,
        };
        self.services
            .records
            .update_progress(self.tenant, self.task_id, &progress)
            .await
    }

    async fn switch_status(&mut self, next: TaskStatus) -> Result<(), RedefinitionError> {
        if next <= self.status {
            return Err(RedefinitionError::Internal(format!(
                "task {} can't move from {} back to {}",
                self.task_id,
                self.status.name(),
                next.name()
            )));
        }
        self.services
            .records
            .update_status(self.tenant, self.task_id, next, self.ret_code)
            .await?;
        info!(
            task_id = %self.task_id, tenant_id = %self.tenant,
            from = self.status.name(), to = next.name(), "switched task status"
        );
        self.status = next;
        self.retry_count = 0;
        self.metrics.transition(next.name());
        Ok(())
    }

    /// Moves the task to `Fail`. The transition is made under the tracker's
    /// lock, so that no child completion is recorded concurrently.
    async fn switch_to_fail(&mut self, err: &RedefinitionError) -> Result<(), RedefinitionError> {
        let code = err.code();
        let message = err.to_string();
        warn!(
            task_id = %self.task_id, tenant_id = %self.tenant, status = self.status.name(),
            %code, error = %err, "redefinition task failed"
        );
        let tracker = Arc::clone(&self.tracker);
        tracker.with_lock(|| {
            self.status = TaskStatus::Fail;
            self.ret_code = code;
            self.message = message;
        });
        self.metrics.transition(TaskStatus::Fail.name());
        self.metrics
            .failure(code.name().unwrap_or("UNKNOWN"));
        self.services
            .records
            .update_status(self.tenant, self.task_id, TaskStatus::Fail, code)
            .await
    }

    async fn table_schema(&self, table: TableId) -> Result<TableSchema, RedefinitionError> {
        self.services
            .catalog
            .get_table_schema(self.tenant, table)
            .await?
            .ok_or(RedefinitionError::TableNotExist(table))
    }

    /// Turns the result reported by a child job into the task's result.
    fn child_result(key: DependTaskKey, code: ErrorCode) -> Result<(), RedefinitionError> {
        if code.is_success() {
            Ok(())
        } else {
            Err(RedefinitionError::ChildJobFailed {
                key: key.to_string(),
                code,
            })
        }
    }

    /// Submits `job`. A job the scheduler already knows counts as
    /// submitted, without a child task id.
    async fn submit_job(&self, job: JobDescriptor) -> Result<Option<TaskId>, RedefinitionError> {
        let key = job.reply_key();
        let res = self
            .metrics
            .submit_job
            .run_op(|| self.services.jobs.submit(job))
            .await;
        match res {
            Ok(child) => {
                info!(task_id = %self.task_id, %key, child_task_id = %child, "submitted child job");
                Ok(Some(child))
            }
            Err(RedefinitionError::EntryExist(_)) => {
                info!(task_id = %self.task_id, %key, "child job already submitted");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// The state of the child job registered under `key`.
    ///
    /// A job submitted by an earlier incarnation of this task may have
    /// finished before it was registered here. Its result is then only known
    /// to the scheduler.
    async fn poll_child(
        &self,
        key: &DependTaskKey,
    ) -> Result<Option<DependTaskStatus>, RedefinitionError> {
        let Some(status) = self.tracker.status(key) else {
            return Ok(None);
        };
        if status.ret_code.is_some() || status.child_task_id.is_some() {
            return Ok(Some(status));
        }
        let Some(result) = self
            .services
            .jobs
            .result(self.tenant, self.task_id, *key)
            .await?
        else {
            return Ok(Some(status));
        };
        info!(
            task_id = %self.task_id, %key, ret_code = %result.ret_code,
            "picked up result of earlier child job"
        );
        match result.reported_value {
            Some(value) => self.tracker.complete_with_value(*key, result.ret_code, value)?,
            None => self.tracker.complete(*key, result.ret_code)?,
        }
        Ok(self.tracker.status(key))
    }

    #[instrument(level = "debug", skip_all)]
    pub async fn prepare(&mut self, next: TaskStatus) -> Result<(), RedefinitionError> {
        self.switch_status(next).await
    }

    /// Locks both tables exclusively, then pins the snapshot the shadow data
    /// is built from.
    #[instrument(level = "debug", skip_all)]
    pub async fn lock_table(&mut self, next: TaskStatus) -> Result<(), RedefinitionError> {
        let source = self.table_schema(self.source).await?;
        let target = self.table_schema(self.target).await?;
        if source.is_tmp_table != target.is_tmp_table {
            return Err(RedefinitionError::Internal(format!(
                "table {} and table {} disagree on being temporary",
                self.source, self.target
            )));
        }
        if !source.is_tmp_table {
            for table in [self.source, self.target] {
                let deadline = self.rpc_deadline();
                let res = self
                    .metrics
                    .lock_table
                    .run_op(|| {
                        with_deadline(
                            "lock table",
                            deadline,
                            self.services.locks.lock_table(
                                self.tenant,
                                table,
                                LockMode::Exclusive,
                                self.schema_version,
                                deadline,
                            ),
                        )
                    })
                    .await;
                match res {
                    Ok(()) => {}
                    Err(err) if err.is_table_lock_retry() => {
                        self.log_lock_contention(table, &err);
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        match self.obtain_snapshot().await {
            Ok(true) => self.switch_status(next).await,
            Ok(false) => Ok(()),
            Err(err @ RedefinitionError::SnapshotDiscarded { .. }) => {
                info!(task_id = %self.task_id, error = %err, "snapshot discarded, obtaining a new one");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn log_lock_contention(&mut self, table: TableId, err: &RedefinitionError) {
        let interval = REDEFINITION_LOCK_CONTENTION_LOG_INTERVAL.get(&self.configs);
        let now = Instant::now();
        let due = self
            .last_contention_log
            .map_or(true, |last| now.duration_since(last) >= interval);
        if due {
            info!(task_id = %self.task_id, %table, error = %err, "cannot lock table yet");
            self.last_contention_log = Some(now);
        }
    }

    /// Pins a snapshot of both tables at a version no transaction under the
    /// old schema can still write below. Returns whether the snapshot is
    /// held.
    ///
    /// The version is persisted before it is pinned, so that `finish` can
    /// release it after a restart.
    pub async fn obtain_snapshot(&mut self) -> Result<bool, RedefinitionError> {
        if self.snapshot_version.is_valid() && self.snapshot_held {
            return Ok(true);
        }
        if !self.snapshot_version.is_valid() {
            let ctx = self.wait_trans_end.get_or_insert_with(|| {
                WaitTransEnd::new(
                    Arc::clone(&self.services.barrier),
                    self.tenant,
                    self.source,
                    self.schema_version,
                )
            });
            let Some(version) = ctx.try_wait().await? else {
                debug!(task_id = %self.task_id, "waiting for transactions on the old schema");
                return Ok(false);
            };
            self.services
                .records
                .update_snapshot_version(self.tenant, self.task_id, version)
                .await?;
            self.snapshot_version = version;
        }

        let target = self.table_schema(self.target).await?;
        let timeout = estimated_timeout(
            &self.configs,
            target.partitions.len(),
            target.column_count(),
        );
        let deadline = Deadline::after(timeout);
        let coordinator = SnapshotCoordinator::new(
            Arc::clone(&self.services.catalog),
            Arc::clone(&self.services.snapshots),
        );
        let version = self.snapshot_version;
        let res = self
            .metrics
            .snapshot
            .run_op(|| {
                with_deadline(
                    "acquire snapshot",
                    deadline,
                    coordinator.acquire(
                        self.tenant,
                        self.source,
                        self.target,
                        self.schema_version,
                        version,
                        deadline,
                    ),
                )
            })
            .await;
        match res {
            Ok(_set) => {
                self.snapshot_held = true;
                self.flags.snapshot_obtained = true;
                self.persist_progress().await?;
                Ok(true)
            }
            Err(err @ RedefinitionError::SnapshotDiscarded { .. }) => {
                self.snapshot_version = SnapshotVersion::INVALID;
                self.snapshot_held = false;
                self.wait_trans_end = None;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Makes sure the table is empty if the alter adds a `NOT NULL` column
    /// without a default.
    #[instrument(level = "debug", skip_all)]
    pub async fn check_table_empty(&mut self, next: TaskStatus) -> Result<(), RedefinitionError> {
        if !self.alter.check_need_check_table_empty() || self.flags.table_empty_checked {
            return self.switch_status(next).await;
        }
        let key = DependTaskKey::new(
            DependJobKind::CheckTableEmpty,
            self.target.0,
            self.schema_version,
        );
        if !self.tracker.is_registered(&key) {
            let child = self
                .submit_job(JobDescriptor::CheckTableEmpty {
                    tenant: self.tenant,
                    parent: self.task_id,
                    table: self.source,
                    target: self.target,
                    schema_version: self.schema_version,
                    reply_key: key,
                })
                .await?;
            self.tracker.register(key, child);
            return Ok(());
        }
        let Some(code) = self.poll_child(&key).await?.and_then(|status| status.ret_code) else {
            return Ok(());
        };
        Self::child_result(key, code)?;
        self.flags.table_empty_checked = true;
        self.persist_progress().await?;
        self.switch_status(next).await
    }

    /// Copies the source rows into the shadow table.
    #[instrument(level = "debug", skip_all)]
    pub async fn build_shadow_data(&mut self, next: TaskStatus) -> Result<(), RedefinitionError> {
        let key = build_reply_key(self.target, self.schema_version);
        if !self.tracker.is_registered(&key) {
            return self.dispatch_build().await;
        }
        let Some(code) = self.tracker.poll(&key) else {
            return Ok(());
        };
        if code.is_success() {
            return self.switch_status(next).await;
        }
        if code.in_retry_white_list() {
            // Dispatched again under a new execution id by the next call.
            self.tracker.remove(&key);
            return Err(RedefinitionError::from_code(
                code,
                format!("building table {} failed", self.target),
            ));
        }
        Self::child_result(key, code)
    }

    async fn dispatch_build(&mut self) -> Result<(), RedefinitionError> {
        let source = self.table_schema(self.source).await?;
        let target = self.table_schema(self.target).await?;
        if self.flags.build_dispatched {
            self.execution_id += 1;
        }
        let ctx = BuildContext {
            tenant: self.tenant,
            task_id: self.task_id,
            schema_version: self.schema_version,
            snapshot_version: self.snapshot_version,
            execution_id: self.execution_id,
            parallelism: self.parallelism,
        };
        let descriptor = prepare_build_replica(ctx, &source, &target, &self.alter, &self.kind)?;
        self.flags.build_dispatched = true;
        self.persist_progress().await?;

        self.tracker.register(descriptor.reply_key(), None);
        spawn_build_replica(
            Arc::clone(&self.services.sql),
            descriptor,
            REDEFINITION_BUILD_TIMEOUT.get(&self.configs),
            self.notifier(),
            self.metrics.sql.clone(),
        );
        Ok(())
    }

    /// Compares the column checksums computed while building the shadow
    /// table.
    #[instrument(level = "debug", skip_all)]
    pub async fn validate_checksum(&mut self, next: TaskStatus) -> Result<(), RedefinitionError> {
        let source = self.table_schema(self.source).await?;
        let target = self.table_schema(self.target).await?;
        let mapping = build_column_mapping(&source, &target, &self.alter, &self.kind)?;
        let validator = ChecksumValidator::new(Arc::clone(&self.services.checksums));
        let res = validator
            .fetch_and_compare(
                self.tenant,
                self.execution_id,
                self.source,
                self.target,
                self.task_id,
                &mapping,
            )
            .await;
        if let Err(RedefinitionError::ChecksumMismatch { .. }) = &res {
            self.metrics.checksum_mismatches.inc();
        }
        res?;
        info!(task_id = %self.task_id, columns = mapping.len(), "column checksums match");
        self.switch_status(next).await
    }

    /// Validates the check constraints and foreign keys of the shadow table
    /// through child tasks.
    #[instrument(level = "debug", skip_all)]
    pub async fn copy_dependents(&mut self, next: TaskStatus) -> Result<(), RedefinitionError> {
        if !self.kind.strategy().rebuilds_dependents {
            return self.switch_status(next).await;
        }
        let target = self.table_schema(self.target).await?;

        let constraints = target
            .constraints
            .iter()
            .filter(|c| c.kind == ConstraintKind::Check && c.validated);
        for constraint in constraints {
            let key = DependTaskKey::new(
                DependJobKind::Constraint,
                constraint.id.0,
                target.schema_version,
            );
            if self.tracker.is_registered(&key) {
                self.poll_child(&key).await?;
                continue;
            }
            let child = self
                .submit_job(JobDescriptor::CheckConstraint {
                    tenant: self.tenant,
                    parent: self.task_id,
                    table: self.target,
                    constraint: constraint.id,
                    schema_version: target.schema_version,
                    reply_key: key,
                })
                .await?;
            self.tracker.register(key, child);
        }
        for fk in &target.foreign_keys {
            let key = DependTaskKey::new(DependJobKind::ForeignKey, fk.id.0, target.schema_version);
            if self.tracker.is_registered(&key) {
                self.poll_child(&key).await?;
                continue;
            }
            let child = self
                .submit_job(JobDescriptor::ForeignKey {
                    tenant: self.tenant,
                    parent: self.task_id,
                    table: self.source,
                    hidden_table: self.target,
                    foreign_key: fk.id,
                    name: fk.name.clone(),
                    validate: fk.validated,
                    schema_version: target.schema_version,
                    reply_key: key,
                })
                .await?;
            self.tracker.register(key, child);
        }
        if !self.flags.dependents_dispatched {
            self.flags.dependents_dispatched = true;
            self.persist_progress().await?;
        }

        for kind in [DependJobKind::Constraint, DependJobKind::ForeignKey] {
            if let Some((key, code)) = self.tracker.first_failure(kind) {
                return Self::child_result(key, code);
            }
        }
        if self.tracker.all_finished(DependJobKind::Constraint)
            && self.tracker.all_finished(DependJobKind::ForeignKey)
        {
            info!(
                task_id = %self.task_id,
                constraints = self.tracker.count(DependJobKind::Constraint),
                foreign_keys = self.tracker.count(DependJobKind::ForeignKey),
                "dependent objects validated"
            );
            return self.switch_status(next).await;
        }
        Ok(())
    }

    /// Fills a column newly turned into auto-increment, then moves its
    /// sequence past the values handed out.
    #[instrument(level = "debug", skip_all)]
    pub async fn modify_autoinc(&mut self, next: TaskStatus) -> Result<(), RedefinitionError> {
        let key = DependTaskKey::new(
            DependJobKind::UpdateAutoinc,
            self.target.0,
            self.schema_version,
        );
        if !self.tracker.is_registered(&key) {
            let source = self.table_schema(self.source).await?;
            let target = self.table_schema(self.target).await?;
            let Some(column) = self.new_autoinc_column(&source, &target)? else {
                return self.switch_status(next).await;
            };
            let column = target.column(column).ok_or_else(|| {
                RedefinitionError::Internal(format!("column {column} of table {} vanished", target.id))
            })?;
            self.alter.autoinc_column = Some(column.id);
            let child = self
                .submit_job(JobDescriptor::UpdateAutoincSequence {
                    tenant: self.tenant,
                    parent: self.task_id,
                    table: self.source,
                    target: self.target,
                    schema_version: self.schema_version,
                    column: column.id,
                    column_type: column.data_type,
                    sql_mode: self.alter.sql_mode,
                    reply_key: key,
                })
                .await?;
            self.tracker.register(key, child);
            return Ok(());
        }

        let Some(status) = self.poll_child(&key).await? else {
            return Ok(());
        };
        let Some(code) = status.ret_code else {
            return Ok(());
        };
        Self::child_result(key, code)?;
        if let Some(autoinc_val) = status.reported_value {
            self.alter.auto_increment = autoinc_val;
        }
        if !self.flags.autoinc_modified {
            let Some(column) = self.alter.autoinc_column else {
                return Err(RedefinitionError::Internal(format!(
                    "task {} lost its auto-increment column",
                    self.task_id
                )));
            };
            let target = self.table_schema(self.target).await?;
            let column = target.column(column).ok_or_else(|| {
                RedefinitionError::Internal(format!("column {column} of table {} vanished", target.id))
            })?;
            let param = AutoincSyncParam {
                tenant: self.tenant,
                table: self.target,
                column: column.id,
                column_type: column.data_type,
                partition_count: target.partitions.len(),
                order_mode: target.order_autoinc_mode,
                value_to_sync: self.alter.auto_increment.saturating_sub(1),
            };
            self.sync_autoinc(param).await?;
            self.flags.autoinc_modified = true;
            self.persist_progress().await?;
        }
        self.switch_status(next).await
    }

    /// The shadow table column of the source column the alter turns into
    /// auto-increment, if any. There can be only one.
    fn new_autoinc_column(
        &self,
        source: &TableSchema,
        target: &TableSchema,
    ) -> Result<Option<ColumnId>, RedefinitionError> {
        let names = ColumnNameMap::new(source, &self.alter)?;
        for alter_column in &self.alter.columns {
            let Some(origin) = alter_column.origin_name.as_deref() else {
                continue;
            };
            let orig = source.column_by_name(origin).ok_or_else(|| {
                RedefinitionError::Internal(format!(
                    "altered column {origin} missing from table {}",
                    source.id
                ))
            })?;
            if !alter_column.column.autoincrement || orig.autoincrement {
                continue;
            }
            let new = names
                .get(origin)
                .and_then(|name| target.column_by_name(name))
                .ok_or_else(|| {
                    RedefinitionError::Internal(format!(
                        "column {origin} has no counterpart in table {}",
                        target.id
                    ))
                })?;
            return Ok(Some(new.id));
        }
        Ok(None)
    }

    async fn sync_autoinc(&self, param: AutoincSyncParam) -> Result<(), RedefinitionError> {
        let deadline = Deadline::after(autoinc_sync_timeout(&self.configs));
        info!(
            task_id = %self.task_id, table = %param.table, column = %param.column,
            value = param.value_to_sync, "syncing auto-increment value"
        );
        self.metrics
            .autoinc_sync
            .run_op(|| {
                with_deadline(
                    "sync auto-increment",
                    deadline,
                    self.services.autoinc.sync_insert_value_global(param, deadline),
                )
            })
            .await
    }

    /// Carries the auto-increment state and statistics over to the shadow
    /// table, then swaps the two tables.
    #[instrument(level = "debug", skip_all)]
    pub async fn take_effect(&mut self, next: TaskStatus) -> Result<(), RedefinitionError> {
        if !self.flags.autoinc_synced {
            self.sync_auto_increment_position().await?;
            self.flags.autoinc_synced = true;
            self.persist_progress().await?;
        }
        if !self.flags.tablet_autoinc_synced {
            self.sync_tablet_autoinc().await?;
            self.flags.tablet_autoinc_synced = true;
            self.persist_progress().await?;
        }
        if !self.flags.stats_synced {
            let source = self.table_schema(self.source).await?;
            let target = self.table_schema(self.target).await?;
            let stats = StatsSync {
                source: &source,
                target: &target,
                alter: &self.alter,
                kind: &self.kind,
                batch_size: REDEFINITION_STATS_BATCH_SIZE.get(&self.configs),
            };
            let deadline = Deadline::after(estimated_timeout(
                &self.configs,
                target.partitions.len(),
                target.column_count(),
            ));
            self.metrics
                .sql
                .run_op(|| stats.run(self.services.sql.as_ref(), self.tenant, deadline))
                .await?;
            self.flags.stats_synced = true;
            self.persist_progress().await?;
        }
        if !self.flags.table_swapped {
            self.request_ddl(DdlTaskType::SwapTable).await?;
            self.flags.table_swapped = true;
            self.persist_progress().await?;
        }
        self.switch_status(next).await
    }

    /// Moves the global sequence of every auto-increment column present in
    /// both tables to where the source's is.
    async fn sync_auto_increment_position(&self) -> Result<(), RedefinitionError> {
        let source = self.table_schema(self.source).await?;
        let target = self.table_schema(self.target).await?;
        for src in source.columns.iter().filter(|c| c.autoincrement) {
            let Some(dst) = target.column_by_name(&src.name) else {
                continue;
            };
            if !dst.autoincrement {
                continue;
            }
            let deadline = Deadline::after(autoinc_sync_timeout(&self.configs));
            let sequence_value = with_deadline(
                "get auto-increment sequence",
                deadline,
                self.services.autoinc.get_sequence_value(
                    self.tenant,
                    self.source,
                    src.id,
                    target.order_autoinc_mode,
                    deadline,
                ),
            )
            .await?;
            // The sequence value is still available to inserts.
            let param = AutoincSyncParam {
                tenant: self.tenant,
                table: self.target,
                column: dst.id,
                column_type: dst.data_type,
                partition_count: target.partitions.len(),
                order_mode: target.order_autoinc_mode,
                value_to_sync: sequence_value.saturating_sub(1),
            };
            self.sync_autoinc(param).await?;
        }
        Ok(())
    }

    async fn sync_tablet_autoinc(&mut self) -> Result<(), RedefinitionError> {
        if self.tablet_seq.is_none() {
            let migrator = TabletSequenceMigrator::init(
                &self.services,
                self.tenant,
                self.source,
                self.target,
                sequence_rpc_timeout(&self.configs),
                self.metrics.sequence_rpcs.clone(),
            )
            .await?;
            self.tablet_seq = Some(migrator);
        }
        if let Some(migrator) = self.tablet_seq.as_mut() {
            migrator.sync().await?;
        }
        self.tablet_seq = None;
        Ok(())
    }

    async fn request_ddl(&self, task_type: DdlTaskType) -> Result<(), RedefinitionError> {
        let request = DdlTaskRequest {
            task_type,
            tenant: self.tenant,
            table: self.source,
            hidden_table: self.target,
            task_id: self.task_id,
        };
        let deadline = self.rpc_deadline();
        info!(task_id = %self.task_id, ?task_type, "requesting ddl task");
        self.metrics
            .ddl_rpc
            .run_op(|| {
                with_deadline(
                    "execute ddl task",
                    deadline,
                    self.services.ddl.execute_ddl_task(request, deadline),
                )
            })
            .await
    }

    pub async fn success(&mut self) -> Result<(), RedefinitionError> {
        self.finish().await
    }

    pub async fn fail(&mut self) -> Result<(), RedefinitionError> {
        self.finish().await
    }

    /// Releases everything the task holds and removes its record. Safe to
    /// call again after a partial failure.
    pub async fn finish(&mut self) -> Result<(), RedefinitionError> {
        self.unlock_tables().await?;
        if self.snapshot_version.is_valid() {
            self.release_snapshot().await?;
        }
        let source = self
            .services
            .catalog
            .get_table_schema(self.tenant, self.source)
            .await?;
        if source.is_some_and(|s| s.association_table.is_some()) {
            self.request_ddl(DdlTaskType::CleanupGarbage).await?;
        }
        self.cleanup().await?;
        self.need_retry = false;
        info!(
            task_id = %self.task_id, tenant_id = %self.tenant, status = self.status.name(),
            ret_code = %self.ret_code, "redefinition task finished"
        );
        Ok(())
    }

    async fn unlock_tables(&self) -> Result<(), RedefinitionError> {
        for table in [self.source, self.target] {
            let schema = self
                .services
                .catalog
                .get_table_schema(self.tenant, table)
                .await?;
            // Either table may already be gone if an earlier cleanup got
            // through.
            if schema.map_or(true, |s| s.is_tmp_table) {
                continue;
            }
            let deadline = self.rpc_deadline();
            let res = with_deadline(
                "unlock table",
                deadline,
                self.services.locks.unlock_table(
                    self.tenant,
                    table,
                    LockMode::Exclusive,
                    self.schema_version,
                    deadline,
                ),
            )
            .await;
            match res {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    debug!(task_id = %self.task_id, %table, "table lock already released");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn release_snapshot(&mut self) -> Result<(), RedefinitionError> {
        let coordinator = SnapshotCoordinator::new(
            Arc::clone(&self.services.catalog),
            Arc::clone(&self.services.snapshots),
        );
        let deadline = self.rpc_deadline();
        let res = coordinator
            .release(
                self.tenant,
                self.source,
                self.target,
                self.snapshot_version,
                deadline,
            )
            .await;
        match res {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                warn!(task_id = %self.task_id, error = %err, "snapshot already released");
            }
            Err(err) => return Err(err),
        }
        self.snapshot_held = false;
        Ok(())
    }

    /// Persists the final result and removes the record.
    async fn cleanup(&self) -> Result<(), RedefinitionError> {
        let records = &self.services.records;
        let res = records
            .report_error(self.tenant, self.task_id, self.ret_code, &self.message)
            .await;
        match res {
            Ok(()) => {}
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        }
        match records.remove(self.tenant, self.task_id).await {
            Err(err) if !err.is_not_found() => Err(err),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;
    use crate::dyncfg::{ConfigUpdates, ConfigValue};
    use crate::ids::{ConstraintId, ForeignKeyId, TabletId};
    use crate::record::{TaskRecordStore, recover_tasks};
    use crate::schema::{AlterColumn, Constraint, DataType, ForeignKey, SqlMode};
    use crate::testing::{FakeEnv, column, init_logging, table};

    const TENANT: TenantId = TenantId(1);

    fn env_with_tables(edit_target: impl FnOnce(&mut TableSchema)) -> FakeEnv {
        init_logging();
        let env = FakeEnv::new();
        let mut source = table(
            TableId(500),
            vec![column(16, "a", DataType::Int32), column(17, "b", DataType::Varchar)],
            &[1, 2, 3],
        );
        source.association_table = Some(TableId(600));
        let mut target = table(
            TableId(600),
            vec![column(16, "a", DataType::Int32), column(17, "b", DataType::Varchar)],
            &[101, 102, 103],
        );
        target.association_table = Some(TableId(500));
        edit_target(&mut target);
        env.catalog.put(source);
        env.catalog.put(target);
        for tablet in 1..=3u64 {
            env.cluster.set_cursor(TabletId(tablet), 10 * tablet);
        }
        env.barrier.set_ready(Some(SnapshotVersion(100)));
        let checksums: BTreeMap<ColumnId, i64> =
            [(ColumnId(16), 7), (ColumnId(17), 8)].into_iter().collect();
        env.checksums.put(TableId(500), checksums.clone());
        env.checksums.put(TableId(600), checksums);
        env
    }

    fn params(kind: TaskKind, alter: AlterTableArg) -> TaskParams {
        TaskParams {
            tenant: TENANT,
            task_id: TaskId(42),
            kind,
            source: TableId(500),
            target: TableId(600),
            schema_version: SchemaVersion(3),
            parent_task_id: None,
            parallelism: 2,
            alter,
        }
    }

    fn widen_b() -> AlterTableArg {
        let mut b = column(17, "b", DataType::Varchar);
        b.length = 64;
        AlterTableArg::new(SqlMode::STRICT_TRANS_TABLES, vec![AlterColumn::modify("b", b)])
    }

    /// Adds a `NOT NULL` column without a default, which needs an emptiness
    /// check.
    fn add_not_null_column() -> (FakeEnv, TaskParams) {
        let env = env_with_tables(|target| {
            target.columns.push(column(18, "c", DataType::Int32));
        });
        let mut c = column(18, "c", DataType::Int32);
        c.nullable = false;
        let alter = AlterTableArg::new(SqlMode::STRICT_TRANS_TABLES, vec![AlterColumn::add(c)]);
        (env, params(TaskKind::ColumnRedefinition, alter))
    }

    /// Rebuilds a table whose shadow table carries a validated check
    /// constraint, an unvalidated one and a foreign key.
    fn rebuild_with_dependents() -> (FakeEnv, TaskParams) {
        let env = env_with_tables(|target| {
            target.constraints.push(Constraint {
                id: ConstraintId(70),
                name: "c_positive".into(),
                kind: ConstraintKind::Check,
                validated: true,
            });
            target.constraints.push(Constraint {
                id: ConstraintId(71),
                name: "c_unchecked".into(),
                kind: ConstraintKind::Check,
                validated: false,
            });
            target.foreign_keys.push(fk_parent());
        });
        let alter = AlterTableArg::new(SqlMode::STRICT_TRANS_TABLES, vec![]);
        (env, params(TaskKind::TableRedefinition { heap_table: false }, alter))
    }

    fn fk_parent() -> ForeignKey {
        ForeignKey {
            id: ForeignKeyId(80),
            name: "fk_parent".into(),
            parent_table: TableId(400),
            enabled: true,
            validated: true,
            rely: false,
        }
    }

    /// Column a is auto-increment on both sides, b turns into one.
    fn make_autoinc() -> (FakeEnv, TaskParams) {
        let env = env_with_tables(|target| {
            for c in &mut target.columns {
                c.autoincrement = true;
            }
        });
        env.catalog.update(TableId(500), |source| {
            source.columns[0].autoincrement = true;
        });
        env.autoinc.set_sequence(TableId(500), ColumnId(16), 1000);
        let mut b = column(17, "b", DataType::Varchar);
        b.length = 64;
        b.autoincrement = true;
        let alter = AlterTableArg::new(SqlMode::STRICT_TRANS_TABLES, vec![AlterColumn::modify("b", b)]);
        (env, params(TaskKind::ColumnRedefinition, alter))
    }

    /// The first attempt to pin the snapshot times out, after its version was
    /// recorded.
    fn flaky_snapshot() -> (FakeEnv, TaskParams) {
        let env = env_with_tables(|_| {});
        env.snapshots.fail_next_acquire(RedefinitionError::Timeout {
            op: "acquire snapshot".into(),
        });
        (env, params(TaskKind::ColumnRedefinition, widen_b()))
    }

    async fn create(env: &FakeEnv, params: TaskParams) -> RedefinitionTask {
        RedefinitionTask::create(
            params,
            env.services(),
            env.configs.clone(),
            env.metrics.clone(),
        )
        .await
        .expect("create")
    }

    /// Advances `task` until it finished, playing the job scheduler: every
    /// submitted job completes with `outcome(job)`. Returns every status the
    /// task was seen in.
    async fn drive(
        task: &mut RedefinitionTask,
        env: &FakeEnv,
        outcome: impl Fn(&JobDescriptor) -> ErrorCode,
    ) -> Vec<TaskStatus> {
        let mut seen = vec![task.status()];
        for _ in 0..100 {
            if !task.need_retry() {
                break;
            }
            task.advance().await.expect("advance");
            complete_jobs(env, &task.notifier(), &outcome);
            // Lets a spawned shadow data build run.
            tokio::task::yield_now().await;
            seen.push(task.status());
        }
        seen
    }

    fn succeed(_job: &JobDescriptor) -> ErrorCode {
        ErrorCode::SUCCESS
    }

    /// Completes every job submitted since the last call with `outcome(job)`,
    /// reporting to the scheduler and to `notifier`. Auto-increment rewrites
    /// report 51 as the next value.
    fn complete_jobs(
        env: &FakeEnv,
        notifier: &ChildTaskNotifier,
        outcome: &impl Fn(&JobDescriptor) -> ErrorCode,
    ) {
        for job in env.jobs.take_pending() {
            let key = job.reply_key();
            let code = outcome(&job);
            let res = match job {
                JobDescriptor::UpdateAutoincSequence { .. } => {
                    env.jobs.finish(key, code, Some(51));
                    notifier.notify_update_autoinc_finish(key, code, 51)
                }
                _ => {
                    env.jobs.finish(key, code, None);
                    notifier.on_child_task_finish(key, code)
                }
            };
            res.expect("report");
        }
    }

    fn assert_monotonic(seen: &[TaskStatus]) {
        for pair in seen.windows(2) {
            assert!(pair[0] <= pair[1], "status went back: {seen:?}");
        }
    }

    #[tokio::test]
    async fn runs_to_completion() {
        let env = env_with_tables(|_| {});
        let mut task = create(&env, params(TaskKind::ColumnRedefinition, widen_b())).await;
        let seen = drive(&mut task, &env, |_| ErrorCode::SUCCESS).await;

        assert_monotonic(&seen);
        assert!(seen.contains(&TaskStatus::ValidateChecksum));
        assert_eq!(task.status(), TaskStatus::Success);
        assert_eq!(task.ret_code(), ErrorCode::SUCCESS);
        assert!(!task.need_retry());

        // Everything the task held is released, and its record is gone.
        assert!(env.locks.locked().is_empty());
        assert!(env.snapshots.held(SnapshotVersion(100)).is_empty());
        assert_eq!(env.records.get(TENANT, TaskId(42)).await.unwrap(), None);

        let executed = env.sql.executed();
        assert_eq!(executed.len(), 1);
        assert!(executed[0].0.starts_with("INSERT"));
        assert!(executed[0].0.contains("AS OF SNAPSHOT 100"));
        assert_eq!(env.sql.transactions().len(), 1);
        let ddl: Vec<_> = env.ddl.requests().into_iter().map(|r| r.task_type).collect();
        assert_eq!(ddl, vec![DdlTaskType::SwapTable, DdlTaskType::CleanupGarbage]);
        for tablet in 1..=3u64 {
            assert_eq!(env.cluster.cursor(TabletId(100 + tablet)), Some(10 * tablet));
        }
        // No job is needed for this alter.
        assert!(env.jobs.submitted().is_empty());
        assert_eq!(env.metrics.transitions("success"), 1);
    }

    #[tokio::test]
    async fn recovers_from_record() {
        let env = env_with_tables(|_| {});
        let mut task = create(&env, params(TaskKind::ColumnRedefinition, widen_b())).await;
        let trace_id = task.trace_id();
        let mut seen = vec![task.status()];
        while task.status() < TaskStatus::ValidateChecksum {
            task.advance().await.expect("advance");
            tokio::task::yield_now().await;
            seen.push(task.status());
        }
        let execution_id = task.execution_id();
        drop(task);

        let mut tasks = recover_tasks(&env.services(), &env.configs, &env.metrics)
            .await
            .expect("recover");
        assert_eq!(tasks.len(), 1);
        let mut task = tasks.remove(0);
        assert_eq!(task.status(), TaskStatus::ValidateChecksum);
        assert_eq!(task.trace_id(), trace_id);
        assert_eq!(task.execution_id(), execution_id);
        assert_eq!(task.snapshot_version(), SnapshotVersion(100));
        assert!(task.snapshot_held());
        assert!(task.flags().build_dispatched);

        seen.extend(drive(&mut task, &env, |_| ErrorCode::SUCCESS).await);
        assert_monotonic(&seen);
        assert_eq!(task.status(), TaskStatus::Success);
        assert!(env.snapshots.held(SnapshotVersion(100)).is_empty());
    }

    /// Everything a finished task leaves behind.
    #[derive(Debug, PartialEq)]
    struct Outcome {
        status: TaskStatus,
        ret_code: ErrorCode,
        jobs: Vec<JobDescriptor>,
        ddl: Vec<DdlTaskType>,
        autoinc_syncs: Vec<AutoincSyncParam>,
        stats_transactions: Vec<Vec<String>>,
        cursors: Vec<Option<u64>>,
        locked: BTreeSet<TableId>,
        held: BTreeSet<TabletId>,
        record: Option<TaskRecord>,
    }

    async fn outcome(task: &RedefinitionTask, env: &FakeEnv) -> Outcome {
        Outcome {
            status: task.status(),
            ret_code: task.ret_code(),
            jobs: env.jobs.submitted(),
            ddl: env.ddl.requests().into_iter().map(|r| r.task_type).collect(),
            autoinc_syncs: env.autoinc.syncs(),
            stats_transactions: env.sql.transactions(),
            cursors: (101..=103).map(|t| env.cluster.cursor(TabletId(t))).collect(),
            locked: env.locks.locked(),
            held: env.snapshots.held(task.snapshot_version()),
            record: env.records.get(TENANT, task.task_id()).await.expect("get"),
        }
    }

    /// Kills a task in the middle of a phase, and checks that the task
    /// recovered from its record ends up exactly where an uninterrupted run
    /// does.
    #[tokio::test]
    async fn resumes_where_interrupted() {
        type Setup = fn() -> (FakeEnv, TaskParams);
        let cases: [(Setup, TaskStatus, bool); 7] = [
            (flaky_snapshot, TaskStatus::LockTable, false),
            (add_not_null_column, TaskStatus::CheckTableEmpty, false),
            (add_not_null_column, TaskStatus::CheckTableEmpty, true),
            (rebuild_with_dependents, TaskStatus::CopyDependents, false),
            (rebuild_with_dependents, TaskStatus::CopyDependents, true),
            (make_autoinc, TaskStatus::ModifyAutoinc, false),
            (make_autoinc, TaskStatus::ModifyAutoinc, true),
        ];
        for (setup, stop_at, jobs_done) in cases {
            let case = format!("{} with jobs done: {jobs_done}", stop_at.name());

            let (env, task_params) = setup();
            let mut task = create(&env, task_params).await;
            drive(&mut task, &env, |_| ErrorCode::SUCCESS).await;
            let expected = outcome(&task, &env).await;
            assert_eq!(expected.status, TaskStatus::Success, "{case}");

            let (env, task_params) = setup();
            let mut task = create(&env, task_params).await;
            let mut seen = vec![task.status()];
            for _ in 0..100 {
                if task.status() >= stop_at {
                    break;
                }
                task.advance().await.expect("advance");
                complete_jobs(&env, &task.notifier(), &succeed);
                tokio::task::yield_now().await;
                seen.push(task.status());
            }
            assert_eq!(task.status(), stop_at, "{case}");
            // Dispatches the child jobs of the phase, or records the snapshot
            // version without pinning it.
            task.advance().await.expect("advance");
            if jobs_done {
                complete_jobs(&env, &task.notifier(), &succeed);
            }
            assert_eq!(task.status(), stop_at, "{case}");
            drop(task);

            let mut tasks = recover_tasks(&env.services(), &env.configs, &env.metrics)
                .await
                .expect("recover");
            assert_eq!(tasks.len(), 1, "{case}");
            let mut task = tasks.remove(0);
            assert_eq!(task.status(), stop_at, "{case}");
            if stop_at == TaskStatus::LockTable {
                assert_eq!(task.snapshot_version(), SnapshotVersion(100), "{case}");
                assert!(!task.snapshot_held(), "{case}");
            }
            seen.extend(drive(&mut task, &env, |_| ErrorCode::SUCCESS).await);
            assert_monotonic(&seen);
            assert_eq!(outcome(&task, &env).await, expected, "{case}");
        }
    }

    #[tokio::test]
    async fn picks_up_result_of_earlier_child_job() {
        let (env, task_params) = add_not_null_column();
        let mut task = create(&env, task_params).await;
        task.advance().await.unwrap();
        task.advance().await.unwrap();
        task.advance().await.unwrap();
        assert_eq!(task.status(), TaskStatus::CheckTableEmpty);
        complete_jobs(&env, &task.notifier(), &succeed);
        drop(task);

        let mut task = recover_tasks(&env.services(), &env.configs, &env.metrics)
            .await
            .expect("recover")
            .remove(0);
        // The job is known to the scheduler and not submitted again.
        task.advance().await.unwrap();
        assert_eq!(task.status(), TaskStatus::CheckTableEmpty);
        assert_eq!(env.jobs.submitted().len(), 1);
        assert!(env.jobs.take_pending().is_empty());

        task.advance().await.unwrap();
        assert_eq!(task.status(), TaskStatus::BuildShadowData);
        assert!(task.flags().table_empty_checked);

        // A failure reported before the restart fails the task all the same.
        let (env, task_params) = add_not_null_column();
        let mut task = create(&env, task_params).await;
        for _ in 0..3 {
            task.advance().await.unwrap();
        }
        complete_jobs(&env, &task.notifier(), &|_: &JobDescriptor| {
            ErrorCode::ERR_UNEXPECTED
        });
        drop(task);
        let mut task = recover_tasks(&env.services(), &env.configs, &env.metrics)
            .await
            .expect("recover")
            .remove(0);
        let seen = drive(&mut task, &env, |_| ErrorCode::SUCCESS).await;
        assert_monotonic(&seen);
        assert_eq!(task.status(), TaskStatus::Fail);
        assert_eq!(task.ret_code(), ErrorCode::ERR_UNEXPECTED);
    }

    #[tokio::test]
    async fn checks_table_empty_once() {
        let (env, task_params) = add_not_null_column();
        let mut task = create(&env, task_params).await;

        task.advance().await.unwrap();
        task.advance().await.unwrap();
        assert_eq!(task.status(), TaskStatus::CheckTableEmpty);
        for _ in 0..3 {
            task.advance().await.unwrap();
            assert_eq!(task.status(), TaskStatus::CheckTableEmpty);
        }
        let jobs = env.jobs.submitted();
        assert_eq!(jobs.len(), 1);
        let key = jobs[0].reply_key();
        assert_eq!(key.kind, DependJobKind::CheckTableEmpty);

        task.on_child_task_finish(key, ErrorCode::SUCCESS).unwrap();
        task.advance().await.unwrap();
        assert_eq!(task.status(), TaskStatus::BuildShadowData);
        assert!(task.flags().table_empty_checked);
        assert_eq!(env.jobs.submitted().len(), 1);
    }

    #[tokio::test]
    async fn non_empty_table_fails() {
        let (env, task_params) = add_not_null_column();
        let mut task = create(&env, task_params).await;
        let seen = drive(&mut task, &env, |_| ErrorCode::ERR_UNEXPECTED).await;
        assert_monotonic(&seen);
        assert_eq!(task.status(), TaskStatus::Fail);
        assert_eq!(task.ret_code(), ErrorCode::ERR_UNEXPECTED);
        // The task failed before building anything.
        assert!(env.sql.executed().is_empty());
        assert!(env.locks.locked().is_empty());
        assert!(env.snapshots.held(SnapshotVersion(100)).is_empty());
    }

    #[tokio::test]
    async fn lock_contention_waits() {
        let env = env_with_tables(|_| {});
        env.locks.contend(TableId(600), 1);
        let mut task = create(&env, params(TaskKind::ColumnRedefinition, widen_b())).await;

        task.advance().await.unwrap();
        assert_eq!(task.status(), TaskStatus::LockTable);
        task.advance().await.unwrap();
        assert_eq!(task.status(), TaskStatus::LockTable);
        assert_eq!(task.retry_count(), 0);
        assert!(!task.snapshot_held());

        task.advance().await.unwrap();
        assert_eq!(task.status(), TaskStatus::CheckTableEmpty);
        assert_eq!(
            env.locks.locked().into_iter().collect::<Vec<_>>(),
            vec![TableId(500), TableId(600)]
        );
        assert!(task.snapshot_held());
    }

    #[tokio::test]
    async fn discarded_snapshot_is_retaken() {
        let env = env_with_tables(|_| {});
        env.snapshots.discard(SnapshotVersion(100));
        let mut task = create(&env, params(TaskKind::ColumnRedefinition, widen_b())).await;

        task.advance().await.unwrap();
        task.advance().await.unwrap();
        assert_eq!(task.status(), TaskStatus::LockTable);
        assert_eq!(task.snapshot_version(), SnapshotVersion::INVALID);
        assert!(!task.snapshot_held());
        assert_eq!(task.ret_code(), ErrorCode::SUCCESS);
        assert!(env.snapshots.held(SnapshotVersion(100)).is_empty());
        // The version was recorded before it was pinned.
        let record = env.records.get(TENANT, TaskId(42)).await.unwrap().unwrap();
        assert_eq!(record.snapshot_version, SnapshotVersion(100));

        env.barrier.set_ready(Some(SnapshotVersion(200)));
        task.advance().await.unwrap();
        assert_eq!(task.status(), TaskStatus::CheckTableEmpty);
        assert_eq!(task.snapshot_version(), SnapshotVersion(200));
        assert_eq!(env.snapshots.held(SnapshotVersion(200)).len(), 6);
    }

    #[tokio::test]
    async fn waits_for_old_transactions() {
        let env = env_with_tables(|_| {});
        env.barrier.set_ready(None);
        let mut task = create(&env, params(TaskKind::ColumnRedefinition, widen_b())).await;
        task.advance().await.unwrap();
        task.advance().await.unwrap();
        task.advance().await.unwrap();
        assert_eq!(task.status(), TaskStatus::LockTable);
        assert_eq!(task.snapshot_version(), SnapshotVersion::INVALID);

        env.barrier.set_ready(Some(SnapshotVersion(100)));
        task.advance().await.unwrap();
        assert_eq!(task.status(), TaskStatus::CheckTableEmpty);
    }

    #[tokio::test]
    async fn checksum_mismatch_fails() {
        let env = env_with_tables(|_| {});
        env.checksums.put(
            TableId(600),
            [(ColumnId(16), 7), (ColumnId(17), 9)].into_iter().collect(),
        );
        let mut task = create(&env, params(TaskKind::ColumnRedefinition, widen_b())).await;
        let seen = drive(&mut task, &env, |_| ErrorCode::SUCCESS).await;

        assert_monotonic(&seen);
        assert_eq!(task.status(), TaskStatus::Fail);
        assert_eq!(task.ret_code(), ErrorCode::CHECKSUM_ERROR);
        assert!(task.message().contains("checksum mismatch"));
        assert_eq!(env.metrics.checksum_mismatches.get(), 1);
        // The shadow table is cleaned up and nothing is swapped.
        let ddl: Vec<_> = env.ddl.requests().into_iter().map(|r| r.task_type).collect();
        assert_eq!(ddl, vec![DdlTaskType::CleanupGarbage]);
        assert!(env.locks.locked().is_empty());
        assert_eq!(env.records.get(TENANT, TaskId(42)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn retryable_build_failure_rebuilds() {
        let env = env_with_tables(|_| {});
        env.sql.fail_once("INSERT", ErrorCode::TIMEOUT);
        let mut task = create(&env, params(TaskKind::ColumnRedefinition, widen_b())).await;
        let seen = drive(&mut task, &env, |_| ErrorCode::SUCCESS).await;
        assert_monotonic(&seen);
        assert_eq!(task.status(), TaskStatus::Success);
        assert_eq!(task.execution_id(), 1);
        let executed = env.sql.executed();
        assert_eq!(executed.len(), 1);
        assert!(executed[0].0.contains("'ddl_execution_id', 1"));
    }

    #[tokio::test]
    async fn dependents_validated() {
        let (env, task_params) = rebuild_with_dependents();
        let kind = task_params.kind.clone();
        let alter = task_params.alter.clone();
        let mut task = create(&env, task_params).await;
        let seen = drive(&mut task, &env, |_| ErrorCode::SUCCESS).await;
        assert_monotonic(&seen);
        assert_eq!(task.status(), TaskStatus::Success);
        let kinds: Vec<_> = env
            .jobs
            .submitted()
            .iter()
            .map(|job| job.reply_key().kind)
            .collect();
        assert_eq!(kinds, vec![DependJobKind::Constraint, DependJobKind::ForeignKey]);

        // A failing foreign key fails the whole task with its code.
        let env = env_with_tables(|target| target.foreign_keys.push(fk_parent()));
        let mut task = create(&env, params(kind, alter)).await;
        drive(&mut task, &env, |job| match job {
            JobDescriptor::ForeignKey { .. } => ErrorCode::TIMEOUT,
            _ => ErrorCode::SUCCESS,
        })
        .await;
        assert_eq!(task.status(), TaskStatus::Fail);
        assert_eq!(task.ret_code(), ErrorCode::TIMEOUT);
    }

    #[tokio::test]
    async fn autoinc_values_carried_over() {
        let (env, task_params) = make_autoinc();
        let mut task = create(&env, task_params).await;
        drive(&mut task, &env, |_| ErrorCode::SUCCESS).await;
        assert_eq!(task.status(), TaskStatus::Success);

        let synced: Vec<_> = env
            .autoinc
            .syncs()
            .into_iter()
            .map(|p| (p.table, p.column, p.value_to_sync))
            .collect();
        assert_eq!(
            synced,
            vec![
                // The rewrite job reported 51 as the next value.
                (TableId(600), ColumnId(17), 50),
                (TableId(600), ColumnId(16), 999),
            ]
        );
    }

    #[tokio::test]
    async fn retries_exhausted() {
        let env = env_with_tables(|_| {});
        let mut updates = ConfigUpdates::default();
        updates.add_value(REDEFINITION_MAX_RETRIES.name(), ConfigValue::Usize(2));
        updates.apply(&env.configs);
        let mut task = create(&env, params(TaskKind::ColumnRedefinition, widen_b())).await;
        task.advance().await.unwrap();

        // The local catalog lags behind the task's schema version.
        env.catalog.set_latest_schema_version(SchemaVersion(2));
        task.advance().await.unwrap();
        task.advance().await.unwrap();
        assert_eq!(task.status(), TaskStatus::LockTable);
        assert_eq!(task.retry_count(), 2);
        assert_eq!(env.metrics.retries("lock_table"), 2);

        task.advance().await.unwrap();
        assert_eq!(task.status(), TaskStatus::Fail);
        assert_eq!(task.ret_code(), ErrorCode::SCHEMA_EAGAIN);
        task.advance().await.unwrap();
        assert!(!task.need_retry());
    }

    #[tokio::test]
    async fn vanished_table_fails() {
        let env = env_with_tables(|_| {});
        let mut task = create(&env, params(TaskKind::ColumnRedefinition, widen_b())).await;
        task.advance().await.unwrap();
        env.catalog.remove(TableId(600));
        task.advance().await.unwrap();
        assert_eq!(task.status(), TaskStatus::Fail);
        assert_eq!(task.ret_code(), ErrorCode::TABLE_NOT_EXIST);
        task.advance().await.unwrap();
        assert!(!task.need_retry());
    }

    #[tokio::test]
    async fn releases_snapshot_after_shadow_table_dropped() {
        let env = env_with_tables(|_| {});
        let mut task = create(&env, params(TaskKind::ColumnRedefinition, widen_b())).await;
        task.advance().await.unwrap();
        task.advance().await.unwrap();
        assert_eq!(task.status(), TaskStatus::CheckTableEmpty);
        assert_eq!(env.snapshots.held(SnapshotVersion(100)).len(), 6);

        env.drop_table(TableId(600));
        task.advance().await.unwrap();
        assert_eq!(task.status(), TaskStatus::Fail);
        assert_eq!(task.ret_code(), ErrorCode::TABLE_NOT_EXIST);
        assert!(!task.need_retry());
        // The source table is unpinned and unlocked before the record goes.
        assert!(env.snapshots.held(SnapshotVersion(100)).is_empty());
        assert!(!env.locks.locked().contains(&TableId(500)));
        assert_eq!(env.records.get(TENANT, TaskId(42)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancelled_by_operator() {
        let env = env_with_tables(|_| {});
        let mut task = create(&env, params(TaskKind::ColumnRedefinition, widen_b())).await;
        task.advance().await.unwrap();
        task.advance().await.unwrap();
        assert_eq!(task.status(), TaskStatus::CheckTableEmpty);

        env.records
            .update_status(TENANT, TaskId(42), TaskStatus::Fail, ErrorCode::ERR_UNEXPECTED)
            .await
            .unwrap();
        task.advance().await.unwrap();
        assert_eq!(task.status(), TaskStatus::Fail);
        assert_eq!(task.ret_code(), ErrorCode::ERR_UNEXPECTED);
        assert!(!task.need_retry());
        assert!(env.locks.locked().is_empty());
        assert!(env.snapshots.held(SnapshotVersion(100)).is_empty());
    }

    #[tokio::test]
    async fn stops_out_of_service() {
        let env = env_with_tables(|_| {});
        let mut task = create(&env, params(TaskKind::ColumnRedefinition, widen_b())).await;
        env.status.set_in_service(false);
        let err = task.advance().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::STATE_NOT_MATCH);
        assert!(!task.need_retry());
        assert_eq!(task.status(), TaskStatus::Prepare);
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let env = env_with_tables(|_| {});
        let mut task = create(&env, params(TaskKind::ColumnRedefinition, widen_b())).await;
        task.finish().await.expect("finish");
        task.finish().await.expect("finish again");
        assert_eq!(env.records.get(TENANT, TaskId(42)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_bad_params() {
        let env = env_with_tables(|_| {});
        let mut bad = params(TaskKind::ColumnRedefinition, widen_b());
        bad.target = bad.source;
        let err = RedefinitionTask::create(bad, env.services(), env.configs.clone(), env.metrics.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, RedefinitionError::InvalidArgument(_)));

        create(&env, params(TaskKind::ColumnRedefinition, widen_b())).await;
        let err = RedefinitionTask::create(
            params(TaskKind::ColumnRedefinition, widen_b()),
            env.services(),
            env.configs.clone(),
            env.metrics.clone(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RedefinitionError::EntryExist(_)));
    }
}
