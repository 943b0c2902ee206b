// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The durable record of a redefinition task.
//!
//! A task is persisted before it causes any remote side effect and is
//! removed only once it cleaned up after itself. In between, the record
//! carries everything needed to rebuild the task after a restart: its
//! identity, the alter request, the current status and the progress made
//! within that status.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::dyncfg::ConfigSet;
use crate::error::{ErrorCode, RedefinitionError};
use crate::ids::{SchemaVersion, SnapshotVersion, TableId, TaskId, TenantId};
use crate::kind::TaskKind;
use crate::metrics::RedefinitionMetrics;
use crate::schema::AlterTableArg;
use crate::service::Services;
use crate::task::{PhaseFlags, RedefinitionTask, TaskStatus};

/// One persisted redefinition task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub tenant: TenantId,
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub source: TableId,
    pub target: TableId,
    pub schema_version: SchemaVersion,
    pub trace_id: Uuid,
    pub parent_task_id: Option<TaskId>,
    pub parallelism: u32,
    pub alter: AlterTableArg,

    pub status: TaskStatus,
    /// [`SnapshotVersion::INVALID`] until a snapshot was obtained.
    pub snapshot_version: SnapshotVersion,
    pub retry_count: u64,
    pub ret_code: ErrorCode,
    pub message: String,
    pub flags: PhaseFlags,
    pub execution_id: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn to_json(&self) -> Result<String, RedefinitionError> {
        serde_json::to_string(self).map_err(|err| {
            RedefinitionError::Internal(format!("encoding task record {}: {err}", self.task_id))
        })
    }

    pub fn from_json(json: &str) -> Result<Self, anyhow::Error> {
        serde_json::from_str(json).context("decoding task record")
    }
}

/// Progress made within the current status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskProgress {
    pub flags: PhaseFlags,
    pub retry_count: u64,
    pub execution_id: i64,
}

/// Durable storage of task records, one per `(tenant, task_id)`.
#[async_trait]
pub trait TaskRecordStore: Debug + Send + Sync {
    /// Fails with [`RedefinitionError::EntryExist`] if the task is already
    /// recorded.
    async fn insert(&self, record: TaskRecord) -> Result<(), RedefinitionError>;

    async fn get(
        &self,
        tenant: TenantId,
        task_id: TaskId,
    ) -> Result<Option<TaskRecord>, RedefinitionError>;

    /// Moves the task into `status`. A new status starts with a fresh retry
    /// budget.
    async fn update_status(
        &self,
        tenant: TenantId,
        task_id: TaskId,
        status: TaskStatus,
        ret_code: ErrorCode,
    ) -> Result<(), RedefinitionError>;

    async fn update_snapshot_version(
        &self,
        tenant: TenantId,
        task_id: TaskId,
        snapshot_version: SnapshotVersion,
    ) -> Result<(), RedefinitionError>;

    async fn update_progress(
        &self,
        tenant: TenantId,
        task_id: TaskId,
        progress: &TaskProgress,
    ) -> Result<(), RedefinitionError>;

    /// Records the final result of the task.
    async fn report_error(
        &self,
        tenant: TenantId,
        task_id: TaskId,
        ret_code: ErrorCode,
        message: &str,
    ) -> Result<(), RedefinitionError>;

    /// Fails with [`RedefinitionError::EntryNotFound`] if there's no such
    /// record.
    async fn remove(&self, tenant: TenantId, task_id: TaskId) -> Result<(), RedefinitionError>;

    /// Every recorded task. A record exists exactly as long as its task
    /// hasn't finished cleaning up.
    async fn list_in_progress(&self) -> Result<Vec<TaskRecord>, RedefinitionError>;
}

/// An in-memory [`TaskRecordStore`].
///
/// Records are kept in their JSON encoding, exactly as a durable
/// implementation would store them.
#[derive(Debug, Default)]
pub struct MemTaskRecordStore {
    records: Mutex<BTreeMap<(TenantId, TaskId), String>>,
}

impl MemTaskRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode(json: &str) -> Result<TaskRecord, RedefinitionError> {
        TaskRecord::from_json(json).map_err(|err| RedefinitionError::Internal(format!("{err:#}")))
    }

    fn modify(
        &self,
        tenant: TenantId,
        task_id: TaskId,
        f: impl FnOnce(&mut TaskRecord),
    ) -> Result<(), RedefinitionError> {
        let mut records = self.records.lock().expect("lock poisoned");
        let Some(json) = records.get_mut(&(tenant, task_id)) else {
            return Err(RedefinitionError::EntryNotFound(format!(
                "task record {tenant}/{task_id}"
            )));
        };
        let mut record = Self::decode(json)?;
        f(&mut record);
        record.updated_at = Utc::now();
        *json = record.to_json()?;
        Ok(())
    }
}

#[async_trait]
impl TaskRecordStore for MemTaskRecordStore {
    async fn insert(&self, record: TaskRecord) -> Result<(), RedefinitionError> {
        let json = record.to_json()?;
        let mut records = self.records.lock().expect("lock poisoned");
        let key = (record.tenant, record.task_id);
        if records.contains_key(&key) {
            return Err(RedefinitionError::EntryExist(format!(
                "task record {}/{}",
                record.tenant, record.task_id
            )));
        }
        records.insert(key, json);
        Ok(())
    }

    async fn get(
        &self,
        tenant: TenantId,
        task_id: TaskId,
    ) -> Result<Option<TaskRecord>, RedefinitionError> {
        let records = self.records.lock().expect("lock poisoned");
        records
            .get(&(tenant, task_id))
            .map(|json| Self::decode(json))
            .transpose()
    }

    async fn update_status(
        &self,
        tenant: TenantId,
        task_id: TaskId,
        status: TaskStatus,
        ret_code: ErrorCode,
    ) -> Result<(), RedefinitionError> {
        self.modify(tenant, task_id, |record| {
            record.status = status;
            record.ret_code = ret_code;
            record.retry_count = 0;
        })
    }

    async fn update_snapshot_version(
        &self,
        tenant: TenantId,
        task_id: TaskId,
        snapshot_version: SnapshotVersion,
    ) -> Result<(), RedefinitionError> {
        self.modify(tenant, task_id, |record| {
            record.snapshot_version = snapshot_version;
        })
    }

    async fn update_progress(
        &self,
        tenant: TenantId,
        task_id: TaskId,
        progress: &TaskProgress,
    ) -> Result<(), RedefinitionError> {
        self.modify(tenant, task_id, |record| {
            record.flags = progress.flags.clone();
            record.retry_count = progress.retry_count;
            record.execution_id = progress.execution_id;
        })
    }

    async fn report_error(
        &self,
        tenant: TenantId,
        task_id: TaskId,
        ret_code: ErrorCode,
        message: &str,
    ) -> Result<(), RedefinitionError> {
        self.modify(tenant, task_id, |record| {
            record.ret_code = ret_code;
            record.message = message.to_owned();
        })
    }

    async fn remove(&self, tenant: TenantId, task_id: TaskId) -> Result<(), RedefinitionError> {
        let mut records = self.records.lock().expect("lock poisoned");
        match records.remove(&(tenant, task_id)) {
            Some(_) => Ok(()),
            None => Err(RedefinitionError::EntryNotFound(format!(
                "task record {tenant}/{task_id}"
            ))),
        }
    }

    async fn list_in_progress(&self) -> Result<Vec<TaskRecord>, RedefinitionError> {
        let records = self.records.lock().expect("lock poisoned");
        records.values().map(|json| Self::decode(json)).collect()
    }
}

/// Rebuilds every task still recorded in `services.records`, each resuming
/// at its persisted status.
pub async fn recover_tasks(
    services: &Services,
    configs: &ConfigSet,
    metrics: &RedefinitionMetrics,
) -> Result<Vec<RedefinitionTask>, RedefinitionError> {
    let records = services.records.list_in_progress().await?;
    info!(tasks = records.len(), "recovering redefinition tasks");
    Ok(records
        .into_iter()
        .map(|record| {
            RedefinitionTask::from_record(record, services.clone(), configs.clone(), metrics.clone())
        })
        .collect())
}
