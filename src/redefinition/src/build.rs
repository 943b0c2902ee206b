// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The job copying the rows of a source table into its shadow table.
//!
//! The copy is a single `INSERT ... SELECT` reading the source table at the
//! task's snapshot. It runs as a spawned tokio task and reports its result
//! through the parent's [`ChildTaskNotifier`], like any other child job. The
//! copy job also computes the per-column checksums later compared by
//! [`crate::checksum::ChecksumValidator`], keyed by the execution id embedded
//! in the statement.

use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::depend::{ChildTaskNotifier, DependJobKind, DependTaskKey};
use crate::error::{ErrorCode, RedefinitionError};
use crate::ids::{Deadline, SchemaVersion, SnapshotVersion, TableId, TaskId, TenantId, with_deadline};
use crate::kind::TaskKind;
use crate::metrics::ExternalOpMetrics;
use crate::schema::{AlterTableArg, ColumnNameMap, CompatMode, SqlMode, TableSchema};
use crate::service::{SessionOptions, SqlExecutor};

/// A fully prepared shadow data build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildReplicaDescriptor {
    pub tenant: TenantId,
    pub task_id: TaskId,
    pub source: TableId,
    pub target: TableId,
    pub schema_version: SchemaVersion,
    pub snapshot_version: SnapshotVersion,
    pub execution_id: i64,
    pub parallelism: u32,
    pub session: SessionOptions,
    pub statement: String,
}

impl BuildReplicaDescriptor {
    /// The key the build reports its completion under.
    pub fn reply_key(&self) -> DependTaskKey {
        build_reply_key(self.target, self.schema_version)
    }
}

pub fn build_reply_key(target: TableId, schema_version: SchemaVersion) -> DependTaskKey {
    DependTaskKey::new(DependJobKind::BuildReplica, target.0, schema_version)
}

/// The identity of the task a build belongs to.
#[derive(Clone, Copy, Debug)]
pub struct BuildContext {
    pub tenant: TenantId,
    pub task_id: TaskId,
    pub schema_version: SchemaVersion,
    pub snapshot_version: SnapshotVersion,
    pub execution_id: i64,
    pub parallelism: u32,
}

/// Prepares the build of `target` from `source`.
pub fn prepare_build_replica(
    ctx: BuildContext,
    source: &TableSchema,
    target: &TableSchema,
    alter: &AlterTableArg,
    kind: &TaskKind,
) -> Result<BuildReplicaDescriptor, RedefinitionError> {
    if !ctx.snapshot_version.is_valid() {
        return Err(RedefinitionError::InvalidArgument(format!(
            "cannot build table {} without a snapshot",
            target.id
        )));
    }
    let names = ColumnNameMap::new(source, alter)?;
    let heap_table = kind.use_heap_table_plan();
    let statement = generate_build_replica_sql(
        source,
        target,
        &names,
        ctx.snapshot_version,
        ctx.execution_id,
        ctx.parallelism,
        heap_table,
    )?;
    Ok(BuildReplicaDescriptor {
        tenant: ctx.tenant,
        task_id: ctx.task_id,
        source: source.id,
        target: target.id,
        schema_version: ctx.schema_version,
        snapshot_version: ctx.snapshot_version,
        execution_id: ctx.execution_id,
        parallelism: ctx.parallelism,
        session: build_session_options(source.compat_mode, alter.sql_mode, heap_table),
        statement,
    })
}

/// The session the copy statement runs in. Oracle mode tenants always copy
/// in strict mode with padded chars.
pub fn build_session_options(
    compat_mode: CompatMode,
    sql_mode: SqlMode,
    heap_table: bool,
) -> SessionOptions {
    let sql_mode = match compat_mode {
        CompatMode::Oracle => SqlMode::STRICT_ALL_TABLES | SqlMode::PAD_CHAR_TO_FULL_LENGTH,
        CompatMode::MySql => sql_mode,
    };
    SessionOptions {
        heap_table_ddl: heap_table,
        ..SessionOptions::ddl(compat_mode, sql_mode)
    }
}

fn quote(compat_mode: CompatMode, ident: &str) -> String {
    match compat_mode {
        CompatMode::MySql => format!("`{}`", ident.replace('`', "``")),
        CompatMode::Oracle => format!("\"{}\"", ident.replace('"', "\"\"")),
    }
}

/// Generates the statement copying every surviving column of `source` into
/// `target` as of `snapshot`.
pub fn generate_build_replica_sql(
    source: &TableSchema,
    target: &TableSchema,
    names: &ColumnNameMap,
    snapshot: SnapshotVersion,
    execution_id: i64,
    parallelism: u32,
    heap_table: bool,
) -> Result<String, RedefinitionError> {
    let mode = source.compat_mode;
    let mut insert_columns = Vec::new();
    let mut select_columns = Vec::new();
    for src in &source.columns {
        if src.is_hidden() || src.generated {
            continue;
        }
        let Some(dst_name) = names.get(&src.name) else {
            continue;
        };
        let Some(dst) = target.column_by_name(dst_name) else {
            return Err(RedefinitionError::Internal(format!(
                "column {} of table {} maps to {} missing from table {}",
                src.name, source.id, dst_name, target.id
            )));
        };
        if dst.generated {
            continue;
        }
        insert_columns.push(quote(mode, &dst.name));
        select_columns.push(quote(mode, &src.name));
    }
    if insert_columns.is_empty() {
        return Err(RedefinitionError::InvalidArgument(format!(
            "no column of table {} survives into table {}",
            source.id, target.id
        )));
    }

    let source_name = quote(mode, &source.name);
    let scan_hint = if heap_table {
        format!("full({source_name})")
    } else {
        format!("index({source_name} primary)")
    };
    Ok(format!(
        "INSERT /*+ monitor enable_parallel_dml parallel({parallelism}) \
         opt_param('ddl_execution_id', {execution_id}) */ INTO {}.{}({}) \
         SELECT /*+ {scan_hint} */ {} FROM {}.{} AS OF SNAPSHOT {}",
        quote(mode, &target.database_name),
        quote(mode, &target.name),
        insert_columns.iter().join(", "),
        select_columns.iter().join(", "),
        quote(mode, &source.database_name),
        source_name,
        snapshot,
    ))
}

/// Runs the build in the background. The result, success or not, is reported
/// to `notifier` under the descriptor's reply key, which the caller must
/// have registered.
pub fn spawn_build_replica(
    sql: Arc<dyn SqlExecutor>,
    descriptor: BuildReplicaDescriptor,
    timeout: Duration,
    notifier: ChildTaskNotifier,
    metrics: ExternalOpMetrics,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let key = descriptor.reply_key();
        info!(
            task_id = %descriptor.task_id, tenant_id = %descriptor.tenant,
            source = %descriptor.source, target = %descriptor.target,
            execution_id = descriptor.execution_id, parallelism = descriptor.parallelism,
            strict = descriptor.session.sql_mode.is_strict(),
            "building shadow table"
        );
        let deadline = Deadline::after(timeout);
        let res = metrics
            .run_op(|| {
                with_deadline(
                    "build replica",
                    deadline,
                    sql.execute(
                        descriptor.tenant,
                        &descriptor.statement,
                        deadline,
                        &descriptor.session,
                    ),
                )
            })
            .await;
        let code = match res {
            Ok(rows) => {
                info!(task_id = %descriptor.task_id, target = %descriptor.target, rows, "shadow table built");
                ErrorCode::SUCCESS
            }
            Err(err) => {
                warn!(task_id = %descriptor.task_id, target = %descriptor.target, error = %err, "shadow table build failed");
                err.code()
            }
        };
        if let Err(err) = notifier.on_child_task_finish(key, code) {
            warn!(task_id = %descriptor.task_id, %key, error = %err, "failed to report shadow table build");
        }
    })
}
