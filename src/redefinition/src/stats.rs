// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Moving optimizer statistics from a source table to its shadow table.
//!
//! Statistics rows are keyed by table id, partition id and (for column
//! statistics) column id. Rather than recollecting them, the rows of the
//! source table are rewritten to the shadow table's ids, in a single
//! transaction, just before the swap. Column statistics are only carried over
//! for columns whose stored values the change leaves untouched.

use itertools::Itertools;
use tracing::{debug, info};

use crate::error::RedefinitionError;
use crate::ids::{ColumnId, Deadline, PartitionId, TableId, TenantId};
use crate::kind::TaskKind;
use crate::schema::{AlterTableArg, ColumnNameMap, TableSchema};
use crate::service::SqlExecutor;

const TABLE_STAT: &str = "__all_table_stat";
const TABLE_STAT_HISTORY: &str = "__all_table_stat_history";
const COLUMN_STAT: &str = "__all_column_stat";
const COLUMN_STAT_HISTORY: &str = "__all_column_stat_history";
const HISTOGRAM_STAT: &str = "__all_histogram_stat";
const HISTOGRAM_STAT_HISTORY: &str = "__all_histogram_stat_history";

const COLUMN_STAT_TABLES: [&str; 4] = [
    COLUMN_STAT,
    COLUMN_STAT_HISTORY,
    HISTOGRAM_STAT,
    HISTOGRAM_STAT_HISTORY,
];

/// Statistics tables are tenant local and store a tenant id of 0.
const LOCAL_TENANT_ID: u64 = 0;

/// Generates the statements moving statistics from `source` to `target`.
#[derive(Debug)]
pub struct StatsSync<'a> {
    pub source: &'a TableSchema,
    pub target: &'a TableSchema,
    pub alter: &'a AlterTableArg,
    pub kind: &'a TaskKind,
    /// Number of partitions remapped by one statement.
    pub batch_size: usize,
}

impl<'a> StatsSync<'a> {
    /// The partition id of table level statistics rows.
    fn table_level_partition_ids(&self) -> Result<(i64, i64), RedefinitionError> {
        if self.source.is_partitioned {
            return Ok((-1, -1));
        }
        let partition_id = |table: TableId| {
            i64::try_from(table.0).map_err(|_| {
                RedefinitionError::Internal(format!("table id {table} out of partition id range"))
            })
        };
        Ok((partition_id(self.source.id)?, partition_id(self.target.id)?))
    }

    /// Whether partition ids of the source and shadow table correspond one to
    /// one.
    fn syncs_partitions(&self) -> bool {
        self.kind.strategy().syncs_partition_stats && self.source.is_partitioned
    }

    fn partition_pairs(&self) -> Result<Vec<(PartitionId, PartitionId)>, RedefinitionError> {
        if self.source.partitions.len() != self.target.partitions.len() {
            return Err(RedefinitionError::InvalidArgument(format!(
                "table {} has {} partitions but table {} has {}",
                self.source.id,
                self.source.partitions.len(),
                self.target.id,
                self.target.partitions.len()
            )));
        }
        Ok(self
            .source
            .partition_ids()
            .zip(self.target.partition_ids())
            .collect())
    }

    pub fn table_level(&self) -> Result<Vec<String>, RedefinitionError> {
        let (src_partition, dst_partition) = self.table_level_partition_ids()?;
        Ok([TABLE_STAT, TABLE_STAT_HISTORY]
            .into_iter()
            .map(|table| {
                format!(
                    "UPDATE {table} SET table_id = {}, partition_id = {dst_partition} \
                     WHERE tenant_id = {LOCAL_TENANT_ID} and table_id = {} and partition_id = {src_partition}",
                    self.target.id, self.source.id,
                )
            })
            .collect())
    }

    /// Remaps partition ids in batches. The first batch also moves every row
    /// of the source table to the shadow table's id, later batches find their
    /// rows under the shadow table's id.
    fn partition_level_batches<F>(
        &self,
        tables: &[&str],
        mut statement: F,
    ) -> Result<Vec<String>, RedefinitionError>
    where
        F: FnMut(&str, &str, u64) -> String,
    {
        if !self.syncs_partitions() {
            return Ok(Vec::new());
        }
        let pairs = self.partition_pairs()?;
        let mut statements = Vec::new();
        for (batch_index, batch) in pairs.chunks(self.batch_size.max(1)).enumerate() {
            let cases = batch
                .iter()
                .map(|(src, dst)| format!(" when {src} then {dst}"))
                .join("");
            let filter_table = if batch_index == 0 {
                self.source.id.0
            } else {
                self.target.id.0
            };
            for table in tables {
                statements.push(statement(table, &cases, filter_table));
            }
        }
        Ok(statements)
    }

    pub fn partition_level(&self) -> Result<Vec<String>, RedefinitionError> {
        self.partition_level_batches(&[TABLE_STAT, TABLE_STAT_HISTORY], |table, cases, filter| {
            format!(
                "UPDATE {table} SET table_id={}, partition_id=(case partition_id{cases} \
                 else partition_id end) where tenant_id={LOCAL_TENANT_ID} and table_id={filter}",
                self.target.id,
            )
        })
    }

    /// Pairs of source and shadow column ids whose statistics stay valid.
    pub fn surviving_columns(&self) -> Result<Vec<(ColumnId, ColumnId)>, RedefinitionError> {
        let names = ColumnNameMap::new(self.source, self.alter)?;
        let mut columns = Vec::new();
        for col in &self.source.columns {
            if col.is_hidden() {
                continue;
            }
            let Some(new_name) = names.get(&col.name) else {
                // Dropped by this change.
                continue;
            };
            let Some(new_col) = self.target.column_by_name(new_name) else {
                return Err(RedefinitionError::Internal(format!(
                    "column {} of table {} is missing from table {}",
                    new_name, self.source.id, self.target.id
                )));
            };
            if col.is_offline_change(new_col) {
                debug!(column = %col.name, "column statistics invalidated by change");
                continue;
            }
            columns.push((col.id, new_col.id));
        }
        Ok(columns)
    }

    pub fn column_level(&self) -> Result<Vec<String>, RedefinitionError> {
        let (src_partition, dst_partition) = self.table_level_partition_ids()?;
        let mut statements = Vec::new();
        for (old_col, new_col) in self.surviving_columns()? {
            for table in COLUMN_STAT_TABLES {
                statements.push(format!(
                    "UPDATE {table} SET table_id = {}, partition_id = {dst_partition}, column_id = {new_col} \
                     WHERE tenant_id = {LOCAL_TENANT_ID} and table_id = {} and partition_id = {src_partition} \
                     and column_id = {old_col}",
                    self.target.id, self.source.id,
                ));
            }
            let mut batch_index = 0;
            statements.extend(self.partition_level_batches(
                &COLUMN_STAT_TABLES,
                |table, cases, filter| {
                    // Rows already moved by an earlier batch carry the new
                    // column id.
                    let filter_col = if filter == self.source.id.0 {
                        old_col
                    } else {
                        new_col
                    };
                    batch_index += 1;
                    format!(
                        "UPDATE {table} SET table_id={}, column_id={new_col}, partition_id=(case partition_id{cases} \
                         else partition_id end) where tenant_id={LOCAL_TENANT_ID} and table_id={filter} \
                         and column_id={filter_col}",
                        self.target.id,
                    )
                },
            )?);
            debug!(%old_col, %new_col, statements = batch_index, "column statistics remapped");
        }
        Ok(statements)
    }

    /// Every statement, in execution order.
    pub fn statements(&self) -> Result<Vec<String>, RedefinitionError> {
        let mut statements = self.table_level()?;
        statements.extend(self.partition_level()?);
        statements.extend(self.column_level()?);
        Ok(statements)
    }

    /// Runs every statement in one transaction.
    pub async fn run(
        &self,
        sql: &dyn SqlExecutor,
        tenant: TenantId,
        deadline: Deadline,
    ) -> Result<(), RedefinitionError> {
        let statements = self.statements()?;
        let rows = sql
            .execute_in_transaction(tenant, &statements, deadline)
            .await?;
        info!(
            source = %self.source.id, target = %self.target.id,
            statements = statements.len(), rows,
            "statistics moved to shadow table"
        );
        Ok(())
    }
}
