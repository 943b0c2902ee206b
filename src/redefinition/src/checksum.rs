// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Validation of a shadow table's data by per-column checksums.
//!
//! The job copying rows into the shadow table computes an aggregate checksum
//! of every column of both tables. A source column and its shadow column must
//! have equal checksums whenever the change provably leaves the column's
//! stored bytes untouched. [`build_column_mapping`] decides which columns
//! that holds for, and [`ChecksumValidator::fetch_and_compare`] compares them.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::RedefinitionError;
use crate::ids::{ColumnId, TableId, TaskId, TenantId};
use crate::kind::TaskKind;
use crate::schema::{
    AlterTableArg, ColumnNameMap, ColumnSchema, CompatMode, DataType, SqlMode, TableSchema,
    TypeClass,
};
use crate::service::ChecksumStore;

/// Whether a change of `src` into `dst` leaves stored bytes unchanged, for
/// column pairs that are not an exact match.
///
/// Only consulted in strict SQL mode, where values that don't fit the new type
/// fail the copy instead of being silently truncated.
pub fn check_can_validate_column_checksum(
    compat_mode: CompatMode,
    src: &ColumnSchema,
    dst: &ColumnSchema,
) -> bool {
    let same_collation = src.collation == dst.collation;
    match compat_mode {
        CompatMode::Oracle => match src.data_type {
            DataType::Char => dst.data_type.is_char(dst.collation) && same_collation,
            DataType::Varchar => dst.data_type.is_varchar(dst.collation) && same_collation,
            DataType::NChar => dst.data_type == DataType::NChar && same_collation,
            DataType::NVarchar2 => dst.data_type == DataType::NVarchar2 && same_collation,
            DataType::TimestampNano => dst.data_type == DataType::TimestampNano,
            DataType::URowId => dst.data_type == DataType::URowId,
            _ => false,
        },
        CompatMode::MySql => {
            if !src.autoincrement && dst.autoincrement {
                // Existing values are rewritten.
                return false;
            }
            let (src_class, dst_class) = (src.data_type.type_class(), dst.data_type.type_class());
            match (src_class, dst_class) {
                (TypeClass::Int, TypeClass::Int) | (TypeClass::UInt, TypeClass::UInt) => true,
                _ => match src.data_type {
                    DataType::MediumInt => dst.data_type == DataType::Int32,
                    DataType::Char => dst.data_type.is_char(dst.collation) && same_collation,
                    DataType::Varchar => dst.data_type.is_varchar(dst.collation) && same_collation,
                    _ => false,
                },
            }
        }
    }
}

/// Source column id to shadow column id, for every column whose checksum must
/// match after the copy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ColumnChecksumMapping(BTreeMap<ColumnId, ColumnId>);

impl ColumnChecksumMapping {
    pub fn get(&self, source: ColumnId) -> Option<ColumnId> {
        self.0.get(&source).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ColumnId, ColumnId)> + '_ {
        self.0.iter().map(|(s, d)| (*s, *d))
    }
}

fn exact_match(src: &ColumnSchema, dst: &ColumnSchema) -> bool {
    !(!src.autoincrement && dst.autoincrement)
        && src.data_type == dst.data_type
        && src.length == dst.length
        && src.precision == dst.precision
        && src.scale == dst.scale
        && src.encoding == dst.encoding
        && src.collation == dst.collation
}

/// Pairs up the columns of `source` and `target` whose checksums are
/// comparable after applying `alter`.
pub fn build_column_mapping(
    source: &TableSchema,
    target: &TableSchema,
    alter: &AlterTableArg,
    kind: &TaskKind,
) -> Result<ColumnChecksumMapping, RedefinitionError> {
    let compat_mode = source.compat_mode;
    let sql_mode = match compat_mode {
        CompatMode::Oracle => SqlMode::STRICT_ALL_TABLES,
        CompatMode::MySql => alter.sql_mode.without(SqlMode::PAD_CHAR_TO_FULL_LENGTH),
    };
    let names = ColumnNameMap::new(source, alter)?;

    let mut mapping = BTreeMap::new();
    for src in &source.columns {
        if src.is_hidden_pk() || src.generated {
            // The hidden primary key has no counterpart once a primary key is
            // added.
            continue;
        }
        let dst = names
            .get(&src.name)
            .and_then(|name| target.column_by_name(name));
        let Some(dst) = dst else {
            if kind.strategy().allows_missing_dest_column {
                continue;
            }
            return Err(RedefinitionError::Internal(format!(
                "column {} of table {} has no counterpart in table {} for {}",
                src.name,
                source.id,
                target.id,
                kind.name()
            )));
        };
        if dst.data_type.is_lob() {
            // Checksums of LOB columns cover the LOB index, not the values.
            continue;
        }
        if exact_match(src, dst) {
            if src.data_type.is_enum_or_set() && src.extended_type_info != dst.extended_type_info {
                continue;
            }
            mapping.insert(src.id, dst.id);
        } else if src.data_type == dst.data_type
            && (src.encoding != dst.encoding || src.collation != dst.collation)
        {
            continue;
        } else if sql_mode.is_strict() && check_can_validate_column_checksum(compat_mode, src, dst)
        {
            info!(
                column = %src.name, from = ?src.data_type, to = ?dst.data_type,
                from_length = src.length, to_length = dst.length,
                "validating checksum of converted column"
            );
            mapping.insert(src.id, dst.id);
        }
    }
    Ok(ColumnChecksumMapping(mapping))
}

/// Compares the checksums computed by a copy job.
#[derive(Debug, Clone)]
pub struct ChecksumValidator {
    store: Arc<dyn ChecksumStore>,
}

impl ChecksumValidator {
    pub fn new(store: Arc<dyn ChecksumStore>) -> Self {
        ChecksumValidator { store }
    }

    /// Fails at the first mapped source column whose checksum differs from
    /// its shadow column's. Source columns absent from `mapping` are skipped.
    pub async fn fetch_and_compare(
        &self,
        tenant: TenantId,
        execution_id: i64,
        source: TableId,
        target: TableId,
        task_id: TaskId,
        mapping: &ColumnChecksumMapping,
    ) -> Result<(), RedefinitionError> {
        if execution_id < 0 {
            return Err(RedefinitionError::InvalidArgument(format!(
                "invalid execution id {execution_id}"
            )));
        }
        let source_checksums = self
            .store
            .get_table_column_checksums(tenant, execution_id, source, task_id)
            .await?;
        let target_checksums = self
            .store
            .get_table_column_checksums(tenant, execution_id, target, task_id)
            .await?;

        for (column, source_checksum) in &source_checksums {
            let Some(dest_column) = mapping.get(*column) else {
                continue;
            };
            let Some(target_checksum) = target_checksums.get(&dest_column) else {
                return Err(RedefinitionError::EntryNotFound(format!(
                    "checksum of column {dest_column} of table {target}"
                )));
            };
            if target_checksum != source_checksum {
                warn!(
                    %source, %target, %column, %dest_column, source_checksum, target_checksum,
                    "column checksum is not equal"
                );
                return Err(RedefinitionError::ChecksumMismatch {
                    column: *column,
                    source_checksum: *source_checksum,
                    target_checksum: *target_checksum,
                });
            }
        }
        info!(%source, %target, columns = mapping.len(), "column checksums are equal");
        Ok(())
    }
}
