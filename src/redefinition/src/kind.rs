// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The kinds of schema change carried out by a redefinition.

use serde::{Deserialize, Serialize};

/// The schema change a redefinition task performs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    /// A column type or attribute change that can't be done in place.
    ColumnRedefinition,
    /// Any other change that requires rewriting the whole table.
    TableRedefinition {
        /// The source table has no primary key, so rows are copied in heap
        /// order.
        heap_table: bool,
    },
    /// A change of the partitioning scheme.
    AlterPartitionBy,
    DropColumn,
    AddPrimaryKey,
    DropPrimaryKey,
}

/// Behavior that differs between [`TaskKind`]s.
#[derive(Debug)]
pub struct KindStrategy {
    pub name: &'static str,
    /// A source column may legitimately have no counterpart in the shadow
    /// table, because the change dropped it.
    pub allows_missing_dest_column: bool,
    /// Partition ids of source and shadow table correspond one to one, so
    /// partition level statistics can be carried over.
    pub syncs_partition_stats: bool,
    /// Check constraints and foreign keys of the shadow table have to be
    /// validated by child tasks before the swap.
    pub rebuilds_dependents: bool,
}

const COLUMN_REDEFINITION: KindStrategy = KindStrategy {
    name: "column_redefinition",
    allows_missing_dest_column: true,
    syncs_partition_stats: true,
    rebuilds_dependents: false,
};

const TABLE_REDEFINITION: KindStrategy = KindStrategy {
    name: "table_redefinition",
    allows_missing_dest_column: true,
    syncs_partition_stats: true,
    rebuilds_dependents: true,
};

const ALTER_PARTITION_BY: KindStrategy = KindStrategy {
    name: "alter_partition_by",
    allows_missing_dest_column: true,
    syncs_partition_stats: false,
    rebuilds_dependents: true,
};

const DROP_COLUMN: KindStrategy = KindStrategy {
    name: "drop_column",
    allows_missing_dest_column: true,
    syncs_partition_stats: true,
    rebuilds_dependents: false,
};

const ADD_PRIMARY_KEY: KindStrategy = KindStrategy {
    name: "add_primary_key",
    allows_missing_dest_column: false,
    syncs_partition_stats: true,
    rebuilds_dependents: true,
};

const DROP_PRIMARY_KEY: KindStrategy = KindStrategy {
    name: "drop_primary_key",
    allows_missing_dest_column: false,
    syncs_partition_stats: true,
    rebuilds_dependents: true,
};

impl TaskKind {
    pub fn strategy(&self) -> &'static KindStrategy {
        match self {
            TaskKind::ColumnRedefinition => &COLUMN_REDEFINITION,
            TaskKind::TableRedefinition { .. } => &TABLE_REDEFINITION,
            TaskKind::AlterPartitionBy => &ALTER_PARTITION_BY,
            TaskKind::DropColumn => &DROP_COLUMN,
            TaskKind::AddPrimaryKey => &ADD_PRIMARY_KEY,
            TaskKind::DropPrimaryKey => &DROP_PRIMARY_KEY,
        }
    }

    pub fn name(&self) -> &'static str {
        self.strategy().name
    }

    /// Whether the shadow data build copies rows in heap order.
    pub fn use_heap_table_plan(&self) -> bool {
        matches!(self, TaskKind::TableRedefinition { heap_table: true })
    }
}
