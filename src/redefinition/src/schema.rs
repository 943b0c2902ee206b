// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The parts of table schemas that a redefinition task inspects.

use std::collections::BTreeMap;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::error::RedefinitionError;
use crate::ids::{
    ColumnId, ConstraintId, ForeignKeyId, PartitionId, SchemaVersion, TableId, TabletId,
};

/// Column data types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DataType {
    TinyInt,
    SmallInt,
    MediumInt,
    Int32,
    BigInt,
    UTinyInt,
    USmallInt,
    UMediumInt,
    UInt32,
    UBigInt,
    Float,
    Double,
    Decimal,
    Char,
    Varchar,
    NChar,
    NVarchar2,
    Date,
    DateTime,
    Timestamp,
    TimestampNano,
    URowId,
    Enum,
    Set,
    Text,
    LongText,
    Blob,
    Json,
}

/// Groups of [`DataType`]s sharing a physical representation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypeClass {
    Int,
    UInt,
    Float,
    Decimal,
    String,
    DateTime,
    RowId,
    EnumSet,
    Lob,
}

impl DataType {
    pub fn type_class(&self) -> TypeClass {
        use DataType::*;
        match self {
            TinyInt | SmallInt | MediumInt | Int32 | BigInt => TypeClass::Int,
            UTinyInt | USmallInt | UMediumInt | UInt32 | UBigInt => TypeClass::UInt,
            Float | Double => TypeClass::Float,
            Decimal => TypeClass::Decimal,
            Char | Varchar | NChar | NVarchar2 => TypeClass::String,
            Date | DateTime | Timestamp | TimestampNano => TypeClass::DateTime,
            URowId => TypeClass::RowId,
            Enum | Set => TypeClass::EnumSet,
            Text | LongText | Blob | Json => TypeClass::Lob,
        }
    }

    /// Whether values are stored out of row, behind a LOB index.
    pub fn is_lob(&self) -> bool {
        self.type_class() == TypeClass::Lob
    }

    pub fn is_enum_or_set(&self) -> bool {
        self.type_class() == TypeClass::EnumSet
    }

    /// A character (not binary) fixed length string.
    pub fn is_char(&self, collation: Collation) -> bool {
        *self == DataType::Char && collation != Collation::Binary
    }

    /// A character (not binary) variable length string.
    pub fn is_varchar(&self, collation: Collation) -> bool {
        *self == DataType::Varchar && collation != Collation::Binary
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Collation {
    Binary,
    Utf8mb4GeneralCi,
    Utf8mb4Bin,
    Utf8mb4UnicodeCi,
    GbkChineseCi,
    Utf16GeneralCi,
}

/// How a column's values are encoded in storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EncodingType {
    Default,
    Dictionary,
    RunLength,
    Raw,
}

/// The SQL dialect a tenant runs in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompatMode {
    MySql,
    Oracle,
}

/// Session SQL mode flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SqlMode(pub u64);

impl SqlMode {
    pub const STRICT_TRANS_TABLES: SqlMode = SqlMode(1 << 0);
    pub const STRICT_ALL_TABLES: SqlMode = SqlMode(1 << 1);
    pub const PAD_CHAR_TO_FULL_LENGTH: SqlMode = SqlMode(1 << 2);
    pub const NO_ZERO_DATE: SqlMode = SqlMode(1 << 3);

    pub fn contains(&self, other: SqlMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn without(&self, other: SqlMode) -> SqlMode {
        SqlMode(self.0 & !other.0)
    }

    pub fn is_strict(&self) -> bool {
        self.contains(Self::STRICT_ALL_TABLES) || self.contains(Self::STRICT_TRANS_TABLES)
    }
}

impl BitOr for SqlMode {
    type Output = SqlMode;

    fn bitor(self, rhs: SqlMode) -> SqlMode {
        SqlMode(self.0 | rhs.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub id: ColumnId,
    pub name: String,
    pub data_type: DataType,
    pub collation: Collation,
    pub length: u32,
    pub precision: i16,
    pub scale: i16,
    pub encoding: EncodingType,
    pub nullable: bool,
    pub autoincrement: bool,
    pub generated: bool,
    /// The value list of enum and set columns, in declaration order.
    pub extended_type_info: Vec<String>,
}

impl ColumnSchema {
    pub fn new(id: ColumnId, name: impl Into<String>, data_type: DataType) -> Self {
        let collation = match data_type.type_class() {
            TypeClass::String | TypeClass::EnumSet | TypeClass::Lob => Collation::Utf8mb4GeneralCi,
            _ => Collation::Binary,
        };
        ColumnSchema {
            id,
            name: name.into(),
            data_type,
            collation,
            length: 0,
            precision: -1,
            scale: -1,
            encoding: EncodingType::Default,
            nullable: true,
            autoincrement: false,
            generated: false,
            extended_type_info: Vec::new(),
        }
    }

    pub fn is_hidden_pk(&self) -> bool {
        self.id == ColumnId::HIDDEN_PK
    }

    /// Whether this column is internal and never shown to users.
    pub fn is_hidden(&self) -> bool {
        self.id < ColumnId::APP_MIN
    }

    /// Whether changing this column into `new` rewrites its stored values.
    pub fn is_offline_change(&self, new: &ColumnSchema) -> bool {
        self.data_type != new.data_type
            || self.collation != new.collation
            || self.precision != new.precision
            || self.scale != new.scale
            || new.length < self.length
            || (!self.autoincrement && new.autoincrement)
            || self.extended_type_info != new.extended_type_info
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub id: PartitionId,
    pub tablet: TabletId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintKind {
    PrimaryKey,
    Check,
    NotNull,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub id: ConstraintId,
    pub name: String,
    pub kind: ConstraintKind,
    /// Whether existing rows must be checked against this constraint.
    pub validated: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub id: ForeignKeyId,
    pub name: String,
    pub parent_table: TableId,
    pub enabled: bool,
    pub validated: bool,
    pub rely: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub id: TableId,
    pub name: String,
    pub database_name: String,
    pub schema_version: SchemaVersion,
    pub compat_mode: CompatMode,
    pub is_tmp_table: bool,
    pub is_partitioned: bool,
    /// For tables that aren't partitioned, the single partition carrying the
    /// table's own id.
    pub partitions: Vec<Partition>,
    pub columns: Vec<ColumnSchema>,
    pub aux_lob_meta_table: Option<TableId>,
    pub aux_lob_piece_table: Option<TableId>,
    /// The shadow table this table is linked with during a redefinition.
    pub association_table: Option<TableId>,
    pub constraints: Vec<Constraint>,
    pub foreign_keys: Vec<ForeignKey>,
    pub order_autoinc_mode: bool,
}

impl TableSchema {
    pub fn column(&self, id: ColumnId) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.id == id)
    }

    pub fn column_by_name(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn tablet_ids(&self) -> impl Iterator<Item = TabletId> + '_ {
        self.partitions.iter().map(|p| p.tablet)
    }

    pub fn partition_ids(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.partitions.iter().map(|p| p.id)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn constraint(&self, id: ConstraintId) -> Option<&Constraint> {
        self.constraints.iter().find(|c| c.id == id)
    }

    pub fn foreign_key(&self, id: ForeignKeyId) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.id == id)
    }

    /// The auxiliary tables holding this table's out of row values.
    pub fn aux_lob_tables(&self) -> impl Iterator<Item = TableId> {
        self.aux_lob_meta_table
            .into_iter()
            .chain(self.aux_lob_piece_table)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlterColumnOp {
    Add,
    Modify,
    Change,
    Drop,
}

/// One column clause of an `ALTER TABLE`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlterColumn {
    pub op: AlterColumnOp,
    /// The name of the existing column this clause refers to. Unset for
    /// [`AlterColumnOp::Add`].
    pub origin_name: Option<String>,
    /// The column's definition after the change.
    pub column: ColumnSchema,
    /// The original default value. `None` is a null default.
    pub default_value: Option<String>,
    pub identity: bool,
}

impl AlterColumn {
    pub fn add(column: ColumnSchema) -> Self {
        AlterColumn {
            op: AlterColumnOp::Add,
            origin_name: None,
            column,
            default_value: None,
            identity: false,
        }
    }

    pub fn modify(origin_name: impl Into<String>, column: ColumnSchema) -> Self {
        AlterColumn {
            op: AlterColumnOp::Modify,
            origin_name: Some(origin_name.into()),
            column,
            default_value: None,
            identity: false,
        }
    }

    pub fn drop(column: ColumnSchema) -> Self {
        AlterColumn {
            op: AlterColumnOp::Drop,
            origin_name: Some(column.name.clone()),
            column,
            default_value: None,
            identity: false,
        }
    }
}

/// The alter request driving a redefinition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlterTableArg {
    pub sql_mode: SqlMode,
    pub columns: Vec<AlterColumn>,
    /// The auto-increment start value reported by the sequence rewrite job.
    pub auto_increment: u64,
    /// The shadow table column newly turned into auto-increment.
    pub autoinc_column: Option<ColumnId>,
}

impl AlterTableArg {
    pub fn new(sql_mode: SqlMode, columns: Vec<AlterColumn>) -> Self {
        AlterTableArg {
            sql_mode,
            columns,
            auto_increment: 0,
            autoinc_column: None,
        }
    }

    /// Whether existing rows would violate a column added by this alter,
    /// i.e. a `NOT NULL` column without a default or identity semantics,
    /// unless the table is empty.
    pub fn check_need_check_table_empty(&self) -> bool {
        self.columns.iter().any(|c| {
            c.op == AlterColumnOp::Add
                && !c.column.nullable
                && c.default_value.is_none()
                && !c.identity
        })
    }
}

/// Maps the names of the source table's columns to their names in the shadow
/// table. Columns dropped by the alter are absent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnNameMap {
    names: BTreeMap<String, String>,
}

impl ColumnNameMap {
    pub fn new(source: &TableSchema, alter: &AlterTableArg) -> Result<Self, RedefinitionError> {
        let mut names: BTreeMap<String, String> = source
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.name.clone()))
            .collect();
        for alter_column in &alter.columns {
            let origin = || {
                alter_column
                    .origin_name
                    .as_deref()
                    .unwrap_or(&alter_column.column.name)
            };
            match alter_column.op {
                AlterColumnOp::Add => {}
                AlterColumnOp::Drop => {
                    if names.remove(origin()).is_none() {
                        return Err(RedefinitionError::InvalidArgument(format!(
                            "dropped column {} does not exist",
                            origin()
                        )));
                    }
                }
                AlterColumnOp::Modify | AlterColumnOp::Change => {
                    let Some(name) = names.get_mut(origin()) else {
                        return Err(RedefinitionError::InvalidArgument(format!(
                            "altered column {} does not exist",
                            origin()
                        )));
                    };
                    *name = alter_column.column.name.clone();
                }
            }
        }
        Ok(ColumnNameMap { names })
    }

    /// The shadow table name of the source column `name`, if it survives.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.names.get(name).map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.names.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
