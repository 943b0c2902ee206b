// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Errors and the numeric result codes shared with remote services.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{ColumnId, SnapshotVersion, TableId};

/// A numeric result code as reported by remote services and child jobs.
///
/// The numbering follows the storage cluster's conventions: zero is success
/// and every failure is negative.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const SUCCESS: ErrorCode = ErrorCode(0);
    pub const INVALID_ARGUMENT: ErrorCode = ErrorCode(-4002);
    pub const NOT_INIT: ErrorCode = ErrorCode(-4006);
    pub const TIMEOUT: ErrorCode = ErrorCode(-4012);
    pub const ERR_UNEXPECTED: ErrorCode = ErrorCode(-4016);
    pub const ENTRY_EXIST: ErrorCode = ErrorCode(-4017);
    pub const ENTRY_NOT_EXIST: ErrorCode = ErrorCode(-4018);
    pub const EAGAIN: ErrorCode = ErrorCode(-4023);
    pub const NOT_MASTER: ErrorCode = ErrorCode(-4038);
    pub const CHECKSUM_ERROR: ErrorCode = ErrorCode(-4103);
    pub const STATE_NOT_MATCH: ErrorCode = ErrorCode(-4109);
    pub const RPC_CONNECT_ERROR: ErrorCode = ErrorCode(-4121);
    pub const RPC_SEND_ERROR: ErrorCode = ErrorCode(-4122);
    pub const SNAPSHOT_DISCARDED: ErrorCode = ErrorCode(-4138);
    pub const SERVER_IS_STOPPING: ErrorCode = ErrorCode(-4150);
    pub const LS_LOCATION_LEADER_NOT_EXIST: ErrorCode = ErrorCode(-4654);
    pub const LS_NOT_EXIST: ErrorCode = ErrorCode(-4719);
    pub const TABLET_NOT_EXIST: ErrorCode = ErrorCode(-4725);
    pub const TABLE_NOT_EXIST: ErrorCode = ErrorCode(-5019);
    pub const SCHEMA_EAGAIN: ErrorCode = ErrorCode(-5627);
    pub const TRY_LOCK_ROW_CONFLICT: ErrorCode = ErrorCode(-6005);
    pub const TRANS_KILLED: ErrorCode = ErrorCode(-6224);
    pub const OBJ_LOCK_NOT_EXIST: ErrorCode = ErrorCode(-6237);

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }

    /// The symbolic name of this code, if it is one we know about.
    pub fn name(&self) -> Option<&'static str> {
        let name = match *self {
            Self::SUCCESS => "SUCCESS",
            Self::INVALID_ARGUMENT => "INVALID_ARGUMENT",
            Self::NOT_INIT => "NOT_INIT",
            Self::TIMEOUT => "TIMEOUT",
            Self::ERR_UNEXPECTED => "ERR_UNEXPECTED",
            Self::ENTRY_EXIST => "ENTRY_EXIST",
            Self::ENTRY_NOT_EXIST => "ENTRY_NOT_EXIST",
            Self::EAGAIN => "EAGAIN",
            Self::NOT_MASTER => "NOT_MASTER",
            Self::CHECKSUM_ERROR => "CHECKSUM_ERROR",
            Self::STATE_NOT_MATCH => "STATE_NOT_MATCH",
            Self::RPC_CONNECT_ERROR => "RPC_CONNECT_ERROR",
            Self::RPC_SEND_ERROR => "RPC_SEND_ERROR",
            Self::SNAPSHOT_DISCARDED => "SNAPSHOT_DISCARDED",
            Self::SERVER_IS_STOPPING => "SERVER_IS_STOPPING",
            Self::LS_LOCATION_LEADER_NOT_EXIST => "LS_LOCATION_LEADER_NOT_EXIST",
            Self::LS_NOT_EXIST => "LS_NOT_EXIST",
            Self::TABLET_NOT_EXIST => "TABLET_NOT_EXIST",
            Self::TABLE_NOT_EXIST => "TABLE_NOT_EXIST",
            Self::SCHEMA_EAGAIN => "SCHEMA_EAGAIN",
            Self::TRY_LOCK_ROW_CONFLICT => "TRY_LOCK_ROW_CONFLICT",
            Self::TRANS_KILLED => "TRANS_KILLED",
            Self::OBJ_LOCK_NOT_EXIST => "OBJ_LOCK_NOT_EXIST",
            _ => return None,
        };
        Some(name)
    }

    /// Whether a failed table lock attempt should simply be tried again later.
    pub fn is_table_lock_retry(&self) -> bool {
        matches!(
            *self,
            Self::TRY_LOCK_ROW_CONFLICT
                | Self::NOT_MASTER
                | Self::TIMEOUT
                | Self::EAGAIN
                | Self::LS_LOCATION_LEADER_NOT_EXIST
        )
    }

    /// Whether a tablet-level RPC failure is caused by leadership or network
    /// churn and the tablet should be retried in the next round.
    pub fn is_transient(&self) -> bool {
        matches!(
            *self,
            Self::TIMEOUT
                | Self::EAGAIN
                | Self::NOT_MASTER
                | Self::RPC_CONNECT_ERROR
                | Self::RPC_SEND_ERROR
                | Self::LS_LOCATION_LEADER_NOT_EXIST
                | Self::LS_NOT_EXIST
                | Self::SNAPSHOT_DISCARDED
                | Self::TRY_LOCK_ROW_CONFLICT
        )
    }

    /// Codes that leave a task in its current phase to be retried, rather
    /// than failing it.
    pub fn in_retry_white_list(&self) -> bool {
        self.is_transient()
            || matches!(
                *self,
                Self::STATE_NOT_MATCH
                    | Self::SERVER_IS_STOPPING
                    | Self::SCHEMA_EAGAIN
                    | Self::TRANS_KILLED
            )
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}({})", name, self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

/// An error encountered while driving a redefinition task.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RedefinitionError {
    #[error("task is not initialized")]
    NotInit,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("table {0} does not exist")]
    TableNotExist(TableId),
    #[error("entry not found: {0}")]
    EntryNotFound(String),
    #[error("entry already exists: {0}")]
    EntryExist(String),
    #[error("table {table} is locked by a conflicting transaction")]
    LockConflict { table: TableId },
    #[error("no lock is held on table {table}")]
    LockNotExist { table: TableId },
    #[error("snapshot at version {version} was discarded")]
    SnapshotDiscarded { version: SnapshotVersion },
    #[error("{op} timed out")]
    Timeout { op: String },
    #[error(
        "column {column} checksum mismatch: source {source_checksum}, target {target_checksum}"
    )]
    ChecksumMismatch {
        column: ColumnId,
        source_checksum: i64,
        target_checksum: i64,
    },
    #[error("child job {key} already finished with {previous}, now reported {reported}")]
    DuplicateCompletion {
        key: String,
        previous: ErrorCode,
        reported: ErrorCode,
    },
    #[error("child job {key} failed with {code}")]
    ChildJobFailed { key: String, code: ErrorCode },
    #[error("state not match: {0}")]
    StateNotMatch(String),
    #[error("remote call failed with {code}: {message}")]
    Remote { code: ErrorCode, message: String },
    #[error("internal error: {0}")]
    Internal(String),
}

impl RedefinitionError {
    /// Reconstructs an error from a code reported by a child job or a remote
    /// service.
    pub fn from_code(code: ErrorCode, message: impl Into<String>) -> Self {
        RedefinitionError::Remote {
            code,
            message: message.into(),
        }
    }

    /// The result code recorded for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            RedefinitionError::NotInit => ErrorCode::NOT_INIT,
            RedefinitionError::InvalidArgument(_) => ErrorCode::INVALID_ARGUMENT,
            RedefinitionError::TableNotExist(_) => ErrorCode::TABLE_NOT_EXIST,
            RedefinitionError::EntryNotFound(_) => ErrorCode::ENTRY_NOT_EXIST,
            RedefinitionError::EntryExist(_) => ErrorCode::ENTRY_EXIST,
            RedefinitionError::LockConflict { .. } => ErrorCode::TRY_LOCK_ROW_CONFLICT,
            RedefinitionError::LockNotExist { .. } => ErrorCode::OBJ_LOCK_NOT_EXIST,
            RedefinitionError::SnapshotDiscarded { .. } => ErrorCode::SNAPSHOT_DISCARDED,
            RedefinitionError::Timeout { .. } => ErrorCode::TIMEOUT,
            RedefinitionError::ChecksumMismatch { .. } => ErrorCode::CHECKSUM_ERROR,
            RedefinitionError::DuplicateCompletion { .. } => ErrorCode::ERR_UNEXPECTED,
            RedefinitionError::ChildJobFailed { code, .. } => *code,
            RedefinitionError::StateNotMatch(_) => ErrorCode::STATE_NOT_MATCH,
            RedefinitionError::Remote { code, .. } => *code,
            RedefinitionError::Internal(_) => ErrorCode::ERR_UNEXPECTED,
        }
    }

    pub fn is_table_lock_retry(&self) -> bool {
        self.code().is_table_lock_retry()
    }

    pub fn is_transient(&self) -> bool {
        self.code().is_transient()
    }

    /// Whether the task should stay in its current phase and try again. The
    /// code reported by a failed child job is always final.
    pub fn in_retry_white_list(&self) -> bool {
        !matches!(self, RedefinitionError::ChildJobFailed { .. })
            && self.code().in_retry_white_list()
    }

    /// Whether this error means the object was already gone, which cleanup
    /// treats as having nothing left to do.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::TABLE_NOT_EXIST | ErrorCode::OBJ_LOCK_NOT_EXIST | ErrorCode::ENTRY_NOT_EXIST
        )
    }
}
