// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Identifiers and deadlines.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::RedefinitionError;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(TenantId(u64));
id_type!(
    /// A DDL task. Child jobs are tasks as well.
    TaskId(i64)
);
id_type!(TableId(u64));
id_type!(
    /// A shard of a table's data.
    TabletId(u64)
);
id_type!(
    /// The replication unit owning a set of tablets. Each log stream has a
    /// single leader at a time.
    LogStreamId(i64)
);
id_type!(ColumnId(u64));
id_type!(ConstraintId(u64));
id_type!(ForeignKeyId(u64));
id_type!(PartitionId(i64));
id_type!(SchemaVersion(i64));
id_type!(
    /// A logical timestamp fixing a consistent read view across tablets.
    SnapshotVersion(i64)
);

impl ColumnId {
    /// The hidden auto-increment primary key of tables without a declared one.
    pub const HIDDEN_PK: ColumnId = ColumnId(1);
    /// Columns below this id are internal and hidden from users.
    pub const APP_MIN: ColumnId = ColumnId(16);
}

impl SnapshotVersion {
    /// Not yet obtained.
    pub const INVALID: SnapshotVersion = SnapshotVersion(0);

    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

/// The network address of a node.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddr(pub String);

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The point in time by which a remote call must have completed.
///
/// Every remote call takes its deadline explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Deadline(Instant::now() + timeout)
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn is_elapsed(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// Runs `fut`, turning an elapsed `deadline` into a retryable
/// [`RedefinitionError::Timeout`].
pub async fn with_deadline<T, F>(
    op: &str,
    deadline: Deadline,
    fut: F,
) -> Result<T, RedefinitionError>
where
    F: Future<Output = Result<T, RedefinitionError>>,
{
    match tokio::time::timeout_at(deadline.instant(), fut).await {
        Ok(res) => res,
        Err(_elapsed) => Err(RedefinitionError::Timeout { op: op.to_owned() }),
    }
}
