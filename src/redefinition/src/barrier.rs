// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Waiting for transactions that may observe a table's old schema.

use std::sync::Arc;

use tracing::debug;

use crate::error::RedefinitionError;
use crate::ids::{SchemaVersion, SnapshotVersion, TableId, TenantId};
use crate::service::TransactionBarrier;

/// A poll context over a [`TransactionBarrier`].
///
/// Once the barrier reported a version, later polls return it without asking
/// again, until the context is reset.
#[derive(Debug)]
pub struct WaitTransEnd {
    barrier: Arc<dyn TransactionBarrier>,
    tenant: TenantId,
    table: TableId,
    schema_version: SchemaVersion,
    polls: u64,
    version: Option<SnapshotVersion>,
}

impl WaitTransEnd {
    pub fn new(
        barrier: Arc<dyn TransactionBarrier>,
        tenant: TenantId,
        table: TableId,
        schema_version: SchemaVersion,
    ) -> Self {
        WaitTransEnd {
            barrier,
            tenant,
            table,
            schema_version,
            polls: 0,
            version: None,
        }
    }

    /// Polls the barrier once. Returns `None` while transactions that
    /// started under an older schema may still be running.
    pub async fn try_wait(&mut self) -> Result<Option<SnapshotVersion>, RedefinitionError> {
        if let Some(version) = self.version {
            return Ok(Some(version));
        }
        self.polls += 1;
        let version = self
            .barrier
            .try_wait(self.tenant, self.table, self.schema_version)
            .await?;
        match version {
            Some(version) if !version.is_valid() => Err(RedefinitionError::Internal(format!(
                "transaction barrier of table {} returned invalid snapshot version {}",
                self.table, version
            ))),
            Some(version) => {
                debug!(table = %self.table, %version, polls = self.polls, "transactions ended");
                self.version = Some(version);
                Ok(Some(version))
            }
            None => Ok(None),
        }
    }

    pub fn polls(&self) -> u64 {
        self.polls
    }
}
