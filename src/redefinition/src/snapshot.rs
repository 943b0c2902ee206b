// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Snapshots pinned across every tablet a redefinition reads or writes.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::RedefinitionError;
use crate::ids::{Deadline, SchemaVersion, SnapshotVersion, TableId, TabletId, TenantId};
use crate::service::{Catalog, SnapshotService};

/// The tablets of a source table, its shadow table and the auxiliary LOB
/// tables of both, at a version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotSet {
    pub version: SnapshotVersion,
    pub tablets: Vec<TabletId>,
}

#[derive(Debug, Clone)]
pub struct SnapshotCoordinator {
    catalog: Arc<dyn Catalog>,
    snapshots: Arc<dyn SnapshotService>,
}

impl SnapshotCoordinator {
    pub fn new(catalog: Arc<dyn Catalog>, snapshots: Arc<dyn SnapshotService>) -> Self {
        SnapshotCoordinator { catalog, snapshots }
    }

    /// Collects the tablets of `source`, `target` and their LOB tables.
    pub async fn snapshot_set(
        &self,
        tenant: TenantId,
        source: TableId,
        target: TableId,
        version: SnapshotVersion,
    ) -> Result<SnapshotSet, RedefinitionError> {
        self.collect(tenant, source, target, version, false).await
    }

    /// Like [`Self::snapshot_set`], leaving out the tablets of tables that
    /// were dropped meanwhile.
    pub async fn remaining_set(
        &self,
        tenant: TenantId,
        source: TableId,
        target: TableId,
        version: SnapshotVersion,
    ) -> Result<SnapshotSet, RedefinitionError> {
        self.collect(tenant, source, target, version, true).await
    }

    async fn collect(
        &self,
        tenant: TenantId,
        source: TableId,
        target: TableId,
        version: SnapshotVersion,
        skip_dropped: bool,
    ) -> Result<SnapshotSet, RedefinitionError> {
        let mut tables = Vec::new();
        let mut lob_tables = Vec::new();
        for table in [source, target] {
            match self.catalog.get_table_schema(tenant, table).await? {
                Some(schema) => {
                    tables.push(table);
                    lob_tables.extend(schema.aux_lob_tables());
                }
                None if skip_dropped => debug!(%table, "table dropped, skipping its tablets"),
                None => return Err(RedefinitionError::TableNotExist(table)),
            }
        }

        let mut tablets = Vec::new();
        for table in tables.into_iter().chain(lob_tables) {
            match self.catalog.get_tablets(tenant, table).await {
                Ok(ids) => tablets.extend(ids),
                Err(err) if skip_dropped && err.is_not_found() => {
                    debug!(%table, "table dropped, skipping its tablets");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(SnapshotSet { version, tablets })
    }

    /// Pins `version` on every tablet of both tables. Idempotent if the
    /// snapshot is already held at the same version.
    pub async fn acquire(
        &self,
        tenant: TenantId,
        source: TableId,
        target: TableId,
        schema_version: SchemaVersion,
        version: SnapshotVersion,
        deadline: Deadline,
    ) -> Result<SnapshotSet, RedefinitionError> {
        let set = self.snapshot_set(tenant, source, target, version).await?;
        let res = self
            .snapshots
            .acquire(tenant, schema_version, version, &set.tablets, deadline)
            .await;
        info!(
            %source, %target, %version, tablets = set.tablets.len(), ok = res.is_ok(),
            "hold snapshot finished"
        );
        res.map(|()| set)
    }

    /// Unpins `version` from every tablet of both tables that still exists.
    /// Tablets of a dropped table went away with their snapshots.
    pub async fn release(
        &self,
        tenant: TenantId,
        source: TableId,
        target: TableId,
        version: SnapshotVersion,
        deadline: Deadline,
    ) -> Result<(), RedefinitionError> {
        let set = self.remaining_set(tenant, source, target, version).await?;
        let res = self
            .snapshots
            .release(tenant, version, &set.tablets, deadline)
            .await;
        info!(
            %source, %target, %version, tablets = set.tablets.len(), ok = res.is_ok(),
            "release snapshot finished"
        );
        res
    }
}
