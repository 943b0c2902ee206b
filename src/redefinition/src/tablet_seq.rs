// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Migration of per-tablet auto-increment cursors.
//!
//! Every tablet caches the position of its auto-increment sequence. Before
//! the shadow table takes over, each source tablet's cursor is read and
//! written to the shadow tablet at the same position, so that no value is
//! handed out twice.
//!
//! The cursors live on the leader of the log stream owning each tablet.
//! Tablets are batched by log stream and each batch is sent to the current
//! leader. Leadership may move between rounds, so tablets are regrouped on
//! every round. A failed batch requeues all of its tablets, a failed tablet
//! within a successful batch requeues only that tablet.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, RedefinitionError};
use crate::ids::{Deadline, LogStreamId, NodeAddr, TableId, TabletId, TenantId, with_deadline};
use crate::metrics::SequenceRpcMetrics;
use crate::service::{LocationService, Services, TabletAutoincRpc};

/// The cursor migration state of one source tablet and its shadow tablet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletSequenceState {
    pub source_tablet: TabletId,
    pub dest_tablet: TabletId,
    pub cached_sequence_value: u64,
    pub ret_code: ErrorCode,
}

impl TabletSequenceState {
    pub fn new(source_tablet: TabletId, dest_tablet: TabletId) -> Self {
        TabletSequenceState {
            source_tablet,
            dest_tablet,
            cached_sequence_value: 0,
            ret_code: ErrorCode::SUCCESS,
        }
    }
}

/// The tablets of one log stream, sent to its leader in one RPC.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletAutoincBatch {
    pub tenant: TenantId,
    pub log_stream: LogStreamId,
    pub params: Vec<TabletSequenceState>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// Reading cursors from source tablets.
    Fetch,
    /// Writing cursors to destination tablets.
    Apply,
}

impl Phase {
    fn routing_tablet(&self, state: &TabletSequenceState) -> TabletId {
        match self {
            Phase::Fetch => state.source_tablet,
            Phase::Apply => state.dest_tablet,
        }
    }
}

#[derive(Debug)]
pub struct TabletSequenceMigrator {
    tenant: TenantId,
    location: Arc<dyn LocationService>,
    rpc: Arc<dyn TabletAutoincRpc>,
    rpc_timeout: Duration,
    metrics: SequenceRpcMetrics,

    orig_source_count: usize,
    /// Tablets whose cursor still has to be read.
    pending_fetch: Vec<TabletSequenceState>,
    /// Tablets whose cursor was read but not yet written.
    pending_apply: Vec<TabletSequenceState>,
    fetched: usize,
    applied: usize,
    /// Whether the last round saw a transient failure, in which case the
    /// next round bypasses the location caches.
    force_renew: bool,
    synced: bool,
}

impl TabletSequenceMigrator {
    /// Pairs the tablets of `source` with the tablets of `target`, in
    /// partition order.
    pub async fn init(
        services: &Services,
        tenant: TenantId,
        source: TableId,
        target: TableId,
        rpc_timeout: Duration,
        metrics: SequenceRpcMetrics,
    ) -> Result<Self, RedefinitionError> {
        let source_tablets = services.catalog.get_tablets(tenant, source).await?;
        let dest_tablets = services.catalog.get_tablets(tenant, target).await?;
        if source_tablets.len() != dest_tablets.len() {
            return Err(RedefinitionError::Internal(format!(
                "table {} has {} tablets but table {} has {}",
                source,
                source_tablets.len(),
                target,
                dest_tablets.len()
            )));
        }
        let pending_fetch = source_tablets
            .into_iter()
            .zip(dest_tablets)
            .map(|(src, dst)| TabletSequenceState::new(src, dst))
            .collect::<Vec<_>>();
        Ok(TabletSequenceMigrator {
            tenant,
            location: Arc::clone(&services.location),
            rpc: Arc::clone(&services.tablet_rpc),
            rpc_timeout,
            metrics,
            orig_source_count: pending_fetch.len(),
            pending_fetch,
            pending_apply: Vec::new(),
            fetched: 0,
            applied: 0,
            force_renew: false,
            synced: false,
        })
    }

    pub fn fetched(&self) -> usize {
        self.fetched
    }

    pub fn applied(&self) -> usize {
        self.applied
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Runs rounds until every cursor is migrated.
    ///
    /// Returns the error of the first round that failed for any tablet. The
    /// failed tablets stay queued, and calling `sync` again resumes with
    /// them.
    pub async fn sync(&mut self) -> Result<(), RedefinitionError> {
        if self.synced {
            return Ok(());
        }
        while !self.pending_fetch.is_empty() {
            self.round(Phase::Fetch).await?;
        }
        if self.fetched != self.orig_source_count {
            return Err(RedefinitionError::Internal(format!(
                "fetched {} tablet sequences, expected {}",
                self.fetched, self.orig_source_count
            )));
        }
        while !self.pending_apply.is_empty() {
            self.round(Phase::Apply).await?;
        }
        if self.applied != self.fetched {
            return Err(RedefinitionError::Internal(format!(
                "applied {} tablet sequences, fetched {}",
                self.applied, self.fetched
            )));
        }
        info!(tenant = %self.tenant, tablets = self.applied, "tablet sequences migrated");
        self.synced = true;
        Ok(())
    }

    /// Groups the pending tablets of `phase` by the leader of their log
    /// stream.
    async fn route(
        &self,
        pending: &[TabletSequenceState],
        phase: Phase,
    ) -> Result<Vec<(NodeAddr, TabletAutoincBatch)>, RedefinitionError> {
        let mut by_log_stream: BTreeMap<LogStreamId, Vec<TabletSequenceState>> = BTreeMap::new();
        for state in pending {
            let log_stream = self
                .location
                .log_stream_of(self.tenant, phase.routing_tablet(state), self.force_renew)
                .await?;
            by_log_stream
                .entry(log_stream)
                .or_default()
                .push(state.clone());
        }
        let mut batches = Vec::with_capacity(by_log_stream.len());
        for (log_stream, params) in by_log_stream {
            let leader = self
                .location
                .leader_of(self.tenant, log_stream, self.force_renew)
                .await?;
            batches.push((
                leader,
                TabletAutoincBatch {
                    tenant: self.tenant,
                    log_stream,
                    params,
                },
            ));
        }
        Ok(batches)
    }

    async fn round(&mut self, phase: Phase) -> Result<(), RedefinitionError> {
        let pending = match phase {
            Phase::Fetch => &self.pending_fetch,
            Phase::Apply => &self.pending_apply,
        };
        // Nothing is dequeued until every batch has a leader.
        let batches = self.route(pending, phase).await?;

        let deadline = Deadline::after(self.rpc_timeout);
        let calls = batches.iter().map(|(leader, batch)| {
            let rpc = Arc::clone(&self.rpc);
            let batch = batch.clone();
            async move {
                with_deadline("batch tablet autoinc rpc", deadline, async {
                    match phase {
                        Phase::Fetch => rpc.batch_get(leader, deadline, batch).await,
                        Phase::Apply => rpc.batch_set(leader, deadline, batch).await,
                    }
                })
                .await
            }
        });
        let results = join_all(calls).await;

        for ((leader, request), result) in batches.iter().zip(&results) {
            if let Ok(response) = result {
                if response.params.len() != request.params.len() {
                    return Err(RedefinitionError::Internal(format!(
                        "leader {} answered {} of {} tablets of log stream {}",
                        leader,
                        response.params.len(),
                        request.params.len(),
                        request.log_stream
                    )));
                }
            }
        }

        match phase {
            Phase::Fetch => self.pending_fetch.clear(),
            Phase::Apply => self.pending_apply.clear(),
        }
        // The first transient error, unless a terminal error occurs.
        let mut round_error: Option<ErrorCode> = None;
        for ((leader, request), result) in batches.into_iter().zip(results) {
            let params = match result {
                Ok(response) => {
                    self.count_rpc(phase, true);
                    response.params
                }
                Err(err) => {
                    self.count_rpc(phase, false);
                    warn!(
                        %leader, log_stream = %request.log_stream, error = %err,
                        "batch tablet autoinc rpc failed"
                    );
                    let code = err.code();
                    request
                        .params
                        .into_iter()
                        .map(|state| TabletSequenceState {
                            ret_code: code,
                            ..state
                        })
                        .collect()
                }
            };
            for state in params {
                let code = state.ret_code;
                if code.is_success() {
                    match phase {
                        Phase::Fetch => {
                            self.fetched += 1;
                            self.pending_apply.push(state);
                        }
                        Phase::Apply => self.applied += 1,
                    }
                    continue;
                }
                debug!(
                    source_tablet = %state.source_tablet, dest_tablet = %state.dest_tablet, %code,
                    "requeueing tablet"
                );
                let requeued = TabletSequenceState {
                    ret_code: ErrorCode::SUCCESS,
                    ..state
                };
                match phase {
                    Phase::Fetch => self.pending_fetch.push(requeued),
                    Phase::Apply => self.pending_apply.push(requeued),
                }
                if !code.is_transient() || round_error.is_none() {
                    round_error = Some(code);
                }
            }
        }

        self.force_renew = round_error.is_some_and(|code| code.is_transient());
        match round_error {
            None => Ok(()),
            Some(code) => Err(RedefinitionError::from_code(
                code,
                format!("{phase:?} of tablet sequences incomplete"),
            )),
        }
    }

    fn count_rpc(&self, phase: Phase, ok: bool) {
        let counter = match (phase, ok) {
            (Phase::Fetch, true) => &self.metrics.get_ok,
            (Phase::Fetch, false) => &self.metrics.get_failed,
            (Phase::Apply, true) => &self.metrics.set_ok,
            (Phase::Apply, false) => &self.metrics.set_failed,
        };
        counter.inc();
    }
}
