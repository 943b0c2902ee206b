// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Online table redefinition.
//!
//! A [`RedefinitionTask`](task::RedefinitionTask) changes the schema of a live
//! table by building a hidden shadow table with the new schema, copying the
//! data into it at a fixed snapshot, validating the copy with per-column
//! checksums, and finally swapping the two tables' metadata.
//!
//! The task is a crash-recoverable state machine. An external driver calls
//! [`RedefinitionTask::advance`](task::RedefinitionTask::advance) repeatedly;
//! every call does at most one non-blocking step. Remote work (the shadow data
//! build, the emptiness check, constraint validation, ...) is dispatched once
//! and its completion is observed on a later call, after the job reported back
//! through a [`ChildTaskNotifier`](depend::ChildTaskNotifier).
//!
//! Everything the task talks to is injected through
//! [`Services`](service::Services): the catalog, the lock and snapshot
//! services, the leader-routed tablet RPCs and the durable task record store.

pub mod barrier;
pub mod build;
pub mod checksum;
pub mod config;
pub mod depend;
pub mod dyncfg;
pub mod error;
pub mod ids;
pub mod kind;
pub mod metrics;
pub mod record;
pub mod schema;
pub mod service;
pub mod snapshot;
pub mod stats;
pub mod tablet_seq;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::error::{ErrorCode, RedefinitionError};
pub use crate::task::{RedefinitionTask, TaskStatus};
