// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tracking of child jobs dispatched by a redefinition task.
//!
//! A task dispatches a child job, registers it here under a
//! [`DependTaskKey`], and polls the key on later invocations. The child
//! reports its completion from whichever thread it finishes on, through a
//! [`ChildTaskNotifier`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{ErrorCode, RedefinitionError};
use crate::ids::{SchemaVersion, TaskId};

/// The family a child job belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DependJobKind {
    CheckTableEmpty,
    BuildReplica,
    UpdateAutoinc,
    Constraint,
    ForeignKey,
}

/// Identifies one child job of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DependTaskKey {
    pub kind: DependJobKind,
    /// The table, constraint or foreign key the job works on.
    pub object_id: u64,
    pub schema_version: SchemaVersion,
}

impl DependTaskKey {
    pub fn new(kind: DependJobKind, object_id: u64, schema_version: SchemaVersion) -> Self {
        DependTaskKey {
            kind,
            object_id,
            schema_version,
        }
    }
}

impl fmt::Display for DependTaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{}@{}",
            self.kind, self.object_id, self.schema_version
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DependTaskStatus {
    pub child_task_id: Option<TaskId>,
    /// `None` until the child reports.
    pub ret_code: Option<ErrorCode>,
    /// An extra value some children report along with their result.
    pub reported_value: Option<u64>,
}

/// The completion state of every child job of one task.
#[derive(Debug, Default)]
pub struct DependentJobTracker {
    jobs: Mutex<BTreeMap<DependTaskKey, DependTaskStatus>>,
}

impl DependentJobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `key`. Registering a key again only fills in a missing
    /// child task id, it never resets a reported result.
    pub fn register(&self, key: DependTaskKey, child_task_id: Option<TaskId>) {
        let mut jobs = self.jobs.lock().expect("lock poisoned");
        let status = jobs.entry(key).or_default();
        if status.child_task_id.is_none() {
            status.child_task_id = child_task_id;
        }
    }

    pub fn is_registered(&self, key: &DependTaskKey) -> bool {
        self.jobs.lock().expect("lock poisoned").contains_key(key)
    }

    /// The result reported for `key`, or `None` if the child hasn't finished
    /// (or was never registered).
    pub fn poll(&self, key: &DependTaskKey) -> Option<ErrorCode> {
        let jobs = self.jobs.lock().expect("lock poisoned");
        jobs.get(key).and_then(|status| status.ret_code)
    }

    /// Forgets `key`, so that its job can be dispatched again.
    pub fn remove(&self, key: &DependTaskKey) -> Option<DependTaskStatus> {
        self.jobs.lock().expect("lock poisoned").remove(key)
    }

    pub fn status(&self, key: &DependTaskKey) -> Option<DependTaskStatus> {
        self.jobs.lock().expect("lock poisoned").get(key).cloned()
    }

    /// Records the completion of `key`.
    ///
    /// Completion is exactly once per key: a second report with the same code
    /// is accepted and ignored, a second report with a different code is
    /// rejected.
    pub fn complete(&self, key: DependTaskKey, ret_code: ErrorCode) -> Result<(), RedefinitionError> {
        self.complete_inner(key, ret_code, None)
    }

    /// Like [`Self::complete`], additionally recording a value reported by
    /// the child.
    pub fn complete_with_value(
        &self,
        key: DependTaskKey,
        ret_code: ErrorCode,
        value: u64,
    ) -> Result<(), RedefinitionError> {
        self.complete_inner(key, ret_code, Some(value))
    }

    fn complete_inner(
        &self,
        key: DependTaskKey,
        ret_code: ErrorCode,
        value: Option<u64>,
    ) -> Result<(), RedefinitionError> {
        let mut jobs = self.jobs.lock().expect("lock poisoned");
        let Some(status) = jobs.get_mut(&key) else {
            return Err(RedefinitionError::EntryNotFound(key.to_string()));
        };
        match status.ret_code {
            None => {
                status.ret_code = Some(ret_code);
                if value.is_some() {
                    status.reported_value = value;
                }
                Ok(())
            }
            Some(previous) if previous == ret_code => {
                debug!(%key, %ret_code, "ignoring duplicate child job completion");
                Ok(())
            }
            Some(previous) => {
                error!(%key, %previous, reported = %ret_code, "conflicting child job completion");
                Err(RedefinitionError::DuplicateCompletion {
                    key: key.to_string(),
                    previous,
                    reported: ret_code,
                })
            }
        }
    }

    /// Whether every registered job of `kind` has reported. Vacuously true if
    /// none is registered.
    pub fn all_finished(&self, kind: DependJobKind) -> bool {
        let jobs = self.jobs.lock().expect("lock poisoned");
        jobs.iter()
            .filter(|(key, _)| key.kind == kind)
            .all(|(_, status)| status.ret_code.is_some())
    }

    /// The first registered job of `kind` that reported a failure.
    pub fn first_failure(&self, kind: DependJobKind) -> Option<(DependTaskKey, ErrorCode)> {
        let jobs = self.jobs.lock().expect("lock poisoned");
        jobs.iter()
            .filter(|(key, _)| key.kind == kind)
            .find_map(|(key, status)| match status.ret_code {
                Some(code) if !code.is_success() => Some((*key, code)),
                _ => None,
            })
    }

    pub fn count(&self, kind: DependJobKind) -> usize {
        let jobs = self.jobs.lock().expect("lock poisoned");
        jobs.keys().filter(|key| key.kind == kind).count()
    }

    /// Runs `f` while holding the tracker's lock, so that no completion is
    /// recorded concurrently.
    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _jobs = self.jobs.lock().expect("lock poisoned");
        f()
    }
}

/// A handle through which child jobs report their completion to the task that
/// dispatched them. Cheap to clone and usable from any thread.
#[derive(Clone, Debug)]
pub struct ChildTaskNotifier {
    task_id: TaskId,
    tracker: Arc<DependentJobTracker>,
}

impl ChildTaskNotifier {
    pub fn new(task_id: TaskId, tracker: Arc<DependentJobTracker>) -> Self {
        ChildTaskNotifier { task_id, tracker }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn on_child_task_finish(
        &self,
        key: DependTaskKey,
        ret_code: ErrorCode,
    ) -> Result<(), RedefinitionError> {
        debug!(task_id = %self.task_id, %key, %ret_code, "child task finished");
        self.tracker.complete(key, ret_code)
    }

    /// Reports the completion of the job rewriting a column's values with
    /// auto-increment values. `autoinc_val` is the next value the sequence
    /// must hand out.
    pub fn notify_update_autoinc_finish(
        &self,
        key: DependTaskKey,
        ret_code: ErrorCode,
        autoinc_val: u64,
    ) -> Result<(), RedefinitionError> {
        debug!(task_id = %self.task_id, %key, %ret_code, autoinc_val, "autoinc update finished");
        self.tracker.complete_with_value(key, ret_code, autoinc_val)
    }
}
