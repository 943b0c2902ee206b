// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Dyncfgs used by redefinition tasks.

use std::time::Duration;

use crate::dyncfg::{Config, ConfigSet};

/// Default timeout of a single remote call.
pub const REDEFINITION_RPC_TIMEOUT: Config<Duration> = Config::new(
    "redefinition_rpc_timeout",
    Duration::from_secs(2),
    "Default timeout of a single remote call issued by a redefinition task.",
);

/// How many times a phase may fail with a retryable error before the task is
/// failed.
pub const REDEFINITION_MAX_RETRIES: Config<usize> = Config::new(
    "redefinition_max_retries",
    100,
    "Retryable phase failures tolerated before a redefinition task fails.",
);

pub const REDEFINITION_LOCK_CONTENTION_LOG_INTERVAL: Config<Duration> = Config::new(
    "redefinition_lock_contention_log_interval",
    Duration::from_secs(10),
    "Minimum interval between two log lines about table lock contention.",
);

pub const REDEFINITION_STATS_BATCH_SIZE: Config<usize> = Config::new(
    "redefinition_stats_batch_size",
    256,
    "Number of partitions whose statistics are moved by one statement.",
);

/// Lower bound of the workload proportional timeout.
pub const REDEFINITION_TIMEOUT_FLOOR: Config<Duration> = Config::new(
    "redefinition_timeout_floor",
    Duration::from_secs(9),
    "Minimum workload proportional timeout of a redefinition remote call.",
);

/// Upper bound of the workload proportional timeout.
pub const REDEFINITION_TIMEOUT_CEILING: Config<Duration> = Config::new(
    "redefinition_timeout_ceiling",
    Duration::from_secs(3600),
    "Maximum workload proportional timeout of a redefinition remote call.",
);

pub const REDEFINITION_SEQUENCE_RPC_TIMEOUT_FLOOR: Config<Duration> = Config::new(
    "redefinition_sequence_rpc_timeout_floor",
    Duration::from_secs(9),
    "Minimum timeout of a batched tablet auto-increment RPC.",
);

pub const REDEFINITION_AUTOINC_SYNC_TIMEOUT_FLOOR: Config<Duration> = Config::new(
    "redefinition_autoinc_sync_timeout_floor",
    Duration::from_secs(20),
    "Minimum timeout of a global auto-increment cache synchronization.",
);

pub const REDEFINITION_BUILD_TIMEOUT: Config<Duration> = Config::new(
    "redefinition_build_timeout",
    Duration::from_secs(72 * 60 * 60),
    "Timeout of the statement copying source rows into the shadow table.",
);

/// Adds the full set of all redefinition `Config`s.
pub fn all_dyncfgs(configs: ConfigSet) -> ConfigSet {
    configs
        .add(&REDEFINITION_RPC_TIMEOUT)
        .add(&REDEFINITION_MAX_RETRIES)
        .add(&REDEFINITION_LOCK_CONTENTION_LOG_INTERVAL)
        .add(&REDEFINITION_STATS_BATCH_SIZE)
        .add(&REDEFINITION_TIMEOUT_FLOOR)
        .add(&REDEFINITION_TIMEOUT_CEILING)
        .add(&REDEFINITION_SEQUENCE_RPC_TIMEOUT_FLOOR)
        .add(&REDEFINITION_AUTOINC_SYNC_TIMEOUT_FLOOR)
        .add(&REDEFINITION_BUILD_TIMEOUT)
}

/// The timeout for workloads proportional to `tablet_count × column_count`,
/// at 1ms per column of every tablet.
pub fn estimated_timeout(configs: &ConfigSet, tablet_count: usize, column_count: usize) -> Duration {
    let per_column = Duration::from_millis(1);
    let work = u32::try_from(tablet_count.saturating_mul(column_count)).unwrap_or(u32::MAX);
    let estimate = per_column.saturating_mul(work);
    estimate
        .max(REDEFINITION_TIMEOUT_FLOOR.get(configs))
        .min(REDEFINITION_TIMEOUT_CEILING.get(configs))
        .max(REDEFINITION_RPC_TIMEOUT.get(configs))
}

/// The timeout of one round of batched tablet sequence RPCs.
pub fn sequence_rpc_timeout(configs: &ConfigSet) -> Duration {
    REDEFINITION_RPC_TIMEOUT
        .get(configs)
        .max(REDEFINITION_SEQUENCE_RPC_TIMEOUT_FLOOR.get(configs))
}

/// The timeout of a global auto-increment cache synchronization.
pub fn autoinc_sync_timeout(configs: &ConfigSet) -> Duration {
    REDEFINITION_RPC_TIMEOUT
        .get(configs)
        .max(REDEFINITION_AUTOINC_SYNC_TIMEOUT_FLOOR.get(configs))
}
