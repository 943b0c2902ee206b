// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prometheus metrics for redefinition tasks.

use std::future::Future;
use std::time::Instant;

use prometheus::core::Collector;
use prometheus::{
    Counter, CounterVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};

use crate::error::RedefinitionError;

fn register<M: Collector + Clone + 'static>(
    registry: &Registry,
    metric: M,
) -> Result<M, prometheus::Error> {
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

#[derive(Debug, Clone)]
struct MetricsVecs {
    transitions: IntCounterVec,
    retries: IntCounterVec,
    failures: IntCounterVec,
    checksum_mismatches: IntCounter,
    sequence_rpcs: IntCounterVec,
    phase_seconds: HistogramVec,

    external_op_started: IntCounterVec,
    external_op_succeeded: IntCounterVec,
    external_op_failed: IntCounterVec,
    external_op_seconds: CounterVec,
}

impl MetricsVecs {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(MetricsVecs {
            transitions: register(
                registry,
                IntCounterVec::new(
                    Opts::new(
                        "mz_redefinition_transitions_count",
                        "count of redefinition tasks entering a status",
                    ),
                    &["status"],
                )?,
            )?,
            retries: register(
                registry,
                IntCounterVec::new(
                    Opts::new(
                        "mz_redefinition_retries_count",
                        "count of retryable phase failures",
                    ),
                    &["status"],
                )?,
            )?,
            failures: register(
                registry,
                IntCounterVec::new(
                    Opts::new(
                        "mz_redefinition_failures_count",
                        "count of redefinition tasks failed, by result code",
                    ),
                    &["code"],
                )?,
            )?,
            checksum_mismatches: register(
                registry,
                IntCounter::new(
                    "mz_redefinition_checksum_mismatch_count",
                    "count of shadow tables failing column checksum validation",
                )?,
            )?,
            sequence_rpcs: register(
                registry,
                IntCounterVec::new(
                    Opts::new(
                        "mz_redefinition_sequence_rpc_count",
                        "count of batched tablet auto-increment RPCs",
                    ),
                    &["phase", "result"],
                )?,
            )?,
            phase_seconds: register(
                registry,
                HistogramVec::new(
                    HistogramOpts::new(
                        "mz_redefinition_phase_seconds",
                        "time spent in a single invocation of a phase",
                    )
                    .buckets(prometheus::exponential_buckets(0.001, 4.0, 10)?),
                    &["status"],
                )?,
            )?,

            external_op_started: register(
                registry,
                IntCounterVec::new(
                    Opts::new(
                        "mz_redefinition_external_started_count",
                        "count of external service calls started",
                    ),
                    &["op"],
                )?,
            )?,
            external_op_succeeded: register(
                registry,
                IntCounterVec::new(
                    Opts::new(
                        "mz_redefinition_external_succeeded_count",
                        "count of external service calls succeeded",
                    ),
                    &["op"],
                )?,
            )?,
            external_op_failed: register(
                registry,
                IntCounterVec::new(
                    Opts::new(
                        "mz_redefinition_external_failed_count",
                        "count of external service calls failed",
                    ),
                    &["op"],
                )?,
            )?,
            external_op_seconds: register(
                registry,
                CounterVec::new(
                    Opts::new(
                        "mz_redefinition_external_seconds",
                        "time spent in external service calls",
                    ),
                    &["op"],
                )?,
            )?,
        })
    }

    fn external_op_metrics(&self, op: &str) -> ExternalOpMetrics {
        ExternalOpMetrics {
            started: self.external_op_started.with_label_values(&[op]),
            succeeded: self.external_op_succeeded.with_label_values(&[op]),
            failed: self.external_op_failed.with_label_values(&[op]),
            seconds: self.external_op_seconds.with_label_values(&[op]),
        }
    }
}

/// Metrics of one kind of call into an external service.
#[derive(Debug, Clone)]
pub struct ExternalOpMetrics {
    started: IntCounter,
    succeeded: IntCounter,
    failed: IntCounter,
    seconds: Counter,
}

impl ExternalOpMetrics {
    pub async fn run_op<R, F, OpFn>(&self, op_fn: OpFn) -> Result<R, RedefinitionError>
    where
        F: Future<Output = Result<R, RedefinitionError>>,
        OpFn: FnOnce() -> F,
    {
        self.started.inc();
        let start = Instant::now();
        let res = op_fn().await;
        self.seconds.inc_by(start.elapsed().as_secs_f64());
        match res.as_ref() {
            Ok(_) => self.succeeded.inc(),
            Err(_) => self.failed.inc(),
        };
        res
    }
}

/// Metrics of the sequence migration RPCs.
#[derive(Debug, Clone)]
pub struct SequenceRpcMetrics {
    pub get_ok: IntCounter,
    pub get_failed: IntCounter,
    pub set_ok: IntCounter,
    pub set_failed: IntCounter,
}

/// All metrics of redefinition tasks.
#[derive(Debug, Clone)]
pub struct RedefinitionMetrics {
    vecs: MetricsVecs,

    pub checksum_mismatches: IntCounter,
    pub sequence_rpcs: SequenceRpcMetrics,

    pub lock_table: ExternalOpMetrics,
    pub snapshot: ExternalOpMetrics,
    pub submit_job: ExternalOpMetrics,
    pub sql: ExternalOpMetrics,
    pub ddl_rpc: ExternalOpMetrics,
    pub autoinc_sync: ExternalOpMetrics,
}

impl RedefinitionMetrics {
    /// Registers all metrics into `registry`.
    pub fn register_into(registry: &Registry) -> Result<Self, prometheus::Error> {
        let vecs = MetricsVecs::new(registry)?;
        Ok(RedefinitionMetrics {
            checksum_mismatches: vecs.checksum_mismatches.clone(),
            sequence_rpcs: SequenceRpcMetrics {
                get_ok: vecs.sequence_rpcs.with_label_values(&["get", "ok"]),
                get_failed: vecs.sequence_rpcs.with_label_values(&["get", "failed"]),
                set_ok: vecs.sequence_rpcs.with_label_values(&["set", "ok"]),
                set_failed: vecs.sequence_rpcs.with_label_values(&["set", "failed"]),
            },
            lock_table: vecs.external_op_metrics("lock_table"),
            snapshot: vecs.external_op_metrics("snapshot"),
            submit_job: vecs.external_op_metrics("submit_job"),
            sql: vecs.external_op_metrics("sql"),
            ddl_rpc: vecs.external_op_metrics("ddl_rpc"),
            autoinc_sync: vecs.external_op_metrics("autoinc_sync"),
            vecs,
        })
    }

    pub fn transition(&self, status: &str) {
        self.vecs.transitions.with_label_values(&[status]).inc();
    }

    pub fn retry(&self, status: &str) {
        self.vecs.retries.with_label_values(&[status]).inc();
    }

    pub fn failure(&self, code: &str) {
        self.vecs.failures.with_label_values(&[code]).inc();
    }

    pub fn observe_phase(&self, status: &str, seconds: f64) {
        self.vecs
            .phase_seconds
            .with_label_values(&[status])
            .observe(seconds);
    }

    pub fn transitions(&self, status: &str) -> u64 {
        self.vecs.transitions.with_label_values(&[status]).get()
    }

    pub fn retries(&self, status: &str) -> u64 {
        self.vecs.retries.with_label_values(&[status]).get()
    }
}
