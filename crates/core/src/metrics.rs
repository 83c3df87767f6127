//! Prometheus metrics for the pin tracker.
//!
//! This module provides metrics for:
//! - Admission (accepted and rejected intents)
//! - Workers (in-flight operations, outcomes)
//! - Daemon connector call latency

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts};

// =============================================================================
// Admission Metrics
// =============================================================================

/// Intents admitted to a queue, by operation.
pub static INTENTS_QUEUED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "pintracker_intents_queued_total",
            "Total pin/unpin intents admitted to a queue",
        ),
        &["operation"],
    )
    .unwrap()
});

/// Intents rejected because a queue was full or closed.
pub static QUEUE_REJECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "pintracker_queue_rejections_total",
            "Total intents rejected by admission control",
        ),
        &["operation"],
    )
    .unwrap()
});

/// Entries re-admitted by recovery.
pub static RECOVERIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "pintracker_recoveries_total",
            "Total errored entries re-queued by recovery",
        ),
        &["operation"],
    )
    .unwrap()
});

// =============================================================================
// Worker Metrics
// =============================================================================

/// Connector calls currently running.
pub static OPERATIONS_IN_FLIGHT: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "pintracker_operations_in_flight",
            "Daemon operations currently executing",
        ),
        &["operation"],
    )
    .unwrap()
});

/// Finished operations by result.
pub static OPERATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "pintracker_operations_total",
            "Total daemon operations executed",
        ),
        &["operation", "result"], // result: "success", "error", "timeout"
    )
    .unwrap()
});

/// Connector call duration in seconds.
pub static OPERATION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "pintracker_operation_duration_seconds",
            "Duration of daemon pin/unpin calls",
        )
        .buckets(vec![
            0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1800.0, 3600.0,
        ]),
        &["operation"],
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Get all tracker metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        Box::new(INTENTS_QUEUED.clone()),
        Box::new(QUEUE_REJECTIONS.clone()),
        Box::new(RECOVERIES.clone()),
        Box::new(OPERATIONS_IN_FLIGHT.clone()),
        Box::new(OPERATIONS_TOTAL.clone()),
        Box::new(OPERATION_DURATION.clone()),
    ]
}
