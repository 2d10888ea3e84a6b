//! Prometheus metrics for the deploy engine
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `showcase_reconcile_duration_seconds` (histogram): synchronization duration labeled by operation.
//! - `showcase_resources_applied_total` (counter): resources created or updated, labeled by kind.
//! - `showcase_resources_pruned_total` (counter): stale resources deleted, labeled by kind.
//! - `showcase_resource_errors_total` (counter): per-resource failures labeled by kind and operation.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for synchronization duration
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Backend operation, e.g. "synchronize", "synchronize_shared"
    pub operation: String,
}

/// Labels for per-kind resource counters
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResourceLabels {
    /// Resource kind, e.g. "StatefulSet", "Container"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResourceErrorLabels {
    pub kind: String,
    /// "apply" or "prune"
    pub operation: String,
}

/// Histogram tracking synchronization duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> =
    Lazy::new(|| {
        fn reconcile_histogram() -> Histogram {
            // 1ms .. ~32s across 16 buckets.
            Histogram::new(exponential_buckets(0.001, 2.0, 16))
        }

        Family::new_with_constructor(reconcile_histogram)
    });

pub static RESOURCES_APPLIED_TOTAL: Lazy<Family<ResourceLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static RESOURCES_PRUNED_TOTAL: Lazy<Family<ResourceLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static RESOURCE_ERRORS_TOTAL: Lazy<Family<ResourceErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "showcase_reconcile_duration_seconds",
        "Duration of synchronization passes in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    // counters get the `_total` suffix on encoding
    registry.register(
        "showcase_resources_applied",
        "Resources created or updated",
        RESOURCES_APPLIED_TOTAL.clone(),
    );
    registry.register(
        "showcase_resources_pruned",
        "Stale resources deleted",
        RESOURCES_PRUNED_TOTAL.clone(),
    );
    registry.register(
        "showcase_resource_errors",
        "Resources that failed to apply or prune",
        RESOURCE_ERRORS_TOTAL.clone(),
    );

    registry
});

pub fn observe_reconcile_duration_seconds(operation: &str, secs: f64) {
    RECONCILE_DURATION_SECONDS
        .get_or_create(&ReconcileLabels {
            operation: operation.to_string(),
        })
        .observe(secs);
}

pub fn inc_resource_applied(kind: &str) {
    RESOURCES_APPLIED_TOTAL
        .get_or_create(&ResourceLabels {
            kind: kind.to_string(),
        })
        .inc();
}

pub fn inc_resource_pruned(kind: &str) {
    RESOURCES_PRUNED_TOTAL
        .get_or_create(&ResourceLabels {
            kind: kind.to_string(),
        })
        .inc();
}

pub fn inc_resource_error(kind: &str, operation: &str) {
    RESOURCE_ERRORS_TOTAL
        .get_or_create(&ResourceErrorLabels {
            kind: kind.to_string(),
            operation: operation.to_string(),
        })
        .inc();
}

/// Render the registry in the Prometheus text format
pub fn encode_text() -> String {
    let mut buffer = String::new();
    if let Err(e) = prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    buffer
}
