//! Prometheus metrics for the PD operator and discovery service
//!
//! # Exported metrics
//! - `pd_operator_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `pd_operator_reconcile_total` (counter): reconcile outcomes labeled by controller and result.
//! - `pd_operator_discover_total` (counter): bootstrap discovery answers labeled by outcome.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "managedcluster"
    pub controller: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileResultLabels {
    pub controller: String,
    /// "ok", "requeue", or an error kind such as "kube"
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DiscoverLabels {
    /// "initial_cluster", "join", or an error kind
    pub outcome: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_TOTAL: Lazy<Family<ReconcileResultLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static DISCOVER_TOTAL: Lazy<Family<DiscoverLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "pd_operator_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "pd_operator_reconcile",
        "Reconcile outcomes",
        RECONCILE_TOTAL.clone(),
    );
    registry.register(
        "pd_operator_discover",
        "Bootstrap discovery answers",
        DISCOVER_TOTAL.clone(),
    );

    registry
});

pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

pub fn inc_reconcile(controller: &str, result: &str) {
    let labels = ReconcileResultLabels {
        controller: controller.to_string(),
        result: result.to_string(),
    };
    RECONCILE_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_discover(outcome: &str) {
    let labels = DiscoverLabels {
        outcome: outcome.to_string(),
    };
    DISCOVER_TOTAL.get_or_create(&labels).inc();
}

/// Text exposition of every registered metric
pub fn encode() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}
