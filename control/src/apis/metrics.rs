//! Controller metrics
//!
//! Reconcile outcomes, work queue activity and event routing decisions.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    /// Controller metrics registry
    pub static ref CONTROLLER_METRICS_REGISTRY: Registry = Registry::new();

    /// Reconcile duration by result
    static ref RECONCILE_DURATION: HistogramVec = {
        let opts = HistogramOpts::new(
            "ingress_manager_reconcile_duration_seconds",
            "Service reconciliation duration in seconds",
        );
        let histogram = HistogramVec::new(opts, &["result"])
            .expect("Failed to create histogram");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("Failed to register histogram");
        histogram
    };

    /// Reconciliations total by result (created, deleted, noop, error)
    static ref RECONCILIATIONS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "ingress_manager_reconciliations_total",
            "Total number of service reconciliations",
        );
        let counter = IntCounterVec::new(opts, &["result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Keys accepted by the work queue (duplicates excluded)
    static ref WORKQUEUE_ADDS_TOTAL: IntCounter = {
        let counter = IntCounter::new(
            "ingress_manager_workqueue_adds_total",
            "Total number of keys added to the work queue",
        )
        .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Keys waiting to be picked up by a worker
    static ref WORKQUEUE_DEPTH: IntGauge = {
        let gauge = IntGauge::new(
            "ingress_manager_workqueue_depth",
            "Current number of keys waiting in the work queue",
        )
        .expect("Failed to create gauge");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("Failed to register gauge");
        gauge
    };

    /// Rate-limited requeues
    static ref WORKQUEUE_RETRIES_TOTAL: IntCounter = {
        let counter = IntCounter::new(
            "ingress_manager_workqueue_retries_total",
            "Total number of rate-limited requeues",
        )
        .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Keys dropped after exhausting their retries or failing permanently
    static ref WORKQUEUE_DROPPED_TOTAL: IntCounter = {
        let counter = IntCounter::new(
            "ingress_manager_workqueue_dropped_total",
            "Total number of keys dropped without converging",
        )
        .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Watch events seen by the event router
    static ref EVENTS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "ingress_manager_events_total",
            "Total number of watch events by kind, event type and routing outcome",
        );
        let counter = IntCounterVec::new(opts, &["kind", "event", "outcome"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };
}

/// Record one reconciliation
pub fn record_reconciliation(duration_secs: f64, result: &str) {
    RECONCILE_DURATION
        .with_label_values(&[result])
        .observe(duration_secs);

    RECONCILIATIONS_TOTAL.with_label_values(&[result]).inc();
}

/// Record a key accepted by the work queue
pub fn record_queue_add() {
    WORKQUEUE_ADDS_TOTAL.inc();
}

/// Record the current queue depth
pub fn set_queue_depth(depth: usize) {
    WORKQUEUE_DEPTH.set(i64::try_from(depth).unwrap_or(i64::MAX));
}

/// Record a rate-limited requeue
pub fn record_queue_retry() {
    WORKQUEUE_RETRIES_TOTAL.inc();
}

/// Record a key dropped without converging
pub fn record_queue_drop() {
    WORKQUEUE_DROPPED_TOTAL.inc();
}

/// Record a routing decision for a watch event
pub fn record_event(kind: &str, event: &str, outcome: &str) {
    EVENTS_TOTAL.with_label_values(&[kind, event, outcome]).inc();
}

/// Gather controller metrics in the Prometheus text format
pub fn gather_controller_metrics() -> Result<String, String> {
    // Force initialization of lazy_static metrics
    let _ = &*RECONCILE_DURATION;
    let _ = &*RECONCILIATIONS_TOTAL;
    let _ = &*WORKQUEUE_ADDS_TOTAL;
    let _ = &*WORKQUEUE_DEPTH;
    let _ = &*WORKQUEUE_RETRIES_TOTAL;
    let _ = &*WORKQUEUE_DROPPED_TOTAL;
    let _ = &*EVENTS_TOTAL;

    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = CONTROLLER_METRICS_REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert to UTF-8: {}", e))
}
