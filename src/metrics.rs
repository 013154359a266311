//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Once;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedserve_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("fedserve_activities_received_total", "Total number of inbound activities"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref ACTIVITIES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("fedserve_activities_sent_total", "Total number of activities delivered"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedserve_deliveries_total", "Outbound deliveries by final outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERY_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedserve_delivery_attempts_total", "Individual signed POST attempts"),
        &["status"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "fedserve_federation_request_duration_seconds",
            "Outbound federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["method"]
    ).expect("metric can be created");

    // Application Metrics
    pub static ref LOCAL_ACTORS: IntGauge = IntGauge::new(
        "fedserve_local_actors",
        "Number of local actors loaded"
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedserve_errors_total", "Total number of errors returned over HTTP"),
        &["error_type"]
    ).expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry. Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
            .expect("HTTP_REQUESTS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(ACTIVITIES_RECEIVED.clone()))
            .expect("ACTIVITIES_RECEIVED can be registered");
        REGISTRY
            .register(Box::new(ACTIVITIES_SENT.clone()))
            .expect("ACTIVITIES_SENT can be registered");
        REGISTRY
            .register(Box::new(DELIVERIES_TOTAL.clone()))
            .expect("DELIVERIES_TOTAL can be registered");
        REGISTRY
            .register(Box::new(DELIVERY_ATTEMPTS_TOTAL.clone()))
            .expect("DELIVERY_ATTEMPTS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()))
            .expect("FEDERATION_REQUEST_DURATION_SECONDS can be registered");
        REGISTRY
            .register(Box::new(LOCAL_ACTORS.clone()))
            .expect("LOCAL_ACTORS can be registered");
        REGISTRY
            .register(Box::new(ERRORS_TOTAL.clone()))
            .expect("ERRORS_TOTAL can be registered");
    });
}
