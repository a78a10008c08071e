//! Prometheus metrics for device-auth-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// Authentication attempts by device type and outcome label.
pub static AUTH_ATTEMPTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "device_auth_attempts_total",
        "Total number of device authentication attempts",
        &["device_type", "outcome"]
    )
    .expect("Failed to register auth_attempts_total")
});

/// Round trip to the OTP authority, by resulting status.
pub static OTP_AUTHORITY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "device_auth_otp_authority_duration_seconds",
        "OTP authority request duration in seconds",
        &["status"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register otp_authority_duration")
});

/// Session lifecycle events (created, refreshed, invalidated, rejected).
pub static SESSION_EVENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "device_auth_session_events_total",
        "Total number of session lifecycle events",
        &["event"]
    )
    .expect("Failed to register session_events_total")
});

/// Committed custody changes by action.
pub static CUSTODY_CHANGES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "device_auth_custody_changes_total",
        "Total number of committed device custody changes",
        &["action", "status"]
    )
    .expect("Failed to register custody_changes_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "device_auth_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&AUTH_ATTEMPTS_TOTAL);
    Lazy::force(&OTP_AUTHORITY_DURATION);
    Lazy::force(&SESSION_EVENTS_TOTAL);
    Lazy::force(&CUSTODY_CHANGES_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
