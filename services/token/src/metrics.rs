//! Prometheus metrics for the token lifecycle.
//!
//! Collectors register against the default registry on first use.

#![allow(clippy::expect_used)]

use once_cell::sync::Lazy;
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec};

/// Token pairs issued, by issuing operation.
pub static TOKENS_ISSUED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "token_lifecycle_tokens_issued_total",
        "Total number of token pairs issued",
        &["operation"]
    )
    .expect("Failed to register tokens_issued metric")
});

/// Refresh attempts, by outcome.
pub static TOKENS_REFRESHED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "token_lifecycle_tokens_refreshed_total",
        "Total number of refresh attempts",
        &["status"]
    )
    .expect("Failed to register tokens_refreshed metric")
});

/// Sessions revoked, by reason.
pub static SESSIONS_REVOKED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "token_lifecycle_sessions_revoked_total",
        "Total number of sessions revoked",
        &["reason"]
    )
    .expect("Failed to register sessions_revoked metric")
});

/// Login attempts, by outcome.
pub static LOGIN_ATTEMPTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "token_lifecycle_login_attempts_total",
        "Total number of login attempts",
        &["outcome"]
    )
    .expect("Failed to register login_attempts metric")
});

/// Requests rejected by the rate limiter.
pub static RATE_LIMITED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "token_lifecycle_rate_limited_total",
        "Total number of rate limited attempts",
        &["action"]
    )
    .expect("Failed to register rate_limited metric")
});

/// Security events counter.
pub static SECURITY_EVENTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "token_lifecycle_security_events_total",
        "Total number of security events",
        &["event_type"]
    )
    .expect("Failed to register security_events metric")
});

/// Latency of service operations.
pub static OPERATION_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "token_lifecycle_operation_latency_seconds",
        "Token service operation latency in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register operation_latency metric")
});

/// Record a token pair issuance.
pub fn record_token_issued(operation: &str) {
    TOKENS_ISSUED.with_label_values(&[operation]).inc();
}

/// Record a refresh attempt.
pub fn record_token_refreshed(status: &str) {
    TOKENS_REFRESHED.with_label_values(&[status]).inc();
}

/// Record `count` revoked sessions.
pub fn record_session_revoked(reason: &str, count: u64) {
    if count > 0 {
        SESSIONS_REVOKED
            .with_label_values(&[reason])
            .inc_by(count as f64);
    }
}

/// Record a login attempt.
pub fn record_login_attempt(outcome: &str) {
    LOGIN_ATTEMPTS.with_label_values(&[outcome]).inc();
}

/// Record a rate-limited attempt.
pub fn record_rate_limited(action: &str) {
    RATE_LIMITED.with_label_values(&[action]).inc();
}

/// Record a security event.
pub fn record_security_event(event_type: &str) {
    SECURITY_EVENTS.with_label_values(&[event_type]).inc();
}

/// Record operation latency.
pub fn record_operation_latency(operation: &str, duration_secs: f64) {
    OPERATION_LATENCY
        .with_label_values(&[operation])
        .observe(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_token_issued() {
        record_token_issued("login");
        let value = TOKENS_ISSUED.with_label_values(&["login"]).get();
        assert!(value > 0.0);
    }

    #[test]
    fn test_record_session_revoked_skips_zero() {
        let label = "metrics_unit_test_only";
        let before = SESSIONS_REVOKED.with_label_values(&[label]).get();
        record_session_revoked(label, 0);
        assert_eq!(SESSIONS_REVOKED.with_label_values(&[label]).get(), before);
        record_session_revoked(label, 3);
        let after = SESSIONS_REVOKED.with_label_values(&[label]).get();
        assert_eq!(after - before, 3.0);
    }

    #[test]
    fn test_record_security_event() {
        record_security_event("REFRESH_REPLAY");
        let value = SECURITY_EVENTS
            .with_label_values(&["REFRESH_REPLAY"])
            .get();
        assert!(value > 0.0);
    }

    #[test]
    fn test_record_operation_latency() {
        record_operation_latency("refresh", 0.01);
        let count = OPERATION_LATENCY
            .with_label_values(&["refresh"])
            .get_sample_count();
        assert!(count > 0);
    }
}
