//! Prometheus metrics for the fan-out pipeline.

use std::time::Duration;

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

static FANOUT_JOBS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fanout_jobs_total",
        "Fan-out jobs by kind and outcome (acked/retried/dead)",
        &["kind", "outcome"]
    )
    .expect("Failed to register fanout jobs metric")
});

static FANOUT_JOB_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "fanout_job_duration_seconds",
        "Duration of fan-out job processing",
        &["kind"],
        vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]
    )
    .expect("Failed to register fanout duration metric")
});

static FANOUT_TARGETS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fanout_targets_total",
        "Follower timelines written by fan-out jobs",
        &["kind"]
    )
    .expect("Failed to register fanout targets metric")
});

static PUSH_BROADCASTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "push_broadcasts_total",
        "Live push broadcasts by outcome",
        &["outcome"]
    )
    .expect("Failed to register push broadcasts metric")
});

static WS_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "ws_connections",
        "Currently open live timeline connections"
    )
    .expect("Failed to register ws connections metric")
});

/// Record a completed fan-out job (outcome: acked/retried/dead).
pub fn record_job(kind: &str, outcome: &str) {
    FANOUT_JOBS_TOTAL.with_label_values(&[kind, outcome]).inc();
}

pub fn observe_job_duration(kind: &str, duration: Duration) {
    FANOUT_JOB_DURATION_SECONDS
        .with_label_values(&[kind])
        .observe(duration.as_secs_f64());
}

pub fn record_fanout_targets(kind: &str, count: u64) {
    FANOUT_TARGETS_TOTAL.with_label_values(&[kind]).inc_by(count);
}

/// outcome: delivered / no_connection
pub fn record_push_broadcast(outcome: &str) {
    PUSH_BROADCASTS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_ws_connected() {
    WS_CONNECTIONS.inc();
}

pub fn record_ws_disconnected() {
    WS_CONNECTIONS.dec();
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_does_not_panic() {
        record_job("new_post", "acked");
        record_job("delete_post", "retried");
        observe_job_duration("new_post", Duration::from_millis(12));
        record_fanout_targets("new_post", 3);
        record_push_broadcast("delivered");
        record_ws_connected();
        record_ws_disconnected();
    }
}
