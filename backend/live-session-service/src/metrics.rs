use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, TextEncoder};

static LIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "live_session_service_live_sessions",
        "Sessions currently in the LIVE state",
    )
    .expect("failed to create live_session_service_live_sessions");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register live_session_service_live_sessions");
    gauge
});

static ACTIVE_CONNECTIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new(
            "live_session_service_active_connections",
            "Admitted real-time connections by role",
        ),
        &["role"],
    )
    .expect("failed to create live_session_service_active_connections");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register live_session_service_active_connections");
    gauge
});

static CHAT_MESSAGES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "live_session_service_chat_messages_total",
            "Messages sequenced by the event bus",
        ),
        &["kind"],
    )
    .expect("failed to create live_session_service_chat_messages_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register live_session_service_chat_messages_total");
    counter
});

static OUTBOUND_DROPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "live_session_service_outbound_dropped_total",
        "Non-critical outbound frames dropped under backpressure",
    )
    .expect("failed to create live_session_service_outbound_dropped_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register live_session_service_outbound_dropped_total");
    counter
});

static DONATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "live_session_service_donations_total",
            "Donation attempts by settlement outcome",
        ),
        &["outcome"],
    )
    .expect("failed to create live_session_service_donations_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register live_session_service_donations_total");
    counter
});

static TRANSCODER_STATES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "live_session_service_transcoder_states_total",
            "Transcoder job state entries",
        ),
        &["state"],
    )
    .expect("failed to create live_session_service_transcoder_states_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register live_session_service_transcoder_states_total");
    counter
});

static EXTERNAL_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "live_session_service_external_failures_total",
            "Failed calls to external collaborators",
        ),
        &["dependency"],
    )
    .expect("failed to create live_session_service_external_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register live_session_service_external_failures_total");
    counter
});

pub fn session_went_live() {
    LIVE_SESSIONS.inc();
}

pub fn session_left_live() {
    LIVE_SESSIONS.dec();
}

pub fn connection_opened(role: &str) {
    ACTIVE_CONNECTIONS.with_label_values(&[role]).inc();
}

pub fn connection_closed(role: &str) {
    ACTIVE_CONNECTIONS.with_label_values(&[role]).dec();
}

pub fn chat_message(kind: &str) {
    CHAT_MESSAGES_TOTAL.with_label_values(&[kind]).inc();
}

pub fn outbound_dropped() {
    OUTBOUND_DROPPED_TOTAL.inc();
}

pub fn donation(outcome: &str) {
    DONATIONS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn transcoder_state(state: &str) {
    TRANSCODER_STATES_TOTAL.with_label_values(&[state]).inc();
}

pub fn external_failure(dependency: &str) {
    EXTERNAL_FAILURES_TOTAL.with_label_values(&[dependency]).inc();
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
