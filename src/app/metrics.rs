//! Prometheus-based metrics
//!
//! One observer bridges the typed event stream onto a Prometheus registry;
//! an HTTP endpoint exposes it for scraping. Nothing here is on the data
//! path: events arrive through the observer's queue.

use std::net::SocketAddr;

use axum::{http::header::CONTENT_TYPE, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::events::{Event, EventObserver};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref CONNECTIONS_TOTAL: IntCounter = IntCounter::new(
        "mtrelay_connections_total",
        "Total number of accepted client connections"
    ).unwrap();

    pub static ref CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "mtrelay_connections_active",
        "Number of currently active client connections"
    ).unwrap();

    pub static ref HANDSHAKES_OK_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("mtrelay_handshakes_ok_total", "Recognized handshakes per DC"),
        &["dc"]
    ).unwrap();

    pub static ref HANDSHAKE_FALLBACKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "mtrelay_handshake_fallbacks_total",
            "Handshakes routed to the fronting host, by reason class"
        ),
        &["reason"]
    ).unwrap();

    pub static ref REPLAYS_DETECTED_TOTAL: IntCounter = IntCounter::new(
        "mtrelay_replays_detected_total",
        "Handshakes rejected by the anti-replay gate"
    ).unwrap();

    pub static ref DOMAIN_FRONTING_TOTAL: IntCounter = IntCounter::new(
        "mtrelay_domain_fronting_total",
        "Connections spliced to the fronting host"
    ).unwrap();

    pub static ref UPSTREAM_UNREACHABLE_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "mtrelay_upstream_unreachable_total",
            "Connections dropped because no DC endpoint answered"
        ),
        &["dc"]
    ).unwrap();

    pub static ref CONCURRENCY_LIMITED_TOTAL: IntCounter = IntCounter::new(
        "mtrelay_concurrency_limited_total",
        "Connections rejected at the admission cap"
    ).unwrap();

    pub static ref TRAFFIC_TX_BYTES: IntCounter = IntCounter::new(
        "mtrelay_traffic_tx_bytes_total",
        "Payload bytes relayed client to upstream"
    ).unwrap();

    pub static ref TRAFFIC_RX_BYTES: IntCounter = IntCounter::new(
        "mtrelay_traffic_rx_bytes_total",
        "Payload bytes relayed upstream to client"
    ).unwrap();

    pub static ref IPLIST_SIZE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("mtrelay_iplist_size", "Entries in the IP lists"),
        &["list"]
    ).unwrap();

    pub static ref CONNECTION_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "mtrelay_connection_duration_seconds",
            "Lifetime of finished connections"
        )
        .buckets(vec![0.1, 1.0, 10.0, 60.0, 300.0, 1800.0, 7200.0])
    ).unwrap();
}

/// Register every metric exactly once.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(CONNECTIONS_TOTAL.clone()))
        .expect("register connections_total");
    REGISTRY
        .register(Box::new(CONNECTIONS_ACTIVE.clone()))
        .expect("register connections_active");
    REGISTRY
        .register(Box::new(HANDSHAKES_OK_TOTAL.clone()))
        .expect("register handshakes_ok_total");
    REGISTRY
        .register(Box::new(HANDSHAKE_FALLBACKS_TOTAL.clone()))
        .expect("register handshake_fallbacks_total");
    REGISTRY
        .register(Box::new(REPLAYS_DETECTED_TOTAL.clone()))
        .expect("register replays_detected_total");
    REGISTRY
        .register(Box::new(DOMAIN_FRONTING_TOTAL.clone()))
        .expect("register domain_fronting_total");
    REGISTRY
        .register(Box::new(UPSTREAM_UNREACHABLE_TOTAL.clone()))
        .expect("register upstream_unreachable_total");
    REGISTRY
        .register(Box::new(CONCURRENCY_LIMITED_TOTAL.clone()))
        .expect("register concurrency_limited_total");
    REGISTRY
        .register(Box::new(TRAFFIC_TX_BYTES.clone()))
        .expect("register traffic_tx_bytes");
    REGISTRY
        .register(Box::new(TRAFFIC_RX_BYTES.clone()))
        .expect("register traffic_rx_bytes");
    REGISTRY
        .register(Box::new(IPLIST_SIZE.clone()))
        .expect("register iplist_size");
    REGISTRY
        .register(Box::new(CONNECTION_DURATION_SECONDS.clone()))
        .expect("register connection_duration_seconds");
}

/// Event observer feeding the registry.
pub struct PrometheusObserver;

impl EventObserver for PrometheusObserver {
    fn observe(&self, event: &Event) {
        match event {
            Event::ConnectionStart { .. } => {
                CONNECTIONS_TOTAL.inc();
                CONNECTIONS_ACTIVE.inc();
            }
            Event::ConnectionEnd {
                duration, tx, rx, ..
            } => {
                CONNECTIONS_ACTIVE.dec();
                TRAFFIC_TX_BYTES.inc_by(*tx);
                TRAFFIC_RX_BYTES.inc_by(*rx);
                CONNECTION_DURATION_SECONDS.observe(duration.as_secs_f64());
            }
            Event::HandshakeOk { dc, .. } => {
                HANDSHAKES_OK_TOTAL
                    .with_label_values(&[&dc.to_string()])
                    .inc();
            }
            Event::HandshakeFallback { reason, .. } => {
                HANDSHAKE_FALLBACKS_TOTAL
                    .with_label_values(&[reason.as_str()])
                    .inc();
            }
            Event::ReplayDetected { .. } => {
                REPLAYS_DETECTED_TOTAL.inc();
            }
            Event::DomainFronting { .. } => {
                DOMAIN_FRONTING_TOTAL.inc();
            }
            Event::UpstreamUnreachable { dc, .. } => {
                UPSTREAM_UNREACHABLE_TOTAL
                    .with_label_values(&[&dc.to_string()])
                    .inc();
            }
            Event::ConcurrencyLimited => {
                CONCURRENCY_LIMITED_TOTAL.inc();
            }
            Event::IpListSize { n, is_blocklist } => {
                let list = if *is_blocklist { "blocklist" } else { "allowlist" };
                IPLIST_SIZE.with_label_values(&[list]).set(*n as i64);
            }
        }
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    ([(CONTENT_TYPE, encoder.format_type().to_string())], buffer)
}

/// Serve `/metrics` until the token fires.
pub async fn serve_metrics(addr: SocketAddr, token: CancellationToken) {
    let app = Router::new().route("/metrics", get(metrics_handler));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Failed to bind metrics endpoint on {}: {}", addr, e);
            return;
        }
    };

    info!("Prometheus metrics on http://{}/metrics", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
    {
        warn!("Metrics endpoint error: {}", e);
    }
}
