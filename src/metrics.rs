// ===============================
// src/metrics.rs
// ===============================
//
// Counter proses (tidak pernah di-reset) untuk pipeline + endpoint /metrics.
// Task status membaca lewat `stats()`.
//
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::header::CONTENT_TYPE;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio::sync::watch;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Feed health --------
pub static WS_MESSAGES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ws_messages_total", "websocket text frames received").unwrap());

pub static WS_ERRORS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ws_errors_total", "websocket read/parse errors").unwrap());

pub static WS_RECONNECTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ws_reconnects_total", "websocket reconnect attempts").unwrap());

// 0=disconnected 1=connecting 2=subscribing 3=streaming 4=closing
pub static WS_STATE: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("ws_connection_state", "streaming transport state").unwrap());

pub static API_REQUESTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("api_requests_total", "info API requests sent").unwrap());

pub static API_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("api_errors_total", "info API failures (label: kind)"),
        &["kind"],
    )
    .unwrap()
});

// -------- Pipeline --------
pub static FILLS_RECEIVED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("fills_received_total", "live fills received").unwrap());

pub static SNAPSHOT_FILLS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("snapshot_fills_total", "fills marked seen from snapshots").unwrap());

pub static DUPLICATE_FILLS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("duplicate_fills_total", "fills dropped by the dedup ledger").unwrap());

pub static CLOSE_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("close_events_total", "close-long events detected (label: subject)"),
        &["subject"],
    )
    .unwrap()
});

pub static ACTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "actions_total",
            "downstream actions (labels: status=ok|failed|skipped, subject)",
        ),
        &["status", "subject"],
    )
    .unwrap()
});

pub static PERSIST_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "trade_state_persist_failures_total",
        "trade state writes that failed after a successful action",
    )
    .unwrap()
});

pub static NOTICES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("notices_total", "notifications (labels: kind, status=ok|err)"),
        &["kind", "status"],
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_FEED_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_feed_mode", "feed mode (label: mode)"), &["mode"]).unwrap()
});

pub static CONFIG_VENUE_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_venue_mode", "venue mode (label: mode)"), &["mode"]).unwrap()
});

pub static CONFIG_SUBJECT: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_subject", "tracked subjects (label: subject)"),
        &["subject"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(WS_MESSAGES.clone())),
        REGISTRY.register(Box::new(WS_ERRORS.clone())),
        REGISTRY.register(Box::new(WS_RECONNECTS.clone())),
        REGISTRY.register(Box::new(WS_STATE.clone())),
        REGISTRY.register(Box::new(API_REQUESTS.clone())),
        REGISTRY.register(Box::new(API_ERRORS.clone())),
        REGISTRY.register(Box::new(FILLS_RECEIVED.clone())),
        REGISTRY.register(Box::new(SNAPSHOT_FILLS.clone())),
        REGISTRY.register(Box::new(DUPLICATE_FILLS.clone())),
        REGISTRY.register(Box::new(CLOSE_EVENTS.clone())),
        REGISTRY.register(Box::new(ACTIONS.clone())),
        REGISTRY.register(Box::new(PERSIST_FAILURES.clone())),
        REGISTRY.register(Box::new(NOTICES.clone())),
        // Config visibility
        REGISTRY.register(Box::new(CONFIG_FEED_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_VENUE_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_SUBJECT.clone())),
    ] {
        let _ = m;
    }
}

/// Read-only view for the status task.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub ws_messages: u64,
    pub ws_errors: u64,
    pub ws_reconnects: u64,
    pub api_requests: u64,
    pub api_rate_limited: u64,
    pub fills_received: u64,
    pub snapshot_fills: u64,
    pub duplicate_fills: u64,
    pub persist_failures: u64,
}

pub fn stats() -> Stats {
    Stats {
        ws_messages: WS_MESSAGES.get(),
        ws_errors: WS_ERRORS.get(),
        ws_reconnects: WS_RECONNECTS.get(),
        api_requests: API_REQUESTS.get(),
        api_rate_limited: API_ERRORS.with_label_values(&["rate_limited"]).get(),
        fills_received: FILLS_RECEIVED.get(),
        snapshot_fills: SNAPSHOT_FILLS.get(),
        duplicate_fills: DUPLICATE_FILLS.get(),
        persist_failures: PERSIST_FAILURES.get(),
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let rsp = Response::builder()
        .header(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
        .body(Body::from(encode_metrics()))
        .unwrap_or_default();
    Ok(rsp)
}

/// Serve every path with the registry dump until shutdown flips.
pub async fn serve_metrics(port: u16, mut shutdown: watch::Receiver<bool>) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });
    let builder = match Server::try_bind(&addr) {
        Ok(b) => b,
        Err(e) => {
            error!(%addr, error = %e, "metrics bind failed");
            return;
        }
    };
    info!(%addr, "metrics listening (/metrics)");
    let server = builder.serve(make).with_graceful_shutdown(async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    });
    if let Err(e) = server.await {
        error!(error = %e, "metrics server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_counters() {
        init();
        FILLS_RECEIVED.inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("fills_received_total"));
        assert!(stats().fills_received >= 1);
    }
}
