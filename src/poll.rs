// ===============================
// src/poll.rs
// ===============================
//
// Transport polling: POST {"type":"userFills","user":..} ke info API
// setiap `scan_interval`. Siklus: Idle -> Requesting -> (Success |
// RateLimited | Failed) -> Idle. Tidak pernah menghentikan loop.
//
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::{
    sync::{mpsc, watch},
    time::{interval, sleep, Duration, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::domain::{FillRecord, TransportError, TransportEvent};
use crate::metrics::{API_ERRORS, API_REQUESTS, FILLS_RECEIVED};
use crate::throttle::RateLimiter;
use crate::wire::{canonicalize_batch, ClearinghouseState, InfoRequest, RawFill};

#[derive(Debug)]
pub enum PollOutcome {
    /// Newest-first, truncated to the configured limit.
    Success(Vec<FillRecord>),
    RateLimited,
    Failed(TransportError),
}

enum Reply<T> {
    Ok(T),
    RateLimited,
}

/// Hyperliquid info endpoint client shared by polling, the startup check and status.
pub struct InfoClient {
    http: reqwest::Client,
    url: String,
    user: String,
    limiter: Arc<RateLimiter>,
    cooldown: Duration,
}

impl InfoClient {
    pub fn new(url: String, user: String, limiter: Arc<RateLimiter>, cooldown: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { http, url, user, limiter, cooldown }
    }

    pub fn user(&self) -> &str { &self.user }

    async fn post_info<T: DeserializeOwned>(&self, kind: &'static str) -> Result<Reply<T>, TransportError> {
        self.limiter.acquire().await;
        API_REQUESTS.inc();
        let rsp = self
            .http
            .post(&self.url)
            .json(&InfoRequest { kind, user: &self.user })
            .send()
            .await?;
        let code = rsp.status();
        if code.as_u16() == 429 {
            return Ok(Reply::RateLimited);
        }
        let body = rsp.text().await?;
        if !code.is_success() {
            return Err(TransportError::Status { code: code.as_u16(), body });
        }
        Ok(Reply::Ok(serde_json::from_str(&body)?))
    }

    /// Rate-limit is a scheduling hint: count it, cool down, report empty.
    async fn on_rate_limited(&self, what: &str) {
        API_ERRORS.with_label_values(&["rate_limited"]).inc();
        let hits = API_ERRORS.with_label_values(&["rate_limited"]).get();
        warn!(what, hits, cooldown_s = self.cooldown.as_secs(), "info API rate limited (429)");
        sleep(self.cooldown).await;
    }

    pub async fn user_fills(&self, limit: usize) -> PollOutcome {
        match self.post_info::<Vec<RawFill>>("userFills").await {
            Ok(Reply::Ok(mut raws)) => {
                let total = raws.len();
                raws.truncate(limit);
                debug!(total, returned = raws.len(), "userFills fetched");
                PollOutcome::Success(canonicalize_batch(&raws))
            }
            Ok(Reply::RateLimited) => {
                self.on_rate_limited("userFills").await;
                PollOutcome::RateLimited
            }
            Err(e) => {
                let kind = if matches!(e, TransportError::Decode(_)) { "decode" } else { "http" };
                API_ERRORS.with_label_values(&[kind]).inc();
                PollOutcome::Failed(e)
            }
        }
    }

    pub async fn clearinghouse_state(&self) -> Result<Option<ClearinghouseState>, TransportError> {
        match self.post_info::<ClearinghouseState>("clearinghouseState").await {
            Ok(Reply::Ok(s)) => Ok(Some(s)),
            Ok(Reply::RateLimited) => {
                self.on_rate_limited("clearinghouseState").await;
                Ok(None)
            }
            Err(e) => {
                API_ERRORS.with_label_values(&["http"]).inc();
                Err(e)
            }
        }
    }
}

/// Turns successive poll outcomes into transport events. The first successful
/// batch is history, so it is delivered as a snapshot.
#[derive(Debug, Default)]
pub struct PollCycle {
    primed: bool,
}

impl PollCycle {
    pub fn on_outcome(&mut self, outcome: PollOutcome) -> Option<TransportEvent> {
        match outcome {
            PollOutcome::Success(fills) if !self.primed => {
                self.primed = true;
                info!(count = fills.len(), "initial poll treated as snapshot");
                Some(TransportEvent::Snapshot(fills))
            }
            PollOutcome::Success(fills) if fills.is_empty() => None,
            PollOutcome::Success(fills) => {
                FILLS_RECEIVED.inc_by(fills.len() as u64);
                Some(TransportEvent::Fills(fills))
            }
            PollOutcome::RateLimited => None,
            PollOutcome::Failed(e) => {
                warn!(error = %e, "poll failed, retry next cycle");
                None
            }
        }
    }
}

pub async fn run(
    client: Arc<InfoClient>,
    limit: usize,
    scan_interval: Duration,
    tx: mpsc::Sender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(user = %client.user(), interval_s = scan_interval.as_secs(), limit, "polling transport started");
    let mut tick = interval(scan_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cycle = PollCycle::default();

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        let outcome = tokio::select! {
            o = client.user_fills(limit) => o,
            _ = shutdown.changed() => break,
        };
        if let Some(ev) = cycle.on_outcome(outcome) {
            if tx.send(ev).await.is_err() {
                break;
            }
        }
    }
    info!("polling transport stopped");
}
