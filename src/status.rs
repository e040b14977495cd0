// ===============================
// src/status.rs
// ===============================
//
// Side task observability:
// - startup: cek info API (fill terakhir), posisi watched address,
//   StartupSummary notice.
// - periodik: posisi aktif + counters pipeline tiap POSITION_PRINT_INTERVAL.
// Semua kegagalan di sini cuma di-log, tidak pernah menyentuh pipeline.
//
use std::sync::Arc;

use tokio::{
    sync::watch,
    time::{interval_at, Duration, Instant, MissedTickBehavior},
};
use tracing::{info, warn};

use crate::config::Args;
use crate::domain::{AccountSummary, Notice, StartupSummary};
use crate::gateway::ActionExecutor;
use crate::metrics;
use crate::notifier::NoticeSink;
use crate::poll::{InfoClient, PollOutcome};
use crate::trade_state::TradeStateStore;

/// One line per open position, for logs.
pub fn position_lines(acct: &AccountSummary) -> Vec<String> {
    acct.positions
        .iter()
        .map(|p| {
            let liq = p.liquidation_price.map(|x| x.to_string()).unwrap_or_else(|| "-".into());
            format!(
                "{} {} size={} entry={} lev={}x uPnL={} liq={}",
                p.symbol,
                p.side(),
                p.size.abs(),
                p.entry_price,
                p.leverage,
                p.unrealized_pnl.round_dp(2),
                liq
            )
        })
        .collect()
}

fn log_account(label: &str, acct: &AccountSummary) {
    info!(
        label,
        account_value = %acct.account_value.round_dp(2),
        margin_used = %acct.margin_used.round_dp(2),
        available = %acct.available().round_dp(2),
        positions = acct.positions.len(),
        "account summary"
    );
    for line in position_lines(acct) {
        info!(label, "  {line}");
    }
}

/// Watched-address positions; `None` on any failure (already logged).
pub async fn watched_account(client: &InfoClient) -> Option<AccountSummary> {
    match client.clearinghouse_state().await {
        Ok(Some(s)) => Some(s.summary()),
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "clearinghouseState query failed");
            None
        }
    }
}

/// Latest fill of the watched address, just to show the API is reachable.
pub async fn check_info_api(client: &InfoClient) {
    match client.user_fills(1).await {
        PollOutcome::Success(fills) => match fills.first() {
            Some(f) => info!(
                coin = %f.subject,
                side = ?f.direction,
                size = %f.size,
                price = %f.price,
                closed_pnl = %f.realized_pnl,
                "info API ok, latest fill"
            ),
            None => info!("info API ok, no fills yet"),
        },
        PollOutcome::RateLimited => warn!("info API check rate limited"),
        PollOutcome::Failed(e) => warn!(error = %e, "info API check failed, continuing"),
    }
}

pub fn build_summary(
    args: &Args,
    state: &TradeStateStore,
    watched: Option<AccountSummary>,
    venue_account: Option<AccountSummary>,
) -> StartupSummary {
    StartupSummary {
        monitor_address: args.monitor_address.clone(),
        feed_mode: args.feed_mode.as_str().to_string(),
        venue_mode: args.venue_mode.as_str().to_string(),
        leverage: args.leverage,
        margin: args.margin,
        trading_pairs: args.trading_pairs.clone(),
        opened_subjects: state.opened_subjects(),
        watched,
        venue_account,
    }
}

pub async fn startup(
    args: &Args,
    client: &InfoClient,
    executor: &dyn ActionExecutor,
    state: &TradeStateStore,
    notices: &NoticeSink,
) {
    check_info_api(client).await;
    let watched = watched_account(client).await;
    if let Some(w) = &watched {
        log_account("watched", w);
    }
    let venue_account = executor.account_summary().await;
    if let Some(v) = &venue_account {
        log_account(executor.venue(), v);
    }
    let opened = state.opened_subjects();
    if !opened.is_empty() {
        info!(?opened, "subjects already opened (reset to re-arm)");
    }
    notices.send(Notice::StartupSummary(build_summary(args, state, watched, venue_account)));
}

fn log_stats() {
    let s = metrics::stats();
    info!(
        ws_messages = s.ws_messages,
        ws_errors = s.ws_errors,
        ws_reconnects = s.ws_reconnects,
        api_requests = s.api_requests,
        api_rate_limited = s.api_rate_limited,
        fills_received = s.fills_received,
        snapshot_fills = s.snapshot_fills,
        duplicate_fills = s.duplicate_fills,
        persist_failures = s.persist_failures,
        "pipeline stats"
    );
}

/// Periodic status loop. First report one interval after start.
pub async fn run(
    client: Arc<InfoClient>,
    executor: Arc<dyn ActionExecutor>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    if every.is_zero() {
        info!("status task disabled");
        return;
    }
    let mut tick = interval_at(Instant::now() + every, every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => break,
        }
        match watched_account(&client).await {
            Some(acct) if acct.positions.is_empty() => info!("watched address: no active positions"),
            Some(acct) => log_account("watched", &acct),
            None => {}
        }
        if let Some(v) = executor.account_summary().await {
            log_account(executor.venue(), &v);
        }
        log_stats();
    }
    info!("status task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PositionView;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    #[test]
    fn formats_short_position() {
        let acct = AccountSummary {
            account_value: Decimal::from(1000),
            margin_used: Decimal::from(100),
            positions: vec![PositionView {
                symbol: "ETH".into(),
                size: Decimal::from_str("-1.5").unwrap(),
                entry_price: Decimal::from(3100),
                leverage: "20".into(),
                unrealized_pnl: Decimal::from_str("12.345").unwrap(),
                liquidation_price: None,
            }],
        };
        assert_eq!(
            position_lines(&acct),
            vec!["ETH short size=1.5 entry=3100 lev=20x uPnL=12.34 liq=-".to_string()]
        );
    }

    #[test]
    fn summary_lists_opened_subjects() {
        let dir = tempfile::tempdir().unwrap();
        let state = TradeStateStore::open(dir.path().join("s.json"));
        state.mark_opened("BTC", "9").unwrap();
        let args = crate::config::test_args();
        let s = build_summary(&args, &state, None, None);
        assert_eq!(s.opened_subjects, vec!["BTC".to_string()]);
        assert_eq!(s.trading_pairs.len(), 2);
        assert_eq!(s.leverage, 100);
    }
}
