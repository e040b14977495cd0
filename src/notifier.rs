// ===============================
// src/notifier.rs
// ===============================
//
// Notifikasi best-effort. Pipeline hanya melakukan `try_send` ke channel;
// worker di sini yang mengirim (Telegram atau log). Gagal kirim = log + metric,
// tidak pernah balik ke pipeline.
//
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::{AccountSummary, Notice, NoticeKind};
use crate::metrics::NOTICES;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("telegram rejected ({code}): {body}")]
    Rejected { code: u16, body: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &Notice) -> Result<(), NotifyError>;
}

fn kind_label(k: NoticeKind) -> &'static str {
    match k {
        NoticeKind::EventDetected => "event_detected",
        NoticeKind::ActionSucceeded => "action_succeeded",
        NoticeKind::ActionFailed => "action_failed",
        NoticeKind::StartupSummary => "startup_summary",
    }
}

fn esc(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn render_account(out: &mut String, title: &str, acct: &AccountSummary) {
    let _ = writeln!(out, "\n<b>{}</b>", esc(title));
    let _ = writeln!(
        out,
        "value: {} | margin used: {} | available: {}",
        acct.account_value.round_dp(2),
        acct.margin_used.round_dp(2),
        acct.available().round_dp(2)
    );
    if acct.positions.is_empty() {
        let _ = writeln!(out, "no open positions");
    }
    for p in &acct.positions {
        let _ = writeln!(
            out,
            "• {} {} {} @ {} ({}x) uPnL {}",
            esc(&p.symbol),
            p.side(),
            p.size.abs(),
            p.entry_price,
            esc(&p.leverage),
            p.unrealized_pnl.round_dp(2)
        );
    }
}

/// HTML body for Telegram `parse_mode=HTML`.
pub fn render(notice: &Notice) -> String {
    let mut out = String::new();
    match notice {
        Notice::EventDetected(ev) => {
            let f = &ev.fill;
            let _ = writeln!(out, "🚨 <b>Close-long detected</b>");
            let _ = writeln!(out, "coin: <b>{}</b>", esc(&f.subject));
            let _ = writeln!(out, "size: {} @ {}", f.size, f.price);
            let _ = writeln!(out, "closed PnL: {}", f.realized_pnl);
            let _ = writeln!(out, "time: {}", ev.datetime());
        }
        Notice::ActionSucceeded { subject, params, receipt } => {
            let _ = writeln!(out, "✅ <b>Short opened</b> {} ({})", esc(subject), esc(&receipt.symbol));
            let _ = writeln!(out, "leverage: {}x | margin: {} | notional: {}", params.leverage, params.margin, params.notional());
            let _ = writeln!(out, "qty: {}", receipt.filled_qty);
            if let Some(px) = receipt.avg_price {
                let _ = writeln!(out, "avg price: {px}");
            }
            let _ = writeln!(out, "order: {}", esc(&receipt.reference));
        }
        Notice::ActionFailed { subject, reason } => {
            let _ = writeln!(out, "❌ <b>Action failed</b> {}", esc(subject));
            let _ = writeln!(out, "{}", esc(reason));
        }
        Notice::StartupSummary(s) => {
            let _ = writeln!(out, "🤖 <b>close_watch started</b>");
            let _ = writeln!(out, "address: <code>{}</code>", esc(&s.monitor_address));
            let _ = writeln!(out, "feed: {} | venue: {}", esc(&s.feed_mode), esc(&s.venue_mode));
            let _ = writeln!(out, "leverage: {}x | margin: {}", s.leverage, s.margin);
            let pairs: Vec<String> = s.trading_pairs.iter().map(|(c, sym)| format!("{c}→{sym}")).collect();
            let _ = writeln!(out, "pairs: {}", esc(&pairs.join(", ")));
            if !s.opened_subjects.is_empty() {
                let _ = writeln!(out, "already opened: {}", esc(&s.opened_subjects.join(", ")));
            }
            if let Some(w) = &s.watched {
                render_account(&mut out, "Watched address", w);
            }
            if let Some(v) = &s.venue_account {
                render_account(&mut out, "Venue account", v);
            }
        }
    }
    out
}

/// Used when Telegram is off: the notice still shows up in the logs.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: &Notice) -> Result<(), NotifyError> {
        info!(kind = kind_label(notice.kind()), "notice\n{}", render(notice));
        Ok(())
    }
}

pub struct TelegramNotifier {
    http: reqwest::Client,
    url: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, chat_id: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            url: format!("https://api.telegram.org/bot{bot_token}/sendMessage"),
            chat_id: chat_id.to_string(),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, notice: &Notice) -> Result<(), NotifyError> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": render(notice),
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        let rsp = self.http.post(&self.url).json(&body).send().await?;
        let code = rsp.status();
        if !code.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected { code: code.as_u16(), body });
        }
        Ok(())
    }
}

/// Sender side handed to the pipeline. Never blocks, never fails the caller.
#[derive(Clone)]
pub struct NoticeSink {
    tx: mpsc::Sender<Notice>,
}

impl NoticeSink {
    pub fn new(tx: mpsc::Sender<Notice>) -> Self { Self { tx } }

    pub fn send(&self, notice: Notice) {
        let kind = kind_label(notice.kind());
        if let Err(e) = self.tx.try_send(notice) {
            warn!(kind, error = %e, "notice dropped");
            NOTICES.with_label_values(&[kind, "err"]).inc();
        }
    }
}

/// Worker: drains the queue until every sender is gone.
pub async fn run(notifier: Arc<dyn Notifier>, mut rx: mpsc::Receiver<Notice>) {
    while let Some(notice) = rx.recv().await {
        let kind = kind_label(notice.kind());
        match notifier.notify(&notice).await {
            Ok(()) => {
                debug!(kind, "notice sent");
                NOTICES.with_label_values(&[kind, "ok"]).inc();
            }
            Err(e) => {
                warn!(kind, error = %e, "notice failed");
                NOTICES.with_label_values(&[kind, "err"]).inc();
            }
        }
    }
    debug!("notifier: channel closed, stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ActionParams, ActionReceipt, CloseEvent, Direction, FillRecord};
    use rust_decimal::Decimal;
    use std::sync::Mutex;

    #[test]
    fn renders_close_event() {
        let ev = CloseEvent {
            fill: FillRecord {
                id: "f1".into(),
                subject: "ETH".into(),
                direction: Direction::Sell,
                realized_pnl: Decimal::new(12540, 2),
                size: Decimal::new(20, 1),
                price: Decimal::new(310000, 2),
                timestamp_ms: 0,
            },
        };
        let text = render(&Notice::EventDetected(ev));
        assert!(text.contains("<b>ETH</b>"));
        assert!(text.contains("125.40"));
    }

    #[test]
    fn escapes_failure_reason() {
        let text = render(&Notice::ActionFailed { subject: "BTC".into(), reason: "<bad> & worse".into() });
        assert!(text.contains("&lt;bad&gt; &amp; worse"));
    }

    struct Flaky(Mutex<u32>);

    #[async_trait]
    impl Notifier for Flaky {
        async fn notify(&self, _n: &Notice) -> Result<(), NotifyError> {
            let mut c = self.0.lock().unwrap();
            *c += 1;
            if *c == 1 {
                Err(NotifyError::Rejected { code: 500, body: "boom".into() })
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn worker_survives_failed_notice() {
        let flaky = Arc::new(Flaky(Mutex::new(0)));
        let (tx, rx) = mpsc::channel(8);
        let sink = NoticeSink::new(tx);
        let receipt = ActionReceipt { reference: "1".into(), symbol: "ETHUSDC".into(), filled_qty: Decimal::ONE, avg_price: None };
        let params = ActionParams { leverage: 2, margin: Decimal::ONE };
        sink.send(Notice::ActionFailed { subject: "ETH".into(), reason: "x".into() });
        sink.send(Notice::ActionSucceeded { subject: "ETH".into(), params, receipt });
        drop(sink);
        run(flaky.clone(), rx).await;
        assert_eq!(*flaky.0.lock().unwrap(), 2);
    }
}
