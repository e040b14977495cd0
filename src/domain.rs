// ===============================
// src/domain.rs
// ===============================
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction { Buy, Sell }

/// Satu fill upstream yang sudah dinormalisasi (lihat `wire::canonicalize`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillRecord {
    pub id: String,
    pub subject: String,
    pub direction: Direction,
    pub realized_pnl: Decimal,
    pub size: Decimal,
    pub price: Decimal,
    pub timestamp_ms: i64,
}

/// A fill that closed (part of) a long position on a tracked subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseEvent { pub fill: FillRecord }

impl CloseEvent {
    pub fn subject(&self) -> &str { &self.fill.subject }

    pub fn datetime(&self) -> String {
        chrono::DateTime::from_timestamp_millis(self.fill.timestamp_ms)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| self.fill.timestamp_ms.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActionParams { pub leverage: u32, pub margin: Decimal }

impl ActionParams {
    pub fn notional(&self) -> Decimal { self.margin * Decimal::from(self.leverage) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReceipt {
    pub reference: String,
    pub symbol: String,
    pub filled_qty: Decimal,
    pub avg_price: Option<Decimal>,
}

/// What the transports hand to the orchestrator.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Historical fills: mark seen, never classify.
    Snapshot(Vec<FillRecord>),
    Fills(Vec<FillRecord>),
    ConnectionLost(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("bad url: {0}")]
    Url(#[from] url::ParseError),
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unexpected status {code}: {body}")]
    Status { code: u16, body: String },
    #[error("connect timeout after {0:?}")]
    ConnectTimeout(std::time::Duration),
    #[error("no subscribe response after {0:?}")]
    SubscribeTimeout(std::time::Duration),
    #[error("heartbeat timeout after {0:?}")]
    HeartbeatTimeout(std::time::Duration),
    #[error("connection closed by server")]
    Closed,
}

// ---- Notifications ----
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoticeKind { EventDetected, ActionSucceeded, ActionFailed, StartupSummary }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Notice {
    EventDetected(CloseEvent),
    ActionSucceeded { subject: String, params: ActionParams, receipt: ActionReceipt },
    ActionFailed { subject: String, reason: String },
    StartupSummary(StartupSummary),
}

impl Notice {
    pub fn kind(&self) -> NoticeKind {
        match self {
            Notice::EventDetected(_) => NoticeKind::EventDetected,
            Notice::ActionSucceeded { .. } => NoticeKind::ActionSucceeded,
            Notice::ActionFailed { .. } => NoticeKind::ActionFailed,
            Notice::StartupSummary(_) => NoticeKind::StartupSummary,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartupSummary {
    pub monitor_address: String,
    pub feed_mode: String,
    pub venue_mode: String,
    pub leverage: u32,
    pub margin: Decimal,
    pub trading_pairs: Vec<(String, String)>,
    pub opened_subjects: Vec<String>,
    pub watched: Option<AccountSummary>,
    pub venue_account: Option<AccountSummary>,
}

// ---- Account / position views (status + startup) ----
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionView {
    pub symbol: String,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub leverage: String,
    pub unrealized_pnl: Decimal,
    pub liquidation_price: Option<Decimal>,
}

impl PositionView {
    pub fn side(&self) -> &'static str { if self.size.is_sign_negative() { "short" } else { "long" } }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSummary {
    pub account_value: Decimal,
    pub margin_used: Decimal,
    pub positions: Vec<PositionView>,
}

impl AccountSummary {
    pub fn available(&self) -> Decimal { self.account_value - self.margin_used }
}

/// Baris audit untuk recorder JSONL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Close(CloseEvent),
    Action { subject: String, ok: bool, reference: Option<String>, note: String },
    Notice(Notice),
    Note(String),
}
