// ===============================
// src/gateway.rs (action contract + paper venue)
// ===============================
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::time::{sleep, Duration};
use tracing::info;

use crate::domain::{AccountSummary, ActionParams, ActionReceipt};

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("no venue symbol configured for {0}")]
    UnknownSubject(String),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("venue rejected {step} ({code}): {body}")]
    Rejected { step: &'static str, code: u16, body: String },
    #[error("decode {step}: {source}")]
    Decode {
        step: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

/// Downstream action: open the follow-up position for `subject`.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute_action(&self, subject: &str, params: ActionParams) -> Result<ActionReceipt, ActionError>;

    /// Balances/positions for startup + status reporting. `None` when unsupported.
    async fn account_summary(&self) -> Option<AccountSummary> {
        None
    }

    fn venue(&self) -> &str;
}

/// Mock venue: ACK setelah delay, tidak ada order sungguhan.
pub struct PaperExecutor {
    pairs: Vec<(String, String)>,
    fill_delay: Duration,
    seq: AtomicU64,
}

impl PaperExecutor {
    pub fn new(pairs: Vec<(String, String)>, fill_delay: Duration) -> Self {
        Self { pairs, fill_delay, seq: AtomicU64::new(0) }
    }
}

#[async_trait]
impl ActionExecutor for PaperExecutor {
    async fn execute_action(&self, subject: &str, params: ActionParams) -> Result<ActionReceipt, ActionError> {
        let symbol = self
            .pairs
            .iter()
            .find(|(c, _)| c == subject)
            .map(|(_, s)| s.clone())
            .ok_or_else(|| ActionError::UnknownSubject(subject.to_string()))?;

        sleep(self.fill_delay).await;

        let n = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let reference = format!("PAPER-{}-{}", Utc::now().timestamp_millis(), n);
        info!(%subject, %symbol, leverage = params.leverage, margin = %params.margin, %reference, "paper short opened");
        Ok(ActionReceipt { reference, symbol, filled_qty: Decimal::ZERO, avg_price: None })
    }

    fn venue(&self) -> &str {
        "paper"
    }
}
