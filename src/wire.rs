// ===============================
// src/wire.rs
// ===============================
//
// Hyperliquid wire shapes (info HTTP + websocket) dan satu-satunya jalan
// masuk ke domain: `canonicalize`. Tidak ada shape mentah yang lewat dari sini.
//
// Contoh fill:
// {"coin":"ETH","px":"3100.0","sz":"2.0","side":"A","time":1700000000000,
//  "dir":"Close Long","closedPnl":"125.4","hash":"0x..","oid":91,"tid":77}
//

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::{AccountSummary, Direction, FillRecord, PositionView};

#[derive(Debug, Clone, Deserialize)]
pub struct RawFill {
    #[serde(default)]
    pub coin: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub px: Value,
    #[serde(default)]
    pub sz: Value,
    #[serde(rename = "closedPnl", default)]
    pub closed_pnl: Value,
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub tid: Value,
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum CanonError {
    #[error("fill has no id")]
    MissingId,
    #[error("fill has no coin")]
    MissingCoin,
    #[error("unknown side {0:?}")]
    Side(String),
    #[error("bad decimal in {field}: {raw}")]
    Decimal { field: &'static str, raw: String },
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn decimal(field: &'static str, v: &Value, default_zero: bool) -> Result<Decimal, CanonError> {
    match scalar_string(v) {
        Some(raw) => Decimal::from_str(&raw)
            .or_else(|_| Decimal::from_scientific(&raw))
            .map_err(|_| CanonError::Decimal { field, raw }),
        None if default_zero => Ok(Decimal::ZERO),
        None => Err(CanonError::Decimal { field, raw: v.to_string() }),
    }
}

/// Raw upstream fill -> FillRecord.
pub fn canonicalize(raw: &RawFill) -> Result<FillRecord, CanonError> {
    let id = scalar_string(&raw.tid)
        .or_else(|| raw.hash.clone().filter(|h| !h.is_empty()))
        .ok_or(CanonError::MissingId)?;
    let subject = raw.coin.trim().to_ascii_uppercase();
    if subject.is_empty() {
        return Err(CanonError::MissingCoin);
    }
    // 'A' = ask (jual), 'B' = bid (beli)
    let direction = match raw.side.as_str() {
        "A" | "a" | "SELL" | "Sell" | "sell" => Direction::Sell,
        "B" | "b" | "BUY" | "Buy" | "buy" => Direction::Buy,
        other => return Err(CanonError::Side(other.to_string())),
    };
    Ok(FillRecord {
        id,
        subject,
        direction,
        realized_pnl: decimal("closedPnl", &raw.closed_pnl, true)?,
        size: decimal("sz", &raw.sz, false)?,
        price: decimal("px", &raw.px, false)?,
        timestamp_ms: raw.time,
    })
}

/// Canonicalize a batch, dropping (and logging) fills that do not parse.
pub fn canonicalize_batch(raws: &[RawFill]) -> Vec<FillRecord> {
    raws.iter()
        .filter_map(|r| match canonicalize(r) {
            Ok(f) => Some(f),
            Err(e) => {
                tracing::warn!(error = %e, coin = %r.coin, "dropping malformed fill");
                None
            }
        })
        .collect()
}

// ---- Websocket ----

#[derive(Debug, Serialize)]
pub struct Subscribe<'a> {
    pub method: &'static str,
    pub subscription: Subscription<'a>,
}

#[derive(Debug, Serialize)]
pub struct Subscription<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub user: &'a str,
}

pub fn subscribe_user_fills(user: &str) -> Subscribe<'_> {
    Subscribe { method: "subscribe", subscription: Subscription { kind: "userFills", user } }
}

pub const PING: &str = r#"{"method":"ping"}"#;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct UserFillsData {
    #[serde(rename = "isSnapshot", default)]
    is_snapshot: bool,
    #[serde(default)]
    fills: Vec<RawFill>,
}

#[derive(Debug)]
pub enum WsMessage {
    SubscriptionAck(Value),
    Snapshot(Vec<FillRecord>),
    Live(Vec<FillRecord>),
    Pong,
    Error(String),
    Other(String),
}

/// Dispatch on the `channel` discriminator.
pub fn parse_ws_message(text: &str) -> Result<WsMessage, serde_json::Error> {
    let env: Envelope = serde_json::from_str(text)?;
    Ok(match env.channel.as_str() {
        "subscriptionResponse" => WsMessage::SubscriptionAck(env.data),
        "userFills" => {
            let d: UserFillsData = serde_json::from_value(env.data)?;
            let fills = canonicalize_batch(&d.fills);
            if d.is_snapshot { WsMessage::Snapshot(fills) } else { WsMessage::Live(fills) }
        }
        "pong" => WsMessage::Pong,
        "error" => WsMessage::Error(env.data.to_string()),
        other => WsMessage::Other(other.to_string()),
    })
}

// ---- Info HTTP ----

#[derive(Debug, Serialize)]
pub struct InfoRequest<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub user: &'a str,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClearinghouseState {
    #[serde(rename = "assetPositions", default)]
    pub asset_positions: Vec<AssetPosition>,
    #[serde(rename = "marginSummary", default)]
    pub margin_summary: MarginSummary,
}

#[derive(Debug, Deserialize)]
pub struct AssetPosition { pub position: RawPosition }

#[derive(Debug, Deserialize)]
pub struct RawPosition {
    #[serde(default)]
    pub coin: String,
    #[serde(default)]
    pub szi: Value,
    #[serde(rename = "entryPx", default)]
    pub entry_px: Value,
    #[serde(default)]
    pub leverage: Value,
    #[serde(rename = "unrealizedPnl", default)]
    pub unrealized_pnl: Value,
    #[serde(rename = "liquidationPx", default)]
    pub liquidation_px: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct MarginSummary {
    #[serde(rename = "accountValue", default)]
    pub account_value: Value,
    #[serde(rename = "totalMarginUsed", default)]
    pub total_margin_used: Value,
}

fn lenient(v: &Value) -> Decimal {
    decimal("", v, true).unwrap_or(Decimal::ZERO)
}

impl ClearinghouseState {
    /// Only positions with non-zero size.
    pub fn summary(&self) -> AccountSummary {
        let positions = self
            .asset_positions
            .iter()
            .map(|a| &a.position)
            .filter_map(|p| {
                let size = lenient(&p.szi);
                if size.is_zero() {
                    return None;
                }
                let leverage = p
                    .leverage
                    .get("value")
                    .and_then(scalar_string)
                    .unwrap_or_else(|| "?".to_string());
                Some(PositionView {
                    symbol: p.coin.clone(),
                    size,
                    entry_price: lenient(&p.entry_px),
                    leverage,
                    unrealized_pnl: lenient(&p.unrealized_pnl),
                    liquidation_price: scalar_string(&p.liquidation_px).and_then(|s| Decimal::from_str(&s).ok()),
                })
            })
            .collect();
        AccountSummary {
            account_value: lenient(&self.margin_summary.account_value),
            margin_used: lenient(&self.margin_summary.total_margin_used),
            positions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn raw(json: &str) -> RawFill {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn canonicalizes_ask_side_as_sell() {
        let f = canonicalize(&raw(
            r#"{"coin":"eth","px":"3100.00","sz":"2.0","side":"A","time":1700000000000,"closedPnl":"125.40","tid":77}"#,
        ))
        .unwrap();
        assert_eq!(f.id, "77");
        assert_eq!(f.subject, "ETH");
        assert_eq!(f.direction, Direction::Sell);
        assert_eq!(f.realized_pnl, Decimal::from_str("125.40").unwrap());
        assert_eq!(f.price, Decimal::from_str("3100").unwrap());
    }

    #[test]
    fn missing_closed_pnl_is_zero() {
        let f = canonicalize(&raw(r#"{"coin":"BTC","px":"1","sz":"1","side":"B","tid":"x1"}"#)).unwrap();
        assert_eq!(f.direction, Direction::Buy);
        assert!(f.realized_pnl.is_zero());
    }

    #[test]
    fn rejects_fill_without_id_or_side() {
        assert_eq!(
            canonicalize(&raw(r#"{"coin":"BTC","px":"1","sz":"1","side":"B"}"#)),
            Err(CanonError::MissingId)
        );
        assert!(matches!(
            canonicalize(&raw(r#"{"coin":"BTC","px":"1","sz":"1","side":"Z","tid":1}"#)),
            Err(CanonError::Side(_))
        ));
    }

    #[test]
    fn batch_skips_malformed() {
        let raws: Vec<RawFill> = serde_json::from_str(
            r#"[{"coin":"BTC","px":"1","sz":"1","side":"B","tid":1},
                {"coin":"BTC","px":"oops","sz":"1","side":"B","tid":2}]"#,
        )
        .unwrap();
        let out = canonicalize_batch(&raws);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "1");
    }

    #[test]
    fn parses_ws_channels() {
        let snap = r#"{"channel":"userFills","data":{"isSnapshot":true,"user":"0xabc","fills":[
            {"coin":"ETH","px":"1","sz":"1","side":"A","closedPnl":"2","tid":1}]}}"#;
        match parse_ws_message(snap).unwrap() {
            WsMessage::Snapshot(f) => assert_eq!(f.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
        let live = r#"{"channel":"userFills","data":{"user":"0xabc","fills":[]}}"#;
        assert!(matches!(parse_ws_message(live).unwrap(), WsMessage::Live(f) if f.is_empty()));
        assert!(matches!(parse_ws_message(r#"{"channel":"pong"}"#).unwrap(), WsMessage::Pong));
        assert!(matches!(
            parse_ws_message(r#"{"channel":"subscriptionResponse","data":{"method":"subscribe"}}"#).unwrap(),
            WsMessage::SubscriptionAck(_)
        ));
        assert!(parse_ws_message("not json").is_err());
    }

    #[test]
    fn subscribe_message_shape() {
        let json = serde_json::to_string(&subscribe_user_fills("0xabc")).unwrap();
        assert_eq!(json, r#"{"method":"subscribe","subscription":{"type":"userFills","user":"0xabc"}}"#);
    }

    #[test]
    fn clearinghouse_summary_skips_flat_positions() {
        let st: ClearinghouseState = serde_json::from_str(
            r#"{"assetPositions":[
                {"position":{"coin":"ETH","szi":"-1.5","entryPx":"3000","leverage":{"type":"cross","value":20},"unrealizedPnl":"12.5","liquidationPx":"3500"}},
                {"position":{"coin":"BTC","szi":"0.0","entryPx":"60000","leverage":{"value":5},"unrealizedPnl":"0"}}],
              "marginSummary":{"accountValue":"1000","totalMarginUsed":"250"}}"#,
        )
        .unwrap();
        let s = st.summary();
        assert_eq!(s.positions.len(), 1);
        assert_eq!(s.positions[0].side(), "short");
        assert_eq!(s.positions[0].leverage, "20");
        assert_eq!(s.available(), Decimal::from(750));
    }
}
