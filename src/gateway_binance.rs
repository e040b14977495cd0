// ===============================
// src/gateway_binance.rs
// ===============================
//
// Binance USDⓈ-M futures: buka short MARKET per coin.
// Urutan: margin CROSSED -> leverage -> harga ticker -> LOT_SIZE -> order.
//
use std::str::FromStr;

use async_trait::async_trait;
use rand::Rng;
use reqwest::Method;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::de::DeserializeOwned;
use tracing::{error, info, warn};

use crate::binance::{
    encode_params, sign_query, timestamp_ms, ApiErrorBody, BalanceEntry, ExchangeInfo, OrderResponse,
    PositionRisk, TickerPrice,
};
use crate::domain::{AccountSummary, ActionParams, ActionReceipt, PositionView};
use crate::gateway::{ActionError, ActionExecutor};

// -4046: "No need to change margin type."
const NO_NEED_TO_CHANGE_MARGIN: i64 = -4046;

pub struct BinanceFutures {
    http: reqwest::Client,
    rest_base: String,
    api_key: String,
    api_sec: String,
    recv_window: u64,
    pairs: Vec<(String, String)>,
}

/// Quantity = margin * leverage / price, floored to the lot step.
pub fn order_quantity(params: &ActionParams, price: Decimal, step: Decimal) -> Option<Decimal> {
    if price <= Decimal::ZERO || step <= Decimal::ZERO {
        return None;
    }
    let raw = params.notional().checked_div(price)?;
    let steps = (raw / step).round_dp_with_strategy(0, RoundingStrategy::ToZero);
    let qty = (steps * step).normalize();
    if qty.is_zero() { None } else { Some(qty) }
}

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or(Decimal::ZERO)
}

impl BinanceFutures {
    pub fn new(
        rest_base: String,
        api_key: String,
        api_sec: String,
        recv_window: u64,
        pairs: Vec<(String, String)>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            rest_base: rest_base.trim_end_matches('/').to_string(),
            api_key,
            api_sec,
            recv_window,
            pairs,
        }
    }

    fn symbol_for(&self, subject: &str) -> Result<String, ActionError> {
        self.pairs
            .iter()
            .find(|(c, _)| c == subject)
            .map(|(_, s)| s.clone())
            .ok_or_else(|| ActionError::UnknownSubject(subject.to_string()))
    }

    async fn decode<T: DeserializeOwned>(step: &'static str, rsp: reqwest::Response) -> Result<T, ActionError> {
        let code = rsp.status();
        let body = rsp.text().await?;
        if !code.is_success() {
            return Err(ActionError::Rejected { step, code: code.as_u16(), body });
        }
        serde_json::from_str(&body).map_err(|source| ActionError::Decode { step, source })
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        step: &'static str,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<T, ActionError> {
        params.push(("timestamp", timestamp_ms().to_string()));
        params.push(("recvWindow", self.recv_window.to_string()));
        let query = encode_params(&params);
        let sig = sign_query(&self.api_sec, &query).map_err(|e| ActionError::Invalid(e.to_string()))?;
        let url = format!("{}{}?{}&signature={}", self.rest_base, path, query, sig);
        let rsp = self.http.request(method, url).header("X-MBX-APIKEY", &self.api_key).send().await?;
        Self::decode(step, rsp).await
    }

    async fn set_margin_type(&self, symbol: &str) -> Result<(), ActionError> {
        let params = vec![("symbol", symbol.to_string()), ("marginType", "CROSSED".to_string())];
        match self.signed::<serde_json::Value>("marginType", Method::POST, "/fapi/v1/marginType", params).await {
            Ok(_) => Ok(()),
            Err(ActionError::Rejected { step, code, body }) => match serde_json::from_str::<ApiErrorBody>(&body) {
                Ok(api) if api.code == NO_NEED_TO_CHANGE_MARGIN => {
                    info!(%symbol, msg = %api.msg, "margin already CROSSED");
                    Ok(())
                }
                _ => Err(ActionError::Rejected { step, code, body }),
            },
            Err(e) => Err(e),
        }
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ActionError> {
        let params = vec![("symbol", symbol.to_string()), ("leverage", leverage.to_string())];
        let _: serde_json::Value = self.signed("leverage", Method::POST, "/fapi/v1/leverage", params).await?;
        info!(%symbol, leverage, "leverage set");
        Ok(())
    }

    async fn ticker_price(&self, symbol: &str) -> Result<Decimal, ActionError> {
        let url = format!("{}/fapi/v1/ticker/price?symbol={}", self.rest_base, urlencoding::encode(symbol));
        let t: TickerPrice = Self::decode("ticker", self.http.get(url).send().await?).await?;
        Decimal::from_str(&t.price).map_err(|_| ActionError::Invalid(format!("bad ticker price {}", t.price)))
    }

    async fn lot_step(&self, symbol: &str) -> Result<Decimal, ActionError> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.rest_base);
        let info: ExchangeInfo = Self::decode("exchangeInfo", self.http.get(url).send().await?).await?;
        info.symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .and_then(|s| s.lot_step())
            .and_then(|s| Decimal::from_str(&s).ok())
            .ok_or_else(|| ActionError::Invalid(format!("no LOT_SIZE for {symbol}")))
    }
}

#[async_trait]
impl ActionExecutor for BinanceFutures {
    async fn execute_action(&self, subject: &str, params: ActionParams) -> Result<ActionReceipt, ActionError> {
        let symbol = self.symbol_for(subject)?;
        info!(%subject, %symbol, leverage = params.leverage, margin = %params.margin, notional = %params.notional(), "opening short");

        // margin type gagal bukan alasan batal; leverage gagal = batal
        if let Err(e) = self.set_margin_type(&symbol).await {
            warn!(%symbol, error = %e, "set margin type failed, continuing");
        }
        self.set_leverage(&symbol, params.leverage).await?;

        let price = self.ticker_price(&symbol).await?;
        let step = self.lot_step(&symbol).await?;
        let qty = order_quantity(&params, price, step)
            .ok_or_else(|| ActionError::Invalid(format!("quantity rounds to zero (price {price}, step {step})")))?;
        info!(%symbol, %price, %step, %qty, "computed order quantity");

        let cl_id = format!("cw-{}-{}", timestamp_ms(), rand::thread_rng().gen::<u32>());
        let order_params = vec![
            ("symbol", symbol.clone()),
            ("side", "SELL".to_string()),
            ("positionSide", "SHORT".to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", qty.to_string()),
            ("newClientOrderId", cl_id),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        let order: OrderResponse = match self.signed("order", Method::POST, "/fapi/v1/order", order_params).await {
            Ok(o) => o,
            Err(e) => {
                error!(%symbol, error = %e, "order send failed");
                return Err(e);
            }
        };

        let avg = dec(&order.avg_price);
        let filled = dec(&order.executed_qty);
        info!(%symbol, order_id = order.order_id, status = %order.status, %filled, avg_price = %avg, "short order accepted");
        Ok(ActionReceipt {
            reference: order.order_id.to_string(),
            symbol,
            filled_qty: if filled.is_zero() { qty } else { filled },
            avg_price: if avg.is_zero() { None } else { Some(avg) },
        })
    }

    async fn account_summary(&self) -> Option<AccountSummary> {
        let balances: Vec<BalanceEntry> =
            match self.signed("balance", Method::GET, "/fapi/v2/balance", Vec::new()).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "binance balance query failed");
                    return None;
                }
            };
        let positions: Vec<PositionRisk> = self
            .signed("positionRisk", Method::GET, "/fapi/v2/positionRisk", Vec::new())
            .await
            .map_err(|e| warn!(error = %e, "binance position query failed"))
            .unwrap_or_default();

        // nilai akun = saldo stable quote (USDT + USDC)
        let (account_value, available) = balances
            .iter()
            .filter(|b| b.asset == "USDT" || b.asset == "USDC")
            .fold((Decimal::ZERO, Decimal::ZERO), |(v, a), b| (v + dec(&b.balance), a + dec(&b.available_balance)));

        Some(AccountSummary {
            account_value,
            margin_used: account_value - available,
            positions: positions
                .into_iter()
                .filter(|p| !dec(&p.position_amt).is_zero())
                .map(|p| PositionView {
                    size: dec(&p.position_amt),
                    entry_price: dec(&p.entry_price),
                    leverage: p.leverage.clone(),
                    unrealized_pnl: dec(&p.unrealized_profit),
                    liquidation_price: Some(dec(&p.liquidation_price)).filter(|x| !x.is_zero()),
                    symbol: p.symbol,
                })
                .collect(),
        })
    }

    fn venue(&self) -> &str {
        "binance_futures"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(leverage: u32, margin: i64) -> ActionParams {
        ActionParams { leverage, margin: Decimal::from(margin) }
    }

    #[test]
    fn quantity_floors_to_step() {
        // 50 * 100 / 3100 = 1.6129.. -> 1.612
        let q = order_quantity(&params(100, 50), Decimal::from(3100), Decimal::from_str("0.001").unwrap());
        assert_eq!(q, Some(Decimal::from_str("1.612").unwrap()));
    }

    #[test]
    fn quantity_below_step_is_none() {
        let q = order_quantity(&params(1, 1), Decimal::from(60000), Decimal::from_str("0.001").unwrap());
        assert_eq!(q, None);
        assert_eq!(order_quantity(&params(1, 1), Decimal::ZERO, Decimal::ONE), None);
    }

    #[test]
    fn unknown_coin_is_rejected_before_any_request() {
        let gw = BinanceFutures::new("http://127.0.0.1:1".into(), "k".into(), "s".into(), 5000, vec![]);
        assert!(matches!(gw.symbol_for("ETH"), Err(ActionError::UnknownSubject(_))));
    }
}
