// ===============================
// src/binance.rs
// ===============================
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub fn timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn sign_query(secret: &str, query: &str) -> Result<String, hmac::digest::InvalidLength> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())?;
    mac.update(query.as_bytes());
    let sig = mac.finalize().into_bytes();
    Ok(hex::encode(sig))
}

pub fn encode_params(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

// --- Model minimal untuk USDⓈ-M futures REST ---
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

#[derive(Debug, Deserialize)]
pub struct TickerPrice {
    pub price: String,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub filters: Vec<serde_json::Value>,
}

impl SymbolInfo {
    pub fn lot_step(&self) -> Option<String> {
        self.filters
            .iter()
            .find(|f| f.get("filterType").and_then(|x| x.as_str()) == Some("LOT_SIZE"))
            .and_then(|f| f.get("stepSize"))
            .and_then(|x| x.as_str())
            .map(str::to_string)
    }
}

#[derive(Debug, Deserialize)]
pub struct OrderResponse {
    #[serde(rename = "orderId")] pub order_id: i64,
    #[serde(rename = "executedQty", default)] pub executed_qty: String,
    #[serde(rename = "avgPrice", default)] pub avg_price: String,
    #[serde(default)] pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct BalanceEntry {
    pub asset: String,
    pub balance: String,
    #[serde(rename = "availableBalance", default)] pub available_balance: String,
}

#[derive(Debug, Deserialize)]
pub struct PositionRisk {
    pub symbol: String,
    #[serde(rename = "positionAmt")] pub position_amt: String,
    #[serde(rename = "entryPrice", default)] pub entry_price: String,
    #[serde(rename = "unRealizedProfit", default)] pub unrealized_profit: String,
    #[serde(rename = "liquidationPrice", default)] pub liquidation_price: String,
    #[serde(default)] pub leverage: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signs_like_binance_docs() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_query(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn finds_lot_size_step() {
        let info: ExchangeInfo = serde_json::from_str(
            r#"{"symbols":[{"symbol":"ETHUSDC","filters":[
                {"filterType":"PRICE_FILTER","tickSize":"0.01"},
                {"filterType":"LOT_SIZE","stepSize":"0.001","minQty":"0.001"}]}]}"#,
        )
        .unwrap();
        assert_eq!(info.symbols[0].lot_step().as_deref(), Some("0.001"));
    }
}
