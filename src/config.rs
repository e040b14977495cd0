// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : close_watch — idempotent close-long follower in Rust
Module  : config.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Watches a Hyperliquid address (websocket or polling) for fills that
          close a long, deduplicates them, and opens exactly one short per
          coin on Binance futures, guarded by a durable trade-state file.
          Exposes Prometheus metrics, Telegram notices and JSONL records.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::env;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;
use rust_decimal::Decimal;
use thiserror::Error;

/// Sumber fill Hyperliquid
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedMode {
    Ws,
    Poll,
}

impl FeedMode {
    pub fn from_env(key: &str, default_mode: FeedMode) -> FeedMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "ws" | "websocket" => FeedMode::Ws,
            "poll" | "http"    => FeedMode::Poll,
            _ => default_mode,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Ws => "ws",
            FeedMode::Poll => "poll",
        }
    }
}

/// Venue eksekusi (tempat short dibuka)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VenueMode {
    Mock,
    BinanceTestnet,
    BinanceMainnet,
}

impl VenueMode {
    pub fn from_env(key: &str, default_mode: VenueMode) -> VenueMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "mock"            => VenueMode::Mock,
            "binance_testnet" => VenueMode::BinanceTestnet,
            "binance_mainnet" => VenueMode::BinanceMainnet,
            _ => default_mode,
        }
    }

    // Endpoint default per mode (USDⓈ-M futures)
    pub fn default_rest_url(&self) -> &'static str {
        match self {
            VenueMode::Mock           => "https://testnet.binancefuture.com", // tidak dipakai saat mock
            VenueMode::BinanceTestnet => "https://testnet.binancefuture.com",
            VenueMode::BinanceMainnet => "https://fapi.binance.com",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VenueMode::Mock => "mock",
            VenueMode::BinanceTestnet => "binance_testnet",
            VenueMode::BinanceMainnet => "binance_mainnet",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("MONITOR_ADDRESS is not set")]
    MissingAddress,
    #[error("TRADING_PAIRS is empty")]
    NoPairs,
    #[error("BINANCE_API_KEY / BINANCE_API_SECRET missing for {0}")]
    MissingBinanceKeys(&'static str),
    #[error("bad value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Clone, Debug)]
pub struct Telegram {
    pub enabled: bool,
    pub bot_token: String,
    pub chat_id: String,
}

impl Telegram {
    /// Token/chat id kosong atau masih placeholder -> notifikasi dimatikan.
    pub fn usable(&self) -> bool {
        self.enabled
            && !self.bot_token.is_empty()
            && !self.bot_token.starts_with("your_")
            && !self.chat_id.is_empty()
            && !self.chat_id.starts_with("your_")
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    // watched account
    pub monitor_address: String,
    pub feed_mode: FeedMode,
    pub hl_api_url: String,
    pub hl_ws_url: String,

    // polling
    pub scan_interval: Duration,
    pub user_fills_limit: usize,
    pub api_min_interval: Duration,
    pub rate_limit_cooldown: Duration,

    // streaming
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
    pub reconnect_delay: Duration,

    // status task
    pub position_print_interval: Duration,

    // action
    pub trading_pairs: Vec<(String, String)>, // coin -> venue symbol
    pub leverage: u32,
    pub margin: Decimal,

    // venue
    pub venue_mode: VenueMode,
    pub binance_rest_url: String,
    pub binance_api_key: String,
    pub binance_api_secret: String,
    pub binance_recv_window: u64,

    // files/metrics/notices
    pub trade_state_file: String,
    pub record_file: Option<String>,
    pub metrics_port: u16,
    pub log_level: String,
    pub telegram: Telegram,
}

impl Args {
    pub fn tracked_subjects(&self) -> Vec<String> {
        self.trading_pairs.iter().map(|(c, _)| c.clone()).collect()
    }

    #[cfg(test)]
    pub fn symbol_for(&self, coin: &str) -> Option<&str> {
        self.trading_pairs.iter().find(|(c, _)| c == coin).map(|(_, s)| s.as_str())
    }

    /// Checks needed only by `run` (admin commands work without them).
    pub fn validate_for_run(&self) -> Result<(), ConfigError> {
        if self.monitor_address.is_empty() {
            return Err(ConfigError::MissingAddress);
        }
        if self.trading_pairs.is_empty() {
            return Err(ConfigError::NoPairs);
        }
        // tokio interval panik untuk period nol
        for (key, d) in [
            ("SCAN_INTERVAL_SECS", self.scan_interval),
            ("HEARTBEAT_INTERVAL_SECS", self.heartbeat_interval),
            ("PONG_TIMEOUT_SECS", self.pong_timeout),
        ] {
            if d.is_zero() {
                return Err(ConfigError::Invalid { key, value: "0".into() });
            }
        }
        if self.leverage == 0 {
            return Err(ConfigError::Invalid { key: "LEVERAGE", value: "0".into() });
        }
        if self.margin <= Decimal::ZERO {
            return Err(ConfigError::Invalid { key: "POSITION_SIZE_USDC", value: self.margin.to_string() });
        }
        if self.venue_mode != VenueMode::Mock
            && (self.binance_api_key.is_empty() || self.binance_api_key.starts_with("your_") || self.binance_api_secret.is_empty())
        {
            return Err(ConfigError::MissingBinanceKeys(self.venue_mode.as_str()));
        }
        Ok(())
    }
}

/// `ETH:ETHUSDC,BTC:BTCUSDC` -> [("ETH","ETHUSDC"),("BTC","BTCUSDC")]
pub fn parse_pairs(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    let mut out: Vec<(String, String)> = Vec::new();
    for item in raw.split(',').map(|x| x.trim()).filter(|x| !x.is_empty()) {
        let (coin, symbol) = item
            .split_once(':')
            .map(|(c, s)| (c.trim().to_ascii_uppercase(), s.trim().to_ascii_uppercase()))
            .filter(|(c, s)| !c.is_empty() && !s.is_empty())
            .ok_or_else(|| ConfigError::Invalid { key: "TRADING_PAIRS", value: item.to_string() })?;
        if !out.iter().any(|(c, _)| *c == coin) {
            out.push((coin, symbol));
        }
    }
    Ok(out)
}

fn env_num<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_num(key, default))
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

pub fn load() -> Result<Args, ConfigError> {
    // Pastikan .env dibaca (agar MONITOR_ADDRESS, BINANCE_*, dll ter-load)
    let _ = dotenv();

    // ===== Watched account =====
    let monitor_address = env::var("MONITOR_ADDRESS").unwrap_or_default().trim().to_ascii_lowercase();
    let feed_mode  = FeedMode::from_env("FEED_MODE", FeedMode::Ws);
    let hl_api_url = env::var("HL_API_URL").unwrap_or_else(|_| "https://api.hyperliquid.xyz/info".to_string());
    let hl_ws_url  = env::var("HL_WS_URL").unwrap_or_else(|_| "wss://api.hyperliquid.xyz/ws".to_string());

    // ===== Action =====
    let trading_pairs = parse_pairs(
        &env::var("TRADING_PAIRS").unwrap_or_else(|_| "ETH:ETHUSDC,BTC:BTCUSDC".to_string()),
    )?;
    let margin_raw = env::var("POSITION_SIZE_USDC").unwrap_or_else(|_| "50".to_string());
    let margin = Decimal::from_str(margin_raw.trim())
        .map_err(|_| ConfigError::Invalid { key: "POSITION_SIZE_USDC", value: margin_raw.clone() })?;

    // ===== Venue =====
    let venue_mode = VenueMode::from_env("VENUE_MODE", VenueMode::Mock);
    let binance_rest_url = env::var("BINANCE_REST_URL")
        .unwrap_or_else(|_| venue_mode.default_rest_url().to_string());

    let args = Args {
        monitor_address,
        feed_mode,
        hl_api_url,
        hl_ws_url,
        scan_interval: env_secs("SCAN_INTERVAL_SECS", 5),
        user_fills_limit: env_num("USER_FILLS_LIMIT", 20),
        api_min_interval: Duration::from_millis(env_num("API_MIN_INTERVAL_MS", 200)),
        rate_limit_cooldown: env_secs("RATE_LIMIT_COOLDOWN_SECS", 5),
        heartbeat_interval: env_secs("HEARTBEAT_INTERVAL_SECS", 20),
        pong_timeout: env_secs("PONG_TIMEOUT_SECS", 10),
        reconnect_delay: env_secs("RECONNECT_DELAY_SECS", 5),
        position_print_interval: env_secs("POSITION_PRINT_INTERVAL_SECS", 300),
        trading_pairs,
        leverage: env_num("LEVERAGE", 100),
        margin,
        venue_mode,
        binance_rest_url,
        binance_api_key: env::var("BINANCE_API_KEY").unwrap_or_default(),
        binance_api_secret: env::var("BINANCE_API_SECRET").unwrap_or_default(),
        binance_recv_window: env_num("BINANCE_RECV_WINDOW", 5000),
        trade_state_file: env::var("TRADE_STATE_FILE").unwrap_or_else(|_| "trade_state.json".to_string()),
        record_file: env::var("RECORD_FILE").ok().filter(|s| !s.trim().is_empty()),
        metrics_port: env_num("METRICS_PORT", 9898),
        log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        telegram: Telegram {
            enabled: env_bool("TELEGRAM_ENABLED", false),
            bot_token: env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default(),
            chat_id: env::var("TELEGRAM_CHAT_ID").unwrap_or_default(),
        },
    };
    Ok(args)
}

/// Baseline Args for unit tests (mock venue, ETH/BTC pairs).
#[cfg(test)]
pub fn test_args() -> Args {
    Args {
        monitor_address: "0xabc".into(),
        feed_mode: FeedMode::Ws,
        hl_api_url: "http://127.0.0.1:9/info".into(),
        hl_ws_url: "ws://127.0.0.1:9/ws".into(),
        scan_interval: Duration::from_secs(5),
        user_fills_limit: 20,
        api_min_interval: Duration::from_millis(200),
        rate_limit_cooldown: Duration::from_secs(5),
        heartbeat_interval: Duration::from_secs(20),
        pong_timeout: Duration::from_secs(10),
        reconnect_delay: Duration::from_secs(5),
        position_print_interval: Duration::from_secs(300),
        trading_pairs: vec![("ETH".into(), "ETHUSDC".into()), ("BTC".into(), "BTCUSDC".into())],
        leverage: 100,
        margin: Decimal::from(50),
        venue_mode: VenueMode::Mock,
        binance_rest_url: VenueMode::Mock.default_rest_url().into(),
        binance_api_key: String::new(),
        binance_api_secret: String::new(),
        binance_recv_window: 5000,
        trade_state_file: "trade_state.json".into(),
        record_file: None,
        metrics_port: 0,
        log_level: "info".into(),
        telegram: Telegram { enabled: false, bot_token: String::new(), chat_id: String::new() },
    }
}
