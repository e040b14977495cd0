// ===============================
// src/classifier.rs
// ===============================
use ahash::AHashSet as HashSet;

use crate::domain::{CloseEvent, Direction, FillRecord};

/// Decides whether a fill closed a long position on a tracked coin.
#[derive(Debug, Clone)]
pub struct Classifier {
    tracked: HashSet<String>,
}

impl Classifier {
    pub fn new<I, S>(tracked: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self { tracked: tracked.into_iter().map(|s| s.as_ref().to_ascii_uppercase()).collect() }
    }

    pub fn is_tracked(&self, subject: &str) -> bool { self.tracked.contains(subject) }

    /// Sorted, for logs.
    pub fn tracked(&self) -> Vec<&str> {
        let mut v: Vec<&str> = self.tracked.iter().map(String::as_str).collect();
        v.sort_unstable();
        v
    }

    /// Upstream sends an exact zero for fills that did not close anything, so
    /// the check is on the decimal value, no tolerance.
    pub fn classify(&self, fill: &FillRecord) -> Option<CloseEvent> {
        if fill.direction != Direction::Sell { return None; }
        if fill.realized_pnl.is_zero() { return None; }
        if !self.is_tracked(&fill.subject) { return None; }
        Some(CloseEvent { fill: fill.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn fill(id: &str, subject: &str, direction: Direction, pnl: &str) -> FillRecord {
        FillRecord {
            id: id.into(),
            subject: subject.into(),
            direction,
            realized_pnl: Decimal::from_str(pnl).unwrap(),
            size: Decimal::from_str("2.0").unwrap(),
            price: Decimal::from_str("3100.00").unwrap(),
            timestamp_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn sell_with_pnl_on_tracked_coin_is_close_event() {
        let c = Classifier::new(["ETH", "btc"]);
        let ev = c.classify(&fill("f1", "ETH", Direction::Sell, "125.40")).unwrap();
        assert_eq!(ev.subject(), "ETH");
        assert!(c.classify(&fill("f2", "BTC", Direction::Sell, "-3.1")).is_some());
    }

    #[test]
    fn buy_zero_pnl_or_untracked_is_ignored() {
        let c = Classifier::new(["ETH", "BTC"]);
        assert!(c.classify(&fill("a", "ETH", Direction::Buy, "125.40")).is_none());
        assert!(c.classify(&fill("b", "ETH", Direction::Sell, "0")).is_none());
        assert!(c.classify(&fill("c", "ETH", Direction::Sell, "0.000")).is_none());
        assert!(c.classify(&fill("d", "SOL", Direction::Sell, "10")).is_none());
    }
}
