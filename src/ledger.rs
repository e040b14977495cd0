// ===============================
// src/ledger.rs
// ===============================
//
// Set fill id yang sudah pernah dilihat. Hanya tumbuh selama proses hidup;
// tidak dipersist (guard lintas restart ada di trade_state).
//
use std::sync::Mutex;

use ahash::AHashSet as HashSet;

#[derive(Debug, Default)]
pub struct DedupLedger {
    seen: Mutex<HashSet<String>>,
}

impl DedupLedger {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // set of strings stays consistent even if a holder panicked
        self.seen.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn seen(&self, id: &str) -> bool { self.lock().contains(id) }

    pub fn mark_seen(&self, id: &str) { self.lock().insert(id.to_string()); }

    /// Check-and-mark in one critical section. `true` if the id was new.
    pub fn insert_if_new(&self, id: &str) -> bool { self.lock().insert(id.to_string()) }

    /// Jumlah id yang sudah tercatat.
    pub fn seen_count(&self) -> usize { self.lock().len() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_and_reports_seen() {
        let l = DedupLedger::new();
        assert!(!l.seen("f1"));
        l.mark_seen("f1");
        assert!(l.seen("f1"));
        assert!(!l.insert_if_new("f1"));
        assert!(l.insert_if_new("f2"));
        assert_eq!(l.seen_count(), 2);
    }
}
