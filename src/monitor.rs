// ===============================
// src/monitor.rs
// ===============================
//
// Orchestrator: TransportEvent -> ledger -> classifier -> gate per coin.
//
//   Snapshot   : semua id ditandai seen, tidak pernah di-klasifikasi.
//   Fills      : id baru saja yang lanjut; close-long -> dispatch.
//   Dispatch   : lock per subject { is_opened? -> execute_action -> mark_opened }.
//                Coin berbeda jalan paralel (JoinSet), coin sama berurutan.
//
// Lock ledger / trade-state tidak pernah dipegang saat action berjalan.
//
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

use crate::classifier::Classifier;
use crate::domain::{ActionParams, CloseEvent, Event, FillRecord, Notice, TransportEvent};
use crate::gateway::ActionExecutor;
use crate::ledger::DedupLedger;
use crate::metrics::{ACTIONS, CLOSE_EVENTS, DUPLICATE_FILLS, PERSIST_FAILURES, SNAPSHOT_FILLS};
use crate::notifier::NoticeSink;
use crate::trade_state::TradeStateStore;

/// Hasil satu urutan gate (dipakai test + log).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Acted(String),
    AlreadyOpened,
    ActionFailed(String),
    PersistFailed(String),
}

pub struct Monitor {
    ledger: Arc<DedupLedger>,
    classifier: Classifier,
    state: Arc<TradeStateStore>,
    executor: Arc<dyn ActionExecutor>,
    params: ActionParams,
    notices: NoticeSink,
    recorder: Option<mpsc::Sender<Event>>,
    gates: Mutex<AHashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Monitor {
    pub fn new(
        ledger: Arc<DedupLedger>,
        classifier: Classifier,
        state: Arc<TradeStateStore>,
        executor: Arc<dyn ActionExecutor>,
        params: ActionParams,
        notices: NoticeSink,
        recorder: Option<mpsc::Sender<Event>>,
    ) -> Self {
        Self {
            ledger,
            classifier,
            state,
            executor,
            params,
            notices,
            recorder,
            gates: Mutex::new(AHashMap::new()),
        }
    }

    fn record(&self, ev: Event) {
        if let Some(tx) = &self.recorder {
            let _ = tx.try_send(ev);
        }
    }

    fn notify(&self, notice: Notice) {
        self.record(Event::Notice(notice.clone()));
        self.notices.send(notice);
    }

    fn gate_for(&self, subject: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(|p| p.into_inner());
        gates.entry(subject.to_string()).or_default().clone()
    }

    /// Marks every historical id as seen. Nothing is classified.
    pub fn absorb_snapshot(&self, fills: &[FillRecord]) {
        let mut fresh = 0usize;
        for f in fills {
            if !self.ledger.seen(&f.id) {
                self.ledger.mark_seen(&f.id);
                fresh += 1;
            }
        }
        SNAPSHOT_FILLS.inc_by(fills.len() as u64);
        info!(count = fills.len(), fresh, ledger = self.ledger.seen_count(), "snapshot absorbed, no actions");
    }

    /// Ledger then classifier. Returns the close events that still need the gate.
    pub fn screen(&self, fills: &[FillRecord]) -> Vec<CloseEvent> {
        let mut out = Vec::new();
        for f in fills {
            if !self.ledger.insert_if_new(&f.id) {
                DUPLICATE_FILLS.inc();
                debug!(id = %f.id, "duplicate fill dropped");
                continue;
            }
            if let Some(ev) = self.classifier.classify(f) {
                out.push(ev);
            }
        }
        out
    }

    /// Gate + action + commit, serialized per subject.
    pub async fn dispatch(&self, ev: CloseEvent) -> Dispatch {
        let subject = ev.subject().to_string();
        let gate = self.gate_for(&subject);
        let _held = gate.lock().await;

        if self.state.is_opened(&subject) {
            ACTIONS.with_label_values(&["skipped", &subject]).inc();
            info!(%subject, fill = %ev.fill.id, "position already opened, skip until reset");
            return Dispatch::AlreadyOpened;
        }

        let receipt = match self.executor.execute_action(&subject, self.params).await {
            Ok(r) => r,
            Err(e) => {
                ACTIONS.with_label_values(&["failed", &subject]).inc();
                error!(%subject, venue = self.executor.venue(), error = %e, "action failed");
                let reason = e.to_string();
                self.record(Event::Action { subject: subject.clone(), ok: false, reference: None, note: reason.clone() });
                self.notify(Notice::ActionFailed { subject, reason: reason.clone() });
                return Dispatch::ActionFailed(reason);
            }
        };

        // commit segera, sebelum apapun
        if let Err(e) = self.state.mark_opened(&subject, &receipt.reference) {
            PERSIST_FAILURES.inc();
            ACTIONS.with_label_values(&["ok", &subject]).inc();
            error!(%subject, reference = %receipt.reference, error = %e, "action succeeded but trade state NOT persisted");
            let reason = format!("order {} placed but state not saved: {e}", receipt.reference);
            self.record(Event::Action {
                subject: subject.clone(),
                ok: true,
                reference: Some(receipt.reference.clone()),
                note: reason.clone(),
            });
            self.notify(Notice::ActionFailed { subject, reason: reason.clone() });
            return Dispatch::PersistFailed(reason);
        }

        ACTIONS.with_label_values(&["ok", &subject]).inc();
        info!(%subject, reference = %receipt.reference, symbol = %receipt.symbol, qty = %receipt.filled_qty, "action succeeded, state committed");
        let reference = receipt.reference.clone();
        self.record(Event::Action { subject: subject.clone(), ok: true, reference: Some(reference.clone()), note: String::new() });
        self.notify(Notice::ActionSucceeded { subject, params: self.params, receipt });
        Dispatch::Acted(reference)
    }

    /// Routes one transport event; close events are spawned into `inflight`.
    pub fn handle(self: &Arc<Self>, ev: TransportEvent, inflight: &mut JoinSet<Dispatch>) {
        match ev {
            TransportEvent::Snapshot(fills) => self.absorb_snapshot(&fills),
            TransportEvent::Fills(fills) => {
                for close in self.screen(&fills) {
                    let f = &close.fill;
                    CLOSE_EVENTS.with_label_values(&[&f.subject]).inc();
                    info!(
                        subject = %f.subject,
                        id = %f.id,
                        size = %f.size,
                        price = %f.price,
                        closed_pnl = %f.realized_pnl,
                        time = %close.datetime(),
                        "close-long detected"
                    );
                    self.record(Event::Close(close.clone()));
                    self.notify(Notice::EventDetected(close.clone()));
                    let me = Arc::clone(self);
                    inflight.spawn(async move { me.dispatch(close).await });
                }
            }
            TransportEvent::ConnectionLost(reason) => {
                warn!(%reason, ledger = self.ledger.seen_count(), "transport connection lost");
                self.record(Event::Note(format!("connection lost: {reason}")));
            }
        }
    }

    /// Consumes transport events until shutdown or the transport goes away,
    /// then waits for every in-flight gate sequence.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<TransportEvent>, mut shutdown: watch::Receiver<bool>) {
        info!(
            subjects = ?self.classifier.tracked(),
            leverage = self.params.leverage,
            margin = %self.params.margin,
            venue = self.executor.venue(),
            "monitor started"
        );
        let mut inflight: JoinSet<Dispatch> = JoinSet::new();
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(ev) = maybe else { break };
                    self.handle(ev, &mut inflight);
                }
                Some(done) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(e) = done {
                        error!(error = %e, "dispatch task panicked");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        if !inflight.is_empty() {
            info!(pending = inflight.len(), "waiting for in-flight actions");
        }
        while let Some(done) = inflight.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "dispatch task panicked");
            }
        }
        info!("monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ActionReceipt, Direction};
    use crate::gateway::ActionError;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    impl Counting {
        fn new(fail: bool, delay: Duration) -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), fail, delay })
        }
        fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
    }

    #[async_trait]
    impl ActionExecutor for Counting {
        async fn execute_action(&self, subject: &str, _p: ActionParams) -> Result<ActionReceipt, ActionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            sleep(self.delay).await;
            if self.fail {
                return Err(ActionError::Invalid("venue down".into()));
            }
            Ok(ActionReceipt {
                reference: format!("ord-{n}"),
                symbol: format!("{subject}USDC"),
                filled_qty: Decimal::ONE,
                avg_price: None,
            })
        }
        fn venue(&self) -> &str { "counting" }
    }

    fn fill(id: &str, subject: &str, side: Direction, pnl: i64) -> FillRecord {
        FillRecord {
            id: id.into(),
            subject: subject.into(),
            direction: side,
            realized_pnl: Decimal::from(pnl),
            size: Decimal::from(2),
            price: Decimal::from(3100),
            timestamp_ms: 1_700_000_000_000,
        }
    }

    struct Harness {
        monitor: Arc<Monitor>,
        exec: Arc<Counting>,
        state: Arc<TradeStateStore>,
        notices: mpsc::Receiver<Notice>,
        _dir: tempfile::TempDir,
    }

    fn harness_at(exec: Arc<Counting>, state_path: std::path::PathBuf, dir: tempfile::TempDir) -> Harness {
        let state = Arc::new(TradeStateStore::open(state_path));
        let (ntx, nrx) = mpsc::channel(64);
        let monitor = Arc::new(Monitor::new(
            Arc::new(DedupLedger::new()),
            Classifier::new(["ETH", "BTC"]),
            state.clone(),
            exec.clone(),
            ActionParams { leverage: 100, margin: Decimal::from(50) },
            NoticeSink::new(ntx),
            None,
        ));
        Harness { monitor, exec, state, notices: nrx, _dir: dir }
    }

    fn harness(exec: Arc<Counting>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trade_state.json");
        harness_at(exec, path, dir)
    }

    async fn drain(set: &mut JoinSet<Dispatch>) -> Vec<Dispatch> {
        let mut out = Vec::new();
        while let Some(r) = set.join_next().await {
            out.push(r.unwrap());
        }
        out
    }

    fn kinds(rx: &mut mpsc::Receiver<Notice>) -> Vec<crate::domain::NoticeKind> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n.kind());
        }
        out
    }

    #[tokio::test]
    async fn eth_close_long_opens_once_and_commits() {
        use crate::domain::NoticeKind::*;
        let mut h = harness(Counting::new(false, Duration::ZERO));
        let mut set = JoinSet::new();
        h.monitor.handle(TransportEvent::Fills(vec![fill("f1", "ETH", Direction::Sell, 125)]), &mut set);
        assert_eq!(drain(&mut set).await, vec![Dispatch::Acted("ord-1".into())]);

        assert_eq!(h.exec.calls(), 1);
        assert!(h.state.is_opened("ETH"));
        assert_eq!(h.state.get("ETH").unwrap().action_ref, "ord-1");
        assert_eq!(kinds(&mut h.notices), vec![EventDetected, ActionSucceeded]);
    }

    #[tokio::test]
    async fn identical_fill_twice_acts_once() {
        let h = harness(Counting::new(false, Duration::ZERO));
        let mut set = JoinSet::new();
        let f = fill("f1", "ETH", Direction::Sell, 125);
        h.monitor.handle(TransportEvent::Fills(vec![f.clone()]), &mut set);
        h.monitor.handle(TransportEvent::Fills(vec![f]), &mut set);
        drain(&mut set).await;
        assert_eq!(h.exec.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_same_subject_events_act_once() {
        let h = harness(Counting::new(false, Duration::from_secs(2)));
        let mut set = JoinSet::new();
        h.monitor.handle(
            TransportEvent::Fills(vec![
                fill("f1", "ETH", Direction::Sell, 10),
                fill("f2", "ETH", Direction::Sell, 20),
            ]),
            &mut set,
        );
        let mut results = drain(&mut set).await;
        results.sort_by_key(|d| format!("{d:?}"));
        assert_eq!(results, vec![Dispatch::Acted("ord-1".into()), Dispatch::AlreadyOpened]);
        assert_eq!(h.exec.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_subjects_do_not_wait_on_each_other() {
        let h = harness(Counting::new(false, Duration::from_secs(2)));
        let mut set = JoinSet::new();
        let started = tokio::time::Instant::now();
        h.monitor.handle(
            TransportEvent::Fills(vec![
                fill("e1", "ETH", Direction::Sell, 10),
                fill("b1", "BTC", Direction::Sell, 10),
            ]),
            &mut set,
        );
        drain(&mut set).await;
        assert_eq!(h.exec.calls(), 2);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(h.state.is_opened("ETH") && h.state.is_opened("BTC"));
    }

    #[tokio::test]
    async fn snapshot_then_replayed_live_fill_never_acts() {
        let mut h = harness(Counting::new(false, Duration::ZERO));
        let mut set = JoinSet::new();
        let history: Vec<FillRecord> =
            (1..=5).map(|i| fill(&format!("f{i}"), "ETH", Direction::Sell, 10)).collect();
        h.monitor.handle(TransportEvent::Snapshot(history), &mut set);
        h.monitor.handle(TransportEvent::Fills(vec![fill("f1", "ETH", Direction::Sell, 10)]), &mut set);
        assert!(drain(&mut set).await.is_empty());
        assert_eq!(h.exec.calls(), 0);
        assert!(kinds(&mut h.notices).is_empty());
    }

    #[tokio::test]
    async fn non_close_fills_are_ignored() {
        let h = harness(Counting::new(false, Duration::ZERO));
        let mut set = JoinSet::new();
        h.monitor.handle(
            TransportEvent::Fills(vec![
                fill("a", "ETH", Direction::Buy, 10),
                fill("b", "ETH", Direction::Sell, 0),
                fill("c", "SOL", Direction::Sell, 10),
            ]),
            &mut set,
        );
        assert!(drain(&mut set).await.is_empty());
        assert_eq!(h.exec.calls(), 0);
    }

    #[tokio::test]
    async fn failed_action_leaves_subject_unmarked() {
        use crate::domain::NoticeKind::*;
        let mut h = harness(Counting::new(true, Duration::ZERO));
        let mut set = JoinSet::new();
        h.monitor.handle(TransportEvent::Fills(vec![fill("f1", "ETH", Direction::Sell, 10)]), &mut set);
        assert!(matches!(drain(&mut set).await.as_slice(), [Dispatch::ActionFailed(_)]));
        assert!(!h.state.is_opened("ETH"));
        assert_eq!(kinds(&mut h.notices), vec![EventDetected, ActionFailed]);
    }

    #[tokio::test]
    async fn persistence_failure_is_reported_and_not_committed() {
        use crate::domain::NoticeKind::*;
        let dir = tempfile::tempdir().unwrap();
        // parent "directory" is a regular file -> write gagal
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let mut h = harness_at(Counting::new(false, Duration::ZERO), blocker.join("trade_state.json"), dir);

        let mut set = JoinSet::new();
        h.monitor.handle(TransportEvent::Fills(vec![fill("f1", "ETH", Direction::Sell, 10)]), &mut set);
        assert!(matches!(drain(&mut set).await.as_slice(), [Dispatch::PersistFailed(_)]));
        assert_eq!(h.exec.calls(), 1);
        assert!(!h.state.is_opened("ETH"));
        assert_eq!(kinds(&mut h.notices), vec![EventDetected, ActionFailed]);
    }

    #[tokio::test]
    async fn run_drains_inflight_on_shutdown() {
        let h = harness(Counting::new(false, Duration::from_millis(50)));
        let (tx, rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(h.monitor.clone().run(rx, stop_rx));
        tx.send(TransportEvent::Fills(vec![fill("f1", "ETH", Direction::Sell, 10)])).await.unwrap();
        // tunggu sampai action mulai, lalu shutdown
        while h.exec.calls() == 0 {
            tokio::task::yield_now().await;
        }
        stop_tx.send(true).unwrap();
        task.await.unwrap();
        assert!(h.state.is_opened("ETH"));
    }
}
