// ===============================
// src/stream.rs
// ===============================
//
// Transport websocket untuk `userFills`:
//
//   Disconnected -> Connecting -> Subscribing -> Streaming -> Disconnected
//                        ^                                        |
//                        +------------ reconnect_delay -----------+
//
// - Satu task memiliki socket + state; orchestrator hanya menerima
//   TransportEvent lewat channel (Snapshot / Fills / ConnectionLost).
// - Heartbeat {"method":"ping"} tiap `heartbeat_interval`, mulai saat masuk
//   Streaming (ack / snapshot / live pertama). Frame apapun yang masuk
//   dihitung sebagai tanda hidup; bila tidak ada dalam `pong_timeout`
//   setelah ping, koneksi dianggap putus.
// - Selama Subscribing belum ada heartbeat; kalau server tidak menjawab
//   subscribe dalam `connect_timeout`, sesi diputus dan reconnect.
// - Reconnect selalu kirim ulang subscribe. Snapshot yang datang lagi
//   setelah reconnect aman: ledger di orchestrator tidak ikut hilang.
//
use futures_util::{SinkExt, StreamExt};
use tokio::{
    sync::{mpsc, watch},
    time::{interval_at, sleep, sleep_until, timeout, Duration, Instant, Interval},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::domain::{TransportError, TransportEvent};
use crate::metrics::{FILLS_RECEIVED, WS_ERRORS, WS_MESSAGES, WS_RECONNECTS, WS_STATE};
use crate::wire::{parse_ws_message, subscribe_user_fills, WsMessage, PING};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Subscribing = 2,
    Streaming = 3,
    Closing = 4,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub ws_url: String,
    pub user: String,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
    pub reconnect_delay: Duration,
}

enum SessionEnd {
    Shutdown,
    ReceiverGone,
}

pub struct StreamTransport {
    cfg: StreamConfig,
    state: ConnectionState,
    tx: mpsc::Sender<TransportEvent>,
}

impl StreamTransport {
    pub fn new(cfg: StreamConfig, tx: mpsc::Sender<TransportEvent>) -> Self {
        Self { cfg, state: ConnectionState::Disconnected, tx }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "ws state");
            self.state = next;
            WS_STATE.set(next as i64);
        }
    }

    /// Runs until shutdown flips or the orchestrator drops its receiver.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(url = %self.cfg.ws_url, user = %self.cfg.user, "streaming transport started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);
            let reason = match self.session(&mut shutdown).await {
                Ok(SessionEnd::Shutdown) | Ok(SessionEnd::ReceiverGone) => break,
                Err(e) => e.to_string(),
            };
            self.set_state(ConnectionState::Disconnected);
            warn!(%reason, delay_s = self.cfg.reconnect_delay.as_secs_f64(), "ws connection lost, reconnecting");
            if self.tx.send(TransportEvent::ConnectionLost(reason)).await.is_err() {
                break;
            }
            WS_RECONNECTS.inc();
            tokio::select! {
                _ = sleep(self.cfg.reconnect_delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        self.set_state(ConnectionState::Disconnected);
        info!("streaming transport stopped");
    }

    async fn session(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<SessionEnd, TransportError> {
        let url = Url::parse(&self.cfg.ws_url)?;
        let connecting = timeout(self.cfg.connect_timeout, connect_async(url.as_str()));
        let (ws, _resp) = tokio::select! {
            r = connecting => match r {
                Ok(r) => r?,
                Err(_) => return Err(TransportError::ConnectTimeout(self.cfg.connect_timeout)),
            },
            _ = shutdown.changed() => return Ok(SessionEnd::Shutdown),
        };
        info!("ws connected");
        let (mut write, mut read) = ws.split();

        self.set_state(ConnectionState::Subscribing);
        let sub = serde_json::to_string(&subscribe_user_fills(&self.cfg.user))?;
        write.send(Message::Text(sub)).await?;
        debug!("subscribe sent");

        let period = self.cfg.heartbeat_interval;
        // heartbeat baru jalan setelah Streaming; sebelum itu ack dibatasi connect_timeout
        let ack_deadline = Instant::now() + self.cfg.connect_timeout;
        let mut heartbeat: Option<Interval> = None;
        let mut pong_deadline: Option<Instant> = None;

        loop {
            if heartbeat.is_none() && self.state == ConnectionState::Streaming {
                debug!(every_s = period.as_secs_f64(), "heartbeat armed");
                heartbeat = Some(interval_at(Instant::now() + period, period));
            }
            let streaming = heartbeat.is_some();
            let deadline = if streaming { pong_deadline } else { Some(ack_deadline) };
            let wake = deadline.unwrap_or_else(|| Instant::now() + period + self.cfg.pong_timeout);
            tokio::select! {
                _ = shutdown.changed() => {
                    self.set_state(ConnectionState::Closing);
                    let _ = write.send(Message::Close(None)).await;
                    let _ = write.close().await;
                    return Ok(SessionEnd::Shutdown);
                }
                _ = next_tick(&mut heartbeat) => {
                    write.send(Message::Text(PING.to_string())).await?;
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + self.cfg.pong_timeout);
                    }
                }
                _ = sleep_until(wake), if deadline.is_some() => {
                    WS_ERRORS.inc();
                    return Err(if streaming {
                        TransportError::HeartbeatTimeout(self.cfg.pong_timeout)
                    } else {
                        TransportError::SubscribeTimeout(self.cfg.connect_timeout)
                    });
                }
                frame = read.next() => {
                    let msg = match frame {
                        None => return Err(TransportError::Closed),
                        Some(Err(e)) => {
                            WS_ERRORS.inc();
                            return Err(e.into());
                        }
                        Some(Ok(m)) => m,
                    };
                    // frame apapun = koneksi hidup
                    pong_deadline = None;
                    match msg {
                        Message::Text(text) => {
                            if !self.handle_text(&text).await {
                                return Ok(SessionEnd::ReceiverGone);
                            }
                        }
                        Message::Ping(p) => write.send(Message::Pong(p)).await?,
                        Message::Close(frame) => {
                            info!(?frame, "ws closed by server");
                            return Err(TransportError::Closed);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// `false` once the orchestrator side of the channel is gone.
    async fn handle_text(&mut self, text: &str) -> bool {
        WS_MESSAGES.inc();
        let event = match parse_ws_message(text) {
            Ok(WsMessage::SubscriptionAck(data)) => {
                info!(%data, "subscription acknowledged");
                self.set_state(ConnectionState::Streaming);
                return true;
            }
            Ok(WsMessage::Snapshot(fills)) => {
                self.set_state(ConnectionState::Streaming);
                info!(count = fills.len(), "snapshot received");
                TransportEvent::Snapshot(fills)
            }
            Ok(WsMessage::Live(fills)) => {
                self.set_state(ConnectionState::Streaming);
                if fills.is_empty() {
                    return true;
                }
                info!(count = fills.len(), "live fills received");
                FILLS_RECEIVED.inc_by(fills.len() as u64);
                TransportEvent::Fills(fills)
            }
            Ok(WsMessage::Pong) => {
                debug!("pong");
                return true;
            }
            Ok(WsMessage::Error(e)) => {
                WS_ERRORS.inc();
                warn!(error = %e, "ws error message");
                return true;
            }
            Ok(WsMessage::Other(channel)) => {
                debug!(%channel, "ignored ws channel");
                return true;
            }
            Err(e) => {
                WS_ERRORS.inc();
                warn!(error = %e, "failed to parse ws message");
                return true;
            }
        };
        self.tx.send(event).await.is_ok()
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(hb) => {
            hb.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
