// ===============================
// src/session.rs
// ===============================
//
// Session account stream VALR:
//   Disconnected -> Connecting -> Open -> Closing -> Disconnected
//
// Satu event loop (`select!`) memegang semua state bot: frame masuk, tick
// heartbeat, perintah console, hasil submit counter order, dan shutdown.
// Reconnect: backoff eksponensial + jitter, header auth ditandatangani ulang
// setiap connect.
//
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, timeout, Duration, Instant, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        handshake::client::Request,
        http::header::{HeaderValue, InvalidHeaderValue},
        Message,
    },
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::SessionCfg;
use crate::console::{self, Command};
use crate::metrics::{HEARTBEATS, RECONNECTS, SESSION_STATE};
use crate::recorder::LogType;
use crate::router::{self, BotState};
use crate::strategy::SubmissionOutcome;
use crate::valr::Signer;

pub const PING_FRAME: &str = r#"{"type":"PING"}"#;
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl SessionState {
    fn gauge(self) -> i64 {
        match self {
            SessionState::Disconnected => 0,
            SessionState::Connecting => 1,
            SessionState::Open => 2,
            SessionState::Closing => 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("bad websocket url {0:?}")]
    BadUrl(String),
    #[error("build handshake request: {0}")]
    Request(tungstenite::Error),
    #[error("invalid auth header value: {0}")]
    Header(#[from] InvalidHeaderValue),
    #[error("connect failed: {0}")]
    Connect(tungstenite::Error),
    #[error("stream transport error: {0}")]
    Transport(tungstenite::Error),
}

#[derive(Debug)]
enum SessionEnd {
    Closed,
    Failed(SessionError),
    Shutdown,
}

/// 500ms × 2^min(n,6) + jitter 0..=250ms (0.5s .. ~32s).
#[derive(Debug, Default)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let shift = self.attempt.min(6);
        let base_ms = 500u64.saturating_mul(1u64 << shift);
        let jitter = rand::thread_rng().gen_range(0..=250);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(base_ms + jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Channel masuk ke event loop selain frame WS.
pub struct LoopIo {
    pub outcome_rx: mpsc::Receiver<SubmissionOutcome>,
    pub command_rx: mpsc::Receiver<Command>,
    pub shutdown_rx: watch::Receiver<bool>,
    commands_open: bool,
}

impl LoopIo {
    pub fn new(
        outcome_rx: mpsc::Receiver<SubmissionOutcome>,
        command_rx: mpsc::Receiver<Command>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self { outcome_rx, command_rx, shutdown_rx, commands_open: true }
    }

    fn on_command(&mut self, bot: &BotState, cmd: Option<Command>) {
        match cmd {
            Some(cmd) => console::execute(cmd, bot),
            None => {
                debug!("console channel closed");
                self.commands_open = false;
            }
        }
    }
}

// Selesai saat flag shutdown = true; sender hilang = tidak pernah selesai.
async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub struct SessionController {
    cfg: SessionCfg,
    signer: Arc<Signer>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionController {
    pub fn new(cfg: SessionCfg, signer: Arc<Signer>) -> (Self, watch::Receiver<SessionState>) {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        SESSION_STATE.set(SessionState::Disconnected.gauge());
        (Self { cfg, signer, state_tx }, state_rx)
    }

    fn set_state(&self, state: SessionState) {
        SESSION_STATE.set(state.gauge());
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            debug!(?prev, ?state, "session state");
        }
    }

    /// Request handshake dengan header auth baru (timestamp saat ini).
    fn handshake_request(&self) -> Result<Request, SessionError> {
        let url = Url::parse(&self.cfg.ws_url).map_err(|_| SessionError::BadUrl(self.cfg.ws_url.clone()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SessionError::BadUrl(self.cfg.ws_url.clone()));
        }
        let mut request = url.as_str().into_client_request().map_err(SessionError::Request)?;
        let auth = self.signer.account_stream_headers();
        for (name, value) in auth.pairs() {
            request.headers_mut().insert(name, HeaderValue::from_str(&value)?);
        }
        Ok(request)
    }

    /// Loop utama: session + reconnect sampai shutdown / reconnect habis.
    pub async fn run(&mut self, bot: &mut BotState, io: &mut LoopIo) {
        let mut backoff = Backoff::default();
        loop {
            let end = self.run_once(bot, io, &mut backoff).await;
            self.set_state(SessionState::Disconnected);
            match end {
                SessionEnd::Shutdown => {
                    info!("session shut down");
                    return;
                }
                SessionEnd::Closed => info!("Connection closed"),
                SessionEnd::Failed(e) => {
                    error!(error = %e, "session failed");
                    bot.activity.log(LogType::Error, format!("Session error: {e}"), None);
                }
            }

            if !self.cfg.reconnect {
                info!("reconnect disabled, session finished");
                return;
            }
            if self.cfg.max_reconnect_attempts > 0 && backoff.attempts() >= self.cfg.max_reconnect_attempts {
                warn!(attempts = backoff.attempts(), "max reconnect attempts reached, giving up");
                return;
            }

            let delay = backoff.next_delay();
            RECONNECTS.inc();
            info!(attempt = backoff.attempts(), delay_ms = delay.as_millis() as u64, "reconnecting");
            if self.idle(bot, io, delay).await {
                info!("session shut down during backoff");
                return;
            }
        }
    }

    // Tetap layani outcome & console selama backoff. true = shutdown diminta.
    async fn idle(&self, bot: &mut BotState, io: &mut LoopIo, delay: Duration) -> bool {
        let wake = sleep(delay);
        tokio::pin!(wake);
        loop {
            tokio::select! {
                _ = &mut wake => return false,
                Some(outcome) = io.outcome_rx.recv() => router::on_submission(bot, outcome),
                cmd = io.command_rx.recv(), if io.commands_open => io.on_command(bot, cmd),
                _ = wait_shutdown(&mut io.shutdown_rx) => return true,
            }
        }
    }

    async fn run_once(&mut self, bot: &mut BotState, io: &mut LoopIo, backoff: &mut Backoff) -> SessionEnd {
        if *io.shutdown_rx.borrow() {
            return SessionEnd::Shutdown;
        }
        self.set_state(SessionState::Connecting);
        let request = match self.handshake_request() {
            Ok(r) => r,
            Err(e) => return SessionEnd::Failed(e),
        };

        info!(url = %self.cfg.ws_url, "connecting account stream");
        let ws = tokio::select! {
            res = connect_async(request) => match res {
                Ok((ws, _resp)) => ws,
                Err(e) => return SessionEnd::Failed(SessionError::Connect(e)),
            },
            _ = wait_shutdown(&mut io.shutdown_rx) => return SessionEnd::Shutdown,
        };

        let (mut write, mut read) = ws.split();
        self.set_state(SessionState::Open);
        backoff.reset();
        info!("Connection opened");

        // heartbeat hanya hidup selama session Open; di-drop saat keluar fungsi
        let hb = self.cfg.heartbeat;
        let mut heartbeat = interval_at(Instant::now() + hb, hb);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => router::handle_frame(bot, &text),
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "server closed account stream");
                        return SessionEnd::Closed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Failed(SessionError::Transport(e)),
                    None => return SessionEnd::Closed,
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = write.send(Message::Text(PING_FRAME.to_string())).await {
                        return SessionEnd::Failed(SessionError::Transport(e));
                    }
                    HEARTBEATS.inc();
                    debug!("Ping sent");
                    bot.activity.log(LogType::Ping, "Ping sent", None);
                },
                Some(outcome) = io.outcome_rx.recv() => router::on_submission(bot, outcome),
                cmd = io.command_rx.recv(), if io.commands_open => io.on_command(bot, cmd),
                _ = wait_shutdown(&mut io.shutdown_rx) => {
                    self.set_state(SessionState::Closing);
                    match timeout(CLOSE_GRACE, write.send(Message::Close(None))).await {
                        Ok(Ok(())) => debug!("close frame sent"),
                        Ok(Err(e)) => debug!(error = %e, "close frame not sent"),
                        Err(_) => debug!("close frame timed out"),
                    }
                    return SessionEnd::Shutdown;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balances::BalanceLedger;
    use crate::config::{PriceResolution, StrategyCfg};
    use crate::gateway_valr::ValrRest;
    use crate::open_orders::OpenOrderBook;
    use crate::recorder::ActivityLog;
    use crate::strategy::CounterOrderEngine;
    use crate::valr::{Credentials, HDR_API_KEY, HDR_SIGNATURE, HDR_TIMESTAMP};
    use rust_decimal_macros::dec;
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request as ServerRequest, Response};

    const BALANCE: &str = r#"{"type":"BALANCE_UPDATE","data":{"currency":{"symbol":"BTC"},
        "available":"1","reserved":"0","total":"1","totalInReference":"60000","referenceCurrency":"USDC"}}"#;

    type Captured = Arc<Mutex<Vec<(String, String, String)>>>;

    fn header(req: &ServerRequest, name: &str) -> String {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    async fn accept(
        listener: &TcpListener,
        captured: &Captured,
    ) -> tokio_tungstenite::WebSocketStream<tokio::net::TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        let cap = captured.clone();
        accept_hdr_async(stream, move |req: &ServerRequest, resp: Response| -> Result<Response, ErrorResponse> {
            cap.lock().unwrap().push((
                header(req, HDR_API_KEY),
                header(req, HDR_SIGNATURE),
                header(req, HDR_TIMESTAMP),
            ));
            Ok(resp)
        })
        .await
        .unwrap()
    }

    fn bot() -> (BotState, mpsc::Receiver<SubmissionOutcome>) {
        let cfg = StrategyCfg {
            offset: dec!(0.0025),
            price_resolution: PriceResolution::new(0),
            dedup_capacity: 16,
            dry_run: true,
        };
        let signer = Arc::new(Signer::new(Credentials::new("k".into(), "s".into())));
        let rest = ValrRest::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        let (tx, rx) = mpsc::channel(4);
        let engine = CounterOrderEngine::new(cfg, signer, rest, tx);
        (BotState::new(BalanceLedger::new("USDC"), OpenOrderBook::new(), engine, ActivityLog::default()), rx)
    }

    fn session_cfg(url: String, heartbeat: Duration, reconnect: bool, max: u32) -> SessionCfg {
        SessionCfg { ws_url: url, heartbeat, reconnect, max_reconnect_attempts: max }
    }

    fn controller(cfg: SessionCfg) -> (SessionController, watch::Receiver<SessionState>) {
        let signer = Arc::new(Signer::new(Credentials::new("stream-key".into(), "stream-secret".into())));
        SessionController::new(cfg, signer)
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut b = Backoff::default();
        let first = b.next_delay();
        assert!(first >= Duration::from_millis(500) && first <= Duration::from_millis(750));
        let second = b.next_delay();
        assert!(second >= Duration::from_millis(1000) && second <= Duration::from_millis(1250));
        for _ in 0..10 {
            let d = b.next_delay();
            assert!(d <= Duration::from_millis(32_250));
        }
        assert_eq!(b.attempts(), 12);
        b.reset();
        assert_eq!(b.attempts(), 0);
    }

    #[test]
    fn rejects_non_ws_url() {
        let (ctrl, _) = controller(session_cfg("https://api.valr.com/ws/account".into(), Duration::from_secs(30), false, 0));
        assert!(matches!(ctrl.handshake_request(), Err(SessionError::BadUrl(_))));
        let (ctrl, _) = controller(session_cfg("not a url".into(), Duration::from_secs(30), false, 0));
        assert!(matches!(ctrl.handshake_request(), Err(SessionError::BadUrl(_))));
    }

    #[tokio::test]
    async fn dispatches_frames_and_sends_heartbeat() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws/account", listener.local_addr().unwrap());
        let captured: Captured = Arc::default();

        let cap = captured.clone();
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener, &cap).await;
            ws.send(Message::Text(r#"{"type":"AUTHENTICATED"}"#.into())).await.unwrap();
            ws.send(Message::Text(BALANCE.into())).await.unwrap();
            ws.send(Message::Text(r#"{"type":"BRAND_NEW_TYPE","data":{}}"#.into())).await.unwrap();
            ws.send(Message::Text("{broken".into())).await.unwrap();
            let ping = loop {
                match ws.next().await {
                    Some(Ok(Message::Text(t))) => break t,
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected {other:?}"),
                }
            };
            ws.send(Message::Close(None)).await.unwrap();
            ping
        });

        let (mut bot, outcome_rx) = bot();
        let (_cmd_tx, cmd_rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut io = LoopIo::new(outcome_rx, cmd_rx, shutdown_rx);
        let (mut ctrl, state_rx) = controller(session_cfg(url, Duration::from_millis(100), false, 0));

        timeout(Duration::from_secs(5), ctrl.run(&mut bot, &mut io)).await.unwrap();

        assert_eq!(server.await.unwrap(), PING_FRAME);
        assert_eq!(*state_rx.borrow(), SessionState::Disconnected);
        assert_eq!(bot.ledger.get("BTC").unwrap().total_in_reference, dec!(60000));
        assert_eq!(bot.activity.recent(10, Some(LogType::Unknown)).len(), 1);
        assert_eq!(bot.activity.recent(10, Some(LogType::Error)).len(), 1);
        assert!(!bot.activity.recent(10, Some(LogType::Ping)).is_empty());

        let caps = captured.lock().unwrap();
        assert_eq!(caps.len(), 1);
        let (key, sig, ts) = &caps[0];
        assert_eq!(key, "stream-key");
        let ts: u64 = ts.parse().unwrap();
        assert_eq!(sig, &crate::valr::sign_request("stream-secret", ts, "GET", "/ws/account", ""));
    }

    #[tokio::test]
    async fn shutdown_sends_close_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws/account", listener.local_addr().unwrap());
        let captured: Captured = Arc::default();

        let server = tokio::spawn(async move {
            let mut ws = accept(&listener, &captured).await;
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) => return true,
                    Some(Ok(_)) => continue,
                    _ => return false,
                }
            }
        });

        let (mut bot, outcome_rx) = bot();
        let (_cmd_tx, cmd_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut io = LoopIo::new(outcome_rx, cmd_rx, shutdown_rx);
        let (mut ctrl, mut state_rx) = controller(session_cfg(url, Duration::from_secs(30), true, 0));

        let session = tokio::spawn(async move {
            ctrl.run(&mut bot, &mut io).await;
        });
        timeout(Duration::from_secs(5), state_rx.wait_for(|s| *s == SessionState::Open))
            .await
            .unwrap()
            .unwrap();
        shutdown_tx.send(true).unwrap();

        timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
        assert!(timeout(Duration::from_secs(5), server).await.unwrap().unwrap());
        assert_eq!(*state_rx.borrow(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn reconnects_with_fresh_headers_until_attempts_exhausted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws/account", listener.local_addr().unwrap());
        let captured: Captured = Arc::default();

        let cap = captured.clone();
        let server = tokio::spawn(async move {
            // koneksi 1: langsung ditutup
            let mut ws = accept(&listener, &cap).await;
            ws.send(Message::Close(None)).await.unwrap();
            drop(ws);
            // koneksi 2: satu balance lalu tutup; listener di-drop -> connect berikutnya gagal
            let mut ws = accept(&listener, &cap).await;
            ws.send(Message::Text(BALANCE.into())).await.unwrap();
            ws.send(Message::Close(None)).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (mut bot, outcome_rx) = bot();
        let (_cmd_tx, cmd_rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut io = LoopIo::new(outcome_rx, cmd_rx, shutdown_rx);
        let (mut ctrl, _state_rx) = controller(session_cfg(url, Duration::from_secs(30), true, 1));

        timeout(Duration::from_secs(10), ctrl.run(&mut bot, &mut io)).await.unwrap();
        server.await.unwrap();

        assert!(bot.ledger.get("BTC").is_some());
        let caps = captured.lock().unwrap();
        assert_eq!(caps.len(), 2);
        assert!(caps.iter().all(|(key, _, _)| key == "stream-key"));
        assert_ne!(caps[0].2, caps[1].2);
    }

    #[tokio::test]
    async fn console_commands_are_served_while_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws/account", listener.local_addr().unwrap());
        let captured: Captured = Arc::default();

        let server = tokio::spawn(async move {
            let mut ws = accept(&listener, &captured).await;
            ws.send(Message::Text(BALANCE.into())).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            ws.send(Message::Close(None)).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (mut bot, outcome_rx) = bot();
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut io = LoopIo::new(outcome_rx, cmd_rx, shutdown_rx);
        let (mut ctrl, _state_rx) = controller(session_cfg(url, Duration::from_secs(30), false, 0));

        cmd_tx.send(Command::Balances).await.unwrap();
        drop(cmd_tx);
        timeout(Duration::from_secs(5), ctrl.run(&mut bot, &mut io)).await.unwrap();
        server.await.unwrap();
        assert!(!io.commands_open);
    }
}
