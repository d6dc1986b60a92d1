//! Reconnecting live event channel for one run id.
//!
//! Owns a single WebSocket connection plus all of its timers inside one
//! spawned task; `stop()` or replacement by a new run aborts the task, so
//! no interval survives the channel that created it. Subscribers get every
//! forwardable frame (heartbeats are consumed internally) via broadcast,
//! and the connection state via a watch channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use vericoach_common::config::DeploymentMode;
use vericoach_common::protocol::ChannelMessage;

use crate::diag::{DiagnosticEvent, DiagnosticSink};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// --- Connection State ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Machine-readable cause of a permanent disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    AuthTokenMissing,
    AttemptsExhausted,
    Stopped,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthTokenMissing => "auth_token_missing",
            Self::AttemptsExhausted => "attempts_exhausted",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Only set when `state` is `Disconnected`.
    pub reason: Option<DisconnectReason>,
}

impl ConnectionStatus {
    pub fn connecting() -> Self {
        Self { state: ConnectionState::Connecting, reason: None }
    }

    pub fn connected() -> Self {
        Self { state: ConnectionState::Connected, reason: None }
    }

    pub fn reconnecting() -> Self {
        Self { state: ConnectionState::Reconnecting, reason: None }
    }

    pub fn disconnected(reason: Option<DisconnectReason>) -> Self {
        Self { state: ConnectionState::Disconnected, reason }
    }

    /// True only once reconnection has been given up (or never begun).
    /// `reconnecting` is not "down": the channel may still come back.
    pub fn is_disconnected(&self) -> bool {
        matches!(self.state, ConnectionState::Disconnected)
    }
}

// --- Reconnect Policy ---

/// Exponential backoff with additive jitter. Pure so the schedule is
/// testable; the caller supplies the jitter unit in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 15_000,
            jitter_ratio: 0.5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32, jitter_unit: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(10);
        let scaled = self
            .base_delay_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_delay_ms);
        let jitter_max = (scaled as f64 * self.jitter_ratio.max(0.0)) as u64;
        let jitter = (jitter_max as f64 * jitter_unit.clamp(0.0, 1.0)) as u64;
        Duration::from_millis(scaled.saturating_add(jitter))
    }
}

// --- Channel ---

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Channel URL base; the run id is appended as a path segment.
    pub url: String,
    pub deployment: DeploymentMode,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    /// Reconnect attempts before giving up until the next `start`.
    pub max_reconnect_attempts: u32,
    pub policy: ReconnectPolicy,
}

impl ChannelConfig {
    pub fn new(url: String, deployment: DeploymentMode) -> Self {
        Self {
            url,
            deployment,
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(20),
            max_reconnect_attempts: 8,
            policy: ReconnectPolicy::default(),
        }
    }
}

struct Active {
    run_id: String,
    token: Option<String>,
    task: JoinHandle<()>,
}

pub struct EventChannel {
    config: ChannelConfig,
    diag: Arc<dyn DiagnosticSink>,
    messages: broadcast::Sender<ChannelMessage>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    status_rx: watch::Receiver<ConnectionStatus>,
    active: Mutex<Option<Active>>,
}

impl EventChannel {
    pub fn new(config: ChannelConfig, diag: Arc<dyn DiagnosticSink>) -> Self {
        let (messages, _) = broadcast::channel(256);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::disconnected(None));
        Self {
            config,
            diag,
            messages,
            status_tx: Arc::new(status_tx),
            status_rx,
            active: Mutex::new(None),
        }
    }

    /// Open the channel for `run_id`, replacing any channel open for a
    /// different run. No-op when already running for the same run id and
    /// an equivalent token.
    ///
    /// In production mode a missing token is a hard failure: the status
    /// drops to `disconnected` with `auth_token_missing` and no connection
    /// attempt is made.
    pub async fn start(&self, run_id: &str, token: Option<String>) {
        let mut active = self.active.lock().await;

        if let Some(a) = active.as_ref() {
            if a.run_id == run_id && a.token == token && !a.task.is_finished() {
                return;
            }
        }
        if let Some(old) = active.take() {
            old.task.abort();
        }

        if self.config.deployment.requires_channel_token() && token.is_none() {
            self.diag.record(DiagnosticEvent::ChannelAuthMissing {
                run_id: run_id.to_string(),
            });
            let _ = self
                .status_tx
                .send(ConnectionStatus::disconnected(Some(DisconnectReason::AuthTokenMissing)));
            return;
        }

        let task = self.spawn_loop(run_id.to_string(), token.clone());
        *active = Some(Active {
            run_id: run_id.to_string(),
            token,
            task,
        });
    }

    /// Close the connection and disable reconnection. Safe to call
    /// repeatedly and before any `start`.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        if let Some(a) = active.take() {
            a.task.abort();
        }
        let _ = self
            .status_tx
            .send(ConnectionStatus::disconnected(Some(DisconnectReason::Stopped)));
    }

    /// Force an immediate reconnection cycle for the configured run id,
    /// resetting the attempt counter. No-op when nothing was started.
    pub async fn manual_reconnect(&self) {
        let mut active = self.active.lock().await;
        if let Some(a) = active.as_mut() {
            a.task.abort();
            a.task = self.spawn_loop(a.run_id.clone(), a.token.clone());
        }
    }

    /// Every forwardable frame, multicast. Heartbeats never appear here.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelMessage> {
        self.messages.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    fn spawn_loop(&self, run_id: String, token: Option<String>) -> JoinHandle<()> {
        let config = self.config.clone();
        let diag = self.diag.clone();
        let messages = self.messages.clone();
        let status_tx = self.status_tx.clone();
        tokio::spawn(run_loop(config, run_id, token, diag, messages, status_tx))
    }
}

fn connection_url(base: &str, run_id: &str, token: Option<&str>) -> String {
    let mut url = format!("{}/{run_id}", base.trim_end_matches('/'));
    if let Some(token) = token {
        url.push_str("?token=");
        // Backend tokens can carry `+`/`=`/`&`.
        url.extend(url::form_urlencoded::byte_serialize(token.as_bytes()));
    }
    url
}

async fn run_loop(
    config: ChannelConfig,
    run_id: String,
    token: Option<String>,
    diag: Arc<dyn DiagnosticSink>,
    messages: broadcast::Sender<ChannelMessage>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
) {
    let url = connection_url(&config.url, &run_id, token.as_deref());
    let mut attempt: u32 = 0;

    loop {
        let _ = status_tx.send(if attempt == 0 {
            ConnectionStatus::connecting()
        } else {
            ConnectionStatus::reconnecting()
        });

        match timeout(config.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((ws, _))) => {
                attempt = 0;
                diag.record(DiagnosticEvent::ChannelConnected {
                    run_id: run_id.clone(),
                    attempt,
                });
                let _ = status_tx.send(ConnectionStatus::connected());
                read_loop(ws, &config, &run_id, &messages, &diag).await;
            }
            Ok(Err(e)) => {
                warn!(run_id = run_id.as_str(), error = %e, "Channel connect failed");
            }
            Err(_) => {
                warn!(
                    run_id = run_id.as_str(),
                    timeout_secs = config.connect_timeout.as_secs(),
                    "Channel connect timed out"
                );
            }
        }

        attempt += 1;
        if attempt > config.max_reconnect_attempts {
            diag.record(DiagnosticEvent::ChannelGaveUp {
                run_id: run_id.clone(),
                attempts: attempt - 1,
            });
            let _ = status_tx.send(ConnectionStatus::disconnected(Some(
                DisconnectReason::AttemptsExhausted,
            )));
            return;
        }

        let delay = config.policy.delay(attempt, rand::random::<f64>());
        diag.record(DiagnosticEvent::ChannelReconnectScheduled {
            run_id: run_id.clone(),
            attempt,
            delay_ms: delay.as_millis() as u64,
        });
        tokio::time::sleep(delay).await;
    }
}

/// Pump one live connection until it closes. Sends a ping on a fixed
/// interval; pong receipt is informational only, dead connections are
/// closed by the transport.
async fn read_loop(
    ws: WsStream,
    config: &ChannelConfig,
    run_id: &str,
    messages: &broadcast::Sender<ChannelMessage>,
    diag: &Arc<dyn DiagnosticSink>,
) {
    let (mut write, mut read) = ws.split();
    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);

    loop {
        tokio::select! {
            _ = ping.tick() => {
                let frame = ChannelMessage::Ping {
                    run_id: Some(run_id.to_string()),
                    timestamp: Some(Utc::now()),
                };
                let Ok(json) = serde_json::to_string(&frame) else { continue };
                if write.send(Message::Text(json.into())).await.is_err() {
                    return;
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ChannelMessage>(text.as_str()) {
                        Ok(ChannelMessage::Ping { .. }) => {
                            let pong = ChannelMessage::Pong {
                                run_id: Some(run_id.to_string()),
                                timestamp: Some(Utc::now()),
                            };
                            if let Ok(json) = serde_json::to_string(&pong) {
                                let _ = write.send(Message::Text(json.into())).await;
                            }
                        }
                        Ok(ChannelMessage::Pong { .. }) => {
                            debug!(run_id, "Pong received");
                        }
                        Ok(msg) => {
                            let _ = messages.send(msg);
                        }
                        Err(e) => {
                            diag.record(DiagnosticEvent::FrameDropped {
                                run_id: run_id.to_string(),
                                reason: format!("unparseable frame: {e}"),
                            });
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(run_id, "Channel closed by server");
                    return;
                }
                Some(Err(e)) => {
                    warn!(run_id, error = %e, "Channel read error");
                    return;
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::RecordingSink;

    #[test]
    fn backoff_doubles_from_base_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(1, 0.0), Duration::from_millis(500));
        assert_eq!(policy.delay(2, 0.0), Duration::from_millis(1000));
        assert_eq!(policy.delay(3, 0.0), Duration::from_millis(2000));
        // Past the cap every attempt waits the same.
        assert_eq!(policy.delay(6, 0.0), Duration::from_millis(15_000));
        assert_eq!(policy.delay(40, 0.0), Duration::from_millis(15_000));
    }

    #[test]
    fn jitter_adds_at_most_the_configured_ratio() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(1, 1.0), Duration::from_millis(750));
        // Out-of-range jitter units are clamped.
        assert_eq!(policy.delay(1, 7.0), Duration::from_millis(750));
        assert_eq!(policy.delay(1, -1.0), Duration::from_millis(500));
    }

    #[test]
    fn connection_url_appends_run_id_and_token() {
        assert_eq!(
            connection_url("wss://coach.example.com/ws/", "run-1", None),
            "wss://coach.example.com/ws/run-1"
        );
        assert_eq!(
            connection_url("wss://coach.example.com/ws", "run-1", Some("tok")),
            "wss://coach.example.com/ws/run-1?token=tok"
        );
    }

    #[test]
    fn connection_url_escapes_reserved_token_bytes() {
        assert_eq!(
            connection_url("wss://coach.example.com/ws", "run-1", Some("a+b=&c")),
            "wss://coach.example.com/ws/run-1?token=a%2Bb%3D%26c"
        );
    }

    #[tokio::test]
    async fn production_without_token_never_connects() {
        let diag = Arc::new(RecordingSink::new());
        let config = ChannelConfig::new(
            "wss://coach.example.com/ws".to_string(),
            DeploymentMode::Production,
        );
        let channel = EventChannel::new(config, diag.clone());

        channel.start("run-1", None).await;

        let status = channel.current_status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.reason, Some(DisconnectReason::AuthTokenMissing));
        assert!(diag.events().contains(&DiagnosticEvent::ChannelAuthMissing {
            run_id: "run-1".to_string()
        }));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_safe_before_start() {
        let diag = Arc::new(RecordingSink::new());
        let config = ChannelConfig::new(
            "wss://coach.example.com/ws".to_string(),
            DeploymentMode::Local,
        );
        let channel = EventChannel::new(config, diag);

        channel.stop().await;
        channel.stop().await;

        let status = channel.current_status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.reason, Some(DisconnectReason::Stopped));
    }

    #[tokio::test]
    async fn heartbeats_are_consumed_and_close_triggers_reconnect() {
        use vericoach_common::types::{RunState, RunStatus};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let ping = serde_json::to_string(&ChannelMessage::Ping {
                run_id: Some("run-1".to_string()),
                timestamp: None,
            })
            .unwrap();
            ws.send(Message::Text(ping.into())).await.unwrap();
            let status = serde_json::to_string(&ChannelMessage::Status {
                run_id: "run-1".to_string(),
                timestamp: None,
                data: RunState {
                    status: RunStatus::Running,
                    ..RunState::queued()
                },
            })
            .unwrap();
            ws.send(Message::Text(status.into())).await.unwrap();
            // Wait for the client's pong reply, then close from the server side.
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let frame: ChannelMessage =
                            serde_json::from_str(text.as_str()).unwrap();
                        assert!(matches!(frame, ChannelMessage::Pong { .. }));
                        break;
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("expected pong before close, got {other:?}"),
                }
            }
            ws.close(None).await.ok();
        });

        let diag = Arc::new(RecordingSink::new());
        let channel = EventChannel::new(
            ChannelConfig::new(format!("ws://{addr}"), DeploymentMode::Local),
            diag.clone(),
        );
        let mut messages = channel.subscribe();
        let mut status = channel.subscribe_status();
        channel.start("run-1", None).await;

        // The server sent the ping first, yet the first forwarded frame is
        // the status: heartbeats are answered internally, never multicast.
        let first = tokio::time::timeout(Duration::from_secs(5), messages.recv())
            .await
            .expect("no frame forwarded")
            .unwrap();
        assert!(matches!(first, ChannelMessage::Status { .. }));

        // Server-side close starts a reconnect cycle.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                status.changed().await.unwrap();
                let current = *status.borrow_and_update();
                if current.state == ConnectionState::Reconnecting {
                    break;
                }
            }
        })
        .await
        .expect("channel never re-entered reconnecting");

        // The successful connection reset the attempt counter, so the
        // post-close schedule starts back at attempt 1.
        assert!(diag.events().iter().any(|e| matches!(
            e,
            DiagnosticEvent::ChannelReconnectScheduled { attempt: 1, .. }
        )));

        channel.stop().await;
        server.await.unwrap();
    }
}
