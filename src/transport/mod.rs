pub mod loopback;
pub mod wire;
pub mod ws;

use crate::config::GatewayConfig;
use crate::session::{Protocol, ProtocolKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub use loopback::{LoopbackBehaviour, LoopbackConnector, LoopbackPeer};
pub use wire::{ControlMessage, DecodeError, ImageFormat, Inbound, VideoFrame, WireMessage};
pub use ws::WsConnector;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("handshake timed out")]
    Timeout,
    #[error("channel closed")]
    Closed,
    #[error("io error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Pending,
    Connecting,
    Open,
    Degraded,
    Closed,
}

impl ConnectionStatus {
    pub fn is_live(self) -> bool {
        self != ConnectionStatus::Closed
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    User,
    RemoteTerminated,
    TransportTimeout,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttachMode {
    Connect,
    Resume,
}

impl AttachMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AttachMode::Connect => "connect",
            AttachMode::Resume => "resume",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectRequest {
    pub connection_id: String,
    pub session_id: String,
    pub protocol: Protocol,
    pub mode: AttachMode,
    pub resume_cursor: u64,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug)]
pub enum LinkEvent {
    Message(WireMessage),
    /// `clean` is true only for a deliberate termination by the remote end.
    Closed { clean: bool, reason: String },
}

pub struct GatewayLink {
    pub outbound: mpsc::Sender<WireMessage>,
    pub inbound: mpsc::Receiver<LinkEvent>,
}

#[async_trait]
pub trait GatewayConnector: Send + Sync {
    async fn open(&self, request: ConnectRequest) -> Result<GatewayLink, TransportError>;
}

pub trait InboundHandler: Send + Sync {
    fn on_inbound(&self, inbound: Inbound);
    fn on_status(&self, status: ConnectionStatus, reason: Option<CloseReason>);
    fn on_remote_terminated(&self);
}

#[derive(Debug, Clone)]
pub enum Outbound {
    Bytes(Vec<u8>),
    Control(ControlMessage),
}

impl From<Outbound> for WireMessage {
    fn from(value: Outbound) -> Self {
        match value {
            Outbound::Bytes(bytes) => WireMessage::Binary(bytes.into()),
            Outbound::Control(control) => control.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SendOutcome {
    Sent,
    Dropped,
}

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub missed_heartbeat_limit: u32,
}

impl From<&GatewayConfig> for ChannelSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms.max(1)),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms.max(1)),
            missed_heartbeat_limit: config.missed_heartbeat_limit.max(1),
        }
    }
}

#[derive(Debug, Default)]
struct HeartbeatState {
    next_nonce: u64,
    outstanding: Option<(u64, Instant)>,
    missed: u32,
}

struct LinkTasks {
    pump: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

pub struct TransportChannel {
    connector: Arc<dyn GatewayConnector>,
    settings: ChannelSettings,
    kind: ProtocolKind,
    handler: Weak<dyn InboundHandler>,
    status: watch::Sender<ConnectionStatus>,
    close_reason: Mutex<Option<CloseReason>>,
    outbound: Mutex<Option<mpsc::Sender<WireMessage>>>,
    heartbeat: Mutex<HeartbeatState>,
    latency: Mutex<Option<Duration>>,
    tasks: Mutex<Option<LinkTasks>>,
    generation: AtomicU64,
    weak_self: Weak<TransportChannel>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TransportChannel {
    pub fn new(
        connector: Arc<dyn GatewayConnector>,
        settings: ChannelSettings,
        kind: ProtocolKind,
        handler: Weak<dyn InboundHandler>,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Pending);
        Arc::new_cyclic(|weak_self| Self {
            connector,
            settings,
            kind,
            handler,
            status,
            close_reason: Mutex::new(None),
            outbound: Mutex::new(None),
            heartbeat: Mutex::new(HeartbeatState::default()),
            latency: Mutex::new(None),
            tasks: Mutex::new(None),
            generation: AtomicU64::new(0),
            weak_self: weak_self.clone(),
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *lock(&self.close_reason)
    }

    pub fn latency(&self) -> Option<Duration> {
        *lock(&self.latency)
    }

    /// Establishes a link, bounded by the handshake timeout.
    ///
    /// A timeout closes the channel with [`CloseReason::TransportTimeout`];
    /// any other failure leaves it degraded so the user can retry.
    pub async fn open(&self, request: ConnectRequest) -> Result<(), TransportError> {
        self.drop_link();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_status(ConnectionStatus::Connecting, None);

        let attempt = tokio::time::timeout(
            self.settings.handshake_timeout,
            self.connector.open(request.clone()),
        )
        .await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return Err(TransportError::Closed);
        }

        let link = match attempt {
            Err(_) => {
                tracing::warn!(
                    connection_id = %request.connection_id,
                    session_id = %request.session_id,
                    timeout_ms = self.settings.handshake_timeout.as_millis() as u64,
                    "Gateway handshake timed out"
                );
                self.set_status(ConnectionStatus::Closed, Some(CloseReason::TransportTimeout));
                return Err(TransportError::Timeout);
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    connection_id = %request.connection_id,
                    session_id = %request.session_id,
                    error = %err,
                    "Gateway connection failed"
                );
                self.set_status(ConnectionStatus::Degraded, None);
                return Err(err);
            }
            Ok(Ok(link)) => link,
        };

        *lock(&self.outbound) = Some(link.outbound);
        *lock(&self.heartbeat) = HeartbeatState::default();
        self.set_status(ConnectionStatus::Open, None);
        tracing::info!(
            connection_id = %request.connection_id,
            session_id = %request.session_id,
            mode = request.mode.as_str(),
            "Gateway link open"
        );

        let pump = tokio::spawn(pump_inbound(
            self.weak_self.clone(),
            generation,
            link.inbound,
        ));
        let heartbeat = tokio::spawn(drive_heartbeat(
            self.weak_self.clone(),
            generation,
            self.settings.heartbeat_interval,
        ));
        *lock(&self.tasks) = Some(LinkTasks { pump, heartbeat });
        Ok(())
    }

    pub fn send(&self, message: Outbound) -> SendOutcome {
        let status = self.status();
        if status != ConnectionStatus::Open {
            tracing::debug!(status = ?status, "Channel not open; outbound message dropped");
            return SendOutcome::Dropped;
        }
        self.push(message.into())
    }

    pub fn heartbeat(&self) {
        let status = self.status();
        if !matches!(status, ConnectionStatus::Open | ConnectionStatus::Degraded) {
            return;
        }
        let limit = self.settings.missed_heartbeat_limit;
        let (nonce, missed, degrade) = {
            let mut state = lock(&self.heartbeat);
            let mut degrade = false;
            if state.outstanding.is_some() {
                state.missed = state.missed.saturating_add(1);
                degrade = state.missed >= limit && status == ConnectionStatus::Open;
            }
            state.next_nonce += 1;
            state.outstanding = Some((state.next_nonce, Instant::now()));
            (state.next_nonce, state.missed, degrade)
        };
        if degrade {
            tracing::warn!(missed, "Heartbeats unanswered; channel degraded");
            self.set_status(ConnectionStatus::Degraded, None);
        }
        self.push(ControlMessage::Ping { nonce }.into());
    }

    pub fn missed_heartbeats(&self) -> u32 {
        lock(&self.heartbeat).missed
    }

    pub fn close(&self, reason: CloseReason) {
        self.drop_link();
        self.set_status(ConnectionStatus::Closed, Some(reason));
    }

    fn drop_link(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        lock(&self.outbound).take();
        if let Some(tasks) = lock(&self.tasks).take() {
            tasks.heartbeat.abort();
            tasks.pump.abort();
        }
    }

    fn push(&self, message: WireMessage) -> SendOutcome {
        let Some(sender) = lock(&self.outbound).clone() else {
            tracing::debug!("No gateway link; outbound message dropped");
            return SendOutcome::Dropped;
        };
        match sender.try_send(message) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Outbound queue full; message dropped");
                SendOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Gateway link closed; outbound message dropped");
                SendOutcome::Dropped
            }
        }
    }

    fn set_status(&self, status: ConnectionStatus, reason: Option<CloseReason>) {
        {
            let mut current = lock(&self.close_reason);
            if reason.is_some() || status != ConnectionStatus::Closed {
                *current = reason;
            }
        }
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed && let Some(handler) = self.handler.upgrade() {
            handler.on_status(status, reason);
        }
    }

    fn deliver(&self, message: WireMessage) {
        match wire::decode_inbound(self.kind, message) {
            Ok(Inbound::Control(ControlMessage::Ping { nonce })) => {
                self.push(ControlMessage::Pong { nonce }.into());
            }
            Ok(Inbound::Control(ControlMessage::Pong { nonce })) => self.record_pong(nonce),
            Ok(inbound) => {
                if let Some(handler) = self.handler.upgrade() {
                    handler.on_inbound(inbound);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "Dropping undecodable frame; requesting refresh");
                self.push(ControlMessage::Refresh { full: true }.into());
            }
        }
    }

    fn record_pong(&self, nonce: u64) {
        let rtt = {
            let mut state = lock(&self.heartbeat);
            match state.outstanding {
                Some((outstanding, sent_at)) if outstanding == nonce => {
                    state.outstanding = None;
                    state.missed = 0;
                    Some(sent_at.elapsed())
                }
                _ => None,
            }
        };
        let Some(rtt) = rtt else {
            tracing::debug!(nonce, "Ignoring stale pong");
            return;
        };
        *lock(&self.latency) = Some(rtt);
        if self.status() == ConnectionStatus::Degraded && lock(&self.outbound).is_some() {
            tracing::info!(rtt_ms = rtt.as_millis() as u64, "Heartbeat answered; channel open");
            self.set_status(ConnectionStatus::Open, None);
        }
    }

    fn link_closed(&self, clean: bool, reason: &str) {
        lock(&self.outbound).take();
        if let Some(tasks) = lock(&self.tasks).take() {
            tasks.heartbeat.abort();
        }
        if clean {
            tracing::info!(reason, "Remote end terminated the session");
            self.set_status(ConnectionStatus::Closed, Some(CloseReason::RemoteTerminated));
            if let Some(handler) = self.handler.upgrade() {
                handler.on_remote_terminated();
            }
        } else {
            tracing::warn!(reason, "Gateway link lost; channel degraded");
            self.set_status(ConnectionStatus::Degraded, None);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        if let Some(tasks) = lock(&self.tasks).take() {
            tasks.heartbeat.abort();
            tasks.pump.abort();
        }
    }
}

async fn pump_inbound(
    channel: Weak<TransportChannel>,
    generation: u64,
    mut inbound: mpsc::Receiver<LinkEvent>,
) {
    loop {
        let event = inbound.recv().await;
        let Some(channel) = channel.upgrade() else {
            return;
        };
        if !channel.is_current(generation) {
            return;
        }
        match event {
            Some(LinkEvent::Message(message)) => channel.deliver(message),
            Some(LinkEvent::Closed { clean, reason }) => {
                channel.link_closed(clean, &reason);
                return;
            }
            None => {
                channel.link_closed(false, "link dropped");
                return;
            }
        }
    }
}

async fn drive_heartbeat(channel: Weak<TransportChannel>, generation: u64, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(channel) = channel.upgrade() else {
            return;
        };
        if !channel.is_current(generation) {
            return;
        }
        channel.heartbeat();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        inbound: StdMutex<Vec<Inbound>>,
        statuses: StdMutex<Vec<ConnectionStatus>>,
        terminated: StdMutex<bool>,
    }

    impl InboundHandler for Recorder {
        fn on_inbound(&self, inbound: Inbound) {
            self.inbound.lock().unwrap().push(inbound);
        }

        fn on_status(&self, status: ConnectionStatus, _reason: Option<CloseReason>) {
            self.statuses.lock().unwrap().push(status);
        }

        fn on_remote_terminated(&self) {
            *self.terminated.lock().unwrap() = true;
        }
    }

    fn settings() -> ChannelSettings {
        ChannelSettings {
            handshake_timeout: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(3600),
            missed_heartbeat_limit: 3,
        }
    }

    fn request() -> ConnectRequest {
        ConnectRequest {
            connection_id: "1".into(),
            session_id: "100".into(),
            protocol: Protocol::Ssh,
            mode: AttachMode::Connect,
            resume_cursor: 0,
            cols: 80,
            rows: 24,
        }
    }

    #[tokio::test]
    async fn unanswered_heartbeats_degrade_and_pong_recovers() {
        let (connector, mut peers) = LoopbackConnector::new();
        let recorder = Arc::new(Recorder::default());
        let handler: Weak<dyn InboundHandler> = Arc::<Recorder>::downgrade(&recorder);
        let channel = TransportChannel::new(connector, settings(), ProtocolKind::TextStream, handler);
        channel.open(request()).await.expect("open");
        let mut peer = peers.recv().await.expect("peer");

        for _ in 0..3 {
            channel.heartbeat();
            assert_eq!(channel.status(), ConnectionStatus::Open);
        }
        channel.heartbeat();
        assert_eq!(channel.missed_heartbeats(), 3);
        assert_eq!(channel.status(), ConnectionStatus::Degraded);
        assert_eq!(channel.send(Outbound::Bytes(b"ls".to_vec())), SendOutcome::Dropped);

        let mut last_nonce = 0;
        while let Some(ControlMessage::Ping { nonce }) = peer.try_recv_control() {
            last_nonce = nonce;
        }
        assert_eq!(last_nonce, 4);
        peer.send_control(ControlMessage::Pong { nonce: last_nonce }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(channel.status(), ConnectionStatus::Open);
        assert_eq!(channel.missed_heartbeats(), 0);
        assert!(channel.latency().is_some());
    }

    #[tokio::test]
    async fn clean_close_terminates_and_unclean_close_degrades() {
        let (connector, mut peers) = LoopbackConnector::new();
        let recorder = Arc::new(Recorder::default());
        let handler: Weak<dyn InboundHandler> = Arc::<Recorder>::downgrade(&recorder);
        let channel = TransportChannel::new(connector, settings(), ProtocolKind::TextStream, handler);

        channel.open(request()).await.expect("open");
        let peer = peers.recv().await.expect("peer");
        peer.close(false).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(channel.status(), ConnectionStatus::Degraded);
        assert!(!*recorder.terminated.lock().unwrap());

        channel.open(request()).await.expect("reopen");
        let peer = peers.recv().await.expect("peer");
        peer.close(true).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(channel.status(), ConnectionStatus::Closed);
        assert_eq!(channel.close_reason(), Some(CloseReason::RemoteTerminated));
        assert!(*recorder.terminated.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_handshake_closes_with_timeout() {
        let (connector, _peers) = LoopbackConnector::new();
        connector.set_behaviour(LoopbackBehaviour::Stall);
        let recorder = Arc::new(Recorder::default());
        let handler: Weak<dyn InboundHandler> = Arc::<Recorder>::downgrade(&recorder);
        let channel = TransportChannel::new(connector, settings(), ProtocolKind::TextStream, handler);

        let err = channel.open(request()).await.expect_err("timeout");
        assert_eq!(err, TransportError::Timeout);
        assert_eq!(channel.status(), ConnectionStatus::Closed);
        assert_eq!(channel.close_reason(), Some(CloseReason::TransportTimeout));
    }

    #[tokio::test]
    async fn undecodable_frame_requests_refresh() {
        let (connector, mut peers) = LoopbackConnector::new();
        let recorder = Arc::new(Recorder::default());
        let handler: Weak<dyn InboundHandler> = Arc::<Recorder>::downgrade(&recorder);
        let channel = TransportChannel::new(connector, settings(), ProtocolKind::Framebuffer, handler);
        channel.open(request()).await.expect("open");
        let mut peer = peers.recv().await.expect("peer");

        peer.send_text(r#"{"width":4,"height":4,"encodedImage":"@@"}"#).await;
        let control = peer.recv_control().await.expect("refresh request");
        assert_eq!(control, ControlMessage::Refresh { full: true });
        assert_eq!(channel.status(), ConnectionStatus::Open);
        assert!(recorder.inbound.lock().unwrap().is_empty());
    }
}
