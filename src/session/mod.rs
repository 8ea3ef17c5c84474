mod buffer;
pub mod prompt;

use crate::config::{GatewayConfig, SessionConfig};
use crate::error::{ApiError, ErrorCode, MuxResult};
use crate::registry::{RegistryEvent, RegistrySignal};
use crate::transport::{
    AttachMode, ChannelSettings, CloseReason, ConnectRequest, ConnectionStatus, ControlMessage,
    GatewayConnector, Inbound, InboundHandler, Outbound, SendOutcome, TransportChannel,
    TransportError, VideoFrame,
};
use bytes::Bytes;
use prompt::{PromptClassifier, PromptDescriptor, PromptKind, PromptOutcome, PromptResolution};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

pub use buffer::{BufferSlice, OutputBuffer};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ssh,
    Telnet,
    Rdp,
    Vnc,
}

impl Protocol {
    pub fn kind(self) -> ProtocolKind {
        match self {
            Protocol::Ssh | Protocol::Telnet => ProtocolKind::TextStream,
            Protocol::Rdp | Protocol::Vnc => ProtocolKind::Framebuffer,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Ssh => 22,
            Protocol::Telnet => 23,
            Protocol::Rdp => 3389,
            Protocol::Vnc => 5900,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Ssh => "ssh",
            Protocol::Telnet => "telnet",
            Protocol::Rdp => "rdp",
            Protocol::Vnc => "vnc",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    TextStream,
    Framebuffer,
}

static LAST_TAB_MILLIS: AtomicU64 = AtomicU64::new(0);

/// Local tab address: `tab-<unix-millis>-<8 hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabKey(String);

impl TabKey {
    /// A fresh key whose timestamp is strictly greater than any key this
    /// process generated before.
    pub fn generate() -> Self {
        let now = now_ms();
        let mut last = LAST_TAB_MILLIS.load(Ordering::SeqCst);
        let millis = loop {
            let next = now.max(last + 1);
            match LAST_TAB_MILLIS.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break next,
                Err(actual) => last = actual,
            }
        };
        let suffix = Uuid::new_v4().simple().to_string();
        Self::from_parts(millis, &suffix[..8])
    }

    pub fn from_parts(millis: u64, suffix: &str) -> Self {
        Self(format!("tab-{millis}-{suffix}"))
    }

    pub fn timestamp(&self) -> u64 {
        self.0
            .strip_prefix("tab-")
            .and_then(|rest| rest.split('-').next())
            .and_then(|millis| millis.parse().ok())
            .unwrap_or(0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TabKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TabKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TabKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairKey {
    pub connection_id: String,
    pub session_id: String,
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connection_id, self.session_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub connection_id: String,
    pub session_id: String,
    pub tab_key: TabKey,
}

impl SessionIdentity {
    pub fn new(
        connection_id: impl Into<String>,
        session_id: impl Into<String>,
        tab_key: TabKey,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            session_id: session_id.into(),
            tab_key,
        }
    }

    pub fn pair(&self) -> PairKey {
        PairKey {
            connection_id: self.connection_id.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

/// Where a session connects to. Never carries credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub connection_id: String,
    #[serde(default)]
    pub name: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl ConnectionDescriptor {
    pub fn title(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        match &self.username {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum Encoding {
    #[serde(rename = "utf-8", alias = "utf8", alias = "utf_8")]
    #[default]
    Utf8,
    #[serde(rename = "base64")]
    Base64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NamedKey {
    Enter,
    Tab,
    Backspace,
    Delete,
    Home,
    End,
    #[serde(alias = "ctrl+c", alias = "ctrl-c")]
    CtrlC,
    #[serde(alias = "ctrl+d", alias = "ctrl-d")]
    CtrlD,
    #[serde(alias = "ctrl+z", alias = "ctrl-z")]
    CtrlZ,
    #[serde(alias = "ctrl+l", alias = "ctrl-l")]
    CtrlL,
    Esc,
    #[serde(alias = "arrow-up")]
    ArrowUp,
    #[serde(alias = "arrow-down")]
    ArrowDown,
    #[serde(alias = "arrow-left")]
    ArrowLeft,
    #[serde(alias = "arrow-right")]
    ArrowRight,
    #[serde(alias = "page-up")]
    PageUp,
    #[serde(alias = "page-down")]
    PageDown,
}

impl NamedKey {
    pub fn as_str(self) -> &'static str {
        match self {
            NamedKey::Enter => "enter",
            NamedKey::Tab => "tab",
            NamedKey::Backspace => "backspace",
            NamedKey::Delete => "delete",
            NamedKey::Home => "home",
            NamedKey::End => "end",
            NamedKey::CtrlC => "ctrl_c",
            NamedKey::CtrlD => "ctrl_d",
            NamedKey::CtrlZ => "ctrl_z",
            NamedKey::CtrlL => "ctrl_l",
            NamedKey::Esc => "esc",
            NamedKey::ArrowUp => "arrow_up",
            NamedKey::ArrowDown => "arrow_down",
            NamedKey::ArrowLeft => "arrow_left",
            NamedKey::ArrowRight => "arrow_right",
            NamedKey::PageUp => "page_up",
            NamedKey::PageDown => "page_down",
        }
    }
}

pub fn key_bytes(protocol: Protocol, key: NamedKey) -> Vec<u8> {
    match key {
        NamedKey::Enter => match protocol {
            Protocol::Telnet => vec![b'\r'],
            _ => vec![b'\n'],
        },
        NamedKey::Tab => vec![b'\t'],
        NamedKey::Backspace => vec![0x7f],
        NamedKey::Delete => b"\x1b[3~".to_vec(),
        NamedKey::Home => b"\x1b[H".to_vec(),
        NamedKey::End => b"\x1b[F".to_vec(),
        NamedKey::CtrlC => vec![0x03],
        NamedKey::CtrlD => vec![0x04],
        NamedKey::CtrlZ => vec![0x1a],
        NamedKey::CtrlL => vec![0x0c],
        NamedKey::Esc => vec![0x1b],
        NamedKey::ArrowUp => b"\x1b[A".to_vec(),
        NamedKey::ArrowDown => b"\x1b[B".to_vec(),
        NamedKey::ArrowLeft => b"\x1b[D".to_vec(),
        NamedKey::ArrowRight => b"\x1b[C".to_vec(),
        NamedKey::PageUp => b"\x1b[5~".to_vec(),
        NamedKey::PageDown => b"\x1b[6~".to_vec(),
    }
}

pub trait RenderSink: Send + Sync {
    fn write(&self, bytes: &[u8]);
    fn resize(&self, cols: u16, rows: u16);
    fn frame(&self, _frame: &VideoFrame) {}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputOutcome {
    Sent,
    Suspended,
    Dropped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub tab_key: TabKey,
    pub connection_id: String,
    pub session_id: String,
    pub title: String,
    pub protocol: Protocol,
    pub kind: ProtocolKind,
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<CloseReason>,
    pub active: bool,
    pub created_at: u64,
    pub last_activity_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_prompt: Option<PromptDescriptor>,
    pub buffer_start: u64,
    pub buffer_end: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TabSnapshot {
    pub connection_id: String,
    pub session_id: String,
    pub tab_key: TabKey,
    pub title: String,
    pub kind: ProtocolKind,
    pub descriptor: ConnectionDescriptor,
    #[serde(default)]
    pub active: bool,
}

impl TabSnapshot {
    pub fn identity(&self) -> SessionIdentity {
        SessionIdentity::new(
            self.connection_id.clone(),
            self.session_id.clone(),
            self.tab_key.clone(),
        )
    }

    pub fn pair(&self) -> PairKey {
        PairKey {
            connection_id: self.connection_id.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SessionEnv {
    pub(crate) events: broadcast::Sender<RegistryEvent>,
    pub(crate) signals: mpsc::UnboundedSender<RegistrySignal>,
}

impl SessionEnv {
    pub(crate) fn new(
        events: broadcast::Sender<RegistryEvent>,
        signals: mpsc::UnboundedSender<RegistrySignal>,
    ) -> Self {
        Self { events, signals }
    }

    pub fn detached() -> (Self, broadcast::Receiver<RegistryEvent>) {
        let (events, receiver) = broadcast::channel(256);
        let (signals, _) = mpsc::unbounded_channel();
        (Self { events, signals }, receiver)
    }
}

pub struct SessionParams {
    pub identity: SessionIdentity,
    pub descriptor: ConnectionDescriptor,
    pub connector: Arc<dyn GatewayConnector>,
    pub gateway: GatewayConfig,
    pub session: SessionConfig,
    pub env: SessionEnv,
}

struct PendingPrompt {
    descriptor: PromptDescriptor,
    timer: Option<JoinHandle<()>>,
}

struct SessionState {
    buffer: OutputBuffer,
    classifier: PromptClassifier,
    pending_prompt: Option<PendingPrompt>,
    frame: Option<VideoFrame>,
    sink: Option<Arc<dyn RenderSink>>,
    cols: u16,
    rows: u16,
    inbound_offset: Option<u64>,
}

pub type SessionHandle = Arc<Session>;

pub struct Session {
    identity: RwLock<SessionIdentity>,
    pub descriptor: ConnectionDescriptor,
    pub kind: ProtocolKind,
    channel: Arc<TransportChannel>,
    state: Mutex<SessionState>,
    notify: Notify,
    env: SessionEnv,
    prompt_timeout: Duration,
    created_at: u64,
    last_activity: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    prompt_seq: AtomicU64,
    weak_self: Weak<Session>,
}

impl Session {
    pub fn new(params: SessionParams) -> SessionHandle {
        let kind = params.descriptor.protocol.kind();
        let settings = ChannelSettings::from(&params.gateway);
        let now = now_ms();
        Arc::new_cyclic(|weak: &Weak<Session>| {
            let handler: Weak<dyn InboundHandler> = weak.clone();
            Session {
                identity: RwLock::new(params.identity),
                descriptor: params.descriptor,
                kind,
                channel: TransportChannel::new(params.connector, settings, kind, handler),
                state: Mutex::new(SessionState {
                    buffer: OutputBuffer::new(
                        params.session.output_buffer_max_bytes,
                        params.session.output_buffer_max_lines,
                    ),
                    classifier: PromptClassifier::new(params.session.prompt_history_bytes),
                    pending_prompt: None,
                    frame: None,
                    sink: None,
                    cols: params.session.default_cols,
                    rows: params.session.default_rows,
                    inbound_offset: None,
                }),
                notify: Notify::new(),
                env: params.env,
                prompt_timeout: Duration::from_secs(params.session.prompt_timeout_secs),
                created_at: now,
                last_activity: AtomicU64::new(now),
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                prompt_seq: AtomicU64::new(0),
                weak_self: weak.clone(),
            }
        })
    }

    pub fn identity(&self) -> SessionIdentity {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn tab_key(&self) -> TabKey {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tab_key
            .clone()
    }

    pub fn pair(&self) -> PairKey {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .pair()
    }

    pub(crate) fn rekey(&self, tab_key: TabKey) {
        let mut identity = self.identity.write().unwrap_or_else(PoisonError::into_inner);
        tracing::info!(from = %identity.tab_key, to = %tab_key, "Session re-keyed");
        identity.tab_key = tab_key;
    }

    pub fn status(&self) -> ConnectionStatus {
        self.channel.status()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.channel.close_reason()
    }

    pub fn channel(&self) -> &TransportChannel {
        &self.channel
    }

    pub async fn connect(&self) -> Result<(), TransportError> {
        self.attach(AttachMode::Connect).await
    }

    pub async fn resume(&self) -> Result<(), TransportError> {
        self.attach(AttachMode::Resume).await
    }

    async fn attach(&self, mode: AttachMode) -> Result<(), TransportError> {
        let identity = self.identity();
        let (resume_cursor, cols, rows) = {
            let state = self.lock_state();
            let cursor = match mode {
                AttachMode::Connect => 0,
                AttachMode::Resume => state.buffer.buffer_end(),
            };
            (cursor, state.cols, state.rows)
        };
        self.channel
            .open(ConnectRequest {
                connection_id: identity.connection_id,
                session_id: identity.session_id,
                protocol: self.descriptor.protocol,
                mode,
                resume_cursor,
                cols,
                rows,
            })
            .await
    }

    pub fn send_input(&self, bytes: &[u8]) -> InputOutcome {
        if self.has_pending_prompt() {
            tracing::debug!(tab_key = %self.tab_key(), "Prompt pending; input suspended");
            return InputOutcome::Suspended;
        }
        let outbound = match self.kind {
            ProtocolKind::TextStream => Outbound::Bytes(bytes.to_vec()),
            ProtocolKind::Framebuffer => Outbound::Control(ControlMessage::Key {
                key: String::from_utf8_lossy(bytes).into_owned(),
            }),
        };
        self.send_counted(outbound, bytes.len())
    }

    pub fn send_key(&self, key: NamedKey) -> InputOutcome {
        match self.kind {
            ProtocolKind::TextStream => self.send_input(&key_bytes(self.descriptor.protocol, key)),
            ProtocolKind::Framebuffer => {
                if self.has_pending_prompt() {
                    return InputOutcome::Suspended;
                }
                self.send_counted(
                    Outbound::Control(ControlMessage::Key {
                        key: key.as_str().to_string(),
                    }),
                    0,
                )
            }
        }
    }

    fn send_counted(&self, outbound: Outbound, len: usize) -> InputOutcome {
        match self.channel.send(outbound) {
            SendOutcome::Sent => {
                self.bytes_out.fetch_add(len as u64, Ordering::SeqCst);
                self.touch();
                InputOutcome::Sent
            }
            SendOutcome::Dropped => InputOutcome::Dropped,
        }
    }

    pub fn resize(&self, cols: u16, rows: u16) -> MuxResult<()> {
        if cols == 0 || rows == 0 {
            return Err(ApiError::new(ErrorCode::InvalidArgument, "cols and rows must be positive").into());
        }
        let sink = {
            let mut state = self.lock_state();
            state.cols = cols;
            state.rows = rows;
            state.sink.clone()
        };
        self.channel
            .send(Outbound::Control(ControlMessage::Resize { cols, rows }));
        if let Some(sink) = sink {
            sink.resize(cols, rows);
        }
        Ok(())
    }

    pub async fn refresh(&self) -> Result<(), TransportError> {
        match self.status() {
            ConnectionStatus::Degraded | ConnectionStatus::Closed | ConnectionStatus::Pending => {
                self.resume().await
            }
            ConnectionStatus::Connecting => Ok(()),
            ConnectionStatus::Open => {
                self.channel
                    .send(Outbound::Control(ControlMessage::Refresh { full: true }));
                Ok(())
            }
        }
    }

    pub fn send_clipboard(&self, text: String) -> SendOutcome {
        self.channel
            .send(Outbound::Control(ControlMessage::Clipboard { text }))
    }

    pub fn pending_prompt(&self) -> Option<PromptDescriptor> {
        self.lock_state()
            .pending_prompt
            .as_ref()
            .map(|pending| pending.descriptor.clone())
    }

    fn has_pending_prompt(&self) -> bool {
        self.lock_state().pending_prompt.is_some()
    }

    pub fn respond_to_prompt(&self, prompt_id: Option<u64>, response: String) -> MuxResult<()> {
        self.resolve_prompt(prompt_id, PromptResolution::Response(response))
    }

    pub fn cancel_prompt(&self, prompt_id: Option<u64>) -> MuxResult<()> {
        self.resolve_prompt(prompt_id, PromptResolution::Cancelled)
    }

    fn resolve_prompt(&self, prompt_id: Option<u64>, resolution: PromptResolution) -> MuxResult<()> {
        let (descriptor, bytes) = {
            let mut state = self.lock_state();
            let Some(pending) = state.pending_prompt.take() else {
                return Err(ApiError::new(ErrorCode::InvalidArgument, "No prompt is pending").into());
            };
            if let Some(id) = prompt_id
                && id != pending.descriptor.id
            {
                state.pending_prompt = Some(pending);
                return Err(ApiError::new(ErrorCode::InvalidArgument, "Prompt is no longer pending")
                    .with_details(id.to_string())
                    .into());
            }
            if let Some(timer) = pending.timer
                && resolution != PromptResolution::TimedOut
            {
                timer.abort();
            }
            let bytes = state
                .classifier
                .resolve(pending.descriptor.kind, &resolution);
            (pending.descriptor, bytes)
        };

        if !bytes.is_empty() && self.channel.send(Outbound::Bytes(bytes)) == SendOutcome::Dropped {
            tracing::warn!(tab_key = %self.tab_key(), "Prompt resolution could not be delivered");
        }
        let outcome = PromptOutcome::from(&resolution);
        if resolution == PromptResolution::TimedOut {
            tracing::info!(tab_key = %self.tab_key(), prompt_id = descriptor.id, kind = ?descriptor.kind, "Prompt timed out");
        }
        self.emit(RegistryEvent::PromptResolved {
            tab_key: self.tab_key(),
            prompt_id: descriptor.id,
            outcome,
        });
        Ok(())
    }

    fn expire_prompt(&self, prompt_id: u64) {
        let _ = self.resolve_prompt(Some(prompt_id), PromptResolution::TimedOut);
    }

    pub fn attach_sink(&self, sink: Arc<dyn RenderSink>) {
        let (bytes, frame, cols, rows) = {
            let mut state = self.lock_state();
            state.sink = Some(sink.clone());
            state.buffer.rewind_renderer();
            (
                state.buffer.take_unrendered(),
                state.frame.clone(),
                state.cols,
                state.rows,
            )
        };
        sink.resize(cols, rows);
        if !bytes.is_empty() {
            sink.write(&bytes);
        }
        if let Some(frame) = frame {
            sink.frame(&frame);
        }
    }

    pub fn latest_frame(&self) -> Option<VideoFrame> {
        self.lock_state().frame.clone()
    }

    pub fn tail(&self, max_bytes: usize) -> BufferSlice {
        self.lock_state().buffer.tail(max_bytes)
    }

    pub fn slice_from(&self, cursor: u64, max_bytes: usize) -> BufferSlice {
        self.lock_state().buffer.slice_from(cursor, max_bytes)
    }

    pub fn buffer_end_cursor(&self) -> u64 {
        self.lock_state().buffer.buffer_end()
    }

    pub fn buffer_start_cursor(&self) -> u64 {
        self.lock_state().buffer.buffer_start()
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.lock_state();
            if let Some(pending) = state.pending_prompt.take()
                && let Some(timer) = pending.timer
            {
                timer.abort();
            }
            state.classifier.reset();
            state.sink = None;
        }
        self.channel.close(CloseReason::User);
        self.notify.notify_waiters();
    }

    pub fn snapshot(&self, active: bool) -> SessionSnapshot {
        let identity = self.identity();
        let (buffer_start, buffer_end, pending_prompt) = {
            let state = self.lock_state();
            (
                state.buffer.buffer_start(),
                state.buffer.buffer_end(),
                state
                    .pending_prompt
                    .as_ref()
                    .map(|pending| pending.descriptor.clone()),
            )
        };
        SessionSnapshot {
            tab_key: identity.tab_key,
            connection_id: identity.connection_id,
            session_id: identity.session_id,
            title: self.descriptor.title(),
            protocol: self.descriptor.protocol,
            kind: self.kind,
            status: self.status(),
            close_reason: self.close_reason(),
            active,
            created_at: self.created_at,
            last_activity_at: self.last_activity.load(Ordering::SeqCst),
            latency_ms: self.channel.latency().map(|rtt| rtt.as_millis() as u64),
            pending_prompt,
            buffer_start,
            buffer_end,
            bytes_in: self.bytes_in.load(Ordering::SeqCst),
            bytes_out: self.bytes_out.load(Ordering::SeqCst),
        }
    }

    pub fn tab_snapshot(&self, active: bool) -> TabSnapshot {
        let identity = self.identity();
        TabSnapshot {
            connection_id: identity.connection_id,
            session_id: identity.session_id,
            tab_key: identity.tab_key,
            title: self.descriptor.title(),
            kind: self.kind,
            descriptor: self.descriptor.clone(),
            active,
        }
    }

    fn touch(&self) {
        self.last_activity.store(now_ms(), Ordering::SeqCst);
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.env.events.send(event);
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_data(&self, bytes: Bytes) {
        let tab_key = self.tab_key();
        let (cursor, appended, render, sink, found) = {
            let mut state = self.lock_state();
            let mut data: &[u8] = &bytes;
            if let Some(offset) = state.inbound_offset.take() {
                let end = state.buffer.buffer_end();
                if offset < end {
                    let overlap = (end - offset).min(data.len() as u64) as usize;
                    tracing::debug!(tab_key = %tab_key, overlap, "Trimming replayed output");
                    data = &data[overlap..];
                    // Replay may span several chunks; keep trimming until caught up.
                    let next = offset + bytes.len() as u64;
                    if next < end {
                        state.inbound_offset = Some(next);
                    }
                } else if offset > end {
                    tracing::warn!(tab_key = %tab_key, missing = offset - end, "Gap in resumed output");
                }
            }
            if data.is_empty() {
                return;
            }
            let cursor = state.buffer.buffer_end();
            let dropped = state.buffer.append(data);
            if dropped > 0 {
                tracing::warn!(
                    tab_key = %tab_key,
                    dropped_bytes = dropped,
                    "Output buffer overflowed; oldest data dropped"
                );
            }
            let found = match self.kind {
                ProtocolKind::TextStream => state.classifier.classify(data),
                ProtocolKind::Framebuffer => None,
            };
            let sink = state.sink.clone();
            let render = if sink.is_some() {
                state.buffer.take_unrendered()
            } else {
                Vec::new()
            };
            (cursor, data.to_vec(), render, sink, found)
        };

        self.bytes_in
            .fetch_add(appended.len() as u64, Ordering::SeqCst);
        self.touch();
        self.notify.notify_waiters();
        if let Some(sink) = sink
            && !render.is_empty()
        {
            sink.write(&render);
        }
        let (chunk, encoding) = encode_chunk(&appended, Encoding::Utf8);
        self.emit(RegistryEvent::Output {
            tab_key: tab_key.clone(),
            cursor,
            chunk,
            encoding,
        });
        if let Some(found) = found {
            self.surface_prompt(tab_key, found);
        }
    }

    fn surface_prompt(&self, tab_key: TabKey, found: prompt::Classification) {
        let kind = found.kind();
        if !kind.expects_input() {
            self.emit(RegistryEvent::PromptObserved {
                tab_key,
                kind,
                detail: found.detail,
            });
            return;
        }

        let id = self.prompt_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let descriptor =
            PromptDescriptor::from_classification(id, &found, self.prompt_timeout.as_secs());
        let timer = self.start_prompt_timer(id);
        {
            let mut state = self.lock_state();
            if let Some(previous) = state.pending_prompt.take()
                && let Some(timer) = previous.timer
            {
                timer.abort();
            }
            state.pending_prompt = Some(PendingPrompt {
                descriptor: descriptor.clone(),
                timer,
            });
        }
        tracing::debug!(tab_key = %tab_key, prompt_id = id, kind = ?kind, "Prompt detected");
        self.emit(RegistryEvent::Prompt {
            tab_key,
            prompt: descriptor,
        });
    }

    fn start_prompt_timer(&self, prompt_id: u64) -> Option<JoinHandle<()>> {
        if self.prompt_timeout.is_zero() {
            return None;
        }
        let weak = self.weak_self.clone();
        let deadline = Instant::now() + self.prompt_timeout;
        Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(session) = weak.upgrade() {
                session.expire_prompt(prompt_id);
            }
        }))
    }

    fn handle_frame(&self, frame: VideoFrame) {
        if self.kind != ProtocolKind::Framebuffer {
            tracing::debug!(tab_key = %self.tab_key(), "Ignoring frame on a text session");
            return;
        }
        let sink = {
            let mut state = self.lock_state();
            state.frame = Some(frame.clone());
            state.sink.clone()
        };
        self.touch();
        if let Some(sink) = sink {
            sink.frame(&frame);
        }
        self.emit(RegistryEvent::Frame {
            tab_key: self.tab_key(),
            width: frame.width,
            height: frame.height,
            format: frame.format,
            encoded_image: frame.encoded_image(),
        });
    }
}

impl InboundHandler for Session {
    fn on_inbound(&self, inbound: Inbound) {
        match inbound {
            Inbound::Data(bytes) => self.handle_data(bytes),
            Inbound::Frame(frame) => self.handle_frame(frame),
            Inbound::Control(ControlMessage::Sync { offset }) => {
                self.lock_state().inbound_offset = Some(offset);
            }
            Inbound::Control(ControlMessage::Clipboard { text }) => {
                self.emit(RegistryEvent::Clipboard {
                    tab_key: self.tab_key(),
                    text,
                });
            }
            Inbound::Control(other) => {
                tracing::debug!(tab_key = %self.tab_key(), control = ?other, "Ignoring control message");
            }
        }
    }

    fn on_status(&self, status: ConnectionStatus, reason: Option<CloseReason>) {
        self.touch();
        self.notify.notify_waiters();
        self.emit(RegistryEvent::Status {
            tab_key: self.tab_key(),
            status,
            close_reason: reason,
        });
    }

    fn on_remote_terminated(&self) {
        let _ = self.env.signals.send(RegistrySignal::RemoteTerminated {
            pair: self.pair(),
            tab_key: self.tab_key(),
        });
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

pub struct ReadResult {
    pub slice: BufferSlice,
    pub timed_out: bool,
    pub closed: bool,
    pub next_cursor: u64,
}

pub struct ReadParams {
    pub cursor: Option<u64>,
    pub timeout_ms: u64,
    pub max_bytes: usize,
}

/// Long-polls the output buffer from `cursor` until data arrives, the
/// session closes, or the timeout passes.
pub async fn read_output(session: &Session, params: ReadParams) -> ReadResult {
    let deadline = Instant::now() + Duration::from_millis(params.timeout_ms);
    let mut cursor = params
        .cursor
        .unwrap_or_else(|| session.buffer_end_cursor());

    loop {
        let notified = session.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let slice = session.slice_from(cursor, params.max_bytes);
        let closed = session.status() == ConnectionStatus::Closed;
        if !slice.bytes.is_empty() {
            let effective = if slice.truncated {
                slice.start_cursor
            } else {
                cursor
            };
            let next_cursor = effective + slice.bytes.len() as u64;
            return ReadResult {
                slice,
                timed_out: false,
                closed,
                next_cursor,
            };
        }
        if slice.truncated {
            cursor = slice.start_cursor;
        }
        if closed || Instant::now() >= deadline {
            return ReadResult {
                slice,
                timed_out: !closed,
                closed,
                next_cursor: cursor,
            };
        }

        tokio::select! {
            _ = &mut notified => {}
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }
}

pub fn encode_chunk(bytes: &[u8], requested: Encoding) -> (String, Encoding) {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    match requested {
        Encoding::Base64 => (STANDARD.encode(bytes), Encoding::Base64),
        Encoding::Utf8 => match std::str::from_utf8(bytes) {
            Ok(text) => (text.to_string(), Encoding::Utf8),
            Err(_) => (STANDARD.encode(bytes), Encoding::Base64),
        },
    }
}

pub fn decode_chunk(data: &str, encoding: &Encoding) -> MuxResult<Vec<u8>> {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    match encoding {
        Encoding::Utf8 => Ok(data.as_bytes().to_vec()),
        Encoding::Base64 => STANDARD.decode(data.as_bytes()).map_err(|err| {
            ApiError::new(ErrorCode::InvalidArgument, "Invalid base64")
                .with_details(err.to_string())
                .into()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LoopbackConnector, LoopbackPeer};

    struct CaptureSink {
        written: Mutex<Vec<u8>>,
        size: Mutex<(u16, u16)>,
    }

    impl RenderSink for CaptureSink {
        fn write(&self, bytes: &[u8]) {
            self.written.lock().unwrap().extend_from_slice(bytes);
        }

        fn resize(&self, cols: u16, rows: u16) {
            *self.size.lock().unwrap() = (cols, rows);
        }
    }

    async fn open_session(
        protocol: Protocol,
    ) -> (SessionHandle, LoopbackPeer, broadcast::Receiver<RegistryEvent>) {
        let (connector, mut peers) = LoopbackConnector::new();
        let (env, events) = SessionEnv::detached();
        let session = Session::new(SessionParams {
            identity: SessionIdentity::new("1", "100", TabKey::generate()),
            descriptor: ConnectionDescriptor {
                connection_id: "1".into(),
                name: "bastion".into(),
                protocol,
                host: "10.0.0.7".into(),
                port: protocol.default_port(),
                username: Some("ops".into()),
            },
            connector,
            gateway: GatewayConfig {
                heartbeat_interval_ms: 3_600_000,
                ..GatewayConfig::default()
            },
            session: SessionConfig::default(),
            env,
        });
        session.connect().await.expect("connect");
        let peer = peers.recv().await.expect("peer");
        (session, peer, events)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn tab_keys_are_monotonic_and_parse() {
        let first = TabKey::generate();
        let second = TabKey::generate();
        assert!(second.timestamp() > first.timestamp());
        assert!(first.as_str().starts_with("tab-"));
        assert_eq!(TabKey::from("garbage").timestamp(), 0);
        assert_eq!(TabKey::from_parts(1700, "abcd1234").timestamp(), 1700);
    }

    #[test]
    fn key_bytes_follow_protocol_line_endings() {
        assert_eq!(key_bytes(Protocol::Telnet, NamedKey::Enter), vec![b'\r']);
        assert_eq!(key_bytes(Protocol::Ssh, NamedKey::Enter), vec![b'\n']);
        assert_eq!(key_bytes(Protocol::Ssh, NamedKey::ArrowUp), b"\x1b[A".to_vec());
        let parsed: NamedKey = serde_json::from_str("\"ctrl+c\"").expect("alias");
        assert_eq!(parsed, NamedKey::CtrlC);
    }

    #[tokio::test]
    async fn password_prompt_suspends_input_until_answered() {
        let (session, mut peer, _events) = open_session(Protocol::Ssh).await;
        peer.send_bytes(b"Password: ").await;
        settle().await;

        let prompt = session.pending_prompt().expect("prompt pending");
        assert_eq!(prompt.kind, PromptKind::Password);
        assert!(prompt.masked);
        assert_eq!(session.send_input(b"ls\n"), InputOutcome::Suspended);

        session
            .respond_to_prompt(Some(prompt.id), "secret".into())
            .expect("respond");
        assert_eq!(peer.recv_bytes().await.expect("response").as_ref(), b"secret\n");
        assert!(session.pending_prompt().is_none());
        assert_eq!(session.send_input(b"ls\n"), InputOutcome::Sent);
    }

    #[tokio::test]
    async fn cancelling_sudo_prompt_sends_interrupt() {
        let (session, mut peer, _events) = open_session(Protocol::Ssh).await;
        peer.send_bytes(b"[sudo] password for ops: ").await;
        settle().await;
        session.cancel_prompt(None).expect("cancel");
        assert_eq!(peer.recv_bytes().await.expect("interrupt").as_ref(), &[0x03]);
        assert!(session.cancel_prompt(None).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn prompt_timeout_behaves_as_cancellation() {
        let (session, mut peer, mut events) = open_session(Protocol::Ssh).await;
        peer.send_bytes(b"login: ").await;
        settle().await;
        assert!(session.pending_prompt().is_some());

        tokio::time::sleep(Duration::from_secs(121)).await;
        assert!(session.pending_prompt().is_none());
        assert_eq!(peer.recv_bytes().await.expect("interrupt").as_ref(), &[0x03]);
        let mut saw_timeout = false;
        while let Ok(event) = events.try_recv() {
            if let RegistryEvent::PromptResolved { outcome, .. } = event {
                saw_timeout = outcome == PromptOutcome::TimedOut;
            }
        }
        assert!(saw_timeout);
    }

    #[tokio::test]
    async fn sync_offset_trims_replayed_output() {
        let (session, peer, _events) = open_session(Protocol::Ssh).await;
        peer.send_bytes(b"hello ").await;
        settle().await;
        assert_eq!(session.buffer_end_cursor(), 6);

        peer.send_control(ControlMessage::Sync { offset: 3 }).await;
        peer.send_bytes(b"lo world").await;
        settle().await;
        let slice = session.slice_from(0, 1024);
        assert_eq!(slice.bytes, b"hello world");
    }

    #[tokio::test]
    async fn replay_split_across_chunks_is_trimmed_once() {
        let (session, peer, _events) = open_session(Protocol::Ssh).await;
        peer.send_bytes(b"hello world").await;
        settle().await;

        peer.send_control(ControlMessage::Sync { offset: 0 }).await;
        peer.send_bytes(b"hello ").await;
        peer.send_bytes(b"world").await;
        peer.send_bytes(b"!").await;
        settle().await;
        assert_eq!(session.slice_from(0, 1024).bytes, b"hello world!");

        peer.send_bytes(b"\r\n").await;
        settle().await;
        assert_eq!(session.slice_from(0, 1024).bytes, b"hello world!\r\n");
    }

    #[tokio::test]
    async fn sink_receives_replay_then_live_output() {
        let (session, peer, _events) = open_session(Protocol::Ssh).await;
        peer.send_bytes(b"motd\r\n").await;
        settle().await;

        let sink = Arc::new(CaptureSink {
            written: Mutex::new(Vec::new()),
            size: Mutex::new((0, 0)),
        });
        session.attach_sink(sink.clone());
        assert_eq!(*sink.written.lock().unwrap(), b"motd\r\n");
        assert_eq!(*sink.size.lock().unwrap(), (120, 40));

        peer.send_bytes(b"$ ").await;
        settle().await;
        assert_eq!(*sink.written.lock().unwrap(), b"motd\r\n$ ");
        session.resize(100, 30).expect("resize");
        assert_eq!(*sink.size.lock().unwrap(), (100, 30));
    }

    #[tokio::test]
    async fn framebuffer_frames_replace_previous() {
        let (session, mut peer, _events) = open_session(Protocol::Vnc).await;
        let png = b"\x89PNG\r\n\x1a\n0000";
        peer.send_frame(640, 480, png).await;
        peer.send_frame(1024, 768, png).await;
        settle().await;
        let frame = session.latest_frame().expect("frame");
        assert_eq!((frame.width, frame.height), (1024, 768));

        assert_eq!(session.send_key(NamedKey::Enter), InputOutcome::Sent);
        assert_eq!(
            peer.recv_control().await.expect("key"),
            ControlMessage::Key {
                key: "enter".into()
            }
        );
    }

    #[tokio::test]
    async fn read_output_long_polls_for_new_bytes() {
        let (session, peer, _events) = open_session(Protocol::Ssh).await;
        let reader = {
            let session = session.clone();
            tokio::spawn(async move {
                read_output(
                    &session,
                    ReadParams {
                        cursor: Some(0),
                        timeout_ms: 2_000,
                        max_bytes: 1024,
                    },
                )
                .await
            })
        };
        settle().await;
        peer.send_bytes(b"uptime\r\n").await;
        let result = reader.await.expect("join");
        assert_eq!(result.slice.bytes, b"uptime\r\n");
        assert_eq!(result.next_cursor, 8);
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn shutdown_closes_with_user_reason() {
        let (session, _peer, _events) = open_session(Protocol::Telnet).await;
        session.shutdown();
        assert_eq!(session.status(), ConnectionStatus::Closed);
        assert_eq!(session.close_reason(), Some(CloseReason::User));
        assert_eq!(session.send_input(b"x"), InputOutcome::Dropped);
    }
}
