use crate::config::{GatewayConfig, SessionConfig};
use crate::error::{ApiError, ErrorCode, MuxResult};
use crate::persistence::PersistenceAdapter;
use crate::session::prompt::{PromptDescriptor, PromptDetail, PromptKind, PromptOutcome};
use crate::session::{
    ConnectionDescriptor, Encoding, PairKey, Session, SessionEnv, SessionHandle, SessionIdentity,
    SessionParams, SessionSnapshot, TabKey, TabSnapshot,
};
use crate::transport::{CloseReason, ConnectionStatus, GatewayConnector, ImageFormat};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, broadcast, mpsc};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    TabsChanged {
        tabs: Vec<SessionSnapshot>,
        active: Option<TabKey>,
    },
    Status {
        tab_key: TabKey,
        status: ConnectionStatus,
        close_reason: Option<CloseReason>,
    },
    Output {
        tab_key: TabKey,
        cursor: u64,
        chunk: String,
        encoding: Encoding,
    },
    Frame {
        tab_key: TabKey,
        width: u32,
        height: u32,
        format: ImageFormat,
        encoded_image: String,
    },
    Prompt {
        tab_key: TabKey,
        prompt: PromptDescriptor,
    },
    PromptResolved {
        tab_key: TabKey,
        prompt_id: u64,
        outcome: PromptOutcome,
    },
    PromptObserved {
        tab_key: TabKey,
        kind: PromptKind,
        detail: PromptDetail,
    },
    Clipboard {
        tab_key: TabKey,
        text: String,
    },
}

#[derive(Debug, Clone)]
pub enum RegistrySignal {
    RemoteTerminated { pair: PairKey, tab_key: TabKey },
}

#[derive(Clone)]
pub enum CreateOutcome {
    Created(SessionHandle),
    Existing(SessionHandle),
}

impl CreateOutcome {
    pub fn handle(&self) -> &SessionHandle {
        match self {
            CreateOutcome::Created(handle) | CreateOutcome::Existing(handle) => handle,
        }
    }

    pub fn into_handle(self) -> SessionHandle {
        match self {
            CreateOutcome::Created(handle) | CreateOutcome::Existing(handle) => handle,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// Keeps one item per pair: the one with the greatest timestamp, the later
/// position on ties. Survivors keep their relative order.
pub fn dedupe_by_latest<T>(items: Vec<T>, key: impl Fn(&T) -> (PairKey, u64)) -> Vec<T> {
    let mut best: HashMap<PairKey, (usize, u64)> = HashMap::new();
    for (index, item) in items.iter().enumerate() {
        let (pair, timestamp) = key(item);
        match best.get(&pair) {
            Some(&(_, current)) if current > timestamp => {}
            _ => {
                best.insert(pair, (index, timestamp));
            }
        }
    }
    items
        .into_iter()
        .enumerate()
        .filter(|(index, item)| {
            let (pair, _) = key(item);
            best.get(&pair).is_some_and(|&(winner, _)| winner == *index)
        })
        .map(|(_, item)| item)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    User,
    Restore,
}

#[derive(Default)]
struct RegistryState {
    entries: Vec<SessionHandle>,
    active: Option<PairKey>,
}

impl RegistryState {
    fn position(&self, tab_key: &TabKey) -> Option<usize> {
        self.entries
            .iter()
            .position(|session| &session.tab_key() == tab_key)
    }

    fn live_position(&self, pair: &PairKey) -> Option<usize> {
        self.entries
            .iter()
            .position(|session| &session.pair() == pair && session.status().is_live())
    }

    fn active_tab(&self) -> Option<TabKey> {
        let active = self.active.as_ref()?;
        self.entries
            .iter()
            .find(|session| &session.pair() == active)
            .map(|session| session.tab_key())
    }

    fn is_active(&self, session: &Session) -> bool {
        self.active.as_ref() == Some(&session.pair())
    }
}

pub struct Registry {
    state: Mutex<RegistryState>,
    events: broadcast::Sender<RegistryEvent>,
    signals: mpsc::UnboundedSender<RegistrySignal>,
    connector: Arc<dyn GatewayConnector>,
    gateway: GatewayConfig,
    session_config: SessionConfig,
    persistence: Option<Arc<PersistenceAdapter>>,
}

impl Registry {
    pub fn new(
        connector: Arc<dyn GatewayConnector>,
        gateway: GatewayConfig,
        session_config: SessionConfig,
        persistence: Option<Arc<PersistenceAdapter>>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (signals, receiver) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            state: Mutex::new(RegistryState::default()),
            events,
            signals,
            connector,
            gateway,
            session_config,
            persistence,
        });
        tokio::spawn(pump_signals(Arc::downgrade(&registry), receiver));
        registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn persistence(&self) -> Option<&Arc<PersistenceAdapter>> {
        self.persistence.as_ref()
    }

    /// Adds a session for `identity`, or activates the live session that
    /// already holds the same `(connectionId, sessionId)`.
    ///
    /// A duplicate whose tab key is at least as recent re-keys the existing
    /// session; an older one is discarded.
    pub async fn create(
        &self,
        identity: SessionIdentity,
        descriptor: ConnectionDescriptor,
    ) -> MuxResult<CreateOutcome> {
        self.insert(identity, descriptor, Origin::User).await
    }

    pub async fn restore_tab(&self, snapshot: TabSnapshot) -> MuxResult<CreateOutcome> {
        let identity = snapshot.identity();
        self.insert(identity, snapshot.descriptor, Origin::Restore)
            .await
    }

    async fn insert(
        &self,
        identity: SessionIdentity,
        descriptor: ConnectionDescriptor,
        origin: Origin,
    ) -> MuxResult<CreateOutcome> {
        if descriptor.connection_id != identity.connection_id {
            return Err(ApiError::new(
                ErrorCode::InvalidArgument,
                "Descriptor does not belong to this connection",
            )
            .with_details(identity.connection_id)
            .into());
        }
        let pair = identity.pair();
        let mut state = self.state.lock().await;

        if let Some(index) = state.position(&identity.tab_key)
            && state.entries[index].pair() != pair
        {
            return Err(ApiError::new(
                ErrorCode::InvalidArgument,
                "Tab key already belongs to another session",
            )
            .with_details(identity.tab_key.to_string())
            .into());
        }

        if let Some(index) = state.live_position(&pair) {
            let existing = state.entries[index].clone();
            let current = existing.tab_key();
            if current != identity.tab_key {
                if identity.tab_key.timestamp() >= current.timestamp() {
                    existing.rekey(identity.tab_key.clone());
                } else {
                    tracing::debug!(
                        stale = %identity.tab_key,
                        current = %current,
                        "Discarding stale duplicate create"
                    );
                }
            }
            tracing::debug!(pair = %pair, tab_key = %existing.tab_key(), "Duplicate create activates existing session");
            state.active = Some(pair);
            self.publish(&state, origin);
            return Ok(CreateOutcome::Existing(existing));
        }

        let session = Session::new(SessionParams {
            identity,
            descriptor,
            connector: self.connector.clone(),
            gateway: self.gateway.clone(),
            session: self.session_config.clone(),
            env: SessionEnv::new(self.events.clone(), self.signals.clone()),
        });

        let replaced = state
            .entries
            .iter()
            .position(|entry| entry.pair() == pair);
        match replaced {
            Some(index) => {
                tracing::info!(pair = %pair, "Replacing closed session");
                state.entries[index] = session.clone();
            }
            None => {
                let max = self.session_config.max_sessions;
                if max > 0 && state.entries.len() >= max {
                    return Err(ApiError::new(ErrorCode::InvalidArgument, "Session limit reached")
                        .with_details(max.to_string())
                        .into());
                }
                state.entries.push(session.clone());
            }
        }
        state.active = Some(pair);

        if origin == Origin::User
            && let Some(persistence) = &self.persistence
        {
            log_storage(persistence.recovery().clear_all_closed(), "clear all_closed");
        }
        tracing::info!(
            tab_key = %session.tab_key(),
            connection_id = %session.descriptor.connection_id,
            protocol = session.descriptor.protocol.as_str(),
            restored = origin == Origin::Restore,
            "Session created"
        );
        self.publish(&state, origin);
        Ok(CreateOutcome::Created(session))
    }

    pub async fn activate(&self, tab_key: &TabKey) -> MuxResult<SessionHandle> {
        let mut state = self.state.lock().await;
        let index = state
            .position(tab_key)
            .ok_or_else(|| ApiError::unknown_tab(tab_key.as_str()))?;
        let session = state.entries[index].clone();
        state.active = Some(session.pair());
        self.publish(&state, Origin::User);
        Ok(session)
    }

    pub async fn close(&self, tab_key: &TabKey) -> MuxResult<()> {
        let mut state = self.state.lock().await;
        let index = state
            .position(tab_key)
            .ok_or_else(|| ApiError::unknown_tab(tab_key.as_str()))?;
        if let Some(persistence) = &self.persistence {
            log_storage(persistence.recovery().mark_closing(), "mark closing_in_progress");
        }
        let session = state.entries[index].clone();
        session.shutdown();
        self.remove_at(&mut state, index);
        if let Some(persistence) = &self.persistence {
            log_storage(persistence.recovery().clear_closing(), "clear closing_in_progress");
        }
        tracing::info!(tab_key = %tab_key, "Session closed");
        self.publish(&state, Origin::User);
        Ok(())
    }

    async fn remote_terminated(&self, pair: PairKey, tab_key: TabKey) {
        let mut state = self.state.lock().await;
        let Some(index) = state.entries.iter().position(|session| {
            session.pair() == pair && session.close_reason() == Some(CloseReason::RemoteTerminated)
        }) else {
            return;
        };
        tracing::info!(tab_key = %tab_key, pair = %pair, "Removing remotely terminated session");
        self.remove_at(&mut state, index);
        self.publish(&state, Origin::User);
    }

    fn remove_at(&self, state: &mut RegistryState, index: usize) {
        let session = state.entries.remove(index);
        if state.is_active(&session) {
            state.active = state
                .entries
                .get(index)
                .or_else(|| index.checked_sub(1).and_then(|left| state.entries.get(left)))
                .map(|neighbour| neighbour.pair());
        }
        let Some(persistence) = &self.persistence else {
            return;
        };
        let recovery = persistence.recovery();
        log_storage(
            recovery.mark_recently_closed(&session.tab_key()),
            "mark recently_closed",
        );
        if state.entries.is_empty() {
            log_storage(recovery.mark_all_closed(), "mark all_closed");
        }
    }

    pub async fn list(&self) -> Vec<SessionSnapshot> {
        let state = self.state.lock().await;
        snapshots(&state)
    }

    pub async fn tab_snapshots(&self) -> Vec<TabSnapshot> {
        let state = self.state.lock().await;
        tab_snapshots(&state)
    }

    pub async fn get(&self, tab_key: &TabKey) -> MuxResult<SessionHandle> {
        let state = self.state.lock().await;
        state
            .position(tab_key)
            .map(|index| state.entries[index].clone())
            .ok_or_else(|| ApiError::unknown_tab(tab_key.as_str()).into())
    }

    pub async fn active(&self) -> Option<SessionHandle> {
        let state = self.state.lock().await;
        let active = state.active.as_ref()?;
        state
            .entries
            .iter()
            .find(|session| &session.pair() == active)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    fn publish(&self, state: &RegistryState, origin: Origin) {
        let _ = self.events.send(RegistryEvent::TabsChanged {
            tabs: snapshots(state),
            active: state.active_tab(),
        });
        if origin == Origin::Restore {
            return;
        }
        if let Some(persistence) = &self.persistence {
            let active = state.active_tab();
            log_storage(
                persistence.snapshot(&tab_snapshots(state), active.as_ref()),
                "snapshot tabs",
            );
        }
    }
}

fn snapshots(state: &RegistryState) -> Vec<SessionSnapshot> {
    state
        .entries
        .iter()
        .map(|session| session.snapshot(state.is_active(session)))
        .collect()
}

fn tab_snapshots(state: &RegistryState) -> Vec<TabSnapshot> {
    state
        .entries
        .iter()
        .map(|session| session.tab_snapshot(state.is_active(session)))
        .collect()
}

fn log_storage(result: MuxResult<()>, action: &str) {
    if let Err(err) = result {
        tracing::warn!(error = %err, action, "Durable storage write failed");
    }
}

async fn pump_signals(
    registry: Weak<Registry>,
    mut signals: mpsc::UnboundedReceiver<RegistrySignal>,
) {
    while let Some(signal) = signals.recv().await {
        let Some(registry) = registry.upgrade() else {
            return;
        };
        match signal {
            RegistrySignal::RemoteTerminated { pair, tab_key } => {
                registry.remote_terminated(pair, tab_key).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Protocol;
    use crate::transport::LoopbackConnector;

    fn pair(connection_id: &str, session_id: &str) -> PairKey {
        PairKey {
            connection_id: connection_id.into(),
            session_id: session_id.into(),
        }
    }

    fn descriptor(connection_id: &str) -> ConnectionDescriptor {
        ConnectionDescriptor {
            connection_id: connection_id.into(),
            name: format!("host-{connection_id}"),
            protocol: Protocol::Ssh,
            host: "10.0.0.1".into(),
            port: 22,
            username: None,
        }
    }

    fn registry(max_sessions: usize) -> Arc<Registry> {
        let (connector, _peers) = LoopbackConnector::new();
        Registry::new(
            connector,
            GatewayConfig::default(),
            SessionConfig {
                max_sessions,
                ..SessionConfig::default()
            },
            None,
        )
    }

    fn identity(connection_id: &str, session_id: &str, millis: u64) -> SessionIdentity {
        SessionIdentity::new(
            connection_id,
            session_id,
            TabKey::from_parts(millis, "0000abcd"),
        )
    }

    #[test]
    fn dedupe_keeps_latest_and_later_on_ties() {
        let items = vec![
            (pair("1", "100"), 10, "a"),
            (pair("2", "200"), 5, "b"),
            (pair("1", "100"), 30, "c"),
            (pair("1", "100"), 20, "d"),
            (pair("2", "200"), 5, "e"),
        ];
        let kept = dedupe_by_latest(items, |(pair, ts, _)| (pair.clone(), *ts));
        let names: Vec<_> = kept.iter().map(|(_, _, name)| *name).collect();
        assert_eq!(names, vec!["c", "e"]);
    }

    #[tokio::test]
    async fn duplicate_create_rekeys_to_latest() {
        let registry = registry(8);
        let first = registry
            .create(identity("1", "100", 1_000), descriptor("1"))
            .await
            .expect("create");
        assert!(first.is_created());

        let second = registry
            .create(identity("1", "100", 2_000), descriptor("1"))
            .await
            .expect("duplicate");
        assert!(!second.is_created());
        assert!(Arc::ptr_eq(first.handle(), second.handle()));
        assert_eq!(registry.len().await, 1);
        let active = registry.active().await.expect("active");
        assert_eq!(active.tab_key().timestamp(), 2_000);

        registry
            .create(identity("1", "100", 1_500), descriptor("1"))
            .await
            .expect("stale duplicate");
        assert_eq!(active.tab_key().timestamp(), 2_000);
    }

    #[tokio::test]
    async fn close_activates_right_then_left_neighbour() {
        let registry = registry(8);
        for (n, session) in ["a", "b", "c"].iter().enumerate() {
            registry
                .create(identity("1", session, 100 + n as u64), descriptor("1"))
                .await
                .expect("create");
        }
        let tabs = registry.list().await;
        assert_eq!(tabs.len(), 3);

        registry.activate(&tabs[1].tab_key).await.expect("activate");
        registry.close(&tabs[1].tab_key).await.expect("close b");
        assert_eq!(registry.active().await.expect("active").tab_key(), tabs[2].tab_key);

        registry.close(&tabs[2].tab_key).await.expect("close c");
        assert_eq!(registry.active().await.expect("active").tab_key(), tabs[0].tab_key);

        registry.close(&tabs[0].tab_key).await.expect("close a");
        assert!(registry.active().await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn unknown_tab_and_limit_are_errors() {
        let registry = registry(1);
        let err = registry
            .activate(&TabKey::from("tab-1-missing"))
            .await
            .err()
            .expect("unknown");
        assert_eq!(err.code(), ErrorCode::UnknownTab);

        registry
            .create(identity("1", "100", 1), descriptor("1"))
            .await
            .expect("create");
        let err = registry
            .create(identity("1", "101", 2), descriptor("1"))
            .await
            .err()
            .expect("limit");
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn list_keeps_insertion_order() {
        let registry = registry(8);
        for (n, session) in ["x", "y", "z"].iter().enumerate() {
            registry
                .create(identity("9", session, 10 + n as u64), descriptor("9"))
                .await
                .expect("create");
        }
        let tabs = registry.list().await;
        registry.activate(&tabs[0].tab_key).await.expect("activate");
        let order: Vec<_> = registry
            .list()
            .await
            .into_iter()
            .map(|tab| tab.session_id)
            .collect();
        assert_eq!(order, vec!["x", "y", "z"]);
    }

    #[tokio::test]
    async fn tab_key_held_by_another_pair_is_rejected() {
        let registry = registry(8);
        let first = registry
            .create(identity("1", "100", 5), descriptor("1"))
            .await
            .expect("create");
        let err = registry
            .create(identity("1", "200", 5), descriptor("1"))
            .await
            .err()
            .expect("collision");
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        assert_eq!(registry.len().await, 1);

        registry
            .create(identity("1", "200", 6), descriptor("1"))
            .await
            .expect("second pair");
        let err = registry
            .create(identity("1", "200", 5), descriptor("1"))
            .await
            .err()
            .expect("rekey collision");
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        assert_eq!(first.handle().tab_key().timestamp(), 5);

        registry
            .close(&first.handle().tab_key())
            .await
            .expect("close");
        let tabs = registry.list().await;
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].session_id, "200");
        assert_eq!(tabs[0].tab_key.timestamp(), 6);
    }
}
