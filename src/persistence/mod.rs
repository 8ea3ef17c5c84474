mod store;

pub use store::{FileStore, KeyValueStore, MemoryStore, StoredValue};

use crate::config::PersistenceConfig;
use crate::error::MuxResult;
use crate::registry::{Registry, dedupe_by_latest};
use crate::session::{TabKey, TabSnapshot, now_ms};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const TABS_KEY: &str = "tabmux.tabs";
pub const ACTIVE_TAB_KEY: &str = "tabmux.active_tab";
pub const ALL_CLOSED_KEY: &str = "tabmux.flag.all_closed";
pub const CLOSING_KEY: &str = "tabmux.flag.closing_in_progress";
pub const RECENTLY_CLOSED_PREFIX: &str = "tabmux.flag.recently_closed:";

const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabSetDocument {
    pub version: u32,
    pub saved_at_ms: u64,
    #[serde(default)]
    pub writer: String,
    #[serde(default)]
    pub tabs: Vec<TabSnapshot>,
}

pub struct RecoveryState {
    store: Arc<dyn KeyValueStore>,
    all_closed_ttl: Duration,
    closing_ttl: Duration,
    recently_closed_ttl: Duration,
}

impl RecoveryState {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &PersistenceConfig) -> Self {
        Self {
            store,
            all_closed_ttl: config.all_closed_ttl(),
            closing_ttl: config.closing_ttl(),
            recently_closed_ttl: config.recently_closed_ttl(),
        }
    }

    pub fn mark_all_closed(&self) -> MuxResult<()> {
        self.mark(ALL_CLOSED_KEY, self.all_closed_ttl)
    }

    pub fn clear_all_closed(&self) -> MuxResult<()> {
        self.store.remove(ALL_CLOSED_KEY)
    }

    pub fn all_closed(&self) -> bool {
        self.is_set(ALL_CLOSED_KEY)
    }

    pub fn mark_closing(&self) -> MuxResult<()> {
        self.mark(CLOSING_KEY, self.closing_ttl)
    }

    pub fn clear_closing(&self) -> MuxResult<()> {
        self.store.remove(CLOSING_KEY)
    }

    pub fn closing_in_progress(&self) -> bool {
        self.is_set(CLOSING_KEY)
    }

    pub fn mark_recently_closed(&self, tab_key: &TabKey) -> MuxResult<()> {
        self.mark(&recently_closed_key(tab_key), self.recently_closed_ttl)
    }

    pub fn recently_closed(&self, tab_key: &TabKey) -> bool {
        self.is_set(&recently_closed_key(tab_key))
    }

    fn mark(&self, key: &str, ttl: Duration) -> MuxResult<()> {
        self.store
            .set(key, now_ms().to_string(), Some(ttl))
    }

    fn is_set(&self, key: &str) -> bool {
        match self.store.get(key) {
            Ok(value) => value.is_some(),
            Err(err) => {
                tracing::warn!(key, error = %err, "Failed to read recovery flag");
                false
            }
        }
    }
}

fn recently_closed_key(tab_key: &TabKey) -> String {
    format!("{}{}", RECENTLY_CLOSED_PREFIX, tab_key)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoredState {
    pub tabs: Vec<TabSnapshot>,
    pub active: Option<TabKey>,
}

impl RestoredState {
    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }
}

pub struct PersistenceAdapter {
    store: Arc<dyn KeyValueStore>,
    recovery: RecoveryState,
    snapshot_ttl: Duration,
    stagger: Duration,
    auto_resume: bool,
}

impl PersistenceAdapter {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &PersistenceConfig) -> Self {
        Self {
            recovery: RecoveryState::new(store.clone(), config),
            store,
            snapshot_ttl: config.snapshot_ttl(),
            stagger: config.restore_stagger(),
            auto_resume: config.auto_resume,
        }
    }

    pub fn from_config(config: &PersistenceConfig) -> MuxResult<Self> {
        let store: Arc<dyn KeyValueStore> = if config.state_path.is_empty() {
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(FileStore::open(&config.state_path)?)
        };
        Ok(Self::new(store, config))
    }

    pub fn recovery(&self) -> &RecoveryState {
        &self.recovery
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn snapshot(&self, tabs: &[TabSnapshot], active: Option<&TabKey>) -> MuxResult<()> {
        let tabs = dedupe_by_latest(tabs.to_vec(), |tab| (tab.pair(), tab.tab_key.timestamp()));
        let document = TabSetDocument {
            version: DOCUMENT_VERSION,
            saved_at_ms: now_ms(),
            writer: crate::version::writer_tag(),
            tabs,
        };
        self.store.set(
            TABS_KEY,
            serde_json::to_string(&document)?,
            Some(self.snapshot_ttl),
        )?;
        match active {
            Some(tab_key) => self.store.set(
                ACTIVE_TAB_KEY,
                tab_key.to_string(),
                Some(self.snapshot_ttl),
            ),
            None => self.store.remove(ACTIVE_TAB_KEY),
        }
    }

    /// Reads the persisted tab set without changing it.
    ///
    /// Empty while `all_closed` or `closing_in_progress` is set, and for a
    /// missing, corrupt, expired or unknown-version document. Tabs flagged
    /// `recently_closed` are left out.
    pub fn restore(&self) -> RestoredState {
        if self.recovery.all_closed() {
            tracing::info!("All tabs were closed deliberately; nothing to restore");
            return RestoredState::default();
        }
        if self.recovery.closing_in_progress() {
            tracing::info!("A close is still in progress; nothing to restore");
            return RestoredState::default();
        }

        let raw = match self.store.get(TABS_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return RestoredState::default(),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to read tab snapshot");
                return RestoredState::default();
            }
        };
        let document: TabSetDocument = match serde_json::from_str(&raw) {
            Ok(document) => document,
            Err(err) => {
                tracing::warn!(error = %err, "Tab snapshot is corrupt; ignoring it");
                return RestoredState::default();
            }
        };
        if document.version != DOCUMENT_VERSION {
            tracing::warn!(version = document.version, "Unsupported tab snapshot version");
            return RestoredState::default();
        }
        let age = now_ms().saturating_sub(document.saved_at_ms);
        if age > self.snapshot_ttl.as_millis() as u64 {
            tracing::info!(age_ms = age, "Tab snapshot expired");
            return RestoredState::default();
        }

        let tabs: Vec<TabSnapshot> =
            dedupe_by_latest(document.tabs, |tab| (tab.pair(), tab.tab_key.timestamp()))
                .into_iter()
                .filter(|tab| {
                    let closed = self.recovery.recently_closed(&tab.tab_key);
                    if closed {
                        tracing::debug!(tab_key = %tab.tab_key, "Skipping recently closed tab");
                    }
                    !closed
                })
                .collect();

        let saved_active = match self.store.get(ACTIVE_TAB_KEY) {
            Ok(value) => value.map(TabKey::from),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to read active tab");
                None
            }
        };
        let active = saved_active
            .filter(|key| tabs.iter().any(|tab| &tab.tab_key == key))
            .or_else(|| {
                tabs.iter()
                    .find(|tab| tab.active)
                    .map(|tab| tab.tab_key.clone())
            });
        RestoredState { tabs, active }
    }

    pub async fn rehydrate(&self, registry: &Registry, restored: RestoredState) -> usize {
        let mut first = None;
        let mut count = 0;
        for (index, tab) in restored.tabs.into_iter().enumerate() {
            if index > 0 && !self.stagger.is_zero() {
                tokio::time::sleep(self.stagger).await;
            }
            let tab_key = tab.tab_key.clone();
            let outcome = match registry.restore_tab(tab).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::warn!(tab_key = %tab_key, error = %err, "Failed to restore tab");
                    continue;
                }
            };
            count += 1;
            first.get_or_insert_with(|| tab_key.clone());
            if self.auto_resume && outcome.is_created() {
                let session = outcome.into_handle();
                tokio::spawn(async move {
                    if let Err(err) = session.resume().await {
                        tracing::warn!(tab_key = %session.tab_key(), error = %err, "Resume after restore failed");
                    }
                });
            }
        }

        if let Some(active) = restored.active.or(first)
            && let Err(err) = registry.activate(&active).await
        {
            tracing::warn!(tab_key = %active, error = %err, "Failed to activate restored tab");
        }
        tracing::info!(count, "Restored tabs");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ConnectionDescriptor, Protocol, ProtocolKind};

    fn adapter() -> PersistenceAdapter {
        PersistenceAdapter::new(
            Arc::new(MemoryStore::new()),
            &PersistenceConfig {
                state_path: String::new(),
                restore_stagger_ms: 0,
                ..PersistenceConfig::default()
            },
        )
    }

    fn tab(session_id: &str, millis: u64) -> TabSnapshot {
        TabSnapshot {
            connection_id: "1".into(),
            session_id: session_id.into(),
            tab_key: TabKey::from_parts(millis, "00000001"),
            title: "db01".into(),
            kind: ProtocolKind::TextStream,
            descriptor: ConnectionDescriptor {
                connection_id: "1".into(),
                name: "db01".into(),
                protocol: Protocol::Ssh,
                host: "db01.internal".into(),
                port: 22,
                username: Some("ops".into()),
            },
            active: false,
        }
    }

    #[test]
    fn snapshot_dedupes_and_restore_is_idempotent() {
        let adapter = adapter();
        let tabs = vec![tab("100", 1), tab("200", 2), tab("100", 3)];
        adapter
            .snapshot(&tabs, Some(&tabs[1].tab_key))
            .expect("snapshot");

        let first = adapter.restore();
        let second = adapter.restore();
        assert_eq!(first, second);
        let keys: Vec<_> = first.tabs.iter().map(|tab| tab.tab_key.timestamp()).collect();
        assert_eq!(keys, vec![2, 3]);
        assert_eq!(first.active, Some(tabs[1].tab_key.clone()));
    }

    #[test]
    fn recovery_flags_suppress_restore() {
        let adapter = adapter();
        let tabs = vec![tab("100", 1), tab("200", 2)];
        adapter.snapshot(&tabs, None).expect("snapshot");

        adapter
            .recovery()
            .mark_recently_closed(&tabs[0].tab_key)
            .expect("flag");
        assert_eq!(adapter.restore().tabs.len(), 1);

        adapter.recovery().mark_all_closed().expect("flag");
        assert!(adapter.restore().is_empty());
        adapter.recovery().clear_all_closed().expect("clear");
        assert_eq!(adapter.restore().tabs.len(), 1);

        adapter.recovery().mark_closing().expect("flag");
        assert!(adapter.restore().is_empty());
    }

    #[test]
    fn corrupt_or_foreign_documents_restore_empty() {
        let adapter = adapter();
        adapter
            .store()
            .set(TABS_KEY, "{broken".into(), None)
            .expect("set");
        assert!(adapter.restore().is_empty());

        let foreign = serde_json::json!({"version": 9, "saved_at_ms": now_ms(), "tabs": []});
        adapter
            .store()
            .set(TABS_KEY, foreign.to_string(), None)
            .expect("set");
        assert!(adapter.restore().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rehydrate_staggers_each_tab() {
        use crate::config::{GatewayConfig, SessionConfig};
        use crate::registry::RegistryEvent;
        use crate::transport::{AttachMode, LoopbackConnector};
        use tokio::time::Instant;

        let stagger = Duration::from_millis(500);
        let adapter = Arc::new(PersistenceAdapter::new(
            Arc::new(MemoryStore::new()),
            &PersistenceConfig {
                state_path: String::new(),
                restore_stagger_ms: stagger.as_millis() as u64,
                ..PersistenceConfig::default()
            },
        ));
        let connector = LoopbackConnector::echo();
        let registry = Registry::new(
            connector.clone(),
            GatewayConfig::default(),
            SessionConfig::default(),
            Some(adapter.clone()),
        );
        let mut events = registry.subscribe();
        let restored = RestoredState {
            tabs: vec![tab("100", 1), tab("200", 2), tab("300", 3)],
            active: None,
        };

        let started = Instant::now();
        let task = {
            let adapter = adapter.clone();
            let registry = registry.clone();
            tokio::spawn(async move { adapter.rehydrate(&registry, restored).await })
        };

        let mut arrivals = Vec::new();
        while arrivals.len() < 3 {
            if let RegistryEvent::TabsChanged { tabs, .. } = events.recv().await.expect("event")
                && tabs.len() > arrivals.len()
            {
                arrivals.push(Instant::now());
            }
        }
        assert_eq!(task.await.expect("join"), 3);

        assert!(arrivals[0] - started < stagger);
        for pair in arrivals.windows(2) {
            assert!(pair[1] - pair[0] >= stagger);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        let requests = connector.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|request| request.mode == AttachMode::Resume));
        assert_eq!(registry.len().await, 3);
    }
}
