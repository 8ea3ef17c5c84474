pub mod server;

use crate::config::{Config, SessionConfig};
use crate::directory::{self, ConnectionDirectory};
use crate::error::{ApiError, MuxResult};
use crate::persistence::PersistenceAdapter;
use crate::registry::{Registry, RegistryEvent};
use crate::session::{
    Encoding, InputOutcome, NamedKey, ReadParams, SessionIdentity, SessionSnapshot, TabKey,
    decode_chunk, encode_chunk, read_output,
};
use crate::transport::{
    AttachMode, ConnectionStatus, GatewayConnector, LoopbackConnector, SendOutcome, WsConnector,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

pub use server::{serve_control_socket, serve_http};

const DEFAULT_READ_MAX_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum UiCommand {
    Open {
        connection_id: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        tab_key: Option<TabKey>,
    },
    Activate {
        tab_key: TabKey,
    },
    Close {
        tab_key: TabKey,
    },
    Duplicate {
        tab_key: TabKey,
    },
    SendInput {
        tab_key: TabKey,
        data: String,
        #[serde(default)]
        encoding: Encoding,
    },
    SendKey {
        tab_key: TabKey,
        key: NamedKey,
    },
    Resize {
        tab_key: TabKey,
        cols: u16,
        rows: u16,
    },
    RespondToPrompt {
        tab_key: TabKey,
        #[serde(default)]
        prompt_id: Option<u64>,
        response: String,
    },
    CancelPrompt {
        tab_key: TabKey,
        #[serde(default)]
        prompt_id: Option<u64>,
    },
    Refresh {
        tab_key: TabKey,
    },
    Clipboard {
        tab_key: TabKey,
        text: String,
    },
    List,
    Read {
        tab_key: TabKey,
        #[serde(default)]
        cursor: Option<u64>,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        max_bytes: Option<usize>,
        #[serde(default)]
        tail: bool,
        #[serde(default)]
        encoding: Encoding,
    },
}

impl UiCommand {
    pub fn is_readonly(&self) -> bool {
        matches!(self, UiCommand::List | UiCommand::Read { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum UiResponse {
    Opened {
        tab: SessionSnapshot,
        created: bool,
    },
    Tab {
        tab: SessionSnapshot,
    },
    Closed {
        tab_key: TabKey,
    },
    Input {
        outcome: InputOutcome,
    },
    Sent {
        outcome: SendOutcome,
    },
    PromptResolved {
        tab_key: TabKey,
    },
    Tabs {
        tabs: Vec<SessionSnapshot>,
        active: Option<TabKey>,
    },
    Output {
        tab_key: TabKey,
        chunk: String,
        encoding: Encoding,
        start_cursor: u64,
        next_cursor: u64,
        truncated: bool,
        dropped_bytes: u64,
        timed_out: bool,
        status: ConnectionStatus,
    },
}

pub struct Multiplexer {
    registry: Arc<Registry>,
    directory: Arc<dyn ConnectionDirectory>,
    session_config: SessionConfig,
    restored: AtomicBool,
}

impl Multiplexer {
    pub fn new(
        registry: Arc<Registry>,
        directory: Arc<dyn ConnectionDirectory>,
        session_config: SessionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            directory,
            session_config,
            restored: AtomicBool::new(false),
        })
    }

    pub fn start(config: &Config) -> MuxResult<Arc<Self>> {
        let persistence = Arc::new(PersistenceAdapter::from_config(&config.persistence)?);
        let connector: Arc<dyn GatewayConnector> = if config.gateway.url.starts_with("loopback:") {
            tracing::warn!("Using the loopback gateway; no remote hosts are reached");
            LoopbackConnector::echo()
        } else {
            Arc::new(WsConnector::new(&config.gateway))
        };
        let directory = directory::from_config(&config.directory)?;
        let registry = Registry::new(
            connector,
            config.gateway.clone(),
            config.session.clone(),
            Some(persistence),
        );
        Ok(Self::new(registry, directory, config.session.clone()))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    pub async fn restore(&self) -> usize {
        if self.restored.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let Some(persistence) = self.registry.persistence().cloned() else {
            return 0;
        };
        let restored = persistence.restore();
        if restored.is_empty() {
            return 0;
        }
        persistence.rehydrate(&self.registry, restored).await
    }

    pub async fn dispatch(&self, command: UiCommand) -> MuxResult<UiResponse> {
        match command {
            UiCommand::Open {
                connection_id,
                session_id,
                tab_key,
            } => self.open(connection_id, session_id, tab_key).await,
            UiCommand::Activate { tab_key } => {
                let session = self.registry.activate(&tab_key).await?;
                Ok(UiResponse::Tab {
                    tab: session.snapshot(true),
                })
            }
            UiCommand::Close { tab_key } => {
                self.registry.close(&tab_key).await?;
                Ok(UiResponse::Closed { tab_key })
            }
            UiCommand::Duplicate { tab_key } => {
                let session = self.registry.get(&tab_key).await?;
                self.open(session.descriptor.connection_id.clone(), None, None)
                    .await
            }
            UiCommand::SendInput {
                tab_key,
                data,
                encoding,
            } => {
                let session = self.registry.get(&tab_key).await?;
                let bytes = decode_chunk(&data, &encoding)?;
                Ok(UiResponse::Input {
                    outcome: session.send_input(&bytes),
                })
            }
            UiCommand::SendKey { tab_key, key } => {
                let session = self.registry.get(&tab_key).await?;
                Ok(UiResponse::Input {
                    outcome: session.send_key(key),
                })
            }
            UiCommand::Resize {
                tab_key,
                cols,
                rows,
            } => {
                let session = self.registry.get(&tab_key).await?;
                session.resize(cols, rows)?;
                Ok(self.tab_response(&session).await)
            }
            UiCommand::RespondToPrompt {
                tab_key,
                prompt_id,
                response,
            } => {
                let session = self.registry.get(&tab_key).await?;
                session.respond_to_prompt(prompt_id, response)?;
                Ok(UiResponse::PromptResolved { tab_key })
            }
            UiCommand::CancelPrompt { tab_key, prompt_id } => {
                let session = self.registry.get(&tab_key).await?;
                session.cancel_prompt(prompt_id)?;
                Ok(UiResponse::PromptResolved { tab_key })
            }
            UiCommand::Refresh { tab_key } => {
                let session = self.registry.get(&tab_key).await?;
                if let Err(err) = session.refresh().await {
                    tracing::warn!(tab_key = %tab_key, error = %err, "Refresh failed");
                }
                Ok(self.tab_response(&session).await)
            }
            UiCommand::Clipboard { tab_key, text } => {
                let session = self.registry.get(&tab_key).await?;
                Ok(UiResponse::Sent {
                    outcome: session.send_clipboard(text),
                })
            }
            UiCommand::List => {
                let tabs = self.registry.list().await;
                let active = tabs
                    .iter()
                    .find(|tab| tab.active)
                    .map(|tab| tab.tab_key.clone());
                Ok(UiResponse::Tabs { tabs, active })
            }
            UiCommand::Read {
                tab_key,
                cursor,
                timeout_ms,
                max_bytes,
                tail,
                encoding,
            } => {
                let session = self.registry.get(&tab_key).await?;
                let max_bytes = max_bytes.unwrap_or(DEFAULT_READ_MAX_BYTES).max(1);
                let (slice, next_cursor, timed_out) = if tail {
                    let slice = session.tail(max_bytes);
                    let next = slice.end_cursor;
                    (slice, next, false)
                } else {
                    let result = read_output(
                        &session,
                        ReadParams {
                            cursor,
                            timeout_ms: timeout_ms
                                .unwrap_or(self.session_config.default_read_timeout_ms),
                            max_bytes,
                        },
                    )
                    .await;
                    (result.slice, result.next_cursor, result.timed_out)
                };
                let (chunk, encoding) = encode_chunk(&slice.bytes, encoding);
                Ok(UiResponse::Output {
                    tab_key: session.tab_key(),
                    chunk,
                    encoding,
                    start_cursor: next_cursor.saturating_sub(slice.bytes.len() as u64),
                    next_cursor,
                    truncated: slice.truncated,
                    dropped_bytes: slice.dropped_bytes,
                    timed_out,
                    status: session.status(),
                })
            }
        }
    }

    async fn open(
        &self,
        connection_id: String,
        session_id: Option<String>,
        tab_key: Option<TabKey>,
    ) -> MuxResult<UiResponse> {
        if let Some(key) = &tab_key
            && let Some(persistence) = self.registry.persistence()
            && persistence.recovery().recently_closed(key)
        {
            return Err(ApiError::unknown_tab(key.as_str()).into());
        }

        let descriptor = self.directory.describe(&connection_id).await?;
        let (session_id, mode) = match session_id {
            Some(id) if !id.is_empty() => (id, AttachMode::Resume),
            _ => (
                self.directory.issue_session(&connection_id).await?,
                AttachMode::Connect,
            ),
        };
        let identity = SessionIdentity::new(
            connection_id,
            session_id,
            tab_key.unwrap_or_else(TabKey::generate),
        );
        let outcome = self.registry.create(identity, descriptor).await?;
        let created = outcome.is_created();
        let session = outcome.into_handle();
        if created {
            let attached = match mode {
                AttachMode::Connect => session.connect().await,
                AttachMode::Resume => session.resume().await,
            };
            if let Err(err) = attached {
                tracing::warn!(
                    tab_key = %session.tab_key(),
                    mode = mode.as_str(),
                    error = %err,
                    "Gateway attach failed"
                );
            }
        }
        Ok(UiResponse::Opened {
            tab: session.snapshot(true),
            created,
        })
    }

    async fn tab_response(&self, session: &crate::session::Session) -> UiResponse {
        let active = self
            .registry
            .active()
            .await
            .is_some_and(|active| active.pair() == session.pair());
        UiResponse::Tab {
            tab: session.snapshot(active),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::directory::{ConnectionEntry, StaticDirectory};
    use crate::error::ErrorCode;
    use crate::session::Protocol;
    use std::time::Duration;

    fn mux() -> Arc<Multiplexer> {
        let registry = Registry::new(
            LoopbackConnector::echo(),
            GatewayConfig::default(),
            SessionConfig::default(),
            None,
        );
        let directory = Arc::new(StaticDirectory::new(vec![ConnectionEntry {
            id: "1".into(),
            name: "shell".into(),
            protocol: Protocol::Ssh,
            host: "127.0.0.1".into(),
            port: None,
            username: None,
        }]));
        Multiplexer::new(registry, directory, SessionConfig::default())
    }

    fn opened_tab(response: UiResponse) -> SessionSnapshot {
        match response {
            UiResponse::Opened { tab, .. } => tab,
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn commands_parse_from_tagged_json() {
        let command: UiCommand = serde_json::from_str(
            r#"{"command":"send_input","tab_key":"tab-1-aa","data":"bHM=","encoding":"base64","id":7}"#,
        )
        .expect("parse");
        assert!(matches!(
            command,
            UiCommand::SendInput {
                encoding: Encoding::Base64,
                ..
            }
        ));
        let list: UiCommand = serde_json::from_str(r#"{"command":"list"}"#).expect("list");
        assert!(list.is_readonly());
    }

    #[tokio::test]
    async fn open_connects_and_read_returns_echo() {
        let mux = mux();
        let tab = opened_tab(
            mux.dispatch(UiCommand::Open {
                connection_id: "1".into(),
                session_id: None,
                tab_key: None,
            })
            .await
            .expect("open"),
        );
        assert_eq!(tab.status, ConnectionStatus::Open);
        assert!(tab.active);

        mux.dispatch(UiCommand::SendInput {
            tab_key: tab.tab_key.clone(),
            data: "uptime\r".into(),
            encoding: Encoding::Utf8,
        })
        .await
        .expect("input");
        tokio::time::sleep(Duration::from_millis(30)).await;

        let UiResponse::Output { chunk, .. } = mux
            .dispatch(UiCommand::Read {
                tab_key: tab.tab_key.clone(),
                cursor: Some(0),
                timeout_ms: Some(500),
                max_bytes: None,
                tail: false,
                encoding: Encoding::Utf8,
            })
            .await
            .expect("read")
        else {
            panic!("expected output");
        };
        assert!(chunk.starts_with("loopback connect session"));
        assert!(chunk.contains("uptime\r\n$ "));
    }

    #[tokio::test]
    async fn duplicate_opens_a_new_session_and_unknown_connection_fails() {
        let mux = mux();
        let first = opened_tab(
            mux.dispatch(UiCommand::Open {
                connection_id: "1".into(),
                session_id: None,
                tab_key: None,
            })
            .await
            .expect("open"),
        );
        let second = opened_tab(
            mux.dispatch(UiCommand::Duplicate {
                tab_key: first.tab_key.clone(),
            })
            .await
            .expect("duplicate"),
        );
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(mux.registry().len().await, 2);

        let err = mux
            .dispatch(UiCommand::Open {
                connection_id: "404".into(),
                session_id: None,
                tab_key: None,
            })
            .await
            .expect_err("unknown connection");
        assert_eq!(err.code(), ErrorCode::IssuanceError);
    }
}
