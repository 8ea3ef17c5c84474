use crate::config::DirectoryConfig;
use crate::error::{ApiError, MuxResult};
use crate::session::{ConnectionDescriptor, Protocol};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionEntry {
    #[serde(alias = "connectionId", alias = "connection_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub protocol: Protocol,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
}

impl ConnectionEntry {
    pub fn descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor {
            connection_id: self.id.clone(),
            name: self.name.clone(),
            protocol: self.protocol,
            host: self.host.clone(),
            port: self.port.unwrap_or_else(|| self.protocol.default_port()),
            username: self.username.clone(),
        }
    }
}

#[async_trait]
pub trait ConnectionDirectory: Send + Sync {
    async fn describe(&self, connection_id: &str) -> MuxResult<ConnectionDescriptor>;
    async fn issue_session(&self, connection_id: &str) -> MuxResult<String>;
}

pub fn from_config(config: &DirectoryConfig) -> MuxResult<Arc<dyn ConnectionDirectory>> {
    if config.url.is_empty() {
        return Ok(Arc::new(StaticDirectory::new(config.connections.clone())));
    }
    Ok(Arc::new(HttpDirectory::new(&config.url, &config.token)?))
}

#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    connections: Vec<ConnectionEntry>,
}

impl StaticDirectory {
    pub fn new(connections: Vec<ConnectionEntry>) -> Self {
        Self { connections }
    }
}

#[async_trait]
impl ConnectionDirectory for StaticDirectory {
    async fn describe(&self, connection_id: &str) -> MuxResult<ConnectionDescriptor> {
        self.connections
            .iter()
            .find(|entry| entry.id == connection_id)
            .map(ConnectionEntry::descriptor)
            .ok_or_else(|| {
                ApiError::issuance("Unknown connection")
                    .with_details(connection_id.to_string())
                    .into()
            })
    }

    async fn issue_session(&self, connection_id: &str) -> MuxResult<String> {
        self.describe(connection_id).await?;
        Ok(Uuid::new_v4().to_string())
    }
}

#[derive(Deserialize)]
struct IssuedSession {
    #[serde(rename = "sessionId", alias = "session_id")]
    session_id: String,
}

#[derive(Debug, Clone)]
pub struct HttpDirectory {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpDirectory {
    pub fn new(base_url: &str, token: &str) -> MuxResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| {
                ApiError::issuance("Failed to build directory client").with_details(err.to_string())
            })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, connection_id: &str, suffix: &str) -> MuxResult<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url).map_err(|err| {
            ApiError::issuance("Invalid directory url").with_details(err.to_string())
        })?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ApiError::issuance("Directory url cannot be a base"))?;
            segments.pop_if_empty().push("connections").push(connection_id);
            if !suffix.is_empty() {
                segments.push(suffix);
            }
        }
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.token.is_empty() {
            request
        } else {
            request.bearer_auth(&self.token)
        }
    }

    async fn handle_response<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> MuxResult<T> {
        let status = response.status();
        let body = response.text().await.map_err(|err| {
            ApiError::issuance("Directory response failed").with_details(err.to_string())
        })?;
        if !status.is_success() {
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|value| value["error"].as_str().map(String::from))
                .unwrap_or(body);
            return Err(ApiError::issuance(format!("Directory answered {}", status.as_u16()))
                .with_details(message)
                .into());
        }
        serde_json::from_str(&body).map_err(|err| {
            ApiError::issuance("Invalid JSON from directory")
                .with_details(err.to_string())
                .into()
        })
    }
}

#[async_trait]
impl ConnectionDirectory for HttpDirectory {
    async fn describe(&self, connection_id: &str) -> MuxResult<ConnectionDescriptor> {
        let url = self.url(connection_id, "")?;
        let response = self
            .authorize(self.http.get(url))
            .send()
            .await
            .map_err(|err| {
                ApiError::issuance("Directory request failed").with_details(err.to_string())
            })?;
        let entry: ConnectionEntry = Self::handle_response(response).await?;
        if entry.id != connection_id {
            return Err(ApiError::issuance("Directory returned another connection")
                .with_details(entry.id)
                .into());
        }
        Ok(entry.descriptor())
    }

    async fn issue_session(&self, connection_id: &str) -> MuxResult<String> {
        let url = self.url(connection_id, "sessions")?;
        let response = self
            .authorize(self.http.post(url))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|err| {
                ApiError::issuance("Directory request failed").with_details(err.to_string())
            })?;
        let issued: IssuedSession = Self::handle_response(response).await?;
        if issued.session_id.is_empty() {
            return Err(ApiError::issuance("Directory issued an empty session id").into());
        }
        tracing::debug!(connection_id, session_id = %issued.session_id, "Session issued");
        Ok(issued.session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    fn entry() -> ConnectionEntry {
        ConnectionEntry {
            id: "7".into(),
            name: "bastion".into(),
            protocol: Protocol::Vnc,
            host: "10.0.0.7".into(),
            port: None,
            username: None,
        }
    }

    #[tokio::test]
    async fn static_directory_describes_and_issues() {
        let directory = StaticDirectory::new(vec![entry()]);
        let descriptor = directory.describe("7").await.expect("describe");
        assert_eq!(descriptor.port, 5900);
        assert!(!directory.issue_session("7").await.expect("issue").is_empty());
        let err = directory.issue_session("8").await.expect_err("unknown");
        assert_eq!(err.code(), ErrorCode::IssuanceError);
    }

    #[tokio::test]
    async fn http_directory_maps_rest_calls() {
        let app = Router::new()
            .route(
                "/api/connections/:id",
                get(|Path(id): Path<String>| async move {
                    if id == "7" {
                        Ok(Json(serde_json::json!({
                            "id": "7", "name": "bastion", "protocol": "ssh",
                            "host": "10.0.0.7", "port": 2222, "username": "ops"
                        })))
                    } else {
                        Err((StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "no such connection"}))))
                    }
                }),
            )
            .route(
                "/api/connections/:id/sessions",
                post(|| async { Json(serde_json::json!({"sessionId": "s-42"})) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let directory =
            HttpDirectory::new(&format!("http://{addr}/api/"), "secret").expect("client");
        let descriptor = directory.describe("7").await.expect("describe");
        assert_eq!(descriptor.port, 2222);
        assert_eq!(descriptor.username.as_deref(), Some("ops"));
        assert_eq!(directory.issue_session("7").await.expect("issue"), "s-42");

        let err = directory.describe("9").await.expect_err("missing");
        assert_eq!(err.code(), ErrorCode::IssuanceError);
        assert_eq!(
            err.into_api().details.as_deref(),
            Some("no such connection")
        );
    }
}
