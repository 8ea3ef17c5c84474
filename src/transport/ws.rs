use super::wire::WireMessage;
use super::{ConnectRequest, GatewayConnector, GatewayLink, LinkEvent, TransportError};
use crate::config::GatewayConfig;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use url::Url;

#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: String,
    token: String,
    queue: usize,
}

impl WsConnector {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            base_url: config.url.clone(),
            token: config.token.clone(),
            queue: config.outbound_queue.max(1),
        }
    }

    pub fn endpoint(&self, request: &ConnectRequest) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|err| TransportError::Protocol(format!("invalid gateway url: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| TransportError::Protocol("gateway url cannot be a base".to_string()))?
            .pop_if_empty()
            .push(request.protocol.as_str())
            .push(&request.connection_id)
            .push(&request.session_id);
        url.query_pairs_mut()
            .append_pair("mode", request.mode.as_str())
            .append_pair("cursor", &request.resume_cursor.to_string())
            .append_pair("cols", &request.cols.to_string())
            .append_pair("rows", &request.rows.to_string());
        Ok(url)
    }
}

#[async_trait]
impl GatewayConnector for WsConnector {
    async fn open(&self, request: ConnectRequest) -> Result<GatewayLink, TransportError> {
        let url = self.endpoint(&request)?;
        let mut ws_request = url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        if !self.token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", self.token))
                .map_err(|err| TransportError::Protocol(err.to_string()))?;
            ws_request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(ws_request)
            .await
            .map_err(map_connect_error)?;
        let (mut sink, mut source) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<WireMessage>(self.queue);
        let (inbound_tx, inbound) = mpsc::channel::<LinkEvent>(self.queue);

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let frame = match message {
                    WireMessage::Binary(bytes) => Message::Binary(bytes),
                    WireMessage::Text(text) => Message::Text(text.into()),
                };
                if let Err(err) = sink.send(frame).await {
                    tracing::debug!(error = %err, "Gateway write failed");
                    return;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            let closed = loop {
                match source.next().await {
                    Some(Ok(Message::Binary(bytes))) => {
                        let event = LinkEvent::Message(WireMessage::Binary(bytes));
                        if inbound_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        let event = LinkEvent::Message(WireMessage::Text(text.to_string()));
                        if inbound_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let clean = frame
                            .as_ref()
                            .is_some_and(|frame| frame.code == CloseCode::Normal);
                        let reason = frame
                            .map(|frame| frame.reason.to_string())
                            .unwrap_or_default();
                        break LinkEvent::Closed { clean, reason };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        break LinkEvent::Closed {
                            clean: false,
                            reason: err.to_string(),
                        };
                    }
                    None => {
                        break LinkEvent::Closed {
                            clean: false,
                            reason: "stream ended".to_string(),
                        };
                    }
                }
            };
            let _ = inbound_tx.send(closed).await;
        });

        Ok(GatewayLink { outbound, inbound })
    }
}

fn map_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error;
    match err {
        Error::Io(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
            TransportError::Refused(io.to_string())
        }
        Error::Io(io) => TransportError::Io(io.to_string()),
        Error::Http(response) => {
            TransportError::Refused(format!("gateway answered {}", response.status()))
        }
        other => TransportError::Protocol(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Protocol;
    use crate::transport::AttachMode;

    #[test]
    fn endpoint_encodes_identity_and_resume_cursor() {
        let connector = WsConnector::new(&GatewayConfig {
            url: "wss://gw.example.net/tunnel/".to_string(),
            ..GatewayConfig::default()
        });
        let url = connector
            .endpoint(&ConnectRequest {
                connection_id: "db 01".into(),
                session_id: "100".into(),
                protocol: Protocol::Rdp,
                mode: AttachMode::Resume,
                resume_cursor: 512,
                cols: 120,
                rows: 40,
            })
            .expect("endpoint");
        assert_eq!(
            url.as_str(),
            "wss://gw.example.net/tunnel/rdp/db%2001/100?mode=resume&cursor=512&cols=120&rows=40"
        );
    }

    #[test]
    fn endpoint_without_trailing_slash_appends_segments() {
        let connector = WsConnector::new(&GatewayConfig {
            url: "ws://127.0.0.1:9000".to_string(),
            ..GatewayConfig::default()
        });
        let url = connector
            .endpoint(&ConnectRequest {
                connection_id: "1".into(),
                session_id: "2".into(),
                protocol: Protocol::Ssh,
                mode: AttachMode::Connect,
                resume_cursor: 0,
                cols: 80,
                rows: 24,
            })
            .expect("endpoint");
        assert_eq!(
            url.as_str(),
            "ws://127.0.0.1:9000/ssh/1/2?mode=connect&cursor=0&cols=80&rows=24"
        );
    }

    #[test]
    fn rejects_invalid_base_url() {
        let connector = WsConnector::new(&GatewayConfig {
            url: "not a url".to_string(),
            ..GatewayConfig::default()
        });
        let request = ConnectRequest {
            connection_id: "1".into(),
            session_id: "2".into(),
            protocol: Protocol::Ssh,
            mode: AttachMode::Connect,
            resume_cursor: 0,
            cols: 80,
            rows: 24,
        };
        assert!(matches!(
            connector.endpoint(&request),
            Err(TransportError::Protocol(_))
        ));
    }
}
