use super::{Multiplexer, UiCommand};
use crate::config::ControlMode;
use crate::error::{ApiError, ErrorCode, MuxError, MuxResult};
use crate::registry::RegistryEvent;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

const CONTROL_METHOD: &str = "tabmux_tab";
const CLIENT_QUEUE: usize = 256;

pub fn router(mux: Arc<Multiplexer>, auth_token: &str) -> Router {
    let auth_token = auth_token.to_string();
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/tabs", get(list_tabs))
        .with_state(mux)
        .layer(middleware::from_fn(
            move |req: axum::http::Request<axum::body::Body>, next: axum::middleware::Next| {
                let auth_token = auth_token.clone();
                async move {
                    if auth_token.is_empty() {
                        return next.run(req).await;
                    }
                    let expected = format!("Bearer {}", auth_token);
                    let authorized = req
                        .headers()
                        .get(AUTHORIZATION)
                        .and_then(|value| value.to_str().ok())
                        .is_some_and(|value| value == expected);
                    if authorized {
                        next.run(req).await
                    } else {
                        let mut response =
                            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
                        response
                            .headers_mut()
                            .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                        response
                    }
                }
            },
        ))
}

pub async fn serve_http(mux: Arc<Multiplexer>, listen: &str, auth_token: &str) -> MuxResult<()> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|_| ApiError::new(ErrorCode::InvalidArgument, "Invalid listen address"))?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
        ApiError::new(ErrorCode::IoError, "HTTP bind failed").with_details(err.to_string())
    })?;
    tracing::info!(listen = %addr, "UI server listening");
    axum::serve(listener, router(mux, auth_token))
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "HTTP server failed").with_details(err.to_string())
        })?;
    Ok(())
}

async fn list_tabs(State(mux): State<Arc<Multiplexer>>) -> Response {
    match mux.dispatch(UiCommand::List).await {
        Ok(response) => axum::Json(response).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(err.into_api())).into_response(),
    }
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(mux): State<Arc<Multiplexer>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, mux))
}

#[derive(Serialize)]
struct ResponseEnvelope {
    kind: &'static str,
    id: Value,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ApiError>,
}

impl ResponseEnvelope {
    fn from_result(id: Value, result: MuxResult<Value>) -> Self {
        match result {
            Ok(value) => Self {
                kind: "response",
                id,
                ok: true,
                result: Some(value),
                error: None,
            },
            Err(err) => Self {
                kind: "response",
                id,
                ok: false,
                result: None,
                error: Some(err.into_api()),
            },
        }
    }
}

fn event_envelope(event: &RegistryEvent) -> MuxResult<String> {
    let mut value = serde_json::to_value(event)?;
    if let Value::Object(map) = &mut value {
        map.insert("kind".to_string(), Value::String("event".to_string()));
    }
    Ok(serde_json::to_string(&value)?)
}

fn parse_client_frame(text: &str) -> (Value, MuxResult<UiCommand>) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => return (Value::Null, Err(err.into())),
    };
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let command = serde_json::from_value(value).map_err(MuxError::from);
    (id, command)
}

async fn handle_socket(socket: WebSocket, mux: Arc<Multiplexer>) {
    let (mut sink, mut source) = socket.split();
    let (outgoing, mut outgoing_rx) = mpsc::channel::<String>(CLIENT_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(text) = outgoing_rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        let _ = sink.close().await;
    });

    let events = {
        let outgoing = outgoing.clone();
        let mut stream = BroadcastStream::new(mux.subscribe());
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let event = match item {
                    Ok(event) => event,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "UI client lagging; events dropped");
                        continue;
                    }
                };
                let text = match event_envelope(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(error = %err, "Failed to encode event");
                        continue;
                    }
                };
                if outgoing.send(text).await.is_err() {
                    return;
                }
            }
        })
    };

    while let Some(message) = source.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let (id, command) = parse_client_frame(&text);
        let mux = mux.clone();
        let outgoing = outgoing.clone();
        tokio::spawn(async move {
            let result = match command {
                Ok(command) => match mux.dispatch(command).await {
                    Ok(response) => serde_json::to_value(response).map_err(MuxError::from),
                    Err(err) => Err(err),
                },
                Err(err) => Err(err),
            };
            let envelope = ResponseEnvelope::from_result(id, result);
            match serde_json::to_string(&envelope) {
                Ok(text) => {
                    let _ = outgoing.send(text).await;
                }
                Err(err) => tracing::warn!(error = %err, "Failed to encode response"),
            }
        });
    }

    events.abort();
    drop(outgoing);
    let _ = writer.await;
    tracing::debug!("UI client disconnected");
}

#[derive(Debug, Deserialize)]
pub(crate) struct ControlRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub id: Option<Value>,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ControlRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ControlRpcError>,
}

impl ControlRpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, error: MuxError) -> Self {
        let api_error = error.into_api();
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(ControlRpcError {
                code: -32000,
                message: api_error.message.clone(),
                data: Some(api_error),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ControlRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ApiError>,
}

pub(crate) async fn handle_control_request(
    mux: &Multiplexer,
    request: ControlRpcRequest,
    mode: &ControlMode,
) -> ControlRpcResponse {
    let id = request.id.clone().unwrap_or(Value::Null);
    if request.method != CONTROL_METHOD {
        return ControlRpcResponse::error(
            id,
            ApiError::new(ErrorCode::InvalidArgument, "Unknown method")
                .with_details(request.method)
                .into(),
        );
    }
    let command: UiCommand = match serde_json::from_value(request.params.unwrap_or(json!({}))) {
        Ok(command) => command,
        Err(err) => return ControlRpcResponse::error(id, err.into()),
    };
    let allowed = match mode {
        ControlMode::Readwrite => true,
        ControlMode::Readonly => command.is_readonly(),
        ControlMode::Disabled => false,
    };
    if !allowed {
        return ControlRpcResponse::error(
            id,
            ApiError::new(ErrorCode::Unsupported, "Control mode is readonly").into(),
        );
    }
    let result = match mux.dispatch(command).await {
        Ok(response) => serde_json::to_value(response).map_err(MuxError::from),
        Err(err) => Err(err),
    };
    match result {
        Ok(value) => ControlRpcResponse::success(id, value),
        Err(err) => ControlRpcResponse::error(id, err),
    }
}

pub async fn serve_control_socket(
    mux: Arc<Multiplexer>,
    socket_path: &str,
    mode: ControlMode,
) -> MuxResult<()> {
    if std::path::Path::new(socket_path).exists() {
        let _ = std::fs::remove_file(socket_path);
    }
    let listener = UnixListener::bind(socket_path).map_err(|err| {
        ApiError::new(ErrorCode::IoError, "Failed to bind control socket")
            .with_details(err.to_string())
    })?;
    tracing::info!(path = socket_path, mode = ?mode, "Control socket listening");

    loop {
        let (stream, _) = listener.accept().await.map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to accept control socket")
                .with_details(err.to_string())
        })?;
        let mux = mux.clone();
        let mode = mode.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_control_stream(stream, mux, mode).await {
                tracing::debug!(error = %err, "Control client ended with error");
            }
        });
    }
}

async fn handle_control_stream(
    stream: UnixStream,
    mux: Arc<Multiplexer>,
    mode: ControlMode,
) -> MuxResult<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader).lines();
    while let Some(line) = reader.next_line().await.map_err(MuxError::Io)? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ControlRpcRequest>(line) {
            Ok(request) => handle_control_request(&mux, request, &mode).await,
            Err(err) => ControlRpcResponse::error(Value::Null, err.into()),
        };
        let payload = serde_json::to_string(&response)?;
        writer
            .write_all(payload.as_bytes())
            .await
            .map_err(MuxError::Io)?;
        writer.write_all(b"\n").await.map_err(MuxError::Io)?;
        writer.flush().await.map_err(MuxError::Io)?;
    }
    Ok(())
}
