use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tabmux::config::{self, Cli, Command, ControlClientArgs, ControlCloseArgs, ControlTailArgs};
use tabmux::error::{ApiError, ErrorCode, MuxError, MuxResult};
use tabmux::ui::{Multiplexer, serve_control_socket, serve_http};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

const CONTROL_METHOD: &str = "tabmux_tab";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => run_server(args).await?,
        Command::Tabs(args) => run_tabs(args).await?,
        Command::Tail(args) => run_tail(args).await?,
        Command::Close(args) => run_close(args).await?,
    }
    Ok(())
}

async fn run_server(args: config::ServeArgs) -> MuxResult<()> {
    let config = config::Config::load(&args)?;
    init_logging(&config.logging);
    tracing::info!(version = tabmux::version::VERSION, "Starting tabmux");

    let mux = Multiplexer::start(&config)?;
    let restored = mux.restore().await;
    if restored > 0 {
        tracing::info!(restored, "Previous tabs reattached");
    }

    if !matches!(
        config.server.control.control_mode,
        config::ControlMode::Disabled
    ) {
        let control_path = config.server.control.control_socket_path.clone();
        let mode = config.server.control.control_mode.clone();
        let mux = mux.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_control_socket(mux, &control_path, mode).await {
                tracing::error!(error = %err, "Control socket task failed");
            }
        });
    }

    serve_http(mux, &config.server.listen, &config.server.auth_token).await
}

fn init_logging(logging: &config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&logging.level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if logging.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn run_tabs(args: ControlClientArgs) -> MuxResult<()> {
    let socket_path = args
        .control_socket
        .unwrap_or_else(config::default_control_socket);
    let response = control_request_or_exit(&socket_path, json!({ "command": "list" })).await?;
    let tabs = response
        .get("tabs")
        .and_then(|value| value.as_array())
        .cloned()
        .unwrap_or_default();
    if tabs.is_empty() {
        eprintln!("No tabs are open.");
        return Ok(());
    }
    for tab in tabs {
        let marker = if tab.get("active").and_then(|v| v.as_bool()) == Some(true) {
            "*"
        } else {
            " "
        };
        println!(
            "{} {}  {:<10} {:<8} {}",
            marker,
            tab.get("tab_key").and_then(|v| v.as_str()).unwrap_or("-"),
            tab.get("status").and_then(|v| v.as_str()).unwrap_or("-"),
            tab.get("protocol").and_then(|v| v.as_str()).unwrap_or("-"),
            tab.get("title").and_then(|v| v.as_str()).unwrap_or("-"),
        );
    }
    Ok(())
}

async fn run_tail(args: ControlTailArgs) -> MuxResult<()> {
    let socket_path = args
        .control_socket
        .unwrap_or_else(config::default_control_socket);
    let response = control_request_or_exit(
        &socket_path,
        json!({
            "command": "read",
            "tab_key": args.tab_key,
            "tail": true,
            "max_bytes": args.max_bytes,
        }),
    )
    .await?;
    print_chunk(&response);
    if !args.follow {
        return Ok(());
    }

    let mut cursor = response
        .get("next_cursor")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    loop {
        let response = control_request_or_exit(
            &socket_path,
            json!({
                "command": "read",
                "tab_key": args.tab_key,
                "cursor": cursor,
                "timeout_ms": 2000,
                "max_bytes": args.max_bytes,
            }),
        )
        .await?;
        print_chunk(&response);
        if let Some(next_cursor) = response.get("next_cursor").and_then(|v| v.as_u64()) {
            cursor = next_cursor;
        }
        if response.get("status").and_then(|v| v.as_str()) == Some("closed") {
            eprintln!("Tab is closed.");
            return Ok(());
        }
    }
}

async fn run_close(args: ControlCloseArgs) -> MuxResult<()> {
    let socket_path = args
        .control_socket
        .unwrap_or_else(config::default_control_socket);
    control_request_or_exit(
        &socket_path,
        json!({ "command": "close", "tab_key": args.tab_key }),
    )
    .await?;
    eprintln!("Closed {}.", args.tab_key);
    Ok(())
}

fn print_chunk(response: &serde_json::Value) {
    use base64::Engine;
    use std::io::Write;
    let Some(chunk) = response.get("chunk").and_then(|v| v.as_str()) else {
        return;
    };
    if chunk.is_empty() {
        return;
    }
    let mut stdout = std::io::stdout();
    if response.get("encoding").and_then(|v| v.as_str()) == Some("base64") {
        if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(chunk) {
            let _ = stdout.write_all(&bytes);
        }
    } else {
        let _ = stdout.write_all(chunk.as_bytes());
    }
    let _ = stdout.flush();
}

#[derive(Serialize)]
struct ControlRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct ControlResponse {
    result: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ControlErrorPayload {
    message: String,
    data: Option<ApiError>,
}

async fn control_request(
    socket_path: &str,
    params: serde_json::Value,
) -> MuxResult<serde_json::Value> {
    let stream = tokio::net::UnixStream::connect(socket_path)
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to connect control socket")
                .with_details(err.to_string())
        })?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = tokio::io::BufReader::new(reader).lines();
    let request = ControlRequest {
        jsonrpc: "2.0",
        id: 1,
        method: CONTROL_METHOD,
        params,
    };
    let mut payload = serde_json::to_string(&request)?;
    payload.push('\n');
    writer.write_all(payload.as_bytes()).await.map_err(|err| {
        ApiError::new(ErrorCode::IoError, "Control write failed").with_details(err.to_string())
    })?;
    writer.flush().await.map_err(|err| {
        ApiError::new(ErrorCode::IoError, "Control write failed").with_details(err.to_string())
    })?;

    let Some(line) = reader.next_line().await.map_err(|err| {
        ApiError::new(ErrorCode::IoError, "Control read failed").with_details(err.to_string())
    })?
    else {
        return Err(ApiError::new(ErrorCode::IoError, "No response from control socket").into());
    };
    let response: ControlResponse = serde_json::from_str(&line)?;
    if let Some(err) = response.error {
        return Err(parse_control_error(err).into());
    }
    response
        .result
        .ok_or_else(|| ApiError::new(ErrorCode::IoError, "Missing control response").into())
}

async fn control_request_or_exit(
    socket_path: &str,
    params: serde_json::Value,
) -> MuxResult<serde_json::Value> {
    match control_request(socket_path, params).await {
        Ok(response) => Ok(response),
        Err(err) => {
            if is_control_socket_connect_error(&err) {
                print_control_socket_hint(socket_path, &err);
                std::process::exit(1);
            }
            if is_unknown_tab_error(&err) {
                print_unknown_tab_hint();
                std::process::exit(2);
            }
            if is_readonly_error(&err) {
                eprintln!("The control socket is readonly; start the server with `--control-mode readwrite`.");
                std::process::exit(3);
            }
            Err(err)
        }
    }
}

fn is_control_socket_connect_error(err: &MuxError) -> bool {
    matches!(
        err,
        MuxError::Api(api)
            if api.error_code == ErrorCode::IoError && api.message == "Failed to connect control socket"
    )
}

fn is_unknown_tab_error(err: &MuxError) -> bool {
    matches!(err, MuxError::Api(api) if api.error_code == ErrorCode::UnknownTab)
}

fn is_readonly_error(err: &MuxError) -> bool {
    matches!(err, MuxError::Api(api) if api.error_code == ErrorCode::Unsupported)
}

fn print_control_socket_hint(socket_path: &str, err: &MuxError) {
    eprintln!("Failed to connect control socket: {socket_path}");
    eprintln!(
        "Confirm the service is running (`tabmux serve`), or use `--control-socket` / `TABMUX_CONTROL_SOCKET` to point at the correct socket."
    );
    if let MuxError::Api(api) = err
        && let Some(details) = &api.details
    {
        eprintln!("Details: {details}");
    }
}

fn print_unknown_tab_hint() {
    eprintln!("Tab not found or already closed.");
    eprintln!("Use `tabmux tabs` to list open tabs.");
}

fn parse_control_error(err: serde_json::Value) -> ApiError {
    if let Ok(payload) = serde_json::from_value::<ControlErrorPayload>(err.clone()) {
        if let Some(api) = payload.data {
            return api;
        }
        return ApiError::new(ErrorCode::IoError, payload.message);
    }
    ApiError::new(ErrorCode::IoError, "Control request failed").with_details(err.to_string())
}
