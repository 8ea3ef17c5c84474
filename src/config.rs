use crate::directory::ConnectionEntry;
use crate::error::{ApiError, ErrorCode, MuxResult};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum ControlMode {
    Disabled,
    #[default]
    Readonly,
    Readwrite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub session: SessionConfig,
    pub persistence: PersistenceConfig,
    pub directory: DirectoryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub auth_token: String,
    pub control: ControlConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8780".to_string(),
            auth_token: String::new(),
            control: ControlConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub control_socket_path: String,
    pub control_mode: ControlMode,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            control_socket_path: default_runtime_path("tabmux.sock"),
            control_mode: ControlMode::Readonly,
        }
    }
}

fn default_runtime_path(file_name: &str) -> String {
    if let Ok(dir) = env::var("XDG_RUNTIME_DIR")
        && is_dir(&dir)
    {
        return format!("{}/{}", dir, file_name);
    }

    let uid = unsafe { libc::geteuid() };
    let run_user_dir = format!("/run/user/{}", uid);
    if is_dir(&run_user_dir) {
        return format!("{}/{}", run_user_dir, file_name);
    }

    format!("/tmp/{}-{}", uid, file_name)
}

fn default_state_path() -> String {
    if let Ok(dir) = env::var("XDG_STATE_HOME")
        && is_dir(&dir)
    {
        return format!("{}/tabmux/state.json", dir);
    }
    if let Ok(home) = env::var("HOME")
        && is_dir(&home)
    {
        return format!("{}/.local/state/tabmux/state.json", home);
    }
    default_runtime_path("tabmux-state.json")
}

fn is_dir(path: &str) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base `ws://` or `wss://` URL; protocol and identity are appended per session.
    pub url: String,
    pub token: String,
    pub handshake_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub missed_heartbeat_limit: u32,
    pub outbound_queue: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8781/gateway".to_string(),
            token: String::new(),
            handshake_timeout_ms: 15_000,
            heartbeat_interval_ms: 10_000,
            missed_heartbeat_limit: 3,
            outbound_queue: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_sessions: usize,
    pub output_buffer_max_lines: usize,
    pub output_buffer_max_bytes: usize,
    pub prompt_history_bytes: usize,
    pub prompt_timeout_secs: u64,
    pub default_read_timeout_ms: u64,
    pub default_cols: u16,
    pub default_rows: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            output_buffer_max_lines: 20_000,
            output_buffer_max_bytes: 2 * 1024 * 1024,
            prompt_history_bytes: 4096,
            prompt_timeout_secs: 120,
            default_read_timeout_ms: 2_000,
            default_cols: 120,
            default_rows: 40,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub state_path: String,
    pub snapshot_ttl_secs: u64,
    pub all_closed_ttl_ms: u64,
    pub closing_ttl_ms: u64,
    pub recently_closed_ttl_ms: u64,
    pub restore_stagger_ms: u64,
    pub auto_resume: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            snapshot_ttl_secs: 7 * 24 * 60 * 60,
            all_closed_ttl_ms: 3_000,
            closing_ttl_ms: 3_000,
            recently_closed_ttl_ms: 10_000,
            restore_stagger_ms: 150,
            auto_resume: true,
        }
    }
}

impl PersistenceConfig {
    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_secs)
    }

    pub fn all_closed_ttl(&self) -> Duration {
        Duration::from_millis(self.all_closed_ttl_ms)
    }

    pub fn closing_ttl(&self) -> Duration {
        Duration::from_millis(self.closing_ttl_ms)
    }

    pub fn recently_closed_ttl(&self) -> Duration {
        Duration::from_millis(self.recently_closed_ttl_ms)
    }

    pub fn restore_stagger(&self) -> Duration {
        Duration::from_millis(self.restore_stagger_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DirectoryConfig {
    pub url: String,
    pub token: String,
    pub connections: Vec<ConnectionEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Parser)]
#[command(author, version = crate::version::VERSION, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    Serve(ServeArgs),
    Tabs(ControlClientArgs),
    Tail(ControlTailArgs),
    Close(ControlCloseArgs),
}

#[derive(Debug, Parser, Clone, Default)]
pub struct ServeArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub listen: Option<String>,
    #[arg(long)]
    pub auth_token: Option<String>,
    #[arg(long)]
    pub gateway_url: Option<String>,
    #[arg(long)]
    pub state_path: Option<String>,
    #[arg(long)]
    pub control_socket: Option<String>,
    #[arg(long)]
    pub control_mode: Option<ControlMode>,
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Parser, Clone)]
pub struct ControlClientArgs {
    #[arg(long)]
    pub control_socket: Option<String>,
}

#[derive(Debug, Parser, Clone)]
pub struct ControlTailArgs {
    pub tab_key: String,
    #[arg(long, default_value_t = 65536)]
    pub max_bytes: usize,
    #[arg(long)]
    pub follow: bool,
    #[arg(long)]
    pub control_socket: Option<String>,
}

#[derive(Debug, Parser, Clone)]
pub struct ControlCloseArgs {
    pub tab_key: String,
    #[arg(long)]
    pub control_socket: Option<String>,
}

impl Config {
    pub fn load(args: &ServeArgs) -> MuxResult<Self> {
        let mut config = if let Some(path) = &args.config {
            Self::from_file(path)?
        } else if Path::new("tabmux.toml").exists() {
            Self::from_file(Path::new("tabmux.toml"))?
        } else {
            Self::default()
        };

        config.apply_env();
        config.apply_cli(args);
        Ok(config)
    }

    fn from_file(path: &Path) -> MuxResult<Self> {
        let content = fs::read_to_string(path).map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to read config file")
                .with_details(err.to_string())
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> MuxResult<Self> {
        let parsed: Self = toml::from_str(content).map_err(|err| {
            ApiError::new(ErrorCode::InvalidArgument, "Failed to parse config file")
                .with_details(err.to_string())
        })?;
        Ok(parsed)
    }

    fn apply_env(&mut self) {
        if let Ok(value) = env::var("TABMUX_LISTEN") {
            self.server.listen = value;
        }
        if let Ok(value) = env::var("TABMUX_GATEWAY_URL") {
            self.gateway.url = value;
        }
        if let Ok(value) = env::var("TABMUX_GATEWAY_TOKEN") {
            self.gateway.token = value;
        }
        if let Ok(value) = env::var("TABMUX_STATE_PATH") {
            self.persistence.state_path = value;
        }
        if let Ok(value) = env::var("TABMUX_DIRECTORY_URL") {
            self.directory.url = value;
        }
        if let Ok(value) = env::var("TABMUX_LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Ok(value) = env::var("TABMUX_CONTROL_SOCKET") {
            self.server.control.control_socket_path = value;
        }
        if let Ok(value) = env::var("TABMUX_CONTROL_MODE")
            && let Some(mode) = parse_control_mode(&value)
        {
            self.server.control.control_mode = mode;
        }
    }

    fn apply_cli(&mut self, args: &ServeArgs) {
        if let Some(listen) = &args.listen {
            self.server.listen = listen.clone();
        }
        if let Some(token) = &args.auth_token {
            self.server.auth_token = token.clone();
        }
        if let Some(url) = &args.gateway_url {
            self.gateway.url = url.clone();
        }
        if let Some(path) = &args.state_path {
            self.persistence.state_path = path.clone();
        }
        if let Some(path) = &args.control_socket {
            self.server.control.control_socket_path = path.clone();
        }
        if let Some(mode) = &args.control_mode {
            self.server.control.control_mode = mode.clone();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
    }
}

pub fn default_control_socket() -> String {
    ControlConfig::default().control_socket_path
}

fn parse_control_mode(value: &str) -> Option<ControlMode> {
    match value.to_ascii_lowercase().as_str() {
        "disabled" => Some(ControlMode::Disabled),
        "readonly" => Some(ControlMode::Readonly),
        "readwrite" => Some(ControlMode::Readwrite),
        _ => None,
    }
}
