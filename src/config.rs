use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default size of the per-connection read buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024;

/// Default sendfile chunk.
pub const DEFAULT_SENDFILE_CHUNK_SIZE: u64 = 1024 * 1024;

/// Largest chunk a single sendfile call is asked to transmit.
pub const MAX_SENDFILE_CHUNK_SIZE: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level server configuration, read from YAML.
///
/// ```yaml
/// server:
///   listen_addr: "0.0.0.0:8080"
///   max_connections: 1024
/// connection:
///   max_pipelined_requests: 8
///   handle_request_timeout: 2500   # milliseconds
///   max_body_size: 1048576
/// sendfile:
///   chunk_size: 65536
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub connection: ConnectionConfig,
    pub sendfile: SendfileConfig,
    pub websocket: WebSocketConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Upper bound of simultaneously served connections (`None` = unlimited).
    pub max_connections: Option<usize>,
    pub tls: Option<TlsConfig>,
    /// Directory served by the demo binary under `/files/`.
    pub static_root: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            max_connections: None,
            tls: None,
            static_root: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub buffer_size: usize,
    pub max_pipelined_requests: usize,
    #[serde(with = "millis")]
    pub read_next_http_message_timelimit: Duration,
    #[serde(with = "millis")]
    pub write_http_response_timelimit: Duration,
    #[serde(with = "millis")]
    pub handle_request_timeout: Duration,
    pub max_header_size: usize,
    /// Largest request body accepted; bigger ones get 413.
    pub max_body_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_pipelined_requests: 1,
            read_next_http_message_timelimit: Duration::from_secs(60),
            write_http_response_timelimit: Duration::from_secs(5),
            handle_request_timeout: Duration::from_secs(10),
            max_header_size: 64 * 1024,
            max_body_size: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SendfileConfig {
    pub chunk_size: u64,
    #[serde(with = "millis")]
    pub timelimit: Duration,
}

impl Default for SendfileConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_SENDFILE_CHUNK_SIZE,
            timelimit: Duration::from_secs(60),
        }
    }
}

impl SendfileConfig {
    /// Chunk size clamped to `[1, MAX_SENDFILE_CHUNK_SIZE]`; zero selects the default.
    pub fn effective_chunk_size(&self) -> u64 {
        clamp_chunk_size(self.chunk_size)
    }
}

/// Zero selects the default chunk, oversized values are capped.
pub fn clamp_chunk_size(chunk_size: u64) -> u64 {
    match chunk_size {
        0 => DEFAULT_SENDFILE_CHUNK_SIZE,
        n if n > MAX_SENDFILE_CHUNK_SIZE => MAX_SENDFILE_CHUNK_SIZE,
        n => n,
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub max_payload_size: u64,
    #[serde(with = "millis")]
    pub ping_interval: Duration,
    #[serde(with = "millis")]
    pub idle_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 16 * 1024 * 1024,
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
        }
    }
}

impl Config {
    /// Loads the file named by `STRAND_CONFIG` (defaults when unset), then
    /// applies the `LISTEN` override.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var_os("STRAND_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };

        if let Ok(listen_addr) = std::env::var("LISTEN") {
            cfg.server.listen_addr = listen_addr;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let conn = &self.connection;
        if conn.max_pipelined_requests == 0 {
            return Err(ConfigError::Invalid(
                "connection.max_pipelined_requests must be at least 1".into(),
            ));
        }
        if conn.buffer_size == 0 {
            return Err(ConfigError::Invalid("connection.buffer_size must be positive".into()));
        }
        if conn.max_header_size == 0 {
            return Err(ConfigError::Invalid("connection.max_header_size must be positive".into()));
        }

        let timeouts = [
            ("connection.read_next_http_message_timelimit", conn.read_next_http_message_timelimit),
            ("connection.write_http_response_timelimit", conn.write_http_response_timelimit),
            ("connection.handle_request_timeout", conn.handle_request_timeout),
            ("sendfile.timelimit", self.sendfile.timelimit),
            ("websocket.ping_interval", self.websocket.ping_interval),
            ("websocket.idle_timeout", self.websocket.idle_timeout),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Invalid(format!("{name} must be positive")));
        }

        if let Some(tls) = &self.server.tls {
            if tls.cert_path.is_none() || tls.key_path.is_none() {
                return Err(ConfigError::Invalid(
                    "server.tls needs both cert_path and key_path".into(),
                ));
            }
        }

        Ok(())
    }
}

/// Durations are written as whole milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
