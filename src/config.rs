use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::ingest::mjpeg::{DEFAULT_MAX_FRAME_BYTES, DEFAULT_READ_CHUNK_BYTES};

const DEFAULT_HTTP_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_STREAM_READ_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_EVENT_POLL_MS: u64 = 250;
const MIN_FRAME_BYTES: usize = 4;

pub fn default_user_agent() -> String {
    format!("ptz-engine/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Deserialize, Default)]
struct EngineConfigFile {
    http_timeout_ms: Option<u64>,
    stream_read_timeout_ms: Option<u64>,
    user_agent: Option<String>,
    max_frame_bytes: Option<usize>,
    read_chunk_bytes: Option<usize>,
    event_poll_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Connect and read timeout for PTZ commands and event-channel handshakes.
    pub http_timeout: Duration,
    /// Per-read timeout on a live MJPEG body.
    pub stream_read_timeout: Duration,
    pub user_agent: String,
    pub max_frame_bytes: usize,
    pub read_chunk_bytes: usize,
    /// How often an idle event channel checks whether it was closed.
    pub event_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_millis(DEFAULT_HTTP_TIMEOUT_MS),
            stream_read_timeout: Duration::from_millis(DEFAULT_STREAM_READ_TIMEOUT_MS),
            user_agent: default_user_agent(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            read_chunk_bytes: DEFAULT_READ_CHUNK_BYTES,
            event_poll_interval: Duration::from_millis(DEFAULT_EVENT_POLL_MS),
        }
    }
}

impl EngineConfig {
    /// Defaults, then the file named by `PTZ_ENGINE_CONFIG`, then `PTZ_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PTZ_ENGINE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: EngineConfigFile) -> Self {
        let defaults = Self::default();
        Self {
            http_timeout: file
                .http_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.http_timeout),
            stream_read_timeout: file
                .stream_read_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.stream_read_timeout),
            user_agent: file.user_agent.unwrap_or(defaults.user_agent),
            max_frame_bytes: file.max_frame_bytes.unwrap_or(defaults.max_frame_bytes),
            read_chunk_bytes: file.read_chunk_bytes.unwrap_or(defaults.read_chunk_bytes),
            event_poll_interval: file
                .event_poll_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.event_poll_interval),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(ms) = env_number::<u64>("PTZ_HTTP_TIMEOUT_MS")? {
            self.http_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number::<u64>("PTZ_STREAM_READ_TIMEOUT_MS")? {
            self.stream_read_timeout = Duration::from_millis(ms);
        }
        if let Ok(agent) = std::env::var("PTZ_USER_AGENT") {
            if !agent.trim().is_empty() {
                self.user_agent = agent;
            }
        }
        if let Some(bytes) = env_number::<usize>("PTZ_MAX_FRAME_BYTES")? {
            self.max_frame_bytes = bytes;
        }
        if let Some(bytes) = env_number::<usize>("PTZ_READ_CHUNK_BYTES")? {
            self.read_chunk_bytes = bytes;
        }
        if let Some(ms) = env_number::<u64>("PTZ_EVENT_POLL_MS")? {
            self.event_poll_interval = Duration::from_millis(ms);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.http_timeout.is_zero() {
            return Err(anyhow!("http timeout must be greater than zero"));
        }
        if self.stream_read_timeout.is_zero() {
            return Err(anyhow!("stream read timeout must be greater than zero"));
        }
        if self.event_poll_interval.is_zero() {
            return Err(anyhow!("event poll interval must be greater than zero"));
        }
        if self.user_agent.trim().is_empty() {
            return Err(anyhow!("user agent must not be blank"));
        }
        if self.max_frame_bytes < MIN_FRAME_BYTES {
            return Err(anyhow!(
                "max frame size must be at least {} bytes",
                MIN_FRAME_BYTES
            ));
        }
        if self.read_chunk_bytes == 0 {
            return Err(anyhow!("read chunk size must be greater than zero"));
        }
        Ok(())
    }

    /// HTTP agent for short control requests.
    pub fn command_agent(&self) -> ureq::Agent {
        ureq::AgentBuilder::new()
            .timeout_connect(self.http_timeout)
            .timeout_read(self.http_timeout)
            .timeout_write(self.http_timeout)
            .user_agent(&self.user_agent)
            .build()
    }

    /// HTTP agent for long-lived MJPEG bodies: no overall deadline, bounded per read.
    pub fn stream_agent(&self) -> ureq::Agent {
        ureq::AgentBuilder::new()
            .timeout_connect(self.http_timeout)
            .timeout_read(self.stream_read_timeout)
            .timeout_write(self.http_timeout)
            .user_agent(&self.user_agent)
            .build()
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer", key)),
        _ => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<EngineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg: EngineConfigFile = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
