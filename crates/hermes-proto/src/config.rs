use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Where the station service lives and how long we wait for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_url")]
    pub base_url: String,
    /// Optional bearer token sent with every request.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Tunables of the playback engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_volume_step")]
    pub volume_step: u8,
    /// Refill the song queue once this many songs (or fewer) remain.
    #[serde(default = "default_low_water_mark")]
    pub low_water_mark: usize,
    /// Extra attempts at the same song after a stream failure.
    #[serde(default = "default_stream_retries")]
    pub stream_retries: u32,
    /// Consecutive failed songs before the station is abandoned.
    #[serde(default = "default_station_failure_limit")]
    pub station_failure_limit: u32,
    /// Consecutive empty batches before the station is abandoned.
    #[serde(default = "default_empty_refill_limit")]
    pub empty_refill_limit: u32,
    /// Extra batch requests after a network failure while waiting for a song.
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
    /// Disliking the current song also skips it.
    #[serde(default = "default_skip_on_dislike")]
    pub skip_on_dislike: bool,
}

impl PlaybackConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            bind_address: default_bind_address(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_service_url(),
            token: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            volume_step: default_volume_step(),
            low_water_mark: default_low_water_mark(),
            stream_retries: default_stream_retries(),
            station_failure_limit: default_station_failure_limit(),
            empty_refill_limit: default_empty_refill_limit(),
            fetch_retries: default_fetch_retries(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            open_timeout_secs: default_open_timeout_secs(),
            skip_on_dislike: default_skip_on_dislike(),
        }
    }
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8989
}

fn default_service_url() -> String {
    "http://127.0.0.1:8990/v1".to_string()
}

fn default_request_timeout_secs() -> u64 {
    20
}

fn default_volume_step() -> u8 {
    10
}

fn default_low_water_mark() -> usize {
    1
}

fn default_stream_retries() -> u32 {
    1
}

fn default_station_failure_limit() -> u32 {
    3
}

fn default_empty_refill_limit() -> u32 {
    2
}

fn default_fetch_retries() -> u32 {
    1
}

fn default_fetch_timeout_secs() -> u64 {
    15
}

fn default_open_timeout_secs() -> u64 {
    15
}

fn default_skip_on_dislike() -> bool {
    true
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
