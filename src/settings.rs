use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3142
}

fn default_cache_directory() -> PathBuf {
    PathBuf::from("/var/cache/cascade")
}

fn default_max_size_gb() -> f64 {
    100.0
}

fn default_min_file_size_kb() -> u64 {
    1
}

fn default_max_file_size_mb() -> u64 {
    10_240
}

fn default_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_buffer_size_kb() -> usize {
    64
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub egress: EgressSettings,
    #[serde(default)]
    pub rules: RulesSettings,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_max_size_gb")]
    pub max_size_gb: f64,
    #[serde(default = "default_min_file_size_kb")]
    pub min_file_size_kb: u64,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub default_ttl: Duration,
    #[serde(default = "default_buffer_size_kb")]
    pub buffer_size_kb: usize,
    #[serde(default)]
    pub respect_headers: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EgressSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub proxy_type: String,
    #[serde(default)]
    pub proxy_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RulesSettings {
    #[serde(default)]
    pub passthrough: Vec<String>,
    #[serde(default)]
    pub https_passthrough: Vec<String>,
    #[serde(default)]
    pub special_ttl: HashMap<String, String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            directory: default_cache_directory(),
            max_size_gb: default_max_size_gb(),
            min_file_size_kb: default_min_file_size_kb(),
            max_file_size_mb: default_max_file_size_mb(),
            default_ttl: default_ttl(),
            buffer_size_kb: default_buffer_size_kb(),
            respect_headers: false,
        }
    }
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::from(cli.config.clone()).required(true))
            .add_source(
                Environment::with_prefix("CASCADE")
                    .separator("__")
                    .try_parsing(true),
            );

        let cfg = builder.build().map_err(to_anyhow)?;
        let settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.server.port != 0,
            "server.port must be a concrete port, not 0"
        );
        ensure!(
            self.cache.max_size_gb > 0.0,
            "cache.max_size_gb must be greater than 0 (got {})",
            self.cache.max_size_gb
        );
        ensure!(
            self.cache.buffer_size_kb > 0,
            "cache.buffer_size_kb must be greater than 0"
        );
        ensure!(
            self.cache.min_file_size_kb * 1024 <= self.cache.max_file_size_mb * 1024 * 1024,
            "cache.min_file_size_kb must not exceed cache.max_file_size_mb"
        );
        ensure!(
            !self.cache.default_ttl.is_zero(),
            "cache.default_ttl must be greater than zero"
        );
        match self.egress.proxy_type.as_str() {
            "" | "http" | "socks5" => {}
            other => anyhow::bail!("egress.proxy_type must be 'http' or 'socks5' (got '{other}')"),
        }
        if self.egress.enabled && !self.egress.proxy_type.is_empty() {
            ensure!(
                !self.egress.proxy_url.is_empty(),
                "egress.proxy_url is required when egress.proxy_type is set"
            );
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn cache_capacity_bytes(&self) -> u64 {
        (self.cache.max_size_gb * 1024.0 * 1024.0 * 1024.0) as u64
    }

    pub fn min_file_size_bytes(&self) -> u64 {
        self.cache.min_file_size_kb * 1024
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.cache.max_file_size_mb * 1024 * 1024
    }

    pub fn buffer_size_bytes(&self) -> usize {
        self.cache.buffer_size_kb * 1024
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}
