use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use url::Url;

use crate::cli::{Cli, LogFormat};
use crate::docstore::RetryPolicy;

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_cache_max_bytes() -> u64 {
    500 * 1024 * 1024 // 500 MiB
}

fn default_eviction_interval() -> u64 {
    300
}

fn default_shard_count() -> u32 {
    10
}

fn default_top_k() -> usize {
    10
}

fn default_transaction_max_attempts() -> u32 {
    5
}

fn default_transaction_backoff_ms() -> u64 {
    20
}

fn default_download_connect_timeout() -> u64 {
    10
}

fn default_download_timeout() -> u64 {
    120
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub cache_dir: PathBuf,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: u64,
    #[serde(default = "default_eviction_interval")]
    pub eviction_interval: u64,
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_transaction_max_attempts")]
    pub transaction_max_attempts: u32,
    #[serde(default = "default_transaction_backoff_ms")]
    pub transaction_backoff_ms: u64,
    #[serde(default = "default_download_connect_timeout")]
    pub download_connect_timeout: u64,
    #[serde(default = "default_download_timeout")]
    pub download_timeout: u64,
    #[serde(default)]
    pub blob_base_url: Option<String>,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = resolve_config_path(cli)?;
        Self::load_from(&config_path)
    }

    /// Loads `config_path` overlaid with `STUPAMAP__*` environment variables.
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(File::from(config_path.to_path_buf()).required(true))
            .add_source(
                Environment::with_prefix("STUPAMAP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(to_anyhow)
            .with_context(|| format!("failed to read settings from {}", config_path.display()))?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(config_path);
        settings.validate()?;
        Ok(settings)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval)
    }

    pub fn download_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.download_connect_timeout)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.transaction_max_attempts,
            Duration::from_millis(self.transaction_backoff_ms),
        )
    }

    pub fn blob_base_url(&self) -> Result<Option<Url>> {
        self.blob_base_url
            .as_deref()
            .map(|raw| Url::parse(raw).with_context(|| format!("invalid blob_base_url {raw:?}")))
            .transpose()
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        self.cache_dir = absolutize(&self.cache_dir, base_dir);
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.cache_dir.as_os_str().is_empty(),
            "cache_dir must not be empty"
        );
        ensure!(
            self.cache_max_bytes > 0,
            "cache_max_bytes must be greater than 0 (got {})",
            self.cache_max_bytes
        );
        ensure!(
            self.shard_count > 0,
            "shard_count must be at least 1 (got {})",
            self.shard_count
        );
        ensure!(
            self.top_k > 0,
            "top_k must be at least 1 (got {})",
            self.top_k
        );
        ensure!(
            self.transaction_max_attempts > 0,
            "transaction_max_attempts must be at least 1 (got {})",
            self.transaction_max_attempts
        );
        ensure!(
            self.download_connect_timeout > 0,
            "download_connect_timeout must be greater than 0 seconds (got {})",
            self.download_connect_timeout
        );
        ensure!(
            self.download_timeout > 0,
            "download_timeout must be greater than 0 seconds (got {})",
            self.download_timeout
        );
        ensure!(
            self.metrics_path.starts_with('/'),
            "metrics_path must start with '/' (got {:?})",
            self.metrics_path
        );
        self.blob_base_url()?;
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/stupamap/stupamap.toml"),
        PathBuf::from("stupamap.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("stupamap.toml");
        std::fs::write(&path, body).expect("write config");
        path
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "cache_dir = \"media\"\n");
        let settings = Settings::load_from(&path).expect("load");

        assert_eq!(settings.cache_dir, dir.path().join("media"));
        assert_eq!(settings.cache_max_bytes, 500 * 1024 * 1024);
        assert_eq!(settings.eviction_interval(), Duration::from_secs(300));
        assert_eq!(settings.shard_count, 10);
        assert_eq!(settings.top_k, 10);
        assert_eq!(settings.retry_policy().max_attempts, 5);
        assert!(matches!(settings.log, LogFormat::Json));
        assert!(settings.blob_base_url().unwrap().is_none());
        assert!(settings.metrics_listen.is_none());
    }

    #[test]
    fn absolute_cache_dir_is_kept() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("abs-cache");
        let path = write_config(
            &dir,
            &format!(
                "cache_dir = {:?}\nlog = \"text\"\nblob_base_url = \"https://blobs.example.com/v0/b/app\"\n",
                cache.display().to_string()
            ),
        );
        let settings = Settings::load_from(&path).expect("load");
        assert_eq!(settings.cache_dir, cache);
        assert!(matches!(settings.log, LogFormat::Text));
        assert_eq!(
            settings.blob_base_url().unwrap().map(|url| url.to_string()),
            Some("https://blobs.example.com/v0/b/app".to_string())
        );
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let dir = TempDir::new().unwrap();
        for body in [
            "cache_dir = \"c\"\ncache_max_bytes = 0\n",
            "cache_dir = \"c\"\nshard_count = 0\n",
            "cache_dir = \"c\"\ntop_k = 0\n",
            "cache_dir = \"c\"\ntransaction_max_attempts = 0\n",
            "cache_dir = \"c\"\nblob_base_url = \"not a url\"\n",
        ] {
            let path = write_config(&dir, body);
            assert!(Settings::load_from(&path).is_err(), "accepted: {body}");
        }
    }

    #[test]
    fn cache_dir_is_required() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "top_k = 5\n");
        assert!(Settings::load_from(&path).is_err());
    }
}
