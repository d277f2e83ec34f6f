//! TOML configuration for the service.
//!
//! Service-level settings are validated up front; a broken `[sources.*]`
//! section is reported and skipped at startup instead of refusing to boot,
//! so one bad feed cannot take every other feed down with it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Global exclusions, keyed by indicator type. Values are wildcard
    /// patterns, or CIDR blocks when the type is `ip`.
    #[serde(default)]
    pub exclusions: BTreeMap<String, Vec<String>>,
    /// Source sections, keyed by section name.
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Deadline for a whole lookup, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Log per-source counters once a minute.
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Default freshness window for cached source results, in minutes.
    #[serde(default = "default_cache_age_min")]
    pub cache_age_min: u64,
}

/// One `[sources.<section>]` block. Which keys apply depends on `kind`;
/// the source builders reject sections missing their required keys.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// `file` or `http`.
    pub kind: String,

    // file sources
    pub file: Option<PathBuf>,
    /// Indicator type a file source answers.
    #[serde(rename = "type")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub format: FileFormat,
    /// Re-read the backing file this often. Absent means never.
    pub reload_secs: Option<u64>,
    /// CSV column holding the lookup key.
    #[serde(default)]
    pub column: usize,
    /// Dot path to the lookup key inside each JSON element.
    pub key_path: Option<String>,

    // http sources
    /// Fetch URL; `%value%` is replaced with the encoded indicator.
    pub url: Option<String>,
    /// Indicator types an http source answers.
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    #[serde(default = "default_fetch_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    // shared
    /// Comma-separated tags stitched onto every answer from this source.
    pub tags: Option<String>,
    /// Field definitions, in order. Each may carry a `shortcut:` attribute
    /// naming the column index or JSON path that feeds it.
    #[serde(default)]
    pub fields: Vec<String>,
    /// View definition registered under this section's name.
    pub view: Option<String>,
    /// Per-source freshness override, in minutes.
    pub cache_age_min: Option<u64>,
    /// Never cache answers from this source.
    #[serde(default)]
    pub dont_cache: bool,
    /// Per-source exclusions, keyed by indicator type like the global table.
    #[serde(default)]
    pub exclude: BTreeMap<String, Vec<String>>,
    /// When present, only addresses inside these CIDRs are ever sent.
    #[serde(default)]
    pub only_ip: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    #[default]
    Csv,
    Tagger,
    Json,
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Config> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.service.listen_addr.trim().is_empty() {
            bail!("service.listen_addr must not be empty");
        }
        if self.service.request_timeout_ms == 0 {
            bail!("service.request_timeout_ms must be greater than zero");
        }
        if self.cache.max_entries == 0 {
            bail!("cache.max_entries must be greater than zero");
        }
        Ok(())
    }
}

impl SourceConfig {
    /// Seconds a cached answer from this source stays fresh, or -1 for
    /// sources that must never be cached.
    pub fn cache_timeout_secs(&self, default_age_min: u64) -> i64 {
        if self.dont_cache {
            return -1;
        }
        let minutes = self.cache_age_min.unwrap_or(default_age_min);
        60 * minutes as i64
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            listen_addr: default_listen_addr(),
            request_timeout_ms: default_request_timeout_ms(),
            debug: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_entries: default_max_entries(),
            cache_age_min: default_cache_age_min(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_max_entries() -> usize {
    100_000
}

fn default_cache_age_min() -> u64 {
    60
}

fn default_max_inflight() -> usize {
    50
}

fn default_fetch_timeout_ms() -> u64 {
    5_000
}
