//! Sources and the bookkeeping the broker wraps around them.
//!
//! A [`Source`] implements one concern: given a query, come back with an
//! encoded result or nothing. Everything else lives on [`SourceHandle`]:
//! per-source exclusion rules, counters, the freshness window, and the
//! in-flight table that collapses concurrent fetches for the same value
//! into a single upstream call.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use intelwire::EncodedResult;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::cache::CachedResult;
use crate::config::SourceConfig;
use crate::error::ServiceError;
use crate::filter::{IpTrie, WildcardSet};
use crate::registry::{SharedFields, Views};

pub mod file;
pub mod http;

#[derive(Debug, Error)]
pub enum FetchError {
    /// The source refused the request to protect itself; the broker treats
    /// the query as answered with nothing and does not cache it.
    #[error("dropped")]
    Dropped,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// A lookup as sources see it. For hash types the submitted value may carry
/// a content type after a semicolon; the broker splits it off beforehand.
#[derive(Debug, Clone)]
pub struct Query {
    pub type_name: String,
    pub value: String,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait Source: Send + Sync {
    /// Indicator types this source answers.
    fn types(&self) -> &[String];

    async fn fetch(&self, query: &Query) -> Result<Option<EncodedResult>, FetchError>;

    /// Every item the source holds, for the dump endpoint. Sources that
    /// cannot enumerate themselves return `None`.
    async fn dump(&self) -> Option<Vec<(String, EncodedResult)>> {
        None
    }

    fn item_count(&self) -> Option<usize> {
        None
    }
}

#[derive(Default)]
pub struct SourceStats {
    pub request: AtomicU64,
    pub cache_hit: AtomicU64,
    pub cache_miss: AtomicU64,
    pub cache_refresh: AtomicU64,
    pub direct_hit: AtomicU64,
    pub request_dropped: AtomicU64,
    /// Rolling average fetch latency, in microseconds.
    pub recent_avg_micros: AtomicU64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatsSnapshot {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<usize>,
    pub request: u64,
    pub cache_hit: u64,
    pub cache_miss: u64,
    pub cache_refresh: u64,
    pub direct_hit: u64,
    pub request_dropped: u64,
    #[serde(rename = "recentAverageMS")]
    pub recent_average_ms: String,
}

/// Exclusion rules and caching policy for one source.
pub struct SourceRules {
    /// Seconds a cached answer stays fresh; -1 disables caching entirely.
    pub cache_timeout: i64,
    /// Wildcard exclusions, keyed by indicator type.
    pub wildcards: HashMap<String, WildcardSet>,
    pub ip_excludes: IpTrie,
    /// When set, only addresses inside the trie are sent to the source.
    pub only_ips: Option<IpTrie>,
}

impl Default for SourceRules {
    fn default() -> Self {
        SourceRules {
            cache_timeout: -1,
            wildcards: HashMap::new(),
            ip_excludes: IpTrie::new(),
            only_ips: None,
        }
    }
}

#[derive(Debug, Clone)]
enum FetchOutcome {
    Found(EncodedResult),
    Missing,
    Failed(String),
}

/// What one source contributed to a query.
pub(crate) struct SourceOutcome {
    pub contribution: Option<EncodedResult>,
    /// Slice to stage for write-back; only the fetch winner sets this.
    pub staged: Option<CachedResult>,
    pub failure: Option<String>,
}

impl SourceOutcome {
    pub(crate) fn nothing() -> SourceOutcome {
        SourceOutcome {
            contribution: None,
            staged: None,
            failure: None,
        }
    }
}

pub struct SourceHandle {
    section: String,
    source: Arc<dyn Source>,
    rules: SourceRules,
    pub stats: SourceStats,
    inflight: Mutex<HashMap<(String, String), watch::Receiver<Option<FetchOutcome>>>>,
}

impl SourceHandle {
    pub fn new(
        section: impl Into<String>,
        source: Arc<dyn Source>,
        rules: SourceRules,
    ) -> Arc<SourceHandle> {
        Arc::new(SourceHandle {
            section: section.into(),
            source,
            rules,
            stats: SourceStats::default(),
            inflight: Mutex::new(HashMap::new()),
        })
    }

    pub fn section(&self) -> &str {
        &self.section
    }

    pub fn cache_timeout(&self) -> i64 {
        self.rules.cache_timeout
    }

    pub fn answers(&self, type_name: &str) -> bool {
        self.source.types().iter().any(|t| t == type_name)
    }

    pub fn types(&self) -> Vec<String> {
        self.source.types().to_vec()
    }

    pub fn item_count(&self) -> Option<usize> {
        self.source.item_count()
    }

    pub async fn dump(&self) -> Option<Vec<(String, EncodedResult)>> {
        self.source.dump().await
    }

    /// Per-source exclusion check. Runs before any counter moves; an
    /// excluded value leaves no trace in this source's stats.
    pub fn allowed(&self, type_name: &str, value: &str) -> bool {
        if type_name == "ip" {
            let Ok(addr) = value.parse::<IpAddr>() else {
                return true;
            };
            if self.rules.ip_excludes.contains(addr) {
                return false;
            }
            if let Some(only) = &self.rules.only_ips {
                if !only.contains(addr) {
                    return false;
                }
            }
            true
        } else {
            match self.rules.wildcards.get(type_name) {
                Some(set) => !set.matches(value),
                None => true,
            }
        }
    }

    /// Fetch with in-flight coalescing. The first caller for a key does the
    /// real fetch and publishes the outcome; everyone else waits on it. Only
    /// the winner stages a cache slice or moves the fetch counters.
    pub(crate) async fn fetch_dedup(&self, query: &Query, now: u64) -> SourceOutcome {
        enum Role {
            Winner(watch::Sender<Option<FetchOutcome>>),
            Waiter(watch::Receiver<Option<FetchOutcome>>),
        }

        let key = (query.type_name.clone(), query.value.clone());
        let role = {
            let mut inflight = self.inflight.lock();
            if let Some(rx) = inflight.get(&key) {
                Role::Waiter(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                inflight.insert(key.clone(), rx);
                Role::Winner(tx)
            }
        };

        match role {
            Role::Winner(tx) => {
                let started = Instant::now();
                let fetched = self.source.fetch(query).await;
                self.observe_latency(started.elapsed().as_micros() as u64);

                let outcome = match fetched {
                    Ok(Some(result)) => {
                        self.stats.direct_hit.fetch_add(1, Ordering::Relaxed);
                        FetchOutcome::Found(result)
                    }
                    Ok(None) => FetchOutcome::Missing,
                    Err(FetchError::Dropped) => {
                        self.stats.request_dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            source = %self.section,
                            type_name = %query.type_name,
                            value = %query.value,
                            "source dropped request"
                        );
                        FetchOutcome::Missing
                    }
                    Err(FetchError::Failed(err)) => FetchOutcome::Failed(format!("{err:#}")),
                };

                self.inflight.lock().remove(&key);
                let _ = tx.send(Some(outcome.clone()));

                match outcome {
                    FetchOutcome::Found(result) => SourceOutcome {
                        staged: (self.rules.cache_timeout != -1).then(|| CachedResult {
                            ts: now,
                            result: result.clone(),
                        }),
                        contribution: Some(result),
                        failure: None,
                    },
                    FetchOutcome::Missing => SourceOutcome::nothing(),
                    FetchOutcome::Failed(message) => SourceOutcome {
                        contribution: None,
                        staged: None,
                        failure: Some(message),
                    },
                }
            }
            Role::Waiter(mut rx) => {
                let outcome = loop {
                    let seen = rx.borrow_and_update().clone();
                    if let Some(outcome) = seen {
                        break outcome;
                    }
                    if rx.changed().await.is_err() {
                        break FetchOutcome::Missing;
                    }
                };
                match outcome {
                    FetchOutcome::Found(result) => SourceOutcome {
                        contribution: Some(result),
                        staged: None,
                        failure: None,
                    },
                    FetchOutcome::Missing => SourceOutcome::nothing(),
                    FetchOutcome::Failed(message) => SourceOutcome {
                        contribution: None,
                        staged: None,
                        failure: Some(message),
                    },
                }
            }
        }
    }

    fn observe_latency(&self, elapsed_micros: u64) {
        let prev = self.stats.recent_avg_micros.load(Ordering::Relaxed);
        let next = (999.0 * prev as f64 + elapsed_micros as f64) / 1000.0;
        self.stats.recent_avg_micros.store(next as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SourceStatsSnapshot {
        let s = &self.stats;
        SourceStatsSnapshot {
            source: self.section.clone(),
            items: self.item_count(),
            request: s.request.load(Ordering::Relaxed),
            cache_hit: s.cache_hit.load(Ordering::Relaxed),
            cache_miss: s.cache_miss.load(Ordering::Relaxed),
            cache_refresh: s.cache_refresh.load(Ordering::Relaxed),
            direct_hit: s.direct_hit.load(Ordering::Relaxed),
            request_dropped: s.request_dropped.load(Ordering::Relaxed),
            recent_average_ms: format!(
                "{:.4}",
                s.recent_avg_micros.load(Ordering::Relaxed) as f64 / 1000.0
            ),
        }
    }
}

/// Build the source a `[sources.<section>]` block describes.
pub fn build(
    section: &str,
    cfg: &SourceConfig,
    fields: &SharedFields,
    views: &Views,
    default_cache_age_min: u64,
) -> Result<Arc<SourceHandle>, ServiceError> {
    match cfg.kind.as_str() {
        "file" => file::build(section, cfg, fields, views, default_cache_age_min),
        "http" => http::build(section, cfg, fields, views, default_cache_age_min),
        other => Err(ServiceError::Config(format!(
            "source {section}: unknown kind {other:?}"
        ))),
    }
}

/// Compile the exclusion rules and freshness window a section configures.
pub(crate) fn compile_rules(
    section: &str,
    cfg: &SourceConfig,
    default_cache_age_min: u64,
) -> Result<SourceRules, ServiceError> {
    let config_err =
        |err: anyhow::Error| ServiceError::Config(format!("source {section}: {err:#}"));

    let mut wildcards = HashMap::new();
    let mut ip_excludes = IpTrie::new();
    for (type_name, items) in &cfg.exclude {
        if type_name == "ip" {
            ip_excludes = IpTrie::from_items(items).map_err(config_err)?;
        } else {
            wildcards.insert(type_name.clone(), WildcardSet::compile(items).map_err(config_err)?);
        }
    }
    let only_ips = if cfg.only_ip.is_empty() {
        None
    } else {
        Some(IpTrie::from_items(&cfg.only_ip).map_err(config_err)?)
    };

    Ok(SourceRules {
        cache_timeout: cfg.cache_timeout_secs(default_cache_age_min),
        wildcards,
        ip_excludes,
        only_ips,
    })
}

/// Encode a section's configured tags, registering the `tags` field.
pub(crate) fn tags_result(
    fields: &SharedFields,
    tags: Option<&str>,
) -> intelwire::Result<Option<EncodedResult>> {
    let Some(tags) = tags else {
        return Ok(None);
    };
    let pos = fields.write().add_field("field:tags")?;
    let pairs: Vec<(u16, &str)> = tags
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| (pos, t))
        .collect();
    if pairs.is_empty() {
        return Ok(None);
    }
    Ok(Some(EncodedResult::encode(&pairs)?))
}

/// A configured field definition whose `shortcut:` attribute binds a column
/// index or JSON path to the field's position.
pub(crate) struct Shortcut {
    pub alias: String,
    pub pos: u16,
}

/// Register configured field definitions and collect their shortcuts.
pub(crate) fn register_fields(
    fields: &SharedFields,
    defs: &[String],
) -> intelwire::Result<Vec<Shortcut>> {
    let mut shortcuts = Vec::new();
    let mut registry = fields.write();
    for def in defs {
        let pos = registry.add_field(def)?;
        if let Some(alias) = intelwire::fields::definition_attr(def, "shortcut") {
            shortcuts.push(Shortcut {
                alias: alias.to_string(),
                pos,
            });
        }
    }
    Ok(shortcuts)
}

/// Walk a dot path through a JSON document. Numeric segments index arrays.
pub(crate) fn json_path<'a>(
    root: &'a serde_json::Value,
    path: &str,
) -> Option<&'a serde_json::Value> {
    let mut node = root;
    for part in path.split('.') {
        node = match part.parse::<usize>() {
            Ok(index) => node.get(index)?,
            Err(_) => node.get(part)?,
        };
    }
    Some(node)
}

/// Render a JSON scalar as a result value. Containers and null produce
/// nothing.
pub(crate) fn json_scalar(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Append a JSON node to the pair list. Arrays contribute one pair per
/// scalar element.
pub(crate) fn push_json_values(pairs: &mut Vec<(u16, String)>, pos: u16, node: &serde_json::Value) {
    match node {
        serde_json::Value::Array(values) => {
            for value in values {
                if let Some(s) = json_scalar(value) {
                    pairs.push((pos, s));
                }
            }
        }
        other => {
            if let Some(s) = json_scalar(other) {
                pairs.push((pos, s));
            }
        }
    }
}
