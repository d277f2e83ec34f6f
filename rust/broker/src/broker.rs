//! The lookup broker.
//!
//! A lookup walks one path regardless of who asked: count the request,
//! split hash values from their content type, apply the global exclusions,
//! read the cache entry, then resolve every participating source
//! concurrently. Fresh cache slices answer without a fetch; everything
//! else goes to the source with in-flight coalescing. Contributions are
//! combined in registration order and the entry is written back once if
//! any source produced a fresh slice.
//!
//! Resolution runs in a spawned task. The caller's deadline applies to the
//! join handle only, so a timed-out lookup keeps resolving in the
//! background and its cache write-back still lands.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use intelwire::EncodedResult;
use parking_lot::RwLock;
use tracing::info;

use crate::cache::{epoch_secs, CacheEntry, ResultCache};
use crate::config::Config;
use crate::error::ServiceError;
use crate::filter::ValueFilter;
use crate::registry::{SharedFields, TypeInfo, TypeRegistry, TypeStats, Views};
use crate::source::{Query, SourceHandle, SourceOutcome};

pub struct Broker {
    fields: SharedFields,
    types: TypeRegistry,
    cache: Arc<dyn ResultCache>,
    views: Views,
    request_timeout: Duration,
}

impl Broker {
    pub fn new(
        config: &Config,
        fields: SharedFields,
        cache: Arc<dyn ResultCache>,
    ) -> anyhow::Result<Broker> {
        let mut filters = HashMap::new();
        for (type_name, items) in &config.exclusions {
            let filter = ValueFilter::for_type(type_name, items)
                .with_context(|| format!("global exclusions for type {type_name}"))?;
            filters.insert(type_name.clone(), Arc::new(filter));
        }
        Ok(Broker {
            fields,
            types: TypeRegistry::new(filters),
            cache,
            views: Arc::new(RwLock::new(BTreeMap::new())),
            request_timeout: Duration::from_millis(config.service.request_timeout_ms),
        })
    }

    pub fn fields(&self) -> &SharedFields {
        &self.fields
    }

    pub fn views(&self) -> &Views {
        &self.views
    }

    pub fn register(&self, handle: Arc<SourceHandle>) {
        self.types.register(handle);
    }

    pub fn handles(&self) -> Vec<Arc<SourceHandle>> {
        self.types.handles()
    }

    pub fn handle(&self, section: &str) -> Option<Arc<SourceHandle>> {
        self.types.handle(section)
    }

    pub fn type_info(&self, name: &str) -> Arc<TypeInfo> {
        self.types.type_info(name)
    }

    pub fn type_names(&self) -> Vec<String> {
        self.types.type_names()
    }

    pub fn type_stats(&self) -> Vec<TypeStats> {
        self.types.stats()
    }

    /// Resolve one query against every source answering the type, or only
    /// the given handles. Returns the combined result; an empty result
    /// means no source had anything to say.
    pub async fn lookup(
        &self,
        type_name: &str,
        value: &str,
        only: Option<Vec<Arc<SourceHandle>>>,
    ) -> Result<EncodedResult, ServiceError> {
        let info = self.types.type_info(type_name);
        info.counters.request.fetch_add(1, Ordering::Relaxed);

        let query = split_query(type_name, value);
        if !info.globally_allowed(&query.value) {
            return Ok(EncodedResult::empty());
        }

        let sources = only.unwrap_or_else(|| info.sources());
        let task = tokio::spawn(resolve(self.cache.clone(), info, query.clone(), sources));

        match tokio::time::timeout(self.request_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ServiceError::Internal(anyhow!("lookup task failed: {join}"))),
            Err(_) => Err(ServiceError::Timeout {
                type_name: query.type_name,
                value: query.value,
            }),
        }
    }

    /// One log line of counters per source.
    pub fn log_stats(&self) {
        for handle in self.handles() {
            let s = handle.snapshot();
            info!(
                source = %s.source,
                request = s.request,
                cache_hit = s.cache_hit,
                cache_miss = s.cache_miss,
                cache_refresh = s.cache_refresh,
                direct_hit = s.direct_hit,
                dropped = s.request_dropped,
                average_ms = %s.recent_average_ms,
                "source counters"
            );
        }
    }
}

/// The detached half of a lookup. Owns everything it touches so the
/// caller's deadline cannot cut the cache write-back short.
async fn resolve(
    cache: Arc<dyn ResultCache>,
    info: Arc<TypeInfo>,
    query: Query,
    sources: Vec<Arc<SourceHandle>>,
) -> Result<EncodedResult, ServiceError> {
    let key = format!("{}-{}", query.type_name, query.value);
    let mut entry = match cache.get(&key).await {
        Some(entry) => {
            // Counts as a hit even when every slice turns out stale.
            info.counters.cache_hit.fetch_add(1, Ordering::Relaxed);
            entry
        }
        None => CacheEntry::new(),
    };

    let now = epoch_secs();

    enum Plan {
        Skip,
        Cached(EncodedResult),
        Fetch,
    }

    let mut plans = Vec::with_capacity(sources.len());
    for src in &sources {
        // Excluded values leave no trace in this source's counters.
        if !src.allowed(&query.type_name, &query.value) {
            plans.push(Plan::Skip);
            continue;
        }
        src.stats.request.fetch_add(1, Ordering::Relaxed);

        let timeout = src.cache_timeout();
        let fresh = entry
            .get(src.section())
            .filter(|c| c.ts as i64 + timeout >= now as i64)
            .map(|c| c.result.clone());
        match fresh {
            Some(result) => {
                src.stats.cache_hit.fetch_add(1, Ordering::Relaxed);
                info.counters.cache_src_hit.fetch_add(1, Ordering::Relaxed);
                plans.push(Plan::Cached(result));
            }
            None => {
                if timeout == -1 {
                    // Uncacheable sources count neither misses nor refreshes.
                } else if entry.contains_key(src.section()) {
                    src.stats.cache_refresh.fetch_add(1, Ordering::Relaxed);
                    info.counters.cache_src_refresh.fetch_add(1, Ordering::Relaxed);
                } else {
                    src.stats.cache_miss.fetch_add(1, Ordering::Relaxed);
                    info.counters.cache_src_miss.fetch_add(1, Ordering::Relaxed);
                }
                // Dropping the stale slice alone never forces a write-back.
                entry.remove(src.section());
                plans.push(Plan::Fetch);
            }
        }
    }

    let fetches = sources.iter().zip(plans.iter()).map(|(src, plan)| {
        let src = src.clone();
        let query = &query;
        async move {
            match plan {
                Plan::Skip => SourceOutcome::nothing(),
                Plan::Cached(result) => SourceOutcome {
                    contribution: Some(result.clone()),
                    staged: None,
                    failure: None,
                },
                Plan::Fetch => src.fetch_dedup(query, now).await,
            }
        }
    });
    let outcomes = futures::future::join_all(fetches).await;

    let mut entry_changed = false;
    let mut failure: Option<String> = None;
    let mut results: Vec<Option<EncodedResult>> = Vec::with_capacity(outcomes.len());
    for (src, outcome) in sources.iter().zip(outcomes) {
        if let Some(staged) = outcome.staged {
            entry.insert(src.section().to_string(), staged);
            entry_changed = true;
        }
        if let Some(message) = outcome.failure {
            failure.get_or_insert(message);
        }
        results.push(outcome.contribution);
    }

    // A failed source fails the whole query and forfeits the write-back.
    if let Some(message) = failure {
        return Err(ServiceError::Source(message));
    }
    if entry_changed {
        cache.set(&key, entry).await;
    }
    Ok(EncodedResult::combine(&results))
}

/// Hash types may carry a content type after a semicolon; everything else
/// keeps the raw value.
fn split_query(type_name: &str, raw: &str) -> Query {
    let (value, content_type) = if type_name == "md5" || type_name == "sha256" {
        match raw.split_once(';') {
            Some((value, content_type)) => (value.to_string(), Some(content_type.to_string())),
            None => (raw.to_string(), None),
        }
    } else {
        (raw.to_string(), None)
    };
    Query {
        type_name: type_name.to_string(),
        value,
        content_type,
    }
}
