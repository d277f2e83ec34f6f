//! Per-type state: the sources answering each indicator type, the global
//! exclusion filter for the type, and its counters.
//!
//! Types come into existence lazily. The first lookup naming a type creates
//! its entry, picks up whichever global exclusions the configuration holds
//! for that name, and snapshots the sources that declared it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use intelwire::FieldRegistry;
use parking_lot::RwLock;
use serde::Serialize;

use crate::filter::ValueFilter;
use crate::source::SourceHandle;

/// The process-wide field registry, shared by sources and the wire layer.
pub type SharedFields = Arc<RwLock<FieldRegistry>>;

/// Views keyed by their owning source section.
pub type Views = Arc<RwLock<BTreeMap<String, String>>>;

#[derive(Default)]
pub struct TypeCounters {
    pub request: AtomicU64,
    pub found: AtomicU64,
    pub cache_hit: AtomicU64,
    pub cache_src_hit: AtomicU64,
    pub cache_src_miss: AtomicU64,
    pub cache_src_refresh: AtomicU64,
}

pub struct TypeInfo {
    pub name: String,
    sources: RwLock<Vec<Arc<SourceHandle>>>,
    excludes: Arc<ValueFilter>,
    pub counters: TypeCounters,
}

impl TypeInfo {
    /// Whether the global exclusions let this value through.
    pub fn globally_allowed(&self, value: &str) -> bool {
        !self.excludes.excludes(value)
    }

    /// Sources answering this type, in registration order.
    pub fn sources(&self) -> Vec<Arc<SourceHandle>> {
        self.sources.read().clone()
    }

    fn stats(&self) -> TypeStats {
        let c = &self.counters;
        TypeStats {
            type_name: self.name.clone(),
            request: c.request.load(Ordering::Relaxed),
            found: c.found.load(Ordering::Relaxed),
            cache_hit: c.cache_hit.load(Ordering::Relaxed),
            cache_src_hit: c.cache_src_hit.load(Ordering::Relaxed),
            cache_src_miss: c.cache_src_miss.load(Ordering::Relaxed),
            cache_src_refresh: c.cache_src_refresh.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeStats {
    #[serde(rename = "type")]
    pub type_name: String,
    pub request: u64,
    pub found: u64,
    pub cache_hit: u64,
    pub cache_src_hit: u64,
    pub cache_src_miss: u64,
    pub cache_src_refresh: u64,
}

pub struct TypeRegistry {
    types: RwLock<HashMap<String, Arc<TypeInfo>>>,
    global_filters: HashMap<String, Arc<ValueFilter>>,
    handles: RwLock<Vec<Arc<SourceHandle>>>,
}

impl TypeRegistry {
    pub fn new(global_filters: HashMap<String, Arc<ValueFilter>>) -> TypeRegistry {
        TypeRegistry {
            types: RwLock::new(HashMap::new()),
            global_filters,
            handles: RwLock::new(Vec::new()),
        }
    }

    /// Register a source; existing types it declares pick it up immediately.
    pub fn register(&self, handle: Arc<SourceHandle>) {
        self.handles.write().push(handle.clone());
        let types = self.types.read();
        for info in types.values() {
            if handle.answers(&info.name) {
                info.sources.write().push(handle.clone());
            }
        }
    }

    /// Fetch the type entry, creating it on first sight.
    pub fn type_info(&self, name: &str) -> Arc<TypeInfo> {
        if let Some(info) = self.types.read().get(name) {
            return info.clone();
        }
        let mut types = self.types.write();
        types
            .entry(name.to_string())
            .or_insert_with(|| {
                let excludes = self
                    .global_filters
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(ValueFilter::empty_for(name)));
                let sources = self
                    .handles
                    .read()
                    .iter()
                    .filter(|h| h.answers(name))
                    .cloned()
                    .collect();
                Arc::new(TypeInfo {
                    name: name.to_string(),
                    sources: RwLock::new(sources),
                    excludes,
                    counters: TypeCounters::default(),
                })
            })
            .clone()
    }

    /// All source handles, in registration order.
    pub fn handles(&self) -> Vec<Arc<SourceHandle>> {
        self.handles.read().clone()
    }

    pub fn handle(&self, section: &str) -> Option<Arc<SourceHandle>> {
        self.handles
            .read()
            .iter()
            .find(|h| h.section() == section)
            .cloned()
    }

    /// Names of every type seen so far, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Counter snapshot per type, sorted by name.
    pub fn stats(&self) -> Vec<TypeStats> {
        let mut stats: Vec<TypeStats> = self.types.read().values().map(|t| t.stats()).collect();
        stats.sort_by(|a, b| a.type_name.cmp(&b.type_name));
        stats
    }
}
