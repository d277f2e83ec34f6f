//! HTTP surface.
//!
//! The batch endpoint and the field tables speak the binary wire formats;
//! the rest of the surface is JSON or plain text. Several endpoints answer
//! misses with a 200 and a fixed string (`Not found`, `Unknown source ...`)
//! because long-deployed capture agents parse bodies, not status codes.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use intelwire::FieldRegistry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::broker::Broker;
use crate::cache::MemoryCache;
use crate::config::Config;
use crate::registry::{SharedFields, TypeStats};
use crate::source::{self, SourceHandle, SourceStatsSnapshot};
use crate::state::AppState;

pub struct Server {
    state: AppState,
}

impl Server {
    /// Assemble the broker and its sources from a validated configuration.
    /// A broken source section is logged and skipped.
    pub async fn new(config: Config) -> anyhow::Result<Server> {
        let config = Arc::new(config);
        let fields: SharedFields = Arc::new(RwLock::new(FieldRegistry::new()));
        fields.write().add_field("field:tags")?;

        let cache = Arc::new(MemoryCache::new(config.cache.max_entries));
        let broker = Arc::new(Broker::new(&config, fields, cache)?);

        for (section, source_cfg) in &config.sources {
            match source::build(
                section,
                source_cfg,
                broker.fields(),
                broker.views(),
                config.cache.cache_age_min,
            ) {
                Ok(handle) => {
                    info!(source = %section, kind = %source_cfg.kind, "registered source");
                    broker.register(handle);
                }
                Err(err) => {
                    error!(source = %section, error = %err, "skipping source");
                }
            }
        }

        Ok(Server {
            state: AppState::new(config, broker),
        })
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/get", post(batch))
            .route("/fields", get(fields))
            .route("/views", get(views))
            .route("/sources", get(sources))
            .route("/types", get(types))
            .route("/types/:source", get(types_for_source))
            .route("/stats", get(stats))
            .route("/dump/:source", get(dump))
            .route("/:type_name/:value", get(lookup))
            .route("/:source/:type_name/:value", get(lookup_source))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        if self.state.config.service.debug {
            let broker = self.state.broker.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    broker.log_stats();
                }
            });
        }

        let addr = self.state.config.service.listen_addr.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        info!(addr = %addr, "listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct BatchParams {
    ver: Option<String>,
    /// Comma-separated field table hashes the client already holds.
    hashes: Option<String>,
}

async fn batch(
    State(state): State<AppState>,
    Query(params): Query<BatchParams>,
    body: Bytes,
) -> Response {
    let queries = match intelwire::batch::decode_request(&body) {
        Ok(queries) => queries,
        Err(err) => {
            error!(error = %err, "malformed batch packet");
            return "Received malformed packet".into_response();
        }
    };

    let lookups = queries
        .iter()
        .map(|q| state.broker.lookup(&q.type_name, &q.value, None));
    let resolved = futures::future::join_all(lookups).await;

    let mut results = Vec::with_capacity(resolved.len());
    for (query, result) in queries.iter().zip(resolved) {
        match result {
            Ok(result) => results.push(result),
            Err(err) => {
                error!(
                    type_name = %query.type_name,
                    value = %query.value,
                    error = %err,
                    "batch lookup failed"
                );
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    }

    // The found counter moves at serialization time, once per non-empty
    // result.
    for (query, result) in queries.iter().zip(&results) {
        if result.count() > 0 {
            state
                .broker
                .type_info(&query.type_name)
                .counters
                .found
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    if params.ver.as_deref() == Some("2") {
        let (hash, tail) = {
            let registry = state.broker.fields().read();
            (registry.hash_hex().to_string(), registry.table_v1_tail())
        };
        let known = params.hashes.unwrap_or_default();
        let send_fields = !known.split(',').any(|h| h.trim() == hash);
        let table = send_fields.then_some(tail.as_ref());
        intelwire::batch::encode_response_v2(&hash, table, &results).into_response()
    } else {
        let ts = state.broker.fields().read().ts();
        intelwire::batch::encode_response_v0(ts, &results).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct FieldsParams {
    ver: Option<String>,
}

async fn fields(State(state): State<AppState>, Query(params): Query<FieldsParams>) -> Response {
    let registry = state.broker.fields().read();
    match params.ver.as_deref() {
        None | Some("0") => match registry.table_v0() {
            Ok(table) => table.into_response(),
            Err(err) => {
                error!(error = %err, "legacy field table unavailable");
                StatusCode::NOT_FOUND.into_response()
            }
        },
        Some(_) => registry.table_v1().into_response(),
    }
}

async fn views(State(state): State<AppState>) -> Json<BTreeMap<String, String>> {
    Json(state.broker.views().read().clone())
}

async fn sources(State(state): State<AppState>) -> Json<Vec<String>> {
    let mut sections: Vec<String> = state
        .broker
        .handles()
        .iter()
        .map(|h| h.section().to_string())
        .collect();
    sections.sort();
    Json(sections)
}

async fn types(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.broker.type_names())
}

async fn types_for_source(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> Json<Vec<String>> {
    let types = state
        .broker
        .handle(&source)
        .map(|h| {
            let mut types = h.types();
            types.sort();
            types
        })
        .unwrap_or_default();
    Json(types)
}

#[derive(Debug, Default, Deserialize)]
struct StatsParams {
    search: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    start_time: u64,
    types: Vec<TypeStats>,
    sources: Vec<SourceStatsSnapshot>,
}

async fn stats(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> Json<StatsResponse> {
    let needle = params.search.map(|s| s.to_lowercase());
    let matches = |name: &str| {
        needle
            .as_deref()
            .map_or(true, |n| name.to_lowercase().contains(n))
    };

    let types = state
        .broker
        .type_stats()
        .into_iter()
        .filter(|t| matches(&t.type_name))
        .collect();
    let sources = state
        .broker
        .handles()
        .iter()
        .filter(|h| matches(h.section()))
        .map(|h| h.snapshot())
        .collect();

    Json(StatsResponse {
        start_time: state.started_at,
        types,
        sources,
    })
}

async fn dump(State(state): State<AppState>, Path(source): Path<String>) -> Response {
    let Some(handle) = state.broker.handle(&source) else {
        return format!("Unknown source {source}").into_response();
    };
    let Some(items) = handle.dump().await else {
        return "The source doesn't support dump".into_response();
    };

    let registry = state.broker.fields().read();
    let mut body = String::new();
    for (key, result) in items {
        match registry.render(&result) {
            Ok(entries) => {
                let line = serde_json::json!({ "key": key, "fields": entries });
                body.push_str(&line.to_string());
                body.push('\n');
            }
            Err(err) => {
                error!(source = %source, key = %key, error = %err, "undecodable stored result");
            }
        }
    }
    body.into_response()
}

async fn lookup(
    State(state): State<AppState>,
    Path((type_name, value)): Path<(String, String)>,
) -> Response {
    respond_single(&state, &type_name, &value, None).await
}

async fn lookup_source(
    State(state): State<AppState>,
    Path((source, type_name, value)): Path<(String, String, String)>,
) -> Response {
    let Some(handle) = state.broker.handle(&source) else {
        return format!("Unknown source {source}").into_response();
    };
    respond_single(&state, &type_name, &value, Some(vec![handle])).await
}

async fn respond_single(
    state: &AppState,
    type_name: &str,
    value: &str,
    only: Option<Vec<Arc<SourceHandle>>>,
) -> Response {
    match state.broker.lookup(type_name, value, only).await {
        Ok(result) => {
            let rendered = state.broker.fields().read().render(&result);
            match rendered {
                Ok(entries) => Json(entries).into_response(),
                Err(err) => {
                    error!(type_name, value, error = %err, "rendering result failed");
                    "Not found".into_response()
                }
            }
        }
        Err(err) => {
            error!(type_name, value, error = %err, "lookup failed");
            "Not found".into_response()
        }
    }
}
