//! HTTP-backed source.
//!
//! Each lookup becomes one GET against a URL template, with `%value%`
//! replaced by the percent-encoded indicator. The JSON body is mined via
//! shortcut dot paths. A permit count caps concurrent upstream requests;
//! when none is free the fetch is dropped rather than queued, so a slow
//! upstream cannot pile up work behind itself.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use intelwire::EncodedResult;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::Semaphore;

use super::{
    compile_rules, json_path, push_json_values, register_fields, tags_result, FetchError, Query,
    Shortcut, Source, SourceHandle,
};
use crate::config::SourceConfig;
use crate::error::ServiceError;
use crate::registry::{SharedFields, Views};

pub struct HttpSource {
    types: Vec<String>,
    url: String,
    client: reqwest::Client,
    permits: Semaphore,
    shortcuts: Vec<Shortcut>,
    tags: Option<EncodedResult>,
}

pub(super) fn build(
    section: &str,
    cfg: &SourceConfig,
    fields: &SharedFields,
    views: &Views,
    default_cache_age_min: u64,
) -> Result<Arc<SourceHandle>, ServiceError> {
    let config_err = |message: String| ServiceError::Config(format!("source {section}: {message}"));

    let url = cfg
        .url
        .clone()
        .ok_or_else(|| config_err("http sources need a url".into()))?;
    if cfg.types.is_empty() {
        return Err(config_err("http sources need at least one type".into()));
    }

    let rules = compile_rules(section, cfg, default_cache_age_min)?;
    let tags = tags_result(fields, cfg.tags.as_deref()).map_err(|e| config_err(e.to_string()))?;
    let shortcuts = register_fields(fields, &cfg.fields).map_err(|e| config_err(e.to_string()))?;
    if let Some(view) = &cfg.view {
        views.write().insert(section.to_string(), view.clone());
    }

    let mut headers = HeaderMap::new();
    for (name, value) in &cfg.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| config_err(format!("header {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| config_err(format!("header value for {name:?}: {e}")))?;
        headers.insert(name, value);
    }
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(cfg.timeout_ms))
        .default_headers(headers)
        .build()
        .map_err(|e| config_err(e.to_string()))?;

    let source = HttpSource {
        types: cfg.types.clone(),
        url,
        client,
        permits: Semaphore::new(cfg.max_inflight),
        shortcuts,
        tags,
    };
    Ok(SourceHandle::new(section, Arc::new(source), rules))
}

fn render_url(template: &str, value: &str) -> String {
    template.replace("%value%", &urlencoding::encode(value))
}

#[async_trait]
impl Source for HttpSource {
    fn types(&self) -> &[String] {
        &self.types
    }

    async fn fetch(&self, query: &Query) -> Result<Option<EncodedResult>, FetchError> {
        let Ok(_permit) = self.permits.try_acquire() else {
            return Err(FetchError::Dropped);
        };

        let url = render_url(&self.url, &query.value);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("sending request")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status().context("upstream status")?;
        let body: serde_json::Value = response.json().await.context("decoding body")?;

        let mut pairs: Vec<(u16, String)> = Vec::new();
        for shortcut in &self.shortcuts {
            if let Some(node) = json_path(&body, &shortcut.alias) {
                push_json_values(&mut pairs, shortcut.pos, node);
            }
        }
        if pairs.is_empty() {
            return Ok(None);
        }
        let item = EncodedResult::encode(&pairs).map_err(anyhow::Error::from)?;
        Ok(Some(match &self.tags {
            Some(tags) => EncodedResult::combine(&[Some(item), Some(tags.clone())]),
            None => item,
        }))
    }
}
