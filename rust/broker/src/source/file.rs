//! File-backed sources.
//!
//! A file source loads a whole document into an in-memory map keyed by
//! indicator value and answers lookups from it. Three formats exist:
//!
//! * `tagger` lines of `key;name=value;...` with `#field:` definitions and
//!   `#view:` fragments at the top,
//! * `csv` with unquoted comma-separated columns, shortcuts naming column
//!   indices,
//! * `json` arrays of objects, shortcuts naming dot paths.
//!
//! With `reload_secs` set the file is re-read on an interval; a parse
//! failure keeps the previous items.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use intelwire::EncodedResult;
use parking_lot::RwLock;
use tracing::{info, warn};

use super::{
    compile_rules, json_path, push_json_values, register_fields, tags_result, FetchError, Query,
    Shortcut, Source, SourceHandle,
};
use crate::config::{FileFormat, SourceConfig};
use crate::error::ServiceError;
use crate::registry::{SharedFields, Views};

pub struct FileSource {
    inner: Arc<FileInner>,
}

struct FileInner {
    section: String,
    path: PathBuf,
    format: FileFormat,
    column: usize,
    key_path: Option<String>,
    fields: SharedFields,
    views: Views,
    shortcuts: Vec<Shortcut>,
    tags: Option<EncodedResult>,
    items: RwLock<HashMap<String, EncodedResult>>,
    types: Vec<String>,
}

pub(super) fn build(
    section: &str,
    cfg: &SourceConfig,
    fields: &SharedFields,
    views: &Views,
    default_cache_age_min: u64,
) -> Result<Arc<SourceHandle>, ServiceError> {
    let config_err = |message: String| ServiceError::Config(format!("source {section}: {message}"));

    let path = cfg
        .file
        .clone()
        .ok_or_else(|| config_err("file sources need a file".into()))?;
    let type_name = cfg
        .type_name
        .clone()
        .ok_or_else(|| config_err("file sources need a type".into()))?;
    if cfg.format == FileFormat::Json && cfg.key_path.is_none() {
        return Err(config_err("json sources need a key_path".into()));
    }

    let rules = compile_rules(section, cfg, default_cache_age_min)?;
    let tags = tags_result(fields, cfg.tags.as_deref()).map_err(|e| config_err(e.to_string()))?;
    let shortcuts = register_fields(fields, &cfg.fields).map_err(|e| config_err(e.to_string()))?;
    if let Some(view) = &cfg.view {
        views.write().insert(section.to_string(), view.clone());
    }

    let inner = Arc::new(FileInner {
        section: section.to_string(),
        path,
        format: cfg.format,
        column: cfg.column,
        key_path: cfg.key_path.clone(),
        fields: fields.clone(),
        views: views.clone(),
        shortcuts,
        tags,
        items: RwLock::new(HashMap::new()),
        types: vec![type_name],
    });
    inner
        .load()
        .map_err(|err| config_err(format!("{err:#}")))?;

    if let Some(secs) = cfg.reload_secs.filter(|s| *s > 0) {
        spawn_reload(inner.clone(), Duration::from_secs(secs));
    }

    Ok(SourceHandle::new(
        section,
        Arc::new(FileSource { inner }),
        rules,
    ))
}

fn spawn_reload(inner: Arc<FileInner>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(err) = inner.load() {
                warn!(source = %inner.section, error = %err, "reload failed, keeping previous items");
            }
        }
    });
}

impl FileInner {
    fn load(&self) -> anyhow::Result<()> {
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let (items, view) = match self.format {
            FileFormat::Tagger => self.parse_tagger(&raw)?,
            FileFormat::Csv => (self.parse_csv(&raw)?, None),
            FileFormat::Json => (self.parse_json(&raw)?, None),
        };
        let count = items.len();
        *self.items.write() = items;
        if let Some(view) = view {
            self.views.write().insert(self.section.clone(), view);
        }
        info!(source = %self.section, items = count, "loaded");
        Ok(())
    }

    fn parse_tagger(
        &self,
        raw: &str,
    ) -> anyhow::Result<(HashMap<String, EncodedResult>, Option<String>)> {
        let mut aliases: HashMap<String, u16> = HashMap::new();
        let mut view = String::new();
        let mut items = HashMap::new();

        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix('#') {
                if rest.starts_with("field:") {
                    let pos = self.fields.write().add_field(rest)?;
                    if let Some(name) = intelwire::fields::definition_attr(rest, "field") {
                        aliases.insert(name.to_string(), pos);
                    }
                    if let Some(alias) = intelwire::fields::definition_attr(rest, "shortcut") {
                        aliases.insert(alias.to_string(), pos);
                    }
                } else if let Some(fragment) = rest.strip_prefix("view:") {
                    if !view.is_empty() {
                        view.push('\n');
                    }
                    view.push_str(fragment.trim());
                }
                continue;
            }

            let mut parts = line.split(';');
            let key = parts.next().unwrap_or_default().trim();
            if key.is_empty() {
                continue;
            }
            let mut pairs: Vec<(u16, String)> = Vec::new();
            for part in parts {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let Some((name, value)) = part.split_once('=') else {
                    warn!(source = %self.section, segment = %part, "tagger segment without '='");
                    continue;
                };
                let name = name.trim();
                let pos = match aliases.get(name) {
                    Some(pos) => *pos,
                    None => {
                        let pos = self.fields.write().add_field(&format!("field:{name}"))?;
                        aliases.insert(name.to_string(), pos);
                        pos
                    }
                };
                pairs.push((pos, value.trim().to_string()));
            }
            items.insert(key.to_string(), self.encode_with_tags(&pairs)?);
        }

        Ok((items, (!view.is_empty()).then_some(view)))
    }

    fn parse_csv(&self, raw: &str) -> anyhow::Result<HashMap<String, EncodedResult>> {
        let mut items = HashMap::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let columns: Vec<&str> = line.split(',').map(str::trim).collect();
            let Some(key) = columns.get(self.column).filter(|k| !k.is_empty()) else {
                continue;
            };
            let mut pairs: Vec<(u16, String)> = Vec::new();
            for shortcut in &self.shortcuts {
                let Ok(index) = shortcut.alias.parse::<usize>() else {
                    continue;
                };
                if let Some(value) = columns.get(index).filter(|v| !v.is_empty()) {
                    pairs.push((shortcut.pos, value.to_string()));
                }
            }
            items.insert(key.to_string(), self.encode_with_tags(&pairs)?);
        }
        Ok(items)
    }

    fn parse_json(&self, raw: &str) -> anyhow::Result<HashMap<String, EncodedResult>> {
        let Some(key_path) = self.key_path.as_deref() else {
            bail!("json sources need a key_path");
        };
        let doc: serde_json::Value = serde_json::from_str(raw).context("parsing JSON document")?;
        let Some(elements) = doc.as_array() else {
            bail!("JSON document must be an array");
        };

        let mut items = HashMap::new();
        for element in elements {
            let mut pairs: Vec<(u16, String)> = Vec::new();
            for shortcut in &self.shortcuts {
                if let Some(node) = json_path(element, &shortcut.alias) {
                    push_json_values(&mut pairs, shortcut.pos, node);
                }
            }
            let encoded = self.encode_with_tags(&pairs)?;

            // An array-valued key stores the same result under each element.
            match json_path(element, key_path) {
                Some(serde_json::Value::Array(keys)) => {
                    for key in keys {
                        if let Some(key) = super::json_scalar(key) {
                            items.insert(key, encoded.clone());
                        }
                    }
                }
                Some(node) => {
                    if let Some(key) = super::json_scalar(node) {
                        items.insert(key, encoded);
                    }
                }
                None => {}
            }
        }
        Ok(items)
    }

    fn encode_with_tags(&self, pairs: &[(u16, String)]) -> anyhow::Result<EncodedResult> {
        let item = EncodedResult::encode(pairs)?;
        Ok(match &self.tags {
            Some(tags) => EncodedResult::combine(&[Some(item), Some(tags.clone())]),
            None => item,
        })
    }
}

#[async_trait]
impl Source for FileSource {
    fn types(&self) -> &[String] {
        &self.inner.types
    }

    async fn fetch(&self, query: &Query) -> Result<Option<EncodedResult>, FetchError> {
        Ok(self.inner.items.read().get(&query.value).cloned())
    }

    async fn dump(&self) -> Option<Vec<(String, EncodedResult)>> {
        let items = self.inner.items.read();
        let mut all: Vec<(String, EncodedResult)> =
            items.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Some(all)
    }

    fn item_count(&self) -> Option<usize> {
        Some(self.inner.items.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use intelwire::FieldRegistry;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn fixture(
        contents: &str,
        config: &str,
    ) -> (Arc<SourceHandle>, SharedFields, Views, NamedTempFile) {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write");

        let raw = format!("kind = \"file\"\nfile = {:?}\n{config}", file.path());
        let cfg: SourceConfig = toml::from_str(&raw).expect("source config");
        let fields = Arc::new(RwLock::new(FieldRegistry::new()));
        let views: Views = Arc::new(RwLock::new(BTreeMap::new()));
        let handle = build("fixture", &cfg, &fields, &views, 60).expect("builds");
        (handle, fields, views, file)
    }

    async fn lookup(handle: &Arc<SourceHandle>, type_name: &str, value: &str) -> Option<Vec<(u16, String)>> {
        let query = Query {
            type_name: type_name.to_string(),
            value: value.to_string(),
            content_type: None,
        };
        let outcome = handle.fetch_dedup(&query, 0).await;
        outcome
            .contribution
            .map(|r| r.decode().expect("decodes"))
    }

    #[tokio::test]
    async fn tagger_resolves_fields_and_appends_tags() {
        let contents = "\
#field:intel.owner;db:intel.owner;kind:lotermfield;friendly:Owner
#view:if (session.intel)
#view:  div.sessionDetailMeta.bold Intel
bad.example;intel.owner=acme;first.seen=2020
plain.example
";
        let (handle, fields, views, _file) =
            fixture(contents, "type = \"domain\"\nformat = \"tagger\"\ntags = \"feed\"\n");

        let owner = fields.read().position("intel.owner").expect("registered");
        let seen = fields.read().position("first.seen").expect("auto added");
        let tags = fields.read().position("tags").expect("registered");

        let pairs = lookup(&handle, "domain", "bad.example").await.expect("hit");
        assert_eq!(
            pairs,
            vec![
                (owner, "acme".to_string()),
                (seen, "2020".to_string()),
                (tags, "feed".to_string()),
            ]
        );

        // A bare key still gets the source tags.
        let pairs = lookup(&handle, "domain", "plain.example").await.expect("hit");
        assert_eq!(pairs, vec![(tags, "feed".to_string())]);

        assert!(lookup(&handle, "domain", "missing.example").await.is_none());
        assert_eq!(
            views.read().get("fixture").map(String::as_str),
            Some("if (session.intel)\ndiv.sessionDetailMeta.bold Intel")
        );
        assert_eq!(handle.item_count(), Some(2));
    }

    #[tokio::test]
    async fn csv_shortcuts_name_column_indices() {
        let contents = "\
# comment line
10.0.0.1,acme,high
10.0.0.2,umbrella
";
        let config = "\
type = \"ip\"
format = \"csv\"
column = 0
fields = [
  \"field:intel.owner;db:intel.owner;kind:lotermfield;shortcut:1\",
  \"field:intel.severity;db:intel.severity;kind:lotermfield;shortcut:2\",
]
";
        let (handle, fields, _views, _file) = fixture(contents, config);
        let owner = fields.read().position("intel.owner").expect("registered");
        let severity = fields.read().position("intel.severity").expect("registered");

        let pairs = lookup(&handle, "ip", "10.0.0.1").await.expect("hit");
        assert_eq!(
            pairs,
            vec![(owner, "acme".to_string()), (severity, "high".to_string())]
        );

        // Short rows keep whatever columns they have.
        let pairs = lookup(&handle, "ip", "10.0.0.2").await.expect("hit");
        assert_eq!(pairs, vec![(owner, "umbrella".to_string())]);
    }

    #[tokio::test]
    async fn json_walks_key_paths_and_fans_out_array_keys() {
        let contents = r#"[
            {"ioc": {"values": ["a.test", "b.test"]}, "meta": {"actor": "apt0", "score": 9}},
            {"ioc": {"values": "c.test"}, "meta": {"actor": "apt1"}}
        ]"#;
        let config = "\
type = \"domain\"
format = \"json\"
key_path = \"ioc.values\"
fields = [
  \"field:intel.actor;db:intel.actor;kind:lotermfield;shortcut:meta.actor\",
  \"field:intel.score;db:intel.score;kind:integer;shortcut:meta.score\",
]
";
        let (handle, fields, _views, _file) = fixture(contents, config);
        let actor = fields.read().position("intel.actor").expect("registered");
        let score = fields.read().position("intel.score").expect("registered");

        for key in ["a.test", "b.test"] {
            let pairs = lookup(&handle, "domain", key).await.expect("hit");
            assert_eq!(
                pairs,
                vec![(actor, "apt0".to_string()), (score, "9".to_string())]
            );
        }
        let pairs = lookup(&handle, "domain", "c.test").await.expect("hit");
        assert_eq!(pairs, vec![(actor, "apt1".to_string())]);
    }

    #[tokio::test]
    async fn dump_lists_items_sorted_by_key() {
        let contents = "b.test;x=1\na.test;x=2\n";
        let (handle, _fields, _views, _file) =
            fixture(contents, "type = \"domain\"\nformat = \"tagger\"\n");
        let dump = handle.dump().await.expect("file sources dump");
        let keys: Vec<&str> = dump.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["a.test", "b.test"]);
    }

    #[tokio::test]
    async fn missing_file_is_a_config_error() {
        let cfg: SourceConfig = toml::from_str(
            "kind = \"file\"\nfile = \"/nonexistent/feed.csv\"\ntype = \"ip\"\n",
        )
        .expect("source config");
        let fields = Arc::new(RwLock::new(FieldRegistry::new()));
        let views: Views = Arc::new(RwLock::new(BTreeMap::new()));
        assert!(build("gone", &cfg, &fields, &views, 60).is_err());
    }

    #[tokio::test]
    async fn json_without_key_path_is_a_config_error() {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(b"[]").expect("write");
        let raw = format!(
            "kind = \"file\"\nfile = {:?}\ntype = \"domain\"\nformat = \"json\"\n",
            file.path()
        );
        let cfg: SourceConfig = toml::from_str(&raw).expect("source config");
        let fields = Arc::new(RwLock::new(FieldRegistry::new()));
        let views: Views = Arc::new(RwLock::new(BTreeMap::new()));
        assert!(build("nokey", &cfg, &fields, &views, 60).is_err());
    }
}
