//! Shared harness for the HTTP surface tests: a full service assembled
//! from a throwaway configuration with file-backed fixtures, driven
//! through the router without binding a socket.

use std::future::Future;
use std::sync::Once;

use axum::{
    body::{self, Body},
    http::{self, Request, StatusCode},
    Router,
};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use intelmux::config::Config;
use intelmux::server::Server;

static TRACING_INIT: Once = Once::new();

const TAGGER_FIXTURE: &str = "\
#field:intel.owner;db:intel.owner;kind:lotermfield;friendly:Owner
#view:if (session.intel)
bad.example;intel.owner=acme
worse.example;intel.owner=umbrella;note=watch
";

const CSV_FIXTURE: &str = "\
64500,acme-as
64501,umbrella-as
";

/// Run a test closure against a freshly assembled service. The fixture
/// carries a tagger feed answering `domain`, a CSV feed answering a custom
/// `asn` type, and a permitless http source that drops every `ip` query
/// without touching the network.
pub async fn with_app<F, Fut>(test: F)
where
    F: FnOnce(TestApp) -> Fut,
    Fut: Future<Output = ()>,
{
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });

    let workdir = TempDir::new().expect("temp workdir");
    let tagger_path = workdir.path().join("feed.tagger");
    let csv_path = workdir.path().join("asn.csv");
    std::fs::write(&tagger_path, TAGGER_FIXTURE).expect("tagger fixture");
    std::fs::write(&csv_path, CSV_FIXTURE).expect("csv fixture");

    let raw = format!(
        r#"
[service]
listen_addr = "127.0.0.1:0"
request_timeout_ms = 2000

[cache]
max_entries = 100
cache_age_min = 60

[sources.asnfeed]
kind = "file"
file = {csv_path:?}
type = "asn"
format = "csv"
column = 0
fields = ["field:asn.owner;db:asn.owner;kind:lotermfield;shortcut:1"]

[sources.probe]
kind = "http"
url = "http://127.0.0.1:9/%value%"
types = ["ip"]
max_inflight = 0

[sources.taggerfeed]
kind = "file"
file = {tagger_path:?}
type = "domain"
format = "tagger"
tags = "feed"
"#
    );
    let config: Config = toml::from_str(&raw).expect("fixture config parses");
    let server = Server::new(config).await.expect("server assembles");

    let app = TestApp {
        router: server.router(),
        _workdir: workdir,
    };
    test(app).await;
}

pub struct TestApp {
    router: Router,
    _workdir: TempDir,
}

impl TestApp {
    pub async fn get(&self, path: &str) -> http::Response<Body> {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .expect("failed to build harness request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle harness request")
    }

    pub async fn post_bytes(&self, path: &str, payload: Vec<u8>) -> http::Response<Body> {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header(http::header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(payload))
            .expect("failed to build harness request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle harness request")
    }
}

pub async fn read_bytes(response: http::Response<Body>) -> (StatusCode, Vec<u8>) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should collect");
    (status, bytes.to_vec())
}

pub async fn read_text(response: http::Response<Body>) -> (StatusCode, String) {
    let (status, bytes) = read_bytes(response).await;
    let text = String::from_utf8(bytes).expect("response body should be UTF-8");
    (status, text)
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let (status, bytes) = read_bytes(response).await;
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}

/// Decode a version 1 field table into its timestamp and definition
/// strings.
pub fn parse_v1_table(bytes: &[u8]) -> (u32, Vec<String>) {
    let ts = u32::from_be_bytes(bytes[0..4].try_into().expect("table timestamp"));
    let version = u32::from_be_bytes(bytes[4..8].try_into().expect("table version"));
    assert_eq!(version, 1, "expected a version 1 table");
    let count = u16::from_be_bytes(bytes[8..10].try_into().expect("field count")) as usize;

    let mut defs = Vec::with_capacity(count);
    let mut offset = 10;
    for _ in 0..count {
        let len = u16::from_be_bytes(bytes[offset..offset + 2].try_into().expect("entry length"))
            as usize;
        offset += 2;
        let def = std::str::from_utf8(&bytes[offset..offset + len - 1])
            .expect("definition should be UTF-8")
            .to_string();
        offset += len;
        defs.push(def);
    }
    assert_eq!(offset, bytes.len(), "trailing bytes after table entries");
    (ts, defs)
}

/// Position of a field by name within a decoded definition list.
pub fn field_position(defs: &[String], name: &str) -> u16 {
    defs.iter()
        .position(|def| {
            def.split(';')
                .any(|part| part.strip_prefix("field:").map_or(false, |n| n == name))
        })
        .unwrap_or_else(|| panic!("field {name} is not registered")) as u16
}

/// Walk `count` concatenated encoded results off the front of a response
/// tail, decoding each into its pairs.
pub fn parse_results(mut buf: &[u8], count: usize) -> Vec<Vec<(u16, String)>> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let (result, rest) = intelwire::EncodedResult::parse(buf).expect("well-formed result");
        out.push(result.decode().expect("result decodes"));
        buf = rest;
    }
    assert!(buf.is_empty(), "trailing bytes after results");
    out
}
