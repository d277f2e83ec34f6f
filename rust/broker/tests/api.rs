mod support;

use axum::http::StatusCode;
use intelwire::batch::{encode_request, BatchQuery};
use serde_json::{json, Value};
use support::{
    field_position, parse_results, parse_v1_table, read_bytes, read_json, read_text, with_app,
};

#[tokio::test(flavor = "multi_thread")]
async fn batch_v0_carries_field_timestamp_and_results() {
    with_app(|app| async move {
        let payload = encode_request(&[
            BatchQuery::new("domain", "bad.example"),
            BatchQuery::new("domain", "unknown.example"),
        ])
        .expect("request encodes");

        let response = app.post_bytes("/get", payload.to_vec()).await;
        let (status, body) = read_bytes(response).await;
        assert_eq!(status, StatusCode::OK);

        let ts = u32::from_be_bytes(body[0..4].try_into().expect("timestamp"));
        let version = u32::from_be_bytes(body[4..8].try_into().expect("version"));
        assert!(ts > 0);
        assert_eq!(version, 0);
        let results = parse_results(&body[8..], 2);

        let (table_ts, defs) = {
            let (status, table) = read_bytes(app.get("/fields?ver=1").await).await;
            assert_eq!(status, StatusCode::OK);
            parse_v1_table(&table)
        };
        assert_eq!(ts, table_ts);
        let owner = field_position(&defs, "intel.owner");
        let tags = field_position(&defs, "tags");

        assert_eq!(
            results[0],
            vec![(owner, "acme".to_string()), (tags, "feed".to_string())]
        );
        assert!(results[1].is_empty());

        // Only the query that produced pairs moved the found counter.
        let (_, stats) = read_json(app.get("/stats").await).await;
        let domain = stats["types"]
            .as_array()
            .expect("types array")
            .iter()
            .find(|t| t["type"] == "domain")
            .expect("domain stats")
            .clone();
        assert_eq!(domain["request"], 2);
        assert_eq!(domain["found"], 1);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_v2_sends_field_table_until_the_client_knows_it() {
    with_app(|app| async move {
        let payload = encode_request(&[BatchQuery::new("domain", "bad.example")])
            .expect("request encodes")
            .to_vec();

        let response = app.post_bytes("/get?ver=2", payload.clone()).await;
        let (status, body) = read_bytes(response).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(u32::from_be_bytes(body[0..4].try_into().expect("zero")), 0);
        assert_eq!(
            u32::from_be_bytes(body[4..8].try_into().expect("version")),
            2
        );
        let hash = std::str::from_utf8(&body[8..40])
            .expect("ascii hash")
            .to_string();
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

        let count = u16::from_be_bytes(body[40..42].try_into().expect("count"));
        assert!(count > 0, "first response should carry the field table");
        let mut offset = 42;
        for _ in 0..count {
            let len =
                u16::from_be_bytes(body[offset..offset + 2].try_into().expect("entry length"))
                    as usize;
            offset += 2 + len;
        }
        let results = parse_results(&body[offset..], 1);
        assert!(!results[0].is_empty());

        // Presenting the hash back elides the table.
        let response = app
            .post_bytes(&format!("/get?ver=2&hashes=deadbeef,{hash}"), payload)
            .await;
        let (_, body) = read_bytes(response).await;
        assert_eq!(&body[8..40], hash.as_bytes());
        assert_eq!(
            u16::from_be_bytes(body[40..42].try_into().expect("count")),
            0
        );
        let results = parse_results(&body[42..], 1);
        assert!(!results[0].is_empty());
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_resolves_inline_type_names() {
    with_app(|app| async move {
        // "asn" is not a builtin type, so the request carries the name
        // inline with the high bit set on the length byte.
        let payload = encode_request(&[BatchQuery::new("asn", "64500")])
            .expect("request encodes")
            .to_vec();
        assert_eq!(payload[0], 0x80 | 3);

        let (status, body) = read_bytes(app.post_bytes("/get", payload).await).await;
        assert_eq!(status, StatusCode::OK);
        let results = parse_results(&body[8..], 1);

        let (_, defs) = parse_v1_table(&read_bytes(app.get("/fields?ver=1").await).await.1);
        let owner = field_position(&defs, "asn.owner");
        assert_eq!(results[0], vec![(owner, "acme-as".to_string())]);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_batch_is_reported_in_band() {
    with_app(|app| async move {
        // Builtin tag, then a truncated value length.
        let (status, text) = read_text(app.post_bytes("/get", vec![0x00, 0x10]).await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, "Received malformed packet");
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn legacy_field_table_keeps_the_old_header() {
    with_app(|app| async move {
        let (status, v0) = read_bytes(app.get("/fields").await).await;
        assert_eq!(status, StatusCode::OK);
        assert!(u32::from_be_bytes(v0[0..4].try_into().expect("timestamp")) > 0);
        assert_eq!(u32::from_be_bytes(v0[4..8].try_into().expect("version")), 0);
        let v0_count = v0[8] as usize;

        let (_, v1) = read_bytes(app.get("/fields?ver=1").await).await;
        let (_, defs) = parse_v1_table(&v1);
        assert_eq!(v0_count, defs.len());
        assert!(defs.iter().any(|d| d == "field:tags"));
        assert!(defs.iter().any(|d| d.starts_with("field:intel.owner;")));

        // The legacy entries use the same wire shape after the one-byte
        // count.
        let len = u16::from_be_bytes(v0[9..11].try_into().expect("entry length")) as usize;
        let first = std::str::from_utf8(&v0[11..11 + len - 1]).expect("utf8");
        assert_eq!(first, defs[0]);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn single_lookups_render_json_and_legacy_strings() {
    with_app(|app| async move {
        let (status, entries) = read_json(app.get("/domain/bad.example").await).await;
        assert_eq!(status, StatusCode::OK);
        let entries = entries.as_array().expect("entries array").clone();
        assert!(entries.iter().any(|e| e["field"] == "intel.owner" && e["value"] == "acme"));
        assert!(entries.iter().any(|e| e["field"] == "tags" && e["value"] == "feed"));

        let (_, body) = read_json(app.get("/domain/unknown.example").await).await;
        assert_eq!(body, json!([]));

        let (status, text) = read_text(app.get("/nope/domain/bad.example").await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, "Unknown source nope");

        let (_, entries) = read_json(app.get("/taggerfeed/domain/bad.example").await).await;
        assert!(!entries.as_array().expect("entries array").is_empty());
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn catalog_endpoints_list_sources_types_and_views() {
    with_app(|app| async move {
        // Types appear once a lookup names them.
        let _ = app.get("/domain/bad.example").await;
        let _ = app.get("/asn/64500").await;

        let (_, sources) = read_json(app.get("/sources").await).await;
        assert_eq!(sources, json!(["asnfeed", "probe", "taggerfeed"]));

        let (_, types) = read_json(app.get("/types").await).await;
        assert_eq!(types, json!(["asn", "domain"]));

        let (_, types) = read_json(app.get("/types/taggerfeed").await).await;
        assert_eq!(types, json!(["domain"]));
        let (_, types) = read_json(app.get("/types/missing").await).await;
        assert_eq!(types, json!([]));

        let (_, views) = read_json(app.get("/views").await).await;
        assert_eq!(views["taggerfeed"], "if (session.intel)");
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dump_streams_items_or_explains_why_not() {
    with_app(|app| async move {
        let (status, text) = read_text(app.get("/dump/taggerfeed").await).await;
        assert_eq!(status, StatusCode::OK);
        let lines: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["key"], "bad.example");
        assert_eq!(lines[1]["key"], "worse.example");
        assert!(lines[0]["fields"]
            .as_array()
            .expect("fields array")
            .iter()
            .any(|e| e["value"] == "acme"));

        let (_, text) = read_text(app.get("/dump/probe").await).await;
        assert_eq!(text, "The source doesn't support dump");

        let (_, text) = read_text(app.get("/dump/missing").await).await;
        assert_eq!(text, "Unknown source missing");
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stats_filter_by_search_substring() {
    with_app(|app| async move {
        let _ = app.get("/domain/bad.example").await;

        let (_, stats) = read_json(app.get("/stats").await).await;
        assert!(stats["startTime"].as_u64().expect("startTime") > 0);
        let sources = stats["sources"].as_array().expect("sources array");
        assert_eq!(sources.len(), 3);
        assert!(sources[0].get("recentAverageMS").is_some());

        let (_, stats) = read_json(app.get("/stats?search=TAGGER").await).await;
        let sources = stats["sources"].as_array().expect("sources array");
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0]["source"], "taggerfeed");
        assert_eq!(sources[0]["items"], 2);
        assert_eq!(stats["types"].as_array().expect("types array").len(), 0);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn overloaded_http_source_drops_into_stats() {
    with_app(|app| async move {
        // The probe source has no permits, so the fetch is dropped and the
        // lookup resolves empty.
        let (_, body) = read_json(app.get("/ip/198.51.100.7").await).await;
        assert_eq!(body, json!([]));

        let (_, stats) = read_json(app.get("/stats?search=probe").await).await;
        let probe = &stats["sources"][0];
        assert_eq!(probe["request"], 1);
        assert_eq!(probe["requestDropped"], 1);
        assert_eq!(probe["directHit"], 0);
    })
    .await;
}
