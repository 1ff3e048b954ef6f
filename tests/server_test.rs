//! The loopback line-JSON protocol: ping, search, quickSearch, stats,
//! error replies, and shutdown.

mod helpers;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use helpers::test_engine;
use mnemo::memory::save::SaveRequest;
use mnemo::memory::types::MemoryType;
use mnemo::server::serve_on;

struct Client {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Client {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    async fn roundtrip(&mut self, request: Value) -> Value {
        let mut line = request.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
        let mut reply = String::new();
        self.reader.read_line(&mut reply).await.unwrap();
        serde_json::from_str(reply.trim()).unwrap()
    }
}

/// Spin up a server on an ephemeral port with seeded content.
async fn start_server() -> (u16, tokio::task::JoinHandle<()>) {
    let (engine, _conn) = test_engine();

    engine
        .memory_save(SaveRequest {
            content: "retry with exponential backoff".into(),
            memory_type: MemoryType::Pattern,
            domain: "backend".into(),
            confidence: 0.7,
            skip_structurize: true,
            ..Default::default()
        })
        .await
        .unwrap();
    engine
        .memory_save(SaveRequest {
            content: "css grid beats floats".into(),
            memory_type: MemoryType::Preference,
            domain: "frontend".into(),
            confidence: 0.6,
            skip_structurize: true,
            ..Default::default()
        })
        .await
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        serve_on(engine, listener).await.unwrap();
    });
    (port, handle)
}

#[tokio::test]
async fn ping_reports_ready() {
    let (port, handle) = start_server().await;
    let mut client = Client::connect(port).await;

    let reply = client.roundtrip(serde_json::json!({ "action": "ping" })).await;
    assert_eq!(reply["success"], true);
    assert_eq!(reply["ready"], true);

    handle.abort();
}

#[tokio::test]
async fn search_returns_wire_shaped_results() {
    let (port, handle) = start_server().await;
    let mut client = Client::connect(port).await;

    let reply = client
        .roundtrip(serde_json::json!({
            "action": "search",
            "query": "exponential backoff",
            "limit": 5
        }))
        .await;
    assert_eq!(reply["success"], true);
    let results = reply["results"].as_array().unwrap();
    assert!(!results.is_empty());

    let first = &results[0];
    for key in [
        "id",
        "content",
        "rawContent",
        "summary",
        "type",
        "domain",
        "confidence",
        "tags",
        "createdAt",
        "date",
        "bm25Score",
        "vectorSimilarity",
        "vectorDistance",
        "combinedScore",
    ] {
        assert!(first.get(key).is_some(), "missing key {key}");
    }
    assert_eq!(first["type"], "pattern");
    assert_eq!(first["rawContent"], "retry with exponential backoff");

    handle.abort();
}

#[tokio::test]
async fn quick_search_filters_by_domain() {
    let (port, handle) = start_server().await;
    let mut client = Client::connect(port).await;

    let reply = client
        .roundtrip(serde_json::json!({
            "action": "quickSearch",
            "query": "retry backoff grid floats",
            "limit": 10,
            "options": { "domain": "frontend" }
        }))
        .await;
    assert_eq!(reply["success"], true);
    let results = reply["results"].as_array().unwrap();
    assert!(!results.is_empty());
    for result in results {
        assert_eq!(result["domain"], "frontend");
    }

    handle.abort();
}

#[tokio::test]
async fn stats_action_counts_the_store() {
    let (port, handle) = start_server().await;
    let mut client = Client::connect(port).await;

    let reply = client.roundtrip(serde_json::json!({ "action": "stats" })).await;
    assert_eq!(reply["success"], true);
    assert_eq!(reply["stats"]["totalMemories"], 2);
    assert_eq!(reply["stats"]["byType"]["pattern"], 1);
    assert_eq!(reply["stats"]["byType"]["preference"], 1);

    handle.abort();
}

#[tokio::test]
async fn unknown_action_and_bad_filter_reply_with_errors() {
    let (port, handle) = start_server().await;
    let mut client = Client::connect(port).await;

    let reply = client
        .roundtrip(serde_json::json!({ "action": "defragment" }))
        .await;
    assert_eq!(reply["success"], false);
    assert!(reply["error"].as_str().unwrap().contains("unknown action"));

    // Connection survives an error; the next request still works
    let reply = client
        .roundtrip(serde_json::json!({
            "action": "search",
            "query": "backoff",
            "options": { "type": "nonsense" }
        }))
        .await;
    assert_eq!(reply["success"], false);
    assert!(reply["error"].as_str().unwrap().contains("memory type"));

    handle.abort();
}

#[tokio::test]
async fn malformed_line_is_an_error_not_a_crash() {
    let (port, handle) = start_server().await;
    let mut client = Client::connect(port).await;

    client.writer.write_all(b"this is not json\n").await.unwrap();
    let mut reply = String::new();
    client.reader.read_line(&mut reply).await.unwrap();
    let reply: Value = serde_json::from_str(reply.trim()).unwrap();
    assert_eq!(reply["success"], false);

    handle.abort();
}

#[tokio::test]
async fn shutdown_action_stops_the_server() {
    let (port, handle) = start_server().await;
    let mut client = Client::connect(port).await;

    let reply = client
        .roundtrip(serde_json::json!({ "action": "shutdown" }))
        .await;
    assert_eq!(reply["success"], true);

    // The accept loop exits on its own
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("server should stop after shutdown")
        .unwrap();
}
