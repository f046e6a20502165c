//! End-to-end tests against a real `SQLite` database file
//!
//! Tool calls go through the full stack: dispatcher, pool, executor, schema cache and the
//! `SQLite` driver. The last test drives the MCP server over an in-memory pipe.

#![cfg(feature = "sqlite")]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use sqlgate::backend::sqlite::SqliteBackend;
use sqlgate::config::GatewayConfig;
use sqlgate::dispatch::{Dispatcher, ToolCall};
use sqlgate::mcp;
use sqlgate::output::ResultEnvelope;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

// ============================================================================
// Test Helpers
// ============================================================================

struct TestDb {
    path: PathBuf,
}

impl TestDb {
    fn new(label: &str) -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir()
            .join(format!("sqlgate_{label}_{}_{id}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        Self { path }
    }

    fn dispatcher(&self) -> Dispatcher<SqliteBackend> {
        let config = GatewayConfig {
            pool_size: 2,
            ..GatewayConfig::sqlite(&self.path)
        };
        Dispatcher::new(Arc::new(SqliteBackend::new()), &config)
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn call(
    dispatcher: &Dispatcher<SqliteBackend>,
    name: &str,
    arguments: Value,
) -> ResultEnvelope {
    dispatcher.dispatch(ToolCall::from_value(name, arguments).unwrap()).await
}

async fn ok(dispatcher: &Dispatcher<SqliteBackend>, name: &str, arguments: Value) -> Value {
    let envelope = call(dispatcher, name, arguments).await;
    assert!(envelope.ok, "{name} failed: {envelope:?}");
    envelope.result.unwrap()
}

async fn create_items(dispatcher: &Dispatcher<SqliteBackend>) {
    ok(
        dispatcher,
        "create_table",
        json!({
            "table_name": "items",
            "columns": [
                {"name": "id", "type": "INTEGER", "primary_key": true},
                {"name": "name", "type": "TEXT", "nullable": false},
                {"name": "score", "type": "REAL"},
                {"name": "payload", "type": "BLOB"},
                {"name": "active", "type": "BOOLEAN"}
            ]
        }),
    )
    .await;
}

// ============================================================================
// Tool Round Trips
// ============================================================================

#[tokio::test]
async fn test_created_rows_read_back_unchanged() {
    let db = TestDb::new("roundtrip");
    let gateway = db.dispatcher();
    create_items(&gateway).await;

    let inserted = ok(
        &gateway,
        "insert_data",
        json!({
            "table_name": "items",
            "rows": [
                {
                    "id": 1,
                    "name": "alpha",
                    "score": 1.5,
                    "payload": {"$base64": "AQID"},
                    "active": true
                },
                {"id": "2", "name": "beta", "score": null, "payload": null, "active": false}
            ]
        }),
    )
    .await;
    assert_eq!(inserted, json!({"row_count": 2}));

    let selected = ok(
        &gateway,
        "execute_query",
        json!({"sql": "SELECT id, name, score, payload, active FROM items ORDER BY id"}),
    )
    .await;
    assert_eq!(
        selected,
        json!({
            "row_count": 2,
            "columns": ["id", "name", "score", "payload", "active"],
            "truncated": false,
            "rows": [
                {"id": 1, "name": "alpha", "score": 1.5, "payload": "AQID", "active": true},
                {"id": 2, "name": "beta", "score": null, "payload": null, "active": false}
            ]
        })
    );
}

#[tokio::test]
async fn test_describe_and_list_after_create() {
    let db = TestDb::new("describe");
    let gateway = db.dispatcher();

    assert_eq!(ok(&gateway, "list_tables", json!({})).await, json!({"tables": []}));
    create_items(&gateway).await;
    assert_eq!(ok(&gateway, "list_tables", json!({})).await, json!({"tables": ["items"]}));

    let described = ok(&gateway, "describe_table", json!({"table_name": "items"})).await;
    assert_eq!(
        described,
        json!({
            "table": "items",
            "columns": [
                {"name": "id", "type": "INTEGER", "nullable": false},
                {"name": "name", "type": "TEXT", "nullable": false},
                {"name": "score", "type": "REAL", "nullable": true},
                {"name": "payload", "type": "BLOB", "nullable": true},
                {"name": "active", "type": "BOOLEAN", "nullable": true}
            ]
        })
    );

    let missing = call(&gateway, "describe_table", json!({"table_name": "nothing"})).await;
    assert_eq!(missing.kind(), Some("TableNotFound"));
}

#[tokio::test]
async fn test_parameters_bind_and_never_splice() {
    let db = TestDb::new("params");
    let gateway = db.dispatcher();
    create_items(&gateway).await;
    let row = json!({"table_name": "items", "rows": [{"id": 1, "name": "alpha"}]});
    ok(&gateway, "insert_data", row).await;

    let hostile = "alpha' OR '1'='1";
    let result = ok(
        &gateway,
        "execute_query",
        json!({"sql": "SELECT id FROM items WHERE name = ?", "parameters": [hostile]}),
    )
    .await;
    assert_eq!(result["row_count"], 0);

    let result = ok(
        &gateway,
        "execute_query",
        json!({"sql": "SELECT id FROM items WHERE name = ?", "parameters": ["alpha"]}),
    )
    .await;
    assert_eq!(result["rows"], json!([{"id": 1}]));
}

#[tokio::test]
async fn test_update_reports_affected_rows() {
    let db = TestDb::new("update");
    let gateway = db.dispatcher();
    create_items(&gateway).await;
    ok(
        &gateway,
        "insert_data",
        json!({
            "table_name": "items",
            "rows": [{"id": 1, "name": "a"}, {"id": 2, "name": "b"}, {"id": 3, "name": "c"}]
        }),
    )
    .await;

    let updated = ok(
        &gateway,
        "execute_query",
        json!({"sql": "UPDATE items SET score = ? WHERE id >= ?", "parameters": [0.25, 2]}),
    )
    .await;
    assert_eq!(updated, json!({"affected": 2, "row_count": 2}));
}

#[tokio::test]
async fn test_max_rows_truncates_results() {
    let db = TestDb::new("max_rows");
    let gateway = db.dispatcher();
    create_items(&gateway).await;
    let rows: Vec<Value> = (1..=5).map(|i| json!({"id": i, "name": format!("n{i}")})).collect();
    ok(&gateway, "insert_data", json!({"table_name": "items", "rows": rows})).await;

    let result = ok(
        &gateway,
        "execute_query",
        json!({"sql": "SELECT id FROM items ORDER BY id", "max_rows": 2}),
    )
    .await;
    assert_eq!(result["rows"], json!([{"id": 1}, {"id": 2}]));
    assert_eq!(result["truncated"], true);
}

// ============================================================================
// Error Mapping
// ============================================================================

#[tokio::test]
async fn test_duplicate_primary_key_is_constraint_violation() {
    let db = TestDb::new("constraint");
    let gateway = db.dispatcher();
    create_items(&gateway).await;
    let first = json!({"table_name": "items", "rows": [{"id": 1, "name": "a"}]});
    ok(&gateway, "insert_data", first).await;

    let again = json!({"table_name": "items", "rows": [{"id": 1, "name": "b"}]});
    let duplicate = call(&gateway, "insert_data", again).await;
    assert_eq!(duplicate.kind(), Some("ConstraintViolation"));
    assert!(duplicate.error.unwrap().code.is_some());

    let not_null = call(
        &gateway,
        "execute_query",
        json!({"sql": "INSERT INTO items (id, name) VALUES (?, ?)", "parameters": [9, null]}),
    )
    .await;
    assert_eq!(not_null.kind(), Some("ConstraintViolation"));
}

#[tokio::test]
async fn test_malformed_sql_is_syntax_error() {
    let db = TestDb::new("syntax");
    let gateway = db.dispatcher();

    let envelope = call(&gateway, "execute_query", json!({"sql": "SELEC 1"})).await;
    assert_eq!(envelope.kind(), Some("SyntaxError"));

    // the session survives a failed statement
    let result = ok(&gateway, "execute_query", json!({"sql": "SELECT 1 AS one"})).await;
    assert_eq!(result["rows"], json!([{"one": 1}]));
}

#[tokio::test]
async fn test_create_existing_table() {
    let db = TestDb::new("exists");
    let gateway = db.dispatcher();
    create_items(&gateway).await;

    let again = call(
        &gateway,
        "create_table",
        json!({"table_name": "items", "columns": [{"name": "id", "type": "INTEGER"}]}),
    )
    .await;
    assert!(!again.ok);

    let guarded = ok(
        &gateway,
        "create_table",
        json!({
            "table_name": "items",
            "columns": [{"name": "id", "type": "INTEGER"}],
            "if_not_exists": true
        }),
    )
    .await;
    assert_eq!(guarded["status"], "exists");

    let fresh = ok(
        &gateway,
        "create_table",
        json!({
            "table_name": "tags",
            "columns": [{"name": "id", "type": "INTEGER"}],
            "if_not_exists": true
        }),
    )
    .await;
    assert_eq!(fresh["status"], "created");
}

#[tokio::test]
async fn test_insert_coercion_failure_names_value() {
    let db = TestDb::new("coercion");
    let gateway = db.dispatcher();
    create_items(&gateway).await;

    let envelope = call(
        &gateway,
        "insert_data",
        json!({
            "table_name": "items",
            "rows": [{"id": 1, "name": "a"}, {"id": "two", "name": "b"}]
        }),
    )
    .await;
    assert_eq!(envelope.kind(), Some("UnsupportedType"));
    assert!(envelope.error.unwrap().message.contains("rows[1].id"));

    let count_sql = json!({"sql": "SELECT COUNT(*) AS n FROM items"});
    let count = ok(&gateway, "execute_query", count_sql).await;
    assert_eq!(count["rows"], json!([{"n": 0}]));
}

// ============================================================================
// MCP Transport
// ============================================================================

#[tokio::test]
async fn test_mcp_session_over_pipe() {
    let db = TestDb::new("mcp");
    let gateway = Arc::new(db.dispatcher());
    create_items(&gateway).await;

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let server = tokio::spawn(mcp::serve_io(gateway, BufReader::new(server_read), server_write));

    let (client_read, mut client_write) = tokio::io::split(client);
    let requests = [
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}).to_string(),
        json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string(),
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}).to_string(),
        json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call",
               "params": {"name": "list_tables", "arguments": {}}})
        .to_string(),
        json!({"jsonrpc": "2.0", "id": 4, "method": "tools/call",
               "params": {"name": "describe_table", "arguments": {"table_name": "nope"}}})
        .to_string(),
        json!({"jsonrpc": "2.0", "id": 5, "method": "resources/list"}).to_string(),
        "{not json".to_string(),
    ];
    for request in requests {
        client_write.write_all(request.as_bytes()).await.unwrap();
        client_write.write_all(b"\n").await.unwrap();
    }
    client_write.shutdown().await.unwrap();

    let mut responses = HashMap::new();
    let mut lines = BufReader::new(client_read).lines();
    while let Some(line) = lines.next_line().await.unwrap() {
        let response: Value = serde_json::from_str(&line).unwrap();
        responses.insert(response["id"].to_string(), response);
    }
    server.await.unwrap().unwrap();

    assert_eq!(responses.len(), 6, "one response per request, none for the notification");
    assert_eq!(responses["1"]["result"]["serverInfo"]["name"], "sqlgate");
    assert_eq!(responses["2"]["result"]["tools"].as_array().unwrap().len(), 5);

    let listed = &responses["3"]["result"];
    assert_eq!(listed["isError"], false);
    let text = listed["content"][0]["text"].as_str().unwrap();
    let envelope: Value = serde_json::from_str(text).unwrap();
    assert_eq!(envelope, json!({"ok": true, "result": {"tables": ["items"]}}));

    let failed = &responses["4"]["result"];
    assert_eq!(failed["isError"], true);
    let text = failed["content"][0]["text"].as_str().unwrap();
    let envelope: Value = serde_json::from_str(text).unwrap();
    assert_eq!(envelope["error"]["kind"], "TableNotFound");

    assert_eq!(responses["5"]["error"]["code"], -32601);
    assert_eq!(responses["null"]["error"]["code"], -32700);
}
