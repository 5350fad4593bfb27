//! End-to-end tests of the agent router against a real SQLite engine

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use lake_core::{QueryService, ServiceConfig, SqliteEngine};
use lake_http::{create_router, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const TOKEN: &str = "test-token";
const ENDLESS_QUERY: &str =
    "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT count(*) FROM c";

struct Agent {
    _dir: TempDir,
    router: Router,
}

fn agent_with(config: ServiceConfig, lifecycle: bool) -> Agent {
    let dir = tempfile::tempdir().unwrap();
    let engine =
        SqliteEngine::open(dir.path().join("lake.db"), dir.path().join("scratch"), 0).unwrap();
    let service = Arc::new(QueryService::new(Arc::new(engine), config).unwrap());
    let state = AppState::new(service, TOKEN).with_lifecycle(lifecycle);
    Agent {
        _dir: dir,
        router: create_router(state),
    }
}

fn agent() -> Agent {
    agent_with(ServiceConfig::default(), true)
}

fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-agent-token", TOKEN)
        .header("content-type", "application/json");
    match body {
        Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(agent: &Agent, request: Request<Body>) -> (StatusCode, Value) {
    let response = agent.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| json!(String::from_utf8_lossy(&bytes)))
    };
    (status, body)
}

async fn submit(agent: &Agent, sql: &str, request_id: &str) -> String {
    let (status, body) = send(
        agent,
        request(
            Method::POST,
            "/queries",
            Some(json!({"sql": sql, "request_id": request_id})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{}", body);
    body["query_id"].as_str().unwrap().to_string()
}

async fn wait_for(agent: &Agent, query_id: &str, wanted: &str) -> Value {
    for _ in 0..1000 {
        let (status, body) =
            send(agent, request(Method::GET, &format!("/queries/{}", query_id), None)).await;
        assert_eq!(status, StatusCode::OK);
        if body["status"] == wanted {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("query {} never reached {}", query_id, wanted);
}

#[tokio::test]
async fn test_submit_poll_and_fetch() {
    let agent = agent();
    let query_id = submit(&agent, "SELECT 1 AS x", "r1").await;

    let status = wait_for(&agent, &query_id, "Succeeded").await;
    assert_eq!(status["row_count"], 1);
    assert_eq!(status["columns"], json!(["x"]));
    assert_eq!(status["request_id"], "r1");
    assert!(status["completed_at"].is_string());

    let (code, body) = send(
        &agent,
        request(
            Method::GET,
            &format!("/queries/{}/results?max_results=10", query_id),
            None,
        ),
    )
    .await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["query_id"], query_id.as_str());
    assert_eq!(body["request_id"], "r1");
    assert_eq!(body["columns"], json!(["x"]));
    assert_eq!(body["rows"], json!([[1]]));
    assert_eq!(body["row_count"], 1);
    assert_eq!(body["next_page_token"], "");
}

#[tokio::test]
async fn test_paged_results() {
    let agent = agent();
    let sql = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 5) \
               SELECT x FROM c";
    let query_id = submit(&agent, sql, "").await;
    wait_for(&agent, &query_id, "Succeeded").await;

    let mut uri = format!("/queries/{}/results?max_results=2", query_id);
    let mut seen = Vec::new();
    loop {
        let (code, body) = send(&agent, request(Method::GET, &uri, None)).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["row_count"], 5);
        for row in body["rows"].as_array().unwrap() {
            seen.push(row[0].as_i64().unwrap());
        }
        let token = body["next_page_token"].as_str().unwrap();
        if token.is_empty() {
            break;
        }
        uri = format!("/queries/{}/results?max_results=2&page_token={}", query_id, token);
    }
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);

    let (code, body) = send(
        &agent,
        request(
            Method::GET,
            &format!("/queries/{}/results?page_token=%21%21", query_id),
            None,
        ),
    )
    .await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let (code, _) = send(
        &agent,
        request(
            Method::GET,
            &format!("/queries/{}/results?max_results=lots", query_id),
            None,
        ),
    )
    .await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_failed_query_results_not_available() {
    let agent = agent();
    let query_id = submit(&agent, "SELECT * FROM missing_table", "").await;

    let status = wait_for(&agent, &query_id, "Failed").await;
    assert!(status["error"].as_str().unwrap().contains("missing_table"));

    let (code, body) = send(
        &agent,
        request(Method::GET, &format!("/queries/{}/results", query_id), None),
    )
    .await;
    assert_eq!(code, StatusCode::CONFLICT);
    assert_eq!(body["code"], "QUERY_NOT_AVAILABLE");
}

#[tokio::test]
async fn test_submit_statements_that_return_rows() {
    let agent = agent();
    let (code, _) = send(
        &agent,
        request(
            Method::POST,
            "/execute",
            Some(json!({"sql": "CREATE TABLE t (a INTEGER)"})),
        ),
    )
    .await;
    assert_eq!(code, StatusCode::OK);

    let fetch = |query_id: String| request(Method::GET, &format!("/queries/{}/results", query_id), None);

    let query_id = submit(&agent, "INSERT INTO t VALUES (7) RETURNING a", "").await;
    let status = wait_for(&agent, &query_id, "Succeeded").await;
    assert_eq!(status["columns"], json!(["a"]));
    let (code, body) = send(&agent, fetch(query_id)).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["rows"], json!([[7]]));

    let query_id = submit(&agent, "PRAGMA table_info('t')", "").await;
    wait_for(&agent, &query_id, "Succeeded").await;
    let (code, body) = send(&agent, fetch(query_id)).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["rows"], json!([[0, "a", "INTEGER", 0, null, 0]]));

    let query_id = submit(&agent, "EXPLAIN QUERY PLAN SELECT a FROM t", "").await;
    let status = wait_for(&agent, &query_id, "Succeeded").await;
    assert!(status["row_count"].as_u64().unwrap() >= 1);

    let (_, body) = send(
        &agent,
        request(
            Method::POST,
            "/execute",
            Some(json!({"sql": "SELECT count(*) AS n FROM t"})),
        ),
    )
    .await;
    assert_eq!(body["rows"], json!([[1]]));
}

#[tokio::test]
async fn test_cancel_running_query() {
    let agent = agent();
    let query_id = submit(&agent, ENDLESS_QUERY, "").await;
    wait_for(&agent, &query_id, "Running").await;

    let (code, body) = send(
        &agent,
        request(Method::POST, &format!("/queries/{}/cancel", query_id), None),
    )
    .await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["status"], "Canceled");

    let status = wait_for(&agent, &query_id, "Canceled").await;
    assert_eq!(status["error"], "query canceled");

    let (code, body) = send(
        &agent,
        request(Method::GET, &format!("/queries/{}/results", query_id), None),
    )
    .await;
    assert_eq!(code, StatusCode::CONFLICT);
    assert_eq!(body["code"], "QUERY_NOT_AVAILABLE");
}

#[tokio::test]
async fn test_unknown_query_ids() {
    let agent = agent();
    for (method, uri) in [
        (Method::GET, "/queries/nope"),
        (Method::GET, "/queries/nope/results"),
        (Method::POST, "/queries/nope/cancel"),
        (Method::DELETE, "/queries/nope"),
    ] {
        let (code, body) = send(&agent, request(method, uri, None)).await;
        assert_eq!(code, StatusCode::NOT_FOUND, "{}", uri);
        assert_eq!(body["code"], "NOT_FOUND");
    }
}

#[tokio::test]
async fn test_delete_forgets_query() {
    let agent = agent();
    let query_id = submit(&agent, "SELECT 1 AS x", "r-del").await;
    wait_for(&agent, &query_id, "Succeeded").await;

    let (code, body) = send(
        &agent,
        request(Method::DELETE, &format!("/queries/{}", query_id), None),
    )
    .await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["query_id"], query_id.as_str());
    assert_eq!(body["status"], "Canceled");
    assert_eq!(body["request_id"], "r-del");

    let (code, _) = send(
        &agent,
        request(Method::GET, &format!("/queries/{}", query_id), None),
    )
    .await;
    assert_eq!(code, StatusCode::NOT_FOUND);

    // The request id is free again
    let fresh = submit(&agent, "SELECT 1 AS x", "r-del").await;
    assert_ne!(fresh, query_id);
}

#[tokio::test]
async fn test_resubmission_returns_same_job() {
    let agent = agent();
    let first = submit(&agent, "SELECT 1 AS x", "same").await;
    let second = submit(&agent, "SELECT 2 AS y", "same").await;
    assert_eq!(first, second);

    let status = wait_for(&agent, &first, "Succeeded").await;
    assert_eq!(status["columns"], json!(["x"]));
}

#[tokio::test]
async fn test_header_request_id_is_idempotency_key() {
    let agent = agent();
    let submit_with_header = || {
        Request::builder()
            .method(Method::POST)
            .uri("/queries")
            .header("x-agent-token", TOKEN)
            .header("x-request-id", "hdr-1")
            .body(Body::from(json!({"sql": "SELECT 1"}).to_string()))
            .unwrap()
    };

    let (code, first) = send(&agent, submit_with_header()).await;
    assert_eq!(code, StatusCode::ACCEPTED);
    assert_eq!(first["request_id"], "hdr-1");
    let (_, second) = send(&agent, submit_with_header()).await;
    assert_eq!(first["query_id"], second["query_id"]);
}

#[tokio::test]
async fn test_authentication() {
    let agent = agent();

    let missing = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let (code, body) = send(&agent, missing).await;
    assert_eq!(code, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "AUTH_ERROR");
    assert_eq!(body["error"], "unauthorized");
    assert!(!body["request_id"].as_str().unwrap().is_empty());

    let wrong = Request::builder()
        .method(Method::POST)
        .uri("/queries")
        .header("x-agent-token", "wrong")
        .body(Body::from(json!({"sql": "SELECT 1"}).to_string()))
        .unwrap();
    let (code, _) = send(&agent, wrong).await;
    assert_eq!(code, StatusCode::UNAUTHORIZED);

    let bearer = Request::builder()
        .uri("/health")
        .header("authorization", format!("Bearer {}", TOKEN))
        .body(Body::empty())
        .unwrap();
    let (code, _) = send(&agent, bearer).await;
    assert_eq!(code, StatusCode::OK);
}

#[tokio::test]
async fn test_request_validation() {
    let agent = agent();

    let garbage = Request::builder()
        .method(Method::POST)
        .uri("/queries")
        .header("x-agent-token", TOKEN)
        .body(Body::from("{not json"))
        .unwrap();
    let (code, body) = send(&agent, garbage).await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "PARSE_ERROR");
    assert_eq!(body["error"], "invalid request body");

    let (code, body) = send(
        &agent,
        request(Method::POST, "/queries", Some(json!({"sql": "   "}))),
    )
    .await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert_eq!(body["error"], "sql is required");

    let (code, body) = send(
        &agent,
        request(Method::POST, "/execute", Some(json!({"request_id": "x"}))),
    )
    .await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert_eq!(body["request_id"], "x");
}

#[tokio::test]
async fn test_execute() {
    let agent = agent();
    let (code, body) = send(
        &agent,
        request(
            Method::POST,
            "/execute",
            Some(json!({"sql": "SELECT 1 AS a, 'two' AS b", "request_id": "exec-1"})),
        ),
    )
    .await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["columns"], json!(["a", "b"]));
    assert_eq!(body["rows"], json!([[1, "two"]]));
    assert_eq!(body["row_count"], 1);
    assert_eq!(body["request_id"], "exec-1");

    let (code, body) = send(
        &agent,
        request(
            Method::POST,
            "/execute",
            Some(json!({"sql": "SELECT * FROM missing_table"})),
        ),
    )
    .await;
    assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "EXECUTION_ERROR");
}

#[tokio::test]
async fn test_execute_row_limit() {
    let config = ServiceConfig {
        max_result_rows: 3,
        ..Default::default()
    };
    let agent = agent_with(config, true);
    let sql = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 10) \
               SELECT x FROM c";

    let (code, body) = send(
        &agent,
        request(Method::POST, "/execute", Some(json!({"sql": sql}))),
    )
    .await;
    assert_eq!(code, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["code"], "RESULT_LIMIT_EXCEEDED");
    assert_eq!(body["error"], "result row limit exceeded");
}

#[tokio::test]
async fn test_execute_rejected_when_saturated() {
    let config = ServiceConfig {
        max_concurrent_queries: 1,
        ..Default::default()
    };
    let agent = agent_with(config, true);
    let query_id = submit(&agent, ENDLESS_QUERY, "").await;
    wait_for(&agent, &query_id, "Running").await;

    let (code, body) = send(
        &agent,
        request(Method::POST, "/execute", Some(json!({"sql": "SELECT 1"}))),
    )
    .await;
    assert_eq!(code, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "TOO_MANY_REQUESTS");

    let (_, health) = send(&agent, request(Method::GET, "/health", None)).await;
    assert_eq!(health["active_queries"], 1);
    assert_eq!(health["running"], 1);

    send(
        &agent,
        request(Method::POST, &format!("/queries/{}/cancel", query_id), None),
    )
    .await;
}

#[tokio::test]
async fn test_lifecycle_routes_can_be_disabled() {
    let agent = agent_with(ServiceConfig::default(), false);

    let (code, _) = send(
        &agent,
        request(Method::POST, "/queries", Some(json!({"sql": "SELECT 1"}))),
    )
    .await;
    assert_eq!(code, StatusCode::NOT_FOUND);

    let (code, _) = send(
        &agent,
        request(Method::POST, "/execute", Some(json!({"sql": "SELECT 1"}))),
    )
    .await;
    assert_eq!(code, StatusCode::OK);
}

#[tokio::test]
async fn test_request_id_echoed() {
    let agent = agent();
    let response = agent
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-agent-token", TOKEN)
                .header("x-request-id", "trace-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers()["x-request-id"], "trace-42");

    let response = agent
        .router
        .clone()
        .oneshot(request(Method::GET, "/health", None))
        .await
        .unwrap();
    assert!(!response.headers()["x-request-id"].is_empty());
}

#[tokio::test]
async fn test_health_and_metrics() {
    let agent = agent();
    let (code, health) = send(&agent, request(Method::GET, "/health", None)).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(health["status"], "ok");
    assert!(health["engine_version"].as_str().unwrap().starts_with("SQLite"));
    assert!(health["uptime_seconds"].is_u64());
    assert!(health["memory_used_mb"].is_i64());
    assert_eq!(health["max_memory_gb"], 0);
    assert_eq!(health["stored"], 0);

    let query_id = submit(&agent, "SELECT 1", "").await;
    wait_for(&agent, &query_id, "Succeeded").await;

    let (code, text) = send(&agent, request(Method::GET, "/metrics", None)).await;
    assert_eq!(code, StatusCode::OK);
    let text = text.as_str().unwrap();
    assert!(text.contains("lake_queries_submitted_total 1"));
    assert!(text.contains("lake_queries_succeeded_total 1"));
}
