// HTTP API integration tests: the full run / poll / get_result lifecycle
// against the in-memory backends, driven through the router.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use eventflow::coordination::{CoordinationStore, MemoryStore};
use eventflow::server::auth::CLAIMS_HEADER;
use eventflow::server::{build_router, ServerContext};
use eventflow::warehouse::{JsonRow, MemoryWarehouse, Warehouse};
use eventflow::ServerConfig;

struct TestServer {
    router: Router,
    context: Arc<ServerContext>,
    warehouse: Arc<MemoryWarehouse>,
}

fn test_server() -> TestServer {
    let warehouse = Arc::new(MemoryWarehouse::new());
    for table in ["calls", "sms", "mds", "topups"] {
        warehouse.create_table("events", table, Vec::new(), 1 << 20);
    }
    let coordination = Arc::new(MemoryStore::new());
    let context = ServerContext::new(
        ServerConfig::default(),
        Arc::clone(&warehouse) as Arc<dyn Warehouse>,
        Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
    );
    TestServer {
        router: build_router(Arc::clone(&context)),
        context,
        warehouse,
    }
}

/// Claims granting everything on every kind, geography included.
fn all_claims() -> String {
    let permissions = json!({"run": true, "poll": true, "get_result": true});
    let levels = json!(["admin0", "admin1", "admin2", "admin3"]);
    let mut claims = serde_json::Map::new();
    for kind in [
        "daily_location",
        "modal_location",
        "flows",
        "location_event_counts",
        "subscriber_locations",
        "meaningful_locations_aggregate",
        "meaningful_locations_between_label_od_matrix",
        "meaningful_locations_between_dates_od_matrix",
        "geography",
    ] {
        claims.insert(
            kind.to_string(),
            json!({"permissions": permissions, "spatial_aggregation": levels}),
        );
    }
    Value::Object(claims).to_string()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_run(params: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/run")
        .header("content-type", "application/json")
        .header(CLAIMS_HEADER, all_claims())
        .body(Body::from(params.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(CLAIMS_HEADER, all_claims())
        .body(Body::empty())
        .unwrap()
}

fn daily_location_body() -> Value {
    json!({
        "query_kind": "daily_location",
        "date": "2016-01-01",
        "daily_location_method": "most-common",
        "aggregation_unit": "admin3",
        "subscriber_subset": "all",
    })
}

async fn poll_until_done(router: &Router, qid: &str) -> Value {
    for _ in 0..100 {
        let (status, body) = send(router, get(&format!("/poll/{qid}"))).await;
        assert_eq!(status, StatusCode::OK);
        match body["state"].as_str() {
            Some("executed") | Some("errored") => return body,
            _ => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    panic!("query {qid} did not settle");
}

#[tokio::test]
async fn run_poll_get_result_lifecycle() {
    let server = test_server();

    let (status, body) = send(&server.router, post_run(daily_location_body())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let qid = body["query_id"].as_str().unwrap().to_string();
    assert_eq!(qid.len(), 32);

    let settled = poll_until_done(&server.router, &qid).await;
    assert_eq!(settled["state"], "executed");

    let (status, body) = send(&server.router, get(&format!("/get_result/{qid}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["query_id"], qid.as_str());
    let rows = body["query_result"].as_array().unwrap();
    assert!(!rows.is_empty());
    // Location kinds come back spatially aggregated: counts per unit, not
    // per-subscriber locations.
    for row in rows {
        assert!(row.get("pcod").is_some());
        assert!(row.get("total").is_some());
        assert!(row.get("subscriber").is_none());
    }

    // Retrieval touched the record, so its score is positive.
    let score = server
        .warehouse
        .score(&eventflow::QueryId::new(qid))
        .await
        .unwrap();
    assert!(score > 0.0);
}

#[tokio::test]
async fn run_stores_the_aggregate_with_the_location_query_as_parent() {
    let server = test_server();

    let (_, body) = send(&server.router, post_run(daily_location_body())).await;
    let qid = body["query_id"].as_str().unwrap().to_string();
    poll_until_done(&server.router, &qid).await;

    let record = server
        .warehouse
        .lookup(&eventflow::QueryId::new(qid.clone()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.class, "spatial_aggregate");

    // The stored blob reconstructs the aggregate, whose single dependency is
    // the subscriber-level daily location, cached in its own right with the
    // edge recorded.
    let descriptor = server
        .context
        .cache
        .query_by_id(&eventflow::QueryId::new(qid.clone()))
        .await
        .unwrap();
    assert_eq!(descriptor.qid().as_str(), qid);
    assert_eq!(descriptor.dependencies().len(), 1);
    let parent = &descriptor.dependencies()[0];
    assert_eq!(parent.kind(), "daily_location");
    assert!(server
        .warehouse
        .cache_table_exists(parent.qid())
        .await
        .unwrap());
    let children = server.warehouse.children_of(parent.qid()).await.unwrap();
    assert_eq!(children, vec![eventflow::QueryId::new(qid)]);
}

#[tokio::test]
async fn identical_submissions_share_one_qid_and_one_record() {
    let server = test_server();

    let (first, second) = tokio::join!(
        send(&server.router, post_run(daily_location_body())),
        send(&server.router, post_run(daily_location_body())),
    );
    assert_eq!(first.1["query_id"], second.1["query_id"]);
    let qid = first.1["query_id"].as_str().unwrap().to_string();

    poll_until_done(&server.router, &qid).await;

    // One logical execution: the record was inserted exactly once.
    let record = server
        .warehouse
        .lookup(&eventflow::QueryId::new(qid.clone()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.access_count, 1);

    // Both submitters can retrieve.
    let (status, _) = send(&server.router, get(&format!("/get_result/{qid}"))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&server.router, get(&format!("/get_result/{qid}"))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn invalid_method_returns_structured_validation_error() {
    let server = test_server();
    let mut body = daily_location_body();
    body["daily_location_method"] = json!("foobar");

    let (status, body) = send(&server.router, post_run(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let message = body["messages"]["daily_location_method"][0].as_str().unwrap();
    assert!(message.contains("one of"));
}

#[tokio::test]
async fn unknown_kind_is_rejected() {
    let server = test_server();
    let body = json!({"query_kind": "radius_of_gyration", "date": "2016-01-01"});
    let (status, body) = send(&server.router, post_run(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("radius_of_gyration"));
}

#[tokio::test]
async fn missing_claims_are_forbidden() {
    let server = test_server();
    let request = Request::builder()
        .method("POST")
        .uri("/run")
        .header("content-type", "application/json")
        .body(Body::from(daily_location_body().to_string()))
        .unwrap();
    let (status, _) = send(&server.router, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn disallowed_aggregation_level_is_forbidden() {
    let server = test_server();
    let claims = json!({
        "daily_location": {
            "permissions": {"run": true, "poll": true, "get_result": true},
            "spatial_aggregation": ["admin0"],
        }
    });
    let request = Request::builder()
        .method("POST")
        .uri("/run")
        .header("content-type", "application/json")
        .header(CLAIMS_HEADER, claims.to_string())
        .body(Body::from(daily_location_body().to_string()))
        .unwrap();
    let (status, _) = send(&server.router, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn poll_of_unsubmitted_qid_is_not_found() {
    let server = test_server();
    let (status, _) = send(
        &server.router,
        get("/poll/00000000000000000000000000000000"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn get_result_before_execution_reports_state() {
    let server = test_server();

    // Submit, then immediately ask for the result; depending on timing the
    // query is queued, executing, or already done.
    let (_, body) = send(&server.router, post_run(daily_location_body())).await;
    let qid = body["query_id"].as_str().unwrap().to_string();

    let (status, body) = send(&server.router, get(&format!("/get_result/{qid}"))).await;
    if status == StatusCode::CONFLICT {
        assert!(body["state"].is_string());
    } else {
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn failed_execution_surfaces_error_through_poll() {
    // A warehouse with no raw events tables: materialization must fail.
    let warehouse = Arc::new(MemoryWarehouse::new());
    let coordination = Arc::new(MemoryStore::new());
    let context = ServerContext::new(
        ServerConfig::default(),
        Arc::clone(&warehouse) as Arc<dyn Warehouse>,
        Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
    );
    let router = build_router(context);

    let body = json!({
        "query_kind": "subscriber_locations",
        "start": "2016-01-01",
        "stop": "2016-01-02",
    });
    let (status, body) = send(&router, post_run(body)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let qid = body["query_id"].as_str().unwrap().to_string();

    let settled = poll_until_done(&router, &qid).await;
    assert_eq!(settled["state"], "errored");
    assert!(settled["error"].as_str().unwrap().contains("does not exist"));

    let (status, _) = send(&router, get(&format!("/get_result/{qid}"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn geography_streams_a_feature_collection() {
    let server = test_server();
    let mut feature = JsonRow::new();
    feature.insert("type".to_string(), json!("Feature"));
    feature.insert(
        "properties".to_string(),
        json!({"admin3name": "Baglung", "admin3pcod": "524 3 08 44"}),
    );
    feature.insert(
        "geometry".to_string(),
        json!({"type": "MultiPolygon", "coordinates": [[[[83.0, 28.0]]]]}),
    );
    server
        .warehouse
        .create_table("geography", "admin3", vec![feature], 4096);

    let (status, body) = send(&server.router, get("/geography/admin3")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], "FeatureCollection");
    let features = body["features"].as_array().unwrap();
    assert_eq!(features.len(), 1);
    assert_eq!(features[0]["properties"]["admin3pcod"], "524 3 08 44");
    assert_eq!(features[0]["geometry"]["type"], "MultiPolygon");
}

#[tokio::test]
async fn geography_unknown_level_is_not_found() {
    let server = test_server();
    let (status, _) = send(&server.router, get("/geography/galaxy")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn flows_runs_with_nested_locations() {
    let server = test_server();
    let body = json!({
        "query_kind": "flows",
        "from_location": {
            "date": "2016-01-01",
            "daily_location_method": "last",
            "aggregation_unit": "admin3",
        },
        "to_location": {
            "date": "2016-01-02",
            "daily_location_method": "last",
            "aggregation_unit": "admin3",
        },
    });
    let (status, body) = send(&server.router, post_run(body)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let qid = body["query_id"].as_str().unwrap().to_string();

    let settled = poll_until_done(&server.router, &qid).await;
    assert_eq!(settled["state"], "executed");

    // Both nested daily locations were cached along the way.
    let context = &server.context;
    assert!(context
        .cache
        .cache_table_exists(&eventflow::QueryId::new(qid))
        .await
        .unwrap());
}
