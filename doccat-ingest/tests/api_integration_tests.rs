//! Integration tests for doccat-ingest API endpoints
//!
//! Drives the router with `oneshot` requests against an in-memory database.

mod helpers;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;
use uuid::Uuid;

use doccat_ingest::db;

use helpers::{test_parameters, topic_documents, TestEnv};

fn app(env: &TestEnv) -> Router {
    doccat_ingest::build_router(env.app_state())
}

async fn send(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn clustering() -> Value {
    json!({ "similarity_threshold": 0.9, "min_cluster_size": 2 })
}

#[tokio::test]
async fn test_health_endpoint() {
    let env = TestEnv::new().await;
    let (status, body) = send(app(&env), Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "doccat-ingest");
    assert_eq!(body["running_sessions"], 0);
}

#[tokio::test]
async fn test_health_reports_last_pipeline_failure() {
    let env = TestEnv::new().await;
    env.scoring.fail_triage_for("topic:");
    let session_id = env.create_session(test_parameters()).await;
    env.add_documents(session_id, &topic_documents(&["invoice"], 2)).await;

    let state = env.app_state();
    let (_, body) = send(doccat_ingest::build_router(state.clone()), Method::GET, "/health", None).await;
    assert!(body.get("last_error").is_none());

    state.orchestrator.claim_start(session_id).await.unwrap();
    state.orchestrator.drive(session_id).await.unwrap();

    let (status, body) = send(doccat_ingest::build_router(state), Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let last_error = body["last_error"].as_str().unwrap();
    assert!(last_error.contains(&session_id.to_string()));
}

#[tokio::test]
async fn test_create_session_validates_input() {
    let env = TestEnv::new().await;

    let (status, body) = send(
        app(&env),
        Method::POST,
        "/sessions",
        Some(json!({ "firm_id": "acme", "source_file_name": "mailbox.pst" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");

    let (status, body) = send(
        app(&env),
        Method::POST,
        "/sessions",
        Some(json!({
            "firm_id": "acme",
            "source_file_name": "mailbox.pst",
            "source_file_size": 1024,
            "parameters": { "clustering": clustering(), "batch_size": 50 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["state"], "NOT_STARTED");
    assert_eq!(body["parameters"]["batch_size"], 50);
    // Unspecified parameters fall back to the defaults
    assert_eq!(body["parameters"]["max_batches_per_reviewer"], 1);

    let session_id = body["session_id"].as_str().unwrap().to_string();
    let (status, body) = send(app(&env), Method::GET, &format!("/sessions/{}", session_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session_id"], session_id.as_str());
    assert_eq!(body["current_stage"], Value::Null);
    assert_eq!(body["progress"]["total"], 0);

    let (status, body) = send(app(&env), Method::GET, "/sessions?firm_id=acme", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_firm_override_supplies_clustering_policy() {
    let env = TestEnv::new().await;

    let (status, body) = send(
        app(&env),
        Method::PUT,
        "/firms/acme/parameters",
        Some(json!({ "batch_size": "large" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);

    let (status, _) = send(
        app(&env),
        Method::PUT,
        "/firms/acme/parameters",
        Some(json!({ "clustering": clustering(), "batch_size": 40 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(app(&env), Method::GET, "/firms/acme/parameters", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["batch_size"], 40);

    let (status, body) = send(
        app(&env),
        Method::POST,
        "/sessions",
        Some(json!({
            "firm_id": "acme",
            "source_file_name": "mailbox.pst",
            "parameters": { "batch_size": 20 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert_eq!(body["parameters"]["batch_size"], 20);
    assert_eq!(body["parameters"]["clustering"]["min_cluster_size"], 2);
}

#[tokio::test]
async fn test_unknown_resources_are_404() {
    let env = TestEnv::new().await;

    let (status, body) = send(
        app(&env),
        Method::POST,
        &format!("/documents/{}/decision", Uuid::new_v4()),
        Some(json!({ "actor": "alice", "action": "ACCEPT" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (status, _) = send(app(&env), Method::GET, &format!("/sessions/{}", Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_lifecycle_commands_report_conflicts() {
    let env = TestEnv::new().await;
    let session_id = env.create_session(test_parameters()).await;
    let ids = env.add_documents(session_id, &topic_documents(&["invoice"], 2)).await;

    // Decisions wait for review
    let (status, body) = send(
        app(&env),
        Method::POST,
        &format!("/documents/{}/decision", ids[0]),
        Some(json!({ "actor": "alice", "action": "ACCEPT" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "SESSION_NOT_REVIEWABLE");

    let (status, body) = send(app(&env), Method::POST, &format!("/sessions/{}/extract", session_id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "INVALID_TRANSITION");

    let (status, body) = send(
        app(&env),
        Method::POST,
        &format!("/sessions/{}/fail", session_id),
        Some(json!({ "reason": "wrong mailbox" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "FAILED");

    let session = db::sessions::get_session(&env.pool, session_id).await.unwrap();
    assert_eq!(session.last_error.as_deref(), Some("wrong mailbox"));
}

#[tokio::test]
async fn test_review_round_trip_over_http() {
    let env = TestEnv::new().await;
    let session_id = env
        .reviewable_session(test_parameters(), &topic_documents(&["invoice", "contract"], 3))
        .await;

    let (status, pull) = send(
        app(&env),
        Method::POST,
        &format!("/sessions/{}/batches/pull", session_id),
        Some(json!({ "user_id": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pull["batches"].as_array().unwrap().len(), 1);
    let documents = pull["documents"].as_array().unwrap();
    assert_eq!(documents.len(), 6);
    assert!(documents.iter().all(|d| d["review_state"] == "READY"));

    let document_id = documents[0]["id"].as_str().unwrap();
    let (status, body) = send(
        app(&env),
        Method::POST,
        &format!("/documents/{}/decision", document_id),
        Some(json!({ "actor": "bob", "action": "ACCEPT" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "BATCH_CONFLICT");

    let (status, body) = send(
        app(&env),
        Method::POST,
        &format!("/documents/{}/decision", document_id),
        Some(json!({ "actor": "alice", "action": "RECLASSIFY", "note": "personal" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["document"]["validation_status"], "RECLASSIFIED");
    assert_eq!(body["document"]["reclassification_note"], "personal");
    assert_eq!(body["reclustering_triggered"], false);

    let (status, clusters) = send(app(&env), Method::GET, &format!("/sessions/{}/clusters", session_id), None).await;
    assert_eq!(status, StatusCode::OK);
    let clusters = clusters.as_array().unwrap();
    assert_eq!(clusters.len(), 2);

    let (status, approved) = send(
        app(&env),
        Method::POST,
        &format!("/clusters/{}/approve", clusters[0]["id"].as_str().unwrap()),
        Some(json!({ "actor": "alice", "name": "Correspondence" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(approved["status"], "APPROVED");
    assert_eq!(approved["approved_name"], "Correspondence");

    let (status, _) = send(
        app(&env),
        Method::POST,
        &format!("/clusters/{}/archive", clusters[0]["id"].as_str().unwrap()),
        Some(json!({ "actor": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, batches) = send(app(&env), Method::GET, &format!("/sessions/{}/batches", session_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(batches["progress"]["categorized"], 1);
    assert_eq!(batches["batches"][0]["assigned_to"], "alice");

    let (status, audit) = send(app(&env), Method::GET, &format!("/sessions/{}/audit", session_id), None).await;
    assert_eq!(status, StatusCode::OK);
    let actions: Vec<_> = audit
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["action"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(actions, vec!["RECLASSIFY", "APPROVE"]);
}
