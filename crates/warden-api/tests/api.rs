//! End-to-end REST tests.
//!
//! Drives the full router over an in-memory SQLite database, with a software
//! U2F token playing the hardware side of every ceremony.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use warden_api::attestation::AttestationService;
use warden_api::engine::Engine;
use warden_api::{build_router, AppState};
use warden_db::repository::clients;
use warden_db::transaction_store::{DbStore, TransactionStore};
use warden_db::{Database, DbBackend};
use warden_u2f::soft::SoftToken;

const CLIENT: &str = "fooclient";
const APP_ID: &str = "https://example.com";

struct TestServer {
    app: Router,
    db: Database,
}

async fn server() -> TestServer {
    server_with(true, None).await
}

async fn server_with(allow_untrusted: bool, metadata: Option<&str>) -> TestServer {
    sqlx::any::install_default_drivers();
    let pool = sqlx::any::AnyPoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    let db = Database {
        pool,
        redis: None,
        backend: DbBackend::Sqlite,
    };
    db.migrate().await.expect("migrations");
    {
        let mut conn = db.pool.acquire().await.unwrap();
        clients::create(&mut conn, CLIENT, APP_ID, &[APP_ID.to_owned()])
            .await
            .unwrap();
    }
    let engine = Engine::new(
        db.clone(),
        TransactionStore::Db(DbStore::new(5, 300)),
        AttestationService::load(metadata).unwrap(),
        allow_untrusted,
    );
    let app = build_router(Arc::new(AppState { engine }));
    TestServer { app, db }
}

async fn send(app: &Router, method: &str, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("x-authenticated-client", CLIENT);
    if body.is_some() {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
    }
    let request = match body {
        Some(value) => builder.body(Body::from(value.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn send_raw(app: &Router, path: &str) -> (StatusCode, HeaderMap, Vec<u8>) {
    let request = Request::builder()
        .method("GET")
        .uri(path)
        .header("x-authenticated-client", CLIENT)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, bytes.to_vec())
}

/// Run a full registration ceremony; `query` is appended to the start URL.
async fn register(
    app: &Router,
    token: &mut SoftToken,
    user: &str,
    query: &str,
    properties: Value,
) -> (StatusCode, Value) {
    let (status, request) = send(app, "GET", &format!("/{user}/register{query}"), None).await;
    assert_eq!(status, StatusCode::OK, "register start failed: {request}");
    assert_eq!(request["appId"], APP_ID);
    let challenge = request["registerRequests"][0]["challenge"].as_str().unwrap();
    let response = token.register(APP_ID, challenge, APP_ID).unwrap();
    let mut body = json!({ "registerResponse": serde_json::to_value(&response).unwrap() });
    if !properties.is_null() {
        body["properties"] = properties;
    }
    send(app, "POST", &format!("/{user}/register"), Some(body)).await
}

/// Run a full sign ceremony; errors from the start call are returned as-is.
async fn sign(
    app: &Router,
    token: &mut SoftToken,
    user: &str,
    query: &str,
    properties: Value,
) -> (StatusCode, Value) {
    let (status, request) = send(app, "GET", &format!("/{user}/sign{query}"), None).await;
    if status != StatusCode::OK {
        return (status, request);
    }
    let challenge = request["challenge"].as_str().unwrap();
    let key_handle = request["registeredKeys"][0]["keyHandle"].as_str().unwrap();
    let response = token
        .sign_websafe(APP_ID, challenge, APP_ID, key_handle)
        .unwrap();
    let mut body = json!({ "signResponse": serde_json::to_value(&response).unwrap() });
    if !properties.is_null() {
        body["properties"] = properties;
    }
    send(app, "POST", &format!("/{user}/sign"), Some(body)).await
}

fn properties_query(properties: &Value) -> String {
    let encoded: String = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("properties", &properties.to_string())
        .finish();
    format!("?{encoded}")
}

async fn count(db: &Database, sql: &str) -> i64 {
    let row: (i64,) = sqlx::query_as(sql).fetch_one(&db.pool).await.unwrap();
    row.0
}

// ============================================================
// Scenarios
// ============================================================

#[tokio::test]
async fn call_without_client_is_rejected() {
    let server = server().await;
    let request = Request::builder()
        .method("GET")
        .uri("/")
        .body(Body::empty())
        .unwrap();
    let response = server.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["errorCode"], 10);
}

#[tokio::test]
async fn call_with_unknown_client_is_rejected() {
    let server = server().await;
    let request = Request::builder()
        .method("GET")
        .uri("/")
        .header("x-authenticated-client", "invalid")
        .body(Body::empty())
        .unwrap();
    let response = server.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["errorCode"], 10);
}

#[tokio::test]
async fn trusted_facets_lists_the_client_facets() {
    let server = server().await;
    let (status, body) = send(&server.app, "GET", "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["trustedFacets"][0]["version"]["major"], 1);
    assert_eq!(body["trustedFacets"][0]["ids"][0], APP_ID);
}

#[tokio::test]
async fn unknown_user_lists_empty() {
    let server = server().await;
    let (status, body) = send(&server.app, "GET", "/alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn sign_without_devices_is_a_policy_error() {
    let server = server().await;
    let (status, body) = send(&server.app, "GET", "/alice/sign", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errorCode"], 11);
    assert_eq!(body["errorData"], json!([]));
}

#[tokio::test]
async fn register_and_sign_round_trip() {
    let server = server().await;
    let mut token = SoftToken::new().unwrap();

    let (status, descriptor) = register(
        &server.app,
        &mut token,
        "alice",
        "",
        json!({"foo": "bar"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{descriptor}");
    let handle = descriptor["handle"].as_str().unwrap();
    assert_eq!(handle.len(), 32);
    assert!(handle.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    assert_eq!(descriptor["properties"], json!({"foo": "bar"}));
    assert_eq!(descriptor["compromised"], false);
    assert_eq!(descriptor["lastUsed"], Value::Null);

    // The new key shows up in the sign request.
    let (status, request) = send(&server.app, "GET", "/alice/sign", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(request["appId"], APP_ID);
    assert_eq!(request["registeredKeys"].as_array().unwrap().len(), 1);
    assert_eq!(request["registeredKeys"][0]["version"], "U2F_V2");
    // appId is omitted when it matches the client's.
    assert!(request["registeredKeys"][0].get("appId").is_none());

    let (status, descriptor) = sign(
        &server.app,
        &mut token,
        "alice",
        "",
        json!({"baz": "two"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{descriptor}");
    assert_eq!(descriptor["handle"].as_str().unwrap(), handle);
    assert_eq!(
        descriptor["properties"],
        json!({"foo": "bar", "baz": "two"})
    );
    assert!(descriptor["lastUsed"].is_string());
}

#[tokio::test]
async fn start_properties_yield_to_completion_properties() {
    let server = server().await;
    let mut token = SoftToken::new().unwrap();

    let query = properties_query(&json!({"a": "start", "b": "start"}));
    let (status, descriptor) = register(
        &server.app,
        &mut token,
        "alice",
        &query,
        json!({"b": "body"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(descriptor["properties"], json!({"a": "start", "b": "body"}));
}

#[tokio::test]
async fn null_property_deletes_the_key() {
    let server = server().await;
    let mut token = SoftToken::new().unwrap();

    let (status, descriptor) = register(
        &server.app,
        &mut token,
        "alice",
        "",
        json!({"foo": "one", "bar": "one"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let handle = descriptor["handle"].as_str().unwrap().to_owned();

    let (status, descriptor) = send(
        &server.app,
        "POST",
        &format!("/alice/{handle}"),
        Some(json!({"bar": "two", "foo": null})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(descriptor["properties"], json!({"bar": "two"}));
}

#[tokio::test]
async fn counter_regression_latches_compromise() {
    let server = server().await;
    let mut token = SoftToken::new().unwrap();

    let (status, _) = register(&server.app, &mut token, "alice", "", Value::Null).await;
    assert_eq!(status, StatusCode::OK);

    for _ in 0..3 {
        let (status, body) = sign(&server.app, &mut token, "alice", "", Value::Null).await;
        assert_eq!(status, StatusCode::OK, "{body}");
    }

    // Simulate a cloned device: wind the counter back.
    token.set_counter(1);
    let (status, body) = sign(&server.app, &mut token, "alice", "", Value::Null).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errorCode"], 12);
    assert_eq!(body["errorData"]["compromised"], true);

    // All eligible devices are gone now.
    let (status, body) = send(&server.app, "GET", "/alice/sign", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errorCode"], 11);
    assert_eq!(body["errorData"].as_array().unwrap().len(), 1);
    assert_eq!(body["errorData"][0]["compromised"], true);

    // The latch also rejects a straight sign_complete replay path: the
    // device stays unusable even with a fresh, valid response.
    token.set_counter(10);
    let (status, body) = sign(&server.app, &mut token, "alice", "", Value::Null).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errorCode"], 11, "{body}");
}

#[tokio::test]
async fn sign_can_be_restricted_to_named_handles() {
    let server = server().await;
    let mut token = SoftToken::new().unwrap();

    let mut handles = Vec::new();
    for _ in 0..3 {
        let (status, descriptor) =
            register(&server.app, &mut token, "alice", "", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        handles.push(descriptor["handle"].as_str().unwrap().to_owned());
    }

    let (status, request) = send(
        &server.app,
        "GET",
        &format!("/alice/sign?handle={}&handle={}", handles[0], handles[1]),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(request["registeredKeys"].as_array().unwrap().len(), 2);
    assert_eq!(request["descriptors"].as_array().unwrap().len(), 2);

    // A handle the user does not own is bad input, well-formed or not.
    let (status, body) = send(
        &server.app,
        "GET",
        "/alice/sign?handle=00000000000000000000000000000000",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errorCode"], 10);

    let (status, body) = send(&server.app, "GET", "/alice/sign?handle=unknown", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errorCode"], 10);
}

#[tokio::test]
async fn caller_supplied_challenge_round_trips() {
    let server = server().await;
    let mut token = SoftToken::new().unwrap();

    let (status, request) = send(
        &server.app,
        "GET",
        "/alice/register?challenge=ThisIsAChallenge",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(request["registerRequests"][0]["challenge"], "ThisIsAChallenge");

    let response = token.register(APP_ID, "ThisIsAChallenge", APP_ID).unwrap();
    let (status, descriptor) = send(
        &server.app,
        "POST",
        "/alice/register",
        Some(json!({ "registerResponse": serde_json::to_value(&response).unwrap() })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{descriptor}");
    let handle = descriptor["handle"].as_str().unwrap().to_owned();

    let (status, request) = send(
        &server.app,
        "GET",
        "/alice/sign?challenge=ThisIsAChallenge",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(request["challenge"], "ThisIsAChallenge");
    let key_handle = request["registeredKeys"][0]["keyHandle"].as_str().unwrap();

    let response = token
        .sign_websafe(APP_ID, "ThisIsAChallenge", APP_ID, key_handle)
        .unwrap();
    let (status, descriptor) = send(
        &server.app,
        "POST",
        "/alice/sign",
        Some(json!({ "signResponse": serde_json::to_value(&response).unwrap() })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{descriptor}");
    assert_eq!(descriptor["handle"].as_str().unwrap(), handle);
}

#[tokio::test]
async fn certificates_deduplicate_by_fingerprint() {
    let server = server().await;
    let mut token = SoftToken::new().unwrap();

    register(&server.app, &mut token, "alice", "", Value::Null).await;
    register(&server.app, &mut token, "alice", "", Value::Null).await;
    assert_eq!(count(&server.db, "SELECT COUNT(*) FROM certificates").await, 1);
    assert_eq!(count(&server.db, "SELECT COUNT(*) FROM devices").await, 2);

    // A different token ships a different attestation certificate.
    let mut other = SoftToken::new().unwrap();
    register(&server.app, &mut other, "alice", "", Value::Null).await;
    assert_eq!(count(&server.db, "SELECT COUNT(*) FROM certificates").await, 2);
}

#[tokio::test]
async fn delete_user_cascades_devices_and_properties() {
    let server = server().await;
    let mut token = SoftToken::new().unwrap();

    for _ in 0..3 {
        let (status, _) = register(
            &server.app,
            &mut token,
            "alice",
            "",
            json!({"foo": "bar"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(count(&server.db, "SELECT COUNT(*) FROM devices").await, 3);

    let (status, _) = send(&server.app, "DELETE", "/alice", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&server.app, "GET", "/alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
    assert_eq!(count(&server.db, "SELECT COUNT(*) FROM devices").await, 0);
    assert_eq!(count(&server.db, "SELECT COUNT(*) FROM properties").await, 0);
    assert_eq!(count(&server.db, "SELECT COUNT(*) FROM users").await, 0);

    // Idempotent.
    let (status, _) = send(&server.app, "DELETE", "/alice", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn descriptor_lookup_distinguishes_syntax_from_absence() {
    let server = server().await;

    // Malformed handle → bad input.
    let (status, body) = send(&server.app, "GET", "/alice/nothex", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errorCode"], 10);

    // Well-formed but unknown → not found (user doesn't even exist).
    let (status, body) = send(
        &server.app,
        "GET",
        "/alice/00000000000000000000000000000000",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["errorCode"], 404);
}

#[tokio::test]
async fn delete_device_is_idempotent() {
    let server = server().await;
    let mut token = SoftToken::new().unwrap();

    let (_, descriptor) = register(&server.app, &mut token, "alice", "", Value::Null).await;
    let handle = descriptor["handle"].as_str().unwrap().to_owned();

    let (status, _) = send(&server.app, "DELETE", &format!("/alice/{handle}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&server.app, "GET", &format!("/alice/{handle}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&server.app, "DELETE", &format!("/alice/{handle}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn certificate_endpoint_returns_pem() {
    let server = server().await;
    let mut token = SoftToken::new().unwrap();

    let (_, descriptor) = register(&server.app, &mut token, "alice", "", Value::Null).await;
    let handle = descriptor["handle"].as_str().unwrap().to_owned();

    let (status, headers, body) =
        send_raw(&server.app, &format!("/alice/{handle}/certificate")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get(header::CONTENT_TYPE).unwrap(),
        "application/x-pem-file"
    );
    assert!(body.starts_with(b"-----BEGIN CERTIFICATE-----"));
    assert_eq!(body, token.attestation_cert_pem().unwrap());
}

#[tokio::test]
async fn completion_without_transaction_is_not_found() {
    let server = server().await;
    let mut token = SoftToken::new().unwrap();

    // A response to a challenge the server never issued.
    let response = token
        .register(APP_ID, "bm90LXRoZS1zZXJ2ZXJz", APP_ID)
        .unwrap();
    let (status, body) = send(
        &server.app,
        "POST",
        "/alice/register",
        Some(json!({ "registerResponse": serde_json::to_value(&response).unwrap() })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["errorCode"], 404);
}

#[tokio::test]
async fn sign_transaction_is_single_use() {
    let server = server().await;
    let mut token = SoftToken::new().unwrap();

    register(&server.app, &mut token, "alice", "", Value::Null).await;

    let (status, request) = send(&server.app, "GET", "/alice/sign", None).await;
    assert_eq!(status, StatusCode::OK);
    let challenge = request["challenge"].as_str().unwrap();
    let key_handle = request["registeredKeys"][0]["keyHandle"].as_str().unwrap();
    let response = token
        .sign_websafe(APP_ID, challenge, APP_ID, key_handle)
        .unwrap();
    let body = json!({ "signResponse": serde_json::to_value(&response).unwrap() });

    let (status, _) = send(&server.app, "POST", "/alice/sign", Some(body.clone())).await;
    assert_eq!(status, StatusCode::OK);

    // Replaying the exact same completion finds no transaction.
    let (status, replay) = send(&server.app, "POST", "/alice/sign", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(replay["errorCode"], 10);
}

#[tokio::test]
async fn pending_ceremonies_are_capped_per_user() {
    let server = server().await;
    for _ in 0..7 {
        let (status, _) = send(&server.app, "GET", "/alice/register", None).await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(
        count(&server.db, "SELECT COUNT(*) FROM transactions").await,
        5
    );
}

#[tokio::test]
async fn malformed_body_is_bad_input() {
    let server = server().await;
    let request = Request::builder()
        .method("POST")
        .uri("/alice/register")
        .header("x-authenticated-client", CLIENT)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = server.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["errorCode"], 10);
}

#[tokio::test]
async fn over_long_user_names_are_rejected() {
    let server = server().await;
    let name = "x".repeat(41);
    let (status, body) = send(&server.app, "GET", &format!("/{name}/register"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errorCode"], 10);
}

// ============================================================
// Attestation trust policy
// ============================================================

#[tokio::test]
async fn trust_gate_admits_known_vendors_and_rejects_strangers() {
    let trusted_token = SoftToken::new().unwrap();
    let pem = String::from_utf8(trusted_token.attestation_cert_pem().unwrap()).unwrap();

    let dir = std::env::temp_dir().join(format!("warden-metadata-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let file = dir.join("soft-vendor.json");
    std::fs::write(
        &file,
        json!({
            "identifier": "soft-vendor",
            "vendorInfo": { "name": "Soft Vendor" },
            "trustedCertificates": [pem],
            "devices": [
                { "deviceInfo": { "displayName": "Soft Token" }, "transports": 1 }
            ]
        })
        .to_string(),
    )
    .unwrap();

    let server = server_with(false, dir.to_str()).await;

    let mut token = trusted_token;
    let (status, descriptor) = register(&server.app, &mut token, "alice", "", Value::Null).await;
    assert_eq!(status, StatusCode::OK, "{descriptor}");
    assert_eq!(descriptor["metadata"]["vendor"]["name"], "Soft Vendor");
    assert_eq!(descriptor["metadata"]["device"]["displayName"], "Soft Token");
    assert_eq!(descriptor["transports"], json!(["usb"]));

    let mut stranger = SoftToken::new().unwrap();
    let (status, request) = send(&server.app, "GET", "/alice/register", None).await;
    assert_eq!(status, StatusCode::OK);
    let challenge = request["registerRequests"][0]["challenge"].as_str().unwrap();
    let response = stranger.register(APP_ID, challenge, APP_ID).unwrap();
    let (status, body) = send(
        &server.app,
        "POST",
        "/alice/register",
        Some(json!({ "registerResponse": serde_json::to_value(&response).unwrap() })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errorCode"], 10);

    std::fs::remove_dir_all(&dir).ok();
}
