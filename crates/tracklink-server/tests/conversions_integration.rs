use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use tracklink_core::config::{Config, EngineSettings};
use tracklink_duckdb::DuckDbBackend;
use tracklink_server::app::build_app;
use tracklink_server::state::AppState;

fn test_config() -> Config {
    Config {
        port: 0,
        data_dir: "/tmp/tracklink-test".to_string(),
        duckdb_memory_limit: "1GB".to_string(),
        engine: EngineSettings::default(),
    }
}

fn setup() -> axum::Router {
    let db = DuckDbBackend::open_in_memory().expect("in-memory DuckDB");
    build_app(Arc::new(AppState::new(db, test_config())))
}

async fn json_body(response: axum::http::Response<Body>) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("parse JSON")
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> axum::http::Response<Body> {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("build request");
    app.clone().oneshot(request).await.expect("request")
}

fn session_payload(id: &str, visitor: &str, started_at: &str, canvas: &str) -> Value {
    json!({
        "session_id": id,
        "visitor_id": visitor,
        "started_at": started_at,
        "utm_source": "facebook",
        "ad_id": "ad_7",
        "fingerprint": {
            "canvas_hash": canvas,
            "device_signature": "dev_1"
        }
    })
}

#[tokio::test]
async fn test_lead_webhook_creates_contact_and_links_sessions() {
    let app = setup();
    let response = send(
        &app,
        "POST",
        "/api/sessions",
        Some(session_payload("s1", "v1", "2025-01-08T11:00:00Z", "cv_1")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(json_body(response).await["data"]["recorded"], true);

    let response = send(
        &app,
        "POST",
        "/api/conversions",
        Some(json!({
            "kind": "lead",
            "ext_crm_id": "ghl_1",
            "email": "ann@x.com",
            "occurred_at": "2025-01-10T14:00:00Z",
            "attribution": { "ad_id": "ad_7", "source": "fb_ad", "visitor_id": "v1" }
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    let data = &json["data"];
    assert_eq!(data["merge"]["created"], true);
    assert_eq!(data["contact"]["status"], "lead");
    assert_eq!(data["session_link"]["outcome"], "linked");
    assert_eq!(data["session_link"]["sessions_updated"], 1);
    let contact_id = data["contact"]["contact_id"].as_str().expect("contact id");
    assert!(contact_id.starts_with("ct_"));

    let response = send(
        &app,
        "GET",
        "/api/identities/resolve?identifier_type=visitor_id&identifier_value=v1",
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["data"]["visitor_state"]["state"], "contact_attached");
    assert_eq!(json["data"]["visitor_state"]["contact_id"], contact_id);
    let links = json["data"]["links"].as_array().expect("links");
    assert_eq!(links.len(), 3, "visitor, contact and device signature");
}

#[tokio::test]
async fn test_conversion_without_crm_id_is_a_field_error() {
    let app = setup();
    let response = send(
        &app,
        "POST",
        "/api/conversions",
        Some(json!({ "kind": "lead", "email": "ann@x.com" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = json_body(response).await;
    assert_eq!(json["error"]["code"], "validation_error");
    assert_eq!(json["error"]["field"], "ext_crm_id");
}

#[tokio::test]
async fn test_conversion_with_unknown_field_is_rejected() {
    let app = setup();
    let response = send(
        &app,
        "POST",
        "/api/conversions",
        Some(json!({ "kind": "lead", "ext_crm_id": "ghl_1", "emial": "typo@x.com" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], "validation_error");
}

#[tokio::test]
async fn test_duplicate_sale_webhooks_keep_one_contact() {
    let app = setup();
    let sale = json!({
        "kind": "sale",
        "ext_crm_id": "ghl_9",
        "phone": "+1 (555) 111-2222",
        "payment_id": "pay_1",
        "amount": 250.0,
        "occurred_at": "2025-01-12T10:00:00Z"
    });
    let first = json_body(send(&app, "POST", "/api/conversions", Some(sale.clone())).await).await;
    let second = json_body(send(&app, "POST", "/api/conversions", Some(sale)).await).await;
    assert_eq!(
        first["data"]["contact"]["contact_id"],
        second["data"]["contact"]["contact_id"]
    );
    assert_eq!(second["data"]["merge"]["created"], false);
    assert_eq!(second["data"]["contact"]["status"], "client");

    let response = send(
        &app,
        "POST",
        "/api/contacts/duplicates",
        Some(json!({ "phone": "555.111.2222" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["data"].as_array().expect("contacts").len(), 1);
}

#[tokio::test]
async fn test_duplicates_lookup_needs_a_key() {
    let app = setup();
    let response = send(&app, "POST", "/api/contacts/duplicates", Some(json!({}))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cleanup_reports_counts() {
    let app = setup();
    let response = send(&app, "POST", "/api/contacts/cleanup", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["data"]["groups_found"], 0);
    assert_eq!(json["data"]["groups_failed"], 0);
}

#[tokio::test]
async fn test_session_cannot_carry_contact_id() {
    let app = setup();
    let mut payload = session_payload("s1", "v1", "2025-01-08T11:00:00Z", "cv_1");
    payload["contact_id"] = json!("ct_forged");
    let response = send(&app, "POST", "/api/sessions", Some(payload)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_similar_sessions_for_known_and_unknown_ids() {
    let app = setup();
    for (id, visitor, at) in [
        ("s1", "v1", "2025-01-08T11:00:00Z"),
        ("s2", "v2", "2025-01-09T11:00:00Z"),
    ] {
        send(
            &app,
            "POST",
            "/api/sessions",
            Some(session_payload(id, visitor, at, "cv_same")),
        )
        .await;
    }

    let response = send(&app, "GET", "/api/sessions/s2/similar", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    let similar = json["data"].as_array().expect("matches");
    assert_eq!(similar.len(), 1);
    assert_eq!(similar[0]["session_id"], "s1");
    assert_eq!(similar[0]["score"], 65);

    let response = send(&app, "GET", "/api/sessions/missing/similar", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_resolve_rejects_unknown_identifier_type() {
    let app = setup();
    let response = send(
        &app,
        "GET",
        "/api/identities/resolve?identifier_type=email&identifier_value=a@x.com",
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["field"], "identifier_type");

    let response = send(
        &app,
        "GET",
        "/api/identities/resolve?identifier_type=visitor_id&identifier_value=v_unseen",
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
