use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
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

async fn body_bytes(response: axum::http::Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes()
        .to_vec()
}

async fn json_body(response: axum::http::Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).expect("parse JSON")
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

fn feed() -> Value {
    json!({
        "start_date": "2025-01-01",
        "end_date": "2025-01-31",
        "rows": [
            { "ad_id": "ad_7", "campaign_id": "camp_1", "adset_id": "set_1",
              "date": "2025-01-08", "spend": 50.0, "clicks": 12, "reach": 400 },
            { "ad_id": "=cmd", "campaign_id": "camp_2", "adset_id": "set_2",
              "date": "2025-01-09", "spend": 10.0 }
        ]
    })
}

/// One fallback-attributed lead that later pays, plus one organic lead.
async fn seed(app: &axum::Router) -> String {
    let response = send(app, "PUT", "/api/touchpoints", Some(feed())).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["data"]["rows"], 2);

    let lead = json_body(
        send(
            app,
            "POST",
            "/api/conversions",
            Some(json!({
                "kind": "lead",
                "ext_crm_id": "ghl_1",
                "email": "ann@x.com",
                "occurred_at": "2025-01-10T14:00:00Z",
                "attribution": { "ad_id": "ad_7", "source": "fb_ad" }
            })),
        )
        .await,
    )
    .await;
    send(
        app,
        "POST",
        "/api/conversions",
        Some(json!({
            "kind": "sale",
            "ext_crm_id": "ghl_1",
            "payment_id": "pay_1",
            "amount": 150.0,
            "occurred_at": "2025-01-20T10:00:00Z"
        })),
    )
    .await;
    send(
        app,
        "POST",
        "/api/conversions",
        Some(json!({
            "kind": "lead",
            "ext_crm_id": "ghl_2",
            "email": "bo@x.com",
            "occurred_at": "2025-01-15T10:00:00Z"
        })),
    )
    .await;

    lead["data"]["contact"]["contact_id"]
        .as_str()
        .expect("contact id")
        .to_string()
}

#[tokio::test]
async fn test_contact_attribution_uses_fallback_touchpoint() {
    let app = setup();
    let contact_id = seed(&app).await;

    let response = send(
        &app,
        "GET",
        &format!("/api/contacts/{contact_id}/attribution"),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    let attribution = &json["data"]["attribution"];
    assert_eq!(attribution["ad_id"], "ad_7");
    assert_eq!(attribution["campaign_id"], "camp_1");
    assert_eq!(attribution["touchpoint_date"], "2025-01-08");
    assert_eq!(attribution["strategy"]["type"], "contact_fallback");
    assert_eq!(json["data"]["status"], "client");

    let response = send(&app, "GET", "/api/contacts/ct_missing/attribution", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_report_json_splits_attributed_and_unattributed() {
    let app = setup();
    seed(&app).await;

    let response = send(
        &app,
        "GET",
        "/api/reports/attribution?start_date=2025-01-01&end_date=2025-01-31",
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    let data = &json["data"];
    assert_eq!(data["total_spend"], 60.0);
    assert_eq!(data["totals"]["leads"], 2);
    assert_eq!(data["totals"]["sales"], 1);
    assert_eq!(data["unattributed"]["leads"], 1);
    assert_eq!(data["unattributed"]["sales"], 0);

    let rows = data["rows"].as_array().expect("rows");
    assert_eq!(rows[0]["ad_id"], "ad_7");
    assert_eq!(rows[0]["leads"], 1);
    assert_eq!(rows[0]["revenue"], 150.0);
    assert_eq!(rows[0]["roas"], 3.0);
}

#[tokio::test]
async fn test_report_csv_download() {
    let app = setup();
    seed(&app).await;

    let response = send(
        &app,
        "GET",
        "/api/reports/attribution?start_date=2025-01-01&end_date=2025-01-31&format=csv",
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/csv; charset=utf-8"
    );
    assert!(response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .expect("ascii header")
        .contains("attribution-2025-01-01-2025-01-31.csv"));

    let body = String::from_utf8(body_bytes(response).await).expect("utf8");
    let lines: Vec<&str> = body.lines().collect();
    assert!(lines[0].starts_with("ad_id,campaign_id,adset_id,spend"));
    assert!(lines[1].starts_with("ad_7,camp_1,set_1,50.00,12,400,1,0,1,150.00,3.00"));
    assert!(lines.iter().any(|l| l.starts_with("'=cmd,")), "formula cells are quoted");
    assert!(lines
        .last()
        .expect("unattributed row")
        .starts_with("(unattributed),,,,,,1,0,0,0.00"));
}

#[tokio::test]
async fn test_report_rejects_bad_parameters() {
    let app = setup();
    for uri in [
        "/api/reports/attribution?format=xlsx",
        "/api/reports/attribution?start_date=2025-02-01&end_date=2025-01-01",
        "/api/reports/attribution?timezone=Not/AZone",
        "/api/reports/attribution?start_date=01/02/2025",
        "/api/reports/attribution?end_date=-262143-01-01",
    ] {
        let response = send(&app, "GET", uri, None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
    }
}

#[tokio::test]
async fn test_touchpoint_feed_outside_range_is_rejected_atomically() {
    let app = setup();
    send(&app, "PUT", "/api/touchpoints", Some(feed())).await;

    let response = send(
        &app,
        "PUT",
        "/api/touchpoints",
        Some(json!({
            "start_date": "2025-01-01",
            "end_date": "2025-01-31",
            "rows": [
                { "ad_id": "ad_8", "campaign_id": "c", "adset_id": "s", "date": "2025-02-03" }
            ]
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["field"], "date");

    let report = json_body(
        send(
            &app,
            "GET",
            "/api/reports/attribution?start_date=2025-01-01&end_date=2025-01-31",
            None,
        )
        .await,
    )
    .await;
    assert_eq!(report["data"]["total_spend"], 60.0, "earlier feed untouched");
}
