use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};
use tracklink_core::attribution::{AdTouchpoint, AttributionWindow, ConversionKind};
use tracklink_core::contact::ContactStatus;
use tracklink_core::conversion::{process_conversion, AttributionFields, ConversionInput};
use tracklink_core::engine::EngineBackend;
use tracklink_core::error::EngineError;
use tracklink_core::fingerprint::FingerprintSet;
use tracklink_core::session::{Session, SessionLinkOutcome};
use tracklink_duckdb::DuckDbBackend;

fn conversion(kind: ConversionKind, day: u32) -> ConversionInput {
    ConversionInput {
        kind,
        ext_crm_id: Some("ghl_1".to_string()),
        first_name: Some("Ann".to_string()),
        last_name: None,
        email: Some("ann@x.com".to_string()),
        phone: None,
        company: None,
        occurred_at: Some(Utc.with_ymd_and_hms(2025, 1, day, 14, 0, 0).unwrap()),
        attribution: AttributionFields::default(),
        appointment_id: None,
        scheduled_at: None,
        payment_id: None,
        amount: None,
    }
}

async fn seed(engine: &dyn EngineBackend) {
    engine
        .replace_touchpoints(
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
            &[AdTouchpoint {
                ad_id: "ad_7".to_string(),
                campaign_id: "camp_1".to_string(),
                adset_id: "set_1".to_string(),
                date: NaiveDate::from_ymd_opt(2025, 1, 8).unwrap(),
                spend: 50.0,
                clicks: 12,
                reach: 400,
            }],
        )
        .await
        .expect("feed");
    engine
        .record_session(&Session {
            session_id: "s1".to_string(),
            visitor_id: "v1".to_string(),
            contact_id: None,
            started_at: Utc.with_ymd_and_hms(2025, 1, 8, 11, 0, 0).unwrap(),
            channel: Some("paid_social".to_string()),
            source_platform: None,
            utm_source: Some("facebook".to_string()),
            ad_id: Some("ad_7".to_string()),
            fingerprint: FingerprintSet::default(),
        })
        .await
        .expect("session");
}

#[tokio::test]
async fn test_lead_then_sale_lands_on_one_attributed_client() {
    let engine: Arc<dyn EngineBackend> = Arc::new(DuckDbBackend::open_in_memory().expect("db"));
    seed(engine.as_ref()).await;
    let now = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();

    let mut lead = conversion(ConversionKind::Lead, 10);
    lead.attribution = AttributionFields {
        ad_id: Some("ad_7".to_string()),
        source: Some("fb_ad".to_string()),
        visitor_id: Some("v1".to_string()),
    };
    let first = process_conversion(engine.as_ref(), &lead, now)
        .await
        .expect("lead");
    assert!(first.merge.created);
    assert_eq!(first.contact.visitor_id.as_deref(), Some("v1"));
    match first.session_link {
        Some(SessionLinkOutcome::Linked {
            sessions_updated, ..
        }) => assert_eq!(sessions_updated, 1),
        other => panic!("expected sessions to be linked, got {other:?}"),
    }

    let mut sale = conversion(ConversionKind::Sale, 20);
    sale.email = None;
    sale.phone = Some("555 111 2222".to_string());
    sale.payment_id = Some("pay_1".to_string());
    sale.amount = Some(200.0);
    let second = process_conversion(engine.as_ref(), &sale, now)
        .await
        .expect("sale");
    assert!(!second.merge.created);
    assert_eq!(second.contact.contact_id, first.contact.contact_id);
    assert_eq!(second.contact.status, ContactStatus::Client);
    assert_eq!(second.contact.email.as_deref(), Some("ann@x.com"));
    assert_eq!(second.contact.phone.as_deref(), Some("555 111 2222"));
    assert_eq!(second.contact.created_at, first.contact.created_at);

    // Webhook redelivery.
    process_conversion(engine.as_ref(), &sale, now)
        .await
        .expect("redelivered sale");

    let report = engine
        .attribution_report(
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
            &AttributionWindow::default(),
        )
        .await
        .expect("report");
    assert_eq!(report.totals.leads, 1);
    assert_eq!(report.totals.sales, 1, "redelivery records no second sale");
    assert_eq!(report.rows.len(), 1);
    let row = &report.rows[0];
    assert_eq!(row.ad_id, "ad_7");
    assert_eq!(row.leads, 1);
    assert_eq!(row.sales, 1);
    assert_eq!(row.revenue, 200.0);
    assert_eq!(row.roas, Some(4.0));
}

#[tokio::test]
async fn test_conversion_without_crm_id_is_rejected_before_writes() {
    let db = Arc::new(DuckDbBackend::open_in_memory().expect("db"));
    let mut lead = conversion(ConversionKind::Lead, 10);
    lead.ext_crm_id = None;

    let err = process_conversion(&*db, &lead, Utc::now())
        .await
        .expect_err("missing ext_crm_id");
    assert!(matches!(
        err,
        EngineError::Validation {
            field: "ext_crm_id",
            ..
        }
    ));
    let conn = db.conn_for_test().await;
    let contacts: i64 = conn
        .query_row("SELECT COUNT(*) FROM contacts", [], |row| row.get(0))
        .expect("count");
    assert_eq!(contacts, 0);
}

#[tokio::test]
async fn test_conversion_without_visitor_skips_linking() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    let outcome = process_conversion(&db, &conversion(ConversionKind::Lead, 10), Utc::now())
        .await
        .expect("lead");
    assert_eq!(outcome.session_link, None);
    assert_eq!(outcome.contact.status, ContactStatus::Lead);
}
