// tests/routes.rs
use actix_web::{test, web, App};
use chrono::{Duration, Utc};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use std::sync::Arc;

use spyscan_backend::config::settings::Settings;
use spyscan_backend::routes::{anomalies, flow, health, market, negotiate, volumes};
use spyscan_backend::services::hub::Broadcaster;
use spyscan_backend::storage::memory::MemoryStore;
use spyscan_backend::storage::models::{AnomaliesBatch, Anomaly, Severity, Side};
use spyscan_backend::storage::tables::TableStore;

fn test_settings() -> Settings {
    Settings {
        server_port: 8000,
        gateway_host: "127.0.0.1".into(),
        gateway_port: 4002,
        gateway_client_id: 1,
        app_mode: "paper".into(),
        backend_url: "http://127.0.0.1:8000".into(),
        anomaly_threshold: 0.5,
        scan_interval_seconds: 5,
        strikes_range_percent: 1.0,
        max_strikes_limit: 5,
        hub_connection_string: String::new(),
        storage_connection_string: String::new(),
    }
}

fn anomaly(strike: f64, ts_offset_secs: i64) -> Anomaly {
    Anomaly {
        timestamp: Utc::now() - Duration::seconds(ts_offset_secs),
        symbol: "SPY".into(),
        strike,
        side: Side::Call,
        bid: 1.35,
        ask: 1.45,
        mid: 1.40,
        expected_price: 2.21,
        deviation_pct: -36.7,
        z_score: -1.9,
        volume: 1200,
        open_interest: 0,
        severity: Severity::Medium,
    }
}

macro_rules! build_app {
    ($store:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new(test_settings()))
                .app_data(web::Data::new($store.clone()))
                .app_data(web::Data::new(Broadcaster::start(None)))
                .app_data(web::Data::new(
                    PrometheusBuilder::new().build_recorder().handle(),
                ))
                .configure(health::configure)
                .configure(volumes::configure)
                .configure(flow::configure)
                .configure(market::configure)
                .configure(negotiate::configure)
                .configure(anomalies::configure),
        )
    };
}

#[actix_rt::test]
async fn health_and_metrics_respond() {
    let store: Arc<dyn TableStore> = Arc::new(MemoryStore::new());
    let app = build_app!(store).await;

    let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "spyscan-backend");

    let resp =
        test::call_service(&app, test::TestRequest::get().uri("/metrics").to_request()).await;
    assert_eq!(resp.status(), 200);
}

#[actix_rt::test]
async fn anomalies_round_trip_newest_first() {
    let store: Arc<dyn TableStore> = Arc::new(MemoryStore::new());
    let app = build_app!(store).await;

    let batch = AnomaliesBatch {
        count: 3,
        anomalies: vec![anomaly(503.0, 30), anomaly(505.0, 10), anomaly(504.0, 20)],
        last_scan: Some(Utc::now()),
    };
    let resp = test::call_service(
        &app,
        test::TestRequest::post().uri("/anomalies").set_json(&batch).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["count"], 3);

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/anomalies?limit=10").to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: AnomaliesBatch = test::read_body_json(resp).await;
    assert_eq!(body.count, 3);
    // reverse chronological: 505 (freshest), then 504, then 503
    let strikes: Vec<f64> = body.anomalies.iter().map(|a| a.strike).collect();
    assert_eq!(strikes, vec![505.0, 504.0, 503.0]);

    // limit truncates after ordering
    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/anomalies?limit=1").to_request(),
    )
    .await;
    let body: AnomaliesBatch = test::read_body_json(resp).await;
    assert_eq!(body.count, 1);
    assert_eq!(body.anomalies[0].strike, 505.0);
}

#[actix_rt::test]
async fn anomalies_batch_count_must_match() {
    let store: Arc<dyn TableStore> = Arc::new(MemoryStore::new());
    let app = build_app!(store).await;

    let bad = json!({
        "count": 5,
        "anomalies": [],
        "last_scan": null,
    });
    let resp = test::call_service(
        &app,
        test::TestRequest::post().uri("/anomalies").set_json(&bad).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn anomalies_limit_bounds_enforced() {
    let store: Arc<dyn TableStore> = Arc::new(MemoryStore::new());
    let app = build_app!(store).await;

    for uri in ["/anomalies?limit=0", "/anomalies?limit=101"] {
        let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
        assert_eq!(resp.status(), 400, "{uri} should be rejected");
    }
}

#[actix_rt::test]
async fn dashboard_alias_allows_wider_pages() {
    let store: Arc<dyn TableStore> = Arc::new(MemoryStore::new());
    let app = build_app!(store).await;

    let batch = AnomaliesBatch {
        count: 1,
        anomalies: vec![anomaly(505.0, 5)],
        last_scan: None,
    };
    test::call_service(
        &app,
        test::TestRequest::post().uri("/anomalies").set_json(&batch).to_request(),
    )
    .await;

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/dashboard/snapshot?limit=500").to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: AnomaliesBatch = test::read_body_json(resp).await;
    assert_eq!(body.count, 1);

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/dashboard/snapshot?limit=501").to_request(),
    )
    .await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn volume_change_pct_comes_from_stored_prev_close() {
    let store: Arc<dyn TableStore> = Arc::new(MemoryStore::new());
    let app = build_app!(store).await;

    // seed the market state with the session's previous close
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/market/state")
            .set_json(&json!({ "prev_close": 500.0 }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);

    let snapshot = json!({
        "timestamp": Utc::now().to_rfc3339(),
        "spy_price": 505.0,
        "prev_close": null,
        "calls_volume_atm": 120_000,
        "puts_volume_atm": 110_000,
        "calls_volume_delta": 500,
        "puts_volume_delta": 300,
        "atm_range": { "min_strike": 500.0, "max_strike": 510.0 },
        "strikes_count": { "calls": 11, "puts": 11 },
        "spy_change_pct": null,
    });
    let resp = test::call_service(
        &app,
        test::TestRequest::post().uri("/volumes").set_json(&snapshot).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/volumes/snapshot?hours=2").to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["count"], 1);
    let change = body["history"][0]["spy_change_pct"].as_f64().expect("change_pct set");
    assert!((change - 1.0).abs() < 1e-9, "(505-500)/500 = +1%: got {change}");
    assert_eq!(body["history"][0]["prev_close"].as_f64(), Some(500.0));
}

#[actix_rt::test]
async fn volume_snapshot_with_negative_delta_rejected() {
    let store: Arc<dyn TableStore> = Arc::new(MemoryStore::new());
    let app = build_app!(store).await;

    let snapshot = json!({
        "timestamp": Utc::now().to_rfc3339(),
        "spy_price": 505.0,
        "prev_close": null,
        "calls_volume_atm": 1000,
        "puts_volume_atm": 1000,
        "calls_volume_delta": -5,
        "puts_volume_delta": 0,
        "atm_range": { "min_strike": 500.0, "max_strike": 510.0 },
        "strikes_count": { "calls": 11, "puts": 11 },
        "spy_change_pct": null,
    });
    let resp = test::call_service(
        &app,
        test::TestRequest::post().uri("/volumes").set_json(&snapshot).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn prev_close_is_written_once_per_day() {
    let store: Arc<dyn TableStore> = Arc::new(MemoryStore::new());
    let app = build_app!(store).await;

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/market/state")
            .set_json(&json!({ "prev_close": 500.0 }))
            .to_request(),
    )
    .await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["updated_fields"], json!(["prev_close"]));

    // second write the same day is ignored
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/market/state")
            .set_json(&json!({ "prev_close": 999.0 }))
            .to_request(),
    )
    .await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["updated_fields"], json!([]));

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/api/market/state").to_request(),
    )
    .await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["prev_close"].as_f64(), Some(500.0));
}

#[actix_rt::test]
async fn market_state_patch_applies_sparse_fields() {
    let store: Arc<dyn TableStore> = Arc::new(MemoryStore::new());
    let app = build_app!(store).await;

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/market/state")
            .set_json(&json!({
                "atm_center": 500,
                "atm_min": 495,
                "atm_max": 505,
                "status": "OPEN",
            }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/api/market/state").to_request(),
    )
    .await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["atm_center"], 500);
    assert_eq!(body["status"], "OPEN");
    assert_eq!(body["prev_close"], Value::Null);

    // empty patch is a data-shape error
    let resp = test::call_service(
        &app,
        test::TestRequest::post().uri("/market/state").set_json(&json!({})).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn flow_round_trip() {
    let store: Arc<dyn TableStore> = Arc::new(MemoryStore::new());
    let app = build_app!(store).await;

    let snapshot = json!({
        "timestamp": Utc::now().timestamp(),
        "cum_call_flow": 1500.0,
        "cum_put_flow": -800.0,
        "net_flow": 2300.0,
    });
    let resp = test::call_service(
        &app,
        test::TestRequest::post().uri("/flow").set_json(&snapshot).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/flow/snapshot?hours=1").to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["history"][0]["net_flow"].as_f64(), Some(2300.0));

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/flow/snapshot?hours=121").to_request(),
    )
    .await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn spy_tick_validation_and_persist() {
    let store: Arc<dyn TableStore> = Arc::new(MemoryStore::new());
    let app = build_app!(store).await;

    let bad = json!({ "timestamp": Utc::now().timestamp(), "price": -5.0 });
    let resp = test::call_service(
        &app,
        test::TestRequest::post().uri("/spy-market").set_json(&bad).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 400);

    let good = json!({
        "timestamp": Utc::now().timestamp(),
        "price": 501.25,
        "bid": 501.24,
        "ask": 501.26,
        "last": 501.25,
        "volume": null,
    });
    let resp = test::call_service(
        &app,
        test::TestRequest::post().uri("/spy-market").set_json(&good).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
}

#[actix_rt::test]
async fn negotiate_unconfigured_hub_is_unavailable() {
    let store: Arc<dyn TableStore> = Arc::new(MemoryStore::new());
    let app = build_app!(store).await;

    let resp =
        test::call_service(&app, test::TestRequest::get().uri("/negotiate").to_request()).await;
    assert_eq!(resp.status(), 503);
}
