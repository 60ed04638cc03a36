// src/routes/anomalies.rs

use actix_web::{get, post, web, HttpResponse, Responder};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::middleware::path_logger::PathLogger;
use crate::services::hub::Broadcaster;
use crate::services::market_hours;
use crate::storage::models::{AnomaliesBatch, Anomaly};
use crate::storage::tables::{
    anomaly_entity, anomaly_from_entity, TableStore, PARTITION, TABLE_ANOMALIES,
};
use crate::utils::types::ApiResponse;

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

/// Results are fenced to ~4 h before the most recent session close so a
/// dashboard opened on Monday still shows Friday's tail, not stale history.
async fn fetch_recent(
    store: &Arc<dyn TableStore>,
    limit: usize,
) -> Result<Vec<Anomaly>, HttpResponse> {
    let cutoff = market_hours::last_session_close(Utc::now()) - Duration::hours(4);
    let mut entities = store
        .query(TABLE_ANOMALIES, PARTITION, Some(cutoff))
        .await
        .map_err(|e| {
            log::error!("anomaly query failed: {e}");
            HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::err(format!("storage error: {e}")))
        })?;

    // anomaly keys ascend with time; newest first means reverse key order
    entities.sort_by(|a, b| b.row_key.cmp(&a.row_key));
    Ok(entities.iter().take(limit).filter_map(anomaly_from_entity).collect())
}

#[get("/anomalies")]
pub async fn get_anomalies(
    store: web::Data<Arc<dyn TableStore>>,
    query: web::Query<LimitQuery>,
) -> impl Responder {
    let limit = query.limit.unwrap_or(10);
    if !(1..=100).contains(&limit) {
        return HttpResponse::BadRequest()
            .json(ApiResponse::<()>::err("limit must be between 1 and 100"));
    }

    match fetch_recent(store.get_ref(), limit).await {
        Ok(anomalies) => HttpResponse::Ok().json(AnomaliesBatch {
            count: anomalies.len(),
            anomalies,
            last_scan: Some(Utc::now()),
        }),
        Err(resp) => resp,
    }
}

/// Dashboard alias with a wider page size.
#[get("/dashboard/snapshot")]
pub async fn dashboard_snapshot(
    store: web::Data<Arc<dyn TableStore>>,
    query: web::Query<LimitQuery>,
) -> impl Responder {
    let limit = query.limit.unwrap_or(50);
    if !(1..=500).contains(&limit) {
        return HttpResponse::BadRequest()
            .json(ApiResponse::<()>::err("limit must be between 1 and 500"));
    }

    match fetch_recent(store.get_ref(), limit).await {
        Ok(anomalies) => HttpResponse::Ok().json(AnomaliesBatch {
            count: anomalies.len(),
            anomalies,
            last_scan: Some(Utc::now()),
        }),
        Err(resp) => resp,
    }
}

#[post("/anomalies")]
pub async fn post_anomalies(
    store: web::Data<Arc<dyn TableStore>>,
    hub: web::Data<Broadcaster>,
    batch: web::Json<AnomaliesBatch>,
) -> impl Responder {
    if let Err(msg) = batch.validate() {
        return HttpResponse::BadRequest().json(ApiResponse::<()>::err(msg));
    }

    let mut persist_failed = false;
    for anomaly in &batch.anomalies {
        if let Err(e) = store.upsert(TABLE_ANOMALIES, anomaly_entity(anomaly)).await {
            log::error!("failed to persist anomaly {}: {e}", anomaly.strike);
            persist_failed = true;
        }
        metrics::increment_counter!("anomalies_ingested_total",
            "severity" => anomaly.severity.as_str());
    }

    // broadcast regardless of storage health: the channels are independent
    for anomaly in &batch.anomalies {
        if let Ok(payload) = serde_json::to_value(anomaly) {
            hub.publish("anomalyDetected", payload).await;
        }
    }

    if persist_failed {
        return HttpResponse::InternalServerError()
            .json(ApiResponse::<()>::err("one or more anomalies failed to persist"));
    }
    HttpResponse::Ok().json(json!({ "status": "success", "count": batch.count }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .wrap(PathLogger)
            .service(get_anomalies)
            .service(post_anomalies)
            .service(dashboard_snapshot),
    );
}
