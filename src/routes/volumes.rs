// src/routes/volumes.rs

use actix_web::{get, post, web, HttpResponse, Responder};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::services::hub::Broadcaster;
use crate::storage::models::VolumeSnapshot;
use crate::storage::tables::{
    market_state_from_entity, volume_entity, volume_from_entity, TableStore, PARTITION,
    STATE_ROW_KEY, TABLE_STATE, TABLE_VOLUME,
};
use crate::utils::types::ApiResponse;

#[derive(Debug, Deserialize)]
pub struct HoursQuery {
    pub hours: Option<i64>,
}

#[post("/volumes")]
pub async fn post_volume(
    store: web::Data<Arc<dyn TableStore>>,
    hub: web::Data<Broadcaster>,
    snapshot: web::Json<VolumeSnapshot>,
) -> impl Responder {
    let mut snapshot = snapshot.into_inner();
    if let Err(msg) = snapshot.validate() {
        return HttpResponse::BadRequest().json(ApiResponse::<()>::err(msg));
    }

    // change_pct is derived here and only here, from the stored previous
    // close, so every consumer sees one consistent number
    match store.get(TABLE_STATE, PARTITION, STATE_ROW_KEY).await {
        Ok(Some(entity)) => {
            let state = market_state_from_entity(&entity);
            if let Some(prev_close) = state.prev_close.filter(|pc| *pc > 0.0) {
                snapshot.prev_close = Some(prev_close);
                snapshot.spy_change_pct =
                    Some((snapshot.spy_price - prev_close) / prev_close * 100.0);
            }
        }
        Ok(None) => {}
        Err(e) => log::warn!("market state unavailable for change_pct: {e}"),
    }

    if let Err(e) = store.upsert(TABLE_VOLUME, volume_entity(&snapshot)).await {
        log::error!("failed to persist volume snapshot: {e}");
        return HttpResponse::InternalServerError()
            .json(ApiResponse::<()>::err(format!("storage error: {e}")));
    }

    if let Ok(payload) = serde_json::to_value(&snapshot) {
        hub.publish("volumeUpdate", payload).await;
    }

    HttpResponse::Ok().json(json!({
        "status": "success",
        "timestamp": snapshot.timestamp.to_rfc3339(),
    }))
}

#[get("/volumes/snapshot")]
pub async fn volume_history(
    store: web::Data<Arc<dyn TableStore>>,
    query: web::Query<HoursQuery>,
) -> impl Responder {
    let hours = query.hours.unwrap_or(2);
    if !(1..=120).contains(&hours) {
        return HttpResponse::BadRequest()
            .json(ApiResponse::<()>::err("hours must be between 1 and 120"));
    }

    let cutoff = Utc::now() - Duration::hours(hours);
    match store.query(TABLE_VOLUME, PARTITION, Some(cutoff)).await {
        Ok(entities) => {
            // reversed row keys: natural order is already newest-first
            let history: Vec<VolumeSnapshot> =
                entities.iter().filter_map(volume_from_entity).collect();
            HttpResponse::Ok().json(json!({
                "hours": hours,
                "count": history.len(),
                "history": history,
            }))
        }
        Err(e) => {
            log::error!("volume history query failed: {e}");
            HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::err(format!("storage error: {e}")))
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(post_volume).service(volume_history);
}
