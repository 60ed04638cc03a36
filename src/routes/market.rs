// src/routes/market.rs

use actix_web::{get, post, web, HttpResponse, Responder};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

use crate::services::hub::Broadcaster;
use crate::services::market_hours;
use crate::storage::models::{MarketState, MarketStatePatch, SpyMarketSnapshot};
use crate::storage::tables::{
    market_state_entity, market_state_from_entity, spy_tick_entity, TableStore, PARTITION,
    STATE_ROW_KEY, TABLE_SPY, TABLE_STATE,
};
use crate::utils::types::ApiResponse;

#[get("/api/market/state")]
pub async fn get_market_state(store: web::Data<Arc<dyn TableStore>>) -> impl Responder {
    match store.get(TABLE_STATE, PARTITION, STATE_ROW_KEY).await {
        Ok(Some(entity)) => HttpResponse::Ok().json(market_state_from_entity(&entity)),
        Ok(None) => HttpResponse::Ok().json(MarketState::default()),
        Err(e) => {
            log::error!("market state read failed: {e}");
            HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::err(format!("storage error: {e}")))
        }
    }
}

#[post("/market/state")]
pub async fn patch_market_state(
    store: web::Data<Arc<dyn TableStore>>,
    patch: web::Json<MarketStatePatch>,
) -> impl Responder {
    let patch = patch.into_inner();
    if let Err(msg) = patch.validate() {
        return HttpResponse::BadRequest().json(ApiResponse::<()>::err(msg));
    }
    if patch.is_empty() {
        return HttpResponse::BadRequest()
            .json(ApiResponse::<()>::err("patch carries no fields"));
    }

    let existing = match store.get(TABLE_STATE, PARTITION, STATE_ROW_KEY).await {
        Ok(entity) => entity,
        Err(e) => {
            log::error!("market state read failed: {e}");
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::err(format!("storage error: {e}")));
        }
    };

    let stored_close_date =
        existing.as_ref().and_then(|e| e.str_field("prev_close_date").map(String::from));
    let mut state = existing
        .as_ref()
        .map(market_state_from_entity)
        .unwrap_or_default();

    let today = market_hours::trading_date(Utc::now()).to_string();
    let mut updated_fields: Vec<&'static str> = Vec::new();
    let mut close_date_to_write: Option<&str> = None;

    // previous close is written at most once per trading day
    if let Some(prev_close) = patch.prev_close {
        let already_written_today =
            state.prev_close.is_some() && stored_close_date.as_deref() == Some(today.as_str());
        if !already_written_today {
            state.prev_close = Some(prev_close);
            close_date_to_write = Some(today.as_str());
            updated_fields.push("prev_close");
        } else {
            log::debug!("prev_close already captured for {today}; ignoring");
        }
    }

    if let Some(v) = patch.atm_center {
        state.atm_center = Some(v);
        updated_fields.push("atm_center");
    }
    if let Some(v) = patch.atm_min {
        state.atm_min = Some(v);
        updated_fields.push("atm_min");
    }
    if let Some(v) = patch.atm_max {
        state.atm_max = Some(v);
        updated_fields.push("atm_max");
    }
    if let Some(v) = patch.status {
        state.status = v;
        updated_fields.push("status");
    }
    if let Some(v) = patch.daily_high {
        state.daily_high = Some(v);
        updated_fields.push("daily_high");
    }
    if let Some(v) = patch.daily_low {
        state.daily_low = Some(v);
        updated_fields.push("daily_low");
    }

    state.last_updated_iso = Utc::now().to_rfc3339();

    if let Err(e) = store
        .upsert(TABLE_STATE, market_state_entity(&state, close_date_to_write))
        .await
    {
        log::error!("market state write failed: {e}");
        return HttpResponse::InternalServerError()
            .json(ApiResponse::<()>::err(format!("storage error: {e}")));
    }

    HttpResponse::Ok().json(json!({
        "status": "success",
        "updated_fields": updated_fields,
    }))
}

#[post("/spy-market")]
pub async fn post_spy_tick(
    store: web::Data<Arc<dyn TableStore>>,
    hub: web::Data<Broadcaster>,
    tick: web::Json<SpyMarketSnapshot>,
) -> impl Responder {
    let tick = tick.into_inner();
    if let Err(msg) = tick.validate() {
        return HttpResponse::BadRequest().json(ApiResponse::<()>::err(msg));
    }

    if let Err(e) = store.upsert(TABLE_SPY, spy_tick_entity(&tick)).await {
        log::error!("failed to persist underlying tick: {e}");
        return HttpResponse::InternalServerError()
            .json(ApiResponse::<()>::err(format!("storage error: {e}")));
    }

    hub.publish(
        "price",
        json!({ "timestamp": tick.timestamp, "price": tick.price }),
    )
    .await;

    HttpResponse::Ok().json(json!({
        "status": "success",
        "timestamp": tick.timestamp,
    }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(get_market_state)
        .service(patch_market_state)
        .service(post_spy_tick);
}
