// src/routes/flow.rs

use actix_web::{get, post, web, HttpResponse, Responder};
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;

use crate::routes::volumes::HoursQuery;
use crate::services::hub::Broadcaster;
use crate::storage::models::FlowSnapshot;
use crate::storage::tables::{
    flow_entity, flow_from_entity, TableStore, PARTITION, TABLE_FLOW,
};
use crate::utils::types::ApiResponse;

#[post("/flow")]
pub async fn post_flow(
    store: web::Data<Arc<dyn TableStore>>,
    hub: web::Data<Broadcaster>,
    snapshot: web::Json<FlowSnapshot>,
) -> impl Responder {
    let snapshot = snapshot.into_inner();
    if let Err(msg) = snapshot.validate() {
        return HttpResponse::BadRequest().json(ApiResponse::<()>::err(msg));
    }

    if let Err(e) = store.upsert(TABLE_FLOW, flow_entity(&snapshot)).await {
        log::error!("failed to persist flow snapshot: {e}");
        return HttpResponse::InternalServerError()
            .json(ApiResponse::<()>::err(format!("storage error: {e}")));
    }

    hub.publish(
        "flow",
        json!({
            "timestamp": snapshot.timestamp,
            "cum_call_flow": snapshot.cum_call_flow,
            "cum_put_flow": snapshot.cum_put_flow,
            "net_flow": snapshot.net_flow,
        }),
    )
    .await;

    HttpResponse::Ok().json(json!({
        "status": "success",
        "timestamp": snapshot.timestamp,
    }))
}

#[get("/flow/snapshot")]
pub async fn flow_history(
    store: web::Data<Arc<dyn TableStore>>,
    query: web::Query<HoursQuery>,
) -> impl Responder {
    let hours = query.hours.unwrap_or(72);
    if !(1..=120).contains(&hours) {
        return HttpResponse::BadRequest()
            .json(ApiResponse::<()>::err("hours must be between 1 and 120"));
    }

    let cutoff = Utc::now() - Duration::hours(hours);
    match store.query(TABLE_FLOW, PARTITION, Some(cutoff)).await {
        Ok(entities) => {
            let history: Vec<FlowSnapshot> =
                entities.iter().filter_map(flow_from_entity).collect();
            HttpResponse::Ok().json(json!({
                "hours": hours,
                "count": history.len(),
                "history": history,
            }))
        }
        Err(e) => {
            log::error!("flow history query failed: {e}");
            HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::err(format!("storage error: {e}")))
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(post_flow).service(flow_history);
}
