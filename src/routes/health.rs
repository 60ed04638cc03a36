// src/routes/health.rs
use actix_web::{get, web, HttpResponse, Responder};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::storage::models::HealthResponse;

#[get("/health")]
pub async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "healthy",
        service: "spyscan-backend",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
    })
}

#[get("/metrics")]
pub async fn metrics_text(handle: web::Data<PrometheusHandle>) -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(handle.render())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check).service(metrics_text);
}
