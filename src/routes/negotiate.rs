// src/routes/negotiate.rs

use actix_web::{get, web, HttpResponse, Responder};
use chrono::Utc;
use serde_json::json;

use crate::config::settings::Settings;
use crate::services::hub::{auth, rest::HubClient, HUB_NAME};
use crate::utils::types::ApiResponse;

/// Hands a browser client its hub URL and a one-hour access token.
#[get("/negotiate")]
pub async fn negotiate(settings: web::Data<Settings>) -> impl Responder {
    if settings.hub_connection_string.is_empty() {
        return HttpResponse::ServiceUnavailable()
            .json(ApiResponse::<()>::err("real-time hub is not configured"));
    }

    let client = match HubClient::from_connection_string(&settings.hub_connection_string, HUB_NAME)
    {
        Ok(c) => c,
        Err(e) => {
            log::error!("hub connection string invalid: {e}");
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::err("hub configuration invalid"));
        }
    };

    let token = match auth::client_token(
        client.endpoint(),
        client.access_key(),
        HUB_NAME,
        Utc::now().timestamp(),
    ) {
        Ok(t) => t,
        Err(e) => {
            log::error!("token minting failed: {e}");
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::err("token minting failed"));
        }
    };

    HttpResponse::Ok().json(json!({
        "url": auth::client_url(client.endpoint(), HUB_NAME),
        "accessToken": token,
    }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(negotiate);
}
