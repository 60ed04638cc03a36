//! Producer-side emitter: the scan loop hands every payload to the ingress
//! over HTTP and the ingress owns persistence and broadcast. One retry per
//! POST; a payload that still fails is logged and given up on, the next scan
//! carries fresher data anyway.

use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use crate::config::settings::Settings;
use crate::storage::models::{
    AnomaliesBatch, FlowSnapshot, MarketStatePatch, SpyMarketSnapshot, VolumeSnapshot,
};
use crate::utils::errors::ApiError;

const POST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Sink {
    http: Client,
    base: String,
}

impl Sink {
    pub fn new(settings: &Settings) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(POST_TIMEOUT).build()?;
        Ok(Self { http, base: settings.backend_url.clone() })
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<(), ApiError> {
        let url = format!("{}{}", self.base, path);
        let mut last_err: Option<ApiError> = None;

        for attempt in 0..2 {
            match self.http.post(&url).json(body).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    last_err = Some(ApiError::Other(format!(
                        "POST {path}: http {}",
                        resp.status()
                    )));
                }
                Err(e) => last_err = Some(e.into()),
            }
            if attempt == 0 {
                log::debug!("POST {path} failed; retrying once");
            }
        }
        Err(last_err.unwrap_or_else(|| ApiError::Other(format!("POST {path} failed"))))
    }

    pub async fn post_anomalies(&self, batch: &AnomaliesBatch) -> Result<(), ApiError> {
        self.post("/anomalies", batch).await
    }

    pub async fn post_volume(&self, snapshot: &VolumeSnapshot) -> Result<(), ApiError> {
        self.post("/volumes", snapshot).await
    }

    pub async fn post_flow(&self, snapshot: &FlowSnapshot) -> Result<(), ApiError> {
        self.post("/flow", snapshot).await
    }

    pub async fn post_spy_tick(&self, tick: &SpyMarketSnapshot) -> Result<(), ApiError> {
        self.post("/spy-market", tick).await
    }

    pub async fn post_market_state(&self, patch: &MarketStatePatch) -> Result<(), ApiError> {
        self.post("/market/state", patch).await
    }
}
