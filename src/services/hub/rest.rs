// src/services/hub/rest.rs

use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use crate::services::hub::auth;
use crate::utils::errors::ApiError;

const BROADCAST_TIMEOUT: Duration = Duration::from_secs(5);

/// REST client for the real-time hub (serverless broadcast only). Stateless:
/// every call carries its own short-lived token.
#[derive(Clone)]
pub struct HubClient {
    endpoint: String,
    access_key: String,
    hub: String,
    http: Client,
}

impl HubClient {
    /// Parses `Endpoint=https://…;AccessKey=…;Version=1.0;`.
    pub fn from_connection_string(cs: &str, hub: &str) -> Result<Self, ApiError> {
        let mut endpoint = None;
        let mut access_key = None;
        for part in cs.split(';').filter(|p| !p.is_empty()) {
            if let Some((k, v)) = part.split_once('=') {
                match k {
                    "Endpoint" => endpoint = Some(v.trim_end_matches('/').to_string()),
                    "AccessKey" => access_key = Some(v.to_string()),
                    _ => {}
                }
            }
        }
        let endpoint = endpoint
            .ok_or_else(|| ApiError::Other("hub connection string: Endpoint missing".into()))?;
        let access_key = access_key
            .ok_or_else(|| ApiError::Other("hub connection string: AccessKey missing".into()))?;

        let http = Client::builder().timeout(BROADCAST_TIMEOUT).build()?;
        Ok(Self { endpoint, access_key, hub: hub.to_string(), http })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    pub fn hub(&self) -> &str {
        &self.hub
    }

    /// Broadcasts `{target, arguments: [payload]}` to every connected client.
    pub async fn broadcast(&self, event: &str, payload: &Value) -> Result<(), ApiError> {
        let url = format!("{}/api/v1/hubs/{}", self.endpoint, self.hub);
        let token =
            auth::service_token(&self.endpoint, &self.access_key, &self.hub, Utc::now().timestamp())?;

        let body = json!({
            "target": event,
            "arguments": [payload],
        });

        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ApiError::Other(format!(
                "hub broadcast '{event}' failed: http {}",
                resp.status()
            )));
        }
        log::debug!("hub broadcast: {event}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_string_parses() {
        let c = HubClient::from_connection_string(
            "Endpoint=https://h.service.signalr.net;AccessKey=abc123;Version=1.0;",
            "spyoptions",
        )
        .expect("parse");
        assert_eq!(c.endpoint(), "https://h.service.signalr.net");
        assert_eq!(c.access_key(), "abc123");
        assert_eq!(c.hub(), "spyoptions");
    }

    #[test]
    fn missing_access_key_is_rejected() {
        let res = HubClient::from_connection_string("Endpoint=https://h;Version=1.0;", "spyoptions");
        assert!(res.is_err());
    }
}
