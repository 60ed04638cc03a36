//! Partitioned key/value table persistence.
//!
//! * `TableStore` is the seam the ingress handlers talk to.
//! * `TableServiceClient` speaks the table service's REST dialect
//!   (SharedKeyLite request signing, InsertOrMerge upserts).
//! * Row-key scheme: anomalies key ascending by `{ts_ms}_{strike}_{side}`,
//!   history tables key by `9999999999999 - ts_ms` so the service's natural
//!   row-key order returns newest rows first.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

use crate::storage::models::{
    Anomaly, AtmRange, FlowSnapshot, MarketState, Severity, Side, SpyMarketSnapshot,
    StrikeCounts, VolumeSnapshot,
};

pub const TABLE_ANOMALIES: &str = "anomalies";
pub const TABLE_VOLUME: &str = "volumehistory";
pub const TABLE_FLOW: &str = "flowhistory";
pub const TABLE_SPY: &str = "spymarket";
pub const TABLE_STATE: &str = "marketstate";

pub const PARTITION: &str = "SPY";
pub const STATE_ROW_KEY: &str = "STATE";

/// Upper bound used by the reversed-key scheme (13-digit millisecond ticks,
/// so string and numeric ordering agree).
pub const MAX_TICKS_MS: i64 = 9_999_999_999_999;

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const API_VERSION: &str = "2019-02-02";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("bad storage connection string: {0}")]
    ConnectionString(String),
    #[error("storage api error ({status}): {body}")]
    Api { status: u16, body: String },
}

/// One stored row. `fields` holds the flat user properties only; partition
/// and row key live alongside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub partition_key: String,
    pub row_key: String,
    pub fields: Map<String, Value>,
}

impl Entity {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            fields: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn f64_field(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(Value::as_f64)
    }

    pub fn i64_field(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Parses the conventional `timestamp` property (RFC 3339).
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.str_field("timestamp")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

#[async_trait]
pub trait TableStore: Send + Sync {
    /// InsertOrMerge by (table, partition, row key).
    async fn upsert(&self, table: &str, entity: Entity) -> Result<(), StorageError>;

    async fn get(&self, table: &str, pk: &str, rk: &str) -> Result<Option<Entity>, StorageError>;

    /// All rows of a partition in natural row-key order. When `since` is set,
    /// rows whose `timestamp` property parses older than it are dropped.
    async fn query(
        &self,
        table: &str,
        pk: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Entity>, StorageError>;
}

// ─── Row keys ─────────────────────────────────────────────────────────────

pub fn anomaly_row_key(ts_ms: i64, strike: f64, side: Side) -> String {
    format!("{}_{}_{}", ts_ms, strike, side.as_str())
}

/// Reversed millisecond tick so newest rows sort first in key order.
pub fn reversed_row_key(ts_ms: i64) -> String {
    (MAX_TICKS_MS - ts_ms.clamp(0, MAX_TICKS_MS)).to_string()
}

// ─── Payload ⇄ entity mapping ─────────────────────────────────────────────
// Table properties are flat, so the nested payload shapes are flattened on
// write and rebuilt on read.

pub fn anomaly_entity(a: &Anomaly) -> Entity {
    let ts_ms = a.timestamp.timestamp_millis();
    Entity::new(a.symbol.clone(), anomaly_row_key(ts_ms, a.strike, a.side))
        .with("timestamp", json!(a.timestamp.to_rfc3339()))
        .with("strike", json!(a.strike))
        .with("side", json!(a.side.as_str()))
        .with("bid", json!(a.bid))
        .with("ask", json!(a.ask))
        .with("mid", json!(a.mid))
        .with("expected_price", json!(a.expected_price))
        .with("deviation_pct", json!(a.deviation_pct))
        .with("z_score", json!(a.z_score))
        .with("volume", json!(a.volume))
        .with("open_interest", json!(a.open_interest))
        .with("severity", json!(a.severity.as_str()))
}

pub fn anomaly_from_entity(e: &Entity) -> Option<Anomaly> {
    let side = match e.str_field("side")? {
        "CALL" => Side::Call,
        "PUT" => Side::Put,
        _ => return None,
    };
    let severity = match e.str_field("severity")? {
        "HIGH" => Severity::High,
        "MEDIUM" => Severity::Medium,
        _ => Severity::Low,
    };
    Some(Anomaly {
        timestamp: e.timestamp()?,
        symbol: e.partition_key.clone(),
        strike: e.f64_field("strike")?,
        side,
        bid: e.f64_field("bid").unwrap_or(0.0),
        ask: e.f64_field("ask").unwrap_or(0.0),
        mid: e.f64_field("mid").unwrap_or(0.0),
        expected_price: e.f64_field("expected_price").unwrap_or(0.0),
        deviation_pct: e.f64_field("deviation_pct").unwrap_or(0.0),
        z_score: e.f64_field("z_score").unwrap_or(0.0),
        volume: e.i64_field("volume").unwrap_or(0),
        open_interest: e.i64_field("open_interest").unwrap_or(0),
        severity,
    })
}

pub fn volume_entity(v: &VolumeSnapshot) -> Entity {
    let ts_ms = v.timestamp.timestamp_millis();
    Entity::new(PARTITION, reversed_row_key(ts_ms))
        .with("timestamp", json!(v.timestamp.to_rfc3339()))
        .with("spy_price", json!(v.spy_price))
        .with("prev_close", json!(v.prev_close))
        .with("calls_volume_atm", json!(v.calls_volume_atm))
        .with("puts_volume_atm", json!(v.puts_volume_atm))
        .with("calls_volume_delta", json!(v.calls_volume_delta))
        .with("puts_volume_delta", json!(v.puts_volume_delta))
        .with("atm_min_strike", json!(v.atm_range.min_strike))
        .with("atm_max_strike", json!(v.atm_range.max_strike))
        .with("strikes_count_calls", json!(v.strikes_count.calls))
        .with("strikes_count_puts", json!(v.strikes_count.puts))
        .with("spy_change_pct", json!(v.spy_change_pct))
}

pub fn volume_from_entity(e: &Entity) -> Option<VolumeSnapshot> {
    Some(VolumeSnapshot {
        timestamp: e.timestamp()?,
        spy_price: e.f64_field("spy_price")?,
        prev_close: e.f64_field("prev_close"),
        calls_volume_atm: e.i64_field("calls_volume_atm").unwrap_or(0),
        puts_volume_atm: e.i64_field("puts_volume_atm").unwrap_or(0),
        calls_volume_delta: e.i64_field("calls_volume_delta").unwrap_or(0),
        puts_volume_delta: e.i64_field("puts_volume_delta").unwrap_or(0),
        atm_range: AtmRange {
            min_strike: e.f64_field("atm_min_strike").unwrap_or(0.0),
            max_strike: e.f64_field("atm_max_strike").unwrap_or(0.0),
        },
        strikes_count: StrikeCounts {
            calls: e.i64_field("strikes_count_calls").unwrap_or(0),
            puts: e.i64_field("strikes_count_puts").unwrap_or(0),
        },
        spy_change_pct: e.f64_field("spy_change_pct"),
    })
}

pub fn flow_entity(f: &FlowSnapshot) -> Entity {
    let ts = DateTime::<Utc>::from_timestamp(f.timestamp, 0).unwrap_or_else(Utc::now);
    Entity::new(PARTITION, reversed_row_key(ts.timestamp_millis()))
        .with("timestamp", json!(ts.to_rfc3339()))
        .with("timestamp_unix", json!(f.timestamp))
        .with("cum_call_flow", json!(f.cum_call_flow))
        .with("cum_put_flow", json!(f.cum_put_flow))
        .with("net_flow", json!(f.net_flow))
}

pub fn flow_from_entity(e: &Entity) -> Option<FlowSnapshot> {
    Some(FlowSnapshot {
        timestamp: e
            .i64_field("timestamp_unix")
            .or_else(|| e.timestamp().map(|t| t.timestamp()))?,
        cum_call_flow: e.f64_field("cum_call_flow").unwrap_or(0.0),
        cum_put_flow: e.f64_field("cum_put_flow").unwrap_or(0.0),
        net_flow: e.f64_field("net_flow").unwrap_or(0.0),
    })
}

pub fn spy_tick_entity(t: &SpyMarketSnapshot) -> Entity {
    let ts = DateTime::<Utc>::from_timestamp(t.timestamp, 0).unwrap_or_else(Utc::now);
    Entity::new(PARTITION, format!("{}", ts.timestamp_millis()))
        .with("timestamp", json!(ts.to_rfc3339()))
        .with("price", json!(t.price))
        .with("bid", json!(t.bid))
        .with("ask", json!(t.ask))
        .with("last", json!(t.last))
        .with("volume", json!(t.volume))
}

/// `prev_close_date` rides along inside the row to enforce the once-per-day
/// write of `prev_close`; it is not part of the API shape.
pub fn market_state_entity(s: &MarketState, prev_close_date: Option<&str>) -> Entity {
    let mut e = Entity::new(PARTITION, STATE_ROW_KEY)
        .with("prev_close", json!(s.prev_close))
        .with("atm_center", json!(s.atm_center))
        .with("atm_min", json!(s.atm_min))
        .with("atm_max", json!(s.atm_max))
        .with("status", serde_json::to_value(s.status).unwrap_or(json!("CLOSED")))
        .with("daily_high", json!(s.daily_high))
        .with("daily_low", json!(s.daily_low))
        .with("last_updated_iso", json!(s.last_updated_iso));
    if let Some(d) = prev_close_date {
        e = e.with("prev_close_date", json!(d));
    }
    e
}

pub fn market_state_from_entity(e: &Entity) -> MarketState {
    let status = match e.str_field("status") {
        Some("OPEN") => crate::storage::models::MarketStatus::Open,
        Some("PREMARKET") => crate::storage::models::MarketStatus::Premarket,
        _ => crate::storage::models::MarketStatus::Closed,
    };
    MarketState {
        prev_close: e.f64_field("prev_close"),
        atm_center: e.i64_field("atm_center"),
        atm_min: e.i64_field("atm_min"),
        atm_max: e.i64_field("atm_max"),
        status,
        daily_high: e.f64_field("daily_high"),
        daily_low: e.f64_field("daily_low"),
        last_updated_iso: e.str_field("last_updated_iso").unwrap_or_default().to_string(),
    }
}

// ─── REST client ──────────────────────────────────────────────────────────

pub struct TableServiceClient {
    account: String,
    key: Vec<u8>,
    endpoint: String,
    http: Client,
}

impl TableServiceClient {
    pub fn from_connection_string(cs: &str) -> Result<Self, StorageError> {
        let mut account = None;
        let mut key = None;
        let mut endpoint = None;
        let mut suffix = "core.windows.net".to_string();

        for part in cs.split(';').filter(|p| !p.is_empty()) {
            let (k, v) = part
                .split_once('=')
                .ok_or_else(|| StorageError::ConnectionString(format!("bad segment '{part}'")))?;
            match k {
                "AccountName" => account = Some(v.to_string()),
                "AccountKey" => key = Some(v.to_string()),
                "TableEndpoint" => endpoint = Some(v.trim_end_matches('/').to_string()),
                "EndpointSuffix" => suffix = v.to_string(),
                _ => {}
            }
        }

        let account =
            account.ok_or_else(|| StorageError::ConnectionString("AccountName missing".into()))?;
        let key_b64 =
            key.ok_or_else(|| StorageError::ConnectionString("AccountKey missing".into()))?;
        let key = general_purpose::STANDARD
            .decode(key_b64)
            .map_err(|_| StorageError::ConnectionString("AccountKey is not base64".into()))?;
        let endpoint =
            endpoint.unwrap_or_else(|| format!("https://{account}.table.{suffix}"));

        let http = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self { account, key, endpoint, http })
    }

    /// Creates the known tables; a 409 means the table already exists.
    pub async fn ensure_tables(&self) -> Result<(), StorageError> {
        for table in [TABLE_ANOMALIES, TABLE_VOLUME, TABLE_FLOW, TABLE_SPY, TABLE_STATE] {
            let resource = "Tables".to_string();
            let (date, auth) = self.auth(&resource);
            let resp = self
                .http
                .post(format!("{}/Tables", self.endpoint))
                .header("x-ms-date", date)
                .header("x-ms-version", API_VERSION)
                .header("Authorization", auth)
                .header("Accept", "application/json;odata=nometadata")
                .header("DataServiceVersion", "3.0;NetFx")
                .json(&json!({ "TableName": table }))
                .send()
                .await?;
            let status = resp.status();
            if !(status.is_success() || status == StatusCode::CONFLICT) {
                return Err(Self::api_error(status, resp).await);
            }
        }
        Ok(())
    }

    fn auth(&self, resource: &str) -> (String, String) {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let string_to_sign = format!("{}\n/{}/{}", date, self.account, resource);
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
            .expect("HMAC can take key bits of any size");
        mac.update(string_to_sign.as_bytes());
        let sig = general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        (date, format!("SharedKeyLite {}:{}", self.account, sig))
    }

    fn entity_resource(table: &str, pk: &str, rk: &str) -> String {
        format!("{table}(PartitionKey='{pk}',RowKey='{rk}')")
    }

    async fn api_error(status: StatusCode, resp: reqwest::Response) -> StorageError {
        let body = resp.text().await.unwrap_or_default();
        StorageError::Api { status: status.as_u16(), body }
    }
}

#[async_trait]
impl TableStore for TableServiceClient {
    async fn upsert(&self, table: &str, entity: Entity) -> Result<(), StorageError> {
        let resource = Self::entity_resource(table, &entity.partition_key, &entity.row_key);
        let (date, auth) = self.auth(&resource);

        let mut body = entity.fields.clone();
        body.insert("PartitionKey".into(), json!(entity.partition_key));
        body.insert("RowKey".into(), json!(entity.row_key));

        let merge = Method::from_bytes(b"MERGE").expect("MERGE is a valid method");
        let resp = self
            .http
            .request(merge, format!("{}/{}", self.endpoint, resource))
            .header("x-ms-date", date)
            .header("x-ms-version", API_VERSION)
            .header("Authorization", auth)
            .header("Accept", "application/json;odata=nometadata")
            .header("DataServiceVersion", "3.0;NetFx")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            metrics::increment_counter!("storage_operations_total",
                "operation" => "upsert", "status" => "error");
            return Err(Self::api_error(status, resp).await);
        }
        metrics::increment_counter!("storage_operations_total",
            "operation" => "upsert", "status" => "success");
        Ok(())
    }

    async fn get(&self, table: &str, pk: &str, rk: &str) -> Result<Option<Entity>, StorageError> {
        let resource = Self::entity_resource(table, pk, rk);
        let (date, auth) = self.auth(&resource);

        let resp = self
            .http
            .get(format!("{}/{}", self.endpoint, resource))
            .header("x-ms-date", date)
            .header("x-ms-version", API_VERSION)
            .header("Authorization", auth)
            .header("Accept", "application/json;odata=nometadata")
            .send()
            .await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let mut fields: Map<String, Value> = resp.json().await?;
                fields.remove("PartitionKey");
                fields.remove("RowKey");
                fields.retain(|k, _| !k.starts_with("odata.") && k != "Timestamp");
                Ok(Some(Entity { partition_key: pk.into(), row_key: rk.into(), fields }))
            }
            s => Err(Self::api_error(s, resp).await),
        }
    }

    async fn query(
        &self,
        table: &str,
        pk: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Entity>, StorageError> {
        let resource = format!("{table}()");
        let (date, auth) = self.auth(&resource);

        let resp = self
            .http
            .get(format!("{}/{}", self.endpoint, resource))
            .query(&[("$filter", format!("PartitionKey eq '{pk}'"))])
            .header("x-ms-date", date)
            .header("x-ms-version", API_VERSION)
            .header("Authorization", auth)
            .header("Accept", "application/json;odata=nometadata")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            metrics::increment_counter!("storage_operations_total",
                "operation" => "query", "status" => "error");
            return Err(Self::api_error(status, resp).await);
        }

        #[derive(Deserialize)]
        struct QueryPage {
            value: Vec<Map<String, Value>>,
        }
        let page: QueryPage = resp.json().await?;

        let mut rows: Vec<Entity> = page
            .value
            .into_iter()
            .filter_map(|mut fields| {
                let pk = fields.remove("PartitionKey")?.as_str()?.to_string();
                let rk = fields.remove("RowKey")?.as_str()?.to_string();
                fields.retain(|k, _| !k.starts_with("odata.") && k != "Timestamp");
                Some(Entity { partition_key: pk, row_key: rk, fields })
            })
            .collect();
        rows.sort_by(|a, b| a.row_key.cmp(&b.row_key));

        if let Some(cutoff) = since {
            rows.retain(|e| e.timestamp().map(|t| t >= cutoff).unwrap_or(true));
        }
        metrics::increment_counter!("storage_operations_total",
            "operation" => "query", "status" => "success");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn anomaly_key_shape() {
        let k = anomaly_row_key(1_760_000_000_123, 505.0, Side::Call);
        assert_eq!(k, "1760000000123_505_CALL");
    }

    #[test]
    fn reversed_keys_sort_newest_first() {
        let older = reversed_row_key(1_760_000_000_000);
        let newer = reversed_row_key(1_760_000_005_000);
        // natural ascending string order puts the newer row first
        assert!(newer < older);
        assert_eq!(newer.len(), older.len());
    }

    #[test]
    fn anomaly_round_trips_through_entity() {
        let a = Anomaly {
            timestamp: Utc.with_ymd_and_hms(2026, 3, 2, 15, 30, 0).unwrap(),
            symbol: "SPY".into(),
            strike: 505.0,
            side: Side::Put,
            bid: 1.1,
            ask: 1.2,
            mid: 1.15,
            expected_price: 1.8,
            deviation_pct: -36.1,
            z_score: -1.4,
            volume: 321,
            open_interest: 12,
            severity: Severity::High,
        };
        let e = anomaly_entity(&a);
        let back = anomaly_from_entity(&e).expect("round trip");
        assert_eq!(back.strike, a.strike);
        assert_eq!(back.side, a.side);
        assert_eq!(back.severity, a.severity);
        assert!((back.deviation_pct - a.deviation_pct).abs() < 1e-9);
        assert_eq!(back.timestamp, a.timestamp);
    }

    #[test]
    fn connection_string_parses_minimal_form() {
        let cs = "DefaultEndpointsProtocol=https;AccountName=acct;AccountKey=a2V5a2V5a2V5;EndpointSuffix=core.windows.net";
        let c = TableServiceClient::from_connection_string(cs).expect("parse");
        assert_eq!(c.account, "acct");
        assert_eq!(c.endpoint, "https://acct.table.core.windows.net");
    }

    #[test]
    fn connection_string_rejects_missing_key() {
        let cs = "AccountName=acct";
        assert!(TableServiceClient::from_connection_string(cs).is_err());
    }
}
