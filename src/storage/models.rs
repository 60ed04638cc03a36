use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Option side. The wire format uses the long names ("CALL"/"PUT").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "CALL")]
    Call,
    #[serde(rename = "PUT")]
    Put,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Call => "CALL",
            Side::Put => "PUT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "MEDIUM")]
    Medium,
    #[serde(rename = "HIGH")]
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketStatus {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "CLOSED")]
    Closed,
    #[serde(rename = "PREMARKET")]
    Premarket,
}

/// Single anomalous contract as reported by the detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_symbol")]
    pub symbol: String,
    pub strike: f64,
    pub side: Side,
    pub bid: f64,
    pub ask: f64,
    pub mid: f64,
    pub expected_price: f64,
    pub deviation_pct: f64,
    pub z_score: f64,
    pub volume: i64,
    pub open_interest: i64,
    pub severity: Severity,
}

fn default_symbol() -> String {
    "SPY".into()
}

impl Anomaly {
    pub fn validate(&self) -> Result<(), String> {
        if self.strike <= 0.0 {
            return Err("strike must be positive".into());
        }
        if self.bid < 0.0 || self.ask < 0.0 || self.mid < 0.0 {
            return Err("quote prices must be non-negative".into());
        }
        if self.volume < 0 || self.open_interest < 0 {
            return Err("volume and open_interest must be non-negative".into());
        }
        if !self.deviation_pct.is_finite() || !self.z_score.is_finite() {
            return Err("deviation_pct and z_score must be finite".into());
        }
        Ok(())
    }
}

/// Batch envelope the detector POSTs to the ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomaliesBatch {
    pub count: usize,
    pub anomalies: Vec<Anomaly>,
    pub last_scan: Option<DateTime<Utc>>,
}

impl AnomaliesBatch {
    pub fn validate(&self) -> Result<(), String> {
        if self.count != self.anomalies.len() {
            return Err(format!(
                "count {} does not match anomalies length {}",
                self.count,
                self.anomalies.len()
            ));
        }
        for a in &self.anomalies {
            a.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AtmRange {
    pub min_strike: f64,
    pub max_strike: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StrikeCounts {
    pub calls: i64,
    pub puts: i64,
}

/// Per-scan aggregate of ATM-window volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSnapshot {
    pub timestamp: DateTime<Utc>,
    pub spy_price: f64,
    pub prev_close: Option<f64>,
    pub calls_volume_atm: i64,
    pub puts_volume_atm: i64,
    pub calls_volume_delta: i64,
    pub puts_volume_delta: i64,
    pub atm_range: AtmRange,
    pub strikes_count: StrikeCounts,
    pub spy_change_pct: Option<f64>,
}

impl VolumeSnapshot {
    pub fn validate(&self) -> Result<(), String> {
        if self.spy_price <= 0.0 {
            return Err("spy_price must be positive".into());
        }
        if self.calls_volume_atm < 0 || self.puts_volume_atm < 0 {
            return Err("aggregate volumes must be non-negative".into());
        }
        if self.calls_volume_delta < 0 || self.puts_volume_delta < 0 {
            return Err("volume deltas must be non-negative".into());
        }
        if self.atm_range.min_strike > self.atm_range.max_strike {
            return Err("atm_range min must not exceed max".into());
        }
        Ok(())
    }
}

/// One-second signed-premium bucket paired with the session cumulatives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub timestamp: i64,
    pub cum_call_flow: f64,
    pub cum_put_flow: f64,
    pub net_flow: f64,
}

impl FlowSnapshot {
    pub fn validate(&self) -> Result<(), String> {
        if self.timestamp <= 0 {
            return Err("timestamp must be a positive unix second".into());
        }
        if !self.cum_call_flow.is_finite()
            || !self.cum_put_flow.is_finite()
            || !self.net_flow.is_finite()
        {
            return Err("flow values must be finite".into());
        }
        Ok(())
    }
}

/// Underlying tick posted on every scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpyMarketSnapshot {
    pub timestamp: i64,
    pub price: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: Option<f64>,
    pub volume: Option<i64>,
}

impl SpyMarketSnapshot {
    pub fn validate(&self) -> Result<(), String> {
        if self.timestamp <= 0 {
            return Err("timestamp must be a positive unix second".into());
        }
        if self.price <= 0.0 {
            return Err("price must be positive".into());
        }
        Ok(())
    }
}

/// Single mutable market-state record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketState {
    pub prev_close: Option<f64>,
    pub atm_center: Option<i64>,
    pub atm_min: Option<i64>,
    pub atm_max: Option<i64>,
    pub status: MarketStatus,
    pub daily_high: Option<f64>,
    pub daily_low: Option<f64>,
    pub last_updated_iso: String,
}

impl Default for MarketState {
    fn default() -> Self {
        Self {
            prev_close: None,
            atm_center: None,
            atm_min: None,
            atm_max: None,
            status: MarketStatus::Closed,
            daily_high: None,
            daily_low: None,
            last_updated_iso: String::new(),
        }
    }
}

/// Sparse patch accepted by POST /market/state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketStatePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_close: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atm_center: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atm_min: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atm_max: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<MarketStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_high: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_low: Option<f64>,
}

impl MarketStatePatch {
    pub fn validate(&self) -> Result<(), String> {
        for (name, v) in [
            ("prev_close", self.prev_close),
            ("daily_high", self.daily_high),
            ("daily_low", self.daily_low),
        ] {
            if let Some(x) = v {
                if !(x > 0.0) {
                    return Err(format!("{name} must be positive"));
                }
            }
        }
        if let (Some(lo), Some(hi)) = (self.atm_min, self.atm_max) {
            if lo > hi {
                return Err("atm_min must not exceed atm_max".into());
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.prev_close.is_none()
            && self.atm_center.is_none()
            && self.atm_min.is_none()
            && self.atm_max.is_none()
            && self.status.is_none()
            && self.daily_high.is_none()
            && self.daily_low.is_none()
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anomaly() -> Anomaly {
        Anomaly {
            timestamp: Utc::now(),
            symbol: "SPY".into(),
            strike: 505.0,
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

    #[test]
    fn batch_count_must_match() {
        let batch = AnomaliesBatch { count: 2, anomalies: vec![anomaly()], last_scan: None };
        assert!(batch.validate().is_err());

        let batch = AnomaliesBatch { count: 1, anomalies: vec![anomaly()], last_scan: None };
        assert!(batch.validate().is_ok());
    }

    #[test]
    fn negative_prices_rejected() {
        let mut a = anomaly();
        a.bid = -0.5;
        assert!(a.validate().is_err());
    }

    #[test]
    fn side_serializes_long_form() {
        assert_eq!(serde_json::to_string(&Side::Call).unwrap(), "\"CALL\"");
        assert_eq!(serde_json::to_string(&Side::Put).unwrap(), "\"PUT\"");
    }

    #[test]
    fn volume_snapshot_rejects_negative_delta() {
        let v = VolumeSnapshot {
            timestamp: Utc::now(),
            spy_price: 500.0,
            prev_close: Some(498.5),
            calls_volume_atm: 100,
            puts_volume_atm: 100,
            calls_volume_delta: -1,
            puts_volume_delta: 0,
            atm_range: AtmRange { min_strike: 495.0, max_strike: 505.0 },
            strikes_count: StrikeCounts { calls: 11, puts: 11 },
            spy_change_pct: None,
        };
        assert!(v.validate().is_err());
    }

    #[test]
    fn patch_empty_detection() {
        assert!(MarketStatePatch::default().is_empty());
        let p = MarketStatePatch { prev_close: Some(498.5), ..Default::default() };
        assert!(!p.is_empty());
        assert!(p.validate().is_ok());
    }
}
