use dotenv::dotenv;
use std::collections::hash_map::DefaultHasher;
use std::env;
use std::hash::{Hash, Hasher};

/// Half-width of the ATM window is never allowed past this many strikes,
/// whatever the env says.
pub const HARD_MAX_HALF_WIDTH: i64 = 10;

/// STRIKES_RANGE_PERCENT is clamped to this ceiling.
pub const MAX_RANGE_PERCENT: f64 = 5.0;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_port: u16,
    pub gateway_host: String,
    pub gateway_port: u16,
    pub gateway_client_id: i32,
    pub app_mode: String,
    pub backend_url: String,
    pub anomaly_threshold: f64,
    pub scan_interval_seconds: u64,
    pub strikes_range_percent: f64,
    pub max_strikes_limit: i64,
    pub hub_connection_string: String,
    pub storage_connection_string: String,
}

impl Settings {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        dotenv().ok(); // loads `.env` file automatically

        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "8000".into())
            .parse::<u16>()
            .map_err(|_| "SERVER_PORT must be a valid u16")?;

        let gateway_host = env::var("IBKR_HOST").unwrap_or_else(|_| "127.0.0.1".into());
        let gateway_port = env::var("IBKR_PORT")
            .unwrap_or_else(|_| "4002".into())
            .parse::<u16>()
            .map_err(|_| "IBKR_PORT must be a valid u16")?;

        let app_mode = env::var("APP_MODE")
            .unwrap_or_else(|_| "paper".into())
            .to_lowercase();
        if app_mode != "paper" && app_mode != "live" {
            return Err("APP_MODE must be 'paper' or 'live'".into());
        }

        let backend_url = env::var("BACKEND_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8000".into())
            .trim_end_matches('/')
            .to_string();

        let anomaly_threshold = env::var("ANOMALY_THRESHOLD")
            .unwrap_or_else(|_| "0.5".into())
            .parse::<f64>()
            .map_err(|_| "ANOMALY_THRESHOLD must be a number")?;
        if !(anomaly_threshold > 0.0) {
            return Err("ANOMALY_THRESHOLD must be positive".into());
        }

        let scan_interval_seconds = env::var("SCAN_INTERVAL_SECONDS")
            .unwrap_or_else(|_| "5".into())
            .parse::<u64>()
            .map_err(|_| "SCAN_INTERVAL_SECONDS must be an integer")?
            .max(1);

        let strikes_range_percent = env::var("STRIKES_RANGE_PERCENT")
            .unwrap_or_else(|_| "1.0".into())
            .parse::<f64>()
            .map_err(|_| "STRIKES_RANGE_PERCENT must be a number")?;
        if !(strikes_range_percent > 0.0) {
            return Err("STRIKES_RANGE_PERCENT must be positive".into());
        }
        let strikes_range_percent = strikes_range_percent.min(MAX_RANGE_PERCENT);

        let max_strikes_limit = env::var("MAX_STRIKES_LIMIT")
            .unwrap_or_else(|_| "5".into())
            .parse::<i64>()
            .map_err(|_| "MAX_STRIKES_LIMIT must be an integer")?
            .clamp(1, HARD_MAX_HALF_WIDTH);

        let hub_connection_string =
            env::var("SIGNALR_CONNECTION_STRING").unwrap_or_default();
        let storage_connection_string =
            env::var("STORAGE_CONNECTION_STRING").unwrap_or_default();

        Ok(Self {
            server_port,
            gateway_host,
            gateway_port,
            gateway_client_id: derive_client_id(),
            app_mode,
            backend_url,
            anomaly_threshold,
            scan_interval_seconds,
            strikes_range_percent,
            max_strikes_limit,
            hub_connection_string,
            storage_connection_string,
        })
    }

    pub fn is_paper(&self) -> bool {
        self.app_mode == "paper"
    }

    /// ATM half-width for the current underlying price: the percent range
    /// converted to whole strikes, bounded by MAX_STRIKES_LIMIT and the hard cap.
    pub fn half_width(&self, price: f64) -> i64 {
        let from_pct = (price * self.strikes_range_percent / 100.0).round() as i64;
        from_pct.min(self.max_strikes_limit).clamp(1, HARD_MAX_HALF_WIDTH)
    }
}

/// Stable per-host gateway client id so replicas never collide.
fn derive_client_id() -> i32 {
    let host = env::var("HOSTNAME").unwrap_or_else(|_| "spyscan-0".into());
    let mut h = DefaultHasher::new();
    host.hash(&mut h);
    (h.finish() % 1000) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> Settings {
        Settings {
            server_port: 8000,
            gateway_host: "127.0.0.1".into(),
            gateway_port: 4002,
            gateway_client_id: 7,
            app_mode: "paper".into(),
            backend_url: "http://127.0.0.1:8000".into(),
            anomaly_threshold: 0.5,
            scan_interval_seconds: 5,
            strikes_range_percent: 1.0,
            max_strikes_limit: 5,
            hub_connection_string: String::new(),
            storage_connection_string: String::new(),
        }
    }

    #[test]
    fn half_width_default_is_five() {
        let s = fixture();
        assert_eq!(s.half_width(500.0), 5);
    }

    #[test]
    fn half_width_shrinks_with_cheap_underlying() {
        let s = fixture();
        // 1% of 280 is ~3 strikes
        assert_eq!(s.half_width(280.0), 3);
    }

    #[test]
    fn half_width_never_exceeds_hard_cap() {
        let mut s = fixture();
        s.max_strikes_limit = HARD_MAX_HALF_WIDTH;
        s.strikes_range_percent = 5.0;
        assert_eq!(s.half_width(1000.0), HARD_MAX_HALF_WIDTH);
    }

    #[test]
    fn client_id_is_bounded() {
        let id = derive_client_id();
        assert!((0..1000).contains(&id));
    }
}
