//! Broker-gateway seam.
//!
//! The scan loop only ever talks to the `Gateway` trait; the code that speaks
//! a real broker's wire protocol lives behind it. This build ships the paper
//! adapter (deterministic synthetic 0-DTE chain) so the whole pipeline runs
//! without a live broker session; `APP_MODE=live` requires a wire adapter and
//! refuses to start without one.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::settings::Settings;
use crate::storage::models::Side;
use crate::utils::errors::ApiError;

/// Identity of a 0-DTE contract inside the session: expiry is always today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContractKey {
    pub strike: i64,
    pub side: Side,
}

impl ContractKey {
    pub fn new(strike: i64, side: Side) -> Self {
        Self { strike, side }
    }
}

/// Opaque market-data subscription handle, owned by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Raw per-contract observation; NaN means the gateway has no value yet.
#[derive(Debug, Clone, Copy)]
pub struct GatewayQuote {
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub volume: f64,
    pub open_interest: f64,
}

/// Raw underlying read with every field the fallback chain may need.
#[derive(Debug, Clone, Copy)]
pub struct UnderlyingSnapshot {
    pub market_price: f64,
    pub last: f64,
    pub close: f64,
    pub bid: f64,
    pub ask: f64,
}

/// market price → last → close → bid/ask mid, first finite positive wins.
pub fn resolve_price(snap: &UnderlyingSnapshot) -> Option<f64> {
    for candidate in [snap.market_price, snap.last, snap.close] {
        if candidate.is_finite() && candidate > 0.0 {
            return Some(candidate);
        }
    }
    if snap.bid.is_finite() && snap.bid > 0.0 && snap.ask.is_finite() && snap.ask > 0.0 {
        return Some((snap.bid + snap.ask) / 2.0);
    }
    None
}

/// Sanitized snapshot row handed to the detector and aggregators.
#[derive(Debug, Clone, Copy)]
pub struct QuoteRow {
    pub strike: f64,
    pub side: Side,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub volume: i64,
    pub open_interest: i64,
    pub mid: f64,
}

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn connect(&self) -> Result<(), ApiError>;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;

    async fn underlying(&self) -> Result<UnderlyingSnapshot, ApiError>;

    /// Symbol resolution: does this 0-DTE contract exist upstream?
    async fn qualify(&self, key: ContractKey) -> Result<bool, ApiError>;

    async fn subscribe(&self, key: ContractKey) -> Result<SubscriptionId, ApiError>;
    async fn cancel(&self, sub: SubscriptionId) -> Result<(), ApiError>;

    /// Latest tick for an active subscription; `None` until data arrives.
    async fn quote(&self, sub: SubscriptionId) -> Result<Option<GatewayQuote>, ApiError>;
}

pub fn connect_from_settings(settings: &Settings) -> Result<Arc<dyn Gateway>, ApiError> {
    if settings.is_paper() {
        Ok(Arc::new(PaperGateway::new(500.0)))
    } else {
        Err(ApiError::Gateway(format!(
            "no live wire adapter for {}:{}; set APP_MODE=paper",
            settings.gateway_host, settings.gateway_port
        )))
    }
}

// ─── Paper adapter ────────────────────────────────────────────────────────

/// Synthetic market: the underlying oscillates around a base price, each side
/// of the chain decays exponentially from ATM, session volume grows with
/// wall-clock time and prints alternate between the bid and the ask.
pub struct PaperGateway {
    base_price: f64,
    session_open: i64,
    connected: AtomicBool,
    next_id: AtomicU64,
    subs: Mutex<HashMap<u64, ContractKey>>,
}

impl PaperGateway {
    pub fn new(base_price: f64) -> Self {
        Self {
            base_price,
            session_open: Utc::now().timestamp(),
            connected: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            subs: Mutex::new(HashMap::new()),
        }
    }

    fn price_now(&self) -> f64 {
        let elapsed = (Utc::now().timestamp() - self.session_open) as f64;
        self.base_price + 2.5 * (elapsed / 120.0).sin()
    }
}

#[async_trait]
impl Gateway for PaperGateway {
    async fn connect(&self) -> Result<(), ApiError> {
        self.connected.store(true, Ordering::SeqCst);
        log::info!("paper gateway connected (base ${:.2})", self.base_price);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.subs.lock().expect("subs lock").clear();
        log::info!("paper gateway disconnected");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn underlying(&self) -> Result<UnderlyingSnapshot, ApiError> {
        if !self.is_connected() {
            return Err(ApiError::Gateway("not connected".into()));
        }
        let price = self.price_now();
        Ok(UnderlyingSnapshot {
            market_price: price,
            last: price,
            close: self.base_price - 1.37,
            bid: price - 0.01,
            ask: price + 0.01,
        })
    }

    async fn qualify(&self, key: ContractKey) -> Result<bool, ApiError> {
        if !self.is_connected() {
            return Err(ApiError::Gateway("not connected".into()));
        }
        // strikes listed within +-50 of the base only
        Ok((key.strike as f64 - self.base_price).abs() <= 50.0)
    }

    async fn subscribe(&self, key: ContractKey) -> Result<SubscriptionId, ApiError> {
        if !self.is_connected() {
            return Err(ApiError::Gateway("not connected".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subs.lock().expect("subs lock").insert(id, key);
        Ok(SubscriptionId(id))
    }

    async fn cancel(&self, sub: SubscriptionId) -> Result<(), ApiError> {
        self.subs.lock().expect("subs lock").remove(&sub.0);
        Ok(())
    }

    async fn quote(&self, sub: SubscriptionId) -> Result<Option<GatewayQuote>, ApiError> {
        if !self.is_connected() {
            return Err(ApiError::Gateway("not connected".into()));
        }
        let key = match self.subs.lock().expect("subs lock").get(&sub.0) {
            Some(k) => *k,
            None => return Ok(None),
        };

        let now = Utc::now().timestamp();
        let price = self.price_now();
        let atm = price.round();
        let distance = match key.side {
            Side::Call => (key.strike as f64 - atm).max(0.0),
            Side::Put => (atm - key.strike as f64).max(0.0),
        };
        let mid = 6.0 * (-0.2 * distance).exp();
        let half_spread = (0.02 + mid * 0.01) / 2.0;
        let bid = (mid - half_spread).max(0.01);
        let ask = mid + half_spread;
        // prints alternate sides second by second
        let last = if (now + key.strike) % 2 == 0 { ask } else { bid };

        let elapsed = (now - self.session_open).max(0) as f64;
        let rate = (60.0 - distance * 8.0).max(2.0);
        let volume = (elapsed * rate).floor();

        Ok(Some(GatewayQuote { bid, ask, last, volume, open_interest: 0.0 }))
    }
}
