//! Signed premium flow.
//!
//! Per-contract volume deltas are classified with the Lee–Ready rule at the
//! live quote (at-ask buy, at-bid sell, inside neutral — a deliberate
//! approximation, no trade-condition codes on this feed), multiplied into
//! premium with the 100-share contract multiplier, and accumulated two ways:
//! session cumulatives per side, and one-second buckets for chart updates.
//!
//! The per-contract baseline map lives here, not in the subscription manager,
//! so a strike that leaves the ATM window and comes back resumes from its
//! prior cumulative volume.

use std::collections::HashMap;

use crate::storage::models::Side;

const CONTRACT_MULTIPLIER: f64 = 100.0;

pub struct FlowTracker {
    last_volume: HashMap<(i64, Side), i64>,
    cum_call: f64,
    cum_put: f64,
}

impl FlowTracker {
    pub fn new() -> Self {
        Self { last_volume: HashMap::new(), cum_call: 0.0, cum_put: 0.0 }
    }

    pub fn cumulatives(&self) -> (f64, f64) {
        (self.cum_call, self.cum_put)
    }

    pub fn net(&self) -> f64 {
        self.cum_call - self.cum_put
    }

    /// Session rollover: cumulative flows and baselines start from zero.
    pub fn reset(&mut self) {
        self.last_volume.clear();
        self.cum_call = 0.0;
        self.cum_put = 0.0;
    }

    /// Processes one observation and returns the per-tick `(call, put)`
    /// contribution, only the relevant side non-zero.
    pub fn on_tick(
        &mut self,
        strike: i64,
        side: Side,
        bid: f64,
        ask: f64,
        last: f64,
        volume: i64,
    ) -> (f64, f64) {
        let key = (strike, side);
        let delta = match self.last_volume.insert(key, volume) {
            Some(prev) => volume - prev,
            // first sighting seeds the baseline; the session total up to now
            // is not new flow
            None => 0,
        };

        if delta <= 0 || bid <= 0.0 || ask <= 0.0 || last <= 0.0 {
            return (0.0, 0.0);
        }

        let sign = if last >= ask {
            1.0
        } else if last <= bid {
            -1.0
        } else {
            return (0.0, 0.0); // inside the spread: neutral
        };

        let signed_premium = delta as f64 * last * CONTRACT_MULTIPLIER * sign;
        match side {
            Side::Call => {
                self.cum_call += signed_premium;
                (signed_premium, 0.0)
            }
            Side::Put => {
                self.cum_put += signed_premium;
                (0.0, signed_premium)
            }
        }
    }
}

impl Default for FlowTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClosedBucket {
    pub timestamp: i64,
    pub bucket_call: f64,
    pub bucket_put: f64,
}

/// Accumulates per-tick contributions into wall-second buckets. A bucket is
/// emitted when the first tick of the next second arrives.
pub struct FlowBucketer {
    open_second: i64,
    call: f64,
    put: f64,
}

impl FlowBucketer {
    pub fn new(now_second: i64) -> Self {
        Self { open_second: now_second, call: 0.0, put: 0.0 }
    }

    pub fn open_totals(&self) -> (f64, f64) {
        (self.call, self.put)
    }

    pub fn add(&mut self, now_second: i64, call: f64, put: f64) -> Option<ClosedBucket> {
        if now_second == self.open_second {
            self.call += call;
            self.put += put;
            return None;
        }

        let closed = ClosedBucket {
            timestamp: self.open_second,
            bucket_call: self.call,
            bucket_put: self.put,
        };
        self.open_second = now_second;
        self.call = call;
        self.put = put;
        Some(closed)
    }
}
