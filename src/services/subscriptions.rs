//! Dynamic ATM subscription window.
//!
//! Keeps live market-data subscriptions for every strike inside
//! `[round(price) - W, round(price) + W]` on both sides, cancelling strikes
//! that fall out and adding strikes that come in. Subscription creation is
//! rate-limited in small bursts so a window jump never floods the gateway.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::config::settings::Settings;
use crate::services::gateway::{ContractKey, Gateway, QuoteRow, SubscriptionId};
use crate::storage::models::Side;
use crate::utils::errors::ApiError;

/// New subscriptions issued per burst before pausing.
const SUBSCRIBE_BURST: usize = 10;
const INTER_REQUEST_PAUSE: Duration = Duration::from_millis(50);
const INTER_BURST_PAUSE: Duration = Duration::from_millis(200);
/// Bounded settle interval letting fresh ticks land before the snapshot.
const SETTLE_PAUSE: Duration = Duration::from_millis(300);

pub struct SubscriptionManager {
    active: BTreeMap<ContractKey, SubscriptionId>,
    settings: Settings,
}

impl SubscriptionManager {
    pub fn new(settings: Settings) -> Self {
        Self { active: BTreeMap::new(), settings }
    }

    pub fn active_keys(&self) -> Vec<ContractKey> {
        self.active.keys().copied().collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Desired window for a price: `(center, min_strike, max_strike)`.
    pub fn window_for(&self, price: f64) -> (i64, i64, i64) {
        let center = price.round() as i64;
        let w = self.settings.half_width(price);
        (center, center - w, center + w)
    }

    fn desired_set(&self, price: f64) -> BTreeSet<ContractKey> {
        let (_, lo, hi) = self.window_for(price);
        let mut desired = BTreeSet::new();
        for strike in lo..=hi {
            desired.insert(ContractKey::new(strike, Side::Call));
            desired.insert(ContractKey::new(strike, Side::Put));
        }
        desired
    }

    /// Diffs desired vs. active, applies cancels then adds, waits a bounded
    /// settle interval and materializes the snapshot of every active handle.
    pub async fn reconcile(
        &mut self,
        gateway: &dyn Gateway,
        price: f64,
    ) -> Result<Vec<QuoteRow>, ApiError> {
        let desired = self.desired_set(price);

        let to_cancel: Vec<ContractKey> = self
            .active
            .keys()
            .filter(|k| !desired.contains(*k))
            .copied()
            .collect();
        let to_add: Vec<ContractKey> = desired
            .iter()
            .filter(|k| !self.active.contains_key(*k))
            .copied()
            .collect();

        for key in &to_cancel {
            if let Some(sub) = self.active.remove(key) {
                if let Err(e) = gateway.cancel(sub).await {
                    // handle is gone either way; next reconcile starts clean
                    log::warn!("cancel {}_{} failed: {e}", key.strike, key.side.as_str());
                }
            }
        }

        let mut added = 0usize;
        for burst in to_add.chunks(SUBSCRIBE_BURST) {
            for key in burst {
                match gateway.qualify(*key).await {
                    Ok(true) => {}
                    Ok(false) => continue, // contract not listed; retried next reconcile
                    Err(e) => return Err(e),
                }
                match gateway.subscribe(*key).await {
                    Ok(sub) => {
                        self.active.insert(*key, sub);
                        added += 1;
                    }
                    Err(e) => {
                        log::warn!(
                            "subscribe {}_{} failed: {e}",
                            key.strike,
                            key.side.as_str()
                        );
                    }
                }
                tokio::time::sleep(INTER_REQUEST_PAUSE).await;
            }
            if burst.len() == SUBSCRIBE_BURST {
                tokio::time::sleep(INTER_BURST_PAUSE).await;
            }
        }

        if added > 0 {
            tokio::time::sleep(SETTLE_PAUSE).await;
        }

        if !to_cancel.is_empty() || added > 0 {
            log::info!(
                "subscriptions: {} active | window {:?} | -{} +{}",
                self.active.len(),
                self.window_for(price),
                to_cancel.len(),
                added
            );
        }

        self.snapshot(gateway).await
    }

    async fn snapshot(&self, gateway: &dyn Gateway) -> Result<Vec<QuoteRow>, ApiError> {
        let mut rows = Vec::with_capacity(self.active.len());
        for (key, sub) in &self.active {
            let quote = match gateway.quote(*sub).await? {
                Some(q) => q,
                None => continue, // nothing ticked yet
            };
            let bid = clean(quote.bid);
            let ask = clean(quote.ask);
            let mid = if bid > 0.0 && ask > 0.0 { (bid + ask) / 2.0 } else { 0.0 };
            rows.push(QuoteRow {
                strike: key.strike as f64,
                side: key.side,
                bid,
                ask,
                last: clean(quote.last),
                volume: clean(quote.volume) as i64,
                open_interest: clean(quote.open_interest) as i64,
                mid,
            });
        }
        Ok(rows)
    }
}

fn clean(v: f64) -> f64 {
    if v.is_finite() && v > 0.0 {
        v
    } else {
        0.0
    }
}
