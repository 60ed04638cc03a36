//! Scan loop: the single-threaded driver that reads the underlying, keeps
//! the subscription window current, and pushes detector / volume / flow
//! output to the ingress once per cycle.
//!
//! Every cycle is fenced: a failed cycle is logged and the loop moves on,
//! a lost gateway triggers reconnect with backoff, and a flipped running
//! flag exits through an ordered gateway shutdown.

use chrono::{NaiveDate, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::settings::Settings;
use crate::services::anomaly::detect_anomalies;
use crate::services::flow::{FlowBucketer, FlowTracker};
use crate::services::gateway::{resolve_price, Gateway};
use crate::services::market_hours::{self, Gate};
use crate::services::sink::Sink;
use crate::services::subscriptions::SubscriptionManager;
use crate::services::volume::{aggregate_window, VolumeDeltaTracker};
use crate::storage::models::{
    AnomaliesBatch, AtmRange, FlowSnapshot, MarketStatePatch, SpyMarketSnapshot, StrikeCounts,
    VolumeSnapshot,
};
use crate::utils::errors::{ApiError, ScanError};

/// Gate sleeps are capped so clock or calendar corrections self-heal.
const GATE_SLEEP_CAP_SECS: i64 = 300;
const SHORT_SLEEP: Duration = Duration::from_secs(2);
const RECONNECT_BACKOFF_SECS: [u64; 3] = [2, 4, 8];
const RECONNECT_STEADY_SECS: u64 = 10;

pub struct ScanLoop {
    settings: Settings,
    gateway: Arc<dyn Gateway>,
    subscriptions: SubscriptionManager,
    flow: FlowTracker,
    buckets: FlowBucketer,
    volume_deltas: VolumeDeltaTracker,
    sink: Sink,
    running: Arc<AtomicBool>,
    scan_count: u64,
    anomaly_count: u64,
    session_date: Option<NaiveDate>,
    daily_high: Option<f64>,
    daily_low: Option<f64>,
}

impl ScanLoop {
    pub fn new(
        settings: Settings,
        gateway: Arc<dyn Gateway>,
        running: Arc<AtomicBool>,
    ) -> Result<Self, ApiError> {
        let sink = Sink::new(&settings)?;
        let subscriptions = SubscriptionManager::new(settings.clone());
        Ok(Self {
            settings,
            gateway,
            subscriptions,
            flow: FlowTracker::new(),
            buckets: FlowBucketer::new(Utc::now().timestamp()),
            volume_deltas: VolumeDeltaTracker::new(),
            sink,
            running,
            scan_count: 0,
            anomaly_count: 0,
            session_date: None,
            daily_high: None,
            daily_low: None,
        })
    }

    pub async fn run(mut self) {
        log::info!("============================================================");
        log::info!("SPY 0-DTE scanner starting");
        log::info!("  Gateway: {}:{} (client id {})",
            self.settings.gateway_host, self.settings.gateway_port,
            self.settings.gateway_client_id);
        log::info!("  Backend: {}", self.settings.backend_url);
        log::info!("  Anomaly threshold: {}", self.settings.anomaly_threshold);
        log::info!("  Scan interval: {}s", self.settings.scan_interval_seconds);
        log::info!("  Strike range: +-{}% (max {} strikes)",
            self.settings.strikes_range_percent, self.settings.max_strikes_limit);
        log::info!("============================================================");

        while self.running.load(Ordering::SeqCst) {
            let now = Utc::now();
            if let Gate::SleepUntil(start) = market_hours::gate(now) {
                let secs = market_hours::seconds_until_active(now).min(GATE_SLEEP_CAP_SECS);
                log::info!("market closed; next window {start}; sleeping {secs}s");
                self.sleep_with_flag(Duration::from_secs(secs.max(1) as u64)).await;
                continue;
            }

            if !self.ensure_connected().await {
                break; // running flag flipped mid-backoff
            }

            match self.cycle().await {
                Ok(()) => {}
                Err(ScanError::NoMarketData(msg)) => {
                    log::info!("skipping scan: {msg}");
                    self.sleep_with_flag(SHORT_SLEEP).await;
                    continue;
                }
                Err(e) => {
                    let kind = match &e {
                        ScanError::Api(ApiError::Gateway(_)) => "gateway",
                        ScanError::Api(ApiError::Http(_)) => "http",
                        ScanError::Api(_) => "api",
                        ScanError::Disconnected(_) => "gateway",
                        ScanError::NoMarketData(_) => "market_data",
                    };
                    metrics::increment_counter!("scan_errors_total", "kind" => kind);
                    log::error!("scan cycle failed: {e}");
                }
            }

            self.sleep_with_flag(Duration::from_secs(self.settings.scan_interval_seconds))
                .await;
        }

        log::info!("shutting down scanner...");
        self.gateway.disconnect().await;
        log::info!(
            "final stats: {} scans, {} anomalies detected",
            self.scan_count,
            self.anomaly_count
        );
    }

    async fn cycle(&mut self) -> Result<(), ScanError> {
        let started = Instant::now();
        self.scan_count += 1;
        log::info!("scan #{}", self.scan_count);

        let underlying = self.gateway.underlying().await?;
        let price = resolve_price(&underlying)
            .ok_or_else(|| ScanError::NoMarketData("underlying price unresolved".into()))?;
        metrics::gauge!("spy_price", price);

        self.roll_session_if_needed(underlying.close).await;
        self.daily_high = Some(self.daily_high.map_or(price, |h| h.max(price)));
        self.daily_low = Some(self.daily_low.map_or(price, |l| l.min(price)));

        let snapshot = self.subscriptions.reconcile(self.gateway.as_ref(), price).await?;
        let valid: Vec<_> = snapshot
            .iter()
            .copied()
            .filter(|r| r.bid > 0.0 || r.ask > 0.0 || r.mid > 0.0)
            .collect();
        if valid.is_empty() {
            return Err(ScanError::NoMarketData("empty chain snapshot".into()));
        }
        log::info!("snapshot: {} contracts ({} valid)", snapshot.len(), valid.len());

        // 1) anomalies
        let anomalies = detect_anomalies(&valid, price, self.settings.anomaly_threshold);
        for a in &anomalies {
            metrics::increment_counter!("anomalies_detected_total",
                "severity" => a.severity.as_str());
        }
        if !anomalies.is_empty() {
            self.anomaly_count += anomalies.len() as u64;
            let batch = AnomaliesBatch {
                count: anomalies.len(),
                anomalies: anomalies.clone(),
                last_scan: Some(Utc::now()),
            };
            if let Err(e) = self.sink.post_anomalies(&batch).await {
                log::error!("failed to report {} anomalies: {e}", batch.count);
            }
        }

        // 2) volume snapshot
        let (center, lo, hi) = self.subscriptions.window_for(price);
        let totals = aggregate_window(&valid, lo, hi);
        let (calls_delta, puts_delta) =
            self.volume_deltas.deltas(totals.calls_volume, totals.puts_volume);
        let volume_snapshot = VolumeSnapshot {
            timestamp: Utc::now(),
            spy_price: price,
            prev_close: positive(underlying.close),
            calls_volume_atm: totals.calls_volume,
            puts_volume_atm: totals.puts_volume,
            calls_volume_delta: calls_delta,
            puts_volume_delta: puts_delta,
            atm_range: AtmRange { min_strike: lo as f64, max_strike: hi as f64 },
            strikes_count: StrikeCounts { calls: totals.calls_count, puts: totals.puts_count },
            // the ingress owns change_pct; it knows the stored previous close
            spy_change_pct: None,
        };
        if let Err(e) = self.sink.post_volume(&volume_snapshot).await {
            log::error!("failed to post volume snapshot: {e}");
        }

        // 3) signed flow
        let now_second = Utc::now().timestamp();
        for row in &valid {
            let (call_contrib, put_contrib) = self.flow.on_tick(
                row.strike.round() as i64,
                row.side,
                row.bid,
                row.ask,
                row.last,
                row.volume,
            );
            if let Some(closed) = self.buckets.add(now_second, call_contrib, put_contrib) {
                let (cum_call, cum_put) = self.flow.cumulatives();
                let flow_snapshot = FlowSnapshot {
                    timestamp: closed.timestamp,
                    cum_call_flow: cum_call,
                    cum_put_flow: cum_put,
                    net_flow: self.flow.net(),
                };
                if let Err(e) = self.sink.post_flow(&flow_snapshot).await {
                    log::error!("failed to post flow snapshot: {e}");
                }
            }
        }

        // 4) underlying tick + market state
        let tick = SpyMarketSnapshot {
            timestamp: now_second,
            price,
            bid: positive(underlying.bid),
            ask: positive(underlying.ask),
            last: positive(underlying.last),
            volume: None,
        };
        if let Err(e) = self.sink.post_spy_tick(&tick).await {
            log::error!("failed to post underlying tick: {e}");
        }

        let state_patch = MarketStatePatch {
            prev_close: None, // written once per day at session roll
            atm_center: Some(center),
            atm_min: Some(lo),
            atm_max: Some(hi),
            status: Some(market_hours::market_status(Utc::now())),
            daily_high: self.daily_high,
            daily_low: self.daily_low,
        };
        if let Err(e) = self.sink.post_market_state(&state_patch).await {
            log::error!("failed to post market state: {e}");
        }

        let elapsed = started.elapsed().as_secs_f64();
        metrics::histogram!("scan_duration_seconds", elapsed);
        log::info!(
            "scan #{} done in {:.2}s | anomalies {} (session {})",
            self.scan_count,
            elapsed,
            anomalies.len(),
            self.anomaly_count
        );
        Ok(())
    }

    /// New trading date: reset session-scoped state and report the previous
    /// close once. The ingress guards the write-once on its side too.
    async fn roll_session_if_needed(&mut self, close: f64) {
        let today = market_hours::trading_date(Utc::now());
        if self.session_date == Some(today) {
            return;
        }
        log::info!("session roll to {today}; resetting session state");
        self.session_date = Some(today);
        self.flow.reset();
        self.volume_deltas.reset();
        self.buckets = FlowBucketer::new(Utc::now().timestamp());
        self.daily_high = None;
        self.daily_low = None;

        if let Some(prev_close) = positive(close) {
            let patch = MarketStatePatch { prev_close: Some(prev_close), ..Default::default() };
            if let Err(e) = self.sink.post_market_state(&patch).await {
                log::error!("failed to report previous close: {e}");
            }
        }
    }

    async fn ensure_connected(&self) -> bool {
        if self.gateway.is_connected() {
            metrics::gauge!("gateway_connected", 1.0);
            return true;
        }
        metrics::gauge!("gateway_connected", 0.0);

        let mut attempt = 0usize;
        while self.running.load(Ordering::SeqCst) {
            log::warn!("gateway down; reconnect attempt {}", attempt + 1);
            match self.gateway.connect().await {
                Ok(()) => {
                    log::info!("gateway reconnected");
                    metrics::gauge!("gateway_connected", 1.0);
                    return true;
                }
                Err(e) => {
                    let backoff = RECONNECT_BACKOFF_SECS
                        .get(attempt)
                        .copied()
                        .unwrap_or(RECONNECT_STEADY_SECS);
                    log::error!("gateway connect failed: {e}; retrying in {backoff}s");
                    attempt += 1;
                    self.sleep_with_flag(Duration::from_secs(backoff)).await;
                }
            }
        }
        false
    }

    /// Sleep in small slices so a shutdown request is honored promptly.
    async fn sleep_with_flag(&self, total: Duration) {
        let slice = Duration::from_millis(250);
        let mut remaining = total;
        while self.running.load(Ordering::SeqCst) && remaining > Duration::ZERO {
            let step = remaining.min(slice);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
    }
}

fn positive(v: f64) -> Option<f64> {
    (v.is_finite() && v > 0.0).then_some(v)
}
