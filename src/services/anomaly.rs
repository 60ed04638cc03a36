//! Pricing-anomaly detection over a chain snapshot.
//!
//! Each side is scored independently against a fitted decay curve anchored at
//! ATM; statistically cheap contracts are flagged and graded. When the curve
//! fit cannot be made to converge the side falls back to a consecutive-strike
//! statistic. Both paths flag underpriced contracts only.

use chrono::Utc;
use statrs::statistics::Statistics;

use crate::services::curve::{fit_exp_decay, DecayFit};
use crate::services::gateway::QuoteRow;
use crate::storage::models::{Anomaly, Severity, Side};

/// Minimum usable rows per side after filtering.
const MIN_ROWS: usize = 5;
/// Rows with a relative spread at or past this are too stale to score.
const MAX_RELATIVE_SPREAD: f64 = 0.5;
/// A contract must price at least this far under the curve (percent).
const MIN_DEVIATION_PCT: f64 = -10.0;

pub fn detect_anomalies(rows: &[QuoteRow], underlying: f64, threshold: f64) -> Vec<Anomaly> {
    let atm = underlying.round();

    let mut calls: Vec<&QuoteRow> = rows
        .iter()
        .filter(|r| r.side == Side::Call && r.strike >= atm)
        .collect();
    calls.sort_by(|a, b| a.strike.total_cmp(&b.strike));

    let mut puts: Vec<&QuoteRow> = rows
        .iter()
        .filter(|r| r.side == Side::Put && r.strike <= atm)
        .collect();
    puts.sort_by(|a, b| b.strike.total_cmp(&a.strike));

    let mut found = detect_side(&calls, atm, threshold);
    found.extend(detect_side(&puts, atm, threshold));
    found
}

fn detect_side(rows: &[&QuoteRow], atm: f64, threshold: f64) -> Vec<Anomaly> {
    let usable: Vec<&QuoteRow> = rows
        .iter()
        .copied()
        .filter(|r| r.mid > 0.0 && (r.ask - r.bid) / r.mid < MAX_RELATIVE_SPREAD)
        .collect();
    if usable.len() < MIN_ROWS {
        return Vec::new();
    }

    let xs: Vec<f64> = usable.iter().map(|r| (r.strike - atm).abs()).collect();
    let ys: Vec<f64> = usable.iter().map(|r| r.mid).collect();

    match fit_exp_decay(&xs, &ys) {
        Some(fit) => score_against_curve(&usable, &xs, &fit, threshold),
        None => {
            log::debug!("curve fit failed ({} rows); using neighbor statistic", usable.len());
            neighbor_statistic(&usable, threshold)
        }
    }
}

fn score_against_curve(
    rows: &[&QuoteRow],
    xs: &[f64],
    fit: &DecayFit,
    threshold: f64,
) -> Vec<Anomaly> {
    let deviations: Vec<f64> = rows
        .iter()
        .zip(xs)
        .map(|(r, &x)| {
            let expected = fit.expected(x);
            if expected > 0.0 {
                (r.mid - expected) / expected * 100.0
            } else {
                0.0
            }
        })
        .collect();

    let mean = deviations.as_slice().mean();
    let std = deviations.as_slice().std_dev();
    if !(std > 0.0) {
        return Vec::new();
    }

    let mut found = Vec::new();
    for ((row, &x), &dev) in rows.iter().zip(xs).zip(&deviations) {
        let z = (dev - mean) / std;
        if dev < MIN_DEVIATION_PCT && z < -threshold {
            found.push(build_anomaly(row, fit.expected(x), dev, z));
        }
    }
    found
}

/// Fallback when the fit diverges: z-score the signed mid change between
/// consecutive strikes walking outward from ATM and flag unusually deep
/// drops. The neighboring mid stands in for the expected price.
fn neighbor_statistic(rows: &[&QuoteRow], threshold: f64) -> Vec<Anomaly> {
    let changes: Vec<f64> = rows
        .windows(2)
        .map(|w| (w[1].mid - w[0].mid) / w[0].mid * 100.0)
        .collect();
    if changes.len() < 2 {
        return Vec::new();
    }

    let mean = changes.as_slice().mean();
    let std = changes.as_slice().std_dev();
    if !(std > 0.0) {
        return Vec::new();
    }

    let mut found = Vec::new();
    for (i, &change) in changes.iter().enumerate() {
        let z = (change - mean) / std;
        if z < -threshold && change < 0.0 {
            let row = rows[i + 1];
            found.push(build_anomaly(row, rows[i].mid, change, z));
        }
    }
    found
}

fn build_anomaly(row: &QuoteRow, expected: f64, deviation_pct: f64, z: f64) -> Anomaly {
    let severity = severity_for(z, deviation_pct);
    log::info!(
        "anomaly: {} ${:.0} dev={:.2}% z={:.2} {}",
        row.side.as_str(),
        row.strike,
        deviation_pct,
        z,
        severity.as_str()
    );
    Anomaly {
        timestamp: Utc::now(),
        symbol: "SPY".into(),
        strike: row.strike,
        side: row.side,
        bid: row.bid,
        ask: row.ask,
        mid: row.mid,
        expected_price: expected,
        deviation_pct,
        z_score: z,
        volume: row.volume,
        open_interest: row.open_interest,
        severity,
    }
}

pub fn severity_for(z: f64, deviation_pct: f64) -> Severity {
    let abs_z = z.abs();
    let abs_dev = deviation_pct.abs();
    if abs_z > 2.0 || abs_dev > 50.0 {
        Severity::High
    } else if abs_z > 1.0 || abs_dev > 30.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(strike: f64, side: Side, mid: f64) -> QuoteRow {
        let half = (0.02 + mid * 0.02) / 2.0;
        QuoteRow {
            strike,
            side,
            bid: (mid - half).max(0.01),
            ask: mid + half,
            last: mid,
            volume: 500,
            open_interest: 50,
            mid,
        }
    }

    fn call_chain(mids: &[f64]) -> Vec<QuoteRow> {
        mids.iter()
            .enumerate()
            .map(|(i, &m)| row(500.0 + i as f64, Side::Call, m))
            .collect()
    }

    const CURVE_MIDS: [f64; 10] =
        [6.00, 4.92, 4.04, 3.31, 2.72, 2.23, 1.83, 1.50, 1.23, 1.01];

    #[test]
    fn clean_curve_has_no_anomalies() {
        let rows = call_chain(&CURVE_MIDS);
        assert!(detect_anomalies(&rows, 500.0, 0.5).is_empty());
    }

    #[test]
    fn bargain_strike_is_flagged_once() {
        let mut mids = CURVE_MIDS;
        mids[5] = 1.40; // strike 505 priced far under the curve
        let rows = call_chain(&mids);

        let found = detect_anomalies(&rows, 500.0, 0.5);
        assert_eq!(found.len(), 1);
        let a = &found[0];
        assert_eq!(a.strike, 505.0);
        assert_eq!(a.side, Side::Call);
        assert!((2.0..2.35).contains(&a.expected_price), "expected {}", a.expected_price);
        assert!((-40.0..-30.0).contains(&a.deviation_pct), "dev {}", a.deviation_pct);
        assert!(a.z_score < -0.5, "z {}", a.z_score);
        assert!(a.severity >= Severity::Medium);
    }

    #[test]
    fn overpriced_strike_is_never_flagged() {
        let mut mids = CURVE_MIDS;
        mids[5] = 3.60; // rich, not cheap
        let rows = call_chain(&mids);
        let found = detect_anomalies(&rows, 500.0, 0.5);
        // the rich print itself must not come back, and anything that does is
        // on the cheap side of the dragged curve
        assert!(found.iter().all(|a| a.strike != 505.0));
        assert!(found.iter().all(|a| a.deviation_pct < MIN_DEVIATION_PCT));
    }

    #[test]
    fn thin_side_is_skipped() {
        let rows = call_chain(&CURVE_MIDS[..4]);
        assert!(detect_anomalies(&rows, 500.0, 0.5).is_empty());
    }

    #[test]
    fn wide_spreads_are_filtered_out() {
        let mut rows = call_chain(&CURVE_MIDS);
        for r in rows.iter_mut() {
            r.bid = r.mid * 0.5;
            r.ask = r.mid * 1.5; // relative spread 1.0
        }
        assert!(detect_anomalies(&rows, 500.0, 0.5).is_empty());
    }

    #[test]
    fn puts_score_toward_lower_strikes() {
        // puts decay as strikes fall below ATM; plant a bargain at 495
        let mut rows: Vec<QuoteRow> = (0..10)
            .map(|i| {
                let strike = 500.0 - i as f64;
                let mid = 6.0 * (-0.2 * i as f64).exp();
                row(strike, Side::Put, mid)
            })
            .collect();
        rows[5].mid = 1.40;
        let found = detect_anomalies(&rows, 500.0, 0.5);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].strike, 495.0);
        assert_eq!(found[0].side, Side::Put);
    }

    #[test]
    fn severity_grading_matches_contract() {
        assert_eq!(severity_for(-2.5, -20.0), Severity::High);
        assert_eq!(severity_for(-0.8, -60.0), Severity::High);
        assert_eq!(severity_for(-1.5, -20.0), Severity::Medium);
        assert_eq!(severity_for(-0.6, -35.0), Severity::Medium);
        assert_eq!(severity_for(-0.6, -15.0), Severity::Low);
    }

    #[test]
    fn neighbor_statistic_flags_deep_drop_only() {
        let rows_owned = call_chain(&[5.0, 4.5, 4.0, 1.0, 3.2, 2.9]);
        let rows: Vec<&QuoteRow> = rows_owned.iter().collect();
        let found = neighbor_statistic(&rows, 0.5);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].strike, 503.0);
        assert!(found[0].deviation_pct < 0.0);
    }
}
