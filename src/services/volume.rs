//! ATM-window volume aggregation and scan-over-scan deltas.

use crate::services::gateway::QuoteRow;
use crate::storage::models::Side;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowTotals {
    pub calls_volume: i64,
    pub puts_volume: i64,
    pub calls_count: i64,
    pub puts_count: i64,
}

/// Sums per-side volume over strikes inside `[min_strike, max_strike]`.
pub fn aggregate_window(rows: &[QuoteRow], min_strike: i64, max_strike: i64) -> WindowTotals {
    let mut totals = WindowTotals::default();
    for row in rows {
        let strike = row.strike.round() as i64;
        if strike < min_strike || strike > max_strike {
            continue;
        }
        match row.side {
            Side::Call => {
                totals.calls_volume += row.volume.max(0);
                totals.calls_count += 1;
            }
            Side::Put => {
                totals.puts_volume += row.volume.max(0);
                totals.puts_count += 1;
            }
        }
    }
    totals
}

/// Scan-over-scan deltas. The clamp matters: when the window shifts and a
/// strike drops out, the aggregate can shrink, which is not negative flow.
pub struct VolumeDeltaTracker {
    prev_calls: i64,
    prev_puts: i64,
    first_scan: bool,
}

impl VolumeDeltaTracker {
    pub fn new() -> Self {
        Self { prev_calls: 0, prev_puts: 0, first_scan: true }
    }

    pub fn reset(&mut self) {
        self.prev_calls = 0;
        self.prev_puts = 0;
        self.first_scan = true;
    }

    pub fn deltas(&mut self, calls_volume: i64, puts_volume: i64) -> (i64, i64) {
        let (calls_delta, puts_delta) = if self.first_scan {
            self.first_scan = false;
            (0, 0)
        } else {
            (
                (calls_volume - self.prev_calls).max(0),
                (puts_volume - self.prev_puts).max(0),
            )
        };
        self.prev_calls = calls_volume;
        self.prev_puts = puts_volume;
        log::debug!("volume deltas: C+{calls_delta} | P+{puts_delta}");
        (calls_delta, puts_delta)
    }
}

impl Default for VolumeDeltaTracker {
    fn default() -> Self {
        Self::new()
    }
}
