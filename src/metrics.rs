//! Throughput smoothing and the display-collaborator interface.

use std::time::Duration;

use serde::Serialize;

/// Default smoothing coefficient for the throughput low-pass filter.
pub const DEFAULT_ALPHA: f64 = 0.5;

/// Periodic metrics snapshot emitted by the monitor task.
///
/// All byte counts are lifetime totals except `buffered`, which is the
/// instantaneous ring occupancy. Rates are in bytes per second, smoothed
/// by [`RateFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Seconds since the pump started.
    pub elapsed_secs: f64,
    /// Total bytes pulled from the input stream.
    pub total_read: u64,
    /// Total bytes pushed to the output stream.
    pub total_written: u64,
    /// Bytes currently sitting in the ring buffer.
    pub buffered: u64,
    /// Committed (physically backed) ring capacity.
    pub committed: u64,
    /// Reserved address-space size; the capacity ceiling.
    pub reserved: u64,
    /// Smoothed input throughput, bytes/sec.
    pub read_rate: f64,
    /// Smoothed output throughput, bytes/sec.
    pub write_rate: f64,
    /// Ring occupancy as a percentage of the committed capacity.
    pub buffer_pct: f64,
    /// Committed capacity as a percentage of the reservation.
    pub commit_pct: f64,
}

/// The external display collaborator.
///
/// Receives one snapshot per reporting interval. Implementations own all
/// rendering and formatting; they should return well before the next
/// interval or they will skew the following sample's timing. They must
/// never touch pump state.
pub trait StatusSink: Send + 'static {
    fn publish(&mut self, snapshot: &MetricsSnapshot);
}

/// Discards snapshots; useful for quiet mode and tests.
impl StatusSink for () {
    fn publish(&mut self, _snapshot: &MetricsSnapshot) {}
}

/// Exponentially smoothed byte-rate estimate.
///
/// `filtered = alpha * filtered + (1 - alpha) * instantaneous`, where the
/// instantaneous rate is the counter delta over the sample-time delta.
/// A zero (or negative) time delta leaves the estimate unchanged.
#[derive(Debug, Clone, Copy)]
pub struct RateFilter {
    alpha: f64,
    value: f64,
}

impl RateFilter {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: 0.0 }
    }

    /// Feeds one sample and returns the updated smoothed rate.
    pub fn update(&mut self, delta_bytes: u64, dt: Duration) -> f64 {
        let secs = dt.as_secs_f64();
        if secs > 0.0 {
            let instantaneous = delta_bytes as f64 / secs;
            self.value = self.alpha * self.value + (1.0 - self.alpha) * instantaneous;
        }
        self.value
    }

    /// Current smoothed rate, bytes/sec.
    pub fn value(&self) -> f64 {
        self.value
    }
}

impl Default for RateFilter {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA)
    }
}

/// Percentage of `part` in `whole`; zero when `whole` is zero.
pub(crate) fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_converges_toward_steady_rate() {
        let mut filter = RateFilter::new(0.5);
        let dt = Duration::from_secs(1);
        assert_eq!(filter.update(100, dt), 50.0);
        assert_eq!(filter.update(100, dt), 75.0);
        assert_eq!(filter.update(100, dt), 87.5);
    }

    #[test]
    fn filter_ignores_zero_time_delta() {
        let mut filter = RateFilter::new(0.5);
        filter.update(1 << 20, Duration::from_secs(1));
        let before = filter.value();
        assert_eq!(filter.update(u64::MAX, Duration::ZERO), before);
    }

    #[test]
    fn filter_damps_bursty_samples() {
        let mut filter = RateFilter::new(0.5);
        let dt = Duration::from_secs(1);
        filter.update(1000, dt);
        let spiked = filter.update(100_000, dt);
        assert!(spiked < 100_000.0, "spike must be damped");
        let settled = filter.update(0, dt);
        assert!(settled < spiked, "lull must pull the estimate down");
    }

    #[test]
    fn percent_guards_zero_denominator() {
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(percent(1, 4), 25.0);
        assert_eq!(percent(4, 4), 100.0);
    }

    #[test]
    fn snapshot_serializes() {
        let snap = MetricsSnapshot {
            elapsed_secs: 1.5,
            total_read: 10,
            total_written: 8,
            buffered: 2,
            committed: 1 << 22,
            reserved: 1 << 24,
            read_rate: 10.0,
            write_rate: 8.0,
            buffer_pct: 0.0,
            commit_pct: 25.0,
        };
        let json = serde_json::to_string(&snap).expect("serialize");
        assert!(json.contains("\"total_read\":10"));
        assert!(json.contains("\"commit_pct\":25.0"));
    }
}
