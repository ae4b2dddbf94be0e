//! Sizing and reporting configuration for a pump.

use std::time::Duration;

/// Default initial committed capacity: 16 MiB.
pub const DEFAULT_INITIAL_CAPACITY: usize = 16 << 20;

/// Default minimum committed capacity: 4 MiB.
pub const DEFAULT_MIN_CAPACITY: usize = 4 << 20;

/// Default I/O block size: 1 MiB. Every read/write call against the
/// streams is bounded by this.
pub const DEFAULT_BLOCK_SIZE: usize = 1 << 20;

/// Default metrics reporting interval.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_millis(1000);

/// Fallback for `max_capacity` when available memory cannot be determined.
const FALLBACK_MAX_CAPACITY: usize = 1 << 30;

/// Sizing configuration for the elastic ring buffer and its tasks.
///
/// All capacities are rounded up to the region's paging granularity at
/// construction; see [`crate::ring::ElasticRing`].
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Committed capacity at startup (and the idle-shrink target).
    pub initial_capacity: usize,
    /// Lower bound for the committed capacity.
    pub min_capacity: usize,
    /// Upper bound for the committed capacity; the full address range
    /// reserved at startup. Defaults to half of available physical memory.
    pub max_capacity: usize,
    /// Upper bound on a single stream read or write.
    pub block_size: usize,
    /// How often the monitor samples counters and publishes a snapshot.
    pub report_interval: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            min_capacity: DEFAULT_MIN_CAPACITY,
            max_capacity: half_available_memory(),
            block_size: DEFAULT_BLOCK_SIZE,
            report_interval: DEFAULT_REPORT_INTERVAL,
        }
    }
}

impl PumpConfig {
    /// Repairs inconsistent sizing so the pump can always make progress:
    /// `min <= initial <= max` and `1 <= block_size <= max`.
    pub(crate) fn normalized(mut self) -> Self {
        self.min_capacity = self.min_capacity.max(1);
        self.max_capacity = self.max_capacity.max(self.min_capacity);
        self.initial_capacity = self
            .initial_capacity
            .clamp(self.min_capacity, self.max_capacity);
        self.block_size = self.block_size.clamp(1, self.max_capacity);
        self
    }
}

/// Half of the currently available physical memory, per `sysinfo(2)`.
fn half_available_memory() -> usize {
    let info = rustix::system::sysinfo();
    let avail = (info.freeram as u64).saturating_mul(u64::from(info.mem_unit));
    usize::try_from(avail / 2).unwrap_or(FALLBACK_MAX_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_consistent() {
        let config = PumpConfig::default().normalized();
        assert!(config.min_capacity <= config.initial_capacity);
        assert!(config.initial_capacity <= config.max_capacity);
        assert!(config.block_size >= 1);
        assert!(config.block_size <= config.max_capacity);
    }

    #[test]
    fn normalized_repairs_inverted_bounds() {
        let config = PumpConfig {
            initial_capacity: 64 << 20,
            min_capacity: 8 << 20,
            max_capacity: 4 << 20,
            block_size: 32 << 20,
            report_interval: Duration::from_millis(10),
        }
        .normalized();

        assert_eq!(config.min_capacity, 8 << 20);
        assert_eq!(config.max_capacity, 8 << 20);
        assert_eq!(config.initial_capacity, 8 << 20);
        assert_eq!(config.block_size, 8 << 20);
    }

    #[test]
    fn normalized_floors_zero_sizes() {
        let config = PumpConfig {
            initial_capacity: 0,
            min_capacity: 0,
            max_capacity: 0,
            block_size: 0,
            report_interval: Duration::ZERO,
        }
        .normalized();

        assert_eq!(config.min_capacity, 1);
        assert_eq!(config.max_capacity, 1);
        assert_eq!(config.initial_capacity, 1);
        assert_eq!(config.block_size, 1);
    }
}
