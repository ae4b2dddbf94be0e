//! Monitor task: periodic, read-only sampling of the ring's counters.
//!
//! Never blocks the producer or consumer and never mutates shared state;
//! momentarily stale counter snapshots are acceptable for reporting.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use minstant::Instant;

use crate::metrics::{MetricsSnapshot, RateFilter, StatusSink, percent};
use crate::ring::ElasticRing;

/// Monitor task state and loop.
pub struct MonitorTask<S> {
    ring: Arc<ElasticRing>,
    sink: S,
    interval: Duration,
    started: Instant,
    last_sample: Option<Instant>,
    last_read: u64,
    last_written: u64,
    read_rate: RateFilter,
    write_rate: RateFilter,
}

impl<S: StatusSink> MonitorTask<S> {
    pub fn new(ring: Arc<ElasticRing>, sink: S, interval: Duration, started: Instant) -> Self {
        Self {
            ring,
            sink,
            interval,
            started,
            last_sample: None,
            last_read: 0,
            last_written: 0,
            read_rate: RateFilter::default(),
            write_rate: RateFilter::default(),
        }
    }

    /// Samples and publishes until the pipeline has wound down, emitting
    /// one final snapshot with the complete totals.
    pub fn run(mut self) {
        loop {
            // A failed transfer can leave bytes stranded in the ring;
            // don't wait for a drain that will never happen.
            let view = self.ring.view();
            let finished =
                self.ring.is_stopped() && (view.is_drained() || self.ring.has_failed());

            self.sample_and_publish();
            if finished {
                return;
            }
            thread::sleep(self.interval);
        }
    }

    fn sample_and_publish(&mut self) {
        let now = Instant::now();
        let (total_read, total_written) = self.ring.totals();

        if let Some(last) = self.last_sample {
            let dt = now.duration_since(last);
            self.read_rate
                .update(total_read.saturating_sub(self.last_read), dt);
            self.write_rate
                .update(total_written.saturating_sub(self.last_written), dt);
        }
        self.last_sample = Some(now);
        self.last_read = total_read;
        self.last_written = total_written;

        let view = self.ring.view();
        let committed = view.capacity as u64;
        let reserved = self.ring.max_capacity() as u64;
        let snapshot = MetricsSnapshot {
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            total_read,
            total_written,
            buffered: view.used(),
            committed,
            reserved,
            read_rate: self.read_rate.value(),
            write_rate: self.write_rate.value(),
            buffer_pct: percent(view.used(), committed),
            commit_pct: percent(committed, reserved),
        };
        self.sink.publish(&snapshot);
    }
}
