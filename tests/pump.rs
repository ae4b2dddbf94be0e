//! End-to-end pipeline tests over in-memory streams.
//!
//! Every source byte is position-derived, so the sink can verify the
//! full stream ordering byte-for-byte while capacity changes underneath
//! the transfer.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use siphon::sync::Signal;
use siphon::{MetricsSnapshot, Pump, PumpConfig, PumpError, StatusSink};

const MIB: usize = 1 << 20;

fn byte_at(pos: u64) -> u8 {
    (pos % 251) as u8
}

/// Position-addressable pseudo-random byte (splitmix64 over the word
/// index), so source and sink derive the same noise stream independently.
fn noise_at(pos: u64) -> u8 {
    let mut x = (pos >> 3).wrapping_add(0x9E37_79B9_7F4A_7C15);
    x ^= x >> 30;
    x = x.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^= x >> 31;
    (x >> ((pos & 7) * 8)) as u8
}

fn test_config(initial: usize, max: usize) -> PumpConfig {
    PumpConfig {
        initial_capacity: initial,
        min_capacity: initial,
        max_capacity: max,
        block_size: MIB,
        report_interval: Duration::from_millis(2),
    }
}

/// Deterministic byte source. Optionally stalls (without blocking the
/// calling thread for long) once `burst` bytes are out, until `resume`
/// is raised.
struct PatternSource {
    pos: u64,
    burst: u64,
    total: u64,
    resume: Option<Arc<Signal>>,
    pattern: fn(u64) -> u8,
}

impl PatternSource {
    fn new(total: u64) -> Self {
        Self {
            pos: 0,
            burst: total,
            total,
            resume: None,
            pattern: byte_at,
        }
    }

    fn noise(total: u64) -> Self {
        Self {
            pattern: noise_at,
            ..Self::new(total)
        }
    }

    fn with_pause(total: u64, burst: u64, resume: Arc<Signal>) -> Self {
        Self {
            pos: 0,
            burst,
            total,
            resume: Some(resume),
            pattern: byte_at,
        }
    }
}

impl Read for PatternSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.total {
            return Ok(0);
        }
        if self.pos == self.burst {
            if let Some(resume) = &self.resume {
                if !resume.is_set() {
                    thread::sleep(Duration::from_millis(1));
                    return Err(io::Error::from(io::ErrorKind::Interrupted));
                }
            }
        }
        // Never read across the pause boundary.
        let limit = if self.pos < self.burst {
            self.burst
        } else {
            self.total
        };
        let n = buf.len().min((limit - self.pos) as usize);
        for (i, b) in buf[..n].iter_mut().enumerate() {
            *b = (self.pattern)(self.pos + i as u64);
        }
        self.pos += n as u64;
        Ok(n)
    }
}

/// Sink that checks every byte against the source pattern. An optional
/// gate holds all writes until raised; an optional delay throttles each
/// write to simulate a slow downstream.
struct VerifySink {
    pos: u64,
    delay: Duration,
    gate: Option<Arc<Signal>>,
    pattern: fn(u64) -> u8,
}

impl VerifySink {
    fn new() -> Self {
        Self {
            pos: 0,
            delay: Duration::ZERO,
            gate: None,
            pattern: byte_at,
        }
    }

    fn throttled(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    fn noise_throttled(delay: Duration) -> Self {
        Self {
            delay,
            pattern: noise_at,
            ..Self::new()
        }
    }

    fn gated(gate: Arc<Signal>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }
}

impl Write for VerifySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        for (i, &b) in buf.iter().enumerate() {
            if b != (self.pattern)(self.pos + i as u64) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("corrupt byte at position {}", self.pos + i as u64),
                ));
            }
        }
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Captures every snapshot the monitor publishes.
#[derive(Clone)]
struct RecordingStatus(Arc<Mutex<Vec<MetricsSnapshot>>>);

impl RecordingStatus {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    fn snapshots(&self) -> Vec<MetricsSnapshot> {
        self.0.lock().expect("recorder lock").clone()
    }

    /// Polls until some prefix of the recorded snapshots satisfies the
    /// predicate; panics after `timeout`.
    fn wait_until(&self, timeout: Duration, pred: impl Fn(&[MetricsSnapshot]) -> bool) {
        let deadline = Instant::now() + timeout;
        loop {
            if pred(&self.snapshots()) {
                return;
            }
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl StatusSink for RecordingStatus {
    fn publish(&mut self, snapshot: &MetricsSnapshot) {
        self.0.lock().expect("recorder lock").push(*snapshot);
    }
}

#[test]
fn small_transfer_roundtrips() {
    let total = (8 * MIB) as u64;
    let pump = Pump::spawn(
        test_config(4 * MIB, 16 * MIB),
        PatternSource::new(total),
        VerifySink::new(),
        (),
    )
    .expect("spawn");
    let stats = pump.join().expect("transfer");
    assert_eq!(stats.bytes_read, total);
    assert_eq!(stats.bytes_written, total);
}

#[test]
fn empty_input_finishes_cleanly() {
    let pump = Pump::spawn(
        test_config(4 * MIB, 8 * MIB),
        PatternSource::new(0),
        VerifySink::new(),
        (),
    )
    .expect("spawn");
    let stats = pump.join().expect("transfer");
    assert_eq!(stats.bytes_read, 0);
    assert_eq!(stats.bytes_written, 0);
}

// Scaled-down companion of `sustained_transfer_full_scale` below, sized
// to keep the default test run fast.
#[test]
fn slow_sink_grows_buffer_within_bounds() {
    let total = (64 * MIB) as u64;
    let recorder = RecordingStatus::new();
    let pump = Pump::spawn(
        test_config(4 * MIB, 16 * MIB),
        PatternSource::new(total),
        VerifySink::throttled(Duration::from_millis(3)),
        recorder.clone(),
    )
    .expect("spawn");
    let stats = pump.join().expect("transfer");
    assert_eq!(stats.bytes_read, total);
    assert_eq!(stats.bytes_written, total);

    let snapshots = recorder.snapshots();
    assert!(!snapshots.is_empty());
    for snap in &snapshots {
        assert!(snap.committed <= (16 * MIB) as u64, "capacity ceiling breached");
        assert!(snap.buffered <= snap.committed, "occupancy above capacity");
    }
    let peak = snapshots.iter().map(|s| s.committed).max().unwrap();
    assert!(peak >= (8 * MIB) as u64, "fast source never forced growth");
    assert_eq!(snapshots.last().unwrap().total_written, total);
}

/// 100 MiB of pseudo-random bytes, 1 MiB blocks, 16 MiB ceiling, sink
/// delayed 50 ms per chunk. Takes several seconds; run with `--ignored`.
#[test]
#[ignore]
fn sustained_transfer_full_scale() {
    let total = (100 * MIB) as u64;
    let recorder = RecordingStatus::new();
    let pump = Pump::spawn(
        test_config(4 * MIB, 16 * MIB),
        PatternSource::noise(total),
        VerifySink::noise_throttled(Duration::from_millis(50)),
        recorder.clone(),
    )
    .expect("spawn");
    let stats = pump.join().expect("transfer");
    assert_eq!(stats.bytes_read, total);
    assert_eq!(stats.bytes_written, total);

    let snapshots = recorder.snapshots();
    for snap in &snapshots {
        assert!(snap.committed <= (16 * MIB) as u64, "capacity ceiling breached");
        assert!(snap.buffered <= snap.committed, "occupancy above capacity");
    }
    let peak = snapshots.iter().map(|s| s.committed).max().unwrap();
    assert!(peak > (4 * MIB) as u64, "expected at least one growth event");
    assert_eq!(snapshots.last().unwrap().total_written, total);
}

#[test]
fn full_buffer_at_max_capacity_applies_backpressure() {
    let total = (24 * MIB) as u64;
    let gate = Arc::new(Signal::new());
    let recorder = RecordingStatus::new();
    let pump = Pump::spawn(
        test_config(4 * MIB, 8 * MIB),
        PatternSource::new(total),
        VerifySink::gated(Arc::clone(&gate)),
        recorder.clone(),
    )
    .expect("spawn");

    // With the sink held shut, the source fills the ring to the ceiling
    // exactly and the producer stalls there.
    recorder.wait_until(Duration::from_secs(10), |snaps| {
        snaps
            .iter()
            .any(|s| s.committed == (8 * MIB) as u64 && s.buffered == (8 * MIB) as u64)
    });
    thread::sleep(Duration::from_millis(50));
    for snap in &recorder.snapshots() {
        assert!(snap.committed <= (8 * MIB) as u64, "grew past the ceiling");
        assert!(snap.total_read <= (8 * MIB) as u64, "read past the ceiling");
    }

    gate.set();
    let stats = pump.join().expect("transfer");
    assert_eq!(stats.bytes_read, total);
    assert_eq!(stats.bytes_written, total);
}

#[test]
fn idle_lull_shrinks_buffer_back() {
    // The 3 MiB tail fits the shrunken ring with a block to spare, so the
    // final phase cannot trigger a second growth.
    let total = (12 * MIB) as u64;
    let burst = (9 * MIB) as u64;
    let resume = Arc::new(Signal::new());
    let gate = Arc::new(Signal::new());
    let recorder = RecordingStatus::new();
    let pump = Pump::spawn(
        test_config(4 * MIB, 8 * MIB),
        PatternSource::with_pause(total, burst, Arc::clone(&resume)),
        VerifySink::gated(Arc::clone(&gate)),
        recorder.clone(),
    )
    .expect("spawn");

    // Phase 1: gated sink, so the burst grows the ring to the ceiling.
    recorder.wait_until(Duration::from_secs(10), |snaps| {
        snaps.iter().any(|s| s.committed == (8 * MIB) as u64)
    });

    // Phase 2: let the sink drain while the source idles. Once the ring
    // is empty and the signal lowered, the producer rebases and shrinks.
    gate.set();
    recorder.wait_until(Duration::from_secs(10), |snaps| {
        snaps
            .iter()
            .any(|s| s.total_read == burst && s.committed == (4 * MIB) as u64)
    });

    // Phase 3: the tail of the stream flows through the shrunken ring.
    resume.set();
    let stats = pump.join().expect("transfer");
    assert_eq!(stats.bytes_read, total);
    assert_eq!(stats.bytes_written, total);
    let last = recorder.snapshots().pop().unwrap();
    assert_eq!(last.committed, (4 * MIB) as u64);
    assert_eq!(last.total_written, total);
}

#[test]
fn repeated_growth_preserves_stream_order() {
    let total = (48 * MIB) as u64;
    let gate = Arc::new(Signal::new());
    let recorder = RecordingStatus::new();
    let pump = Pump::spawn(
        test_config(4 * MIB, 32 * MIB),
        PatternSource::new(total),
        VerifySink::gated(Arc::clone(&gate)),
        recorder.clone(),
    )
    .expect("spawn");

    // Held sink: the source forces every doubling step up to the ceiling.
    recorder.wait_until(Duration::from_secs(10), |snaps| {
        snaps.iter().any(|s| s.committed == (32 * MIB) as u64)
    });

    // Drain the 32 MiB backlog while the remaining 16 MiB stream in.
    // VerifySink fails the transfer on the first out-of-order byte, so a
    // clean join proves ordering survived every capacity change.
    gate.set();
    let stats = pump.join().expect("transfer");
    assert_eq!(stats.bytes_read, total);
    assert_eq!(stats.bytes_written, total);

    let last = *recorder.snapshots().last().unwrap();
    assert_eq!(last.committed, (32 * MIB) as u64, "expected growth to the ceiling");
    assert_eq!(last.total_written, total);
}

#[test]
fn input_failure_surfaces_after_drain() {
    struct FailingSource {
        inner: PatternSource,
        fail_at: u64,
    }

    impl Read for FailingSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inner.pos >= self.fail_at {
                return Err(io::Error::other("device unplugged"));
            }
            self.inner.read(buf)
        }
    }

    let source = FailingSource {
        inner: PatternSource::new(u64::MAX),
        fail_at: (2 * MIB) as u64,
    };
    let pump = Pump::spawn(test_config(4 * MIB, 8 * MIB), source, VerifySink::new(), ())
        .expect("spawn");
    match pump.join() {
        Err(PumpError::Input(e)) => assert_eq!(e.to_string(), "device unplugged"),
        other => panic!("expected input error, got {other:?}"),
    }
}

#[test]
fn output_failure_stops_the_producer() {
    struct BrokenSink;

    impl Write for BrokenSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("pipe closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    // More input than the ring can hold, so only the stop latch can end
    // the producer.
    let total = (64 * MIB) as u64;
    let pump = Pump::spawn(
        test_config(4 * MIB, 8 * MIB),
        PatternSource::new(total),
        BrokenSink,
        (),
    )
    .expect("spawn");
    match pump.join() {
        Err(PumpError::Output(e)) => assert_eq!(e.to_string(), "pipe closed"),
        other => panic!("expected output error, got {other:?}"),
    }
}
