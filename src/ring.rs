//! Elastic ring buffer: the shared state between the three pump tasks.
//!
//! A single contiguous byte region backs the ring. Positions are absolute
//! 64-bit byte counts since the last rebase; the physical offset of a
//! position `p` is `p % committed_capacity`. The producer owns `write_pos`,
//! the consumer owns `read_pos`, and both are advanced with atomic
//! fetch-add so the monitor can read consistent (if momentarily stale)
//! snapshots without locks.
//!
//! # Invariants
//!
//! - **A**: `0 <= write_pos - read_pos <= committed_capacity` at all
//!   times. The producer never writes past the committed capacity; the
//!   consumer never reads past `write_pos`.
//! - **B**: capacity only shrinks while the buffer is fully drained
//!   (`read_pos == write_pos`), the sole point where positions can be
//!   reset to zero without remapping live data.
//!
//! # Growth without corruption
//!
//! Because offsets are `position % capacity`, changing the capacity remaps
//! any position that has wrapped the region, which would corrupt buffered
//! data. Growth therefore requires the buffered span to be physically
//! contiguous (`read_pos % cap + used <= cap`); when it is, both positions
//! are rebased down by `read_pos - read_pos % cap` (a multiple of the old
//! capacity, so no physical offset changes) before the larger capacity is
//! published. A wrapped buffer simply refuses to grow and the producer
//! backpressures until the consumer unwraps it.
//!
//! # Memory ordering protocol
//!
//! - Writers of shared state publish the capacity **last** with `Release`
//!   (after committing pages and rebasing positions).
//! - Readers load the capacity **first** with `Acquire`, then `read_pos`,
//!   then `write_pos` ([`ElasticRing::view`]). Observing a new capacity
//!   therefore implies observing the rebased positions, and observing old
//!   positions pairs them with the old capacity; either combination maps
//!   every buffered byte to the same physical offset.
//! - During a growth rebase, `write_pos` is decremented before `read_pos`;
//!   a torn view can only make the buffer look emptier (or inverted, which
//!   [`RingView::used`] saturates to zero), never expose unwritten bytes.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::config::PumpConfig;
use crate::region::{Region, RegionError};
use crate::sync::Signal;
use crate::trace::{debug, trace, warn};

/// A consistent snapshot of the ring's position counters.
///
/// Produced by [`ElasticRing::view`]; see the module docs for why the load
/// order inside `view` matters.
#[derive(Debug, Clone, Copy)]
pub struct RingView {
    /// Committed capacity at the time of the snapshot.
    pub capacity: usize,
    /// Consumer position (absolute bytes consumed since the last rebase).
    pub read: u64,
    /// Producer position (absolute bytes produced since the last rebase).
    pub write: u64,
}

impl RingView {
    /// Bytes currently buffered. Saturates on torn snapshots taken during
    /// a rebase, which can only under-report.
    pub fn used(&self) -> u64 {
        self.write.saturating_sub(self.read)
    }

    /// True when the snapshot shows no buffered data.
    pub fn is_drained(&self) -> bool {
        self.read >= self.write
    }
}

/// The elastic ring buffer shared by the reader, writer and monitor tasks.
pub struct ElasticRing {
    /// The backing reservation; locked only for commit/decommit/rebase.
    region: Mutex<Region>,
    /// Cached base address of the region. Never changes.
    base: *mut u8,
    /// Committed capacity, published last on every resize.
    committed: AtomicUsize,
    read_pos: AtomicU64,
    write_pos: AtomicU64,
    /// Lifetime byte counters for reporting; never reset.
    total_read: AtomicU64,
    total_written: AtomicU64,
    /// One-shot shutdown latch. Never cleared once set.
    stop: AtomicBool,
    /// Set alongside `stop` on I/O failure (but not on clean end-of-input).
    failed: AtomicBool,
    /// Data-available handoff between producer and consumer.
    data_ready: Signal,
    initial_capacity: usize,
    min_capacity: usize,
    max_capacity: usize,
}

// SAFETY: the raw base pointer refers to the mmap'd region owned by
// `region`, which lives until the ring is dropped. Concurrent byte access
// is mediated by the SPSC protocol: the producer only touches the free
// span [write_pos, read_pos + capacity) and the consumer only touches the
// buffered span [read_pos, write_pos), with Release/Acquire position
// updates as the synchronization barrier between them.
unsafe impl Send for ElasticRing {}
unsafe impl Sync for ElasticRing {}

impl ElasticRing {
    /// Reserves the full address range and commits the initial capacity.
    ///
    /// # Errors
    ///
    /// Reservation or initial-commit failure is fatal; no task should be
    /// started if this fails.
    pub fn new(config: &PumpConfig) -> Result<Self, RegionError> {
        let mut region = Region::reserve(config.max_capacity)?;
        let max_capacity = region.reserved();
        let min_capacity = region.round_up(config.min_capacity).min(max_capacity);
        let initial_capacity = region
            .round_up(config.initial_capacity)
            .clamp(min_capacity, max_capacity);

        region.commit(initial_capacity)?;
        let base = region.as_ptr();
        debug!(
            initial_capacity,
            min_capacity, max_capacity, "ring buffer allocated"
        );

        Ok(Self {
            region: Mutex::new(region),
            base,
            committed: AtomicUsize::new(initial_capacity),
            read_pos: AtomicU64::new(0),
            write_pos: AtomicU64::new(0),
            total_read: AtomicU64::new(0),
            total_written: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            data_ready: Signal::new(),
            initial_capacity,
            min_capacity,
            max_capacity,
        })
    }

    /// Current committed capacity.
    pub fn capacity(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    /// The full reserved address-space size; capacity never exceeds this.
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Capacity committed at startup; the idle-shrink target.
    pub fn initial_capacity(&self) -> usize {
        self.initial_capacity
    }

    /// Lifetime `(bytes_read, bytes_written)` counters.
    pub fn totals(&self) -> (u64, u64) {
        (
            self.total_read.load(Ordering::Relaxed),
            self.total_written.load(Ordering::Relaxed),
        )
    }

    /// Takes a position snapshot.
    ///
    /// The load order (capacity, then read, then write) pairs with the
    /// store order on the resize paths; see the module docs.
    pub fn view(&self) -> RingView {
        let capacity = self.committed.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        RingView {
            capacity,
            read,
            write,
        }
    }

    /// True once either task has requested shutdown.
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// True when shutdown was caused by an I/O failure rather than a clean
    /// end of input.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Requests shutdown and wakes the consumer so it is never left
    /// waiting on a signal that will not come.
    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.data_ready.set();
    }

    /// Records that shutdown is due to an I/O failure.
    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    /// Blocks the consumer until data is (or may be) available.
    pub(crate) fn wait_for_data(&self) {
        self.data_ready.wait();
    }

    /// Lowers the data-available signal; consumer-only, called when fully
    /// drained. The caller must re-check positions afterwards to resolve
    /// a racing publish.
    pub(crate) fn clear_data(&self) {
        self.data_ready.clear();
    }

    /// Raises the data-available signal.
    pub(crate) fn notify_data(&self) {
        self.data_ready.set();
    }

    /// Mutable access to a committed span for the producer.
    ///
    /// # Safety
    ///
    /// The caller must be the sole producer, and `[offset, offset + len)`
    /// must lie within the free span `[write_pos % cap, ...)` so it never
    /// overlaps bytes the consumer may read (Invariant A).
    pub(crate) unsafe fn produce_slice(&self, offset: usize, len: usize) -> &mut [u8] {
        let cap = self.committed.load(Ordering::Acquire);
        assert!(
            offset + len <= cap,
            "produce span {offset}+{len} exceeds committed capacity {cap}"
        );
        // SAFETY: in-bounds per the assert; exclusivity per the contract.
        unsafe { std::slice::from_raw_parts_mut(self.base.add(offset), len) }
    }

    /// Shared access to a committed span for the consumer.
    ///
    /// # Safety
    ///
    /// The caller must be the sole consumer, and `[offset, offset + len)`
    /// must lie within the buffered span `[read_pos % cap, ...)` already
    /// published by the producer.
    pub(crate) unsafe fn consume_slice(&self, offset: usize, len: usize) -> &[u8] {
        let cap = self.committed.load(Ordering::Acquire);
        assert!(
            offset + len <= cap,
            "consume span {offset}+{len} exceeds committed capacity {cap}"
        );
        // SAFETY: in-bounds per the assert; the producer's Release publish
        // of write_pos happens-before the consumer's Acquire load of it.
        unsafe { std::slice::from_raw_parts(self.base.add(offset), len) }
    }

    /// Publishes `n` freshly produced bytes and signals the consumer.
    ///
    /// The position advance (Release) happens before the signal, so a
    /// woken consumer always observes the bytes it is told about.
    pub(crate) fn publish(&self, n: usize) {
        self.write_pos.fetch_add(n as u64, Ordering::Release);
        self.total_read.fetch_add(n as u64, Ordering::Relaxed);
        self.data_ready.set();
    }

    /// Retires `n` consumed bytes.
    pub(crate) fn consume(&self, n: usize) {
        self.read_pos.fetch_add(n as u64, Ordering::Release);
        self.total_written.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Grows the committed capacity until at least `needed` bytes fit,
    /// doubling from the current capacity and clamping at the maximum.
    ///
    /// Returns `true` when `needed <= capacity` afterwards. Returns
    /// `false` (without touching the buffer) when the buffered data has
    /// physically wrapped the region, when the capacity is already at the
    /// maximum, or when the commit fails; all three are transient
    /// backpressure conditions for the producer, never fatal.
    ///
    /// Producer-only.
    pub(crate) fn grow_to_fit(&self, needed: usize) -> bool {
        if needed <= self.capacity() {
            return true;
        }

        let mut region = self.region.lock().unwrap_or_else(PoisonError::into_inner);
        let cap = self.committed.load(Ordering::Acquire);
        if needed <= cap {
            return true;
        }

        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        let used = write.saturating_sub(read) as usize;
        let offset = (read % cap as u64) as usize;
        if offset + used > cap {
            // Buffered data wraps the physical region; growing now would
            // remap the wrapped bytes. Let the consumer unwrap it first.
            trace!(offset, used, cap, "growth deferred: buffered data wraps");
            return false;
        }

        let mut target = cap.saturating_mul(2);
        while needed > target {
            target = target.saturating_mul(2);
        }
        let target = region.round_up(target.min(self.max_capacity));
        if target <= cap {
            return false;
        }

        if let Err(_e) = region.commit(target) {
            warn!(capacity = target, error = %_e, "growth commit failed, staying at current capacity");
            return false;
        }

        // Rebase both positions down by a multiple of the old capacity so
        // no buffered byte changes physical offset. write_pos first: a
        // torn view can then only under-report the buffered span.
        let delta = read - offset as u64;
        if delta > 0 {
            self.write_pos.fetch_sub(delta, Ordering::Release);
            self.read_pos.fetch_sub(delta, Ordering::Release);
        }

        // Capacity is published last (see module docs).
        self.committed.store(target, Ordering::Release);
        debug!(from = cap, to = target, rebase = delta, "ring grown");

        needed <= target
    }

    /// Rebase-and-shrink after an idle lull. Producer-only.
    ///
    /// Fires only when the consumer has fully caught up and no publish has
    /// happened since the consumer lowered the signal (the same zero-wait
    /// probe the growth side's backpressure loop relies on). Resets both
    /// positions to zero and shrinks the capacity back to the initial
    /// size. Returns `true` if a rebase happened.
    pub(crate) fn try_idle_shrink(&self) -> bool {
        let view = self.view();
        if !view.is_drained() || view.write == 0 || self.data_ready.is_set() {
            return false;
        }

        let mut region = self.region.lock().unwrap_or_else(PoisonError::into_inner);

        // The buffer is empty and the signal is down, so the consumer is
        // parked (or about to park) and cannot advance read_pos; only this
        // thread advances write_pos. Zeroing is race-free as long as
        // write_pos is stored first: a torn view then shows read > write,
        // which reads as drained, never as phantom data.
        self.write_pos.store(0, Ordering::Release);
        self.read_pos.store(0, Ordering::Release);

        let cap = self.committed.load(Ordering::Acquire);
        if cap > self.initial_capacity {
            self.shrink_locked(&mut region, self.initial_capacity);
        }
        trace!("ring rebased after idle drain");
        true
    }

    /// Shrinks the committed capacity under the resize lock.
    ///
    /// Shared resize policy with the growth path: clamp into
    /// `[min_capacity, max_capacity]`, round to the region's granularity,
    /// no-op when nothing changes, and publish the capacity only after the
    /// backing pages have been adjusted. Only called while the buffer is
    /// drained (Invariant B).
    fn shrink_locked(&self, region: &mut Region, new_size: usize) {
        let cap = self.committed.load(Ordering::Acquire);
        let new_size = region.round_up(new_size.clamp(self.min_capacity, self.max_capacity));
        if new_size >= cap {
            return;
        }
        region.decommit(new_size, cap - new_size);
        self.committed.store(new_size, Ordering::Release);
        debug!(from = cap, to = new_size, "ring shrunk");
    }
}
