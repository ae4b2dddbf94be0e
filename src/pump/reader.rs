//! Producer task: input stream → ring buffer.
//!
//! Responsibilities:
//! - Pull blocks from the input stream into the free span of the ring.
//! - Trigger growth when the next block would not fit; back off when the
//!   ring cannot grow any further (the backpressure mechanism).
//! - Rebase and shrink the ring after an idle lull.
//! - Latch shutdown on end-of-input or read failure, with a final wake so
//!   the consumer is never left waiting.

use std::io::{self, ErrorKind, Read};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::ring::ElasticRing;
use crate::trace::{debug, trace};

/// Pause between re-checks while the ring is full and cannot grow.
const BACKPRESSURE_PAUSE: Duration = Duration::from_millis(30);

/// Producer task state and loop.
pub struct ReaderTask<R> {
    ring: Arc<ElasticRing>,
    input: R,
    block_size: usize,
}

impl<R: Read> ReaderTask<R> {
    pub fn new(ring: Arc<ElasticRing>, input: R, block_size: usize) -> Self {
        Self {
            ring,
            input,
            block_size,
        }
    }

    /// Runs the producer loop until end-of-input, read failure, or a stop
    /// requested by the consumer.
    ///
    /// # Errors
    ///
    /// Returns the read failure that stopped the transfer. Clean
    /// end-of-input is `Ok`.
    pub fn run(mut self) -> io::Result<()> {
        let result = self.pump_loop();
        // Always the final wake, success or failure, so the consumer can
        // drain whatever was published and exit.
        self.ring.request_stop();
        result
    }

    fn pump_loop(&mut self) -> io::Result<()> {
        while !self.ring.is_stopped() {
            let view = self.ring.view();
            let used = view.used();

            // Idle-shrink: the consumer fully caught up and lowered the
            // signal, and nothing new has been published since.
            if view.is_drained() && view.write > 0 && self.ring.try_idle_shrink() {
                continue;
            }

            // Growth: the next block must fit without breaching
            // Invariant A. Failure to grow is transient backpressure,
            // bounded by the reserved address space, never fatal.
            let needed = used + self.block_size as u64;
            if needed > view.capacity as u64 && !self.ring.grow_to_fit(needed as usize) {
                trace!(used, capacity = view.capacity, "backpressure pause");
                thread::sleep(BACKPRESSURE_PAUSE);
                continue;
            }

            // Growth may have rebased positions and changed the capacity;
            // work from a fresh snapshot. The block is clamped at the
            // physical end of the region so a single read never wraps.
            let view = self.ring.view();
            let offset = (view.write % view.capacity as u64) as usize;
            let chunk = self.block_size.min(view.capacity - offset);

            // SAFETY: sole producer; [offset, offset + chunk) lies in the
            // free span (chunk <= block_size <= capacity - used after the
            // growth check above).
            let buf = unsafe { self.ring.produce_slice(offset, chunk) };
            match self.input.read(buf) {
                Ok(0) => {
                    debug!("end of input");
                    return Ok(());
                }
                Ok(n) => self.ring.publish(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "input read failed");
                    self.ring.mark_failed();
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}
