//! Consumer task: ring buffer → output stream.
//!
//! Blocks on the data-available signal instead of polling. The signal is
//! level-persisting: the producer raises it on every publish, and this
//! task lowers it only once fully drained, re-checking positions (and the
//! stop latch) afterwards so a racing publish or shutdown is never lost.

use std::io::{self, Write};
use std::sync::Arc;

use crate::ring::ElasticRing;
use crate::trace::debug;

/// Consumer task state and loop.
pub struct WriterTask<W> {
    ring: Arc<ElasticRing>,
    output: W,
    block_size: usize,
}

impl<W: Write> WriterTask<W> {
    pub fn new(ring: Arc<ElasticRing>, output: W, block_size: usize) -> Self {
        Self {
            ring,
            output,
            block_size,
        }
    }

    /// Runs the consumer loop until the buffer is drained after a stop
    /// request, or until a write failure.
    ///
    /// # Errors
    ///
    /// Returns the write failure that stopped the transfer.
    pub fn run(mut self) -> io::Result<()> {
        let result = self.drain_loop();
        if result.is_err() {
            self.ring.mark_failed();
            self.ring.request_stop();
        }
        result
    }

    fn drain_loop(&mut self) -> io::Result<()> {
        loop {
            self.ring.wait_for_data();
            self.drain_available()?;

            let view = self.ring.view();
            if view.is_drained() {
                if self.ring.is_stopped() {
                    debug!("drained after stop, writer done");
                    return Ok(());
                }
                // Edge-triggered handoff: lower the signal, then re-check.
                // A publish or stop that raced the clear re-arms it so the
                // next wait cannot miss the wakeup.
                self.ring.clear_data();
                let view = self.ring.view();
                if !view.is_drained() || self.ring.is_stopped() {
                    self.ring.notify_data();
                }
            }
        }
    }

    /// Writes buffered bytes out until the ring is (momentarily) empty.
    fn drain_available(&mut self) -> io::Result<()> {
        loop {
            let view = self.ring.view();
            if view.is_drained() {
                return Ok(());
            }

            // Clamp at the block size, the published span, and the
            // physical end of the region, so one write never wraps.
            let offset = (view.read % view.capacity as u64) as usize;
            let chunk = self
                .block_size
                .min(view.used() as usize)
                .min(view.capacity - offset);

            // SAFETY: sole consumer; [offset, offset + chunk) lies within
            // the span published by the producer.
            let buf = unsafe { self.ring.consume_slice(offset, chunk) };
            let n = self.output.write(buf)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "output stream rejected write",
                ));
            }
            self.ring.consume(n);
        }
    }
}
