//! Pump runtime: the three-thread pipeline over one elastic ring buffer.
//!
//! # Architecture
//!
//! [`Pump::spawn`] starts three named threads sharing an
//! [`ElasticRing`](crate::ring::ElasticRing):
//!
//! - **reader**: pulls blocks from the input stream into the ring, growing
//!   it under pressure and shrinking it back after an idle lull
//!   ([`reader::ReaderTask`]).
//! - **writer**: drains the ring to the output stream, parked on the
//!   data-available signal while empty ([`writer::WriterTask`]).
//! - **monitor**: samples the counters every reporting interval and
//!   publishes smoothed snapshots to the [`StatusSink`]
//!   ([`monitor::MonitorTask`]).
//!
//! The pipeline terminates on clean end-of-input or on an I/O failure in
//! either stream task; both funnel through the ring's one-shot stop latch.
//! [`Pump::join`] waits for all three threads and reports the overall
//! outcome. The backing reservation is released when the ring (held only
//! by the joined threads and the pump) is dropped.
//!
//! A task blocked inside a stream call cannot observe the stop latch until
//! that call returns; a reader parked on a silent input stream winds down
//! at its next read, exactly like the streams it wraps.

pub mod monitor;
pub mod reader;
pub mod writer;

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;

use crate::config::PumpConfig;
use crate::metrics::StatusSink;
use crate::region::RegionError;
use crate::ring::ElasticRing;
use crate::trace::{debug, info};

use monitor::MonitorTask;
use reader::ReaderTask;
use writer::WriterTask;

/// Error starting or running the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    /// The ring buffer's address range could not be reserved or its
    /// initial capacity committed. Fatal at startup.
    #[error("failed to allocate ring buffer: {0}")]
    Buffer(#[from] RegionError),
    /// The input stream failed mid-transfer.
    #[error("input stream: {0}")]
    Input(io::Error),
    /// The output stream failed mid-transfer.
    #[error("output stream: {0}")]
    Output(io::Error),
}

/// Final transfer accounting returned by [`Pump::join`].
#[derive(Debug, Clone, Copy)]
pub struct PumpStats {
    /// Total bytes pulled from the input stream.
    pub bytes_read: u64,
    /// Total bytes pushed to the output stream.
    pub bytes_written: u64,
    /// Wall-clock duration of the transfer.
    pub elapsed: Duration,
}

/// Handle to a running pipeline.
pub struct Pump {
    ring: Arc<ElasticRing>,
    started: Instant,
    reader: Option<JoinHandle<io::Result<()>>>,
    writer: Option<JoinHandle<io::Result<()>>>,
    monitor: Option<JoinHandle<()>>,
}

impl Pump {
    /// Allocates the ring buffer and spawns the three pipeline threads.
    ///
    /// # Errors
    ///
    /// Returns [`PumpError::Buffer`] if the address-space reservation or
    /// the initial commit fails; no thread is started in that case.
    ///
    /// # Panics
    ///
    /// Panics if thread spawning fails.
    pub fn spawn<R, W, S>(
        config: PumpConfig,
        input: R,
        output: W,
        sink: S,
    ) -> Result<Self, PumpError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
        S: StatusSink,
    {
        let config = config.normalized();
        let ring = Arc::new(ElasticRing::new(&config)?);
        let started = Instant::now();
        info!(
            initial_capacity = ring.initial_capacity(),
            max_capacity = ring.max_capacity(),
            block_size = config.block_size,
            "pump starting"
        );

        debug!("spawning reader thread");
        let reader = {
            let ring = Arc::clone(&ring);
            let block_size = config.block_size;
            thread::Builder::new()
                .name("siphon-reader".into())
                .spawn(move || {
                    info!("reader thread started");
                    let result = ReaderTask::new(ring, input, block_size).run();
                    info!("reader thread exiting");
                    result
                })
                .expect("failed to spawn reader thread")
        };

        debug!("spawning writer thread");
        let writer = {
            let ring = Arc::clone(&ring);
            let block_size = config.block_size;
            thread::Builder::new()
                .name("siphon-writer".into())
                .spawn(move || {
                    info!("writer thread started");
                    let result = WriterTask::new(ring, output, block_size).run();
                    info!("writer thread exiting");
                    result
                })
                .expect("failed to spawn writer thread")
        };

        debug!("spawning monitor thread");
        let monitor = {
            let ring = Arc::clone(&ring);
            let interval = config.report_interval;
            thread::Builder::new()
                .name("siphon-monitor".into())
                .spawn(move || {
                    MonitorTask::new(ring, sink, interval, started).run();
                })
                .expect("failed to spawn monitor thread")
        };

        Ok(Self {
            ring,
            started,
            reader: Some(reader),
            writer: Some(writer),
            monitor: Some(monitor),
        })
    }

    /// Waits for all three threads and reports the pipeline outcome.
    ///
    /// # Errors
    ///
    /// Returns the first stream failure ([`PumpError::Input`] before
    /// [`PumpError::Output`]); a clean end-of-input yields `Ok` with the
    /// final byte totals.
    pub fn join(mut self) -> Result<PumpStats, PumpError> {
        let reader_result = join_io(self.reader.take());
        let writer_result = join_io(self.writer.take());
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }

        let elapsed = self.started.elapsed();
        reader_result.map_err(PumpError::Input)?;
        writer_result.map_err(PumpError::Output)?;

        let (bytes_read, bytes_written) = self.ring.totals();
        info!(bytes_read, bytes_written, "pump finished");
        Ok(PumpStats {
            bytes_read,
            bytes_written,
            elapsed,
        })
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        // A dropped handle still lets the threads finish the transfer on
        // their own; only join() observes the outcome.
        self.ring.request_stop();
    }
}

fn join_io(handle: Option<JoinHandle<io::Result<()>>>) -> io::Result<()> {
    match handle {
        Some(handle) => handle
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("task panicked"))),
        None => Ok(()),
    }
}
