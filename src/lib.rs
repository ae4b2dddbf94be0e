//! siphon: an elastic ring-buffered byte pump.
//!
//! Streams bytes from an input source to an output sink through a single
//! contiguous in-memory ring buffer that grows and shrinks under load
//! without ever copying buffered data. Three threads cooperate over the
//! shared buffer:
//!
//! - **reader** pulls blocks from the input stream, growing the buffer
//!   when space is tight and shrinking it back after an idle lull;
//! - **writer** drains buffered bytes to the output sink, parking on a
//!   data-available signal when the buffer is empty;
//! - **monitor** periodically samples the position counters and publishes
//!   smoothed throughput snapshots to a [`StatusSink`].
//!
//! The buffer is backed by a reserved virtual address range
//! ([`region::Region`]) whose physical pages are committed and decommitted
//! on demand, so the base address never moves and growth is zero-copy.
//!
//! # Example
//!
//! ```no_run
//! use siphon::{Pump, PumpConfig};
//!
//! let config = PumpConfig::default();
//! let pump = Pump::spawn(config, std::io::stdin(), std::io::stdout(), ())?;
//! let stats = pump.join()?;
//! eprintln!("moved {} bytes", stats.bytes_written);
//! # Ok::<(), siphon::PumpError>(())
//! ```

pub mod config;
pub mod metrics;
pub mod pump;
pub mod region;
pub mod ring;
pub mod sync;
pub mod trace;

pub use config::PumpConfig;
pub use metrics::{MetricsSnapshot, StatusSink};
pub use pump::{Pump, PumpError, PumpStats};
pub use trace::init_tracing;
