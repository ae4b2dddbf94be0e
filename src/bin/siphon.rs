//! siphon: pump stdin to stdout through an elastic ring buffer, with a
//! live status line on stderr.
//!
//! # Usage
//!
//! ```sh
//! tar cf - big-dir | siphon --max 2G > /mnt/slow/archive.tar
//! ```

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::FromRawFd;
use std::process;
use std::time::Duration;

use siphon::{MetricsSnapshot, Pump, PumpConfig, PumpError, StatusSink};

const ANSI_CYAN: &str = "\x1b[1;36m";
const ANSI_GREEN: &str = "\x1b[32m";
const ANSI_YELLOW: &str = "\x1b[33m";
const ANSI_RESET: &str = "\x1b[0m";
const ANSI_CLEAR_LINE: &str = "\r\x1b[2K";

struct Options {
    config: PumpConfig,
    quiet: bool,
    json: bool,
    title: bool,
}

fn main() {
    siphon::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let opts = match parse_args(&args) {
        Ok(opts) => opts,
        Err(msg) => {
            eprintln!("siphon: {msg}");
            eprintln!("run `siphon --help` for usage");
            process::exit(2);
        }
    };

    if let Err(e) = run(opts) {
        eprintln!("siphon: {e}");
        process::exit(1);
    }
}

fn run(opts: Options) -> Result<(), PumpError> {
    // Take the raw standard stream descriptors so large blocks go straight
    // through without std's line buffering. The process exits right after
    // join, so ownership of the fds is fine to give away.
    let input = unsafe { File::from_raw_fd(0) };
    let output = unsafe { File::from_raw_fd(1) };

    let stats = if opts.quiet {
        Pump::spawn(opts.config, input, output, ())?.join()?
    } else if opts.json {
        Pump::spawn(opts.config, input, output, JsonStatus)?.join()?
    } else {
        let sink = ConsoleStatus::new(opts.title);
        Pump::spawn(opts.config, input, output, sink)?.join()?
    };

    if !opts.quiet {
        eprintln!(
            "siphon: {} in {:.1}s",
            format_bytes(stats.bytes_written as f64),
            stats.elapsed.as_secs_f64()
        );
    }
    Ok(())
}

/// Renders each snapshot as one colored status line on stderr, optionally
/// mirroring a summary into the terminal window title.
struct ConsoleStatus {
    title: bool,
}

impl ConsoleStatus {
    fn new(title: bool) -> Self {
        Self { title }
    }
}

impl StatusSink for ConsoleStatus {
    fn publish(&mut self, snap: &MetricsSnapshot) {
        let mut stderr = io::stderr().lock();
        let _ = write!(
            stderr,
            "{ANSI_CLEAR_LINE}{ANSI_CYAN}Read:{ANSI_RESET} {} {ANSI_GREEN}({}/s){ANSI_RESET} | \
             {ANSI_CYAN}Written:{ANSI_RESET} {} {ANSI_GREEN}({}/s){ANSI_RESET} | \
             {ANSI_CYAN}Buffer:{ANSI_RESET} {} | \
             {ANSI_CYAN}Mem:{ANSI_RESET} {}/{} {ANSI_YELLOW}({:.1}% committed){ANSI_RESET}",
            format_bytes(snap.total_read as f64),
            format_bytes(snap.read_rate),
            format_bytes(snap.total_written as f64),
            format_bytes(snap.write_rate),
            format_bytes(snap.buffered as f64),
            format_bytes(snap.committed as f64),
            format_bytes(snap.reserved as f64),
            snap.commit_pct,
        );
        if self.title {
            let _ = write!(
                stderr,
                "\x1b]0;siphon - {} @ {}/s | buf {:.1}% | mem {:.1}%\x07",
                format_bytes(snap.total_read as f64),
                format_bytes(snap.read_rate),
                snap.buffer_pct,
                snap.commit_pct,
            );
        }
        let _ = stderr.flush();
    }
}

impl Drop for ConsoleStatus {
    fn drop(&mut self) {
        // Leave the last status line in place.
        eprintln!();
    }
}

/// Emits one JSON object per snapshot on stderr, for scripting.
struct JsonStatus;

impl StatusSink for JsonStatus {
    fn publish(&mut self, snap: &MetricsSnapshot) {
        if let Ok(line) = serde_json::to_string(snap) {
            eprintln!("{line}");
        }
    }
}

fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut value = if bytes.is_finite() { bytes.max(0.0) } else { 0.0 };
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn parse_size(arg: &str) -> Result<usize, String> {
    let s = arg.trim();
    let (digits, multiplier) = match s.chars().last() {
        Some(c) if c.eq_ignore_ascii_case(&'k') => (&s[..s.len() - 1], 1usize << 10),
        Some(c) if c.eq_ignore_ascii_case(&'m') => (&s[..s.len() - 1], 1usize << 20),
        Some(c) if c.eq_ignore_ascii_case(&'g') => (&s[..s.len() - 1], 1usize << 30),
        Some(c) if c.eq_ignore_ascii_case(&'t') => (&s[..s.len() - 1], 1usize << 40),
        _ => (s, 1),
    };
    let n: usize = digits
        .parse()
        .map_err(|_| format!("invalid size `{arg}`"))?;
    n.checked_mul(multiplier)
        .ok_or_else(|| format!("size `{arg}` is too large"))
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut config = PumpConfig::default();
    let mut quiet = false;
    let mut json = false;
    let mut title = true;

    let mut i = 1;
    while i < args.len() {
        let take_value = |i: &mut usize| -> Result<&str, String> {
            *i += 1;
            args.get(*i)
                .map(String::as_str)
                .ok_or_else(|| format!("missing value for {}", args[*i - 1]))
        };

        match args[i].as_str() {
            "--initial" | "-i" => config.initial_capacity = parse_size(take_value(&mut i)?)?,
            "--min" => config.min_capacity = parse_size(take_value(&mut i)?)?,
            "--max" | "-m" => config.max_capacity = parse_size(take_value(&mut i)?)?,
            "--block" | "-b" => config.block_size = parse_size(take_value(&mut i)?)?,
            "--interval" | "-n" => {
                let ms: u64 = take_value(&mut i)?
                    .parse()
                    .map_err(|_| format!("invalid interval `{}`", args[i]))?;
                config.report_interval = Duration::from_millis(ms);
            }
            "--quiet" | "-q" => quiet = true,
            "--json" => json = true,
            "--no-title" => title = false,
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            arg => return Err(format!("unknown argument: {arg}")),
        }
        i += 1;
    }

    Ok(Options {
        config,
        quiet,
        json,
        title,
    })
}

fn print_usage() {
    eprintln!(
        r#"siphon - elastic ring-buffered pipe pump

USAGE:
    <producer> | siphon [OPTIONS] | <consumer>

OPTIONS:
    -i, --initial <SIZE>    Initial buffer size (default: 16M)
        --min <SIZE>        Minimum buffer size (default: 4M)
    -m, --max <SIZE>        Maximum buffer size (default: half of free RAM)
    -b, --block <SIZE>      I/O block size (default: 1M)
    -n, --interval <MS>     Status update interval in ms (default: 1000)
    -q, --quiet             No status output
        --json              One JSON snapshot per interval on stderr
        --no-title          Don't update the terminal window title
    -h, --help              Print this help message

Sizes accept K/M/G/T suffixes.

EXAMPLE:
    tar cf - src | siphon --max 2G --interval 500 > /mnt/slow/src.tar
"#
    );
}
