//! planstat-seginfod - segment memory reporter.
//!
//! Samples the segment's memory figures from /proc and sends a segment-info
//! datagram to the local monitoring listener every `segment_interval`.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use planstat_core::config::{ConfigError, InstrumentConfig};
use planstat_core::fmt::{FmtStyle, format_bytes, format_ms};
use planstat_core::fs::RealFs;
use planstat_core::plan::{DISPATCHER_SEGMENT, SegmentId};
use planstat_core::seginfo::{MeminfoVmem, SegmentInfoSender, VmemSource};

/// Segment memory reporter.
#[derive(Parser, Debug)]
#[command(name = "planstat-seginfod", about = "Segment memory reporter", version)]
struct Args {
    /// Database id of this segment instance.
    #[arg(long, default_value_t = 1)]
    dbid: i32,

    /// Content id of this segment (-1 for the dispatcher).
    #[arg(long, default_value_t = DISPATCHER_SEGMENT, allow_hyphen_values = true)]
    segid: SegmentId,

    /// Send period in milliseconds. Overrides PLANSTAT_SEGMENT_INTERVAL_MS.
    #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
    interval_ms: Option<u64>,

    /// Listener port. Overrides PLANSTAT_QUERY_METRICS_PORT.
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to /proc filesystem (for testing/mocking).
    #[arg(long, default_value = "/proc")]
    proc_path: String,

    /// Send a single packet and exit.
    #[arg(long)]
    once: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["planstat_seginfod", "planstat_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Applies command-line overrides on top of environment settings.
fn apply_overrides(mut config: InstrumentConfig, args: &Args) -> InstrumentConfig {
    if let Some(ms) = args.interval_ms {
        config = config.with_segment_interval(Duration::from_millis(ms));
    }
    if let Some(port) = args.port {
        config = config.with_query_metrics_port(port);
    }
    config
}

fn load_config(args: &Args) -> Result<InstrumentConfig, ConfigError> {
    Ok(apply_overrides(InstrumentConfig::from_env()?, args))
}

fn main() {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    let config = match load_config(&args) {
        Ok(c) => c,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("planstat-seginfod {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Config: dbid={}, segid={}, interval={}, port={}, proc={}",
        args.dbid,
        args.segid,
        format_ms(config.segment_interval, FmtStyle::Compact),
        config.query_metrics_port,
        args.proc_path
    );

    let meminfo = Path::new(&args.proc_path).join("meminfo");
    let source = MeminfoVmem::with_path(RealFs::new(), &meminfo);
    match source.sample() {
        Ok(sample) => info!(
            "Segment memory: limit={}, available={}",
            format_bytes(sample.limit, FmtStyle::Compact),
            format_bytes(sample.available, FmtStyle::Compact)
        ),
        Err(e) => warn!("Cannot sample {}: {}", meminfo.display(), e),
    }

    let mut sender = SegmentInfoSender::new(args.dbid, args.segid, &config, source);

    if args.once {
        if !sender.send_now() {
            error!("Segment info packet was not sent");
            std::process::exit(1);
        }
        return;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let s = shutdown.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        s.store(true, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    sender.run(&shutdown);

    info!(
        "Shutdown complete: {} packets sent, {} dropped",
        sender.packets_sent(),
        sender.conn().dropped()
    );
}
