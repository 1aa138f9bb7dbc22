//! Periodic segment resource reports.
//!
//! A dedicated sender wakes every [`SEGMENT_INFO_LOOP_SLEEP`], runs the
//! optional collector hook, and once `segment_interval` has elapsed sends a
//! segment-info datagram with the segment's dynamic memory figures.

use crate::config::InstrumentConfig;
use crate::fs::FileSystem;
use crate::metrics::{MetricsConn, MetricsPacket, SegmentInfoPacket};
use crate::plan::SegmentId;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Wake-up period of the sender loop.
pub const SEGMENT_INFO_LOOP_SLEEP: Duration = Duration::from_millis(100);

const MEMINFO_PATH: &str = "/proc/meminfo";

/// Error type for sampling failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

/// Memory limit and headroom of a segment, in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmemSample {
    pub limit: u64,
    pub available: u64,
}

impl VmemSample {
    pub fn used(&self) -> u64 {
        self.limit.saturating_sub(self.available)
    }
}

/// Where a segment's memory figures come from.
pub trait VmemSource: Send {
    fn sample(&self) -> Result<VmemSample, ParseError>;
}

/// The figures of `/proc/meminfo` this sender uses, in kilobytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemInfo {
    pub mem_total: u64,
    pub mem_free: u64,
    pub mem_available: Option<u64>,
    pub buffers: u64,
    pub cached: u64,
}

impl MemInfo {
    /// Available memory; estimated on kernels without `MemAvailable`.
    pub fn available_kb(&self) -> u64 {
        self.mem_available
            .unwrap_or(self.mem_free + self.buffers + self.cached)
    }
}

/// Parses `/proc/meminfo`. `MemTotal` is required.
pub fn parse_meminfo(content: &str) -> Result<MemInfo, ParseError> {
    let mut info = MemInfo::default();
    let mut has_total = false;

    let parse_kb = |line: &str| -> u64 {
        line.split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    };

    for line in content.lines() {
        if line.starts_with("MemTotal:") {
            info.mem_total = parse_kb(line);
            has_total = true;
        } else if line.starts_with("MemFree:") {
            info.mem_free = parse_kb(line);
        } else if line.starts_with("MemAvailable:") {
            info.mem_available = Some(parse_kb(line));
        } else if line.starts_with("Buffers:") {
            info.buffers = parse_kb(line);
        } else if line.starts_with("Cached:") {
            info.cached = parse_kb(line);
        }
    }

    if !has_total {
        return Err(ParseError::new("MemTotal not found in meminfo"));
    }
    Ok(info)
}

/// Reads memory figures from `/proc/meminfo`.
pub struct MeminfoVmem<F: FileSystem> {
    fs: F,
    path: PathBuf,
}

impl<F: FileSystem> MeminfoVmem<F> {
    pub fn new(fs: F) -> Self {
        Self::with_path(fs, MEMINFO_PATH)
    }

    pub fn with_path(fs: F, path: impl AsRef<Path>) -> Self {
        Self {
            fs,
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl<F: FileSystem> VmemSource for MeminfoVmem<F> {
    fn sample(&self) -> Result<VmemSample, ParseError> {
        if !self.fs.exists(&self.path) {
            return Err(ParseError::new(format!("{} not found", self.path.display())));
        }
        let content = self.fs.read_to_string(&self.path).map_err(|e| {
            ParseError::new(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        let info = parse_meminfo(&content)?;
        Ok(VmemSample {
            limit: info.mem_total * 1024,
            available: info.available_kb() * 1024,
        })
    }
}

type CollectorHook = Box<dyn FnMut() + Send>;

/// The segment-info sender loop.
pub struct SegmentInfoSender<V: VmemSource> {
    dbid: i32,
    segid: SegmentId,
    interval: Duration,
    elapsed: Duration,
    source: V,
    conn: MetricsConn,
    collector_hook: Option<CollectorHook>,
    packets_sent: u64,
}

impl<V: VmemSource> SegmentInfoSender<V> {
    pub fn new(dbid: i32, segid: SegmentId, config: &InstrumentConfig, source: V) -> Self {
        Self {
            dbid,
            segid,
            interval: config.segment_interval,
            elapsed: Duration::ZERO,
            source,
            conn: MetricsConn::new(config.query_metrics_port),
            collector_hook: None,
            packets_sent: 0,
        }
    }

    pub fn with_conn(mut self, conn: MetricsConn) -> Self {
        self.conn = conn;
        self
    }

    /// Hook invoked on every wake-up, before the interval check.
    pub fn with_collector_hook(mut self, hook: impl FnMut() + Send + 'static) -> Self {
        self.collector_hook = Some(Box::new(hook));
        self
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn conn(&self) -> &MetricsConn {
        &self.conn
    }

    /// One wake-up of the loop. Returns whether a packet was sent.
    pub fn tick(&mut self) -> bool {
        if let Some(hook) = self.collector_hook.as_mut() {
            hook();
        }

        let mut sent = false;
        if self.elapsed >= self.interval {
            sent = self.send_now();
            self.elapsed = Duration::ZERO;
        }

        self.elapsed += SEGMENT_INFO_LOOP_SLEEP;
        sent
    }

    /// Samples memory and sends one packet right away.
    pub fn send_now(&mut self) -> bool {
        let sample = match self.source.sample() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "segment info: cannot sample memory");
                return false;
            }
        };
        let packet = MetricsPacket::SegmentInfo(SegmentInfoPacket {
            dbid: self.dbid,
            segid: self.segid,
            dynamic_memory_used: sample.used(),
            dynamic_memory_available: sample.available,
            sample_time: Utc::now().timestamp(),
        });

        let sent = self.conn.send(&packet);
        if sent {
            self.packets_sent += 1;
        }
        debug!(
            used = sample.used(),
            available = sample.available,
            sent,
            "segment info"
        );
        sent
    }

    /// Runs until `shutdown` is set.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        info!(
            dbid = self.dbid,
            segid = self.segid,
            interval_ms = self.interval.as_millis() as u64,
            "segment info sender started"
        );

        while !shutdown.load(Ordering::SeqCst) {
            self.tick();
            std::thread::sleep(SEGMENT_INFO_LOOP_SLEEP);
        }

        info!(packets = self.packets_sent, "segment info sender stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MockFs;
    use crate::metrics::PACKET_SIZE;
    use std::net::UdpSocket;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    const MEMINFO: &str = "\
MemTotal:        8000000 kB
MemFree:         1000000 kB
MemAvailable:    6000000 kB
Buffers:          200000 kB
Cached:          3000000 kB
SwapCached:            0 kB
";

    fn source(content: &str) -> MeminfoVmem<MockFs> {
        source_at(MEMINFO_PATH, content)
    }

    fn source_at(path: &str, content: &str) -> MeminfoVmem<MockFs> {
        let mut fs = MockFs::new();
        fs.add_file(path, content);
        MeminfoVmem::with_path(fs, path)
    }

    fn listener() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        socket
    }

    #[test]
    fn test_parse_meminfo() {
        let info = parse_meminfo(MEMINFO).unwrap();
        assert_eq!(info.mem_total, 8_000_000);
        assert_eq!(info.cached, 3_000_000);
        assert_eq!(info.available_kb(), 6_000_000);
    }

    #[test]
    fn test_parse_meminfo_without_available() {
        let info = parse_meminfo("MemTotal: 100 kB\nMemFree: 10 kB\nBuffers: 5 kB\nCached: 20 kB\n")
            .unwrap();
        assert_eq!(info.available_kb(), 35);
        assert!(parse_meminfo("MemFree: 10 kB\n").is_err());
    }

    #[test]
    fn test_meminfo_sample_in_bytes() {
        let sample = source(MEMINFO).sample().unwrap();
        assert_eq!(sample.limit, 8_000_000 * 1024);
        assert_eq!(sample.available, 6_000_000 * 1024);
        assert_eq!(sample.used(), 2_000_000 * 1024);
        assert_eq!(
            VmemSample {
                limit: 1,
                available: 5
            }
            .used(),
            0
        );
    }

    #[test]
    fn test_tick_cadence_and_hook() {
        let listener = listener();
        let config = InstrumentConfig::new().with_segment_interval(Duration::from_millis(300));
        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = Arc::clone(&calls);

        let mut sender = SegmentInfoSender::new(7, 2, &config, source(MEMINFO))
            .with_conn(MetricsConn::with_target(listener.local_addr().unwrap()))
            .with_collector_hook(move || {
                hook_calls.fetch_add(1, Ordering::SeqCst);
            });

        let sent_on: Vec<usize> = (1..=10).filter(|_| sender.tick()).collect();
        assert_eq!(sent_on, vec![4, 7, 10]);
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(sender.packets_sent(), 3);

        let mut buf = [0u8; PACKET_SIZE];
        let n = listener.recv(&mut buf).unwrap();
        let MetricsPacket::SegmentInfo(info) = MetricsPacket::decode(&buf[..n]).unwrap() else {
            panic!("expected segment info packet");
        };
        assert_eq!(info.dbid, 7);
        assert_eq!(info.segid, 2);
        assert_eq!(info.dynamic_memory_available, 6_000_000 * 1024);
        assert_eq!(info.dynamic_memory_used, 2_000_000 * 1024);
    }

    #[test]
    fn test_sampling_failure_skips_packet() {
        let config = InstrumentConfig::new();
        let mut sender = SegmentInfoSender::new(1, 0, &config, MeminfoVmem::new(MockFs::new()));
        assert!(!sender.send_now());
        assert_eq!(sender.packets_sent(), 0);
        assert!(!sender.conn().is_open());
    }

    #[test]
    fn test_missing_meminfo_names_the_file() {
        let source = MeminfoVmem::with_path(MockFs::new(), "/mnt/proc/meminfo");
        let err = source.sample().unwrap_err();
        assert_eq!(err.message, "/mnt/proc/meminfo not found");

        let garbled = source_at("/mnt/proc/meminfo", "Cached: 1 kB\n");
        let err = garbled.sample().unwrap_err();
        assert!(err.message.contains("MemTotal"));
    }

    #[test]
    fn test_run_stops_on_shutdown() {
        let config = InstrumentConfig::new();
        let mut sender = SegmentInfoSender::new(1, 0, &config, source(MEMINFO));
        let shutdown = AtomicBool::new(true);
        sender.run(&shutdown);
        assert_eq!(sender.packets_sent(), 0);
    }
}
