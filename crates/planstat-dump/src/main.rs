use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use serde::Serialize;

use planstat_core::config::InstrumentConfig;
use planstat_core::fmt::{FmtStyle, format_bytes, format_epoch, format_epoch_f64, pct};
use planstat_core::metrics::{MetricsPacket, NodePacket, PACKET_SIZE, QueryPacket};
use planstat_core::plan::{PlanNodeKind, QueryIdentity};

const RECV_TIMEOUT: Duration = Duration::from_millis(100);

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "planstat-dump", about = "Print planstat telemetry datagrams")]
struct Cli {
    /// Listener port. Defaults to PLANSTAT_QUERY_METRICS_PORT.
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind the listener to
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    bind: IpAddr,

    /// Exit after this many decoded packets
    #[arg(short = 'n', long)]
    count: Option<u64>,

    /// Output as JSON (one object per line)
    #[arg(long)]
    json: bool,
}

fn main() {
    let cli = Cli::parse();

    let port = match cli.port {
        Some(p) => p,
        None => match InstrumentConfig::from_env() {
            Ok(config) => config.query_metrics_port,
            Err(e) => {
                eprintln!("Invalid configuration: {e}");
                std::process::exit(1);
            }
        },
    };

    let addr = SocketAddr::new(cli.bind, port);
    let socket = UdpSocket::bind(addr).unwrap_or_else(|e| {
        eprintln!("Error binding {addr}: {e}");
        std::process::exit(1);
    });
    if let Err(e) = socket.set_read_timeout(Some(RECV_TIMEOUT)) {
        eprintln!("Error configuring socket: {e}");
        std::process::exit(1);
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || r.store(false, Ordering::SeqCst)) {
        eprintln!("Failed to set Ctrl-C handler: {e}");
    }

    eprintln!("Listening on {addr}");

    let mut stats = DumpStats::default();
    let mut buf = [0u8; 2 * PACKET_SIZE];
    while running.load(Ordering::SeqCst) && !stats.reached(cli.count) {
        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                eprintln!("Error receiving: {e}");
                std::process::exit(1);
            }
        };

        let Some(packet) = stats.record(&buf[..n]) else {
            continue;
        };
        if cli.json {
            match packet_json(&packet) {
                Ok(line) => println!("{line}"),
                Err(e) => eprintln!("Error serializing packet: {e}"),
            }
        } else {
            println!("{}", describe_packet(&packet));
        }
    }

    stats.print_summary();
}

// ── Counting ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct DumpStats {
    received: u64,
    decoded: u64,
    bad: u64,
    by_type: BTreeMap<&'static str, u64>,
    errors: BTreeMap<String, u64>,
}

impl DumpStats {
    /// Decodes one datagram. Undecodable datagrams are counted and skipped.
    fn record(&mut self, data: &[u8]) -> Option<MetricsPacket> {
        self.received += 1;
        match MetricsPacket::decode(data) {
            Ok(packet) => {
                self.decoded += 1;
                *self.by_type.entry(packet.packet_type().name()).or_default() += 1;
                Some(packet)
            }
            Err(e) => {
                self.bad += 1;
                *self.errors.entry(e.to_string()).or_default() += 1;
                None
            }
        }
    }

    fn reached(&self, limit: Option<u64>) -> bool {
        limit.is_some_and(|n| self.decoded >= n)
    }

    fn print_summary(&self) {
        eprintln!();
        eprintln!(
            "Received {} datagrams: {} decoded, {} bad ({:.1}%)",
            self.received,
            self.decoded,
            self.bad,
            pct(self.bad, self.received)
        );
        for (name, n) in &self.by_type {
            eprintln!("  {:<8} {:>8}", name, n);
        }
        for (err, n) in &self.errors {
            eprintln!("  bad: {} ({})", err, n);
        }
    }
}

// ── Output ───────────────────────────────────────────────────────────────────

fn query_id(q: &QueryIdentity) -> String {
    format!("{}-{}-{}", q.tmid, q.ssid, q.ccnt)
}

fn describe_node(p: &NodePacket) -> String {
    let kind = PlanNodeKind::from_code(p.node_type)
        .map(PlanNodeKind::name)
        .unwrap_or("Unknown");
    format!(
        "{} node    {} seg{} pid={} node={} parent={} {} {} cost={:.2}..{:.2} rows={:.0} width={}",
        format_epoch_f64(p.time),
        query_id(&p.query),
        p.segid,
        p.pid,
        p.node_id,
        p.parent_node_id,
        kind,
        p.status.name(),
        p.startup_cost,
        p.total_cost,
        p.plan_rows,
        p.plan_width
    )
}

fn describe_query(p: &QueryPacket) -> String {
    format!(
        "{} query   {} {} {} db={} user={} submit={} start={} finish={} plan_gen={}",
        format_epoch(Utc::now().timestamp()),
        query_id(&p.query),
        p.status.name(),
        p.command_type.name(),
        p.db,
        p.user,
        format_epoch(p.tsubmit),
        format_epoch(p.tstart),
        format_epoch(p.tfin),
        p.plan_gen
    )
}

fn describe_packet(packet: &MetricsPacket) -> String {
    match packet {
        MetricsPacket::Node(p) => describe_node(p),
        MetricsPacket::Query(p) => describe_query(p),
        MetricsPacket::SegmentInfo(p) => format!(
            "{} seginfo dbid={} seg{} used={} available={}",
            format_epoch(p.sample_time),
            p.dbid,
            p.segid,
            format_bytes(p.dynamic_memory_used, FmtStyle::Detail),
            format_bytes(p.dynamic_memory_available, FmtStyle::Detail)
        ),
    }
}

#[derive(Serialize)]
struct PacketJson<'a> {
    received_at: String,
    #[serde(flatten)]
    packet: &'a MetricsPacket,
}

fn packet_json(packet: &MetricsPacket) -> serde_json::Result<String> {
    serde_json::to_string(&PacketJson {
        received_at: Utc::now().to_rfc3339(),
        packet,
    })
}
