//! Fixed-layout telemetry datagrams.
//!
//! Every datagram is exactly [`PACKET_SIZE`] bytes, little endian:
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ HEADER (16 bytes)                             │
//! │   magic: u32        = 0x78ab928d              │
//! │   version: u16      = 1                       │
//! │   pkttype: u16      20 node, 22 query,        │
//! │                     23 segment info           │
//! │   length: u64       payload bytes in use      │
//! ├───────────────────────────────────────────────┤
//! │ PAYLOAD (176 bytes, zero padded)              │
//! │   node:     72 bytes                          │
//! │   query:   172 bytes                          │
//! │   seginfo:  32 bytes                          │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! There is no framing beyond the fixed size and no compatibility promise
//! beyond the version field.

use crate::plan::{NodeId, QueryIdentity, SegmentId};
use serde::Serialize;
use std::fmt;

pub const PACKET_MAGIC: u32 = 0x78ab_928d;
pub const PACKET_VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 16;
pub const PAYLOAD_SIZE: usize = 176;
pub const PACKET_SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE;
/// Width of the database and user name fields, NUL included.
pub const NAME_LEN: usize = 64;

const NODE_LEN: usize = 72;
const QUERY_LEN: usize = 172;
const SEGINFO_LEN: usize = 32;

/// Error type for datagram decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    WrongSize(usize),
    BadMagic(u32),
    UnsupportedVersion(u16),
    UnknownType(u16),
    UnknownStatus(i16),
    BadLength { pkttype: u16, length: u64 },
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketError::WrongSize(n) => {
                write!(f, "datagram is {} bytes, expected {}", n, PACKET_SIZE)
            }
            PacketError::BadMagic(m) => write!(f, "invalid magic: {:#010x}", m),
            PacketError::UnsupportedVersion(v) => write!(f, "unsupported version: {}", v),
            PacketError::UnknownType(t) => write!(f, "unknown packet type: {}", t),
            PacketError::UnknownStatus(s) => write!(f, "unknown status: {}", s),
            PacketError::BadLength { pkttype, length } => {
                write!(f, "payload length {} invalid for packet type {}", length, pkttype)
            }
        }
    }
}

impl std::error::Error for PacketError {}

/// Packet type discriminant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketType {
    Node = 20,
    Query = 22,
    SegmentInfo = 23,
}

impl PacketType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            20 => Some(PacketType::Node),
            22 => Some(PacketType::Query),
            23 => Some(PacketType::SegmentInfo),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PacketType::Node => "node",
            PacketType::Query => "query",
            PacketType::SegmentInfo => "seginfo",
        }
    }
}

/// Lifecycle state of a plan node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum NodeStatus {
    Initialize = 100,
    Executing = 101,
    Finished = 102,
}

impl NodeStatus {
    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            100 => Some(NodeStatus::Initialize),
            101 => Some(NodeStatus::Executing),
            102 => Some(NodeStatus::Finished),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            NodeStatus::Initialize => "initialize",
            NodeStatus::Executing => "executing",
            NodeStatus::Finished => "finished",
        }
    }
}

/// Lifecycle state of a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum QueryStatus {
    Submit = 200,
    Start = 201,
    Done = 202,
    Error = 203,
    Canceling = 204,
    Canceled = 205,
}

impl QueryStatus {
    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            200 => Some(QueryStatus::Submit),
            201 => Some(QueryStatus::Start),
            202 => Some(QueryStatus::Done),
            203 => Some(QueryStatus::Error),
            204 => Some(QueryStatus::Canceling),
            205 => Some(QueryStatus::Canceled),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            QueryStatus::Submit => "submit",
            QueryStatus::Start => "start",
            QueryStatus::Done => "done",
            QueryStatus::Error => "error",
            QueryStatus::Canceling => "canceling",
            QueryStatus::Canceled => "canceled",
        }
    }
}

/// Kind of statement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum CommandType {
    #[default]
    Unknown = 0,
    Select = 1,
    Update = 2,
    Insert = 3,
    Delete = 4,
    Utility = 5,
    Nothing = 6,
}

impl CommandType {
    pub fn from_i16(v: i16) -> Self {
        match v {
            1 => CommandType::Select,
            2 => CommandType::Update,
            3 => CommandType::Insert,
            4 => CommandType::Delete,
            5 => CommandType::Utility,
            6 => CommandType::Nothing,
            _ => CommandType::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandType::Unknown => "unknown",
            CommandType::Select => "select",
            CommandType::Update => "update",
            CommandType::Insert => "insert",
            CommandType::Delete => "delete",
            CommandType::Utility => "utility",
            CommandType::Nothing => "nothing",
        }
    }
}

/// A plan node changed state.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodePacket {
    pub query: QueryIdentity,
    pub status: NodeStatus,
    pub segid: SegmentId,
    pub node_id: NodeId,
    pub pid: u32,
    pub parent_node_id: NodeId,
    pub node_type: i32,
    pub plan_width: i32,
    /// Event time, seconds.
    pub time: f64,
    pub startup_cost: f64,
    pub total_cost: f64,
    pub plan_rows: f64,
}

/// A query changed state.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryPacket {
    pub query: QueryIdentity,
    pub status: QueryStatus,
    pub command_type: CommandType,
    pub db: String,
    pub user: String,
    /// Epoch seconds; zero when not reached yet.
    pub tsubmit: i64,
    pub tstart: i64,
    pub tfin: i64,
    /// Only set for submit and start events.
    pub plan_gen: i32,
}

/// Periodic memory sample of one segment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SegmentInfoPacket {
    pub dbid: i32,
    pub segid: SegmentId,
    pub dynamic_memory_used: u64,
    pub dynamic_memory_available: u64,
    /// Epoch seconds.
    pub sample_time: i64,
}

/// One telemetry datagram.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricsPacket {
    Node(NodePacket),
    Query(QueryPacket),
    SegmentInfo(SegmentInfoPacket),
}

impl MetricsPacket {
    pub fn packet_type(&self) -> PacketType {
        match self {
            MetricsPacket::Node(_) => PacketType::Node,
            MetricsPacket::Query(_) => PacketType::Query,
            MetricsPacket::SegmentInfo(_) => PacketType::SegmentInfo,
        }
    }

    /// Serializes into a zero-padded fixed-size datagram.
    pub fn encode(&self) -> [u8; PACKET_SIZE] {
        let mut buf = [0u8; PACKET_SIZE];
        let (header, payload) = buf.split_at_mut(HEADER_SIZE);
        let mut w = Writer::new(payload);

        match self {
            MetricsPacket::Node(n) => {
                write_query(&mut w, &n.query);
                w.i16(n.status as i16);
                w.i16(n.segid);
                w.i32(n.node_id);
                w.u32(n.pid);
                w.i32(n.parent_node_id);
                w.i32(n.node_type);
                w.i32(n.plan_width);
                w.skip(4);
                w.f64(n.time);
                w.f64(n.startup_cost);
                w.f64(n.total_cost);
                w.f64(n.plan_rows);
            }
            MetricsPacket::Query(q) => {
                write_query(&mut w, &q.query);
                w.i16(q.status as i16);
                w.i16(q.command_type as i16);
                w.name(&q.db);
                w.name(&q.user);
                w.i64(q.tsubmit);
                w.i64(q.tstart);
                w.i64(q.tfin);
                w.i32(q.plan_gen);
            }
            MetricsPacket::SegmentInfo(s) => {
                w.i32(s.dbid);
                w.i16(s.segid);
                w.skip(2);
                w.u64(s.dynamic_memory_used);
                w.u64(s.dynamic_memory_available);
                w.i64(s.sample_time);
            }
        }
        let length = w.pos as u64;

        header[0..4].copy_from_slice(&PACKET_MAGIC.to_le_bytes());
        header[4..6].copy_from_slice(&PACKET_VERSION.to_le_bytes());
        header[6..8].copy_from_slice(&(self.packet_type() as u16).to_le_bytes());
        header[8..16].copy_from_slice(&length.to_le_bytes());
        buf
    }

    /// Parses a datagram produced by [`MetricsPacket::encode`].
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() != PACKET_SIZE {
            return Err(PacketError::WrongSize(data.len()));
        }

        let mut h = Reader::new(&data[..HEADER_SIZE]);
        let magic = h.u32();
        if magic != PACKET_MAGIC {
            return Err(PacketError::BadMagic(magic));
        }
        let version = h.u16();
        if version != PACKET_VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }
        let raw_type = h.u16();
        let pkttype = PacketType::from_u16(raw_type).ok_or(PacketError::UnknownType(raw_type))?;
        let length = h.u64();
        let expected = match pkttype {
            PacketType::Node => NODE_LEN,
            PacketType::Query => QUERY_LEN,
            PacketType::SegmentInfo => SEGINFO_LEN,
        };
        if length != expected as u64 {
            return Err(PacketError::BadLength {
                pkttype: raw_type,
                length,
            });
        }

        let mut r = Reader::new(&data[HEADER_SIZE..]);
        let packet = match pkttype {
            PacketType::Node => {
                let query = read_query(&mut r);
                let status = r.i16();
                let status =
                    NodeStatus::from_i16(status).ok_or(PacketError::UnknownStatus(status))?;
                let segid = r.i16();
                let node_id = r.i32();
                let pid = r.u32();
                let parent_node_id = r.i32();
                let node_type = r.i32();
                let plan_width = r.i32();
                r.skip(4);
                MetricsPacket::Node(NodePacket {
                    query,
                    status,
                    segid,
                    node_id,
                    pid,
                    parent_node_id,
                    node_type,
                    plan_width,
                    time: r.f64(),
                    startup_cost: r.f64(),
                    total_cost: r.f64(),
                    plan_rows: r.f64(),
                })
            }
            PacketType::Query => {
                let query = read_query(&mut r);
                let status = r.i16();
                let status =
                    QueryStatus::from_i16(status).ok_or(PacketError::UnknownStatus(status))?;
                let command_type = CommandType::from_i16(r.i16());
                MetricsPacket::Query(QueryPacket {
                    query,
                    status,
                    command_type,
                    db: r.name(),
                    user: r.name(),
                    tsubmit: r.i64(),
                    tstart: r.i64(),
                    tfin: r.i64(),
                    plan_gen: r.i32(),
                })
            }
            PacketType::SegmentInfo => {
                let dbid = r.i32();
                let segid = r.i16();
                r.skip(2);
                MetricsPacket::SegmentInfo(SegmentInfoPacket {
                    dbid,
                    segid,
                    dynamic_memory_used: r.u64(),
                    dynamic_memory_available: r.u64(),
                    sample_time: r.i64(),
                })
            }
        };
        Ok(packet)
    }
}

fn write_query(w: &mut Writer<'_>, q: &QueryIdentity) {
    w.i32(q.tmid);
    w.i32(q.ssid);
    w.i32(q.ccnt);
}

fn read_query(r: &mut Reader<'_>) -> QueryIdentity {
    QueryIdentity {
        tmid: r.i32(),
        ssid: r.i32(),
        ccnt: r.i32(),
    }
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char.
fn truncate_on_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// Cursors over a buffer whose size is checked up front; every field fits.

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    fn i16(&mut self, v: i16) {
        self.put(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.put(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.put(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.put(&v.to_le_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.put(&v.to_le_bytes());
    }

    fn name(&mut self, s: &str) {
        let s = truncate_on_char_boundary(s, NAME_LEN - 1);
        self.buf[self.pos..self.pos + s.len()].copy_from_slice(s.as_bytes());
        self.pos += NAME_LEN;
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    fn i16(&mut self) -> i16 {
        i16::from_le_bytes(self.take())
    }

    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn i64(&mut self) -> i64 {
        i64::from_le_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }

    fn f64(&mut self) -> f64 {
        f64::from_le_bytes(self.take())
    }

    fn name(&mut self) -> String {
        let field: [u8; NAME_LEN] = self.take();
        let end = field.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        String::from_utf8_lossy(&field[..end]).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_packet() -> MetricsPacket {
        MetricsPacket::Node(NodePacket {
            query: QueryIdentity::new(1_700_000_000, 17, 4),
            status: NodeStatus::Executing,
            segid: 2,
            node_id: 5,
            pid: 31337,
            parent_node_id: 3,
            node_type: 14,
            plan_width: 32,
            time: 12.5,
            startup_cost: 0.25,
            total_cost: 431.0,
            plan_rows: 10_000.0,
        })
    }

    #[test]
    fn test_node_packet_layout() {
        let buf = node_packet().encode();
        assert_eq!(buf.len(), 192);
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), 0x78ab928d);
        assert_eq!(u16::from_le_bytes([buf[4], buf[5]]), 1);
        assert_eq!(u16::from_le_bytes([buf[6], buf[7]]), 20);
        assert_eq!(u64::from_le_bytes(buf[8..16].try_into().unwrap()), 72);
        // status sits right after the query identity
        assert_eq!(i16::from_le_bytes([buf[28], buf[29]]), 101);
        assert_eq!(MetricsPacket::decode(&buf).unwrap(), node_packet());
    }

    #[test]
    fn test_query_packet_names() {
        let long_user = "ü".repeat(40);
        let packet = MetricsPacket::Query(QueryPacket {
            query: QueryIdentity::new(1, 2, 3),
            status: QueryStatus::Done,
            command_type: CommandType::Select,
            db: "analytics".to_string(),
            user: long_user.clone(),
            tsubmit: 1_700_000_000,
            tstart: 1_700_000_001,
            tfin: 1_700_000_009,
            plan_gen: 0,
        });

        let buf = packet.encode();
        assert_eq!(u64::from_le_bytes(buf[8..16].try_into().unwrap()), 172);
        let MetricsPacket::Query(decoded) = MetricsPacket::decode(&buf).unwrap() else {
            panic!("expected query packet");
        };
        assert_eq!(decoded.db, "analytics");
        // 63 bytes fit; a two-byte char may not be split.
        assert_eq!(decoded.user.len(), 62);
        assert!(long_user.starts_with(&decoded.user));
        assert_eq!(decoded.tfin, 1_700_000_009);
        assert_eq!(decoded.status, QueryStatus::Done);
    }

    #[test]
    fn test_segment_info_packet() {
        let packet = MetricsPacket::SegmentInfo(SegmentInfoPacket {
            dbid: 3,
            segid: 1,
            dynamic_memory_used: 1 << 30,
            dynamic_memory_available: 3 << 30,
            sample_time: 1_700_000_000,
        });
        let buf = packet.encode();
        assert_eq!(u16::from_le_bytes([buf[6], buf[7]]), 23);
        assert_eq!(MetricsPacket::decode(&buf).unwrap(), packet);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(
            MetricsPacket::decode(&[0u8; 10]),
            Err(PacketError::WrongSize(10))
        );

        let mut buf = node_packet().encode();
        buf[0] = 0;
        assert!(matches!(
            MetricsPacket::decode(&buf),
            Err(PacketError::BadMagic(_))
        ));

        let mut buf = node_packet().encode();
        buf[6..8].copy_from_slice(&21u16.to_le_bytes());
        assert_eq!(
            MetricsPacket::decode(&buf),
            Err(PacketError::UnknownType(21))
        );

        let mut buf = node_packet().encode();
        buf[28..30].copy_from_slice(&7i16.to_le_bytes());
        assert_eq!(
            MetricsPacket::decode(&buf),
            Err(PacketError::UnknownStatus(7))
        );
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(node_packet()).unwrap();
        assert_eq!(json["type"], "node");
        assert_eq!(json["status"], "Executing");
        assert_eq!(json["query"]["ssid"], 17);
    }
}
