//! Best-effort telemetry of node and query lifecycle events.
//!
//! Nothing here returns an error to the executor. Packets go out over a
//! non-blocking UDP socket to a local listener; a full socket buffer, a
//! missing listener or any other failure just drops the packet.

mod conn;
mod hooks;
mod packet;

pub use conn::MetricsConn;
pub use hooks::{MetricsEvent, MetricsHook, MetricsHooks};
pub use packet::{
    CommandType, MetricsPacket, NAME_LEN, NodePacket, NodeStatus, PACKET_MAGIC, PACKET_SIZE,
    PACKET_VERSION, PacketError, PacketType, QueryPacket, QueryStatus, SegmentInfoPacket,
};

use crate::backend::BackendIdentity;
use crate::config::InstrumentConfig;
use crate::plan::{PlanNodeInfo, QueryIdentity};
use chrono::{DateTime, Utc};

/// What the dispatcher knows about a query when its state changes.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryInfo {
    pub query: QueryIdentity,
    pub command_type: CommandType,
    pub db: String,
    pub user: String,
    pub tsubmit: Option<DateTime<Utc>>,
    pub tstart: Option<DateTime<Utc>>,
    pub tfin: Option<DateTime<Utc>>,
    pub plan_gen: i32,
}

impl QueryInfo {
    pub fn new(query: QueryIdentity, command_type: CommandType) -> Self {
        Self {
            query,
            command_type,
            db: String::new(),
            user: String::new(),
            tsubmit: None,
            tstart: None,
            tfin: None,
            plan_gen: 0,
        }
    }
}

fn epoch_seconds(ts: Option<DateTime<Utc>>) -> i64 {
    ts.map(|t| t.timestamp()).unwrap_or(0)
}

/// Current wall-clock time in fractional epoch seconds.
pub fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Builds lifecycle packets, runs hooks and sends.
pub struct MetricsEmitter {
    enabled: bool,
    conn: MetricsConn,
    hooks: MetricsHooks,
}

impl MetricsEmitter {
    pub fn new(config: &InstrumentConfig) -> Self {
        Self::with_conn(config, MetricsConn::new(config.query_metrics_port))
    }

    pub fn with_conn(config: &InstrumentConfig, conn: MetricsConn) -> Self {
        Self {
            enabled: config.enable_query_metrics,
            conn,
            hooks: MetricsHooks::new(),
        }
    }

    pub fn add_hook(&mut self, hook: impl MetricsHook + 'static) {
        self.hooks.push(hook);
    }

    pub fn conn(&self) -> &MetricsConn {
        &self.conn
    }

    /// Reports a node state change. Returns whether a datagram went out.
    pub fn node_status(
        &mut self,
        backend: &BackendIdentity,
        plan: &PlanNodeInfo,
        status: NodeStatus,
    ) -> bool {
        let packet = NodePacket {
            query: backend.query,
            status,
            segid: backend.segid,
            node_id: plan.node_id,
            pid: backend.pid,
            parent_node_id: plan.parent_node_id,
            node_type: plan.kind.code(),
            plan_width: plan.plan_width,
            time: now_seconds(),
            startup_cost: plan.startup_cost,
            total_cost: plan.total_cost,
            plan_rows: plan.plan_rows,
        };
        self.hooks.dispatch(&MetricsEvent::Node(&packet));

        self.enabled && self.conn.send(&MetricsPacket::Node(packet))
    }

    /// Reports a query state change. Returns whether a datagram went out.
    pub fn query_status(&mut self, info: &QueryInfo, status: QueryStatus) -> bool {
        let plan_gen = if matches!(status, QueryStatus::Submit | QueryStatus::Start)
            && info.command_type != CommandType::Utility
        {
            info.plan_gen
        } else {
            0
        };
        let packet = QueryPacket {
            query: info.query,
            status,
            command_type: info.command_type,
            db: info.db.clone(),
            user: info.user.clone(),
            tsubmit: epoch_seconds(info.tsubmit),
            tstart: epoch_seconds(info.tstart),
            tfin: epoch_seconds(info.tfin),
            plan_gen,
        };
        self.hooks.dispatch(&MetricsEvent::Query(&packet));

        self.enabled && self.conn.send(&MetricsPacket::Query(packet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanNodeKind;
    use std::net::UdpSocket;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn listener() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        socket
    }

    fn receive(listener: &UdpSocket) -> MetricsPacket {
        let mut buf = [0u8; PACKET_SIZE];
        let n = listener.recv(&mut buf).unwrap();
        MetricsPacket::decode(&buf[..n]).unwrap()
    }

    fn emitter_for(listener: &UdpSocket, enabled: bool) -> MetricsEmitter {
        let config = InstrumentConfig::new().with_query_metrics(enabled);
        MetricsEmitter::with_conn(&config, MetricsConn::with_target(listener.local_addr().unwrap()))
    }

    #[test]
    fn test_node_status_is_sent() {
        let listener = listener();
        let mut emitter = emitter_for(&listener, true);
        let mut backend = BackendIdentity::executor(4321, 2);
        backend.query = QueryIdentity::new(10, 20, 30);
        let plan = PlanNodeInfo::new(6, PlanNodeKind::HashJoin)
            .with_parent(2)
            .with_estimates(1.0, 99.0, 500.0);

        assert!(emitter.node_status(&backend, &plan, NodeStatus::Initialize));

        let MetricsPacket::Node(node) = receive(&listener) else {
            panic!("expected node packet");
        };
        assert_eq!(node.query, QueryIdentity::new(10, 20, 30));
        assert_eq!(node.status, NodeStatus::Initialize);
        assert_eq!(node.segid, 2);
        assert_eq!(node.node_id, 6);
        assert_eq!(node.parent_node_id, 2);
        assert_eq!(node.pid, 4321);
        assert_eq!(node.node_type, PlanNodeKind::HashJoin.code());
        assert_eq!(node.total_cost, 99.0);
        assert!(node.time > 0.0);
    }

    #[test]
    fn test_disabled_still_runs_hooks() {
        let listener = listener();
        let mut emitter = emitter_for(&listener, false);
        let seen = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&seen);
        emitter.add_hook(move |_: &MetricsEvent<'_>| *counter.lock().unwrap() += 1);

        let backend = BackendIdentity::dispatcher(1);
        let plan = PlanNodeInfo::new(1, PlanNodeKind::SeqScan);
        assert!(!emitter.node_status(&backend, &plan, NodeStatus::Finished));
        let info = QueryInfo::new(QueryIdentity::default(), CommandType::Select);
        assert!(!emitter.query_status(&info, QueryStatus::Done));

        assert_eq!(*seen.lock().unwrap(), 2);
        assert_eq!(emitter.conn().sent(), 0);
        assert!(!emitter.conn().is_open());
    }

    #[test]
    fn test_plan_gen_only_on_submit_and_start() {
        let listener = listener();
        let mut emitter = emitter_for(&listener, true);
        let submitted = DateTime::from_timestamp(1_700_000_000, 0);
        let mut info = QueryInfo::new(QueryIdentity::new(1, 2, 3), CommandType::Select);
        info.db = "postgres".to_string();
        info.user = "gpadmin".to_string();
        info.tsubmit = submitted;
        info.plan_gen = 2;

        emitter.query_status(&info, QueryStatus::Start);
        emitter.query_status(&info, QueryStatus::Done);
        info.command_type = CommandType::Utility;
        emitter.query_status(&info, QueryStatus::Submit);

        let gens: Vec<i32> = (0..3)
            .map(|_| match receive(&listener) {
                MetricsPacket::Query(q) => {
                    assert_eq!(q.db, "postgres");
                    assert_eq!(q.tsubmit, 1_700_000_000);
                    assert_eq!(q.tstart, 0);
                    q.plan_gen
                }
                other => panic!("unexpected packet {:?}", other),
            })
            .collect();
        assert_eq!(gens, vec![2, 0, 0]);
    }
}
