//! Plan-tree identity as seen by the instrumentation layer.
//!
//! The planner and executor own the real plan nodes; this module only carries
//! what instrumentation needs to stamp a record and describe a node in
//! telemetry: its numeric id, kind, parent and the planner's estimates.

use serde::{Deserialize, Serialize};

/// Position of a node in the plan tree, unique within one query plan.
pub type NodeId = i32;

/// Segment (worker) identifier. The dispatcher uses [`DISPATCHER_SEGMENT`].
pub type SegmentId = i16;

/// Segment id used by the dispatcher process.
pub const DISPATCHER_SEGMENT: SegmentId = -1;

/// Parent id of the plan root.
pub const NO_PARENT: NodeId = -1;

/// Kind of plan operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlanNodeKind {
    Result,
    Append,
    SeqScan,
    IndexScan,
    BitmapIndexScan,
    BitmapHeapScan,
    BitmapAnd,
    BitmapOr,
    FunctionScan,
    ValuesScan,
    CteScan,
    NestLoop,
    MergeJoin,
    HashJoin,
    Material,
    Sort,
    Agg,
    WindowAgg,
    Unique,
    Hash,
    SetOp,
    Limit,
    Motion,
    ShareInputScan,
}

impl PlanNodeKind {
    /// Every kind, in code order.
    pub const ALL: [PlanNodeKind; 24] = [
        PlanNodeKind::Result,
        PlanNodeKind::Append,
        PlanNodeKind::SeqScan,
        PlanNodeKind::IndexScan,
        PlanNodeKind::BitmapIndexScan,
        PlanNodeKind::BitmapHeapScan,
        PlanNodeKind::BitmapAnd,
        PlanNodeKind::BitmapOr,
        PlanNodeKind::FunctionScan,
        PlanNodeKind::ValuesScan,
        PlanNodeKind::CteScan,
        PlanNodeKind::NestLoop,
        PlanNodeKind::MergeJoin,
        PlanNodeKind::HashJoin,
        PlanNodeKind::Material,
        PlanNodeKind::Sort,
        PlanNodeKind::Agg,
        PlanNodeKind::WindowAgg,
        PlanNodeKind::Unique,
        PlanNodeKind::Hash,
        PlanNodeKind::SetOp,
        PlanNodeKind::Limit,
        PlanNodeKind::Motion,
        PlanNodeKind::ShareInputScan,
    ];

    /// Stable numeric code carried in telemetry packets.
    pub fn code(self) -> i32 {
        match self {
            PlanNodeKind::Result => 1,
            PlanNodeKind::Append => 2,
            PlanNodeKind::SeqScan => 3,
            PlanNodeKind::IndexScan => 4,
            PlanNodeKind::BitmapIndexScan => 5,
            PlanNodeKind::BitmapHeapScan => 6,
            PlanNodeKind::BitmapAnd => 7,
            PlanNodeKind::BitmapOr => 8,
            PlanNodeKind::FunctionScan => 9,
            PlanNodeKind::ValuesScan => 10,
            PlanNodeKind::CteScan => 11,
            PlanNodeKind::NestLoop => 12,
            PlanNodeKind::MergeJoin => 13,
            PlanNodeKind::HashJoin => 14,
            PlanNodeKind::Material => 15,
            PlanNodeKind::Sort => 16,
            PlanNodeKind::Agg => 17,
            PlanNodeKind::WindowAgg => 18,
            PlanNodeKind::Unique => 19,
            PlanNodeKind::Hash => 20,
            PlanNodeKind::SetOp => 21,
            PlanNodeKind::Limit => 22,
            PlanNodeKind::Motion => 23,
            PlanNodeKind::ShareInputScan => 24,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    /// Operator name as shown by EXPLAIN.
    pub fn name(self) -> &'static str {
        match self {
            PlanNodeKind::Result => "Result",
            PlanNodeKind::Append => "Append",
            PlanNodeKind::SeqScan => "Seq Scan",
            PlanNodeKind::IndexScan => "Index Scan",
            PlanNodeKind::BitmapIndexScan => "Bitmap Index Scan",
            PlanNodeKind::BitmapHeapScan => "Bitmap Heap Scan",
            PlanNodeKind::BitmapAnd => "BitmapAnd",
            PlanNodeKind::BitmapOr => "BitmapOr",
            PlanNodeKind::FunctionScan => "Function Scan",
            PlanNodeKind::ValuesScan => "Values Scan",
            PlanNodeKind::CteScan => "CTE Scan",
            PlanNodeKind::NestLoop => "Nested Loop",
            PlanNodeKind::MergeJoin => "Merge Join",
            PlanNodeKind::HashJoin => "Hash Join",
            PlanNodeKind::Material => "Materialize",
            PlanNodeKind::Sort => "Sort",
            PlanNodeKind::Agg => "Aggregate",
            PlanNodeKind::WindowAgg => "Window",
            PlanNodeKind::Unique => "Unique",
            PlanNodeKind::Hash => "Hash",
            PlanNodeKind::SetOp => "SetOp",
            PlanNodeKind::Limit => "Limit",
            PlanNodeKind::Motion => "Motion",
            PlanNodeKind::ShareInputScan => "Shared Scan",
        }
    }
}

/// What the executor tells instrumentation about one plan node.
#[derive(Clone, Debug, PartialEq)]
pub struct PlanNodeInfo {
    pub node_id: NodeId,
    pub parent_node_id: NodeId,
    pub kind: PlanNodeKind,
    pub plan_width: i32,
    pub startup_cost: f64,
    pub total_cost: f64,
    pub plan_rows: f64,
}

impl PlanNodeInfo {
    /// Node without planner estimates.
    pub fn new(node_id: NodeId, kind: PlanNodeKind) -> Self {
        Self {
            node_id,
            parent_node_id: NO_PARENT,
            kind,
            plan_width: 0,
            startup_cost: 0.0,
            total_cost: 0.0,
            plan_rows: 0.0,
        }
    }

    pub fn with_parent(mut self, parent: NodeId) -> Self {
        self.parent_node_id = parent;
        self
    }

    pub fn with_estimates(mut self, startup_cost: f64, total_cost: f64, plan_rows: f64) -> Self {
        self.startup_cost = startup_cost;
        self.total_cost = total_cost;
        self.plan_rows = plan_rows;
        self
    }

    pub fn with_width(mut self, width: i32) -> Self {
        self.plan_width = width;
        self
    }
}

/// Executor flags a node was initialized with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecFlags(u32);

impl ExecFlags {
    pub const EXPLAIN_ONLY: ExecFlags = ExecFlags(0x0001);
    pub const REWIND: ExecFlags = ExecFlags(0x0002);
    pub const BACKWARD: ExecFlags = ExecFlags(0x0004);
    pub const MARK: ExecFlags = ExecFlags(0x0008);
    pub const SKIP_TRIGGERS: ExecFlags = ExecFlags(0x0010);
    /// Statistics must stay readable after the node's record is released.
    pub const EXPLAIN_ANALYZE: ExecFlags = ExecFlags(0x0100);

    pub const fn empty() -> Self {
        ExecFlags(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        ExecFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: ExecFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ExecFlags {
    type Output = ExecFlags;

    fn bitor(self, rhs: ExecFlags) -> ExecFlags {
        ExecFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for ExecFlags {
    fn bitor_assign(&mut self, rhs: ExecFlags) {
        self.0 |= rhs.0;
    }
}

/// Logical identity of one query: transaction time, session and command count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryIdentity {
    pub tmid: i32,
    pub ssid: i32,
    pub ccnt: i32,
}

impl QueryIdentity {
    pub fn new(tmid: i32, ssid: i32, ccnt: i32) -> Self {
        Self { tmid, ssid, ccnt }
    }
}
