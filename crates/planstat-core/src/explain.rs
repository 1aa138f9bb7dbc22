//! Dispatcher-side merge of per-worker node statistics.
//!
//! Every worker ships one [`WorkerStats`] per query: a snapshot of each plan
//! node it executed. The dispatcher folds them into one [`NodeSummary`] per
//! node id. All folds are sums, counts and max/min with a deterministic
//! tie-break (lowest segment id wins), so the result does not depend on the
//! order in which worker snapshots arrive.
//!
//! A worker is one process: a segment runs one process per plan slice, so
//! several workers may report from the same segment. Workers are keyed by
//! [`WorkerId`] (segment and pid).
//!
//! A worker that never ran a node, for example because partition pruning or
//! direct dispatch skipped it, contributes nothing to that node.

use crate::backend::InstrHandle;
use crate::instrument::{Instrumentation, SortMethod, SortSpaceType};
use crate::plan::{NodeId, SegmentId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::warn;

// ---------------------------------------------------------------------------
// Worker snapshots
// ---------------------------------------------------------------------------

/// Identifies one worker process. Orders by segment, then pid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId {
    pub segid: SegmentId,
    pub pid: u32,
}

impl WorkerId {
    pub fn new(segid: SegmentId, pid: u32) -> Self {
        Self { segid, pid }
    }
}

/// One node's record as shipped by a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub node_id: NodeId,
    pub instr: Instrumentation,
}

/// Everything one worker measured for one query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub segid: SegmentId,
    pub pid: u32,
    pub nodes: Vec<NodeStats>,
}

impl WorkerStats {
    pub fn new(segid: SegmentId, pid: u32) -> Self {
        Self {
            segid,
            pid,
            nodes: Vec::new(),
        }
    }

    /// Ends the current loop of every record and snapshots it.
    ///
    /// Records whose shared slot was already recycled are skipped.
    pub fn collect<'a>(
        segid: SegmentId,
        pid: u32,
        handles: impl IntoIterator<Item = &'a mut InstrHandle>,
    ) -> Self {
        let mut stats = Self::new(segid, pid);
        for handle in handles {
            handle.end_loop();
            if let Some(instr) = handle.snapshot() {
                stats.push(handle.node_id(), instr);
            }
        }
        stats
    }

    pub fn id(&self) -> WorkerId {
        WorkerId::new(self.segid, self.pid)
    }

    pub fn push(&mut self, node_id: NodeId, instr: Instrumentation) {
        self.nodes.push(NodeStats { node_id, instr });
    }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// Sum, count, max and min of one metric across workers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatAgg {
    pub vmax: u64,
    pub vmin: u64,
    pub vsum: u64,
    pub vcnt: u64,
    /// Segment holding the maximum.
    pub imax: SegmentId,
    /// Segment holding the minimum.
    pub imin: SegmentId,
}

impl StatAgg {
    pub fn add(&mut self, value: u64, segid: SegmentId) {
        self.merge(&StatAgg {
            vmax: value,
            vmin: value,
            vsum: value,
            vcnt: 1,
            imax: segid,
            imin: segid,
        });
    }

    pub fn merge(&mut self, other: &StatAgg) {
        if other.vcnt == 0 {
            return;
        }
        if self.vcnt == 0 {
            *self = *other;
            return;
        }
        if other.vmax > self.vmax || (other.vmax == self.vmax && other.imax < self.imax) {
            self.vmax = other.vmax;
            self.imax = other.imax;
        }
        if other.vmin < self.vmin || (other.vmin == self.vmin && other.imin < self.imin) {
            self.vmin = other.vmin;
            self.imin = other.imin;
        }
        self.vsum = self.vsum.saturating_add(other.vsum);
        self.vcnt += other.vcnt;
    }

    /// Mean over contributing workers; zero when there are none.
    pub fn avg(&self) -> f64 {
        if self.vcnt == 0 {
            0.0
        } else {
            self.vsum as f64 / self.vcnt as f64
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vcnt == 0
    }
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Merged statistics of one plan node across workers.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeSummary {
    pub node_id: NodeId,
    /// Workers that reported this node.
    pub workers: BTreeSet<WorkerId>,
    /// Lifetime elapsed time, nanoseconds.
    pub total_time: StatAgg,
    /// First-cycle startup latency, nanoseconds.
    pub startup: StatAgg,
    pub ntuples: StatAgg,
    pub nloops: StatAgg,
    pub execmemused: StatAgg,
    pub workmemused: StatAgg,
    pub workmemwanted: StatAgg,
    pub num_part_scanned: StatAgg,
    /// Number of workers that spilled to workfiles.
    pub workfiles_created: u32,
    /// Workers per sort method.
    pub sort_methods: BTreeMap<SortMethod, u32>,
    /// Sort space in kilobytes per space type.
    pub sort_space: BTreeMap<SortSpaceType, StatAgg>,
}

impl NodeSummary {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            workers: BTreeSet::new(),
            total_time: StatAgg::default(),
            startup: StatAgg::default(),
            ntuples: StatAgg::default(),
            nloops: StatAgg::default(),
            execmemused: StatAgg::default(),
            workmemused: StatAgg::default(),
            workmemwanted: StatAgg::default(),
            num_part_scanned: StatAgg::default(),
            workfiles_created: 0,
            sort_methods: BTreeMap::new(),
            sort_space: BTreeMap::new(),
        }
    }

    /// Folds one worker's record in. A second record from the same worker
    /// is ignored.
    pub fn add_worker(&mut self, worker: WorkerId, instr: &Instrumentation) {
        if !self.workers.insert(worker) {
            warn!(
                node_id = self.node_id,
                segid = worker.segid,
                pid = worker.pid,
                "duplicate worker statistics ignored"
            );
            return;
        }
        let segid = worker.segid;

        self.total_time.add(nanos(instr.total), segid);
        self.startup.add(nanos(instr.startup), segid);
        self.ntuples.add(instr.ntuples, segid);
        self.nloops.add(instr.nloops, segid);
        self.execmemused.add(instr.execmemused, segid);
        self.workmemused.add(instr.workmemused, segid);
        self.workmemwanted.add(instr.workmemwanted, segid);
        self.num_part_scanned.add(u64::from(instr.num_part_scanned), segid);

        if instr.workfile_created {
            self.workfiles_created += 1;
        }
        if let Some(method) = instr.sort_method {
            *self.sort_methods.entry(method).or_insert(0) += 1;
        }
        if let Some(space_type) = instr.sort_space_type {
            self.sort_space
                .entry(space_type)
                .or_default()
                .add(instr.sort_space_used, segid);
        }
    }

    /// Folds another partial summary of the same node in. Summaries that
    /// share a worker are not merged.
    pub fn merge(&mut self, other: &NodeSummary) {
        if other.node_id != self.node_id {
            warn!(
                node_id = self.node_id,
                other = other.node_id,
                "refusing to merge summaries of different nodes"
            );
            return;
        }
        if !self.workers.is_disjoint(&other.workers) {
            warn!(node_id = self.node_id, "overlapping worker statistics ignored");
            return;
        }

        self.workers.extend(other.workers.iter().copied());
        self.total_time.merge(&other.total_time);
        self.startup.merge(&other.startup);
        self.ntuples.merge(&other.ntuples);
        self.nloops.merge(&other.nloops);
        self.execmemused.merge(&other.execmemused);
        self.workmemused.merge(&other.workmemused);
        self.workmemwanted.merge(&other.workmemwanted);
        self.num_part_scanned.merge(&other.num_part_scanned);
        self.workfiles_created += other.workfiles_created;
        for (method, count) in &other.sort_methods {
            *self.sort_methods.entry(*method).or_insert(0) += count;
        }
        for (space_type, agg) in &other.sort_space {
            self.sort_space.entry(*space_type).or_default().merge(agg);
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Segments with at least one reporting worker.
    pub fn segments(&self) -> BTreeSet<SegmentId> {
        self.workers.iter().map(|w| w.segid).collect()
    }

    /// Rows per loop over all workers; zero when no loop completed.
    pub fn rows_per_loop(&self) -> f64 {
        if self.nloops.vsum == 0 {
            0.0
        } else {
            self.ntuples.vsum as f64 / self.nloops.vsum as f64
        }
    }

    /// Segment that spent the most time in this node.
    pub fn slowest_segment(&self) -> Option<SegmentId> {
        (!self.total_time.is_empty()).then_some(self.total_time.imax)
    }

    pub fn max_total_time(&self) -> Duration {
        Duration::from_nanos(self.total_time.vmax)
    }

    pub fn avg_total_time(&self) -> Duration {
        Duration::from_nanos(self.total_time.avg() as u64)
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// Builds per-node summaries for one query as worker snapshots arrive.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecStatsCollector {
    workers: BTreeSet<WorkerId>,
    nodes: BTreeMap<NodeId, NodeSummary>,
}

impl ExecStatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one worker's snapshot in. A repeated worker is ignored.
    pub fn add_worker(&mut self, stats: &WorkerStats) {
        let worker = stats.id();
        if !self.workers.insert(worker) {
            warn!(
                segid = stats.segid,
                pid = stats.pid,
                "duplicate worker snapshot ignored"
            );
            return;
        }
        for node in &stats.nodes {
            self.nodes
                .entry(node.node_id)
                .or_insert_with(|| NodeSummary::new(node.node_id))
                .add_worker(worker, &node.instr);
        }
    }

    /// Folds a collector built from a disjoint set of workers in.
    pub fn merge(&mut self, other: &ExecStatsCollector) {
        if !self.workers.is_disjoint(&other.workers) {
            warn!("overlapping worker sets; partial statistics ignored");
            return;
        }
        self.workers.extend(other.workers.iter().copied());
        for (node_id, summary) in &other.nodes {
            match self.nodes.get_mut(node_id) {
                Some(existing) => existing.merge(summary),
                None => {
                    self.nodes.insert(*node_id, summary.clone());
                }
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn node(&self, node_id: NodeId) -> Option<&NodeSummary> {
        self.nodes.get(&node_id)
    }

    /// Summaries in node id order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeSummary> {
        self.nodes.values()
    }

    pub fn into_summaries(self) -> BTreeMap<NodeId, NodeSummary> {
        self.nodes
    }
}
