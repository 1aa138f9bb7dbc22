//! Per-process instrumentation context.
//!
//! A [`Backend`] stands for one executing process: its pid, segment and role,
//! the query it is running, and the shared slot region it may draw from. It is
//! the only way the executor obtains and returns statistics records.
//!
//! Every shared slot a backend picks is remembered in its owned-slot list
//! until the node releases it. A sweeper registered with the process's
//! [`ResourceLifecycle`] recycles whatever is still listed at each commit or
//! abort, and releases every slot stamped with the pid at process exit, so no
//! error path can leak a slot.

use crate::clock::Clock;
use crate::config::InstrumentConfig;
use crate::instrument::{InstrumentOptions, Instrumentation};
use crate::lifecycle::{ReleaseCallback, ReleasePhase, ResourceLifecycle};
use crate::plan::{
    DISPATCHER_SEGMENT, ExecFlags, NodeId, PlanNodeInfo, QueryIdentity, SegmentId,
};
use crate::shmem::{SlotMeta, SlotRef, SlotRegion};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// What kind of process is executing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    /// Coordinates the query and merges worker statistics.
    Dispatcher,
    /// Runs a plan slice on one segment.
    Executor,
    /// Single-node maintenance mode; never uses shared slots.
    Utility,
}

/// Identity stamped into every slot a process picks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendIdentity {
    pub pid: u32,
    pub segid: SegmentId,
    pub role: ProcessRole,
    pub query: QueryIdentity,
}

impl BackendIdentity {
    /// Identity of the calling OS process.
    pub fn current(segid: SegmentId, role: ProcessRole) -> Self {
        Self {
            pid: std::process::id(),
            segid,
            role,
            query: QueryIdentity::default(),
        }
    }

    pub fn dispatcher(pid: u32) -> Self {
        Self {
            pid,
            segid: DISPATCHER_SEGMENT,
            role: ProcessRole::Dispatcher,
            query: QueryIdentity::default(),
        }
    }

    pub fn executor(pid: u32, segid: SegmentId) -> Self {
        Self {
            pid,
            segid,
            role: ProcessRole::Executor,
            query: QueryIdentity::default(),
        }
    }
}

/// Slot counters of the region as seen from one segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShmemSummary {
    pub segid: SegmentId,
    pub num_free: usize,
    pub num_used: usize,
}

#[derive(Debug, Default)]
struct OwnedSlots {
    slots: Vec<(NodeId, SlotRef)>,
    salvaged: Vec<(NodeId, Instrumentation)>,
}

/// Recycles slots a backend still holds at transaction end and process exit.
struct SlotSweeper {
    pid: u32,
    region: Arc<SlotRegion>,
    owned: Arc<Mutex<OwnedSlots>>,
}

impl ReleaseCallback for SlotSweeper {
    fn on_release(&mut self, phase: ReleasePhase) {
        match phase {
            ReleasePhase::Commit | ReleasePhase::Abort => {
                let mut owned = self.owned.lock();
                owned.salvaged.clear();
                let leftover = std::mem::take(&mut owned.slots);
                if !leftover.is_empty() {
                    debug!(
                        pid = self.pid,
                        ?phase,
                        slots = leftover.len(),
                        "recycling leftover instrumentation slots"
                    );
                }
                for (node_id, slot) in leftover {
                    let copy = self.region.recycle(slot);
                    if phase == ReleasePhase::Abort
                        && let Some(instr) = copy
                    {
                        owned.salvaged.push((node_id, instr));
                    }
                }
            }
            ReleasePhase::ProcExit => {
                let mut owned = self.owned.lock();
                owned.slots.clear();
                owned.salvaged.clear();
                drop(owned);
                self.region.cleanup_process(self.pid);
            }
        }
    }
}

/// One executing process.
pub struct Backend {
    identity: BackendIdentity,
    config: InstrumentConfig,
    region: Option<Arc<SlotRegion>>,
    owned: Arc<Mutex<OwnedSlots>>,
}

impl Backend {
    /// Creates the context and registers its slot sweeper with `lifecycle`.
    pub fn new(
        identity: BackendIdentity,
        config: InstrumentConfig,
        region: Option<Arc<SlotRegion>>,
        lifecycle: &mut ResourceLifecycle,
    ) -> Self {
        let owned = Arc::new(Mutex::new(OwnedSlots::default()));
        if let Some(region) = &region {
            lifecycle.register(SlotSweeper {
                pid: identity.pid,
                region: Arc::clone(region),
                owned: Arc::clone(&owned),
            });
        }
        Self {
            identity,
            config,
            region,
            owned,
        }
    }

    pub fn identity(&self) -> &BackendIdentity {
        &self.identity
    }

    pub fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    /// Sets the query stamped into slots picked from now on.
    pub fn set_query(&mut self, query: QueryIdentity) {
        self.identity.query = query;
    }

    fn uses_shared_slots(&self) -> bool {
        self.config.enable_query_metrics && self.identity.role != ProcessRole::Utility
    }

    /// Returns a record for `plan`.
    ///
    /// Uses a shared slot when query metrics are on, the role allows it and
    /// the pool has room; otherwise a private record. Never fails.
    pub fn acquire_slot(
        &self,
        plan: &PlanNodeInfo,
        eflags: ExecFlags,
        options: InstrumentOptions,
    ) -> InstrHandle {
        if self.uses_shared_slots()
            && let Some(region) = &self.region
        {
            let meta = SlotMeta {
                pid: self.identity.pid,
                query: self.identity.query,
                segid: self.identity.segid,
                node_id: plan.node_id,
                eflags,
            };
            match region.pick(meta, options) {
                Some(slot) => {
                    self.owned.lock().slots.push((plan.node_id, slot));
                    return InstrHandle {
                        node_id: plan.node_id,
                        repr: Repr::Shared {
                            region: Arc::clone(region),
                            slot,
                        },
                    };
                }
                None => {
                    debug!(
                        node_id = plan.node_id,
                        "instrumentation slot pool exhausted; using private record"
                    );
                }
            }
        }

        InstrHandle::local(plan.node_id, Instrumentation::new(options))
    }

    /// Gives a record back.
    ///
    /// Returns the record the caller may keep reading: the private record
    /// itself, a private copy of a shared record that ran under EXPLAIN
    /// ANALYZE, or `None` once a shared slot is back in the pool.
    pub fn release_slot(&self, handle: InstrHandle) -> Option<Instrumentation> {
        match handle.repr {
            Repr::Local(instr) => Some(*instr),
            Repr::Shared { region, slot } => {
                self.owned.lock().slots.retain(|(_, owned)| *owned != slot);
                region.recycle(slot)
            }
        }
    }

    /// Records salvaged from slots recycled by the last abort.
    ///
    /// They are kept until the next transaction boundary.
    pub fn take_salvaged(&self) -> Vec<(NodeId, Instrumentation)> {
        std::mem::take(&mut self.owned.lock().salvaged)
    }

    /// Number of shared slots this backend still holds.
    pub fn owned_slots(&self) -> usize {
        self.owned.lock().slots.len()
    }

    pub fn shmem_summary(&self) -> ShmemSummary {
        let (num_free, num_used) = match &self.region {
            Some(region) => {
                let usage = region.usage();
                (usage.free, usage.used)
            }
            None => (0, 0),
        };
        ShmemSummary {
            segid: self.identity.segid,
            num_free,
            num_used,
        }
    }
}

enum Repr {
    Local(Box<Instrumentation>),
    Shared {
        region: Arc<SlotRegion>,
        slot: SlotRef,
    },
}

/// A node's statistics record, private or in a shared slot.
///
/// Operations on a shared record whose slot has already been recycled are
/// ignored.
pub struct InstrHandle {
    node_id: NodeId,
    repr: Repr,
}

impl InstrHandle {
    /// Wraps a private record.
    pub fn local(node_id: NodeId, instr: Instrumentation) -> Self {
        Self {
            node_id,
            repr: Repr::Local(Box::new(instr)),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn in_shmem(&self) -> bool {
        matches!(self.repr, Repr::Shared { .. })
    }

    pub fn slot(&self) -> Option<SlotRef> {
        match &self.repr {
            Repr::Local(_) => None,
            Repr::Shared { slot, .. } => Some(*slot),
        }
    }

    /// Runs `f` on the record. `None` if the shared slot is gone.
    pub fn update<R>(&mut self, f: impl FnOnce(&mut Instrumentation) -> R) -> Option<R> {
        match &mut self.repr {
            Repr::Local(instr) => Some(f(instr.as_mut())),
            Repr::Shared { region, slot } => {
                let result = region.with_instr(*slot, f);
                if result.is_none() {
                    debug!(node_id = self.node_id, "instrumentation slot already recycled");
                }
                result
            }
        }
    }

    pub fn start_node(&mut self, clock: &dyn Clock) {
        self.update(|instr| instr.start_node(clock));
    }

    pub fn stop_node(&mut self, clock: &dyn Clock, ntuples: u64) {
        self.update(|instr| instr.stop_node(clock, ntuples));
    }

    pub fn end_loop(&mut self) {
        self.update(Instrumentation::end_loop);
    }

    /// Private copy of the current record.
    pub fn snapshot(&self) -> Option<Instrumentation> {
        match &self.repr {
            Repr::Local(instr) => Some(instr.detached_copy()),
            Repr::Shared { region, slot } => {
                region.with_instr(*slot, |instr| instr.detached_copy())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::plan::PlanNodeKind;
    use std::time::Duration;

    fn enabled() -> InstrumentConfig {
        InstrumentConfig::new().with_query_metrics(true)
    }

    fn node(id: NodeId) -> PlanNodeInfo {
        PlanNodeInfo::new(id, PlanNodeKind::SeqScan)
    }

    fn acquire(backend: &Backend, id: NodeId, eflags: ExecFlags) -> InstrHandle {
        backend.acquire_slot(&node(id), eflags, InstrumentOptions::default())
    }

    fn region(capacity: usize) -> Arc<SlotRegion> {
        Arc::new(SlotRegion::new(capacity).unwrap())
    }

    #[test]
    fn test_acquire_uses_shared_slot_when_enabled() {
        let region = region(4);
        let mut lifecycle = ResourceLifecycle::new();
        let backend = Backend::new(
            BackendIdentity::executor(100, 0),
            enabled(),
            Some(Arc::clone(&region)),
            &mut lifecycle,
        );

        let handle = acquire(&backend, 1, ExecFlags::empty());
        assert!(handle.in_shmem());
        assert_eq!(backend.owned_slots(), 1);
        assert_eq!(region.usage().used, 1);
        assert_eq!(region.meta(handle.slot().unwrap()).unwrap().pid, 100);
    }

    #[test]
    fn test_acquire_falls_back_to_private() {
        let region = region(1);
        let mut lifecycle = ResourceLifecycle::new();

        let disabled = Backend::new(
            BackendIdentity::executor(1, 0),
            InstrumentConfig::new(),
            Some(Arc::clone(&region)),
            &mut lifecycle,
        );
        let h = acquire(&disabled, 1, ExecFlags::empty());
        assert!(!h.in_shmem());

        let utility = Backend::new(
            BackendIdentity {
                role: ProcessRole::Utility,
                ..BackendIdentity::executor(2, 0)
            },
            enabled(),
            Some(Arc::clone(&region)),
            &mut lifecycle,
        );
        assert!(!acquire(&utility, 1, ExecFlags::empty()).in_shmem());

        let no_region = Backend::new(
            BackendIdentity::executor(3, 0),
            enabled(),
            None,
            &mut lifecycle,
        );
        assert!(!acquire(&no_region, 1, ExecFlags::empty()).in_shmem());

        let backend = Backend::new(
            BackendIdentity::executor(4, 0),
            enabled(),
            Some(Arc::clone(&region)),
            &mut lifecycle,
        );
        let first = acquire(&backend, 1, ExecFlags::empty());
        let second = acquire(&backend, 2, ExecFlags::empty());
        assert!(first.in_shmem());
        assert!(!second.in_shmem());
        assert_eq!(region.usage().free, 0);
    }

    #[test]
    fn test_handle_drives_timing() {
        let clock = ManualClock::new();
        let region = region(2);
        let mut lifecycle = ResourceLifecycle::new();
        let backend = Backend::new(
            BackendIdentity::executor(9, 1),
            enabled(),
            Some(region),
            &mut lifecycle,
        );

        let mut handle = acquire(&backend, 3, ExecFlags::empty());
        handle.start_node(&clock);
        clock.advance(Duration::from_millis(2));
        handle.stop_node(&clock, 4);
        handle.end_loop();

        let snap = handle.snapshot().unwrap();
        assert!(!snap.in_shmem);
        assert_eq!(snap.ntuples, 4);
        assert_eq!(snap.nloops, 1);
        assert_eq!(snap.startup, Duration::from_millis(2));
    }

    #[test]
    fn test_release_returns_readable_record() {
        let region = region(4);
        let mut lifecycle = ResourceLifecycle::new();
        let backend = Backend::new(
            BackendIdentity::executor(5, 0),
            enabled(),
            Some(Arc::clone(&region)),
            &mut lifecycle,
        );

        let mut analyze = acquire(&backend, 1, ExecFlags::EXPLAIN_ANALYZE);
        analyze.update(|i| i.ntuples = 12);
        let plain = acquire(&backend, 2, ExecFlags::empty());

        let kept = backend.release_slot(analyze).unwrap();
        assert_eq!(kept.ntuples, 12);
        assert!(!kept.in_shmem);
        assert!(backend.release_slot(plain).is_none());
        assert_eq!(backend.owned_slots(), 0);
        assert_eq!(region.usage().used, 0);

        let mut local = InstrHandle::local(7, Instrumentation::default());
        local.update(|i| i.nloops = 1);
        assert_eq!(backend.release_slot(local).unwrap().nloops, 1);
    }

    #[test]
    fn test_commit_sweeps_leftover_slots() {
        let region = region(4);
        let mut lifecycle = ResourceLifecycle::new();
        let backend = Backend::new(
            BackendIdentity::executor(5, 0),
            enabled(),
            Some(Arc::clone(&region)),
            &mut lifecycle,
        );

        let mut handle = acquire(&backend, 1, ExecFlags::empty());
        acquire(&backend, 2, ExecFlags::empty());
        assert_eq!(region.usage().used, 2);

        lifecycle.commit();
        assert_eq!(region.usage().used, 0);
        assert_eq!(backend.owned_slots(), 0);
        assert!(handle.update(|i| i.nloops).is_none());
        assert!(backend.release_slot(handle).is_none());
        assert_eq!(region.usage().free, 4);
    }

    #[test]
    fn test_abort_salvages_explain_analyze_records() {
        let region = region(4);
        let mut lifecycle = ResourceLifecycle::new();
        let backend = Backend::new(
            BackendIdentity::executor(5, 0),
            enabled(),
            Some(Arc::clone(&region)),
            &mut lifecycle,
        );

        let mut handle = acquire(&backend, 4, ExecFlags::EXPLAIN_ANALYZE);
        handle.update(|i| i.ntuples = 3);
        acquire(&backend, 5, ExecFlags::empty());

        lifecycle.abort();
        let salvaged = backend.take_salvaged();
        assert_eq!(salvaged.len(), 1);
        assert_eq!(salvaged[0].0, 4);
        assert_eq!(salvaged[0].1.ntuples, 3);
        assert_eq!(region.usage().used, 0);
        assert!(backend.take_salvaged().is_empty());
    }

    #[test]
    fn test_salvaged_records_do_not_pile_up() {
        let region = region(4);
        let mut lifecycle = ResourceLifecycle::new();
        let backend = Backend::new(
            BackendIdentity::executor(5, 0),
            enabled(),
            Some(Arc::clone(&region)),
            &mut lifecycle,
        );

        for _ in 0..100 {
            acquire(&backend, 1, ExecFlags::EXPLAIN_ANALYZE);
            lifecycle.abort();
            lifecycle.commit();
        }
        assert!(backend.take_salvaged().is_empty());

        acquire(&backend, 1, ExecFlags::EXPLAIN_ANALYZE);
        lifecycle.abort();
        acquire(&backend, 2, ExecFlags::EXPLAIN_ANALYZE);
        lifecycle.abort();
        let salvaged = backend.take_salvaged();
        assert_eq!(salvaged.len(), 1);
        assert_eq!(salvaged[0].0, 2);

        acquire(&backend, 3, ExecFlags::EXPLAIN_ANALYZE);
        lifecycle.abort();
        lifecycle.proc_exit();
        assert!(backend.take_salvaged().is_empty());
        assert_eq!(region.usage().used, 0);
    }

    #[test]
    fn test_process_exit_releases_everything() {
        let region = region(8);
        let backend_slots = {
            let mut lifecycle = ResourceLifecycle::new();
            let backend = Backend::new(
                BackendIdentity::executor(77, 2),
                enabled(),
                Some(Arc::clone(&region)),
                &mut lifecycle,
            );
            for id in 0..5 {
                acquire(&backend, id, ExecFlags::empty());
            }
            region.owned_by(77)
        };
        assert_eq!(backend_slots, 5);
        assert_eq!(region.owned_by(77), 0);
        assert_eq!(region.usage().used, 0);
    }

    #[test]
    fn test_failing_process_does_not_leak_slots() {
        let region = region(32);
        std::thread::scope(|s| {
            let workers: Vec<_> = (0..4u32)
                .map(|n| {
                    let region = Arc::clone(&region);
                    s.spawn(move || {
                        let mut lifecycle = ResourceLifecycle::new();
                        let backend = Backend::new(
                            BackendIdentity::executor(1000 + n, n as SegmentId),
                            enabled(),
                            Some(region),
                            &mut lifecycle,
                        );
                        let mut handles: Vec<_> = (0..6)
                            .map(|id| acquire(&backend, id, ExecFlags::empty()))
                            .collect();
                        for handle in handles.drain(..3) {
                            backend.release_slot(handle);
                        }
                        if n == 2 {
                            panic!("segment {} failed", n);
                        }
                        lifecycle.commit();
                    })
                })
                .collect();
            let failed = workers.into_iter().filter_map(|w| w.join().err()).count();
            assert_eq!(failed, 1);
        });

        let usage = region.usage();
        assert_eq!(usage.used, 0);
        assert_eq!(usage.free, usage.capacity);
    }

    #[test]
    fn test_shmem_summary() {
        let region = region(10);
        let mut lifecycle = ResourceLifecycle::new();
        let backend = Backend::new(
            BackendIdentity::executor(5, 3),
            enabled(),
            Some(region),
            &mut lifecycle,
        );
        acquire(&backend, 1, ExecFlags::empty());
        assert_eq!(
            backend.shmem_summary(),
            ShmemSummary {
                segid: 3,
                num_free: 9,
                num_used: 1
            }
        );

        let bare = Backend::new(BackendIdentity::dispatcher(6), enabled(), None, &mut lifecycle);
        assert_eq!(bare.shmem_summary().num_used, 0);
        assert_eq!(bare.shmem_summary().segid, DISPATCHER_SEGMENT);
    }
}
