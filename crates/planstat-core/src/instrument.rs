//! Per-node statistics record and its timing state machine.
//!
//! Every plan node owns one [`Instrumentation`]. The executor brackets each
//! unit of work with [`start_node`](Instrumentation::start_node) and
//! [`stop_node`](Instrumentation::stop_node), and calls
//! [`end_loop`](Instrumentation::end_loop) when a full pass (cycle) over the
//! node is complete:
//!
//! ```text
//!            start_node                stop_node(n)
//!   Idle ───────────────▶ Running ─────────────────▶ Idle
//!    ▲                                                 │
//!    │            end_loop: fold cycle into totals     │
//!    └─────────────────────────────────────────────────┘
//! ```
//!
//! Per-cycle fields (`counter`, `firsttuple`, `tuplecount`) are folded into
//! the lifetime totals by `end_loop` and reset, so one record can describe a
//! node that is rescanned many times. Startup latency is taken from the first
//! cycle only.
//!
//! Misuse (double start, stop without start, end loop on an open cycle) is
//! reported at debug level and never fails: instrumentation must not abort
//! the query it measures.

use crate::clock::{Clock, InstrTime};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Algorithm used by a sort node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SortMethod {
    TopNHeapsort,
    Quicksort,
    ExternalSort,
    ExternalMerge,
}

impl SortMethod {
    pub fn name(self) -> &'static str {
        match self {
            SortMethod::TopNHeapsort => "top-N heapsort",
            SortMethod::Quicksort => "quicksort",
            SortMethod::ExternalSort => "external sort",
            SortMethod::ExternalMerge => "external merge",
        }
    }
}

/// Where a sort kept its data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SortSpaceType {
    Memory,
    Disk,
}

impl SortSpaceType {
    pub fn name(self) -> &'static str {
        match self {
            SortSpaceType::Memory => "Memory",
            SortSpaceType::Disk => "Disk",
        }
    }
}

/// Which metrics a node wants collected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstrumentOptions {
    /// Take timestamps around every unit of work.
    pub timer: bool,
    /// Collect memory, sort and workfile metrics.
    pub cdb: bool,
}

impl InstrumentOptions {
    /// Count rows and loops without touching the clock.
    pub const ROWS_ONLY: InstrumentOptions = InstrumentOptions {
        timer: false,
        cdb: false,
    };

    pub const ALL: InstrumentOptions = InstrumentOptions {
        timer: true,
        cdb: true,
    };
}

impl Default for InstrumentOptions {
    fn default() -> Self {
        Self::ALL
    }
}

/// Statistics accumulator for one plan node in one process.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Instrumentation {
    /// Record lives in a shared slot and must be recycled.
    pub in_shmem: bool,
    pub need_timer: bool,
    pub need_cdb: bool,

    // Current cycle
    /// First tuple of this cycle has been produced.
    pub running: bool,
    /// Start of the open unit of work; `None` while idle.
    pub starttime: Option<InstrTime>,
    /// Time accumulated in this cycle.
    pub counter: Duration,
    /// Latency to the first tuple of this cycle.
    pub firsttuple: Duration,
    pub tuplecount: u64,

    // Completed cycles
    /// First-tuple latency of the first cycle.
    pub startup: Duration,
    pub total: Duration,
    pub ntuples: u64,
    pub nloops: u64,

    // Resources
    pub execmemused: u64,
    pub workmemused: u64,
    pub workmemwanted: u64,
    /// Start of the first unit of work that produced a tuple.
    pub firststart: Option<InstrTime>,
    pub workfile_created: bool,
    pub num_part_scanned: u32,
    pub sort_method: Option<SortMethod>,
    pub sort_space_type: Option<SortSpaceType>,
    /// Sort space in kilobytes.
    pub sort_space_used: u64,
}

impl Instrumentation {
    /// Zeroed private record.
    pub fn new(options: InstrumentOptions) -> Self {
        Self {
            need_timer: options.timer,
            need_cdb: options.cdb,
            ..Self::default()
        }
    }

    /// No unit of work is open.
    pub fn is_idle(&self) -> bool {
        self.starttime.is_none()
    }

    /// Entry to the node.
    pub fn start_node(&mut self, clock: &dyn Clock) {
        if !self.need_timer {
            return;
        }
        if self.starttime.is_some() {
            debug!("start_node called twice in a row");
            return;
        }
        self.starttime = Some(clock.now());
    }

    /// Exit from the node after producing `ntuples` tuples.
    pub fn stop_node(&mut self, clock: &dyn Clock, ntuples: u64) {
        self.tuplecount += ntuples;

        if !self.need_timer {
            self.running = true;
            return;
        }

        let Some(start) = self.starttime else {
            debug!("stop_node called without start");
            return;
        };

        let now = clock.now();
        self.counter += now.saturating_sub(start);

        if !self.running {
            self.running = true;
            self.firsttuple = self.counter;
            self.firststart = Some(start);
        }

        self.starttime = None;
    }

    /// Finishes a cycle and folds it into the lifetime totals.
    pub fn end_loop(&mut self) {
        if !self.running {
            return;
        }

        if self.starttime.is_some() {
            debug!("end_loop called on running node");
        }

        if self.nloops == 0 {
            self.startup = self.firsttuple;
        }

        self.total += self.counter;
        self.ntuples += self.tuplecount;
        self.nloops += 1;

        self.running = false;
        self.starttime = None;
        self.counter = Duration::ZERO;
        self.firsttuple = Duration::ZERO;
        self.tuplecount = 0;
    }

    /// Private copy that no longer refers to a shared slot.
    pub fn detached_copy(&self) -> Instrumentation {
        Instrumentation {
            in_shmem: false,
            ..self.clone()
        }
    }

    /// Records memory figures, keeping the peak of each.
    pub fn record_memory(&mut self, execmem: u64, workmem_used: u64, workmem_wanted: u64) {
        self.execmemused = self.execmemused.max(execmem);
        self.workmemused = self.workmemused.max(workmem_used);
        self.workmemwanted = self.workmemwanted.max(workmem_wanted);
    }

    pub fn record_sort(&mut self, method: SortMethod, space_type: SortSpaceType, space_kb: u64) {
        self.sort_method = Some(method);
        self.sort_space_type = Some(space_type);
        self.sort_space_used = self.sort_space_used.max(space_kb);
    }

    pub fn mark_workfile_created(&mut self) {
        self.workfile_created = true;
    }

    pub fn add_partitions_scanned(&mut self, parts: u32) {
        self.num_part_scanned = self.num_part_scanned.saturating_add(parts);
    }

    /// Average rows per completed cycle; zero when nothing completed.
    pub fn rows_per_loop(&self) -> f64 {
        if self.nloops == 0 {
            0.0
        } else {
            self.ntuples as f64 / self.nloops as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn run_cycle(instr: &mut Instrumentation, clock: &ManualClock, first: Duration, tuples: u64) {
        instr.start_node(clock);
        clock.advance(first);
        instr.stop_node(clock, tuples);
        instr.end_loop();
    }

    #[test]
    fn test_n_cycles_accumulate() {
        let clock = ManualClock::new();
        let mut instr = Instrumentation::new(InstrumentOptions::default());

        let deltas = [3u64, 0, 7, 11, 1];
        for &n in &deltas {
            run_cycle(&mut instr, &clock, ms(2), n);
        }

        assert_eq!(instr.ntuples, deltas.iter().sum::<u64>());
        assert_eq!(instr.nloops, deltas.len() as u64);
        assert_eq!(instr.total, ms(10));
        assert!(instr.is_idle());
        assert!(!instr.running);
        assert_eq!(instr.tuplecount, 0);
    }

    #[test]
    fn test_startup_from_first_cycle_only() {
        let clock = ManualClock::new();
        let mut instr = Instrumentation::new(InstrumentOptions::default());

        run_cycle(&mut instr, &clock, ms(5), 1);
        run_cycle(&mut instr, &clock, ms(1), 1);

        assert_eq!(instr.startup, ms(5));
        assert_eq!(instr.nloops, 2);
    }

    #[test]
    fn test_stop_without_start_keeps_totals() {
        let clock = ManualClock::new();
        let mut instr = Instrumentation::new(InstrumentOptions::default());

        clock.advance(ms(4));
        instr.stop_node(&clock, 3);

        assert_eq!(instr.counter, Duration::ZERO);
        assert_eq!(instr.tuplecount, 3);
        assert!(!instr.running);

        // Nothing was produced in a timed cycle, so there is nothing to fold.
        instr.end_loop();
        assert_eq!(instr.nloops, 0);
        assert_eq!(instr.ntuples, 0);
        assert_eq!(instr.total, Duration::ZERO);
    }

    #[test]
    fn test_double_start_keeps_first_timestamp() {
        let clock = ManualClock::starting_at(ms(1));
        let mut instr = Instrumentation::new(InstrumentOptions::default());

        instr.start_node(&clock);
        clock.advance(ms(2));
        instr.start_node(&clock);
        assert_eq!(instr.starttime, Some(ms(1)));

        clock.advance(ms(1));
        instr.stop_node(&clock, 1);
        assert_eq!(instr.counter, ms(3));
        assert_eq!(instr.firststart, Some(ms(1)));
    }

    #[test]
    fn test_two_cycle_example() {
        let clock = ManualClock::new();
        let mut instr = Instrumentation::new(InstrumentOptions::default());

        // Cycle A: 10 tuples over 3 time units, first tuple after 1.
        instr.start_node(&clock);
        clock.advance(ms(1));
        instr.stop_node(&clock, 1);
        instr.start_node(&clock);
        clock.advance(ms(2));
        instr.stop_node(&clock, 9);
        assert_eq!(instr.firsttuple, ms(1));
        instr.end_loop();

        // Cycle B: 5 tuples over 1 time unit.
        instr.start_node(&clock);
        clock.advance(ms(1));
        instr.stop_node(&clock, 5);
        instr.end_loop();

        assert_eq!(instr.ntuples, 15);
        assert_eq!(instr.nloops, 2);
        assert_eq!(instr.startup, ms(1));
        assert_eq!(instr.total, ms(4));
        assert_eq!(instr.rows_per_loop(), 7.5);
    }

    #[test]
    fn test_end_loop_on_open_cycle_still_folds() {
        let clock = ManualClock::new();
        let mut instr = Instrumentation::new(InstrumentOptions::default());

        run_cycle(&mut instr, &clock, ms(1), 2);
        instr.start_node(&clock);
        clock.advance(ms(1));
        instr.stop_node(&clock, 1);
        instr.start_node(&clock);
        instr.end_loop();

        assert_eq!(instr.nloops, 2);
        assert_eq!(instr.ntuples, 3);
        assert!(instr.is_idle());
    }

    #[test]
    fn test_rows_only_counts_without_clock() {
        let clock = ManualClock::new();
        let mut instr = Instrumentation::new(InstrumentOptions::ROWS_ONLY);

        instr.start_node(&clock);
        clock.advance(ms(10));
        instr.stop_node(&clock, 4);
        instr.stop_node(&clock, 6);
        instr.end_loop();

        assert_eq!(instr.ntuples, 10);
        assert_eq!(instr.nloops, 1);
        assert_eq!(instr.total, Duration::ZERO);
        assert_eq!(instr.firststart, None);
    }

    #[test]
    fn test_resource_metrics_keep_peak() {
        let mut instr = Instrumentation::new(InstrumentOptions::ALL);
        instr.record_memory(100, 50, 80);
        instr.record_memory(60, 70, 20);
        instr.record_sort(SortMethod::Quicksort, SortSpaceType::Memory, 25);
        instr.record_sort(SortMethod::ExternalMerge, SortSpaceType::Disk, 12);
        instr.add_partitions_scanned(3);
        instr.mark_workfile_created();

        assert_eq!(instr.execmemused, 100);
        assert_eq!(instr.workmemused, 70);
        assert_eq!(instr.workmemwanted, 80);
        assert_eq!(instr.sort_method, Some(SortMethod::ExternalMerge));
        assert_eq!(instr.sort_space_type, Some(SortSpaceType::Disk));
        assert_eq!(instr.sort_space_used, 25);
        assert_eq!(instr.num_part_scanned, 3);
        assert!(instr.workfile_created);

        let copy = Instrumentation {
            in_shmem: true,
            ..instr.clone()
        }
        .detached_copy();
        assert!(!copy.in_shmem);
        assert_eq!(copy.execmemused, 100);
    }

    #[test]
    fn test_zero_loops_average() {
        let instr = Instrumentation::default();
        assert_eq!(instr.rows_per_loop(), 0.0);
    }
}
