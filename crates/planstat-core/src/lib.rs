//! planstat-core: plan-node instrumentation and statistics.
//!
//! Provides:
//! - `instrument`: per-node statistics record and its timing state machine
//! - `shmem`: bounded pool of shared instrumentation slots
//! - `backend`: per-process context: identity, owned slots, node handles
//! - `lifecycle`: release callbacks run at transaction end and process exit
//! - `explain`: dispatcher-side merge of per-worker statistics
//! - `codec`: wire format of worker statistics messages
//! - `metrics`: best-effort UDP telemetry of node and query events
//! - `seginfo`: periodic segment memory reports
//! - `config`, `clock`, `plan`, `fs`, `fmt`: collaborators and helpers

pub mod backend;
pub mod clock;
pub mod codec;
pub mod config;
pub mod explain;
pub mod fmt;
pub mod fs;
pub mod instrument;
pub mod lifecycle;
pub mod metrics;
pub mod plan;
pub mod seginfo;
pub mod shmem;
