//! Resource-release callbacks run at transaction end and process exit.
//!
//! Each backend owns one [`ResourceLifecycle`]. Components register a
//! [`ReleaseCallback`] once; the lifecycle invokes it at every commit and
//! abort boundary and exactly once at process exit. Exit also runs when the
//! lifecycle is dropped, which covers early returns and unwinding.

use tracing::debug;

/// Boundary at which callbacks are invoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReleasePhase {
    Commit,
    Abort,
    ProcExit,
}

/// Cleanup hook registered with a [`ResourceLifecycle`].
pub trait ReleaseCallback: Send {
    fn on_release(&mut self, phase: ReleasePhase);
}

impl<F> ReleaseCallback for F
where
    F: FnMut(ReleasePhase) + Send,
{
    fn on_release(&mut self, phase: ReleasePhase) {
        self(phase)
    }
}

/// Per-process callback registry.
#[derive(Default)]
pub struct ResourceLifecycle {
    callbacks: Vec<Box<dyn ReleaseCallback>>,
    exited: bool,
}

impl ResourceLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a callback. Commit and abort run callbacks in registration order;
    /// exit runs them in reverse.
    pub fn register(&mut self, callback: impl ReleaseCallback + 'static) {
        if self.exited {
            debug!("callback registered after process exit; ignored");
            return;
        }
        self.callbacks.push(Box::new(callback));
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn has_exited(&self) -> bool {
        self.exited
    }

    pub fn commit(&mut self) {
        self.end_transaction(ReleasePhase::Commit);
    }

    pub fn abort(&mut self) {
        self.end_transaction(ReleasePhase::Abort);
    }

    /// Runs the exit phase. Later calls do nothing.
    pub fn proc_exit(&mut self) {
        if self.exited {
            return;
        }
        self.exited = true;
        for callback in self.callbacks.iter_mut().rev() {
            callback.on_release(ReleasePhase::ProcExit);
        }
        self.callbacks.clear();
    }

    fn end_transaction(&mut self, phase: ReleasePhase) {
        if self.exited {
            debug!(?phase, "transaction boundary after process exit; ignored");
            return;
        }
        for callback in &mut self.callbacks {
            callback.on_release(phase);
        }
    }
}

impl Drop for ResourceLifecycle {
    fn drop(&mut self) {
        self.proc_exit();
    }
}
