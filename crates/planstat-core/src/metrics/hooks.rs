//! Observers of node and query lifecycle events.
//!
//! Hooks see every event, whether or not a datagram is sent for it.

use super::packet::{NodePacket, QueryPacket};

/// A lifecycle event as reported to hooks.
#[derive(Clone, Copy, Debug)]
pub enum MetricsEvent<'a> {
    Node(&'a NodePacket),
    Query(&'a QueryPacket),
}

pub trait MetricsHook: Send {
    fn on_event(&mut self, event: &MetricsEvent<'_>);
}

impl<F> MetricsHook for F
where
    F: FnMut(&MetricsEvent<'_>) + Send,
{
    fn on_event(&mut self, event: &MetricsEvent<'_>) {
        self(event)
    }
}

/// Ordered hook chain.
#[derive(Default)]
pub struct MetricsHooks {
    hooks: Vec<Box<dyn MetricsHook>>,
}

impl MetricsHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hook: impl MetricsHook + 'static) {
        self.hooks.push(Box::new(hook));
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Invokes every hook in registration order.
    pub fn dispatch(&mut self, event: &MetricsEvent<'_>) {
        for hook in &mut self.hooks {
            hook.on_event(event);
        }
    }
}
