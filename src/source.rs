use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::{error::SampleError, frame::Frame, registry::ThreadId};

/// One stack captured for one thread, leaf frame first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadStack {
    pub thread_id: ThreadId,
    pub frames: Vec<Frame>,
}

/// Captures call stacks of other threads.
///
/// Called only from the sampler thread. Implementations may omit ids of
/// threads that no longer exist and must not return more than `max_depth`
/// frames per stack (longer stacks are truncated by the sampler anyway).
pub trait StackSource: Send + Sync {
    fn snapshot(
        &self,
        ids: &[ThreadId],
        max_depth: usize,
    ) -> Result<Vec<ThreadStack>, SampleError>;
}

/// Reports nothing for every thread. Installed while sampling is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStackSource;

impl StackSource for NoopStackSource {
    fn snapshot(
        &self,
        _ids: &[ThreadId],
        _max_depth: usize,
    ) -> Result<Vec<ThreadStack>, SampleError> {
        Ok(Vec::new())
    }
}

type SharedSource = Arc<Box<dyn StackSource>>;

/// Selects which [`StackSource`] the sampler uses.
///
/// Swapping is a single atomic store, so it can happen at any time. A tick
/// already running keeps the source it loaded; the next tick sees the new one.
pub struct StackAccessGate {
    active: ArcSwap<Box<dyn StackSource>>,
    configured: ArcSwap<Box<dyn StackSource>>,
}

impl StackAccessGate {
    pub fn new(source: Box<dyn StackSource>) -> Self {
        let source: SharedSource = Arc::new(source);
        StackAccessGate {
            active: ArcSwap::new(source.clone()),
            configured: ArcSwap::new(source),
        }
    }

    /// Replaces the configured source and makes it active.
    pub fn install(&self, source: Box<dyn StackSource>) {
        let source: SharedSource = Arc::new(source);
        self.configured.store(source.clone());
        self.active.store(source);
    }

    pub fn enable(&self) {
        self.active.store(self.configured.load_full());
    }

    pub fn disable(&self) {
        self.active.store(Arc::new(Box::new(NoopStackSource)));
    }

    pub fn is_enabled(&self) -> bool {
        Arc::ptr_eq(&self.active.load(), &self.configured.load())
    }

    pub fn current(&self) -> SharedSource {
        self.active.load_full()
    }
}

impl Default for StackAccessGate {
    fn default() -> Self {
        Self::new(Box::new(NoopStackSource))
    }
}

impl std::fmt::Debug for StackAccessGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackAccessGate")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
