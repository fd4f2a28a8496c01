use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;

use crate::{
    encoder::FormatVersion,
    frame::StackPools,
    ratelimit::RateLimiter,
    registry::ThreadId,
    scope::{Chunk, Scope},
};

/// Per-thread stack of nested scopes.
///
/// Only the owning thread pushes and pops. The sampler reads nothing but the
/// `current` slot, which is republished after every push and pop.
pub struct ScopeManager {
    thread_id: ThreadId,
    thread_name: Arc<str>,
    pools: Arc<StackPools>,
    format: FormatVersion,
    misuse: Arc<RateLimiter>,

    // Uncontended: the sampler never touches it.
    stack: Mutex<Vec<Scope>>,
    current: ArcSwapOption<Scope>,
}

impl ScopeManager {
    fn new(
        thread_id: ThreadId,
        thread_name: Arc<str>,
        pools: Arc<StackPools>,
        format: FormatVersion,
        misuse: Arc<RateLimiter>,
    ) -> Self {
        ScopeManager {
            thread_id,
            thread_name,
            pools,
            format,
            misuse,
            stack: Mutex::new(Vec::new()),
            current: ArcSwapOption::empty(),
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Opens a nested scope and makes it current.
    pub fn start_scope(&self, name: &str) -> Scope {
        let scope = Scope::new(
            self.pools.clone(),
            self.thread_id,
            self.thread_name.clone(),
            name,
            self.format,
        );
        let mut stack = self.stack.lock().unwrap_or_else(PoisonError::into_inner);
        stack.push(scope.clone());
        self.current.store(Some(Arc::new(scope.clone())));
        tracing::trace!(
            thread_id = self.thread_id,
            scope = name,
            depth = stack.len(),
            "scope started"
        );
        scope
    }

    /// Closes `scope` and every scope opened after it.
    ///
    /// Ending a scope that is not on this manager's stack is a caller bug;
    /// it is logged and the scope is closed anyway.
    pub fn end_scope(&self, scope: &Scope) -> Chunk {
        let mut stack = self.stack.lock().unwrap_or_else(PoisonError::into_inner);
        match stack.iter().rposition(|s| s.same_scope(scope)) {
            Some(pos) => {
                for abandoned in stack.drain(pos + 1..).rev() {
                    tracing::debug!(
                        thread_id = self.thread_id,
                        scope = abandoned.name(),
                        "force-closing scope left open by an outer end"
                    );
                    let _ = abandoned.close();
                }
                stack.pop();
            }
            None => {
                if let Some(suppressed) = self.misuse.check() {
                    tracing::warn!(
                        thread_id = self.thread_id,
                        scope = scope.name(),
                        suppressed,
                        "end_scope called for a scope not open on this thread"
                    );
                }
            }
        }
        self.current.store(stack.last().cloned().map(Arc::new));
        drop(stack);
        scope.close()
    }

    /// Lock-free read of the innermost open scope.
    pub fn current_scope(&self) -> Option<Scope> {
        self.current.load().as_deref().cloned()
    }

    pub fn depth(&self) -> usize {
        self.stack
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl std::fmt::Debug for ScopeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeManager")
            .field("thread_id", &self.thread_id)
            .field("thread_name", &self.thread_name)
            .field("current", &self.current_scope())
            .finish()
    }
}

/// Thread id to [`ScopeManager`] map. Owns the shared pools.
#[derive(Debug)]
pub struct ScopeDirectory {
    pools: Arc<StackPools>,
    managers: DashMap<ThreadId, Arc<ScopeManager>>,
    format: FormatVersion,
    misuse: Arc<RateLimiter>,
}

impl ScopeDirectory {
    pub fn new(pools: Arc<StackPools>, format: FormatVersion, misuse: Arc<RateLimiter>) -> Self {
        ScopeDirectory {
            pools,
            managers: DashMap::new(),
            format,
            misuse,
        }
    }

    /// Returns the manager for `id`, creating it on first use. Racing callers
    /// for the same id all get the same manager.
    pub fn for_thread(&self, id: ThreadId, name: &str) -> Arc<ScopeManager> {
        if let Some(manager) = self.managers.get(&id) {
            return manager.clone();
        }
        self.managers
            .entry(id)
            .or_insert_with(|| {
                Arc::new(ScopeManager::new(
                    id,
                    Arc::from(name),
                    self.pools.clone(),
                    self.format,
                    self.misuse.clone(),
                ))
            })
            .clone()
    }

    /// Existing manager for `id`, if any.
    pub fn get(&self, id: ThreadId) -> Option<Arc<ScopeManager>> {
        self.managers.get(&id).map(|m| m.clone())
    }

    /// Drops the manager for `id`. Scopes it handed out stay usable.
    pub fn remove(&self, id: ThreadId) -> Option<Arc<ScopeManager>> {
        self.managers.remove(&id).map(|(_, m)| m)
    }

    pub fn pools(&self) -> &Arc<StackPools> {
        &self.pools
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;

    fn directory() -> ScopeDirectory {
        ScopeDirectory::new(
            Arc::new(StackPools::new()),
            FormatVersion::Rle,
            Arc::new(RateLimiter::new(Duration::from_secs(10))),
        )
    }

    #[test]
    fn nested_scopes_are_lifo() {
        let dir = directory();
        let m = dir.for_thread(1, "main");
        assert!(m.current_scope().is_none());

        let a = m.start_scope("A");
        let b = m.start_scope("B");
        assert_eq!(m.current_scope(), Some(b.clone()));

        let chunk_b = m.end_scope(&b);
        assert_eq!(chunk_b.scope_name(), "B");
        assert_eq!(m.current_scope(), Some(a.clone()));

        m.end_scope(&a);
        assert!(m.current_scope().is_none());
        assert_eq!(m.depth(), 0);
    }

    #[test]
    fn ending_outer_scope_pops_inner_ones() {
        let dir = directory();
        let m = dir.for_thread(1, "main");
        let a = m.start_scope("A");
        let b = m.start_scope("B");
        let c = m.start_scope("C");

        m.end_scope(&a);
        assert!(m.current_scope().is_none());
        assert!(b.is_closed());
        assert!(c.is_closed());
        assert_eq!(m.depth(), 0);
    }

    #[test]
    fn ending_unknown_scope_still_yields_chunk() {
        let dir = directory();
        let m1 = dir.for_thread(1, "one");
        let m2 = dir.for_thread(2, "two");
        let a = m1.start_scope("A");
        let x = m2.start_scope("X");

        let chunk = m1.end_scope(&x);
        assert_eq!(chunk.scope_name(), "X");
        assert!(x.is_closed());
        // m1's stack is untouched
        assert_eq!(m1.current_scope(), Some(a.clone()));
        assert_eq!(m2.current_scope(), Some(x.clone()));

        // and ending it again on its own manager is consistent
        let again = m2.end_scope(&x);
        assert_eq!(again.scope_name(), "X");
        assert!(m2.current_scope().is_none());
    }

    #[test]
    fn for_thread_races_resolve_to_one_manager() {
        let dir = Arc::new(directory());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dir = dir.clone();
                thread::spawn(move || dir.for_thread(42, "shared"))
            })
            .collect();
        let managers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for m in &managers[1..] {
            assert!(Arc::ptr_eq(m, &managers[0]));
        }
        assert_eq!(dir.len(), 1);
    }
}
