//! Callback fan-out with per-listener failure containment.
//!
//! Listeners are stored behind an `RwLock` and dispatched from a snapshot,
//! so registering a listener or clearing the list while a dispatch is in
//! flight never blocks the dispatch or invalidates it.

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::{Error, PipelineStage, Result, StageError};

use super::recovery::with_recovery;

/// A registered listener.
pub type Callback<T> = Arc<dyn Fn(&T) -> Result<()> + Send + Sync>;

pub(crate) fn read<V>(lock: &RwLock<V>) -> RwLockReadGuard<'_, V> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write<V>(lock: &RwLock<V>) -> RwLockWriteGuard<'_, V> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// CallbackList
// =============================================================================

/// Ordered list of listeners for one kind of payload.
pub struct CallbackList<T> {
    callbacks: RwLock<Vec<Callback<T>>>,
}

impl<T> CallbackList<T> {
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn add<F>(&self, callback: F)
    where
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        write(&self.callbacks).push(Arc::new(callback));
    }

    /// Current listeners, in registration order.
    pub fn snapshot(&self) -> Vec<Callback<T>> {
        read(&self.callbacks).clone()
    }

    pub fn clear(&self) {
        write(&self.callbacks).clear();
    }

    pub fn len(&self) -> usize {
        read(&self.callbacks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `payload` to every listener.
    ///
    /// Each listener runs under panic recovery. Failures are logged and
    /// returned; they never stop delivery to the remaining listeners.
    pub fn dispatch(&self, payload: &T, name: &str) -> Vec<Error> {
        let mut failures = Vec::new();
        for callback in self.snapshot() {
            if let Err(e) = with_recovery(|| callback(payload), name) {
                if !e.is_interrupted() {
                    tracing::warn!("Listener failed during {}: {}", name, e);
                }
                failures.push(e);
            }
        }
        failures
    }
}

impl<T> Default for CallbackList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CallbackList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackList")
            .field("len", &self.len())
            .finish()
    }
}

// =============================================================================
// PrioritizedCallbacks
// =============================================================================

/// Hook list ordered by priority (highest first), then registration order.
pub struct PrioritizedCallbacks<T> {
    entries: RwLock<Vec<(i32, Callback<T>)>>,
}

impl<T> PrioritizedCallbacks<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn add<F>(&self, priority: i32, callback: F)
    where
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        let mut entries = write(&self.entries);
        let position = entries
            .iter()
            .position(|(existing, _)| *existing < priority)
            .unwrap_or(entries.len());
        entries.insert(position, (priority, Arc::new(callback)));
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every hook; each failure is tagged with `stage`.
    pub fn run(&self, payload: &T, stage: PipelineStage) -> Vec<StageError> {
        let hooks: Vec<Callback<T>> = read(&self.entries)
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();

        let mut failures = Vec::new();
        for hook in hooks {
            if let Err(e) = with_recovery(|| hook(payload), stage.as_str()) {
                tracing::warn!("Hook failed in {} stage: {}", stage, e);
                failures.push(StageError::new(stage, e));
            }
        }
        failures
    }
}

impl<T> Default for PrioritizedCallbacks<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for PrioritizedCallbacks<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrioritizedCallbacks")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_failing_listener_does_not_stop_siblings() {
        let list = CallbackList::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        list.add(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        list.add(|_| Err(Error::validation("listener exploded")));
        list.add(|_| -> Result<()> { panic!("listener panicked") });
        let h = hits.clone();
        list.add(move |v| {
            h.fetch_add(*v as usize, Ordering::SeqCst);
            Ok(())
        });

        let failures = list.dispatch(&10, "test dispatch");
        assert_eq!(failures.len(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
        assert!(logs_contain("listener exploded"));
    }

    #[test]
    fn test_snapshot_survives_concurrent_clear() {
        let list = Arc::new(CallbackList::<()>::new());
        let inner = list.clone();
        list.add(move |_| {
            inner.clear();
            Ok(())
        });
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        list.add(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(list.dispatch(&(), "clear").is_empty());
        // The second listener still ran from the snapshot.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(list.is_empty());
    }

    #[test]
    fn test_interruption_is_reported_to_caller() {
        let list = CallbackList::<()>::new();
        list.add(|_| Err(Error::Interrupted));
        let failures = list.dispatch(&(), "pump");
        assert!(failures[0].is_interrupted());
    }

    #[test]
    fn test_prioritized_order_is_priority_then_insertion() {
        let hooks = PrioritizedCallbacks::<()>::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (priority, label) in [(0, "a"), (10, "b"), (0, "c"), (5, "d"), (10, "e")] {
            let order = order.clone();
            hooks.add(priority, move |_| {
                order.lock().unwrap().push(label);
                Ok(())
            });
        }

        assert!(hooks.run(&(), PipelineStage::BeforeCell).is_empty());
        assert_eq!(*order.lock().unwrap(), vec!["b", "e", "d", "a", "c"]);
    }

    #[test]
    fn test_hook_failures_are_stage_tagged() {
        let hooks = PrioritizedCallbacks::<()>::new();
        hooks.add(0, |_| Err(Error::validation("bad hook")));
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        hooks.add(0, move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let failures = hooks.run(&(), PipelineStage::AfterCell);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].stage, PipelineStage::AfterCell);
        assert!(matches!(*failures[0].source, Error::Validation(_)));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
