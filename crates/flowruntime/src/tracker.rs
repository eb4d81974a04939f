use parking_lot::Mutex;
use std::collections::HashSet;

/// Nodes of one scope that have been handed to the worker pool and not yet
/// reported back. Every operation takes the same lock.
#[derive(Debug, Default)]
pub struct ExecutionTracker {
    executing: Mutex<HashSet<String>>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the node was already tracked
    pub fn add(&self, node_id: &str) -> bool {
        self.executing.lock().insert(node_id.to_string())
    }

    pub fn remove(&self, node_id: &str) -> bool {
        self.executing.lock().remove(node_id)
    }

    /// Remove `node_id` and run `then` before releasing the lock, so that an
    /// observer seeing an empty tracker also sees whatever `then` published.
    pub fn remove_then<R>(&self, node_id: &str, then: impl FnOnce() -> R) -> R {
        let mut executing = self.executing.lock();
        executing.remove(node_id);
        then()
    }

    pub fn is_executing(&self, node_id: &str) -> bool {
        self.executing.lock().contains(node_id)
    }

    pub fn count(&self) -> usize {
        self.executing.lock().len()
    }

    /// Copy of the executing set
    pub fn get_executing_nodes(&self) -> HashSet<String> {
        self.executing.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.executing.lock().is_empty()
    }

    pub fn clear(&self) {
        self.executing.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn tracks_membership() {
        let tracker = ExecutionTracker::new();
        assert!(tracker.add("a"));
        assert!(!tracker.add("a"));
        tracker.add("b");
        assert_eq!(tracker.count(), 2);

        let snapshot = tracker.get_executing_nodes();
        tracker.remove("a");
        assert!(snapshot.contains("a"));
        assert!(!tracker.is_executing("a"));

        tracker.clear();
        assert!(tracker.is_empty());
    }

    #[test]
    fn concurrent_add_remove_balances() {
        let tracker = Arc::new(ExecutionTracker::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let id = format!("{}-{}", t, i);
                        tracker.add(&id);
                        tracker.remove_then(&id, || ());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(tracker.is_empty());
    }
}
