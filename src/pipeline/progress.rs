//! Resumable cursor over one cycle's universe.
//!
//! `NotStarted → Initialized(cycle) → (batch → mark) … → Complete`. The only
//! mutation after initialization is [`ProgressTracker::mark_completed`], and
//! the caller invokes it after the batch's results are durably merged, so a
//! crash mid-batch simply replays that batch.

use crate::models::ProcessingState;
use crate::storage::{get_json, put_json, KeyValueStore, StorageError};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) const NAMESPACE: &str = "state";
pub(crate) const KEY: &str = "processing";

/// Cycles are calendar days (UTC).
pub fn cycle_id_for(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

pub struct ProgressTracker {
    store: Arc<dyn KeyValueStore>,
    state: ProcessingState,
    initialized: bool,
}

impl ProgressTracker {
    /// Resume persisted state for `cycle_id`. State from any other cycle, or
    /// state that no longer decodes, is ignored and will be overwritten on
    /// [`initialize`](Self::initialize).
    pub fn load(store: Arc<dyn KeyValueStore>, cycle_id: &str) -> Result<Self, StorageError> {
        let persisted: Option<ProcessingState> = match get_json(store.as_ref(), NAMESPACE, KEY) {
            Err(e @ StorageError::Corrupt { .. }) => {
                warn!("Discarding unreadable progress state: {}", e);
                None
            }
            other => other?,
        };

        let (state, initialized) = match persisted {
            Some(state) if state.cycle_id == cycle_id => (state, true),
            Some(stale) => {
                info!("Starting cycle {} (previous cycle {} discarded)", cycle_id, stale.cycle_id);
                (Self::fresh(cycle_id), false)
            }
            None => (Self::fresh(cycle_id), false),
        };

        Ok(Self { store, state, initialized })
    }

    /// Read the persisted state without binding to a cycle.
    pub fn peek(store: &dyn KeyValueStore) -> Result<Option<ProcessingState>, StorageError> {
        get_json(store, NAMESPACE, KEY)
    }

    fn fresh(cycle_id: &str) -> ProcessingState {
        ProcessingState {
            cycle_id: cycle_id.to_string(),
            pending: Vec::new(),
            completed: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn has_state(&self) -> bool {
        self.initialized
    }

    /// Start the cycle over `universe`. No-op when resuming the same cycle.
    pub fn initialize(&mut self, universe: Vec<String>) -> Result<(), StorageError> {
        if self.initialized {
            return Ok(());
        }

        let mut seen = HashSet::new();
        self.state.pending = universe.into_iter().filter(|s| seen.insert(s.clone())).collect();
        self.state.completed.clear();
        self.initialized = true;

        info!("Cycle {} initialized with {} symbols", self.state.cycle_id, self.state.pending.len());
        self.persist()
    }

    /// Up to `size` symbols from the front of pending. Does not mutate.
    pub fn next_batch(&self, size: usize) -> Vec<String> {
        self.state.pending.iter().take(size).cloned().collect()
    }

    /// Move `symbols` from pending to completed and persist. Symbols that are
    /// not pending are ignored, so repeating a call changes nothing.
    pub fn mark_completed(&mut self, symbols: &[String]) -> Result<(), StorageError> {
        let done: HashSet<&str> = symbols.iter().map(String::as_str).collect();

        let (moved, pending): (Vec<String>, Vec<String>) = std::mem::take(&mut self.state.pending)
            .into_iter()
            .partition(|s| done.contains(s.as_str()));

        self.state.pending = pending;
        self.state.completed.extend(moved);
        self.persist()
    }

    #[cfg(test)]
    pub fn is_complete(&self) -> bool {
        self.initialized && self.state.pending.is_empty()
    }

    /// `(completed, total)`
    pub fn progress(&self) -> (usize, usize) {
        let completed = self.state.completed.len();
        (completed, completed + self.state.pending.len())
    }

    pub fn pending_count(&self) -> usize {
        self.state.pending.len()
    }

    fn persist(&mut self) -> Result<(), StorageError> {
        self.state.last_updated = Utc::now();
        put_json(self.store.as_ref(), NAMESPACE, KEY, &self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn symbols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn store() -> Arc<dyn KeyValueStore> {
        Arc::new(MemoryStore::new())
    }

    #[test]
    fn test_cycle_id_is_utc_date() {
        let now = Utc.with_ymd_and_hms(2026, 3, 9, 23, 59, 0).unwrap();
        assert_eq!(cycle_id_for(now), "2026-03-09");
    }

    #[test]
    fn test_next_batch_is_a_peek() {
        let mut t = ProgressTracker::load(store(), "c1").unwrap();
        t.initialize(symbols(&["A", "B", "C"])).unwrap();

        assert_eq!(t.next_batch(2), ["A", "B"]);
        assert_eq!(t.next_batch(2), ["A", "B"]);
        assert_eq!(t.next_batch(10).len(), 3);
    }

    #[test]
    fn test_resume_same_cycle() {
        let kv = store();
        let mut t = ProgressTracker::load(kv.clone(), "c1").unwrap();
        t.initialize(symbols(&["A", "B", "C"])).unwrap();
        t.mark_completed(&symbols(&["A"])).unwrap();

        let mut resumed = ProgressTracker::load(kv.clone(), "c1").unwrap();
        assert!(resumed.has_state());
        resumed.initialize(symbols(&["X", "Y"])).unwrap();
        assert_eq!(resumed.next_batch(5), ["B", "C"]);
        assert_eq!(resumed.progress(), (1, 3));
    }

    #[test]
    fn test_new_cycle_starts_fresh() {
        let kv = store();
        let mut t = ProgressTracker::load(kv.clone(), "c1").unwrap();
        t.initialize(symbols(&["A", "B"])).unwrap();
        t.mark_completed(&symbols(&["A", "B"])).unwrap();
        assert!(t.is_complete());

        let mut next = ProgressTracker::load(kv.clone(), "c2").unwrap();
        assert!(!next.has_state());
        assert!(!next.is_complete());
        next.initialize(symbols(&["A", "B", "C"])).unwrap();
        assert_eq!(next.progress(), (0, 3));
        assert_eq!(ProgressTracker::peek(kv.as_ref()).unwrap().unwrap().cycle_id, "c2");
    }

    #[test]
    fn test_unreadable_state_starts_fresh() {
        let kv = store();
        kv.put(NAMESPACE, KEY, r#"{"cycleId":"c0","pend"#).unwrap();

        let mut t = ProgressTracker::load(kv.clone(), "c1").unwrap();
        assert!(!t.has_state());
        t.initialize(symbols(&["A", "B"])).unwrap();
        assert_eq!(t.progress(), (0, 2));
        assert_eq!(ProgressTracker::peek(kv.as_ref()).unwrap().unwrap().cycle_id, "c1");
    }

    #[test]
    fn test_mark_completed_is_idempotent() {
        let mut t = ProgressTracker::load(store(), "c1").unwrap();
        t.initialize(symbols(&["A", "B", "C"])).unwrap();

        t.mark_completed(&symbols(&["B"])).unwrap();
        t.mark_completed(&symbols(&["B"])).unwrap();
        t.mark_completed(&symbols(&["Z"])).unwrap();

        assert_eq!(t.next_batch(5), ["A", "C"]);
        assert_eq!(t.progress(), (1, 3));
    }

    proptest! {
        #[test]
        fn pending_and_completed_stay_disjoint(
            ops in proptest::collection::vec(proptest::collection::vec(0usize..12, 0..6), 0..12)
        ) {
            let universe: Vec<String> = (0..10).map(|i| format!("S{i}")).collect();
            let mut t = ProgressTracker::load(store(), "c1").unwrap();
            t.initialize(universe.clone()).unwrap();

            for op in ops {
                let batch: Vec<String> = op.into_iter().map(|i| format!("S{i}")).collect();
                t.mark_completed(&batch).unwrap();

                let pending: HashSet<&String> = t.state.pending.iter().collect();
                let completed: HashSet<&String> = t.state.completed.iter().collect();
                prop_assert!(pending.is_disjoint(&completed));
                prop_assert_eq!(completed.len(), t.state.completed.len());
                prop_assert_eq!(pending.len() + completed.len(), universe.len());
            }
        }
    }
}
