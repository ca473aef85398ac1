//! Snapshot reference store
//!
//! Snapshots hand out stable refs into the captured DOM. Each ref resolves
//! to a selector plus backend node id, scoped to one target. A top-frame
//! navigation or page close wipes that target's refs; resolving a missing
//! ref tells the caller to take a new snapshot.

use log::debug;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;

use crate::error::{BrokerError, Result};
use crate::ids::TargetId;

#[derive(Debug, Clone, Serialize)]
pub struct RefEntry {
    pub selector: String,
    pub backend_node_id: i64,
}

#[derive(Default)]
pub struct RefStore {
    by_target: Mutex<HashMap<TargetId, HashMap<String, RefEntry>>>,
}

impl RefStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the ref table for a target with a fresh snapshot's entries.
    pub fn install_snapshot(&self, target: TargetId, entries: HashMap<String, RefEntry>) {
        let count = entries.len();
        self.by_target.lock().insert(target, entries);
        debug!("installed {} snapshot refs for target {}", count, target);
    }

    /// Resolve a ref for a target. Refs from other targets never resolve.
    pub fn resolve(&self, target: TargetId, ref_id: &str) -> Result<RefEntry> {
        self.by_target
            .lock()
            .get(&target)
            .and_then(|refs| refs.get(ref_id))
            .cloned()
            .ok_or_else(|| BrokerError::UnknownRef(ref_id.to_string()))
    }

    /// Invalidate all refs for a target (top-frame navigation, page close).
    pub fn clear_target(&self, target: TargetId) {
        if self.by_target.lock().remove(&target).is_some() {
            debug!("cleared snapshot refs for target {}", target);
        }
    }

    pub fn clear_all(&self) {
        self.by_target.lock().clear();
    }

    pub fn ref_count(&self, target: TargetId) -> usize {
        self.by_target.lock().get(&target).map(HashMap::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(pairs: &[(&str, &str, i64)]) -> HashMap<String, RefEntry> {
        pairs
            .iter()
            .map(|(r, sel, node)| {
                (
                    (*r).to_string(),
                    RefEntry { selector: (*sel).to_string(), backend_node_id: *node },
                )
            })
            .collect()
    }

    #[test]
    fn resolve_and_miss() {
        let store = RefStore::new();
        let target = TargetId::new();
        store.install_snapshot(target, entries(&[("e1", "#login", 42)]));

        let entry = store.resolve(target, "e1").expect("e1 should resolve");
        assert_eq!(entry.selector, "#login");
        assert_eq!(entry.backend_node_id, 42);

        let err = store.resolve(target, "e2").expect_err("e2 should miss");
        assert_eq!(err.kind(), "unknown_ref");
        assert!(err.to_string().contains("snapshot"));
    }

    #[test]
    fn refs_are_target_scoped() {
        let store = RefStore::new();
        let a = TargetId::new();
        let b = TargetId::new();
        store.install_snapshot(a, entries(&[("e1", "#a", 1)]));
        assert!(store.resolve(b, "e1").is_err());
    }

    #[test]
    fn clear_target_invalidates() {
        let store = RefStore::new();
        let target = TargetId::new();
        store.install_snapshot(target, entries(&[("e1", "#a", 1)]));
        store.clear_target(target);
        assert!(store.resolve(target, "e1").is_err());
        assert_eq!(store.ref_count(target), 0);
    }

    #[test]
    fn new_snapshot_replaces_old_refs() {
        let store = RefStore::new();
        let target = TargetId::new();
        store.install_snapshot(target, entries(&[("e1", "#old", 1)]));
        store.install_snapshot(target, entries(&[("e2", "#new", 2)]));
        assert!(store.resolve(target, "e1").is_err());
        assert!(store.resolve(target, "e2").is_ok());
    }
}
