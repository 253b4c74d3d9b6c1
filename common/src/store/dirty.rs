// Per-operation accumulator of triggers whose status document must be rewritten

use crate::models::TriggerKey;
use crate::persistence::TriggerStatusDocument;
use std::collections::{BTreeMap, BTreeSet};

/// Keys touched by one store operation, plus final documents for triggers
/// that no longer exist in memory and therefore cannot be re-rendered.
#[derive(Debug, Default, Clone)]
pub struct DirtyTriggers {
    keys: BTreeSet<TriggerKey>,
    detached: BTreeMap<TriggerKey, TriggerStatusDocument>,
}

impl DirtyTriggers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, key: &TriggerKey) {
        if !self.keys.contains(key) {
            self.keys.insert(key.clone());
        }
    }

    /// Record the last document of a trigger that was dropped from memory.
    /// A live trigger with the same key takes precedence when rendered.
    pub fn mark_detached(&mut self, key: TriggerKey, document: TriggerStatusDocument) {
        self.keys.insert(key.clone());
        self.detached.insert(key, document);
    }

    pub fn merge(&mut self, other: DirtyTriggers) {
        self.keys.extend(other.keys);
        self.detached.extend(other.detached);
    }

    pub fn contains(&self, key: &TriggerKey) -> bool {
        self.keys.contains(key)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        BTreeSet<TriggerKey>,
        BTreeMap<TriggerKey, TriggerStatusDocument>,
    ) {
        (self.keys, self.detached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TriggerState;

    fn doc() -> TriggerStatusDocument {
        TriggerStatusDocument {
            state: TriggerState::Deleted,
            next_fire_time: None,
            previous_fire_time: None,
            info: None,
            node: "n".to_string(),
            times_triggered: 0,
        }
    }

    #[test]
    fn test_mark_is_idempotent() {
        let mut dirty = DirtyTriggers::new();
        let key = TriggerKey::new("g", "a");
        dirty.mark(&key);
        dirty.mark(&key);
        assert_eq!(dirty.len(), 1);
    }

    #[test]
    fn test_merge_keeps_detached_documents() {
        let mut first = DirtyTriggers::new();
        first.mark(&TriggerKey::new("g", "a"));

        let mut second = DirtyTriggers::new();
        second.mark_detached(TriggerKey::new("g", "b"), doc());

        first.merge(second);
        let (keys, detached) = first.into_parts();
        assert_eq!(keys.len(), 2);
        assert!(detached.contains_key(&TriggerKey::new("g", "b")));
    }
}
