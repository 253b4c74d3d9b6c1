// Ordered index of triggers eligible to fire

use crate::models::{Trigger, TriggerKey};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

/// Position of a trigger in the index: earliest fire time first, then
/// highest priority, then key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Position {
    next_fire_time: DateTime<Utc>,
    priority: Reverse<i32>,
    key: TriggerKey,
}

impl Position {
    fn of(trigger: &Trigger) -> Option<Self> {
        trigger.next_fire_time.map(|next_fire_time| Self {
            next_fire_time,
            priority: Reverse(trigger.priority),
            key: trigger.key.clone(),
        })
    }
}

/// Min-ordered set of trigger snapshots keyed by next fire time.
///
/// Each entry is a value copy taken when the trigger was added, so later
/// mutation of the live trigger cannot reorder the index behind its back.
/// The side map allows O(log n) removal of any trigger by key.
#[derive(Debug, Default)]
pub struct ActiveTriggerIndex {
    ordered: BTreeMap<Position, Trigger>,
    positions: HashMap<TriggerKey, Position>,
}

impl ActiveTriggerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a snapshot of `trigger`, replacing any stale entry for the same key.
    /// A trigger without a next fire time is dormant and only removed.
    pub fn add(&mut self, trigger: &Trigger) -> bool {
        self.remove(&trigger.key);
        let Some(position) = Position::of(trigger) else {
            return false;
        };
        self.positions.insert(trigger.key.clone(), position.clone());
        self.ordered.insert(position, trigger.clone());
        true
    }

    /// Remove the entry for `key`; a missing key is not an error
    pub fn remove(&mut self, key: &TriggerKey) -> bool {
        match self.positions.remove(key) {
            Some(position) => self.ordered.remove(&position).is_some(),
            None => false,
        }
    }

    pub fn poll_minimum(&mut self) -> Option<Trigger> {
        let (position, trigger) = self.ordered.pop_first()?;
        self.positions.remove(&position.key);
        Some(trigger)
    }

    pub fn peek_minimum(&self) -> Option<&Trigger> {
        self.ordered.values().next()
    }

    pub fn contains(&self, key: &TriggerKey) -> bool {
        self.positions.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn clear(&mut self) {
        self.ordered.clear();
        self.positions.clear();
    }

    /// Snapshots in firing order
    pub fn iter(&self) -> impl Iterator<Item = &Trigger> {
        self.ordered.values()
    }
}
