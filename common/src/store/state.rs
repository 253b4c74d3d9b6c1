// Trigger lifecycle states and the transitions applied under the store lock

use super::dirty::DirtyTriggers;
use crate::errors::ScheduleError;
use crate::models::{MisfirePolicy, Trigger, TriggerKey};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Internal lifecycle state of a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerState {
    /// Idle and eligible to fire
    Waiting,
    /// Claimed by the local scheduling loop, about to fire
    Acquired,
    /// Work dispatched
    Executing,
    Complete,
    /// A sibling trigger of the same concurrency-restricted job is executing
    Blocked,
    Error,
    Paused,
    /// Paused while also concurrency-blocked
    PausedBlocked,
    Deleted,
}

/// Coarser, externally visible trigger status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerStatus {
    /// No trigger with the requested key
    None,
    Normal,
    Paused,
    Complete,
    Error,
    Blocked,
}

impl TriggerState {
    pub fn status(self) -> TriggerStatus {
        match self {
            TriggerState::Waiting
            | TriggerState::Acquired
            | TriggerState::Executing
            | TriggerState::Deleted => TriggerStatus::Normal,
            TriggerState::Complete => TriggerStatus::Complete,
            TriggerState::Blocked => TriggerStatus::Blocked,
            TriggerState::Error => TriggerStatus::Error,
            TriggerState::Paused | TriggerState::PausedBlocked => TriggerStatus::Paused,
        }
    }

    pub fn is_paused(self) -> bool {
        matches!(self, TriggerState::Paused | TriggerState::PausedBlocked)
    }

    /// States a completion or idle transition must never overwrite
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TriggerState::Complete | TriggerState::Error | TriggerState::Deleted
        )
    }
}

/// A trigger as the store holds it: the engine-facing value plus scheduling state
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerRecord {
    pub trigger: Trigger,
    pub state: TriggerState,
    /// Cluster member last known to own the trigger; authoritative only while executing
    pub node: String,
    pub state_info: Option<String>,
}

impl TriggerRecord {
    pub fn new(trigger: Trigger, node: impl Into<String>) -> Self {
        Self {
            trigger,
            state: TriggerState::Waiting,
            node: node.into(),
            state_info: None,
        }
    }

    pub fn key(&self) -> &TriggerKey {
        &self.trigger.key
    }

    pub fn set_state(&mut self, state: TriggerState, dirty: &mut DirtyTriggers) {
        if self.state != state {
            self.state = state;
            dirty.mark(&self.trigger.key);
        }
    }

    pub fn set_node(&mut self, node: &str, dirty: &mut DirtyTriggers) {
        if self.node != node {
            self.node = node.to_string();
            dirty.mark(&self.trigger.key);
        }
    }

    pub fn set_error(&mut self, info: impl Into<String>, dirty: &mut DirtyTriggers) {
        self.state = TriggerState::Error;
        self.state_info = Some(info.into());
        dirty.mark(&self.trigger.key);
    }

    /// Seed the next fire time from the schedule rule and start time
    pub fn compute_first_fire_time(
        &mut self,
        now: DateTime<Utc>,
        dirty: &mut DirtyTriggers,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        let first = self.trigger.first_fire_time(now)?;
        self.trigger.next_fire_time = first;
        dirty.mark(&self.trigger.key);
        Ok(first)
    }

    /// Advance the fire times after the trigger fired
    pub fn triggered(
        &mut self,
        now: DateTime<Utc>,
        dirty: &mut DirtyTriggers,
    ) -> Result<(), ScheduleError> {
        let fired_at = self.trigger.next_fire_time.unwrap_or(now);
        self.trigger.previous_fire_time = Some(fired_at);
        self.trigger.times_triggered = self.trigger.times_triggered.saturating_add(1);
        self.trigger.next_fire_time = self.trigger.fire_time_after(fired_at)?;
        dirty.mark(&self.trigger.key);
        Ok(())
    }

    /// True when the next fire time lies further in the past than `threshold`
    pub fn is_misfired(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        if self.trigger.misfire_policy == MisfirePolicy::Ignore {
            return false;
        }
        match self.trigger.next_fire_time {
            Some(next) => next < now - threshold,
            None => false,
        }
    }

    /// Recompute the next fire time per the misfire policy; an exhausted schedule completes
    pub fn update_after_misfire(
        &mut self,
        now: DateTime<Utc>,
        dirty: &mut DirtyTriggers,
    ) -> Result<(), ScheduleError> {
        let next = match self.trigger.misfire_policy {
            MisfirePolicy::Ignore => return Ok(()),
            MisfirePolicy::FireNow => match self.trigger.end_time {
                Some(end) if end < now => None,
                _ => Some(now),
            },
            MisfirePolicy::SkipToNext => self.trigger.fire_time_after(now)?,
        };

        self.trigger.next_fire_time = next;
        if next.is_none() {
            self.state = TriggerState::Complete;
        }
        dirty.mark(&self.trigger.key);
        Ok(())
    }
}
