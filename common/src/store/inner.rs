// In-memory job/trigger graph. Every method here runs with the store lock held
// and performs no I/O; state changes are reported through `DirtyTriggers`.

use super::active::ActiveTriggerIndex;
use super::dirty::DirtyTriggers;
use super::matcher::GroupMatcher;
use super::reconcile::ReconcileSummary;
use super::state::{TriggerRecord, TriggerState, TriggerStatus};
use crate::errors::{StoreError, ValidationError};
use crate::models::{
    CompletedExecutionInstruction, JobConfig, JobDetail, JobKey, Trigger, TriggerFiredBundle,
    TriggerKey,
};
use crate::persistence::{status_document_id, TriggerStatusDocument};
use crate::telemetry;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub(crate) struct JobRecord {
    pub detail: JobDetail,
    /// Source configuration; `None` for jobs stored directly through the store API
    pub config: Option<JobConfig>,
    pub triggers: BTreeSet<TriggerKey>,
}

/// A job rendered from configuration, ready to merge into the graph
#[derive(Debug, Clone)]
pub(crate) struct LoadedJob {
    pub detail: JobDetail,
    pub config: JobConfig,
    pub triggers: Vec<Trigger>,
}

/// How a trigger whose persisted state is EXECUTING on this node is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recovery {
    /// Full load at process start; local executions died with the previous process
    Startup,
    /// Incremental reload; a local execution may be running right now
    ConfigUpdate,
}

/// A status document ready to be written
#[derive(Debug, Clone)]
pub(crate) struct PendingWrite {
    pub key: TriggerKey,
    pub id: String,
    pub document: TriggerStatusDocument,
}

pub(crate) struct StoreState {
    node_id: String,
    misfire_threshold: Duration,
    jobs: HashMap<JobKey, JobRecord>,
    job_groups: BTreeMap<String, BTreeSet<JobKey>>,
    triggers: HashMap<TriggerKey, TriggerRecord>,
    trigger_groups: BTreeMap<String, BTreeSet<TriggerKey>>,
    active: ActiveTriggerIndex,
    paused_trigger_groups: BTreeSet<String>,
    paused_job_groups: BTreeSet<String>,
    blocked_jobs: HashSet<JobKey>,
    /// Triggers persisted as EXECUTING by another node, awaiting confirmation
    executing_elsewhere: BTreeSet<TriggerKey>,
    /// Writes that failed and wait for the next flush
    unflushed: DirtyTriggers,
}

impl StoreState {
    pub fn new(node_id: impl Into<String>, misfire_threshold: Duration) -> Self {
        Self {
            node_id: node_id.into(),
            misfire_threshold,
            jobs: HashMap::new(),
            job_groups: BTreeMap::new(),
            triggers: HashMap::new(),
            trigger_groups: BTreeMap::new(),
            active: ActiveTriggerIndex::new(),
            paused_trigger_groups: BTreeSet::new(),
            paused_job_groups: BTreeSet::new(),
            blocked_jobs: HashSet::new(),
            executing_elsewhere: BTreeSet::new(),
            unflushed: DirtyTriggers::new(),
        }
    }

    // ------------------------------------------------------------------
    // Jobs and triggers
    // ------------------------------------------------------------------

    pub fn store_job(
        &mut self,
        detail: JobDetail,
        config: Option<JobConfig>,
        replace: bool,
    ) -> Result<(), StoreError> {
        if self.jobs.contains_key(&detail.key) && !replace {
            return Err(StoreError::JobAlreadyExists(detail.key));
        }
        self.put_job(detail, config);
        Ok(())
    }

    fn put_job(&mut self, detail: JobDetail, config: Option<JobConfig>) {
        if let Some(existing) = self.jobs.get_mut(&detail.key) {
            existing.detail = detail;
            if config.is_some() {
                existing.config = config;
            }
            return;
        }

        self.job_groups
            .entry(detail.key.group.clone())
            .or_default()
            .insert(detail.key.clone());
        self.jobs.insert(
            detail.key.clone(),
            JobRecord {
                detail,
                config,
                triggers: BTreeSet::new(),
            },
        );
    }

    pub fn store_trigger(
        &mut self,
        trigger: Trigger,
        replace: bool,
        now: DateTime<Utc>,
        dirty: &mut DirtyTriggers,
    ) -> Result<(), StoreError> {
        if !self.jobs.contains_key(&trigger.job_key) {
            return Err(StoreError::MissingJobForTrigger {
                trigger: trigger.key,
                job: trigger.job_key,
            });
        }
        if self.triggers.contains_key(&trigger.key) && !replace {
            return Err(StoreError::TriggerAlreadyExists(trigger.key));
        }

        let record = self.new_record(trigger, now)?;
        let key = record.trigger.key.clone();
        self.detach_trigger(&key, false, dirty);
        self.insert_record(record);
        dirty.mark(&key);
        self.go_idle(&key, dirty);
        Ok(())
    }

    /// Store a batch of jobs with their triggers. Every trigger is validated
    /// before anything changes, so a failing batch leaves no partial state.
    pub fn store_jobs_and_triggers(
        &mut self,
        batch: Vec<(JobDetail, Vec<Trigger>)>,
        replace: bool,
        now: DateTime<Utc>,
        dirty: &mut DirtyTriggers,
    ) -> Result<(), StoreError> {
        let batch_jobs: HashSet<JobKey> = batch.iter().map(|(job, _)| job.key.clone()).collect();
        let mut prepared = Vec::with_capacity(batch.len());
        for (job, triggers) in batch {
            if !replace && self.jobs.contains_key(&job.key) {
                return Err(StoreError::JobAlreadyExists(job.key));
            }
            let mut records = Vec::with_capacity(triggers.len());
            for trigger in triggers {
                if !batch_jobs.contains(&trigger.job_key)
                    && !self.jobs.contains_key(&trigger.job_key)
                {
                    return Err(StoreError::MissingJobForTrigger {
                        trigger: trigger.key,
                        job: trigger.job_key,
                    });
                }
                if !replace && self.triggers.contains_key(&trigger.key) {
                    return Err(StoreError::TriggerAlreadyExists(trigger.key));
                }
                records.push(self.new_record(trigger, now)?);
            }
            prepared.push((job, records));
        }

        for (job, records) in prepared {
            self.put_job(job, None);
            for record in records {
                let key = record.trigger.key.clone();
                self.detach_trigger(&key, false, dirty);
                self.insert_record(record);
                dirty.mark(&key);
                self.go_idle(&key, dirty);
            }
        }
        Ok(())
    }

    pub fn replace_trigger(
        &mut self,
        key: &TriggerKey,
        trigger: Trigger,
        now: DateTime<Utc>,
        dirty: &mut DirtyTriggers,
    ) -> Result<bool, StoreError> {
        let Some(old) = self.triggers.get(key) else {
            return Ok(false);
        };
        if old.trigger.job_key != trigger.job_key {
            return Err(StoreError::ReplacementJobMismatch(trigger.key));
        }
        if &trigger.key != key && self.triggers.contains_key(&trigger.key) {
            return Err(StoreError::TriggerAlreadyExists(trigger.key));
        }

        let record = self.new_record(trigger, now)?;
        let new_key = record.trigger.key.clone();
        self.detach_trigger(key, false, dirty);
        self.insert_record(record);
        dirty.mark(&new_key);
        self.go_idle(&new_key, dirty);
        Ok(true)
    }

    fn new_record(&self, trigger: Trigger, now: DateTime<Utc>) -> Result<TriggerRecord, StoreError> {
        let mut record = TriggerRecord::new(trigger, self.node_id.clone());
        if record.trigger.next_fire_time.is_none() {
            record.trigger.next_fire_time = record
                .trigger
                .first_fire_time(now)
                .map_err(|e| StoreError::InvalidTrigger(ValidationError::InvalidSchedule(e)))?;
        }
        Ok(record)
    }

    fn insert_record(&mut self, record: TriggerRecord) {
        let key = record.trigger.key.clone();
        self.trigger_groups
            .entry(key.group.clone())
            .or_default()
            .insert(key.clone());
        if let Some(job) = self.jobs.get_mut(&record.trigger.job_key) {
            job.triggers.insert(key.clone());
        }
        self.triggers.insert(key, record);
    }

    /// Drop a trigger from every index and queue its final DELETED document
    fn detach_trigger(
        &mut self,
        key: &TriggerKey,
        remove_orphaned_job: bool,
        dirty: &mut DirtyTriggers,
    ) -> Option<TriggerRecord> {
        let record = self.triggers.remove(key)?;

        if let Some(group) = self.trigger_groups.get_mut(&key.group) {
            group.remove(key);
            if group.is_empty() {
                self.trigger_groups.remove(&key.group);
            }
        }
        self.active.remove(key);
        self.executing_elsewhere.remove(key);

        let job_key = &record.trigger.job_key;
        let orphaned = match self.jobs.get_mut(job_key) {
            Some(job) => {
                job.triggers.remove(key);
                job.triggers.is_empty()
            }
            None => false,
        };
        if orphaned && remove_orphaned_job {
            self.remove_job_entry(&job_key.clone());
        }

        dirty.mark_detached(
            key.clone(),
            TriggerStatusDocument::deleted(&record.trigger, &self.node_id),
        );
        Some(record)
    }

    /// Remove a trigger; removing the last trigger of a job removes the job
    pub fn remove_trigger(&mut self, key: &TriggerKey, dirty: &mut DirtyTriggers) -> bool {
        self.detach_trigger(key, true, dirty).is_some()
    }

    /// Remove a job together with all of its triggers
    pub fn remove_job(&mut self, key: &JobKey, dirty: &mut DirtyTriggers) -> bool {
        let Some(job) = self.jobs.get(key) else {
            return false;
        };
        let trigger_keys: Vec<TriggerKey> = job.triggers.iter().cloned().collect();
        for trigger_key in &trigger_keys {
            self.detach_trigger(trigger_key, false, dirty);
        }
        self.remove_job_entry(key);
        true
    }

    fn remove_job_entry(&mut self, key: &JobKey) {
        self.jobs.remove(key);
        if let Some(group) = self.job_groups.get_mut(&key.group) {
            group.remove(key);
            if group.is_empty() {
                self.job_groups.remove(&key.group);
            }
        }
        self.blocked_jobs.remove(key);
    }

    pub fn clear_all(&mut self, dirty: &mut DirtyTriggers) {
        let job_keys: Vec<JobKey> = self.jobs.keys().cloned().collect();
        for key in &job_keys {
            self.remove_job(key, dirty);
        }
        self.active.clear();
        self.paused_trigger_groups.clear();
        self.paused_job_groups.clear();
        self.blocked_jobs.clear();
        self.executing_elsewhere.clear();
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn retrieve_job(&self, key: &JobKey) -> Option<JobDetail> {
        self.jobs.get(key).map(|job| job.detail.clone())
    }

    pub fn retrieve_trigger(&self, key: &TriggerKey) -> Option<Trigger> {
        self.triggers.get(key).map(|record| record.trigger.clone())
    }

    pub fn record(&self, key: &TriggerKey) -> Option<&TriggerRecord> {
        self.triggers.get(key)
    }

    pub fn contains_job(&self, key: &JobKey) -> bool {
        self.jobs.contains_key(key)
    }

    pub fn contains_trigger(&self, key: &TriggerKey) -> bool {
        self.triggers.contains_key(key)
    }

    pub fn job_keys(&self, matcher: &GroupMatcher) -> Vec<JobKey> {
        match matcher.exact() {
            Some(group) => self
                .job_groups
                .get(group)
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default(),
            None => self
                .job_groups
                .iter()
                .filter(|(group, _)| matcher.is_match(group))
                .flat_map(|(_, keys)| keys.iter().cloned())
                .collect(),
        }
    }

    pub fn trigger_keys(&self, matcher: &GroupMatcher) -> Vec<TriggerKey> {
        match matcher.exact() {
            Some(group) => self
                .trigger_groups
                .get(group)
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default(),
            None => self
                .trigger_groups
                .iter()
                .filter(|(group, _)| matcher.is_match(group))
                .flat_map(|(_, keys)| keys.iter().cloned())
                .collect(),
        }
    }

    pub fn job_group_names(&self) -> Vec<String> {
        self.job_groups.keys().cloned().collect()
    }

    pub fn trigger_group_names(&self) -> Vec<String> {
        self.trigger_groups.keys().cloned().collect()
    }

    pub fn triggers_for_job(&self, key: &JobKey) -> Vec<Trigger> {
        self.jobs
            .get(key)
            .map(|job| {
                job.triggers
                    .iter()
                    .filter_map(|k| self.triggers.get(k))
                    .map(|record| record.trigger.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn number_of_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn number_of_triggers(&self) -> usize {
        self.triggers.len()
    }

    pub fn trigger_status(&self, key: &TriggerKey) -> TriggerStatus {
        self.triggers
            .get(key)
            .map_or(TriggerStatus::None, |record| record.state.status())
    }

    pub fn paused_trigger_groups(&self) -> BTreeSet<String> {
        self.paused_trigger_groups.clone()
    }

    pub fn active_trigger_keys(&self) -> Vec<TriggerKey> {
        self.active.iter().map(|t| t.key.clone()).collect()
    }

    pub fn watch_list(&self) -> Vec<TriggerKey> {
        self.executing_elsewhere.iter().cloned().collect()
    }

    /// Keys among `keys` this node is executing right now
    pub fn executing_here(&self, keys: &[TriggerKey]) -> HashSet<TriggerKey> {
        keys.iter()
            .filter(|key| {
                self.triggers.get(key).is_some_and(|record| {
                    record.state == TriggerState::Executing && record.node == self.node_id
                })
            })
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Idle transitions and concurrency blocking
    // ------------------------------------------------------------------

    /// Move a trigger to its idle state: PAUSED(_BLOCKED) in a paused group,
    /// BLOCKED while its job is blocked, WAITING otherwise. Returns true when
    /// the trigger ended up in the active index.
    fn go_idle(&mut self, key: &TriggerKey, dirty: &mut DirtyTriggers) -> bool {
        let Some(record) = self.triggers.get_mut(key) else {
            return false;
        };
        let job_key = &record.trigger.job_key;
        let paused = self.paused_trigger_groups.contains(&key.group)
            || self.paused_job_groups.contains(&job_key.group);
        let blocked = self.blocked_jobs.contains(job_key);

        let state = match (paused, blocked) {
            (true, true) => TriggerState::PausedBlocked,
            (true, false) => TriggerState::Paused,
            (false, true) => TriggerState::Blocked,
            (false, false) if record.trigger.next_fire_time.is_none() => TriggerState::Complete,
            (false, false) => TriggerState::Waiting,
        };
        record.set_state(state, dirty);

        if state == TriggerState::Waiting {
            self.active.add(&record.trigger);
            true
        } else {
            self.active.remove(key);
            false
        }
    }

    /// Recompute a missing fire time, take ownership, and go idle
    fn release_to_idle(&mut self, key: &TriggerKey, now: DateTime<Utc>, dirty: &mut DirtyTriggers) {
        let node_id = self.node_id.clone();
        let Some(record) = self.triggers.get_mut(key) else {
            return;
        };
        if record.trigger.next_fire_time.is_none() {
            if let Err(e) = record.compute_first_fire_time(now, dirty) {
                warn!(trigger = %key, error = %e, "Cannot compute fire time; isolating trigger");
                record.set_error(e.to_string(), dirty);
                self.active.remove(key);
                return;
            }
        }
        record.set_node(&node_id, dirty);
        self.go_idle(key, dirty);
    }

    /// Hold every idle sibling of `executing` while the job runs
    fn block_job(&mut self, job_key: &JobKey, executing: &TriggerKey, dirty: &mut DirtyTriggers) {
        self.blocked_jobs.insert(job_key.clone());
        let Some(job) = self.jobs.get(job_key) else {
            return;
        };
        for key in job.triggers.iter().filter(|k| *k != executing) {
            let Some(record) = self.triggers.get_mut(key) else {
                continue;
            };
            match record.state {
                TriggerState::Waiting => {
                    record.set_state(TriggerState::Blocked, dirty);
                    self.active.remove(key);
                }
                TriggerState::Paused => record.set_state(TriggerState::PausedBlocked, dirty),
                _ => {}
            }
        }
    }

    /// Release the job's siblings unless one of its triggers still executes
    fn unblock_job_if_idle(&mut self, job_key: &JobKey, dirty: &mut DirtyTriggers) {
        let Some(job) = self.jobs.get(job_key) else {
            self.blocked_jobs.remove(job_key);
            return;
        };
        let still_running = job.triggers.iter().any(|key| {
            self.triggers
                .get(key)
                .is_some_and(|record| record.state == TriggerState::Executing)
        });
        if still_running {
            return;
        }

        self.blocked_jobs.remove(job_key);
        let keys: Vec<TriggerKey> = job.triggers.iter().cloned().collect();
        for key in &keys {
            let state = match self.triggers.get(key) {
                Some(record) => record.state,
                None => continue,
            };
            match state {
                TriggerState::Blocked => {
                    self.go_idle(key, dirty);
                }
                TriggerState::PausedBlocked => {
                    if let Some(record) = self.triggers.get_mut(key) {
                        record.set_state(TriggerState::Paused, dirty);
                    }
                }
                _ => {}
            }
        }
    }

    fn job_disallows_concurrency(&self, job_key: &JobKey) -> bool {
        self.jobs
            .get(job_key)
            .is_some_and(|job| job.detail.concurrent_execution_disallowed)
    }

    /// Repair a misfired trigger. Returns true when its fire time changed.
    fn apply_misfire(&mut self, key: &TriggerKey, now: DateTime<Utc>, dirty: &mut DirtyTriggers) -> bool {
        let Some(record) = self.triggers.get_mut(key) else {
            return false;
        };
        if !record.is_misfired(now, self.misfire_threshold) {
            return false;
        }

        let before = record.trigger.next_fire_time;
        if let Err(e) = record.update_after_misfire(now, dirty) {
            warn!(trigger = %key, error = %e, "Misfire repair failed; isolating trigger");
            record.set_error(e.to_string(), dirty);
            self.active.remove(key);
            return true;
        }
        telemetry::record_misfire(&key.group);
        debug!(
            trigger = %key,
            missed = ?before,
            next_fire_time = ?record.trigger.next_fire_time,
            "Trigger misfired"
        );

        if record.state == TriggerState::Complete {
            self.active.remove(key);
        }
        record.trigger.next_fire_time != before
    }

    // ------------------------------------------------------------------
    // Acquire / fire / complete
    // ------------------------------------------------------------------

    pub fn acquire_next_triggers(
        &mut self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
        now: DateTime<Utc>,
        dirty: &mut DirtyTriggers,
    ) -> Vec<Trigger> {
        let mut acquired: Vec<Trigger> = Vec::new();
        if max_count == 0 {
            return acquired;
        }

        let mut exclusive_jobs: HashSet<JobKey> = HashSet::new();
        let mut set_aside: Vec<Trigger> = Vec::new();
        let mut batch_end = no_later_than;

        while let Some(snapshot) = self.active.poll_minimum() {
            let key = snapshot.key;
            let Some(record) = self.triggers.get(&key) else {
                continue;
            };
            if record.state != TriggerState::Waiting {
                continue;
            }
            let Some(next_fire_time) = record.trigger.next_fire_time else {
                continue;
            };

            if record.is_misfired(now, self.misfire_threshold) {
                self.apply_misfire(&key, now, dirty);
                if let Some(record) = self.triggers.get(&key) {
                    if record.state == TriggerState::Waiting {
                        self.active.add(&record.trigger);
                    }
                }
                continue;
            }

            if next_fire_time > batch_end {
                self.active.add(&record.trigger);
                break;
            }

            let job_key = record.trigger.job_key.clone();
            if !self.jobs.contains_key(&job_key) {
                warn!(trigger = %key, job = %job_key, "Trigger references a missing job; skipping");
                continue;
            }
            if self.job_disallows_concurrency(&job_key) && !exclusive_jobs.insert(job_key) {
                set_aside.push(record.trigger.clone());
                continue;
            }

            let node_id = self.node_id.clone();
            let Some(record) = self.triggers.get_mut(&key) else {
                continue;
            };
            record.set_state(TriggerState::Acquired, dirty);
            record.set_node(&node_id, dirty);
            record.trigger.fire_instance_id = Some(Uuid::new_v4().to_string());

            if acquired.is_empty() {
                batch_end = next_fire_time.max(now) + time_window;
            }
            acquired.push(record.trigger.clone());
            if acquired.len() >= max_count {
                break;
            }
        }

        for trigger in &set_aside {
            self.active.add(trigger);
        }
        acquired
    }

    pub fn release_acquired_trigger(&mut self, key: &TriggerKey, dirty: &mut DirtyTriggers) -> bool {
        match self.triggers.get_mut(key) {
            Some(record) if record.state == TriggerState::Acquired => {
                record.trigger.fire_instance_id = None;
                self.go_idle(key, dirty);
                true
            }
            _ => false,
        }
    }

    pub fn triggers_fired(
        &mut self,
        triggers: &[Trigger],
        now: DateTime<Utc>,
        dirty: &mut DirtyTriggers,
    ) -> Vec<TriggerFiredBundle> {
        let mut bundles = Vec::with_capacity(triggers.len());

        for fired in triggers {
            let key = &fired.key;
            let Some(record) = self.triggers.get(key) else {
                debug!(trigger = %key, "Fired trigger no longer exists; recording it as deleted");
                dirty.mark_detached(
                    key.clone(),
                    TriggerStatusDocument::deleted(fired, &self.node_id),
                );
                continue;
            };
            if record.state != TriggerState::Acquired {
                debug!(trigger = %key, state = ?record.state, "Trigger is no longer acquired; not firing");
                continue;
            }

            let job_key = record.trigger.job_key.clone();
            let Some(job) = self.jobs.get(&job_key).map(|job| job.detail.clone()) else {
                warn!(trigger = %key, job = %job_key, "Job of fired trigger vanished; deleting trigger");
                self.detach_trigger(key, false, dirty);
                continue;
            };

            let node_id = self.node_id.clone();
            let Some(record) = self.triggers.get_mut(key) else {
                continue;
            };
            let scheduled_fire_time = record.trigger.next_fire_time;
            let previous_fire_time = record.trigger.previous_fire_time;
            self.active.remove(key);

            if let Err(e) = record.triggered(now, dirty) {
                warn!(trigger = %key, error = %e, "Cannot advance fire time; isolating trigger");
                record.set_error(e.to_string(), dirty);
                continue;
            }
            record.set_state(TriggerState::Executing, dirty);
            record.set_node(&node_id, dirty);

            let bundle = TriggerFiredBundle {
                job,
                trigger: record.trigger.clone(),
                fire_time: now,
                scheduled_fire_time,
                previous_fire_time,
                next_fire_time: record.trigger.next_fire_time,
            };

            if bundle.job.concurrent_execution_disallowed {
                self.block_job(&job_key, key, dirty);
            }
            bundles.push(bundle);
        }

        bundles
    }

    pub fn triggered_job_complete(
        &mut self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
        dirty: &mut DirtyTriggers,
    ) {
        let key = &trigger.key;
        let job_key = &trigger.job_key;

        if let Some(record) = self.jobs.get_mut(job_key) {
            if record.detail.persist_data_after_execution {
                record.detail.data = job.data.clone();
            }
        }

        match instruction {
            CompletedExecutionInstruction::Noop => self.requeue_after_execution(key, dirty),
            CompletedExecutionInstruction::SetTriggerComplete => {
                self.set_terminal(key, TriggerState::Complete, None, dirty);
            }
            CompletedExecutionInstruction::SetTriggerError => {
                self.set_terminal(
                    key,
                    TriggerState::Error,
                    Some("job reported an execution error"),
                    dirty,
                );
            }
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                for sibling in self.job_trigger_keys(job_key) {
                    self.set_terminal(&sibling, TriggerState::Complete, None, dirty);
                }
            }
            CompletedExecutionInstruction::SetAllJobTriggersError => {
                for sibling in self.job_trigger_keys(job_key) {
                    self.set_terminal(
                        &sibling,
                        TriggerState::Error,
                        Some("job reported an execution error for all of its triggers"),
                        dirty,
                    );
                }
            }
            CompletedExecutionInstruction::DeleteTrigger => {
                self.remove_trigger(key, dirty);
            }
        }

        if self.job_disallows_concurrency(job_key) || self.blocked_jobs.contains(job_key) {
            self.unblock_job_if_idle(job_key, dirty);
        }
    }

    fn requeue_after_execution(&mut self, key: &TriggerKey, dirty: &mut DirtyTriggers) {
        match self.triggers.get_mut(key) {
            Some(record) if record.state == TriggerState::Executing => {
                if record.trigger.next_fire_time.is_none() {
                    record.set_state(TriggerState::Complete, dirty);
                    self.active.remove(key);
                } else {
                    self.go_idle(key, dirty);
                }
            }
            // Paused while running, reset elsewhere, or already terminal: leave as is
            _ => {}
        }
    }

    fn set_terminal(
        &mut self,
        key: &TriggerKey,
        state: TriggerState,
        info: Option<&str>,
        dirty: &mut DirtyTriggers,
    ) {
        if let Some(record) = self.triggers.get_mut(key) {
            record.set_state(state, dirty);
            if let Some(info) = info {
                record.state_info = Some(info.to_string());
                dirty.mark(key);
            }
            self.active.remove(key);
        }
    }

    fn job_trigger_keys(&self, job_key: &JobKey) -> Vec<TriggerKey> {
        self.jobs
            .get(job_key)
            .map(|job| job.triggers.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Pause / resume
    // ------------------------------------------------------------------

    pub fn pause_trigger(&mut self, key: &TriggerKey, dirty: &mut DirtyTriggers) -> bool {
        let Some(record) = self.triggers.get_mut(key) else {
            return false;
        };
        match record.state {
            state if state.is_terminal() => return false,
            state if state.is_paused() => return true,
            TriggerState::Blocked => record.set_state(TriggerState::PausedBlocked, dirty),
            _ => record.set_state(TriggerState::Paused, dirty),
        }
        self.active.remove(key);
        true
    }

    pub fn pause_triggers(&mut self, matcher: &GroupMatcher, dirty: &mut DirtyTriggers) -> Vec<String> {
        let groups: Vec<String> = match matcher.exact() {
            Some(group) => vec![group.to_string()],
            None => self
                .trigger_groups
                .keys()
                .filter(|group| matcher.is_match(group))
                .cloned()
                .collect(),
        };

        for group in &groups {
            self.paused_trigger_groups.insert(group.clone());
            for key in self.trigger_keys(&GroupMatcher::equals(group.clone())) {
                self.pause_trigger(&key, dirty);
            }
        }
        groups
    }

    pub fn pause_job(&mut self, key: &JobKey, dirty: &mut DirtyTriggers) -> bool {
        if !self.jobs.contains_key(key) {
            return false;
        }
        for trigger_key in self.job_trigger_keys(key) {
            self.pause_trigger(&trigger_key, dirty);
        }
        true
    }

    pub fn pause_jobs(&mut self, matcher: &GroupMatcher, dirty: &mut DirtyTriggers) -> Vec<String> {
        let groups: Vec<String> = match matcher.exact() {
            Some(group) => vec![group.to_string()],
            None => self
                .job_groups
                .keys()
                .filter(|group| matcher.is_match(group))
                .cloned()
                .collect(),
        };

        for group in &groups {
            self.paused_job_groups.insert(group.clone());
            for job_key in self.job_keys(&GroupMatcher::equals(group.clone())) {
                self.pause_job(&job_key, dirty);
            }
        }
        groups
    }

    pub fn resume_trigger(&mut self, key: &TriggerKey, now: DateTime<Utc>, dirty: &mut DirtyTriggers) -> bool {
        match self.triggers.get(key) {
            Some(record) if record.state.is_paused() => {}
            _ => return false,
        }

        self.apply_misfire(key, now, dirty);
        let terminal = self
            .triggers
            .get(key)
            .map_or(true, |record| record.state.is_terminal());
        if !terminal {
            self.go_idle(key, dirty);
        }
        true
    }

    pub fn resume_triggers(
        &mut self,
        matcher: &GroupMatcher,
        now: DateTime<Utc>,
        dirty: &mut DirtyTriggers,
    ) -> Vec<String> {
        let groups: BTreeSet<String> = match matcher.exact() {
            Some(group) => BTreeSet::from([group.to_string()]),
            None => self
                .paused_trigger_groups
                .iter()
                .chain(self.trigger_groups.keys())
                .filter(|group| matcher.is_match(group))
                .cloned()
                .collect(),
        };

        for group in &groups {
            self.paused_trigger_groups.remove(group);
            for key in self.trigger_keys(&GroupMatcher::equals(group.clone())) {
                self.resume_trigger(&key, now, dirty);
            }
        }
        groups.into_iter().collect()
    }

    pub fn resume_job(&mut self, key: &JobKey, now: DateTime<Utc>, dirty: &mut DirtyTriggers) -> bool {
        if !self.jobs.contains_key(key) {
            return false;
        }
        for trigger_key in self.job_trigger_keys(key) {
            self.resume_trigger(&trigger_key, now, dirty);
        }
        true
    }

    pub fn resume_jobs(
        &mut self,
        matcher: &GroupMatcher,
        now: DateTime<Utc>,
        dirty: &mut DirtyTriggers,
    ) -> Vec<String> {
        let groups: BTreeSet<String> = match matcher.exact() {
            Some(group) => BTreeSet::from([group.to_string()]),
            None => self
                .paused_job_groups
                .iter()
                .chain(self.job_groups.keys())
                .filter(|group| matcher.is_match(group))
                .cloned()
                .collect(),
        };

        for group in &groups {
            self.paused_job_groups.remove(group);
            for job_key in self.job_keys(&GroupMatcher::equals(group.clone())) {
                self.resume_job(&job_key, now, dirty);
            }
        }
        groups.into_iter().collect()
    }

    pub fn pause_all(&mut self, dirty: &mut DirtyTriggers) {
        self.pause_triggers(&GroupMatcher::Anything, dirty);
    }

    pub fn resume_all(&mut self, now: DateTime<Utc>, dirty: &mut DirtyTriggers) {
        self.paused_job_groups.clear();
        self.resume_triggers(&GroupMatcher::Anything, now, dirty);
    }

    pub fn reset_trigger_from_error_state(&mut self, key: &TriggerKey, dirty: &mut DirtyTriggers) -> bool {
        match self.triggers.get_mut(key) {
            Some(record) if record.state == TriggerState::Error => {
                record.state_info = None;
                dirty.mark(key);
                self.go_idle(key, dirty);
                true
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Replace the whole graph with freshly loaded jobs and their persisted status
    pub fn load_all(
        &mut self,
        jobs: Vec<LoadedJob>,
        documents: &HashMap<String, TriggerStatusDocument>,
        prefix: Option<&str>,
        now: DateTime<Utc>,
        dirty: &mut DirtyTriggers,
    ) -> ReconcileSummary {
        self.jobs.clear();
        self.job_groups.clear();
        self.triggers.clear();
        self.trigger_groups.clear();
        self.active.clear();
        self.blocked_jobs.clear();
        self.executing_elsewhere.clear();

        let mut summary = ReconcileSummary::default();
        for job in jobs {
            self.restore_job(job, documents, prefix, Recovery::Startup, now, dirty);
            summary.new += 1;
        }
        summary
    }

    /// Merge reloaded configuration into the graph by key and version
    pub fn apply_config_update(
        &mut self,
        jobs: Vec<LoadedJob>,
        documents: &HashMap<String, TriggerStatusDocument>,
        prefix: Option<&str>,
        now: DateTime<Utc>,
        dirty: &mut DirtyTriggers,
    ) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        let incoming: HashSet<JobKey> = jobs.iter().map(|job| job.detail.key.clone()).collect();
        let deleted: Vec<JobKey> = self
            .jobs
            .iter()
            .filter(|(key, job)| job.config.is_some() && !incoming.contains(*key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &deleted {
            info!(job = %key, "Job removed from configuration");
            self.remove_job(key, dirty);
            summary.deleted += 1;
        }

        for job in jobs {
            let supersedes = match self.jobs.get(&job.detail.key) {
                None => {
                    info!(job = %job.detail.key, "New job in configuration");
                    self.restore_job(job, documents, prefix, Recovery::ConfigUpdate, now, dirty);
                    summary.new += 1;
                    continue;
                }
                Some(existing) => existing
                    .config
                    .as_ref()
                    .map_or(true, |current| job.config.supersedes(current)),
            };
            if supersedes && self.update_job(job, now, dirty) {
                summary.updated += 1;
            }
        }

        summary
    }

    fn restore_job(
        &mut self,
        job: LoadedJob,
        documents: &HashMap<String, TriggerStatusDocument>,
        prefix: Option<&str>,
        recovery: Recovery,
        now: DateTime<Utc>,
        dirty: &mut DirtyTriggers,
    ) {
        let job_key = job.detail.key.clone();
        self.put_job(job.detail, Some(job.config));

        for trigger in job.triggers {
            if let Some(existing) = self.triggers.get(&trigger.key) {
                if existing.trigger.job_key != job_key {
                    warn!(
                        trigger = %trigger.key,
                        job = %job_key,
                        owner = %existing.trigger.job_key,
                        "Trigger key already belongs to another job; skipping"
                    );
                    continue;
                }
            }
            let id = status_document_id(prefix, &trigger.key);
            self.restore_trigger(trigger, documents.get(&id), recovery, now, dirty);
        }
    }

    fn restore_trigger(
        &mut self,
        trigger: Trigger,
        document: Option<&TriggerStatusDocument>,
        recovery: Recovery,
        now: DateTime<Utc>,
        dirty: &mut DirtyTriggers,
    ) {
        let key = trigger.key.clone();
        self.detach_trigger(&key, false, dirty);

        let mut record = TriggerRecord::new(trigger, self.node_id.clone());
        match document {
            Some(document) => document.apply_to(&mut record),
            None => dirty.mark(&key),
        }
        self.insert_record(record);
        self.recover_trigger_state(&key, recovery, now, dirty);
    }

    fn recover_trigger_state(
        &mut self,
        key: &TriggerKey,
        recovery: Recovery,
        now: DateTime<Utc>,
        dirty: &mut DirtyTriggers,
    ) {
        let Some(record) = self.triggers.get(key) else {
            return;
        };
        let state = record.state;
        let node = record.node.clone();
        let job_key = record.trigger.job_key.clone();

        match state {
            TriggerState::Executing if node == self.node_id => match recovery {
                // The process that ran it is gone; nothing else will release it
                Recovery::Startup => {
                    info!(trigger = %key, "Trigger was executing when this node stopped; releasing it");
                    self.release_to_idle(key, now, dirty);
                }
                Recovery::ConfigUpdate => {
                    debug!(trigger = %key, "Trigger is executing on this node; leaving it");
                }
            },
            TriggerState::Executing => {
                info!(
                    trigger = %key,
                    node = %node,
                    "Trigger is marked as executing on another node; waiting for confirmation"
                );
                self.active.remove(key);
                self.executing_elsewhere.insert(key.clone());
                if self.job_disallows_concurrency(&job_key) {
                    self.block_job(&job_key, key, dirty);
                }
            }
            TriggerState::Acquired
            | TriggerState::Blocked
            | TriggerState::Waiting
            | TriggerState::Deleted => self.release_to_idle(key, now, dirty),
            TriggerState::PausedBlocked => {
                if let Some(record) = self.triggers.get_mut(key) {
                    record.set_state(TriggerState::Paused, dirty);
                }
            }
            TriggerState::Paused | TriggerState::Complete | TriggerState::Error => {}
        }
    }

    fn update_job(&mut self, job: LoadedJob, now: DateTime<Utc>, dirty: &mut DirtyTriggers) -> bool {
        let job_key = job.detail.key.clone();
        let Some(record) = self.jobs.get_mut(&job_key) else {
            return false;
        };

        let mut changed = false;
        if record.detail != job.detail {
            record.detail = job.detail;
            changed = true;
        }
        record.config = Some(job.config);
        let existing: BTreeSet<TriggerKey> = record.triggers.clone();
        let allows_concurrency = !record.detail.concurrent_execution_disallowed;

        let incoming: BTreeMap<TriggerKey, Trigger> = job
            .triggers
            .into_iter()
            .map(|trigger| (trigger.key.clone(), trigger))
            .collect();

        for key in existing.iter().filter(|key| !incoming.contains_key(*key)) {
            debug!(job = %job_key, trigger = %key, "Trigger removed from job");
            self.detach_trigger(key, false, dirty);
            changed = true;
        }

        for (key, trigger) in incoming {
            match self.triggers.get(&key) {
                None => {
                    debug!(job = %job_key, trigger = %key, "Trigger added to job");
                    self.restore_trigger(trigger, None, Recovery::ConfigUpdate, now, dirty);
                    changed = true;
                }
                Some(current) if current.trigger.job_key != job_key => {
                    warn!(
                        trigger = %key,
                        job = %job_key,
                        owner = %current.trigger.job_key,
                        "Trigger key already belongs to another job; skipping"
                    );
                }
                Some(current) if current.trigger.same_definition(&trigger) => {}
                Some(_) => {
                    debug!(job = %job_key, trigger = %key, "Trigger definition changed");
                    self.redefine_trigger(trigger, now, dirty);
                    changed = true;
                }
            }
        }

        if allows_concurrency && self.blocked_jobs.contains(&job_key) {
            self.unblock_job_if_idle(&job_key, dirty);
        }
        changed
    }

    /// Swap in a new definition while keeping the trigger's runtime history
    fn redefine_trigger(&mut self, trigger: Trigger, now: DateTime<Utc>, dirty: &mut DirtyTriggers) {
        let key = trigger.key.clone();
        let Some(old) = self.detach_trigger(&key, false, dirty) else {
            return;
        };

        let executing_elsewhere = old.state == TriggerState::Executing && old.node != self.node_id;
        let mut record = TriggerRecord::new(trigger, old.node);
        record.state = old.state;
        record.state_info = old.state_info;
        record.trigger.previous_fire_time = old.trigger.previous_fire_time;
        record.trigger.times_triggered = old.trigger.times_triggered;
        self.insert_record(record);
        dirty.mark(&key);

        match old.state {
            TriggerState::Executing | TriggerState::Paused | TriggerState::PausedBlocked => {
                if let Some(record) = self.triggers.get_mut(&key) {
                    if let Err(e) = record.compute_first_fire_time(now, dirty) {
                        warn!(trigger = %key, error = %e, "Cannot compute fire time; isolating trigger");
                        record.set_error(e.to_string(), dirty);
                    }
                }
            }
            _ => self.release_to_idle(&key, now, dirty),
        }

        // Detaching dropped the watch entry; the peer still has to confirm
        if executing_elsewhere {
            self.executing_elsewhere.insert(key);
        }
    }

    /// Group the watch-list by the node each trigger is executing on, dropping
    /// entries that are no longer executing elsewhere
    pub fn watch_list_by_node(&mut self) -> BTreeMap<String, Vec<TriggerKey>> {
        let triggers = &self.triggers;
        let node_id = &self.node_id;
        self.executing_elsewhere.retain(|key| {
            triggers.get(key).is_some_and(|record| {
                record.state == TriggerState::Executing && &record.node != node_id
            })
        });

        let mut by_node: BTreeMap<String, Vec<TriggerKey>> = BTreeMap::new();
        for key in &self.executing_elsewhere {
            if let Some(record) = self.triggers.get(key) {
                by_node.entry(record.node.clone()).or_default().push(key.clone());
            }
        }
        by_node
    }

    pub fn watch_list_len(&self) -> usize {
        self.executing_elsewhere.len()
    }

    /// Release a watch-listed trigger that `asked_node` confirmed is not running.
    /// `document` is the freshly read persisted status, if any.
    pub fn release_formerly_executing(
        &mut self,
        key: &TriggerKey,
        asked_node: &str,
        document: Option<&TriggerStatusDocument>,
        now: DateTime<Utc>,
        dirty: &mut DirtyTriggers,
    ) {
        if !self.executing_elsewhere.remove(key) {
            return;
        }
        let Some(record) = self.triggers.get_mut(key) else {
            return;
        };
        let job_key = record.trigger.job_key.clone();

        match document {
            // Someone persisted a newer status since we loaded it
            Some(document)
                if document.state != TriggerState::Executing || document.node != asked_node =>
            {
                document.apply_to(record);
                self.recover_trigger_state(key, Recovery::ConfigUpdate, now, dirty);
            }
            _ => {
                info!(trigger = %key, node = %asked_node, "Trigger is not running on its node; releasing it");
                record.set_state(TriggerState::Waiting, dirty);
                self.release_to_idle(key, now, dirty);
            }
        }

        if self.job_disallows_concurrency(&job_key) {
            self.unblock_job_if_idle(&job_key, dirty);
        }
    }

    // ------------------------------------------------------------------
    // Persistence bookkeeping
    // ------------------------------------------------------------------

    /// Turn dirty keys, plus any earlier failed writes, into documents
    pub fn render_documents(&mut self, dirty: DirtyTriggers, prefix: Option<&str>) -> Vec<PendingWrite> {
        let mut all = std::mem::take(&mut self.unflushed);
        all.merge(dirty);
        let (keys, detached) = all.into_parts();

        keys.into_iter()
            .filter_map(|key| {
                let document = match self.triggers.get(&key) {
                    Some(record) => TriggerStatusDocument::from_record(record),
                    None => detached.get(&key)?.clone(),
                };
                Some(PendingWrite {
                    id: status_document_id(prefix, &key),
                    key,
                    document,
                })
            })
            .collect()
    }

    /// Keep failed writes for the next flush; live triggers are re-rendered then
    pub fn requeue_failed(&mut self, failed: Vec<PendingWrite>) {
        for write in failed {
            if self.triggers.contains_key(&write.key) {
                self.unflushed.mark(&write.key);
            } else {
                self.unflushed.mark_detached(write.key, write.document);
            }
        }
    }

    pub fn has_unflushed(&self) -> bool {
        !self.unflushed.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn is_active(&self, key: &TriggerKey) -> bool {
        self.active.contains(key)
    }
}
