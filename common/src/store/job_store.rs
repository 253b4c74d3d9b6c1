// Clustered scheduler state store
//
// The job/trigger graph lives in memory behind one lock. Every mutation
// collects the triggers it touched, renders their status documents and writes
// them to the shared backing store once the lock has been released.

use super::dirty::DirtyTriggers;
use super::inner::{PendingWrite, StoreState};
use super::matcher::GroupMatcher;
use super::state::{TriggerRecord, TriggerStatus};
use crate::cluster::ExecutionConfirmation;
use crate::config::Settings;
use crate::errors::StoreError;
use crate::models::{
    CompletedExecutionInstruction, JobDetail, JobKey, Trigger, TriggerFiredBundle, TriggerKey,
};
use crate::persistence::TriggerStatusRepository;
use crate::source::{JobConfigSource, JobFactory};
use crate::telemetry;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

/// Configuration for the clustered job store
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Identity of this cluster member
    pub node_id: String,
    /// Scheduler name; peers are asked about triggers of the same scheduler only
    pub scheduler_name: String,
    /// Optional prefix for status document ids
    pub instance_prefix: Option<String>,
    /// How far in the past a fire time may lie before it counts as misfired
    pub misfire_threshold: Duration,
    /// Keep running after a failed initialization and retry on the next topology change
    pub reinitialize_on_topology_change: bool,
    /// Interval between confirmations of triggers executing on other nodes
    pub watchlist_recheck_interval: Duration,
    /// Upper bound for how long a failed status write waits for its retry
    pub unflushed_retry_interval: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            scheduler_name: "default".to_string(),
            instance_prefix: None,
            misfire_threshold: Duration::from_secs(10),
            reinitialize_on_topology_change: false,
            watchlist_recheck_interval: Duration::from_secs(10),
            unflushed_retry_interval: Duration::from_secs(30),
        }
    }
}

impl StoreOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            node_id: settings.node.node_id.clone(),
            scheduler_name: settings.node.scheduler_name.clone(),
            instance_prefix: settings.node.instance_prefix.clone(),
            misfire_threshold: Duration::from_millis(settings.store.misfire_threshold_ms),
            reinitialize_on_topology_change: settings.store.reinitialize_on_topology_change,
            watchlist_recheck_interval: Duration::from_secs(
                settings.store.watchlist_recheck_seconds,
            ),
            unflushed_retry_interval: Duration::from_secs(
                settings.store.unflushed_retry_interval_seconds,
            ),
        }
    }

    fn chrono_misfire_threshold(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.misfire_threshold).unwrap_or_else(|_| chrono::Duration::seconds(10))
    }
}

/// Scheduler state store shared by the engine, the reconciliation subsystem
/// and the confirmation endpoint
pub struct ClusteredJobStore {
    pub(super) options: StoreOptions,
    state: Mutex<StoreState>,
    pub(super) repository: Arc<dyn TriggerStatusRepository>,
    pub(super) source: Arc<dyn JobConfigSource>,
    pub(super) factory: Arc<dyn JobFactory>,
    pub(super) confirmation: Arc<dyn ExecutionConfirmation>,
    /// Serializes rendering and writing so per-trigger writes land in order
    flush_gate: tokio::sync::Mutex<()>,
    scheduling_changed: Arc<Notify>,
    pub(super) maintenance: Notify,
    pub(super) reconcile_tx: mpsc::Sender<()>,
    pub(super) reconcile_rx: Mutex<Option<mpsc::Receiver<()>>>,
    pub(super) shutdown_tx: broadcast::Sender<()>,
    pub(super) initialized: AtomicBool,
    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusteredJobStore {
    pub fn new(
        options: StoreOptions,
        repository: Arc<dyn TriggerStatusRepository>,
        source: Arc<dyn JobConfigSource>,
        factory: Arc<dyn JobFactory>,
        confirmation: Arc<dyn ExecutionConfirmation>,
    ) -> Self {
        let state = StoreState::new(options.node_id.clone(), options.chrono_misfire_threshold());
        // One running reconciliation plus one pending slot
        let (reconcile_tx, reconcile_rx) = mpsc::channel(1);
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

        Self {
            options,
            state: Mutex::new(state),
            repository,
            source,
            factory,
            confirmation,
            flush_gate: tokio::sync::Mutex::new(()),
            scheduling_changed: Arc::new(Notify::new()),
            maintenance: Notify::new(),
            reconcile_tx,
            reconcile_rx: Mutex::new(Some(reconcile_rx)),
            shutdown_tx,
            initialized: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn node_id(&self) -> &str {
        &self.options.node_id
    }

    pub fn scheduler_name(&self) -> &str {
        &self.options.scheduler_name
    }

    /// Notified whenever a change may have produced an earlier fire time
    pub fn scheduling_changed(&self) -> Arc<Notify> {
        Arc::clone(&self.scheduling_changed)
    }

    pub(super) fn signal_scheduling_change(&self) {
        self.scheduling_changed.notify_one();
    }

    // ------------------------------------------------------------------
    // Lock and flush plumbing
    // ------------------------------------------------------------------

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Read access; a poisoned lock still holds a consistent graph for queries
    fn read(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `op` under the lock and hand back what it touched
    pub(super) fn run<R>(
        &self,
        op: impl FnOnce(&mut StoreState, &mut DirtyTriggers) -> Result<R, StoreError>,
    ) -> (Result<R, StoreError>, DirtyTriggers) {
        let mut dirty = DirtyTriggers::new();
        let result = match self.lock() {
            Ok(mut state) => op(&mut state, &mut dirty),
            Err(e) => Err(e),
        };
        (result, dirty)
    }

    /// Run `op` under the lock, then persist whatever it touched
    async fn apply<R>(
        &self,
        op: impl FnOnce(&mut StoreState, &mut DirtyTriggers) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let (result, dirty) = self.run(op);
        self.flush(dirty).await;
        result
    }

    fn render(&self, dirty: DirtyTriggers) -> Vec<PendingWrite> {
        match self.lock() {
            Ok(mut state) => state.render_documents(dirty, self.options.instance_prefix.as_deref()),
            Err(e) => {
                warn!(error = %e, "Cannot render trigger status documents");
                Vec::new()
            }
        }
    }

    fn requeue(&self, failed: Vec<PendingWrite>) {
        self.read().requeue_failed(failed);
    }

    /// Write the status documents of `dirty` plus any earlier failed writes.
    /// Failures are logged and kept for the next flush.
    pub(super) async fn flush(&self, dirty: DirtyTriggers) {
        let _gate = self.flush_gate.lock().await;
        let writes = self.render(dirty);
        if writes.is_empty() {
            return;
        }

        let results = futures::future::join_all(
            writes
                .iter()
                .map(|write| self.repository.upsert(&write.id, &write.document)),
        )
        .await;

        let total = writes.len();
        let failed: Vec<PendingWrite> = writes
            .into_iter()
            .zip(results)
            .filter_map(|(write, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    warn!(
                        trigger = %write.key,
                        document_id = %write.id,
                        error = %e,
                        "Failed to write trigger status; keeping it for the next flush"
                    );
                    telemetry::record_status_write_failure();
                    Some(write)
                }
            })
            .collect();

        debug!(written = total - failed.len(), failed = failed.len(), "Flushed trigger status");
        if !failed.is_empty() {
            self.requeue(failed);
        }
    }

    /// Retry status writes that failed earlier
    pub async fn flush_unflushed(&self) {
        if self.has_unflushed_writes() {
            self.flush(DirtyTriggers::new()).await;
        }
    }

    pub fn has_unflushed_writes(&self) -> bool {
        self.read().has_unflushed()
    }

    // ------------------------------------------------------------------
    // Jobs and triggers
    // ------------------------------------------------------------------

    #[instrument(skip(self, job), fields(job = %job.key))]
    pub async fn store_job(&self, job: JobDetail, replace: bool) -> Result<(), StoreError> {
        self.apply(|state, _| state.store_job(job, None, replace)).await
    }

    #[instrument(skip(self, trigger), fields(trigger = %trigger.key))]
    pub async fn store_trigger(&self, trigger: Trigger, replace: bool) -> Result<(), StoreError> {
        let now = Utc::now();
        self.apply(|state, dirty| state.store_trigger(trigger, replace, now, dirty))
            .await?;
        self.signal_scheduling_change();
        Ok(())
    }

    pub async fn store_job_and_trigger(&self, job: JobDetail, trigger: Trigger) -> Result<(), StoreError> {
        self.store_jobs_and_triggers(vec![(job, vec![trigger])], false)
            .await
    }

    /// Store several jobs with their triggers. Nothing is stored when any
    /// trigger is invalid or, without `replace`, when any key already exists.
    #[instrument(skip(self, batch), fields(jobs = batch.len()))]
    pub async fn store_jobs_and_triggers(
        &self,
        batch: Vec<(JobDetail, Vec<Trigger>)>,
        replace: bool,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        self.apply(|state, dirty| state.store_jobs_and_triggers(batch, replace, now, dirty))
            .await?;
        self.signal_scheduling_change();
        Ok(())
    }

    #[instrument(skip(self), fields(job = %key))]
    pub async fn remove_job(&self, key: &JobKey) -> Result<bool, StoreError> {
        self.apply(|state, dirty| Ok(state.remove_job(key, dirty))).await
    }

    /// True only when every job was found
    pub async fn remove_jobs(&self, keys: &[JobKey]) -> Result<bool, StoreError> {
        self.apply(|state, dirty| {
            Ok(keys
                .iter()
                .fold(true, |all, key| state.remove_job(key, dirty) && all))
        })
        .await
    }

    #[instrument(skip(self), fields(trigger = %key))]
    pub async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError> {
        self.apply(|state, dirty| Ok(state.remove_trigger(key, dirty))).await
    }

    /// True only when every trigger was found
    pub async fn remove_triggers(&self, keys: &[TriggerKey]) -> Result<bool, StoreError> {
        self.apply(|state, dirty| {
            Ok(keys
                .iter()
                .fold(true, |all, key| state.remove_trigger(key, dirty) && all))
        })
        .await
    }

    #[instrument(skip(self, trigger), fields(trigger = %key))]
    pub async fn replace_trigger(&self, key: &TriggerKey, trigger: Trigger) -> Result<bool, StoreError> {
        let now = Utc::now();
        let replaced = self
            .apply(|state, dirty| state.replace_trigger(key, trigger, now, dirty))
            .await?;
        if replaced {
            self.signal_scheduling_change();
        }
        Ok(replaced)
    }

    pub fn retrieve_job(&self, key: &JobKey) -> Option<JobDetail> {
        self.read().retrieve_job(key)
    }

    pub fn retrieve_trigger(&self, key: &TriggerKey) -> Option<Trigger> {
        self.read().retrieve_trigger(key)
    }

    pub fn check_job_exists(&self, key: &JobKey) -> bool {
        self.read().contains_job(key)
    }

    pub fn check_trigger_exists(&self, key: &TriggerKey) -> bool {
        self.read().contains_trigger(key)
    }

    pub fn trigger_state(&self, key: &TriggerKey) -> TriggerStatus {
        self.read().trigger_status(key)
    }

    /// Full record of a trigger, including its internal state and owner
    pub fn trigger_record(&self, key: &TriggerKey) -> Option<TriggerRecord> {
        self.read().record(key).cloned()
    }

    pub fn job_keys(&self, matcher: &GroupMatcher) -> Vec<JobKey> {
        self.read().job_keys(matcher)
    }

    pub fn trigger_keys(&self, matcher: &GroupMatcher) -> Vec<TriggerKey> {
        self.read().trigger_keys(matcher)
    }

    pub fn job_group_names(&self) -> Vec<String> {
        self.read().job_group_names()
    }

    pub fn trigger_group_names(&self) -> Vec<String> {
        self.read().trigger_group_names()
    }

    pub fn triggers_for_job(&self, key: &JobKey) -> Vec<Trigger> {
        self.read().triggers_for_job(key)
    }

    pub fn number_of_jobs(&self) -> usize {
        self.read().number_of_jobs()
    }

    pub fn number_of_triggers(&self) -> usize {
        self.read().number_of_triggers()
    }

    pub fn paused_trigger_groups(&self) -> BTreeSet<String> {
        self.read().paused_trigger_groups()
    }

    /// Keys currently in the active index, in firing order
    pub fn active_trigger_keys(&self) -> Vec<TriggerKey> {
        self.read().active_trigger_keys()
    }

    /// Triggers known to be executing on other nodes and awaiting confirmation
    pub fn watch_list(&self) -> Vec<TriggerKey> {
        self.read().watch_list()
    }

    /// Keys among `keys` this node is executing right now
    pub fn executing_trigger_keys(&self, keys: &[TriggerKey]) -> HashSet<TriggerKey> {
        self.read().executing_here(keys)
    }

    // ------------------------------------------------------------------
    // Engine protocol
    // ------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<Trigger>, StoreError> {
        let now = Utc::now();
        let window = chrono::Duration::from_std(time_window).unwrap_or_else(|_| chrono::Duration::zero());
        let acquired = self
            .apply(|state, dirty| {
                Ok(state.acquire_next_triggers(no_later_than, max_count, window, now, dirty))
            })
            .await?;

        if !acquired.is_empty() {
            telemetry::record_triggers_acquired(acquired.len());
            debug!(count = acquired.len(), "Acquired triggers");
        }
        Ok(acquired)
    }

    pub async fn release_acquired_trigger(&self, trigger: &Trigger) -> Result<(), StoreError> {
        let released = self
            .apply(|state, dirty| Ok(state.release_acquired_trigger(&trigger.key, dirty)))
            .await?;
        if released {
            debug!(trigger = %trigger.key, "Released acquired trigger");
            self.signal_scheduling_change();
        }
        Ok(())
    }

    #[instrument(skip(self, triggers), fields(count = triggers.len()))]
    pub async fn triggers_fired(&self, triggers: &[Trigger]) -> Result<Vec<TriggerFiredBundle>, StoreError> {
        let now = Utc::now();
        let bundles = self
            .apply(|state, dirty| Ok(state.triggers_fired(triggers, now, dirty)))
            .await?;
        for bundle in &bundles {
            telemetry::record_trigger_fired(&bundle.job.key.group);
        }
        Ok(bundles)
    }

    #[instrument(skip(self, trigger, job), fields(trigger = %trigger.key))]
    pub async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<(), StoreError> {
        self.apply(|state, dirty| {
            state.triggered_job_complete(trigger, job, instruction, dirty);
            Ok(())
        })
        .await?;
        self.signal_scheduling_change();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pause / resume
    // ------------------------------------------------------------------

    pub async fn pause_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError> {
        self.apply(|state, dirty| Ok(state.pause_trigger(key, dirty))).await
    }

    /// Pause matching trigger groups; returns the groups paused
    pub async fn pause_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError> {
        self.apply(|state, dirty| Ok(state.pause_triggers(matcher, dirty)))
            .await
    }

    pub async fn pause_job(&self, key: &JobKey) -> Result<bool, StoreError> {
        self.apply(|state, dirty| Ok(state.pause_job(key, dirty))).await
    }

    /// Pause matching job groups; returns the groups paused
    pub async fn pause_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError> {
        self.apply(|state, dirty| Ok(state.pause_jobs(matcher, dirty))).await
    }

    pub async fn resume_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError> {
        let now = Utc::now();
        let resumed = self
            .apply(|state, dirty| Ok(state.resume_trigger(key, now, dirty)))
            .await?;
        self.signal_scheduling_change();
        Ok(resumed)
    }

    pub async fn resume_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError> {
        let now = Utc::now();
        let groups = self
            .apply(|state, dirty| Ok(state.resume_triggers(matcher, now, dirty)))
            .await?;
        self.signal_scheduling_change();
        Ok(groups)
    }

    pub async fn resume_job(&self, key: &JobKey) -> Result<bool, StoreError> {
        let now = Utc::now();
        let resumed = self
            .apply(|state, dirty| Ok(state.resume_job(key, now, dirty)))
            .await?;
        self.signal_scheduling_change();
        Ok(resumed)
    }

    pub async fn resume_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError> {
        let now = Utc::now();
        let groups = self
            .apply(|state, dirty| Ok(state.resume_jobs(matcher, now, dirty)))
            .await?;
        self.signal_scheduling_change();
        Ok(groups)
    }

    pub async fn pause_all(&self) -> Result<(), StoreError> {
        self.apply(|state, dirty| {
            state.pause_all(dirty);
            Ok(())
        })
        .await
    }

    pub async fn resume_all(&self) -> Result<(), StoreError> {
        let now = Utc::now();
        self.apply(|state, dirty| {
            state.resume_all(now, dirty);
            Ok(())
        })
        .await?;
        self.signal_scheduling_change();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    pub async fn reset_trigger_from_error_state(&self, key: &TriggerKey) -> Result<bool, StoreError> {
        let reset = self
            .apply(|state, dirty| Ok(state.reset_trigger_from_error_state(key, dirty)))
            .await?;
        if reset {
            self.signal_scheduling_change();
        }
        Ok(reset)
    }

    /// Remove every job and trigger; each trigger is persisted as DELETED
    #[instrument(skip(self))]
    pub async fn clear_all_scheduling_data(&self) -> Result<(), StoreError> {
        self.apply(|state, dirty| {
            state.clear_all(dirty);
            Ok(())
        })
        .await
    }

    // Calendars are not supported by this store

    pub fn store_calendar(&self, _name: &str, _replace: bool, _update_triggers: bool) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("calendars"))
    }

    pub fn retrieve_calendar(&self, _name: &str) -> Option<serde_json::Value> {
        None
    }

    pub fn remove_calendar(&self, _name: &str) -> bool {
        false
    }

    pub fn calendar_names(&self) -> Vec<String> {
        Vec::new()
    }

    pub fn number_of_calendars(&self) -> usize {
        0
    }
}
