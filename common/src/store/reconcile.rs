// Cluster reconciliation: initial load, config updates, topology changes and
// confirmation of triggers left executing on other nodes

use super::dirty::DirtyTriggers;
use super::inner::LoadedJob;
use super::job_store::ClusteredJobStore;
use crate::errors::{PersistenceError, StoreError};
use crate::models::{JobConfig, JobKey, TriggerKey};
use crate::persistence::{status_document_id, TriggerStatusDocument};
use crate::telemetry;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use tokio::sync::broadcast;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Outcome of a configuration load or reload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub new: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl ReconcileSummary {
    pub fn is_empty(&self) -> bool {
        self.new == 0 && self.updated == 0 && self.deleted == 0
    }
}

impl fmt::Display for ReconcileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "new: {}; upd: {}; del: {}",
            self.new, self.updated, self.deleted
        )
    }
}

impl ClusteredJobStore {
    /// Start background tasks and load the initial configuration.
    ///
    /// A failed initial load is fatal unless `reinitialize_on_topology_change`
    /// is set, in which case the next topology change retries it.
    pub async fn start(self: &Arc<Self>) -> Result<(), StoreError> {
        let receiver = self
            .reconcile_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(receiver) = receiver else {
            debug!("Job store already started");
            return Ok(());
        };

        // Subscribe before spawning so an early shutdown is never missed
        let handles = vec![
            tokio::spawn(
                Arc::clone(self).run_reconcile_worker(receiver, self.shutdown_tx.subscribe()),
            ),
            tokio::spawn(Arc::clone(self).run_maintenance_loop(self.shutdown_tx.subscribe())),
            tokio::spawn(Arc::clone(self).run_unflushed_retry_loop(self.shutdown_tx.subscribe())),
        ];
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);

        match self.initialize().await {
            Ok(_) => Ok(()),
            Err(e) if self.options.reinitialize_on_topology_change => {
                error!(
                    error = %e,
                    "Job store initialization failed; retrying on the next cluster topology change"
                );
                Ok(())
            }
            Err(e) => Err(StoreError::Initialization(e.to_string())),
        }
    }

    /// Stop background tasks
    pub async fn shutdown(&self) {
        info!("Shutting down job store background tasks");
        let _ = self.shutdown_tx.send(());

        let handles: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Job store task ended abnormally");
            }
        }
        self.flush_unflushed().await;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Load all job configurations and their persisted status and rebuild the graph.
    /// Triggers this node was executing when it last stopped are released.
    #[instrument(skip(self), fields(node_id = %self.options.node_id))]
    pub async fn initialize(&self) -> Result<ReconcileSummary, StoreError> {
        let jobs = self.load_jobs().await?;
        let ids = self.status_ids(jobs.iter());
        let documents = self.repository.find_many(&ids).await?;
        debug!(
            triggers = ids.len(),
            persisted = documents.len(),
            "Loaded trigger status"
        );

        let now = Utc::now();
        let prefix = self.options.instance_prefix.clone();
        let (result, dirty) = self.run(|state, dirty| {
            Ok(state.load_all(jobs, &documents, prefix.as_deref(), now, dirty))
        });
        let summary = result?;
        self.flush(dirty).await;

        self.initialized.store(true, Ordering::SeqCst);
        let watched = self.arm_maintenance_if_needed();
        info!(%summary, watched, "Job store initialized");
        self.signal_scheduling_change();
        Ok(summary)
    }

    /// Reload configuration and apply the differences by job key and version
    #[instrument(skip(self), fields(node_id = %self.options.node_id))]
    pub async fn update_jobs(&self) -> Result<ReconcileSummary, StoreError> {
        let jobs = self.load_jobs().await?;
        let new_ids = self.status_ids_of_new_jobs(&jobs);
        let documents = if new_ids.is_empty() {
            HashMap::new()
        } else {
            self.repository.find_many(&new_ids).await?
        };

        let now = Utc::now();
        let prefix = self.options.instance_prefix.clone();
        let (result, dirty) = self.run(|state, dirty| {
            Ok(state.apply_config_update(jobs, &documents, prefix.as_deref(), now, dirty))
        });
        let summary = result?;
        self.flush(dirty).await;

        if summary.is_empty() {
            debug!("Job configuration unchanged");
        } else {
            info!(%summary, "Job configuration updated");
            self.signal_scheduling_change();
        }
        self.arm_maintenance_if_needed();
        Ok(summary)
    }

    /// Request a reconciliation run. Never blocks; while one run is pending,
    /// further requests are collapsed into it.
    pub fn cluster_topology_changed(&self) {
        match self.reconcile_tx.try_send(()) {
            Ok(()) => debug!("Reconciliation scheduled after cluster topology change"),
            Err(TrySendError::Full(())) => {
                debug!("Reconciliation already pending; collapsing topology change")
            }
            Err(TrySendError::Closed(())) => {
                warn!("Reconciliation worker is not running; ignoring topology change")
            }
        }
    }

    /// Ask the owning nodes whether watch-listed triggers still execute and
    /// release those that do not. Returns the number still being watched.
    #[instrument(skip(self))]
    pub async fn check_triggers_executing_elsewhere(&self) -> Result<usize, StoreError> {
        let (result, _) = self.run(|state, _| Ok(state.watch_list_by_node()));
        let by_node = result?;

        for (node, keys) in by_node {
            let running = match self
                .confirmation
                .executing_triggers(&node, &self.options.scheduler_name, &keys)
                .await
            {
                Ok(running) => running,
                Err(e) => {
                    warn!(
                        node = %node,
                        pending = keys.len(),
                        error = %e,
                        "Could not confirm executing triggers; will ask again"
                    );
                    continue;
                }
            };

            let finished: Vec<TriggerKey> = keys
                .into_iter()
                .filter(|key| !running.contains(key))
                .collect();
            if finished.is_empty() {
                continue;
            }
            if let Err(e) = self.release_finished(&node, &finished).await {
                warn!(node = %node, error = %e, "Could not reload trigger status; will ask again");
            }
        }

        let remaining = self.watch_list().len();
        telemetry::update_watchlist_size(remaining);
        Ok(remaining)
    }

    async fn release_finished(&self, node: &str, finished: &[TriggerKey]) -> Result<(), StoreError> {
        let prefix = self.options.instance_prefix.as_deref();
        let ids: Vec<String> = finished
            .iter()
            .map(|key| status_document_id(prefix, key))
            .collect();
        let documents: HashMap<String, TriggerStatusDocument> =
            self.repository.find_many(&ids).await?;

        let now = Utc::now();
        let (result, dirty) = self.run(|state, dirty| {
            for (key, id) in finished.iter().zip(&ids) {
                state.release_formerly_executing(key, node, documents.get(id), now, dirty);
            }
            Ok(())
        });
        self.flush(dirty).await;
        result?;

        info!(node = %node, released = finished.len(), "Released triggers no longer executing elsewhere");
        self.signal_scheduling_change();
        Ok(())
    }

    async fn reconcile(&self) {
        let result = if self.is_initialized() {
            self.update_jobs().await
        } else {
            self.initialize().await
        };
        if let Err(e) = result {
            error!(error = %e, "Reconciliation after cluster topology change failed");
        }
    }

    async fn load_jobs(&self) -> Result<Vec<LoadedJob>, StoreError> {
        let configs = self
            .source
            .load_all()
            .await
            .map_err(PersistenceError::from)?;
        Ok(self.render_jobs(configs))
    }

    /// Render configs through the job factory; invalid or duplicate entries
    /// are logged and skipped
    fn render_jobs(&self, configs: Vec<JobConfig>) -> Vec<LoadedJob> {
        let mut jobs = Vec::with_capacity(configs.len());
        let mut seen_jobs: HashSet<JobKey> = HashSet::new();
        let mut seen_triggers: HashSet<TriggerKey> = HashSet::new();

        for config in configs {
            if !seen_jobs.insert(config.key.clone()) {
                warn!(job = %config.key, "Duplicate job configuration; skipping");
                continue;
            }
            let detail = match self.factory.create_job_detail(&config) {
                Ok(detail) => detail,
                Err(e) => {
                    warn!(job = %config.key, error = %e, "Invalid job configuration; skipping");
                    continue;
                }
            };

            let mut triggers = Vec::with_capacity(config.triggers.len());
            for definition in &config.triggers {
                if !seen_triggers.insert(definition.key.clone()) {
                    warn!(
                        job = %config.key,
                        trigger = %definition.key,
                        "Duplicate trigger key; skipping"
                    );
                    continue;
                }
                match self.factory.create_trigger(&detail.key, definition) {
                    Ok(trigger) => triggers.push(trigger),
                    Err(e) => warn!(
                        job = %config.key,
                        trigger = %definition.key,
                        error = %e,
                        "Invalid trigger configuration; skipping"
                    ),
                }
            }

            jobs.push(LoadedJob {
                detail,
                config,
                triggers,
            });
        }
        jobs
    }

    fn status_ids<'a>(&self, jobs: impl Iterator<Item = &'a LoadedJob>) -> Vec<String> {
        let prefix = self.options.instance_prefix.as_deref();
        jobs.flat_map(|job| job.triggers.iter())
            .map(|trigger| status_document_id(prefix, &trigger.key))
            .collect()
    }

    fn status_ids_of_new_jobs(&self, jobs: &[LoadedJob]) -> Vec<String> {
        let new_jobs: Vec<&LoadedJob> = jobs
            .iter()
            .filter(|job| !self.check_job_exists(&job.detail.key))
            .collect();
        self.status_ids(new_jobs.into_iter())
    }

    /// Wake the maintenance loop when something is on the watch-list
    fn arm_maintenance_if_needed(&self) -> usize {
        let watched = self.watch_list().len();
        telemetry::update_watchlist_size(watched);
        if watched > 0 {
            self.maintenance.notify_one();
        }
        watched
    }

    async fn run_reconcile_worker(
        self: Arc<Self>,
        mut receiver: tokio::sync::mpsc::Receiver<()>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                request = receiver.recv() => match request {
                    Some(()) => self.reconcile().await,
                    None => break,
                },
            }
        }
        debug!("Reconciliation worker stopped");
    }

    async fn run_maintenance_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = self.maintenance.notified() => {}
            }

            // Keep asking until nothing is left to watch
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    _ = sleep(self.options.watchlist_recheck_interval) => {}
                }
                match self.check_triggers_executing_elsewhere().await {
                    Ok(0) => break,
                    Ok(remaining) => debug!(remaining, "Triggers still executing elsewhere"),
                    Err(e) => warn!(error = %e, "Watch-list check failed"),
                }
            }
        }
        debug!("Maintenance loop stopped");
    }

    async fn run_unflushed_retry_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = interval(self.options.unflushed_retry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => self.flush_unflushed().await,
            }
        }
        debug!("Unflushed status retry loop stopped");
    }
}
