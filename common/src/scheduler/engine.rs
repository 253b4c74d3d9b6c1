// Scheduler engine: acquires due triggers from the store, waits for their fire
// time and hands them to the worker pool

use crate::config::EngineConfig;
use crate::errors::{ExecutionError, StoreError};
use crate::models::{CompletedExecutionInstruction, Trigger, TriggerFiredBundle};
use crate::store::ClusteredJobStore;
use crate::worker::{ElasticWorkerPool, Work};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long to wait when nothing is due, unless the schedule changes first
    pub idle_wait: Duration,
    /// Maximum number of triggers acquired per round
    pub max_batch_size: usize,
    /// Triggers firing this long after the first one join its batch
    pub batch_time_window: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_wait: Duration::from_secs(30),
            max_batch_size: 1,
            batch_time_window: Duration::ZERO,
        }
    }
}

impl SchedulerConfig {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            idle_wait: Duration::from_millis(config.idle_wait_ms),
            max_batch_size: config.max_batch_size,
            batch_time_window: Duration::from_millis(config.batch_time_window_ms),
        }
    }
}

/// Outcome of one job execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobExecutionResult {
    pub instruction: CompletedExecutionInstruction,
    /// Replacement job data, kept when the job persists data after execution
    pub job_data: Option<serde_json::Value>,
}

/// Runs the job behind a fired trigger. Called on a worker thread.
#[cfg_attr(test, mockall::automock)]
pub trait JobRunner: Send + Sync {
    fn run(&self, bundle: &TriggerFiredBundle) -> Result<JobExecutionResult, ExecutionError>;
}

/// Scheduler trait for trigger scheduling operations
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Start the scheduling loop
    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Stop the scheduler gracefully
    async fn stop(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Acquire, wait for and fire the next batch of triggers
    async fn process_due_triggers(&self) -> Result<usize, Box<dyn std::error::Error + Send + Sync>>;
}

/// Main scheduler engine implementation
pub struct SchedulerEngine {
    config: SchedulerConfig,
    store: Arc<ClusteredJobStore>,
    pool: Arc<ElasticWorkerPool>,
    runner: Arc<dyn JobRunner>,
    stopping: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl SchedulerEngine {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<ClusteredJobStore>,
        pool: Arc<ElasticWorkerPool>,
        runner: Arc<dyn JobRunner>,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

        Self {
            config,
            store,
            pool,
            runner,
            stopping: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Get a shutdown signal receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Wait for `duration`; returns true when the schedule changed or shutdown
    /// started before it elapsed
    async fn wait_interruptibly(&self, duration: Duration) -> bool {
        let changed = self.store.scheduling_changed();
        let mut shutdown_rx = self.shutdown_receiver();
        if self.is_stopping() {
            return true;
        }
        tokio::select! {
            _ = sleep(duration) => false,
            _ = changed.notified() => true,
            _ = shutdown_rx.recv() => true,
        }
    }

    /// Work item running the job and reporting completion back to the store
    fn job_work(&self, bundle: TriggerFiredBundle) -> Work {
        let store = Arc::clone(&self.store);
        let runner = Arc::clone(&self.runner);
        let runtime = Handle::current();

        Box::new(move || {
            let (instruction, job) = match runner.run(&bundle) {
                Ok(result) => {
                    let mut job = bundle.job.clone();
                    if let Some(data) = result.job_data {
                        job.data = data;
                    }
                    (result.instruction, job)
                }
                Err(e) => {
                    error!(
                        trigger = %bundle.trigger.key,
                        job = %bundle.job.key,
                        error = %e,
                        "Job execution failed"
                    );
                    (CompletedExecutionInstruction::Noop, bundle.job.clone())
                }
            };

            let completed =
                runtime.block_on(store.triggered_job_complete(&bundle.trigger, &job, instruction));
            if let Err(e) = completed {
                error!(trigger = %bundle.trigger.key, error = %e, "Failed to record job completion");
            }
        })
    }

    async fn release_all(&self, triggers: &[Trigger]) -> Result<(), StoreError> {
        for trigger in triggers {
            self.store.release_acquired_trigger(trigger).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Scheduler for SchedulerEngine {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(
            idle_wait_ms = self.config.idle_wait.as_millis() as u64,
            max_batch_size = self.config.max_batch_size,
            "Starting scheduler engine"
        );

        while !self.is_stopping() {
            match self.process_due_triggers().await {
                Ok(count) if count > 0 => debug!(fired = count, "Fired triggers"),
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Error processing due triggers");
                    // Avoid spinning on a persistent failure
                    self.wait_interruptibly(Duration::from_secs(1)).await;
                }
            }
        }

        info!("Scheduler engine stopped");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("Stopping scheduler engine");
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        Ok(())
    }

    async fn process_due_triggers(&self) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        let pool = Arc::clone(&self.pool);
        let capacity = tokio::task::spawn_blocking(move || pool.block_until_capacity()).await?;
        if capacity == 0 || self.is_stopping() {
            return Ok(0);
        }

        let max_count = capacity.min(self.config.max_batch_size.max(1));
        let horizon = Utc::now()
            + chrono::Duration::from_std(self.config.idle_wait)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let triggers = self
            .store
            .acquire_next_triggers(horizon, max_count, self.config.batch_time_window)
            .await?;

        if triggers.is_empty() {
            self.wait_interruptibly(self.config.idle_wait).await;
            return Ok(0);
        }

        let first_fire_time = triggers
            .iter()
            .filter_map(|t| t.next_fire_time)
            .min()
            .unwrap_or_else(Utc::now);
        let delay = (first_fire_time - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if !delay.is_zero() && self.wait_interruptibly(delay).await {
            debug!(count = triggers.len(), "Schedule changed while waiting; releasing acquired triggers");
            self.release_all(&triggers).await?;
            return Ok(0);
        }

        let bundles = self.store.triggers_fired(&triggers).await?;
        let mut fired = 0;
        for bundle in bundles {
            let trigger = bundle.trigger.clone();
            let job = bundle.job.clone();
            match self.pool.submit(self.job_work(bundle)) {
                Ok(()) => fired += 1,
                Err(rejected) => {
                    warn!(
                        trigger = %trigger.key,
                        reason = %rejected.reason(),
                        "Worker pool rejected fired trigger"
                    );
                    self.store
                        .triggered_job_complete(
                            &trigger,
                            &job,
                            CompletedExecutionInstruction::SetAllJobTriggersError,
                        )
                        .await?;
                }
            }
        }

        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InProcessConfirmation;
    use crate::models::{JobDetail, JobKey, Schedule, Trigger, TriggerKey};
    use crate::persistence::InMemoryStatusRepository;
    use crate::source::{DefaultJobFactory, InMemoryJobConfigSource};
    use crate::store::{StoreOptions, TriggerState, TriggerStatus};
    use crate::worker::PoolOptions;

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.idle_wait, Duration::from_secs(30));
        assert_eq!(config.max_batch_size, 1);
        assert_eq!(config.batch_time_window, Duration::ZERO);
    }

    #[test]
    fn test_scheduler_config_from_engine_config() {
        let config = SchedulerConfig::from_config(&EngineConfig {
            idle_wait_ms: 500,
            max_batch_size: 10,
            batch_time_window_ms: 250,
        });
        assert_eq!(config.idle_wait, Duration::from_millis(500));
        assert_eq!(config.max_batch_size, 10);
        assert_eq!(config.batch_time_window, Duration::from_millis(250));
    }

    fn store() -> Arc<ClusteredJobStore> {
        Arc::new(ClusteredJobStore::new(
            StoreOptions::default(),
            Arc::new(InMemoryStatusRepository::new()),
            Arc::new(InMemoryJobConfigSource::default()),
            Arc::new(DefaultJobFactory),
            Arc::new(InProcessConfirmation::new()),
        ))
    }

    async fn wait_for_status(store: &ClusteredJobStore, key: &TriggerKey, status: TriggerStatus) -> bool {
        for _ in 0..200 {
            if store.trigger_state(key) == status {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fires_due_trigger_and_applies_instruction() {
        let store = store();
        let job = JobKey::new("g", "j");
        let key = TriggerKey::new("g", "once");
        store
            .store_job_and_trigger(
                JobDetail::new(job.clone()),
                Trigger::new(key.clone(), job, Schedule::OneTime { execute_at: Utc::now() }),
            )
            .await
            .unwrap();

        let mut runner = MockJobRunner::new();
        runner.expect_run().times(1).returning(|bundle| {
            assert_eq!(bundle.trigger.times_triggered, 1);
            Ok(JobExecutionResult {
                instruction: CompletedExecutionInstruction::SetTriggerComplete,
                job_data: None,
            })
        });

        let pool = Arc::new(ElasticWorkerPool::new(PoolOptions::default()));
        let engine = SchedulerEngine::new(
            SchedulerConfig::default(),
            Arc::clone(&store),
            Arc::clone(&pool),
            Arc::new(runner),
        );

        let fired = engine.process_due_triggers().await.unwrap();
        assert_eq!(fired, 1);
        assert!(wait_for_status(&store, &key, TriggerStatus::Complete).await);
        tokio::task::spawn_blocking(move || pool.shutdown(true))
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_execution_requeues_trigger() {
        let store = store();
        let job = JobKey::new("g", "j");
        let key = TriggerKey::new("g", "every-hour");
        let trigger = Trigger::new(
            key.clone(),
            job.clone(),
            Schedule::Interval {
                interval_seconds: 3600,
                repeat_count: None,
            },
        )
        .with_start_time(Utc::now());
        store
            .store_job_and_trigger(JobDetail::new(job), trigger)
            .await
            .unwrap();

        let mut runner = MockJobRunner::new();
        runner
            .expect_run()
            .times(1)
            .returning(|_| Err(ExecutionError::Failed("exit code 1".to_string())));

        let pool = Arc::new(ElasticWorkerPool::new(PoolOptions::default()));
        let engine = SchedulerEngine::new(
            SchedulerConfig::default(),
            Arc::clone(&store),
            Arc::clone(&pool),
            Arc::new(runner),
        );

        assert_eq!(engine.process_due_triggers().await.unwrap(), 1);
        // Shutdown waits for the running job to report completion
        tokio::task::spawn_blocking(move || pool.shutdown(true))
            .await
            .unwrap();
        let record = store.trigger_record(&key).unwrap();
        assert_eq!(record.state, TriggerState::Waiting);
        assert_eq!(record.trigger.times_triggered, 1);
        assert!(record.trigger.next_fire_time.unwrap() > Utc::now());
    }
}
