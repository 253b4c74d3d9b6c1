// Cluster recovery tests: several stores share one status repository and one
// job configuration source, and confirm executing triggers with each other

use chrono::{Duration as ChronoDuration, Utc};
use common::cluster::{
    router, ConfirmationHandler, ExecutionConfirmation, HttpConfirmationClient,
    InProcessConfirmation,
};
use common::models::{
    CompletedExecutionInstruction, JobConfig, JobKey, MisfirePolicy, Schedule, TriggerDefinition,
    TriggerKey,
};
use common::persistence::{status_document_id, InMemoryStatusRepository};
use common::source::{DefaultJobFactory, InMemoryJobConfigSource};
use common::store::{ClusteredJobStore, StoreOptions, TriggerState, TriggerStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const SCHEDULER: &str = "main";

/// Shared backing services of a simulated cluster
struct Cluster {
    repository: Arc<InMemoryStatusRepository>,
    source: Arc<InMemoryJobConfigSource>,
    confirmation: Arc<InProcessConfirmation>,
}

impl Cluster {
    fn new(configs: Vec<JobConfig>) -> Self {
        Self {
            repository: Arc::new(InMemoryStatusRepository::new()),
            source: Arc::new(InMemoryJobConfigSource::new(configs)),
            confirmation: Arc::new(InProcessConfirmation::new()),
        }
    }

    fn options(node_id: &str) -> StoreOptions {
        StoreOptions {
            node_id: node_id.to_string(),
            scheduler_name: SCHEDULER.to_string(),
            watchlist_recheck_interval: Duration::from_millis(50),
            unflushed_retry_interval: Duration::from_millis(200),
            ..StoreOptions::default()
        }
    }

    fn node_with(
        &self,
        node_id: &str,
        confirmation: Arc<dyn ExecutionConfirmation>,
    ) -> Arc<ClusteredJobStore> {
        Arc::new(ClusteredJobStore::new(
            Self::options(node_id),
            self.repository.clone(),
            self.source.clone(),
            Arc::new(DefaultJobFactory),
            confirmation,
        ))
    }

    /// Build a member and make it reachable through the in-process channel
    fn join(&self, node_id: &str) -> Arc<ClusteredJobStore> {
        let store = self.node_with(node_id, self.confirmation.clone());
        self.confirmation
            .register(ConfirmationHandler::new(Arc::clone(&store)));
        store
    }

    /// Build a member that can ask others but is not reachable itself
    fn unreachable(&self, node_id: &str) -> Arc<ClusteredJobStore> {
        self.node_with(node_id, self.confirmation.clone())
    }

    fn document_state(&self, key: &TriggerKey) -> Option<(TriggerState, String)> {
        self.repository
            .get(&status_document_id(None, key))
            .map(|doc| (doc.state, doc.node))
    }
}

/// One exclusive job with two hourly triggers, five and ten minutes out
fn exclusive_job() -> JobConfig {
    job_config("sync", 1, true, &[("first", 5), ("second", 10)])
}

fn job_config(name: &str, version: i64, exclusive: bool, triggers: &[(&str, i64)]) -> JobConfig {
    JobConfig {
        key: JobKey::new("ops", name),
        version,
        description: None,
        data: serde_json::json!({"target": name}),
        concurrent_execution_disallowed: exclusive,
        persist_data_after_execution: false,
        triggers: triggers
            .iter()
            .map(|(trigger, minutes)| TriggerDefinition {
                key: TriggerKey::new("ops", *trigger),
                schedule: Schedule::Interval {
                    interval_seconds: 3600,
                    repeat_count: None,
                },
                priority: 5,
                misfire_policy: MisfirePolicy::FireNow,
                start_time: Some(Utc::now() + ChronoDuration::minutes(*minutes)),
                end_time: None,
                description: None,
            })
            .collect(),
    }
}

fn first() -> TriggerKey {
    TriggerKey::new("ops", "first")
}

fn second() -> TriggerKey {
    TriggerKey::new("ops", "second")
}

/// Acquire and fire the trigger that is due first, returning what the
/// engine would hand to a worker
async fn fire_next(store: &ClusteredJobStore) -> anyhow::Result<common::models::TriggerFiredBundle> {
    let key = first();
    let fire_at = store
        .trigger_record(&key)
        .and_then(|record| record.trigger.next_fire_time)
        .ok_or_else(|| anyhow::anyhow!("trigger {} has no fire time", key))?;
    let acquired = store
        .acquire_next_triggers(fire_at, 1, Duration::ZERO)
        .await?;
    let mut bundles = store.triggers_fired(&acquired).await?;
    bundles
        .pop()
        .ok_or_else(|| anyhow::anyhow!("nothing fired"))
}

async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test]
async fn test_trigger_executing_elsewhere_is_watched_until_it_finishes() -> anyhow::Result<()> {
    let cluster = Cluster::new(vec![exclusive_job()]);
    let node_a = cluster.join("node-a");
    node_a.initialize().await?;

    let bundle = fire_next(&node_a).await?;
    assert_eq!(
        cluster.document_state(&first()),
        Some((TriggerState::Executing, "node-a".to_string()))
    );
    assert_eq!(cluster.document_state(&second()).map(|(s, _)| s), Some(TriggerState::Blocked));

    let node_b = cluster.join("node-b");
    node_b.initialize().await?;
    assert_eq!(node_b.watch_list(), vec![first()]);
    assert_eq!(node_b.trigger_state(&second()), TriggerStatus::Blocked);
    assert!(node_b.active_trigger_keys().is_empty());

    // Still running on node-a
    assert_eq!(node_b.check_triggers_executing_elsewhere().await?, 1);
    assert_eq!(node_b.trigger_state(&second()), TriggerStatus::Blocked);

    node_a
        .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::Noop)
        .await?;

    assert_eq!(node_b.check_triggers_executing_elsewhere().await?, 0);
    assert!(node_b.watch_list().is_empty());
    assert_eq!(node_b.trigger_state(&first()), TriggerStatus::Normal);
    assert_eq!(node_b.trigger_state(&second()), TriggerStatus::Normal);
    assert_eq!(node_b.active_trigger_keys().len(), 2);

    // The released trigger keeps the fire history node-a recorded
    let record = node_b.trigger_record(&first()).expect("first trigger");
    assert_eq!(record.trigger.times_triggered, 1);
    Ok(())
}

#[tokio::test]
async fn test_redefined_trigger_stays_watched_while_executing_elsewhere() -> anyhow::Result<()> {
    let original = exclusive_job();
    let cluster = Cluster::new(vec![original.clone()]);
    let node_a = cluster.join("node-a");
    node_a.initialize().await?;
    let bundle = fire_next(&node_a).await?;

    let node_b = cluster.join("node-b");
    node_b.initialize().await?;
    assert_eq!(node_b.watch_list(), vec![first()]);
    assert_eq!(node_b.trigger_state(&second()), TriggerStatus::Blocked);

    // New version changes only the running trigger's priority
    let mut updated = original;
    updated.version = 2;
    updated.triggers[0].priority = 7;
    cluster.source.replace(vec![updated]);
    let summary = node_b.update_jobs().await?;
    assert_eq!(summary.updated, 1);

    let record = node_b.trigger_record(&first()).expect("first trigger");
    assert_eq!(record.trigger.priority, 7);
    assert_eq!(record.state, TriggerState::Executing);
    assert_eq!(record.node, "node-a");
    assert_eq!(node_b.watch_list(), vec![first()]);
    assert_eq!(node_b.check_triggers_executing_elsewhere().await?, 1);
    assert_eq!(node_b.trigger_state(&second()), TriggerStatus::Blocked);

    node_a
        .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::Noop)
        .await?;

    assert_eq!(node_b.check_triggers_executing_elsewhere().await?, 0);
    assert_eq!(node_b.trigger_state(&first()), TriggerStatus::Normal);
    assert_eq!(node_b.trigger_state(&second()), TriggerStatus::Normal);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_node_keeps_trigger_on_watch_list() -> anyhow::Result<()> {
    let cluster = Cluster::new(vec![exclusive_job()]);

    // node-a fires, then disappears without ever answering
    let crashed = cluster.unreachable("node-a");
    crashed.initialize().await?;
    fire_next(&crashed).await?;
    drop(crashed);

    let node_b = cluster.join("node-b");
    node_b.initialize().await?;
    for _ in 0..3 {
        assert_eq!(node_b.check_triggers_executing_elsewhere().await?, 1);
    }
    assert_eq!(node_b.watch_list(), vec![first()]);
    assert_eq!(node_b.trigger_state(&second()), TriggerStatus::Blocked);

    // node-a comes back; on startup it releases what it was running
    let restarted = cluster.join("node-a");
    restarted.initialize().await?;
    assert_eq!(restarted.trigger_state(&first()), TriggerStatus::Normal);
    assert_eq!(
        cluster.document_state(&first()),
        Some((TriggerState::Waiting, "node-a".to_string()))
    );

    assert_eq!(node_b.check_triggers_executing_elsewhere().await?, 0);
    assert_eq!(node_b.trigger_state(&first()), TriggerStatus::Normal);
    assert_eq!(node_b.trigger_state(&second()), TriggerStatus::Normal);
    Ok(())
}

#[tokio::test]
async fn test_deregistered_node_is_retried_not_released() -> anyhow::Result<()> {
    let cluster = Cluster::new(vec![exclusive_job()]);
    let node_a = cluster.join("node-a");
    node_a.initialize().await?;
    fire_next(&node_a).await?;

    let node_b = cluster.join("node-b");
    node_b.initialize().await?;
    cluster.confirmation.deregister("node-a", SCHEDULER);

    assert_eq!(node_b.check_triggers_executing_elsewhere().await?, 1);
    assert_eq!(node_b.trigger_record(&first()).map(|r| r.state), Some(TriggerState::Executing));
    Ok(())
}

#[tokio::test]
async fn test_maintenance_loop_releases_finished_trigger() -> anyhow::Result<()> {
    let cluster = Cluster::new(vec![exclusive_job()]);
    let node_a = cluster.join("node-a");
    node_a.initialize().await?;
    let bundle = fire_next(&node_a).await?;

    let node_b = cluster.join("node-b");
    node_b.start().await?;
    assert_eq!(node_b.watch_list(), vec![first()]);

    node_a
        .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::Noop)
        .await?;

    let released = wait_until(Duration::from_secs(5), || node_b.watch_list().is_empty()).await;
    assert!(released, "watch-list was never drained");
    assert_eq!(node_b.trigger_state(&second()), TriggerStatus::Normal);

    node_b.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_topology_storm_converges_on_latest_configuration() -> anyhow::Result<()> {
    let cluster = Cluster::new(vec![job_config("report", 1, false, &[("nightly", 30)])]);
    let node = cluster.join("node-a");
    node.start().await?;
    assert!(node.is_initialized());

    cluster.source.replace(vec![
        job_config("report", 2, false, &[("nightly", 30), ("hourly", 60)]),
        job_config("cleanup", 1, false, &[("weekly", 90)]),
    ]);
    for _ in 0..200 {
        node.cluster_topology_changed();
    }

    let converged = wait_until(Duration::from_secs(5), || {
        node.check_job_exists(&JobKey::new("ops", "cleanup"))
            && node.check_trigger_exists(&TriggerKey::new("ops", "hourly"))
    })
    .await;
    assert!(converged, "configuration change was never applied");
    assert_eq!(node.number_of_jobs(), 2);
    assert_eq!(node.number_of_triggers(), 3);

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_status_writes_failed_at_startup_are_retried() -> anyhow::Result<()> {
    let cluster = Cluster::new(vec![job_config("report", 1, false, &[("nightly", 30)])]);
    let node = cluster.join("node-a");

    // The load itself succeeds; its status writes are kept and retried
    cluster.repository.set_fail_writes(true);
    node.start().await?;
    assert!(node.is_initialized());
    assert!(node.has_unflushed_writes());

    cluster.repository.set_fail_writes(false);
    let flushed = wait_until(Duration::from_secs(5), || !node.has_unflushed_writes()).await;
    assert!(flushed, "failed writes were never retried");
    assert!(cluster.document_state(&TriggerKey::new("ops", "nightly")).is_some());

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_http_confirmation_between_nodes() -> anyhow::Result<()> {
    let cluster = Cluster::new(vec![exclusive_job()]);
    let node_a = cluster.unreachable("node-a");
    node_a.initialize().await?;
    let bundle = fire_next(&node_a).await?;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = router(ConfirmationHandler::new(Arc::clone(&node_a)));
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let client = HttpConfirmationClient::new(
        HashMap::from([("node-a".to_string(), format!("http://{}", addr))]),
        Duration::from_secs(2),
    )?;
    let node_b = cluster.node_with("node-b", Arc::new(client));
    node_b.initialize().await?;

    assert_eq!(node_b.check_triggers_executing_elsewhere().await?, 1);

    node_a
        .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::Noop)
        .await?;
    assert_eq!(node_b.check_triggers_executing_elsewhere().await?, 0);
    assert_eq!(node_b.trigger_state(&first()), TriggerStatus::Normal);

    server.abort();
    Ok(())
}
