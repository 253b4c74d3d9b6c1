// Property-based tests for the active trigger index, trigger acquisition and
// status document ids

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use common::cluster::InProcessConfirmation;
use common::models::{JobDetail, JobKey, Schedule, Trigger, TriggerKey};
use common::persistence::{status_document_id, InMemoryStatusRepository};
use common::source::{DefaultJobFactory, InMemoryJobConfigSource};
use common::store::{ActiveTriggerIndex, ClusteredJobStore, StoreOptions};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn indexed(name: &str, minute: i64, priority: i32) -> Trigger {
    let mut trigger = Trigger::new(
        TriggerKey::new("g", name),
        JobKey::new("g", "job"),
        Schedule::Interval {
            interval_seconds: 60,
            repeat_count: None,
        },
    )
    .with_priority(priority);
    trigger.next_fire_time = Some(base() + ChronoDuration::minutes(minute));
    trigger
}

#[derive(Debug, Clone)]
enum IndexOp {
    Add { name: u8, minute: i64, priority: i32 },
    Remove { name: u8 },
}

fn index_op() -> impl Strategy<Value = IndexOp> {
    prop_oneof![
        3 => (0u8..12, 0i64..30, -3i32..4).prop_map(|(name, minute, priority)| IndexOp::Add {
            name,
            minute,
            priority
        }),
        1 => (0u8..12).prop_map(|name| IndexOp::Remove { name }),
    ]
}

/// *For any* sequence of adds and removes, the index holds exactly one entry per
/// live key and drains in (fire time, priority descending, key) order.
#[test]
fn property_active_index_order_and_membership() {
    proptest!(|(ops in prop::collection::vec(index_op(), 0..60))| {
        let mut index = ActiveTriggerIndex::new();
        let mut model: HashMap<TriggerKey, (DateTime<Utc>, i32)> = HashMap::new();

        for op in ops {
            match op {
                IndexOp::Add { name, minute, priority } => {
                    let trigger = indexed(&format!("t{}", name), minute, priority);
                    index.add(&trigger);
                    model.insert(
                        trigger.key.clone(),
                        (trigger.next_fire_time.unwrap(), priority),
                    );
                }
                IndexOp::Remove { name } => {
                    let key = TriggerKey::new("g", format!("t{}", name));
                    let removed = index.remove(&key);
                    prop_assert_eq!(removed, model.remove(&key).is_some());
                }
            }
            prop_assert_eq!(index.len(), model.len());
        }

        for key in model.keys() {
            prop_assert!(index.contains(key));
        }

        let mut expected: Vec<(DateTime<Utc>, std::cmp::Reverse<i32>, TriggerKey)> = model
            .iter()
            .map(|(key, (time, priority))| (*time, std::cmp::Reverse(*priority), key.clone()))
            .collect();
        expected.sort();

        let mut drained = Vec::new();
        while let Some(trigger) = index.poll_minimum() {
            prop_assert_eq!(
                model.get(&trigger.key).map(|(t, _)| *t),
                trigger.next_fire_time
            );
            drained.push(trigger.key);
        }
        let expected_keys: Vec<TriggerKey> = expected.into_iter().map(|(_, _, key)| key).collect();
        prop_assert_eq!(drained, expected_keys);
        prop_assert!(index.is_empty());
    });
}

/// A trigger without a next fire time is never indexed
#[test]
fn property_dormant_trigger_is_not_indexed() {
    proptest!(|(minute in 0i64..30, priority in -5i32..5)| {
        let mut index = ActiveTriggerIndex::new();
        let mut trigger = indexed("t", minute, priority);
        prop_assert!(index.add(&trigger));

        trigger.next_fire_time = None;
        prop_assert!(!index.add(&trigger));
        prop_assert!(!index.contains(&trigger.key));
        prop_assert!(index.peek_minimum().is_none());
    });
}

#[derive(Debug, Clone)]
struct Planned {
    job: u8,
    seconds_ago: i64,
    priority: i32,
}

fn planned() -> impl Strategy<Value = Planned> {
    (0u8..4, 1i64..8, -2i32..3).prop_map(|(job, seconds_ago, priority)| Planned {
        job,
        seconds_ago,
        priority,
    })
}

fn store() -> ClusteredJobStore {
    ClusteredJobStore::new(
        StoreOptions {
            misfire_threshold: Duration::from_secs(60),
            ..StoreOptions::default()
        },
        Arc::new(InMemoryStatusRepository::new()),
        Arc::new(InMemoryJobConfigSource::default()),
        Arc::new(DefaultJobFactory),
        Arc::new(InProcessConfirmation::new()),
    )
}

/// *For any* set of due triggers, one acquisition returns them in firing
/// order, never holds two triggers of a job that disallows concurrent
/// execution, and leaves every skipped trigger waiting in the index.
#[test]
fn property_acquire_order_and_exclusion() {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    proptest!(|(plan in prop::collection::vec(planned(), 1..16))| {
        let store = store();
        let now = Utc::now();

        runtime.block_on(async {
            for job in 0u8..4 {
                let mut detail = JobDetail::new(JobKey::new("g", format!("job{}", job)));
                // Odd jobs disallow concurrent execution
                if job % 2 == 1 {
                    detail = detail.disallow_concurrent_execution();
                }
                store.store_job(detail, false).await.unwrap();
            }
            for (i, entry) in plan.iter().enumerate() {
                let trigger = Trigger::new(
                    TriggerKey::new("g", format!("t{:02}", i)),
                    JobKey::new("g", format!("job{}", entry.job)),
                    Schedule::Interval {
                        interval_seconds: 3600,
                        repeat_count: None,
                    },
                )
                .with_start_time(now - ChronoDuration::seconds(entry.seconds_ago))
                .with_priority(entry.priority);
                store.store_trigger(trigger, false).await.unwrap();
            }
        });

        let acquired = runtime
            .block_on(store.acquire_next_triggers(
                Utc::now() + ChronoDuration::seconds(1),
                plan.len(),
                Duration::from_secs(60),
            ))
            .unwrap();

        let positions: Vec<(DateTime<Utc>, std::cmp::Reverse<i32>, TriggerKey)> = acquired
            .iter()
            .map(|t| (t.next_fire_time.unwrap(), std::cmp::Reverse(t.priority), t.key.clone()))
            .collect();
        let mut sorted = positions.clone();
        sorted.sort();
        prop_assert_eq!(positions, sorted);

        let mut exclusive_jobs = HashSet::new();
        for trigger in &acquired {
            if trigger.job_key.name.ends_with('1') || trigger.job_key.name.ends_with('3') {
                prop_assert!(exclusive_jobs.insert(trigger.job_key.clone()));
            }
        }

        let expected = plan
            .iter()
            .filter(|p| p.job % 2 == 0)
            .count()
            + plan
                .iter()
                .filter(|p| p.job % 2 == 1)
                .map(|p| p.job)
                .collect::<HashSet<_>>()
                .len();
        prop_assert_eq!(acquired.len(), expected);

        let acquired_keys: HashSet<TriggerKey> = acquired.iter().map(|t| t.key.clone()).collect();
        let active: HashSet<TriggerKey> = store.active_trigger_keys().into_iter().collect();
        prop_assert_eq!(active.len() + acquired_keys.len(), plan.len());
        prop_assert!(active.is_disjoint(&acquired_keys));
    });
}

fn key_component() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-c.\\\\]{0,4}").unwrap()
}

/// *For any* two distinct trigger keys, with or without a shared prefix,
/// the status document ids differ.
#[test]
fn property_document_ids_never_collide() {
    proptest!(|(
        a_group in key_component(),
        a_name in key_component(),
        b_group in key_component(),
        b_name in key_component(),
        prefix in prop::option::of(key_component()),
    )| {
        let a = TriggerKey::new(a_group, a_name);
        let b = TriggerKey::new(b_group, b_name);
        let a_id = status_document_id(prefix.as_deref(), &a);
        let b_id = status_document_id(prefix.as_deref(), &b);
        prop_assert_eq!(a == b, a_id == b_id);
    });
}

/// Ids from different instance prefixes never collide either
#[test]
fn property_prefixes_partition_document_ids() {
    proptest!(|(
        first in key_component(),
        second in key_component(),
        group in key_component(),
        name in key_component(),
    )| {
        prop_assume!(first != second);
        let key = TriggerKey::new(group, name);
        prop_assert_ne!(
            status_document_id(Some(&first), &key),
            status_document_id(Some(&second), &key)
        );
    });
}
