use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

// Helper functions for Tz serialization
fn serialize_tz<S>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&tz.to_string())
}

fn deserialize_tz<'de, D>(deserializer: D) -> Result<Tz, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Tz::from_str(&s).map_err(serde::de::Error::custom)
}

/// Group used when a key is created without one
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Version sentinel meaning "unversioned, always apply"
pub const UNVERSIONED: i64 = -1;

/// Priority assigned to triggers that do not declare one
pub const DEFAULT_PRIORITY: i32 = 5;

// ============================================================================
// Keys
// ============================================================================

/// Composite identity of a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    #[serde(default = "default_group")]
    pub group: String,
    pub name: String,
}

impl JobKey {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }

    pub fn in_default_group(name: impl Into<String>) -> Self {
        Self::new(DEFAULT_GROUP, name)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Composite identity of a trigger
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
    #[serde(default = "default_group")]
    pub group: String,
    pub name: String,
}

impl TriggerKey {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }

    pub fn in_default_group(name: impl Into<String>) -> Self {
        Self::new(DEFAULT_GROUP, name)
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

// ============================================================================
// Job Models
// ============================================================================

/// JobDetail is the rendered, schedulable form of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    pub key: JobKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Opaque payload handed to the job runner
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub concurrent_execution_disallowed: bool,
    #[serde(default)]
    pub persist_data_after_execution: bool,
}

impl JobDetail {
    pub fn new(key: JobKey) -> Self {
        Self {
            key,
            description: None,
            data: serde_json::Value::Null,
            concurrent_execution_disallowed: false,
            persist_data_after_execution: false,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn disallow_concurrent_execution(mut self) -> Self {
        self.concurrent_execution_disallowed = true;
        self
    }

    pub fn persist_data_after_execution(mut self) -> Self {
        self.persist_data_after_execution = true;
        self
    }
}

/// JobConfig is a versioned job definition as delivered by a job configuration source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub key: JobKey,
    #[serde(default = "unversioned")]
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub concurrent_execution_disallowed: bool,
    #[serde(default)]
    pub persist_data_after_execution: bool,
    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,
}

fn unversioned() -> i64 {
    UNVERSIONED
}

impl JobConfig {
    /// True when this config should replace `existing`: a strictly higher
    /// version, or either side unversioned.
    pub fn supersedes(&self, existing: &JobConfig) -> bool {
        self.version == UNVERSIONED
            || existing.version == UNVERSIONED
            || existing.version < self.version
    }
}

// ============================================================================
// Trigger Models
// ============================================================================

/// Schedule defines when a trigger fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    Cron {
        expression: String,
        #[serde(serialize_with = "serialize_tz", deserialize_with = "deserialize_tz")]
        timezone: Tz,
    },
    Interval {
        interval_seconds: u64,
        /// Number of repeats after the first fire; `None` repeats forever
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repeat_count: Option<u32>,
    },
    OneTime {
        execute_at: DateTime<Utc>,
    },
}

/// What to do with a trigger whose fire time passed by more than the misfire threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// Fire once, immediately
    #[default]
    FireNow,
    /// Drop the missed fires and wait for the next scheduled one
    SkipToNext,
    /// Never treat the trigger as misfired
    Ignore,
}

/// TriggerDefinition is the configuration form of a trigger, nested in a JobConfig
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub key: TriggerKey,
    pub schedule: Schedule,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub misfire_policy: MisfirePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

/// Trigger is the value the scheduling engine works with: a schedule bound to
/// one job plus the fire-time bookkeeping the store maintains for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub key: TriggerKey,
    pub job_key: JobKey,
    pub schedule: Schedule,
    pub priority: i32,
    pub misfire_policy: MisfirePolicy,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub times_triggered: u32,
    /// Identifier stamped on each acquisition
    pub fire_instance_id: Option<String>,
}

impl Trigger {
    pub fn new(key: TriggerKey, job_key: JobKey, schedule: Schedule) -> Self {
        Self {
            key,
            job_key,
            schedule,
            priority: DEFAULT_PRIORITY,
            misfire_policy: MisfirePolicy::default(),
            start_time: None,
            end_time: None,
            description: None,
            next_fire_time: None,
            previous_fire_time: None,
            times_triggered: 0,
            fire_instance_id: None,
        }
    }

    pub fn from_definition(job_key: JobKey, definition: &TriggerDefinition) -> Self {
        Self {
            key: definition.key.clone(),
            job_key,
            schedule: definition.schedule.clone(),
            priority: definition.priority,
            misfire_policy: definition.misfire_policy,
            start_time: definition.start_time,
            end_time: definition.end_time,
            description: definition.description.clone(),
            next_fire_time: None,
            previous_fire_time: None,
            times_triggered: 0,
            fire_instance_id: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_misfire_policy(mut self, policy: MisfirePolicy) -> Self {
        self.misfire_policy = policy;
        self
    }

    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    /// Compares the configured parts of two triggers, ignoring runtime bookkeeping
    pub fn same_definition(&self, other: &Trigger) -> bool {
        self.key == other.key
            && self.job_key == other.job_key
            && self.schedule == other.schedule
            && self.priority == other.priority
            && self.misfire_policy == other.misfire_policy
            && self.start_time == other.start_time
            && self.end_time == other.end_time
            && self.description == other.description
    }
}

// ============================================================================
// Execution Models
// ============================================================================

/// Instruction the engine reports back after a fired job finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletedExecutionInstruction {
    /// Requeue the trigger for its next fire time
    #[default]
    Noop,
    SetTriggerComplete,
    SetTriggerError,
    SetAllJobTriggersComplete,
    SetAllJobTriggersError,
    DeleteTrigger,
}

/// Everything a caller needs to run a fired trigger's work
#[derive(Debug, Clone)]
pub struct TriggerFiredBundle {
    pub job: JobDetail,
    /// Snapshot of the trigger after it was marked executing
    pub trigger: Trigger,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
}
