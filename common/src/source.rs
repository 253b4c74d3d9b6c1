// Job configuration sources and the factory rendering configs into jobs and triggers

use crate::db::DbPool;
use crate::errors::{DatabaseError, ValidationError};
use crate::models::{JobConfig, JobDetail, JobKey, Trigger, TriggerDefinition};
use crate::persistence::postgres::validate_table_name;
use crate::schedule::validate_schedule;
use async_trait::async_trait;
use sqlx::Row;
use std::sync::RwLock;
use tracing::{instrument, warn};

/// Authoritative, pull-based list of versioned job definitions
#[async_trait]
pub trait JobConfigSource: Send + Sync {
    async fn load_all(&self) -> Result<Vec<JobConfig>, DatabaseError>;
}

/// Renders job configuration into schedulable values
#[cfg_attr(test, mockall::automock)]
pub trait JobFactory: Send + Sync {
    fn create_job_detail(&self, config: &JobConfig) -> Result<JobDetail, ValidationError>;

    fn create_trigger(
        &self,
        job_key: &JobKey,
        definition: &TriggerDefinition,
    ) -> Result<Trigger, ValidationError>;
}

/// Factory that validates keys and schedules and copies everything else through
#[derive(Debug, Default, Clone)]
pub struct DefaultJobFactory;

impl JobFactory for DefaultJobFactory {
    fn create_job_detail(&self, config: &JobConfig) -> Result<JobDetail, ValidationError> {
        if config.key.name.is_empty() {
            return Err(ValidationError::MissingField("key.name".to_string()));
        }
        Ok(JobDetail {
            key: config.key.clone(),
            description: config.description.clone(),
            data: config.data.clone(),
            concurrent_execution_disallowed: config.concurrent_execution_disallowed,
            persist_data_after_execution: config.persist_data_after_execution,
        })
    }

    fn create_trigger(
        &self,
        job_key: &JobKey,
        definition: &TriggerDefinition,
    ) -> Result<Trigger, ValidationError> {
        if definition.key.name.is_empty() {
            return Err(ValidationError::MissingField("trigger key.name".to_string()));
        }
        validate_schedule(&definition.schedule)?;
        if let (Some(start), Some(end)) = (definition.start_time, definition.end_time) {
            if end < start {
                return Err(ValidationError::InvalidFieldValue {
                    field: "end_time".to_string(),
                    reason: "end_time is before start_time".to_string(),
                });
            }
        }
        Ok(Trigger::from_definition(job_key.clone(), definition))
    }
}

/// Job configuration held in memory; replace the list to simulate config changes
#[derive(Default)]
pub struct InMemoryJobConfigSource {
    configs: RwLock<Vec<JobConfig>>,
}

impl InMemoryJobConfigSource {
    pub fn new(configs: Vec<JobConfig>) -> Self {
        Self {
            configs: RwLock::new(configs),
        }
    }

    pub fn replace(&self, configs: Vec<JobConfig>) {
        match self.configs.write() {
            Ok(mut guard) => *guard = configs,
            Err(poisoned) => *poisoned.into_inner() = configs,
        }
    }
}

#[async_trait]
impl JobConfigSource for InMemoryJobConfigSource {
    async fn load_all(&self) -> Result<Vec<JobConfig>, DatabaseError> {
        self.configs
            .read()
            .map(|configs| configs.clone())
            .map_err(|_| DatabaseError::QueryFailed("job config lock poisoned".to_string()))
    }
}

/// Job configuration rows in PostgreSQL: `(job_group, job_name, version, definition JSONB)`
pub struct PgJobConfigSource {
    pool: DbPool,
    table: String,
}

impl PgJobConfigSource {
    pub fn new(pool: DbPool, table: impl Into<String>) -> Result<Self, DatabaseError> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self { pool, table })
    }
}

#[async_trait]
impl JobConfigSource for PgJobConfigSource {
    #[instrument(skip(self), fields(table = %self.table))]
    async fn load_all(&self) -> Result<Vec<JobConfig>, DatabaseError> {
        let statement = format!(
            "SELECT job_group, job_name, version, definition FROM {} ORDER BY job_group, job_name",
            self.table
        );
        let rows = match sqlx::query(&statement).fetch_all(self.pool.pool()).await {
            Ok(rows) => rows,
            Err(e) => match DatabaseError::from(e) {
                DatabaseError::TableNotFound(_) => return Ok(Vec::new()),
                other => return Err(other),
            },
        };

        let mut configs = Vec::with_capacity(rows.len());
        for row in rows {
            let group: String = row.try_get("job_group")?;
            let name: String = row.try_get("job_name")?;
            let version: i64 = row.try_get("version")?;
            let definition: serde_json::Value = row.try_get("definition")?;

            // The row columns are authoritative for identity and version
            match serde_json::from_value::<JobConfig>(with_identity(definition, &group, &name)) {
                Ok(mut config) => {
                    config.key = JobKey::new(group, name);
                    config.version = version;
                    configs.push(config);
                }
                Err(e) => {
                    warn!(job_group = %group, job_name = %name, error = %e, "Skipping unreadable job definition");
                }
            }
        }

        Ok(configs)
    }
}

fn with_identity(mut definition: serde_json::Value, group: &str, name: &str) -> serde_json::Value {
    if let Some(object) = definition.as_object_mut() {
        object
            .entry("key")
            .or_insert_with(|| serde_json::json!({"group": group, "name": name}));
    }
    definition
}
