// Error handling framework

use crate::models::{JobKey, TriggerKey};
use thiserror::Error;

/// Schedule-related errors
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid schedule configuration: {0}")]
    InvalidConfiguration(String),
}

/// Validation errors raised while turning job configuration into jobs and triggers
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate key violation: {0}")]
    DuplicateKey(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Invalid table name: {0}")]
    InvalidTableName(String),
}

/// Errors from the trigger status backing store
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Document serialization failed: {0}")]
    Serialization(String),

    #[error("Backing store unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the cross-node execution confirmation channel
#[derive(Error, Debug)]
pub enum ConfirmationError {
    #[error("No address known for node {0}")]
    UnknownNode(String),

    #[error("Confirmation request to node {node} failed: {reason}")]
    Transport { node: String, reason: String },

    #[error("Confirmation request to node {0} timed out")]
    Timeout(String),

    #[error("Node {node} rejected the confirmation request: {reason}")]
    Remote { node: String, reason: String },
}

/// Job execution errors reported by a job runner
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Job execution failed: {0}")]
    Failed(String),

    #[error("No runner registered for job {0}")]
    NoRunner(JobKey),
}

/// Worker pool errors
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Worker pool is at capacity ({0} workers)")]
    Saturated(usize),

    #[error("Worker pool is shut down")]
    ShutDown,

    #[error("Failed to spawn worker thread: {0}")]
    SpawnFailed(String),
}

/// Scheduler state store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job already exists: {0}")]
    JobAlreadyExists(JobKey),

    #[error("Trigger already exists: {0}")]
    TriggerAlreadyExists(TriggerKey),

    #[error("Job not found: {0}")]
    JobNotFound(JobKey),

    #[error("Trigger {trigger} references job {job} which is not stored")]
    MissingJobForTrigger { trigger: TriggerKey, job: JobKey },

    #[error("Trigger {0} belongs to a different job than the trigger it replaces")]
    ReplacementJobMismatch(TriggerKey),

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("Store initialization failed: {0}")]
    Initialization(String),

    #[error("Invalid trigger: {0}")]
    InvalidTrigger(#[from] ValidationError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Internal state lock poisoned")]
    LockPoisoned,
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => {
                // Check for specific database error codes
                if let Some(code) = db_err.code() {
                    match code.as_ref() {
                        "23505" => DatabaseError::DuplicateKey(db_err.message().to_string()),
                        "42P01" => DatabaseError::TableNotFound(db_err.message().to_string()),
                        _ => DatabaseError::QueryFailed(db_err.message().to_string()),
                    }
                } else {
                    DatabaseError::QueryFailed(db_err.message().to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        PersistenceError::Database(err.into())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ValidationError {
    fn from(err: serde_json::Error) -> Self {
        ValidationError::InvalidJson(err.to_string())
    }
}

impl From<reqwest::Error> for ConfirmationError {
    fn from(err: reqwest::Error) -> Self {
        let node = err
            .url()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        if err.is_timeout() {
            ConfirmationError::Timeout(node)
        } else {
            ConfirmationError::Transport {
                node,
                reason: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_error_display() {
        let err = ScheduleError::InvalidCronExpression {
            expression: "* * * *".to_string(),
            reason: "invalid format".to_string(),
        };
        assert!(err.to_string().contains("Invalid cron expression"));
    }

    #[test]
    fn test_store_error_names_the_job() {
        let err = StoreError::JobNotFound(JobKey::new("reports", "daily"));
        assert_eq!(err.to_string(), "Job not found: reports.daily");
    }

    #[test]
    fn test_unsupported_is_explicit() {
        let err = StoreError::Unsupported("calendars");
        assert!(err.to_string().contains("calendars"));
    }

    #[test]
    fn test_validation_error_from_schedule_error() {
        let err: ValidationError = ScheduleError::InvalidTimezone("Mars/Olympus".to_string()).into();
        assert!(matches!(err, ValidationError::InvalidSchedule(_)));
    }

    #[test]
    fn test_persistence_error_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: PersistenceError = json_err.into();
        assert!(matches!(err, PersistenceError::Serialization(_)));
    }
}
