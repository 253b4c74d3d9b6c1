// Scheduler module: the engine loop driving the clustered job store

pub mod engine;

pub use engine::{JobExecutionResult, JobRunner, Scheduler, SchedulerConfig, SchedulerEngine};
