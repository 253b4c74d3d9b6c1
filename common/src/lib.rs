// Common library for the clustered job scheduler

pub mod cluster;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod persistence;
pub mod schedule;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod telemetry;
pub mod worker;
