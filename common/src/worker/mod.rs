// Worker threads running fired triggers

pub mod pool;

pub use pool::{ElasticWorkerPool, PoolOptions, RejectedWork, Work};
