// Scheduler state store: trigger state machine, active trigger index and the
// clustered job store built on top of them

pub mod active;
pub mod dirty;
mod inner;
pub mod job_store;
pub mod matcher;
pub mod reconcile;
pub mod state;

pub use active::ActiveTriggerIndex;
pub use dirty::DirtyTriggers;
pub use job_store::{ClusteredJobStore, StoreOptions};
pub use matcher::GroupMatcher;
pub use reconcile::ReconcileSummary;
pub use state::{TriggerRecord, TriggerState, TriggerStatus};
