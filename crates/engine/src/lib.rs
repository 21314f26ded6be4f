//! Notification dispatch core: record storage, the delivery state machine,
//! backoff policy, and the background retry scheduler.

pub mod backoff;
pub mod dispatch;
pub mod scheduler;
pub mod store;
pub mod validate;

pub use backoff::RetryPolicy;
pub use dispatch::{DispatchEngine, Submission};
pub use scheduler::RetryScheduler;
pub use store::{CreateOutcome, MemoryRecordStore, PgRecordStore, RecordStore, StatusUpdate};
