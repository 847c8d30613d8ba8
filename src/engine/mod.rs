pub mod executor;
pub mod mirror;

pub use executor::{BackupExecutor, BackupResult, ExecutionOutcome, SkipReason};
