//! Distribution sync core: per-account state machine and pass scheduler.
//!
//! `Idle -> Querying -> Processing -> Sleeping{Long|Quota} -> Idle`, looped
//! per account and bounded by an iteration ceiling per pass. All state that
//! outlives a pass (watermarks, quota windows, documents) is reached through
//! injected repository handles; nothing here is global.

mod engine;
mod fault;
mod scheduler;
mod state;

pub use engine::{AccountPass, EngineSettings, FamilyReport, KeyFetch, SyncEngine};
pub use fault::{AccountFault, EntryFault};
pub use scheduler::{AccountSchedule, PassSummary, Scheduler};
pub use state::{after_response, decide_after_batch, ProcessedBatch, SleepReason, SyncState};
