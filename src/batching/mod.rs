//! Batching of single-entity product lookups.

pub mod batcher;
pub mod window;

pub use batcher::{plan_batch, BatchExecutor, BatchPlan, RequestBatcher, UpstreamBatchExecutor};
pub use window::{BatchMember, BatchWindow, WindowState};
