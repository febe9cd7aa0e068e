//! Drain status shared with presentation layers
//!
//! A serializable snapshot of what the drain loop is doing, shared behind a
//! tokio `RwLock` the same way for the CLI and the HTTP surface.

use crate::drain::DrainSummary;
use crate::job::JobId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Current drain state and totals since startup
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub draining: bool,
    pub current_job: Option<JobId>,
    /// Latest normalized progress line of the current job
    pub current_progress: Option<String>,
    pub progress_fraction: f32,
    pub rendered_total: u64,
    pub failed_total: u64,
    pub last_summary: Option<DrainSummary>,
}

/// Shared status state for concurrent access across components
pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

/// Creates a new SharedStatus instance with default values
pub fn new_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(StatusSnapshot::default()))
}
