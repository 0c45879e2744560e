//! Harvest pipeline.
//!
//! - `controller`: the pagination state machine (`Harvester`)
//! - `stall`: no-progress detection and the ordered recovery strategies
//! - `expansion`: reply-thread queue drained between top-level pages

pub mod controller;
pub mod expansion;
pub mod stall;

pub use controller::{HarvestState, Harvester, RunCounts, RunSummary, TerminationReason};
pub use expansion::ExpansionQueue;
pub use stall::{RecoveryStrategy, StallDetector, StallStatus};
