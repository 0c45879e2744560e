//! No-progress detection and the ordered recovery plan.
//!
//! A page that sinks zero new records counts as idle. Once
//! `no_progress_limit` idle pages arrive in a row the controller is
//! considered stalled and walks [`RecoveryStrategy::ORDER`].

use std::fmt;

/// Outcome of recording one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallStatus {
    /// The page produced new records; the counter is back to zero
    Progress,
    /// No new records, still below the limit
    Idle { consecutive: usize, limit: usize },
    /// No new records and the limit was reached
    Stalled { consecutive: usize },
}

/// Counts consecutive pages without new records.
#[derive(Debug, Clone)]
pub struct StallDetector {
    limit: usize,
    consecutive: usize,
}

impl StallDetector {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            consecutive: 0,
        }
    }

    /// Record how many new records the last page produced.
    pub fn record(&mut self, new_records: usize) -> StallStatus {
        if new_records > 0 {
            self.consecutive = 0;
            return StallStatus::Progress;
        }

        self.consecutive += 1;
        if self.consecutive >= self.limit {
            StallStatus::Stalled {
                consecutive: self.consecutive,
            }
        } else {
            StallStatus::Idle {
                consecutive: self.consecutive,
                limit: self.limit,
            }
        }
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> usize {
        self.consecutive
    }
}

/// Recovery strategies, tried in [`RecoveryStrategy::ORDER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Re-request the current page with every cursor field stripped
    SoftRefetch,
    /// Reload the origin view and capture a fresh pagination request
    ReloadAndRediscover,
    /// Poke the session and keep going under the old cursor
    NudgeAndContinue,
}

impl RecoveryStrategy {
    pub const ORDER: [RecoveryStrategy; 3] = [
        RecoveryStrategy::SoftRefetch,
        RecoveryStrategy::ReloadAndRediscover,
        RecoveryStrategy::NudgeAndContinue,
    ];
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryStrategy::SoftRefetch => "soft refetch",
            RecoveryStrategy::ReloadAndRediscover => "reload and rediscover",
            RecoveryStrategy::NudgeAndContinue => "nudge and continue",
        };
        f.write_str(name)
    }
}
