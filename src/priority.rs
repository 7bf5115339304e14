//! Job priority levels and the waiting-queue score function.
//!
//! Conveyor orders the waiting index by a single numeric score: a large
//! per-priority weight plus the enqueue instant in milliseconds. The weight
//! gap dwarfs any realistic timestamp, so every high-priority job sorts ahead
//! of every medium one, and within a priority earlier enqueues win.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Job priority levels that determine execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobPriority {
    /// High priority jobs - execute before medium and low priority jobs
    High = 0,
    /// Medium priority jobs - default priority level
    #[default]
    Medium = 1,
    /// Low priority jobs - execute when no higher priority jobs are waiting
    Low = 2,
}

/// Score weight separating priority classes in the waiting index.
/// Must exceed any plausible millisecond timestamp.
const PRIORITY_WEIGHT: i64 = 10_000_000_000_000;

impl JobPriority {
    /// Get the numeric value of the priority for database storage
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Create a JobPriority from an i32 value
    pub fn from_i32(value: i32) -> Result<Self, PriorityError> {
        match value {
            0 => Ok(JobPriority::High),
            1 => Ok(JobPriority::Medium),
            2 => Ok(JobPriority::Low),
            _ => Err(PriorityError::InvalidPriorityValue(value)),
        }
    }

    /// Score weight for this priority class.
    pub fn weight(self) -> i64 {
        self.as_i32() as i64 * PRIORITY_WEIGHT
    }

    /// Get all priority levels in order from highest to lowest
    pub fn all_priorities() -> Vec<JobPriority> {
        vec![JobPriority::High, JobPriority::Medium, JobPriority::Low]
    }
}

/// Compute the waiting-index score for a job enqueued at `enqueued_at_ms`
/// (milliseconds since the epoch).
///
/// Lower scores dequeue first. Ties on identical scores are broken by the
/// sorted set's lexicographic member ordering, which is deterministic.
pub fn queue_score(priority: JobPriority, enqueued_at_ms: i64) -> f64 {
    (priority.weight() + enqueued_at_ms) as f64
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPriority::High => write!(f, "high"),
            JobPriority::Medium => write!(f, "medium"),
            JobPriority::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for JobPriority {
    type Err = PriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" | "h" => Ok(JobPriority::High),
            "medium" | "m" | "default" => Ok(JobPriority::Medium),
            "low" | "l" => Ok(JobPriority::Low),
            _ => Err(PriorityError::InvalidPriorityString(s.to_string())),
        }
    }
}

/// Errors related to priority handling
#[derive(Error, Debug)]
pub enum PriorityError {
    #[error("Invalid priority value: {0}. Must be between 0 and 2")]
    InvalidPriorityValue(i32),

    #[error("Invalid priority string: '{0}'. Must be one of: high, medium, low")]
    InvalidPriorityString(String),
}
