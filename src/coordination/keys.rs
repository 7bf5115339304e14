//! Key layout for the coordination store.
//!
//! All keys share the `conveyor:` prefix. Queue-scoped keys embed the queue
//! name; the poison counter is scoped to a single job id.

use crate::job::JobId;

/// Prefix shared by every coordination key.
pub const KEY_PREFIX: &str = "conveyor";

/// Sorted set of waiting job ids, scored by priority weight + enqueue ms.
pub fn waiting(queue: &str) -> String {
    format!("{KEY_PREFIX}:waiting:{queue}")
}

/// Set of job ids currently claimed by a worker.
pub fn processing(queue: &str) -> String {
    format!("{KEY_PREFIX}:processing:{queue}")
}

/// Sorted set of delayed job ids, scored by promotion instant in ms.
pub fn delayed(queue: &str) -> String {
    format!("{KEY_PREFIX}:delayed:{queue}")
}

/// FIFO list of dead-lettered job ids.
pub fn dlq(queue: &str) -> String {
    format!("{KEY_PREFIX}:dlq:{queue}")
}

/// Sorted set of recent failure instants for one job, auto-expiring.
pub fn poison(job_id: JobId) -> String {
    format!("{KEY_PREFIX}:poison:{job_id}")
}
