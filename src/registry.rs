//! Handler registration and dispatch.
//!
//! Workers resolve a job's `job_type` against a [`HandlerRegistry`] populated
//! before the worker starts. Handlers receive the full job and return a
//! [`JobResult`]; they must be safely re-runnable, because delivery is
//! at-least-once.

use crate::{job::Job, Result};
use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

/// Result returned by job handlers, optionally carrying result data that is
/// stored on the job row.
#[derive(Debug, Clone, Default)]
pub struct JobResult {
    /// Optional result data persisted for retrieval.
    pub data: Option<serde_json::Value>,
}

impl JobResult {
    /// A successful result with no data.
    pub fn success() -> Self {
        Self { data: None }
    }

    /// A successful result carrying data.
    pub fn with_data(data: serde_json::Value) -> Self {
        Self { data: Some(data) }
    }
}

/// Boxed asynchronous job handler.
///
/// # Examples
///
/// ```rust
/// use conveyor::registry::{HandlerRegistry, JobResult};
/// use serde_json::json;
///
/// let mut registry = HandlerRegistry::new();
/// registry.register("echo", |job| async move {
///     Ok(JobResult::with_data(json!({"echo": job.payload})))
/// });
/// assert!(registry.resolve("echo").is_some());
/// assert!(registry.resolve("unknown").is_none());
/// ```
pub type JobHandler = Arc<
    dyn Fn(Job) -> Pin<Box<dyn Future<Output = Result<JobResult>> + Send>> + Send + Sync,
>;

/// Mapping from job type to handler function.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, JobHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a job type. A later registration for the same
    /// type replaces the earlier one.
    pub fn register<F, Fut>(&mut self, job_type: impl Into<String>, handler: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JobResult>> + Send + 'static,
    {
        self.handlers
            .insert(job_type.into(), Arc::new(move |job| Box::pin(handler(job))));
    }

    /// Look up the handler for a job type.
    pub fn resolve(&self, job_type: &str) -> Option<JobHandler> {
        self.handlers.get(job_type).cloned()
    }

    /// Registered job types, for startup logging.
    pub fn job_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
