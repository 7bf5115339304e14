//! Health checks for the two backing stores.
//!
//! [`check`] probes the durable and coordination stores and reports per-store
//! latency. The report maps directly onto the health endpoint an embedding
//! service exposes: healthy ⇒ 200, unhealthy ⇒ 503.

use crate::{coordination::CoordinationStore, store::DurableStore};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Outcome of probing a single store.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate health of the queue engine's dependencies.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub db: CheckResult,
    pub coordination: CheckResult,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Probe both stores and aggregate the result.
pub async fn check<D, C>(durable: &D, coordination: &C) -> HealthReport
where
    D: DurableStore,
    C: CoordinationStore,
{
    let db = match durable.ping().await {
        Ok(latency) => CheckResult {
            status: HealthStatus::Healthy,
            latency_ms: Some(latency.as_millis() as u64),
            error: None,
        },
        Err(e) => CheckResult {
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            error: Some(e.to_string()),
        },
    };
    let coordination = match coordination.ping().await {
        Ok(latency) => CheckResult {
            status: HealthStatus::Healthy,
            latency_ms: Some(latency.as_millis() as u64),
            error: None,
        },
        Err(e) => CheckResult {
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            error: Some(e.to_string()),
        },
    };

    let status = if db.status == HealthStatus::Healthy
        && coordination.status == HealthStatus::Healthy
    {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unhealthy
    };

    HealthReport {
        status,
        db,
        coordination,
    }
}
