//! Start/stop/health contract for long-lived components.
//!
//! Implemented by [crate::Engine] (startup cache clear, teardown) and by
//! [crate::schema::DiscoveryService] (periodic discovery sweep). Stateless
//! pieces such as the assembler or the safety analyzer do not implement it.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// The worse of two statuses.
    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        use HealthStatus::*;
        match (self, other) {
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Degraded, _) | (_, Degraded) => Degraded,
            _ => Healthy,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ServiceHealth {
    fn with(status: HealthStatus, message: Option<String>) -> Self {
        Self { status, message }
    }

    pub fn healthy() -> Self {
        Self::with(HealthStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with(HealthStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with(HealthStatus::Unhealthy, Some(message.into()))
    }

    /// Fold another component's report into this one.
    pub fn merge(self, other: ServiceHealth) -> Self {
        let status = self.status.worst(other.status);
        let message = match (self.message, other.message) {
            (Some(a), Some(b)) => Some(format!("{a}; {b}")),
            (a, b) => a.or(b),
        };
        Self::with(status, message)
    }
}

/// A component with a start/stop lifecycle.
///
/// Log lifecycle transitions with [tracing] at `info`, tagged with the
/// service name (`info!(service = %self.name(), "Started")`).
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Idempotent.
    async fn start(&self) -> Result<()>;

    /// Idempotent.
    async fn stop(&self) -> Result<()>;

    async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    async fn health(&self) -> Result<ServiceHealth> {
        Ok(ServiceHealth::healthy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_status() {
        use HealthStatus::*;
        assert_eq!(Healthy.worst(Healthy), Healthy);
        assert_eq!(Healthy.worst(Degraded), Degraded);
        assert_eq!(Unhealthy.worst(Degraded), Unhealthy);
    }

    #[test]
    fn test_health_serializes_lowercase() {
        let json = serde_json::to_value(ServiceHealth::degraded("slow")).unwrap();
        assert_eq!(json, serde_json::json!({"status": "degraded", "message": "slow"}));
        let json = serde_json::to_value(ServiceHealth::healthy()).unwrap();
        assert_eq!(json, serde_json::json!({"status": "healthy"}));
    }

    #[test]
    fn test_merge_keeps_worst_and_both_messages() {
        let merged = ServiceHealth::degraded("one schema failed").merge(ServiceHealth::unhealthy("sweep stopped"));
        assert_eq!(merged.status, HealthStatus::Unhealthy);
        assert_eq!(merged.message.as_deref(), Some("one schema failed; sweep stopped"));
        assert_eq!(ServiceHealth::healthy().merge(ServiceHealth::healthy()).message, None);
    }
}
