//! Persisted container mirror models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Outcome of the last operation an executor ran against a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Success,
    Failed,
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Pending => write!(f, "pending"),
            OperationStatus::Success => write!(f, "success"),
            OperationStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(OperationStatus::Pending),
            "success" => Ok(OperationStatus::Success),
            "failed" => Ok(OperationStatus::Failed),
            _ => Err(format!("unknown operation status: {}", s)),
        }
    }
}

/// One row of the container mirror.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecord {
    pub id: i64,
    pub container_id: String,
    pub name: String,
    pub image: String,
    /// Normalized engine state (`running`, `stopped`, ...).
    pub status: String,
    pub operation_status: OperationStatus,
    pub last_error: Option<String>,
    pub need_update: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// A container as seen on the engine during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedContainer {
    pub container_id: String,
    pub name: String,
    pub image: String,
    pub status: String,
}

impl From<&crate::engine::Container> for ObservedContainer {
    fn from(c: &crate::engine::Container) -> Self {
        Self {
            container_id: c.id.clone(),
            name: c.name().to_string(),
            image: c.image.clone(),
            status: c.state.record_status().to_string(),
        }
    }
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub engine_containers: usize,
    pub inserted: usize,
    pub updated: usize,
    pub rebound: usize,
    pub removed: usize,
    pub duplicates_removed: u64,
}
