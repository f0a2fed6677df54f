//! Reconciliation of the engine's live containers with the persisted mirror.

mod models;
mod repository;

pub use models::{ContainerRecord, ObservedContainer, OperationStatus, SyncReport};
pub use repository::ContainerRecordRepository;

use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db;
use crate::engine::{EngineApi, EngineError};

#[derive(Debug, Error)]
pub enum SyncError {
    /// The engine could not be listed; nothing was written.
    #[error("engine unavailable during sync: {0}")]
    Engine(#[from] EngineError),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Keeps `container_records` in line with the engine.
pub struct ContainerSynchronizer {
    engine: Arc<dyn EngineApi>,
    repo: ContainerRecordRepository,
    // Serializes full passes; row-level writes from executors do not take it.
    pass: Mutex<()>,
}

impl ContainerSynchronizer {
    pub fn new(engine: Arc<dyn EngineApi>, repo: ContainerRecordRepository) -> Self {
        Self {
            engine,
            repo,
            pass: Mutex::new(()),
        }
    }

    pub fn repository(&self) -> &ContainerRecordRepository {
        &self.repo
    }

    /// One reconciliation pass.
    ///
    /// The engine is listed before anything is written, so an unreachable
    /// engine leaves the mirror exactly as the last successful pass left it.
    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        let _pass = self.pass.lock().await;
        let started = db::now();

        let containers = self.engine.list_containers(true).await?;
        let observed: Vec<ObservedContainer> =
            containers.iter().map(ObservedContainer::from).collect();
        let live_ids: HashSet<&str> = observed.iter().map(|c| c.container_id.as_str()).collect();

        let mut report = SyncReport {
            engine_containers: observed.len(),
            duplicates_removed: self.repo.cleanup_duplicates().await?,
            ..Default::default()
        };

        for container in &observed {
            if self.repo.update_observed(container).await? > 0 {
                report.updated += 1;
                continue;
            }

            // Same name, unknown id: the container was recreated outside of us.
            if !container.name.is_empty()
                && let Some(existing) = self.repo.find_by_name(&container.name).await?
                && !live_ids.contains(existing.container_id.as_str())
                && self.repo.rebind(existing.id, container).await?
            {
                debug!(
                    "rebound record {} from {} to {}",
                    existing.id, existing.container_id, container.container_id
                );
                report.rebound += 1;
                continue;
            }

            if self
                .repo
                .insert_if_absent(container, OperationStatus::Success)
                .await?
            {
                report.inserted += 1;
            }
        }

        // Rows written since the pass began (a container created meanwhile)
        // were not in the listing; the next pass judges them.
        for record in self.repo.list_all().await? {
            if !live_ids.contains(record.container_id.as_str())
                && record.updated_at < started
                && self
                    .repo
                    .delete_if_unchanged(record.id, &record.updated_at)
                    .await?
            {
                report.removed += 1;
            }
        }

        if report.inserted + report.rebound + report.removed > 0 || report.duplicates_removed > 0 {
            info!(
                "Container sync: {} on engine, {} inserted, {} updated, {} rebound, {} removed, {} duplicates",
                report.engine_containers,
                report.inserted,
                report.updated,
                report.rebound,
                report.removed,
                report.duplicates_removed
            );
        } else {
            debug!("Container sync: {} containers unchanged", report.updated);
        }

        Ok(report)
    }

    /// Synchronize, then return the mirror.
    pub async fn get_container_list(&self) -> Result<Vec<ContainerRecord>, SyncError> {
        self.sync().await?;
        Ok(self.repo.list_all().await?)
    }

    pub async fn cleanup_duplicate_records(&self) -> Result<u64, SyncError> {
        let removed = self.repo.cleanup_duplicates().await?;
        if removed > 0 {
            info!("Removed {} duplicate container record(s)", removed);
        }
        Ok(removed)
    }

    /// Record the status a successful operation left the container in.
    ///
    /// `container_id` must be the engine's full id. A container with no
    /// record yet is picked up by a full pass rather than a partial row.
    pub async fn update_container_status(
        &self,
        container_id: &str,
        status: &str,
    ) -> Result<(), SyncError> {
        if self.repo.update_status(container_id, status).await? == 0 {
            debug!("no record for {}, running a full sync", container_id);
            self.sync().await?;
        }
        Ok(())
    }

    /// Mirror a container this process just created.
    pub async fn record_container(&self, observed: &ObservedContainer) -> Result<(), SyncError> {
        if self.repo.update_observed(observed).await? == 0 {
            self.repo
                .insert_if_absent(observed, OperationStatus::Success)
                .await?;
        }
        Ok(())
    }

    pub async fn update_container_error(
        &self,
        container_id: &str,
        message: &str,
    ) -> Result<(), SyncError> {
        if self.repo.update_error(container_id, message).await? == 0 {
            debug!("no record for {} to attach error to", container_id);
        }
        Ok(())
    }

    pub async fn remove_container_record(&self, container_id: &str) -> Result<(), SyncError> {
        self.repo.delete_by_container_id(container_id).await?;
        Ok(())
    }

    /// Run `sync` every `interval` until `shutdown` fires.
    pub fn spawn_periodic(
        self: Arc<Self>,
        initial_delay: Duration,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(initial_delay) => {}
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sync().await {
                            warn!("Periodic container sync failed: {}", e);
                        }
                    }
                }
            }
            debug!("periodic container sync stopped");
        })
    }
}
