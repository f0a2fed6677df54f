//! Container engine access.
//!
//! [`EngineApi`] is the seam between operation executors and the engine.
//! [`ContainerRuntime`] implements it against Docker or Podman; tests swap
//! in a scripted implementation.

mod cli;
mod error;
mod events;
mod progress;
mod socket;
mod types;

pub use cli::ContainerRuntime;
pub use error::{EngineError, EngineResult};
pub use events::{EngineEvent, EventAction};
pub use progress::{ProgressDetail, PullEvent, PullProgress, PullSnapshot};
pub use socket::{EngineSocket, split_reference};
pub use types::{
    Container, ContainerConfig, ContainerSpec, ContainerState, ContainerStats, ContainerUpdate,
    ImageSummary, NetworkSummary, PortMapping, parse_volume, validate_container_id_or_name,
    validate_container_name, validate_image_name,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Container runtime flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    #[default]
    Docker,
    Podman,
}

impl RuntimeType {
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Podman on SELinux hosts needs `:Z` on bind mounts.
    pub fn needs_selinux_labels(&self) -> bool {
        matches!(self, RuntimeType::Podman)
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// Primitives the control channel needs from a container engine.
///
/// Streaming calls take a [`CancellationToken`] and return
/// [`EngineError::Cancelled`] once it fires.
#[async_trait]
pub trait EngineApi: Send + Sync {
    async fn health_check(&self) -> EngineResult<String>;

    async fn list_containers(&self, all: bool) -> EngineResult<Vec<Container>>;
    async fn inspect_container(&self, id: &str) -> EngineResult<Value>;
    /// Full container id for an id, id prefix or name.
    async fn resolve_container_id(&self, reference: &str) -> EngineResult<String> {
        let detail = self.inspect_container(reference).await?;
        Ok(detail
            .get("Id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .unwrap_or(reference)
            .to_string())
    }
    /// Create without starting. Returns the new container id.
    async fn create_container(&self, config: &ContainerConfig) -> EngineResult<String>;
    async fn start_container(&self, id: &str) -> EngineResult<()>;
    async fn stop_container(&self, id: &str, timeout_seconds: Option<u32>) -> EngineResult<()>;
    async fn restart_container(&self, id: &str, timeout_seconds: Option<u32>) -> EngineResult<()>;
    async fn remove_container(&self, id: &str, force: bool) -> EngineResult<()>;
    async fn update_container(&self, id: &str, update: &ContainerUpdate) -> EngineResult<()>;

    /// Send log lines until the stream ends, the receiver goes away or
    /// `cancel` fires.
    async fn container_logs(
        &self,
        id: &str,
        tail: Option<u32>,
        follow: bool,
        lines: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> EngineResult<()>;
    /// Single stats sample.
    async fn container_stats(&self, id: &str) -> EngineResult<ContainerStats>;

    /// Pull an image, forwarding each engine progress message.
    async fn pull_image(
        &self,
        image: &str,
        events: mpsc::Sender<PullEvent>,
        cancel: CancellationToken,
    ) -> EngineResult<()>;
    async fn list_images(&self) -> EngineResult<Vec<ImageSummary>>;
    async fn inspect_image(&self, image: &str) -> EngineResult<Option<Value>>;
    async fn image_exists(&self, image: &str) -> EngineResult<bool> {
        Ok(self.inspect_image(image).await?.is_some())
    }
    async fn remove_image(&self, image: &str, force: bool) -> EngineResult<()>;
    /// Add `target` as another name for the local image `source`.
    async fn tag_image(&self, source: &str, target: &str) -> EngineResult<()>;
    /// Registry digest (`sha256:...`) of the local copy, if it was pulled.
    async fn image_digest(&self, image: &str) -> EngineResult<Option<String>>;

    async fn list_networks(&self) -> EngineResult<Vec<NetworkSummary>>;

    /// Forward container events until the stream ends or `cancel` fires.
    async fn container_events(
        &self,
        events: mpsc::Sender<EngineEvent>,
        cancel: CancellationToken,
    ) -> EngineResult<()>;
}
