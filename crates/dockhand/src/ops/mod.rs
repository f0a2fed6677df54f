//! Operation executors.
//!
//! Each family module exposes a `handler_group()` with its closed tag to
//! executor mapping. Executors receive an [`OperationContext`] and report
//! through it: fire-and-report operations reply once, streaming operations
//! go through a [`ProgressEmitter`].

pub mod app;
pub mod container;
pub mod events;
pub mod image;
pub mod system;

mod progress;

pub use progress::{ProgressChannel, ProgressEmitter};

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::db::Database;
use crate::engine::{EngineApi, EngineError};
use crate::registry::RemoteDigests;
use crate::settings::{ProxyCell, ProxySetting, SettingsCell};
use crate::sync::{ContainerRecordRepository, ContainerSynchronizer, SyncError};
use crate::templates::TemplateRepository;
use crate::ws::{CancelHandle, Envelope, MessageType, SessionHandle, SessionRegistry};

/// Failure of an executor that it did not report itself.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Already user-facing.
    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl OperationError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            OperationError::Engine(e) => e.is_cancelled(),
            OperationError::Sync(SyncError::Engine(e)) => e.is_cancelled(),
            _ => false,
        }
    }

    /// Text safe to put in an outbound envelope.
    pub fn user_message(&self) -> String {
        match self {
            OperationError::InvalidPayload(_) | OperationError::Rejected(_) => self.to_string(),
            OperationError::Engine(e) | OperationError::Sync(SyncError::Engine(e)) => {
                e.user_message()
            }
            OperationError::Sync(SyncError::Storage(_)) | OperationError::Internal(_) => {
                "internal error".to_string()
            }
        }
    }
}

pub type OperationResult = Result<(), OperationError>;

/// Tunables for executors.
#[derive(Debug, Clone)]
pub struct OperationOptions {
    /// Seconds the engine waits before killing on stop/restart.
    pub stop_timeout_secs: Option<u32>,
    pub default_log_tail: u32,
    pub default_stats_interval: Duration,
    /// Log lines gathered per container at the end of an install.
    pub install_log_lines: u32,
}

impl Default for OperationOptions {
    fn default() -> Self {
        Self {
            stop_timeout_secs: None,
            default_log_tail: 100,
            default_stats_interval: Duration::from_secs(2),
            install_log_lines: 20,
        }
    }
}

/// Collaborators shared by every executor.
pub struct Services {
    pub engine: Arc<dyn EngineApi>,
    pub sync: Arc<ContainerSynchronizer>,
    pub templates: TemplateRepository,
    pub registry: Arc<dyn RemoteDigests>,
    pub sessions: Arc<SessionRegistry>,
    /// Proxy and registry mirrors, read at the moment a pull needs them.
    pub settings: ProxyCell,
    pub options: OperationOptions,
}

impl Services {
    /// Wire the mirror and template store onto one database.
    pub fn new(
        engine: Arc<dyn EngineApi>,
        database: &Database,
        registry: Arc<dyn RemoteDigests>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        let repo = ContainerRecordRepository::new(database.pool().clone());
        Self {
            sync: Arc::new(ContainerSynchronizer::new(engine.clone(), repo)),
            templates: TemplateRepository::new(database.pool().clone()),
            engine,
            registry,
            sessions,
            settings: Arc::new(SettingsCell::new(ProxySetting::default())),
            options: OperationOptions::default(),
        }
    }

    /// Share the cell the settings endpoint writes to.
    pub fn with_proxy(mut self, settings: ProxyCell) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_options(mut self, options: OperationOptions) -> Self {
        self.options = options;
        self
    }
}

/// Everything an executor knows about one invocation.
pub struct OperationContext {
    pub services: Arc<Services>,
    pub session: SessionHandle,
    pub kind: MessageType,
    pub operation_id: String,
    pub correlation_id: Option<String>,
    pub payload: Value,
    pub cancel: CancelHandle,
    progress: ProgressEmitter,
}

impl OperationContext {
    pub fn new(
        services: Arc<Services>,
        session: SessionHandle,
        kind: MessageType,
        operation_id: String,
        correlation_id: Option<String>,
        payload: Value,
        cancel: CancelHandle,
    ) -> Self {
        let progress =
            ProgressEmitter::new(session.clone(), operation_id.clone(), correlation_id.clone());
        Self {
            services,
            session,
            kind,
            operation_id,
            correlation_id,
            payload,
            cancel,
            progress,
        }
    }

    pub fn engine(&self) -> &dyn EngineApi {
        self.services.engine.as_ref()
    }

    /// Decode the payload. A missing payload decodes as `{}`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, OperationError> {
        let value = if self.payload.is_null() {
            Value::Object(Default::default())
        } else {
            self.payload.clone()
        };
        serde_json::from_value(value).map_err(|e| OperationError::InvalidPayload(e.to_string()))
    }

    /// The emitter for this operation, bound to `channel`.
    pub fn progress(&self, channel: ProgressChannel) -> ProgressEmitter {
        self.progress.bind(channel);
        self.progress.clone()
    }

    /// Emitter handle without binding a channel.
    pub fn emitter(&self) -> ProgressEmitter {
        self.progress.clone()
    }

    /// Reply on this session. `operationId` is added to object payloads.
    pub async fn reply(&self, kind: MessageType, mut payload: Value) -> bool {
        if let Value::Object(ref mut map) = payload {
            map.entry("operationId")
                .or_insert_with(|| Value::String(self.operation_id.clone()));
        }
        self.session
            .send(Envelope::new(kind, payload).with_correlation(self.correlation_id.clone()))
            .await
    }

    /// Send to every open session.
    pub fn broadcast(&self, kind: MessageType, payload: Value) -> usize {
        self.services
            .sessions
            .broadcast(Envelope::new(kind, payload))
    }

    /// Bail out with a cancellation if it was requested.
    pub fn checkpoint(&self) -> Result<(), OperationError> {
        if self.cancel.is_cancelled() {
            Err(OperationError::Engine(EngineError::Cancelled))
        } else {
            Ok(())
        }
    }

    /// Drive `fut` unless the operation is cancelled first. The engine call
    /// is dropped on cancellation.
    pub async fn until_cancelled<F: Future>(&self, fut: F) -> Result<F::Output, OperationError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(OperationError::Engine(EngineError::Cancelled)),
            out = fut => Ok(out),
        }
    }
}
