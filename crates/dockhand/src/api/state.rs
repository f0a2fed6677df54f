//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use crate::engine::EngineApi;
use crate::ops::Services;
use crate::settings::ProxyCell;
use crate::sync::ContainerSynchronizer;
use crate::ws::{MessageRouter, SessionRegistry};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<dyn EngineApi>,
    pub sync: Arc<ContainerSynchronizer>,
    pub sessions: Arc<SessionRegistry>,
    pub router: Arc<MessageRouter>,
    pub proxy: ProxyCell,
    /// Keepalive ping period for control sessions.
    pub ws_ping_interval: Duration,
    /// Allowed CORS origins; empty allows localhost only.
    pub cors_origins: Vec<String>,
}

impl AppState {
    pub fn new(router: MessageRouter, proxy: ProxyCell) -> Self {
        let services: Arc<Services> = router.services().clone();
        Self {
            engine: services.engine.clone(),
            sync: services.sync.clone(),
            sessions: services.sessions.clone(),
            proxy,
            ws_ping_interval: Duration::from_secs(30),
            cors_origins: Vec::new(),
            router: Arc::new(router),
        }
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ws_ping_interval = interval;
        self
    }

    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = origins;
        self
    }
}
