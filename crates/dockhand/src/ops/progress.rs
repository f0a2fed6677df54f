use log::debug;
use serde_json::{Map, Value, json};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;

use crate::ws::{Envelope, MessageType, Phase, SessionHandle};

/// Which envelope tags a streaming operation reports under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressChannel {
    /// `PULL_START`, `PULL_PROGRESS`, then `PULL_COMPLETE` for any terminal.
    Pull,
    /// `INSTALL_PROGRESS` until `INSTALL_START_RESULT`.
    Install,
    Logs,
    Stats,
}

impl ProgressChannel {
    pub fn tag(&self, phase: Phase) -> MessageType {
        match (self, phase) {
            (ProgressChannel::Pull, Phase::Start) => MessageType::PullStart,
            (ProgressChannel::Pull, Phase::Progress) => MessageType::PullProgress,
            (ProgressChannel::Pull, _) => MessageType::PullComplete,
            (ProgressChannel::Install, Phase::Start | Phase::Progress) => {
                MessageType::InstallProgress
            }
            (ProgressChannel::Install, _) => MessageType::InstallStartResult,
            (ProgressChannel::Logs, _) => MessageType::ContainerLogs,
            (ProgressChannel::Stats, _) => MessageType::ContainerStats,
        }
    }
}

#[derive(Default)]
struct EmitState {
    started: bool,
    terminal: Option<Phase>,
}

struct EmitterInner {
    session: SessionHandle,
    operation_id: String,
    correlation_id: Option<String>,
    channel: Mutex<Option<ProgressChannel>>,
    // Held across the send so one operation's events reach the queue in order.
    state: AsyncMutex<EmitState>,
}

/// Ordered progress reporting for one operation.
///
/// Enforces `start, progress*, terminal`: the first event is preceded by an
/// implicit `start` if the executor did not send one, and anything after a
/// terminal event is dropped.
#[derive(Clone)]
pub struct ProgressEmitter {
    inner: Arc<EmitterInner>,
}

impl ProgressEmitter {
    pub(crate) fn new(
        session: SessionHandle,
        operation_id: String,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                session,
                operation_id,
                correlation_id,
                channel: Mutex::new(None),
                state: AsyncMutex::new(EmitState::default()),
            }),
        }
    }

    /// First binding wins.
    pub(crate) fn bind(&self, channel: ProgressChannel) {
        let mut slot = self
            .inner
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        slot.get_or_insert(channel);
    }

    pub fn channel(&self) -> Option<ProgressChannel> {
        *self
            .inner
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn operation_id(&self) -> &str {
        &self.inner.operation_id
    }

    pub async fn is_finished(&self) -> bool {
        self.inner.state.lock().await.terminal.is_some()
    }

    pub async fn start(&self, detail: Value) -> bool {
        self.emit(Phase::Start, detail, None).await
    }

    pub async fn progress(&self, detail: Value) -> bool {
        self.emit(Phase::Progress, detail, None).await
    }

    pub async fn complete(&self, detail: Value) -> bool {
        self.emit(Phase::Complete, detail, None).await
    }

    pub async fn fail(&self, message: impl Into<String>, detail: Value) -> bool {
        self.emit(Phase::Error, detail, Some(message.into())).await
    }

    pub async fn cancelled(&self) -> bool {
        self.emit(Phase::Cancelled, json!({}), Some("operation cancelled".to_string()))
            .await
    }

    /// Install log line, sent as `INSTALL_LOG`.
    pub async fn log(&self, level: &str, message: impl Into<String>) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.terminal.is_some() {
            return false;
        }
        if !state.started && !self.send(&mut state, Phase::Start, json!({}), None).await {
            return false;
        }
        let envelope = Envelope::new(
            MessageType::InstallLog,
            json!({
                "operationId": self.inner.operation_id,
                "level": level,
                "message": message.into(),
            }),
        )
        .with_correlation(self.inner.correlation_id.clone());
        self.inner.session.send(envelope).await
    }

    async fn emit(&self, phase: Phase, detail: Value, message: Option<String>) -> bool {
        let mut state = self.inner.state.lock().await;
        if let Some(terminal) = state.terminal {
            debug!(
                "Dropping {:?} event for operation {} after {:?}",
                phase, self.inner.operation_id, terminal
            );
            return false;
        }
        if phase == Phase::Start && state.started {
            return false;
        }
        if phase != Phase::Start && !state.started {
            self.send(&mut state, Phase::Start, json!({}), None).await;
        }
        self.send(&mut state, phase, detail, message).await
    }

    async fn send(
        &self,
        state: &mut EmitState,
        phase: Phase,
        detail: Value,
        message: Option<String>,
    ) -> bool {
        let Some(channel) = self.channel() else {
            debug!(
                "Operation {} has no progress channel, dropping {:?}",
                self.inner.operation_id, phase
            );
            return false;
        };

        let mut payload = Map::new();
        payload.insert(
            "operationId".to_string(),
            Value::String(self.inner.operation_id.clone()),
        );
        payload.insert("phase".to_string(), json!(phase));
        payload.insert("detail".to_string(), detail);
        if let Some(message) = message {
            payload.insert("message".to_string(), Value::String(message));
        }
        if phase.is_terminal() {
            payload.insert("success".to_string(), json!(phase == Phase::Complete));
        }

        match phase {
            Phase::Start => state.started = true,
            p if p.is_terminal() => state.terminal = Some(p),
            _ => {}
        }

        let envelope = Envelope::new(channel.tag(phase), Value::Object(payload))
            .with_correlation(self.inner.correlation_id.clone());
        self.inner.session.send(envelope).await
    }
}
