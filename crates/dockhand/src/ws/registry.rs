//! Open connections and their in-flight operations.
//!
//! Each session owns a bounded outbound queue drained by a single writer
//! task, so concurrent senders never interleave frames on the wire. Its
//! operation map holds one cancellation token per running operation.
//!
//! Broadcasts never wait on a queue: a session whose queue is full when a
//! broadcast arrives is evicted and its connection closed.

use dashmap::DashMap;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::types::Envelope;

/// Default per-session outbound queue depth.
pub const DEFAULT_SESSION_BUFFER: usize = 256;

/// Cooperative cancellation trigger shared by a session and one executor.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Token to hand to engine calls that take their own cancellation.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("operation '{0}' is already running on this session")]
pub struct DuplicateOperation(pub String);

#[derive(Default)]
struct SessionOps {
    closed: bool,
    active: HashMap<String, (u64, CancelHandle)>,
}

/// One open connection.
pub struct Session {
    id: String,
    outbound: mpsc::Sender<Envelope>,
    ops: Mutex<SessionOps>,
    next_lease: AtomicU64,
    evicted: CancellationToken,
}

impl Session {
    fn ops(&self) -> MutexGuard<'_, SessionOps> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable reference to a registered session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Session>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").field("id", &self.inner.id).finish()
    }
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Queue an envelope for this connection. Returns false once the
    /// connection's writer is gone.
    pub async fn send(&self, envelope: Envelope) -> bool {
        match self.inner.outbound.send(envelope).await {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    "Dropping {} for closed session {}",
                    e.0.kind, self.inner.id
                );
                false
            }
        }
    }

    /// Register an operation and get its cancel handle.
    ///
    /// On a session that is already closed the handle comes back cancelled,
    /// so the executor stops at its first check point.
    pub fn track_operation(&self, operation_id: &str) -> Result<OperationLease, DuplicateOperation> {
        let handle = CancelHandle::new();
        let lease = self.inner.next_lease.fetch_add(1, Ordering::Relaxed);
        {
            let mut ops = self.inner.ops();
            if ops.closed {
                handle.cancel();
            } else {
                if ops.active.contains_key(operation_id) {
                    return Err(DuplicateOperation(operation_id.to_string()));
                }
                ops.active
                    .insert(operation_id.to_string(), (lease, handle.clone()));
            }
        }
        Ok(OperationLease {
            session: self.inner.clone(),
            operation_id: operation_id.to_string(),
            lease,
            handle,
        })
    }

    /// Flip the cancel handle for `operation_id`. Unknown or finished
    /// operations are ignored. Returns whether a running operation matched.
    pub fn cancel(&self, operation_id: &str) -> bool {
        let ops = self.inner.ops();
        match ops.active.get(operation_id) {
            Some((_, handle)) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_operations(&self) -> usize {
        self.inner.ops().active.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.ops().closed
    }

    /// Resolves once the registry has dropped this session for falling
    /// behind. The connection should be closed then.
    pub async fn evicted(&self) {
        self.inner.evicted.cancelled().await
    }
}

/// Keeps an operation registered until dropped.
pub struct OperationLease {
    session: Arc<Session>,
    operation_id: String,
    lease: u64,
    handle: CancelHandle,
}

impl OperationLease {
    pub fn handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }
}

impl Drop for OperationLease {
    fn drop(&mut self) {
        let mut ops = self.session.ops();
        // A later operation may have reused the id after this one finished.
        if ops
            .active
            .get(&self.operation_id)
            .is_some_and(|(lease, _)| *lease == self.lease)
        {
            ops.active.remove(&self.operation_id);
        }
    }
}

/// All open sessions.
pub struct SessionRegistry {
    sessions: DashMap<String, SessionHandle>,
    buffer: usize,
}

impl SessionRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Open a session. The receiver must be drained by the connection's
    /// writer task.
    pub fn register(&self) -> (SessionHandle, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let session = SessionHandle {
            inner: Arc::new(Session {
                id: uuid::Uuid::new_v4().to_string(),
                outbound: tx,
                ops: Mutex::new(SessionOps::default()),
                next_lease: AtomicU64::new(0),
                evicted: CancellationToken::new(),
            }),
        };
        self.sessions
            .insert(session.id().to_string(), session.clone());
        info!("Registered control session {}", session.id());
        (session, rx)
    }

    /// Close a session and cancel everything it still has running.
    /// Idempotent.
    pub fn unregister(&self, session: &SessionHandle) {
        let was_open = self.sessions.remove(session.id()).is_some();
        let cancelled = {
            let mut ops = session.inner.ops();
            ops.closed = true;
            let drained: Vec<CancelHandle> =
                ops.active.drain().map(|(_, (_, handle))| handle).collect();
            drained
        };
        for handle in &cancelled {
            handle.cancel();
        }
        if !was_open {
            return;
        }
        info!(
            "Unregistered control session {} ({} operations cancelled)",
            session.id(),
            cancelled.len()
        );
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    /// Send to `session_id` if it is still open.
    pub async fn send(&self, session_id: &str, envelope: Envelope) -> bool {
        match self.get(session_id) {
            Some(session) => session.send(envelope).await,
            None => false,
        }
    }

    /// Cancel `operation_id` on `session_id`. No-op when either is unknown.
    pub fn cancel(&self, session_id: &str, operation_id: &str) -> bool {
        self.get(session_id)
            .map(|s| s.cancel(operation_id))
            .unwrap_or(false)
    }

    /// Queue `envelope` for every open session without waiting. Returns how
    /// many accepted it.
    pub fn broadcast(&self, envelope: Envelope) -> usize {
        let targets: Vec<SessionHandle> =
            self.sessions.iter().map(|s| s.value().clone()).collect();
        let mut delivered = 0;
        for session in targets {
            match session.inner.outbound.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Session {} is not reading its queue, closing it",
                        session.id()
                    );
                    self.evict(&session);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Unregister `session` and signal its connection to close.
    pub fn evict(&self, session: &SessionHandle) {
        self.unregister(session);
        session.inner.evicted.cancel();
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_BUFFER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::types::MessageType;
    use serde_json::json;

    #[test]
    fn cancel_is_idempotent_and_ignores_unknown_ids() {
        let registry = SessionRegistry::default();
        let (session, _rx) = registry.register();
        let lease = session.track_operation("op-1").unwrap();
        let handle = lease.handle();

        assert!(!session.cancel("nope"));
        assert!(session.cancel("op-1"));
        assert!(session.cancel("op-1"));
        assert!(handle.is_cancelled());

        drop(lease);
        assert!(!session.cancel("op-1"));
        assert!(!registry.cancel("missing-session", "op-1"));
    }

    #[test]
    fn duplicate_operation_ids_are_rejected_while_running() {
        let registry = SessionRegistry::default();
        let (session, _rx) = registry.register();
        let first = session.track_operation("op").unwrap();
        assert!(session.track_operation("op").is_err());
        drop(first);
        assert!(session.track_operation("op").is_ok());
    }

    #[test]
    fn stale_lease_does_not_release_newer_operation() {
        let registry = SessionRegistry::default();
        let (session, _rx) = registry.register();
        let first = session.track_operation("op").unwrap();
        session.cancel("op");
        // Simulate release racing with a re-registration under the same id.
        session.inner.ops().active.remove("op");
        let second = session.track_operation("op").unwrap();
        drop(first);
        assert_eq!(session.active_operations(), 1);
        drop(second);
        assert_eq!(session.active_operations(), 0);
    }

    #[tokio::test]
    async fn unregister_cancels_everything_and_later_ops_start_cancelled() {
        let registry = SessionRegistry::default();
        let (session, _rx) = registry.register();
        let a = session.track_operation("a").unwrap();
        let b = session.track_operation("b").unwrap();

        registry.unregister(&session);
        assert!(a.handle().is_cancelled());
        assert!(b.handle().is_cancelled());
        assert!(registry.is_empty());

        let late = session.track_operation("c").unwrap();
        assert!(late.handle().is_cancelled());
        assert_eq!(session.active_operations(), 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_open_sessions_only() {
        let registry = SessionRegistry::default();
        let (one, mut rx_one) = registry.register();
        let (_two, mut rx_two) = registry.register();
        registry.unregister(&one);

        let sent = registry.broadcast(Envelope::new(
            MessageType::ContainerStateChange,
            json!({"containerId": "abc", "status": "stopped"}),
        ));
        assert_eq!(sent, 1);
        assert!(rx_one.try_recv().is_err());
        assert_eq!(
            rx_two.recv().await.unwrap().kind,
            MessageType::ContainerStateChange
        );
    }

    #[tokio::test]
    async fn full_queue_evicts_session_without_blocking_others() {
        let registry = SessionRegistry::new(2);
        let (stalled, _stalled_rx) = registry.register();
        let (_live, mut live_rx) = registry.register();
        let op = stalled.track_operation("op").unwrap();

        let state_change = || {
            Envelope::new(
                MessageType::ContainerStateChange,
                json!({"containerId": "abc", "status": "running"}),
            )
        };
        assert_eq!(registry.broadcast(state_change()), 2);
        assert_eq!(registry.broadcast(state_change()), 2);
        // The stalled queue is full now; the live one is drained.
        live_rx.recv().await.unwrap();
        live_rx.recv().await.unwrap();

        let sent = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            async { registry.broadcast(state_change()) },
        )
        .await
        .unwrap();
        assert_eq!(sent, 1);
        assert!(registry.get(stalled.id()).is_none());
        assert!(stalled.is_closed());
        assert!(op.handle().is_cancelled());
        tokio::time::timeout(std::time::Duration::from_secs(1), stalled.evicted())
            .await
            .unwrap();
        assert_eq!(live_rx.recv().await.unwrap().kind, MessageType::ContainerStateChange);
    }

    #[tokio::test]
    async fn send_fails_once_writer_is_gone() {
        let registry = SessionRegistry::default();
        let (session, rx) = registry.register();
        drop(rx);
        assert!(!session.send(Envelope::new(MessageType::Heartbeat, json!({}))).await);
    }
}
