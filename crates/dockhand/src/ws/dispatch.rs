//! Per-family executor tables and the task boundary every operation runs in.

use futures::FutureExt;
use futures::future::BoxFuture;
use log::{debug, error, warn};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use super::registry::OperationLease;
use super::types::{Envelope, Family, MessageType};
use crate::ops::{OperationContext, OperationResult};

/// Where an executor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// On the connection's read task. Only for executors that never wait on
    /// the engine (cancellation, heartbeat).
    Inline,
    /// On its own task with a tracked cancel handle.
    Spawned,
}

type RunFn = dyn Fn(OperationContext) -> BoxFuture<'static, OperationResult> + Send + Sync;

#[derive(Clone)]
pub struct Executor {
    pub mode: ExecMode,
    run: Arc<RunFn>,
}

impl Executor {
    pub fn run(&self, ctx: OperationContext) -> BoxFuture<'static, OperationResult> {
        (self.run)(ctx)
    }
}

/// Closed tag to executor mapping for one family.
pub struct HandlerGroup {
    family: Family,
    executors: HashMap<MessageType, Executor>,
}

impl HandlerGroup {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            executors: HashMap::new(),
        }
    }

    pub fn register<F, Fut>(mut self, kind: MessageType, mode: ExecMode, run: F) -> Self
    where
        F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = OperationResult> + Send + 'static,
    {
        let run: Arc<RunFn> = Arc::new(move |ctx| run(ctx).boxed());
        self.executors.insert(kind, Executor { mode, run });
        self
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn get(&self, kind: MessageType) -> Option<&Executor> {
        self.executors.get(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = MessageType> + '_ {
        self.executors.keys().copied()
    }
}

/// Run one executor, converting every failure into an outbound envelope.
///
/// Nothing escapes: errors and panics become a terminal `error` event on the
/// operation's progress channel if it has one, otherwise an `ERROR` envelope.
/// A cancelled operation without a channel gets a `cancelled` reply of its
/// usual result type.
pub async fn run_guarded(
    executor: Executor,
    ctx: OperationContext,
    lease: Option<OperationLease>,
) {
    let kind = ctx.kind;
    let operation_id = ctx.operation_id.clone();
    let session = ctx.session.clone();
    let correlation_id = ctx.correlation_id.clone();
    let emitter = ctx.emitter();

    let outcome = AssertUnwindSafe(executor.run(ctx)).catch_unwind().await;

    let failure = match outcome {
        Ok(Ok(())) => {
            if emitter.channel().is_some() && !emitter.is_finished().await {
                emitter.complete(json!({})).await;
            }
            None
        }
        Ok(Err(e)) if e.is_cancelled() => {
            debug!("{} operation {} cancelled", kind, operation_id);
            if emitter.channel().is_some() {
                emitter.cancelled().await;
            } else if !emitter.is_finished().await {
                // Fire-and-report operations still owe the client one result.
                let payload = json!({
                    "operationId": operation_id,
                    "success": false,
                    "cancelled": true,
                    "message": "cancelled",
                    "requestType": kind,
                });
                session
                    .send(Envelope::new(kind.reply_type(), payload).with_correlation(correlation_id.clone()))
                    .await;
            }
            None
        }
        Ok(Err(e)) => {
            warn!("{} operation {} failed: {}", kind, operation_id, e);
            Some(e.user_message())
        }
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            error!("{} operation {} panicked: {}", kind, operation_id, detail);
            Some("internal error".to_string())
        }
    };

    if let Some(message) = failure {
        let delivered = emitter.channel().is_some()
            && emitter.fail(message.clone(), json!({})).await;
        if !delivered && !emitter.is_finished().await {
            let mut envelope = Envelope::error(message, Some(&operation_id));
            if let Some(map) = envelope.payload.as_object_mut() {
                map.insert("requestType".to_string(), json!(kind));
            }
            session.send(envelope.with_correlation(correlation_id)).await;
        }
    }

    drop(lease);
}
