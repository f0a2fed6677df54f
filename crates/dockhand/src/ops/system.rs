//! Heartbeat, test notifications, inbound errors and cancellation.

use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;

use super::{OperationContext, OperationResult};
use crate::ws::{ExecMode, Family, HandlerGroup, MessageType};

pub fn handler_group() -> HandlerGroup {
    HandlerGroup::new(Family::System)
        .register(MessageType::Heartbeat, ExecMode::Inline, heartbeat)
        .register(MessageType::TestNotify, ExecMode::Inline, test_notify)
        .register(MessageType::Error, ExecMode::Inline, client_error)
        .register(MessageType::CancelOperation, ExecMode::Inline, cancel_operation)
}

async fn heartbeat(ctx: OperationContext) -> OperationResult {
    ctx.reply(
        MessageType::Heartbeat,
        json!({ "timestamp": chrono::Utc::now().timestamp_millis() }),
    )
    .await;
    Ok(())
}

async fn test_notify(ctx: OperationContext) -> OperationResult {
    info!("Test notification on session {}", ctx.session.id());
    ctx.reply(MessageType::TestNotifyResponse, ctx.payload.clone())
        .await;
    Ok(())
}

async fn client_error(ctx: OperationContext) -> OperationResult {
    warn!(
        "Client reported error on session {}: {}",
        ctx.session.id(),
        ctx.payload
    );
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest {
    operation_id: String,
}

/// Shared by `CANCEL_OPERATION`, `CANCEL_PULL` and `IMAGE_CANCEL_PULL`.
/// Silent: the cancelled operation reports its own terminal event.
pub(crate) async fn cancel_operation(ctx: OperationContext) -> OperationResult {
    let request: CancelRequest = ctx.parse()?;
    let found = ctx.session.cancel(&request.operation_id);
    debug!(
        "Cancel {} on session {} (running: {})",
        request.operation_id,
        ctx.session.id(),
        found
    );
    Ok(())
}
