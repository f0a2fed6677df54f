//! Container family: queries, lifecycle mutations, logs and stats.

use log::{info, warn};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{OperationContext, OperationError, OperationResult, ProgressChannel};
use crate::engine::{ContainerSpec, ContainerUpdate, EngineError, validate_container_id_or_name};
use crate::sync::ObservedContainer;
use crate::ws::{ExecMode, Family, HandlerGroup, MessageType};

pub fn handler_group() -> HandlerGroup {
    HandlerGroup::new(Family::Container)
        .register(MessageType::ContainerList, ExecMode::Spawned, list)
        .register(MessageType::ContainerDetail, ExecMode::Spawned, detail)
        .register(MessageType::ContainerStart, ExecMode::Spawned, |ctx| {
            lifecycle(ctx, Lifecycle::Start)
        })
        .register(MessageType::ContainerStop, ExecMode::Spawned, |ctx| {
            lifecycle(ctx, Lifecycle::Stop)
        })
        .register(MessageType::ContainerRestart, ExecMode::Spawned, |ctx| {
            lifecycle(ctx, Lifecycle::Restart)
        })
        .register(MessageType::ContainerDelete, ExecMode::Spawned, |ctx| {
            lifecycle(ctx, Lifecycle::Delete)
        })
        .register(MessageType::ContainerCreate, ExecMode::Spawned, create)
        .register(MessageType::ContainerUpdate, ExecMode::Spawned, update)
        .register(MessageType::ContainerLogs, ExecMode::Spawned, logs)
        .register(MessageType::ContainerStats, ExecMode::Spawned, stats)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerTarget {
    container_id: String,
    #[serde(default)]
    force: bool,
    /// Seconds before the engine kills on stop/restart.
    #[serde(default)]
    timeout: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Start,
    Stop,
    Restart,
    Delete,
}

impl Lifecycle {
    fn name(&self) -> &'static str {
        match self {
            Lifecycle::Start => "start",
            Lifecycle::Stop => "stop",
            Lifecycle::Restart => "restart",
            Lifecycle::Delete => "delete",
        }
    }

    /// Status the container is left in after success.
    fn resulting_status(&self) -> &'static str {
        match self {
            Lifecycle::Start | Lifecycle::Restart => "running",
            Lifecycle::Stop => "stopped",
            Lifecycle::Delete => "removed",
        }
    }
}

async fn list(ctx: OperationContext) -> OperationResult {
    let containers = ctx.services.sync.get_container_list().await?;
    ctx.reply(MessageType::ContainerList, json!({ "containers": containers }))
        .await;
    Ok(())
}

async fn detail(ctx: OperationContext) -> OperationResult {
    let target: ContainerTarget = ctx.parse()?;
    validate_container_id_or_name(&target.container_id)?;
    let detail = ctx.engine().inspect_container(&target.container_id).await?;
    let id = detail
        .get("Id")
        .and_then(Value::as_str)
        .unwrap_or(&target.container_id);
    let record = ctx.services.sync.repository().get_by_container_id(id).await?;
    ctx.reply(
        MessageType::ContainerDetail,
        json!({
            "containerId": target.container_id,
            "detail": detail,
            "record": record,
        }),
    )
    .await;
    Ok(())
}

async fn lifecycle(ctx: OperationContext, action: Lifecycle) -> OperationResult {
    let target: ContainerTarget = ctx.parse()?;
    let reference = target.container_id.as_str();
    if let Err(e) = validate_container_id_or_name(reference) {
        report(&ctx, reference, action.name(), Err(e)).await;
        return Ok(());
    }
    ctx.checkpoint()?;

    let engine = ctx.engine();
    // Clients may name a container or give an id prefix; the mirror and
    // broadcasts are keyed by the full id.
    let id = match ctx
        .until_cancelled(engine.resolve_container_id(reference))
        .await?
    {
        Ok(id) => id,
        Err(e) => {
            report(&ctx, reference, action.name(), Err(e)).await;
            return Ok(());
        }
    };

    let timeout = target.timeout.or(ctx.services.options.stop_timeout_secs);
    let run = async {
        match action {
            Lifecycle::Start => engine.start_container(&id).await,
            Lifecycle::Stop => engine.stop_container(&id, timeout).await,
            Lifecycle::Restart => engine.restart_container(&id, timeout).await,
            Lifecycle::Delete => engine.remove_container(&id, target.force).await,
        }
    };
    let result = ctx.until_cancelled(run).await?;

    let sync = &ctx.services.sync;
    let persisted = match (&result, action) {
        (Ok(()), Lifecycle::Delete) => sync.remove_container_record(&id).await,
        (Ok(()), _) => sync.update_container_status(&id, action.resulting_status()).await,
        (Err(e), _) => sync.update_container_error(&id, &e.user_message()).await,
    };
    if let Err(e) = persisted {
        warn!("Failed to persist {} of {}: {}", action.name(), id, e);
    }

    let succeeded = result.is_ok();
    report(&ctx, reference, action.name(), result).await;
    if succeeded {
        info!("Container {} {}", id, action.resulting_status());
        ctx.broadcast(
            MessageType::ContainerStateChange,
            json!({ "containerId": id, "status": action.resulting_status() }),
        );
    }
    Ok(())
}

/// `CONTAINER_OPERATION_RESULT` for a fire-and-report mutation.
async fn report(
    ctx: &OperationContext,
    container_id: &str,
    operation: &str,
    result: Result<(), EngineError>,
) {
    let mut payload = json!({
        "containerId": container_id,
        "operation": operation,
        "success": result.is_ok(),
    });
    if let Err(e) = result {
        warn!("Container {} {} failed: {}", operation, container_id, e);
        payload["message"] = Value::String(e.user_message());
    }
    ctx.reply(MessageType::ContainerOperationResult, payload)
        .await;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequest {
    #[serde(flatten)]
    spec: ContainerSpec,
    #[serde(default)]
    auto_start: bool,
}

async fn create(ctx: OperationContext) -> OperationResult {
    let request: CreateRequest = ctx.parse()?;
    let config = match request.spec.to_config() {
        Ok(config) => config,
        Err(e) => {
            report(&ctx, "", "create", Err(e)).await;
            return Ok(());
        }
    };
    ctx.checkpoint()?;

    let id = match ctx.engine().create_container(&config).await {
        Ok(id) => id,
        Err(e) => {
            report(&ctx, "", "create", Err(e)).await;
            return Ok(());
        }
    };

    let mut status = "created";
    let mut result = Ok(());
    if request.auto_start {
        result = ctx.engine().start_container(&id).await;
        if result.is_ok() {
            status = "running";
        }
    }

    let observed = ObservedContainer {
        container_id: id.clone(),
        name: config.name.clone().unwrap_or_default(),
        image: config.image.clone(),
        status: status.to_string(),
    };
    let sync = &ctx.services.sync;
    if let Err(e) = sync.record_container(&observed).await {
        warn!("Failed to record new container {}: {}", id, e);
    }
    if let Err(ref e) = result
        && let Err(e) = sync.update_container_error(&id, &e.user_message()).await
    {
        warn!("Failed to record start error for {}: {}", id, e);
    }

    report(&ctx, &id, "create", result).await;
    ctx.broadcast(
        MessageType::ContainerStateChange,
        json!({ "containerId": id, "status": status }),
    );
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateRequest {
    container_id: String,
    #[serde(flatten)]
    update: ContainerUpdate,
}

async fn update(ctx: OperationContext) -> OperationResult {
    let request: UpdateRequest = ctx.parse()?;
    let reference = request.container_id.as_str();
    let checked = validate_container_id_or_name(reference).and_then(|_| request.update.validate());
    if let Err(e) = checked {
        report(&ctx, reference, "update", Err(e)).await;
        return Ok(());
    }
    ctx.checkpoint()?;

    let engine = ctx.engine();
    let id = match ctx
        .until_cancelled(engine.resolve_container_id(reference))
        .await?
    {
        Ok(id) => id,
        Err(e) => {
            report(&ctx, reference, "update", Err(e)).await;
            return Ok(());
        }
    };
    let result = ctx
        .until_cancelled(engine.update_container(&id, &request.update))
        .await?;

    let sync = &ctx.services.sync;
    let mut changed = None;
    match result {
        // Resource updates keep the current status; clear any stale error.
        Ok(()) => match sync.repository().get_by_container_id(&id).await {
            Ok(Some(record)) => {
                if let Err(e) = sync.update_container_status(&id, &record.status).await {
                    warn!("Failed to persist update of {}: {}", id, e);
                }
                changed = Some(record.status);
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to read record for {}: {}", id, e),
        },
        Err(ref e) => {
            if let Err(e) = sync.update_container_error(&id, &e.user_message()).await {
                warn!("Failed to persist update error of {}: {}", id, e);
            }
        }
    }
    report(&ctx, reference, "update", result).await;
    if let Some(status) = changed {
        ctx.broadcast(
            MessageType::ContainerStateChange,
            json!({ "containerId": id, "status": status }),
        );
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsRequest {
    container_id: String,
    #[serde(default)]
    tail: Option<u32>,
    #[serde(default)]
    follow: bool,
}

async fn logs(ctx: OperationContext) -> OperationResult {
    let request: LogsRequest = ctx.parse()?;
    validate_container_id_or_name(&request.container_id)?;
    let tail = request.tail.unwrap_or(ctx.services.options.default_log_tail);
    let progress = ctx.progress(ProgressChannel::Logs);
    progress
        .start(json!({
            "containerId": request.container_id,
            "tail": tail,
            "follow": request.follow,
        }))
        .await;

    let (tx, mut rx) = mpsc::channel::<String>(256);
    let stream = ctx.engine().container_logs(
        &request.container_id,
        Some(tail),
        request.follow,
        tx,
        ctx.cancel.token(),
    );
    let forward = async {
        let mut lines = 0u64;
        while let Some(line) = rx.recv().await {
            lines += 1;
            progress.progress(json!({ "line": line })).await;
        }
        lines
    };
    let (result, lines) = tokio::join!(stream, forward);
    result?;
    ctx.checkpoint()?;

    progress
        .complete(json!({ "containerId": request.container_id, "lines": lines }))
        .await;
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsRequest {
    container_id: String,
    #[serde(default)]
    interval_secs: Option<u64>,
    /// Stop after this many samples; unbounded until cancelled otherwise.
    #[serde(default)]
    samples: Option<u32>,
}

async fn stats(ctx: OperationContext) -> OperationResult {
    let request: StatsRequest = ctx.parse()?;
    validate_container_id_or_name(&request.container_id)?;
    let interval = request
        .interval_secs
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
        .unwrap_or(ctx.services.options.default_stats_interval);
    let progress = ctx.progress(ProgressChannel::Stats);
    progress
        .start(json!({ "containerId": request.container_id }))
        .await;

    let mut taken = 0u32;
    loop {
        ctx.checkpoint()?;
        let sample = ctx.engine().container_stats(&request.container_id).await?;
        taken += 1;
        progress
            .progress(json!({ "sample": sample, "index": taken }))
            .await;
        if request.samples.is_some_and(|limit| taken >= limit) {
            break;
        }
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(OperationError::Engine(EngineError::Cancelled));
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }

    progress
        .complete(json!({ "containerId": request.container_id, "samples": taken }))
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_statuses_match_record_normalization() {
        assert_eq!(Lifecycle::Stop.resulting_status(), "stopped");
        assert_eq!(Lifecycle::Restart.resulting_status(), "running");
        assert_eq!(Lifecycle::Delete.name(), "delete");
    }

    #[test]
    fn create_request_flattens_spec() {
        let request: CreateRequest = serde_json::from_value(json!({
            "name": "web",
            "image": "nginx:latest",
            "ports": ["8080:80"],
            "autoStart": true,
        }))
        .unwrap();
        assert!(request.auto_start);
        assert_eq!(request.spec.name.as_deref(), Some("web"));
        assert_eq!(request.spec.to_config().unwrap().ports.len(), 1);
    }
}
