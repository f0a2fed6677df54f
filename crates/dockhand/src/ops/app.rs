//! App family: the install pipeline, network listing and template import.
//!
//! Installation runs four stages, each behind a cancellation check:
//! check-images (pulling what is missing), validate, start, and a short log
//! capture. A failed validation never reaches start, and a failed start
//! removes the containers the run created.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use tokio::sync::mpsc;

use super::image::pull_streaming;
use super::{OperationContext, OperationError, OperationResult, ProgressChannel, ProgressEmitter};
use crate::engine::ContainerConfig;
use crate::sync::ObservedContainer;
use crate::templates::AppTemplate;
use crate::ws::{ExecMode, Family, HandlerGroup, MessageType};

pub fn handler_group() -> HandlerGroup {
    HandlerGroup::new(Family::App)
        .register(MessageType::InstallCheckImages, ExecMode::Spawned, check_images)
        .register(MessageType::InstallValidate, ExecMode::Spawned, validate)
        .register(MessageType::InstallStart, ExecMode::Spawned, install)
        .register(MessageType::NetworkList, ExecMode::Spawned, network_list)
        .register(MessageType::ImportTemplate, ExecMode::Spawned, import_template)
}

// ============================================================================
// Plans
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct InstallRequest {
    template_id: Option<String>,
    /// Inline template object.
    template: Option<Value>,
    /// Inline template text (YAML or JSON).
    content: Option<String>,
    params: HashMap<String, String>,
    app_name: Option<String>,
}

#[derive(Debug, Clone)]
struct PlannedService {
    service: String,
    container_name: String,
    config: ContainerConfig,
}

#[derive(Debug, Clone)]
struct InstallPlan {
    app_name: String,
    services: Vec<PlannedService>,
}

impl InstallPlan {
    fn images(&self) -> BTreeSet<String> {
        self.services.iter().map(|s| s.config.image.clone()).collect()
    }
}

fn rejected(e: anyhow::Error) -> OperationError {
    OperationError::Rejected(format!("{e:#}"))
}

async fn resolve_template(
    ctx: &OperationContext,
    request: &InstallRequest,
) -> Result<AppTemplate, OperationError> {
    if let Some(ref id) = request.template_id {
        let repo = &ctx.services.templates;
        let stored = match repo.get(id).await? {
            Some(stored) => Some(stored),
            None => repo.get_by_name(id).await?,
        };
        let stored =
            stored.ok_or_else(|| OperationError::Rejected(format!("template '{id}' not found")))?;
        return stored.template().map_err(rejected);
    }
    if let Some(ref value) = request.template {
        return AppTemplate::from_value(value.clone()).map_err(rejected);
    }
    if let Some(ref content) = request.content {
        return AppTemplate::parse(content).map_err(rejected);
    }
    Err(OperationError::InvalidPayload(
        "one of templateId, template or content is required".to_string(),
    ))
}

async fn build_plan(ctx: &OperationContext) -> Result<InstallPlan, OperationError> {
    let request: InstallRequest = ctx.parse()?;
    let template = resolve_template(ctx, &request).await?;
    let rendered = template.render(&request.params).map_err(rejected)?;
    let app_name = request
        .app_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| rendered.name.clone());

    let mut services = Vec::with_capacity(rendered.services.len());
    for service in &rendered.services {
        let container_name = rendered
            .container_name(&app_name, service)
            .map_err(rejected)?;
        let mut spec = service.container.clone();
        spec.name = Some(container_name.clone());
        spec.labels
            .insert("dockhand.app".to_string(), app_name.clone());
        spec.labels
            .insert("dockhand.service".to_string(), service.name.clone());
        let config = spec.to_config().map_err(|e| {
            OperationError::Rejected(format!("{}: {}", service.name, e.user_message()))
        })?;
        services.push(PlannedService {
            service: service.name.clone(),
            container_name,
            config,
        });
    }
    Ok(InstallPlan { app_name, services })
}

// ============================================================================
// Stages
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageStatus {
    image: String,
    present: bool,
}

async fn inspect_images(
    ctx: &OperationContext,
    plan: &InstallPlan,
) -> Result<Vec<ImageStatus>, OperationError> {
    let mut statuses = Vec::new();
    for image in plan.images() {
        ctx.checkpoint()?;
        let present = ctx.engine().image_exists(&image).await?;
        statuses.push(ImageStatus { image, present });
    }
    Ok(statuses)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidationIssue {
    kind: &'static str,
    service: String,
    message: String,
}

async fn validate_plan(
    ctx: &OperationContext,
    plan: &InstallPlan,
) -> Result<Vec<ValidationIssue>, OperationError> {
    let mut issues = Vec::new();

    ctx.checkpoint()?;
    let existing: HashSet<String> = ctx
        .engine()
        .list_containers(true)
        .await?
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let mut claimed_ports = HashSet::new();
    for planned in &plan.services {
        if existing.contains(&planned.container_name) {
            issues.push(ValidationIssue {
                kind: "name",
                service: planned.service.clone(),
                message: format!("container name '{}' is already in use", planned.container_name),
            });
        }

        for port in &planned.config.ports {
            let key = (port.host_port, port.protocol.clone());
            if !claimed_ports.insert(key) {
                issues.push(ValidationIssue {
                    kind: "port",
                    service: planned.service.clone(),
                    message: format!("host port {} is used twice in this app", port.host_port),
                });
                continue;
            }
            let host = port.host_ip.as_deref().unwrap_or("0.0.0.0");
            if !port_is_free(host, port.host_port, &port.protocol).await {
                issues.push(ValidationIssue {
                    kind: "port",
                    service: planned.service.clone(),
                    message: format!("host port {}/{} is not available", port.host_port, port.protocol),
                });
            }
        }

        for (source, _) in &planned.config.volumes {
            let path = Path::new(source);
            if path.is_absolute() && !path_is_usable(path) {
                issues.push(ValidationIssue {
                    kind: "volume",
                    service: planned.service.clone(),
                    message: format!("host path '{source}' does not exist and cannot be created"),
                });
            }
        }
    }
    Ok(issues)
}

async fn port_is_free(host: &str, port: u16, protocol: &str) -> bool {
    if port == 0 {
        return true;
    }
    match protocol {
        "udp" => tokio::net::UdpSocket::bind((host, port)).await.is_ok(),
        _ => tokio::net::TcpListener::bind((host, port)).await.is_ok(),
    }
}

/// Exists, or its nearest existing ancestor is a writable directory.
fn path_is_usable(path: &Path) -> bool {
    if path.exists() {
        return true;
    }
    path.ancestors()
        .skip(1)
        .find(|p| p.exists())
        .and_then(|p| p.metadata().ok())
        .is_some_and(|m| m.is_dir() && !m.permissions().readonly())
}

async fn stage(progress: &ProgressEmitter, stage: &str, percent: u8, message: impl Into<String>) {
    progress
        .progress(json!({
            "stage": stage,
            "percent": percent,
            "message": message.into(),
        }))
        .await;
}

/// Integer interpolation of `index/total` into `[from, to]`.
fn scale(from: u8, to: u8, index: usize, total: usize) -> u8 {
    if total == 0 {
        return to;
    }
    let span = (to - from) as usize;
    from + (span * index.min(total) / total) as u8
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstalledContainer {
    service: String,
    container_name: String,
    container_id: String,
}

async fn start_services(
    ctx: &OperationContext,
    plan: &InstallPlan,
    progress: &ProgressEmitter,
) -> Result<Vec<InstalledContainer>, OperationError> {
    let total = plan.services.len();
    let mut created: Vec<InstalledContainer> = Vec::new();

    for (index, planned) in plan.services.iter().enumerate() {
        if let Err(e) = ctx.checkpoint() {
            if !created.is_empty() {
                warn!(
                    "Install {} cancelled with {} container(s) already created",
                    ctx.operation_id,
                    created.len()
                );
            }
            return Err(e);
        }
        stage(
            progress,
            "start",
            scale(55, 90, index, total),
            format!("starting {}", planned.container_name),
        )
        .await;

        let outcome = async {
            let id = ctx.engine().create_container(&planned.config).await?;
            created.push(InstalledContainer {
                service: planned.service.clone(),
                container_name: planned.container_name.clone(),
                container_id: id.clone(),
            });
            ctx.engine().start_container(&id).await?;
            Ok::<String, crate::engine::EngineError>(id)
        }
        .await;

        match outcome {
            Ok(id) => {
                let observed = ObservedContainer {
                    container_id: id,
                    name: planned.container_name.clone(),
                    image: planned.config.image.clone(),
                    status: "running".to_string(),
                };
                if let Err(e) = ctx.services.sync.record_container(&observed).await {
                    warn!("Failed to record {}: {}", planned.container_name, e);
                }
            }
            Err(e) if e.is_cancelled() => return Err(e.into()),
            Err(e) => {
                let message = format!("{}: {}", planned.service, e.user_message());
                rollback(ctx, &created).await;
                return Err(OperationError::Rejected(message));
            }
        }
    }
    Ok(created)
}

/// Remove containers this run created, newest first.
async fn rollback(ctx: &OperationContext, created: &[InstalledContainer]) {
    for container in created.iter().rev() {
        warn!("Rolling back {}", container.container_name);
        if let Err(e) = ctx
            .engine()
            .remove_container(&container.container_id, true)
            .await
        {
            warn!("Rollback of {} failed: {}", container.container_name, e);
        }
        if let Err(e) = ctx
            .services
            .sync
            .remove_container_record(&container.container_id)
            .await
        {
            warn!("Failed to drop record of {}: {}", container.container_name, e);
        }
    }
}

async fn capture_logs(
    ctx: &OperationContext,
    installed: &[InstalledContainer],
    progress: &ProgressEmitter,
) -> Result<(), OperationError> {
    let tail = ctx.services.options.install_log_lines;
    for (index, container) in installed.iter().enumerate() {
        ctx.checkpoint()?;
        stage(
            progress,
            "logs",
            scale(90, 99, index, installed.len()),
            format!("collecting logs of {}", container.container_name),
        )
        .await;

        let (tx, mut rx) = mpsc::channel::<String>(64);
        let stream = ctx.engine().container_logs(
            &container.container_id,
            Some(tail),
            false,
            tx,
            ctx.cancel.token(),
        );
        let forward = async {
            while let Some(line) = rx.recv().await {
                progress
                    .log("info", format!("[{}] {}", container.container_name, line))
                    .await;
            }
        };
        let (result, ()) = tokio::join!(stream, forward);
        match result {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => return Err(e.into()),
            // Logs are informational; the install already succeeded.
            Err(e) => {
                progress
                    .log(
                        "warn",
                        format!("[{}] logs unavailable: {}", container.container_name, e.user_message()),
                    )
                    .await;
            }
        }
    }
    Ok(())
}

// ============================================================================
// Executors
// ============================================================================

async fn check_images(ctx: OperationContext) -> OperationResult {
    let plan = build_plan(&ctx).await?;
    let images = inspect_images(&ctx, &plan).await?;
    let missing = images.iter().filter(|i| !i.present).count();
    ctx.reply(
        MessageType::InstallCheckImages,
        json!({ "appName": plan.app_name, "images": images, "missing": missing }),
    )
    .await;
    Ok(())
}

async fn validate(ctx: OperationContext) -> OperationResult {
    let plan = build_plan(&ctx).await?;
    let issues = validate_plan(&ctx, &plan).await?;
    ctx.reply(
        MessageType::InstallValidate,
        json!({ "appName": plan.app_name, "valid": issues.is_empty(), "issues": issues }),
    )
    .await;
    Ok(())
}

async fn install(ctx: OperationContext) -> OperationResult {
    let progress = ctx.progress(ProgressChannel::Install);
    let plan = build_plan(&ctx).await?;
    progress
        .start(json!({
            "appName": plan.app_name,
            "services": plan.services.iter().map(|s| &s.service).collect::<Vec<_>>(),
            "percent": 0,
        }))
        .await;
    info!("Installing {} ({} services)", plan.app_name, plan.services.len());

    // Stage 1: images.
    stage(&progress, "check-images", 5, "checking images").await;
    let images = inspect_images(&ctx, &plan).await?;
    let missing: Vec<String> = images
        .into_iter()
        .filter(|i| !i.present)
        .map(|i| i.image)
        .collect();
    stage(
        &progress,
        "check-images",
        10,
        format!("{} image(s) to pull", missing.len()),
    )
    .await;
    for (index, image) in missing.iter().enumerate() {
        let from = scale(10, 50, index, missing.len());
        let to = scale(10, 50, index + 1, missing.len());
        pull_streaming(&ctx, image, &progress, |s| {
            json!({
                "stage": "pull",
                "image": image,
                "percent": from + ((to - from) as u16 * s.percent as u16 / 100) as u8,
                "progress": s,
            })
        })
        .await?;
    }

    // Stage 2: validation. Short-circuits before anything is created.
    ctx.checkpoint()?;
    stage(&progress, "validate", 50, "validating ports, paths and names").await;
    let issues = validate_plan(&ctx, &plan).await?;
    if !issues.is_empty() {
        let message = issues
            .iter()
            .map(|i| i.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        progress
            .fail(message, json!({ "stage": "validate", "issues": issues }))
            .await;
        return Ok(());
    }
    stage(&progress, "validate", 55, "validation passed").await;

    // Stage 3: create and start.
    let installed = start_services(&ctx, &plan, &progress).await?;
    stage(&progress, "start", 90, "all services started").await;

    // Stage 4: logs.
    capture_logs(&ctx, &installed, &progress).await?;

    if let Err(e) = ctx.services.sync.sync().await {
        warn!("Post-install sync failed: {}", e);
    }
    info!("Installed {}", plan.app_name);
    progress
        .complete(json!({
            "appName": plan.app_name,
            "containers": installed,
            "percent": 100,
        }))
        .await;
    Ok(())
}

async fn network_list(ctx: OperationContext) -> OperationResult {
    let networks = ctx.engine().list_networks().await?;
    ctx.reply(MessageType::NetworkList, json!({ "networks": networks }))
        .await;
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ImportRequest {
    content: Option<String>,
    template: Option<Value>,
}

async fn import_template(ctx: OperationContext) -> OperationResult {
    let request: ImportRequest = ctx.parse()?;
    let parsed = match (request.content, request.template) {
        (Some(content), _) => AppTemplate::parse(&content).map(|t| (t, content)),
        (None, Some(value)) => AppTemplate::from_value(value.clone())
            .and_then(|t| Ok((t, serde_json::to_string_pretty(&value)?))),
        (None, None) => {
            return Err(OperationError::InvalidPayload(
                "content or template is required".to_string(),
            ));
        }
    };

    let (template, content) = match parsed {
        Ok(parsed) => parsed,
        Err(e) => {
            ctx.reply(
                MessageType::ImportTemplateResult,
                json!({ "success": false, "message": format!("{e:#}") }),
            )
            .await;
            return Ok(());
        }
    };

    let stored = ctx.services.templates.upsert(&template, &content).await?;
    info!("Imported template {} ({})", stored.name, stored.id);
    ctx.reply(
        MessageType::ImportTemplateResult,
        json!({
            "success": true,
            "templateId": stored.id,
            "name": stored.name,
            "requiredParams": template.required_params(),
        }),
    )
    .await;
    Ok(())
}
