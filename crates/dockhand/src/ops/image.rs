//! Image family: pulls with layer progress, queries, deletion and update
//! checks against the remote registry.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    OperationContext, OperationError, OperationResult, ProgressChannel, ProgressEmitter, Services,
    system,
};
use crate::engine::{EngineError, PullEvent, PullProgress, PullSnapshot, validate_image_name};
use crate::ws::{ExecMode, Family, HandlerGroup, MessageType};

pub fn handler_group() -> HandlerGroup {
    HandlerGroup::new(Family::Image)
        .register(MessageType::PullImage, ExecMode::Spawned, pull)
        .register(MessageType::CancelPull, ExecMode::Inline, system::cancel_operation)
        .register(MessageType::ImageCancelPull, ExecMode::Inline, system::cancel_operation)
        .register(MessageType::ImageList, ExecMode::Spawned, list)
        .register(MessageType::ImageDetail, ExecMode::Spawned, detail)
        .register(MessageType::ImageDelete, ExecMode::Spawned, delete)
        .register(MessageType::ImageUpdate, ExecMode::Spawned, update)
        .register(MessageType::ImageBatchUpdate, ExecMode::Spawned, batch_update)
        .register(MessageType::ImageCheckUpdates, ExecMode::Spawned, check_updates)
}

/// Pull `image`, emitting one progress event per layer update.
///
/// `detail` shapes each snapshot into the event detail, which lets callers
/// rescale the percentage into a larger operation. When the direct pull
/// fails, each configured registry mirror is tried in order and a successful
/// mirror pull is tagged back to `image`.
pub(crate) async fn pull_streaming(
    ctx: &OperationContext,
    image: &str,
    progress: &ProgressEmitter,
    detail: impl Fn(&PullSnapshot) -> Value,
) -> Result<(), OperationError> {
    ctx.checkpoint()?;
    // Shared across attempts so the percentage never goes backwards.
    let mut aggregate = PullProgress::new();
    let direct = match pull_once(ctx, image, &mut aggregate, progress, &detail).await {
        Ok(()) => return ctx.checkpoint(),
        Err(e) if e.is_cancelled() => return Err(e.into()),
        Err(e) => e,
    };

    let mirrors: Vec<String> = ctx
        .services
        .settings
        .get()
        .mirror_hosts()
        .iter()
        .filter_map(|host| mirror_reference(host, image))
        .collect();
    for mirrored in mirrors {
        ctx.checkpoint()?;
        warn!("Pull of {} failed ({}), trying {}", image, direct, mirrored);
        match pull_once(ctx, &mirrored, &mut aggregate, progress, &detail).await {
            Ok(()) => {
                ctx.engine().tag_image(&mirrored, image).await?;
                info!("Pulled {} through mirror {}", image, mirrored);
                return ctx.checkpoint();
            }
            Err(e) if e.is_cancelled() => return Err(e.into()),
            Err(e) => warn!("Mirror pull {} failed: {}", mirrored, e),
        }
    }
    Err(direct.into())
}

async fn pull_once(
    ctx: &OperationContext,
    image: &str,
    aggregate: &mut PullProgress,
    progress: &ProgressEmitter,
    detail: &impl Fn(&PullSnapshot) -> Value,
) -> Result<(), EngineError> {
    let (tx, mut rx) = mpsc::channel::<PullEvent>(256);
    let pull = ctx.engine().pull_image(image, tx, ctx.cancel.token());
    let forward = async {
        while let Some(event) = rx.recv().await {
            if let Some(snapshot) = aggregate.apply(&event) {
                progress.progress(detail(&snapshot)).await;
            }
        }
    };
    let (result, ()) = tokio::join!(pull, forward);
    result
}

/// `image` as served by the mirror at `host`. Digest references and images
/// naming their own registry are never rewritten.
fn mirror_reference(host: &str, image: &str) -> Option<String> {
    if image.contains('@') {
        return None;
    }
    let (path, tag) = match image.rsplit_once(':') {
        Some((path, tag)) if !tag.contains('/') => (path, tag),
        _ => (image, "latest"),
    };
    match path.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            None
        }
        Some(_) => Some(format!("{host}/{path}:{tag}")),
        None => Some(format!("{host}/library/{path}:{tag}")),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageTarget {
    #[serde(alias = "imageName")]
    image: String,
}

async fn pull(ctx: OperationContext) -> OperationResult {
    let target: ImageTarget = ctx.parse()?;
    validate_image_name(&target.image)?;
    let image = target.image.as_str();

    let progress = ctx.progress(ProgressChannel::Pull);
    progress.start(json!({ "image": image, "percent": 0 })).await;
    pull_streaming(&ctx, image, &progress, |s| json!({ "image": image, "progress": s, "percent": s.percent }))
        .await?;
    info!("Pulled image {}", image);
    progress
        .complete(json!({ "image": image, "percent": 100 }))
        .await;
    Ok(())
}

async fn list(ctx: OperationContext) -> OperationResult {
    let images = ctx.engine().list_images().await?;
    ctx.reply(MessageType::ImageList, json!({ "images": images }))
        .await;
    Ok(())
}

async fn detail(ctx: OperationContext) -> OperationResult {
    let target: ImageTarget = ctx.parse()?;
    validate_image_name(&target.image)?;
    let detail = ctx
        .engine()
        .inspect_image(&target.image)
        .await?
        .ok_or_else(|| EngineError::ImageNotFound(target.image.clone()))?;
    ctx.reply(
        MessageType::ImageDetail,
        json!({ "image": target.image, "detail": detail }),
    )
    .await;
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteRequest {
    #[serde(alias = "image")]
    image_id: String,
    #[serde(default)]
    force: bool,
}

async fn delete(ctx: OperationContext) -> OperationResult {
    let request: DeleteRequest = ctx.parse()?;
    let result = match validate_image_name(&request.image_id) {
        Ok(()) => {
            ctx.checkpoint()?;
            ctx.engine()
                .remove_image(&request.image_id, request.force)
                .await
        }
        Err(e) => Err(e),
    };

    let mut payload = json!({
        "imageId": request.image_id,
        "operation": "delete",
        "success": result.is_ok(),
    });
    if let Err(e) = result {
        warn!("Image delete of {} failed: {}", request.image_id, e);
        payload["message"] = Value::String(e.user_message());
    }
    ctx.reply(MessageType::ImageOperationResult, payload).await;
    Ok(())
}

async fn update(ctx: OperationContext) -> OperationResult {
    let target: ImageTarget = ctx.parse()?;
    validate_image_name(&target.image)?;
    let image = target.image.as_str();

    let progress = ctx.progress(ProgressChannel::Pull);
    progress
        .start(json!({ "image": image, "percent": 0, "update": true }))
        .await;
    pull_streaming(&ctx, image, &progress, |s| json!({ "image": image, "progress": s, "percent": s.percent }))
        .await?;
    let cleared = ctx
        .services
        .sync
        .repository()
        .set_need_update_for_image(image, false)
        .await?;
    info!("Updated image {} ({} record(s) refreshed)", image, cleared);
    progress
        .complete(json!({ "image": image, "percent": 100, "records": cleared }))
        .await;
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchRequest {
    images: Vec<String>,
}

/// Overall percent for image `index` of `total` at `percent` within it.
fn overall_percent(index: usize, total: usize, percent: u8) -> u8 {
    if total == 0 {
        return 0;
    }
    ((index * 100 + percent as usize) / total).min(99) as u8
}

async fn batch_update(ctx: OperationContext) -> OperationResult {
    let request: BatchRequest = ctx.parse()?;
    if request.images.is_empty() {
        return Err(OperationError::InvalidPayload(
            "images must not be empty".to_string(),
        ));
    }
    for image in &request.images {
        validate_image_name(image)?;
    }

    let total = request.images.len();
    let progress = ctx.progress(ProgressChannel::Pull);
    progress
        .start(json!({ "images": request.images, "total": total, "percent": 0 }))
        .await;

    // Sequential: cancellation takes effect before the next image.
    let mut overall = 0u8;
    for (index, image) in request.images.iter().enumerate() {
        let detail = |s: &PullSnapshot| {
            json!({
                "image": image,
                "index": index,
                "total": total,
                "progress": s,
                "percent": overall_percent(index, total, s.percent).max(overall),
            })
        };
        match pull_streaming(&ctx, image, &progress, detail).await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                return Err(OperationError::Rejected(format!(
                    "{image}: {}",
                    e.user_message()
                )));
            }
        }
        ctx.services
            .sync
            .repository()
            .set_need_update_for_image(image, false)
            .await?;
        overall = overall_percent(index + 1, total, 0).max(overall);
        progress
            .progress(json!({
                "image": image,
                "index": index,
                "total": total,
                "imageComplete": true,
                "percent": overall,
            }))
            .await;
    }

    progress
        .complete(json!({ "images": request.images, "total": total, "percent": 100 }))
        .await;
    Ok(())
}

/// Result of comparing one local image with its registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheck {
    pub image: String,
    pub need_update: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Compare local repo digests with the registry and persist `needUpdate`.
///
/// `images` defaults to every image referenced by a container record.
/// Per-image failures are reported in the result, not returned.
pub async fn check_image_updates(
    services: &Services,
    images: Option<Vec<String>>,
    cancel: &CancellationToken,
) -> Result<Vec<UpdateCheck>, OperationError> {
    let repo = services.sync.repository();
    let images: BTreeSet<String> = match images {
        Some(images) => images.into_iter().collect(),
        None => repo
            .list_all()
            .await?
            .into_iter()
            .map(|r| r.image)
            .filter(|i| !i.is_empty())
            .collect(),
    };

    let mut results = Vec::with_capacity(images.len());
    for image in images {
        if cancel.is_cancelled() {
            return Err(OperationError::Engine(EngineError::Cancelled));
        }
        let mut check = UpdateCheck {
            image: image.clone(),
            need_update: false,
            local_digest: None,
            remote_digest: None,
            error: None,
        };
        match services.engine.image_digest(&image).await {
            Ok(digest) => check.local_digest = digest,
            Err(e) => check.error = Some(e.user_message()),
        }
        if check.error.is_none() && check.local_digest.is_some() {
            match services.registry.remote_digest(&image).await {
                Ok(digest) => check.remote_digest = digest,
                Err(e) => {
                    debug!("Registry lookup for {} failed: {:#}", image, e);
                    check.error = Some(format!("registry lookup failed: {e}"));
                }
            }
        }
        if let (Some(local), Some(remote)) = (&check.local_digest, &check.remote_digest) {
            check.need_update = local != remote;
        }
        if check.error.is_none() {
            repo.set_need_update_for_image(&image, check.need_update)
                .await?;
        }
        results.push(check);
    }
    Ok(results)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CheckUpdatesRequest {
    images: Option<Vec<String>>,
}

async fn check_updates(ctx: OperationContext) -> OperationResult {
    let request: CheckUpdatesRequest = ctx.parse()?;
    let results = check_image_updates(&ctx.services, request.images, &ctx.cancel.token()).await?;
    let outdated = results.iter().filter(|r| r.need_update).count();
    ctx.reply(
        MessageType::ImageCheckUpdates,
        json!({ "results": results, "outdated": outdated }),
    )
    .await;
    Ok(())
}

/// Run [`check_image_updates`] every `interval` until `shutdown` fires.
pub fn spawn_update_checks(
    services: Arc<Services>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick is immediate; let startup sync go first.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match check_image_updates(&services, None, &shutdown).await {
                        Ok(results) => {
                            let outdated = results.iter().filter(|r| r.need_update).count();
                            info!("Image update check: {} of {} outdated", outdated, results.len());
                        }
                        Err(e) if e.is_cancelled() => break,
                        Err(e) => warn!("Image update check failed: {}", e),
                    }
                }
            }
        }
        debug!("image update checks stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_hub_images_for_mirrors() {
        assert_eq!(
            mirror_reference("mirror.local", "nginx").as_deref(),
            Some("mirror.local/library/nginx:latest")
        );
        assert_eq!(
            mirror_reference("mirror.local:5000", "grafana/grafana:10.2").as_deref(),
            Some("mirror.local:5000/grafana/grafana:10.2")
        );
        assert_eq!(mirror_reference("mirror.local", "ghcr.io/org/app:1"), None);
        assert_eq!(mirror_reference("mirror.local", "localhost:5000/app"), None);
        assert_eq!(mirror_reference("mirror.local", "nginx@sha256:abc"), None);
    }

    #[test]
    fn overall_percent_spreads_images_evenly() {
        assert_eq!(overall_percent(0, 4, 0), 0);
        assert_eq!(overall_percent(0, 4, 100), 25);
        assert_eq!(overall_percent(2, 4, 50), 62);
        assert_eq!(overall_percent(4, 4, 0), 99);
        assert_eq!(overall_percent(0, 0, 50), 0);
    }
}
