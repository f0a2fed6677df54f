//! Streaming calls against the engine's HTTP API over its unix socket.
//!
//! Only used where the CLI cannot give structured streaming output: image
//! pulls, whose per-layer byte counts drive progress reporting.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as HyperlocalUri};
use log::debug;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::{EngineError, EngineResult};
use super::progress::PullEvent;

#[derive(Debug, Clone)]
pub struct EngineSocket {
    path: PathBuf,
}

impl EngineSocket {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_available(&self) -> bool {
        self.path.exists()
    }

    /// `POST /images/create`, forwarding every decoded stream message.
    ///
    /// Dropping the response on cancellation closes the connection, which
    /// makes the engine abandon the pull.
    pub async fn pull_image(
        &self,
        image: &str,
        events: mpsc::Sender<PullEvent>,
        cancel: CancellationToken,
    ) -> EngineResult<()> {
        let client: Client<UnixConnector, Full<Bytes>> = Client::unix();
        let uri: Uri = HyperlocalUri::new(&self.path, &pull_path(image)).into();
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .map_err(|e| EngineError::InvalidInput(e.to_string()))?;

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            res = client.request(request) => res.map_err(|e| EngineError::Unavailable(e.to_string()))?,
        };

        let status = response.status();
        let mut body = response.into_body();
        if !status.is_success() {
            let bytes = body
                .collect()
                .await
                .map_err(|e| EngineError::Unavailable(e.to_string()))?
                .to_bytes();
            return Err(EngineError::CommandFailed {
                command: "pull".to_string(),
                message: api_error_message(&bytes),
            });
        }

        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("pull of {} cancelled, closing engine stream", image);
                    return Err(EngineError::Cancelled);
                }
                frame = body.frame() => frame,
            };

            let Some(frame) = frame else { break };
            let frame = frame.map_err(|e| EngineError::Unavailable(e.to_string()))?;
            let Ok(data) = frame.into_data() else { continue };
            buffer.extend_from_slice(&data);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                forward_line(&line, &events).await?;
            }
        }

        if !buffer.is_empty() {
            forward_line(&buffer, &events).await?;
        }
        Ok(())
    }
}

async fn forward_line(line: &[u8], events: &mpsc::Sender<PullEvent>) -> EngineResult<()> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(());
    }
    let event: PullEvent =
        serde_json::from_str(text).map_err(|e| EngineError::ParseError(e.to_string()))?;
    if let Some(message) = event.error {
        return Err(EngineError::CommandFailed {
            command: "pull".to_string(),
            message,
        });
    }
    // A closed receiver means nobody is listening any more; keep draining.
    let _ = events.send(event).await;
    Ok(())
}

fn api_error_message(body: &[u8]) -> String {
    #[derive(serde::Deserialize)]
    struct ApiError {
        message: String,
    }
    serde_json::from_slice::<ApiError>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string())
}

/// Query path for `POST /images/create`.
fn pull_path(image: &str) -> String {
    let (from_image, tag) = split_reference(image);
    let mut path = format!("/images/create?fromImage={}", urlencoding::encode(from_image));
    if let Some(tag) = tag {
        path.push_str("&tag=");
        path.push_str(&urlencoding::encode(tag));
    }
    path
}

/// Split `repo[:tag]` without mistaking a registry port for a tag.
/// Digest references are passed whole.
pub fn split_reference(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }
    let last_slash = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_slash..].rfind(':') {
        Some(i) => (&image[..last_slash + i], Some(&image[last_slash + i + 1..])),
        None => (image, None),
    }
}
