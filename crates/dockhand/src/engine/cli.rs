//! Engine access through the docker/podman command line.

use async_trait::async_trait;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::process::{Output, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;

use super::error::{EngineError, EngineResult};
use super::events::EngineEvent;
use super::progress::PullEvent;
use super::socket::EngineSocket;
use super::types::{
    Container, ContainerConfig, ContainerStats, ContainerUpdate, ImageSummary, NetworkSummary,
    parse_json_records, validate_container_id_or_name, validate_image_name,
};
use super::{EngineApi, RuntimeType};
use crate::settings::{ProxyCell, ProxySetting, SettingsCell};

/// Container engine client.
///
/// Lifecycle and query calls shell out to the runtime binary. Image pulls go
/// through the engine socket when one is reachable so layer byte counts are
/// available; otherwise the CLI output is parsed line by line.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
    socket: Option<EngineSocket>,
    proxy: ProxyCell,
}

impl ContainerRuntime {
    /// Detect an installed runtime, preferring docker.
    pub fn detect() -> Self {
        let runtime_type = if is_binary_available("docker") {
            RuntimeType::Docker
        } else if is_binary_available("podman") {
            RuntimeType::Podman
        } else {
            // Fails on first use; health_check reports it at startup.
            RuntimeType::Docker
        };
        Self::with_type(runtime_type)
    }

    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self::with_binary(runtime_type, runtime_type.default_binary())
    }

    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
            socket: None,
            proxy: Arc::new(SettingsCell::new(ProxySetting::default())),
        }
    }

    pub fn socket(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.socket = Some(EngineSocket::new(path));
        self
    }

    /// Share the process-wide proxy cell. It is read on every call.
    pub fn proxy(mut self, proxy: ProxyCell) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(url) = self.proxy.get().url {
            for key in ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"] {
                cmd.env(key, &url);
            }
        }
        cmd
    }

    async fn output(&self, name: &str, args: &[String]) -> EngineResult<Output> {
        debug!("{} {}", self.binary, args.join(" "));
        self.command(args).output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::Unavailable(format!("{} not found", self.binary))
            } else {
                EngineError::CommandFailed {
                    command: name.to_string(),
                    message: e.to_string(),
                }
            }
        })
    }

    /// Run and return stdout, mapping a non-zero exit to `CommandFailed`.
    async fn run(&self, name: &str, args: &[String]) -> EngineResult<String> {
        let output = self.output(name, args).await?;
        if !output.status.success() {
            return Err(EngineError::CommandFailed {
                command: name.to_string(),
                message: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn pull_with_cli(
        &self,
        image: &str,
        events: mpsc::Sender<PullEvent>,
        cancel: CancellationToken,
    ) -> EngineResult<()> {
        let mut child = self
            .command(&args(&["pull", image]))
            .spawn()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            EngineError::Io(std::io::Error::other("pull stdout not captured"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            EngineError::Io(std::io::Error::other("pull stderr not captured"))
        })?;
        let mut lines = LinesStream::new(BufReader::new(stdout).lines())
            .merge(LinesStream::new(BufReader::new(stderr).lines()));

        let mut last_line = String::new();
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(EngineError::Cancelled);
                }
                line = lines.next() => line,
            };
            let Some(line) = line else { break };
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let _ = events.send(parse_cli_pull_line(&line)).await;
            last_line = line;
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(EngineError::CommandFailed {
                command: "pull".to_string(),
                message: last_line,
            });
        }
        Ok(())
    }
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::detect()
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn is_binary_available(name: &str) -> bool {
    std::process::Command::new("which")
        .arg(name)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

static DOCKER_LAYER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9a-f]{12}): (.+)$").expect("valid regex"));
static PODMAN_BLOB_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Copying blob (\S+)(.*)$").expect("valid regex"));

/// Map a line of human pull output onto the structured event shape.
fn parse_cli_pull_line(line: &str) -> PullEvent {
    let line = line.trim();
    if let Some(caps) = DOCKER_LAYER_RE.captures(line) {
        return PullEvent::layer(&caps[1], caps[2].trim(), None, None);
    }
    if let Some(caps) = PODMAN_BLOB_RE.captures(line) {
        let rest = caps[2].to_ascii_lowercase();
        let status = if rest.contains("done") || rest.contains("skipped") {
            "Pull complete"
        } else {
            "Pulling fs layer"
        };
        return PullEvent::layer(&caps[1], status, None, None);
    }
    PullEvent::status(line)
}

#[async_trait]
impl EngineApi for ContainerRuntime {
    async fn health_check(&self) -> EngineResult<String> {
        self.run("version", &args(&["version", "--format", "json"]))
            .await
    }

    async fn list_containers(&self, all: bool) -> EngineResult<Vec<Container>> {
        let mut a = args(&["ps", "--no-trunc", "--format", "json"]);
        if all {
            a.push("-a".to_string());
        }
        let stdout = self.run("ps", &a).await?;
        parse_json_records(&stdout)
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<Value> {
        validate_container_id_or_name(id)?;
        let output = self.output("inspect", &args(&["container", "inspect", id])).await?;
        if !output.status.success() {
            return Err(EngineError::ContainerNotFound(id.to_string()));
        }
        let mut records: Vec<Value> = serde_json::from_slice(&output.stdout)
            .map_err(|e| EngineError::ParseError(e.to_string()))?;
        if records.is_empty() {
            return Err(EngineError::ContainerNotFound(id.to_string()));
        }
        Ok(records.swap_remove(0))
    }

    async fn create_container(&self, config: &ContainerConfig) -> EngineResult<String> {
        config.validate()?;

        let mut a: Vec<String> = vec!["create".to_string()];
        if let Some(ref name) = config.name {
            a.push("--name".to_string());
            a.push(name.clone());
        }
        if let Some(ref network) = config.network {
            a.push("--network".to_string());
            a.push(network.clone());
        }
        if let Some(ref policy) = config.restart_policy {
            a.push("--restart".to_string());
            a.push(policy.clone());
        }
        if config.network.as_deref() != Some("host") {
            for port in &config.ports {
                a.push("-p".to_string());
                a.push(port.to_arg());
            }
        }
        for (host, container) in &config.volumes {
            a.push("-v".to_string());
            if self.runtime_type.needs_selinux_labels() && host.starts_with('/') {
                a.push(format!("{host}:{container}:Z"));
            } else {
                a.push(format!("{host}:{container}"));
            }
        }
        let mut env: Vec<_> = config.env.iter().collect();
        env.sort();
        for (key, value) in env {
            a.push("-e".to_string());
            a.push(format!("{key}={value}"));
        }
        let mut labels: Vec<_> = config.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            a.push("--label".to_string());
            a.push(format!("{key}={value}"));
        }
        a.push(config.image.clone());
        a.extend(config.command.iter().cloned());

        let stdout = self.run("create", &a).await?;
        Ok(stdout.trim().to_string())
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        validate_container_id_or_name(id)?;
        self.run("start", &args(&["start", id])).await.map(|_| ())
    }

    async fn stop_container(&self, id: &str, timeout_seconds: Option<u32>) -> EngineResult<()> {
        validate_container_id_or_name(id)?;
        let mut a = args(&["stop"]);
        if let Some(t) = timeout_seconds {
            a.push("-t".to_string());
            a.push(t.to_string());
        }
        a.push(id.to_string());
        self.run("stop", &a).await.map(|_| ())
    }

    async fn restart_container(&self, id: &str, timeout_seconds: Option<u32>) -> EngineResult<()> {
        validate_container_id_or_name(id)?;
        let mut a = args(&["restart"]);
        if let Some(t) = timeout_seconds {
            a.push("-t".to_string());
            a.push(t.to_string());
        }
        a.push(id.to_string());
        self.run("restart", &a).await.map(|_| ())
    }

    async fn remove_container(&self, id: &str, force: bool) -> EngineResult<()> {
        validate_container_id_or_name(id)?;
        let mut a = args(&["rm"]);
        if force {
            a.push("-f".to_string());
        }
        a.push(id.to_string());
        self.run("rm", &a).await.map(|_| ())
    }

    async fn update_container(&self, id: &str, update: &ContainerUpdate) -> EngineResult<()> {
        validate_container_id_or_name(id)?;
        update.validate()?;
        let mut a = args(&["update"]);
        if let Some(ref policy) = update.restart_policy {
            a.push("--restart".to_string());
            a.push(policy.clone());
        }
        if let Some(ref memory) = update.memory {
            a.push("--memory".to_string());
            a.push(memory.clone());
        }
        if let Some(cpus) = update.cpus {
            a.push("--cpus".to_string());
            a.push(cpus.to_string());
        }
        a.push(id.to_string());
        self.run("update", &a).await.map(|_| ())
    }

    async fn container_logs(
        &self,
        id: &str,
        tail: Option<u32>,
        follow: bool,
        lines: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> EngineResult<()> {
        validate_container_id_or_name(id)?;
        let mut a = args(&["logs"]);
        if let Some(n) = tail {
            a.push("--tail".to_string());
            a.push(n.to_string());
        }
        if follow {
            a.push("-f".to_string());
        }
        a.push(id.to_string());

        let mut child = self
            .command(&a)
            .spawn()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            EngineError::Io(std::io::Error::other("logs stdout not captured"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            EngineError::Io(std::io::Error::other("logs stderr not captured"))
        })?;

        // Containers write to both streams; the runtime mirrors them.
        let mut stream = LinesStream::new(BufReader::new(stdout).lines())
            .merge(LinesStream::new(BufReader::new(stderr).lines()));

        let mut last_line = String::new();
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(EngineError::Cancelled);
                }
                line = stream.next() => line,
            };
            let Some(line) = line else { break };
            let line = line?;
            if lines.send(line.clone()).await.is_err() {
                let _ = child.kill().await;
                return Ok(());
            }
            last_line = line;
        }

        let status = child.wait().await?;
        if !status.success() {
            warn!("logs for {} exited with {}", id, status);
            return Err(EngineError::CommandFailed {
                command: "logs".to_string(),
                message: last_line,
            });
        }
        Ok(())
    }

    async fn container_stats(&self, id: &str) -> EngineResult<ContainerStats> {
        validate_container_id_or_name(id)?;
        let stdout = self
            .run("stats", &args(&["stats", "--no-stream", "--format", "json", id]))
            .await?;
        parse_json_records::<ContainerStats>(&stdout)?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::ContainerNotFound(id.to_string()))
    }

    async fn pull_image(
        &self,
        image: &str,
        events: mpsc::Sender<PullEvent>,
        cancel: CancellationToken,
    ) -> EngineResult<()> {
        validate_image_name(image)?;
        match self.socket {
            Some(ref socket) if socket.is_available() => {
                socket.pull_image(image, events, cancel).await
            }
            _ => self.pull_with_cli(image, events, cancel).await,
        }
    }

    async fn list_images(&self) -> EngineResult<Vec<ImageSummary>> {
        let stdout = self
            .run("images", &args(&["images", "--no-trunc", "--format", "json"]))
            .await?;
        parse_json_records(&stdout)
    }

    async fn inspect_image(&self, image: &str) -> EngineResult<Option<Value>> {
        validate_image_name(image)?;
        let output = self.output("image inspect", &args(&["image", "inspect", image])).await?;
        if !output.status.success() {
            return Ok(None);
        }
        let records: Vec<Value> = serde_json::from_slice(&output.stdout)
            .map_err(|e| EngineError::ParseError(e.to_string()))?;
        Ok(records.into_iter().next())
    }

    async fn remove_image(&self, image: &str, force: bool) -> EngineResult<()> {
        validate_image_name(image)?;
        let mut a = args(&["rmi"]);
        if force {
            a.push("-f".to_string());
        }
        a.push(image.to_string());
        self.run("rmi", &a).await.map(|_| ())
    }

    async fn tag_image(&self, source: &str, target: &str) -> EngineResult<()> {
        validate_image_name(source)?;
        validate_image_name(target)?;
        self.run("tag", &args(&["tag", source, target]))
            .await
            .map(|_| ())
    }

    async fn image_digest(&self, image: &str) -> EngineResult<Option<String>> {
        validate_image_name(image)?;
        let output = self
            .output(
                "image inspect",
                &args(&["image", "inspect", "--format", "{{json .RepoDigests}}", image]),
            )
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let digests: Vec<String> =
            serde_json::from_slice(&output.stdout).unwrap_or_default();
        Ok(digests
            .iter()
            .find_map(|d| d.split_once('@').map(|(_, digest)| digest.to_string())))
    }

    async fn list_networks(&self) -> EngineResult<Vec<NetworkSummary>> {
        let stdout = self
            .run("network ls", &args(&["network", "ls", "--no-trunc", "--format", "json"]))
            .await?;
        parse_json_records(&stdout)
    }

    async fn container_events(
        &self,
        events: mpsc::Sender<EngineEvent>,
        cancel: CancellationToken,
    ) -> EngineResult<()> {
        let format = match self.runtime_type {
            RuntimeType::Docker => "{{json .}}",
            RuntimeType::Podman => "json",
        };
        let mut child = self
            .command(&args(&["events", "--filter", "type=container", "--format", format]))
            .spawn()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            EngineError::Io(std::io::Error::other("events stdout not captured"))
        })?;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(EngineError::Cancelled);
                }
                line = lines.next_line() => line?,
            };
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match EngineEvent::from_json_line(&line) {
                Ok(Some(event)) => {
                    if events.send(event).await.is_err() {
                        let _ = child.kill().await;
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) => debug!("skipping engine event line: {}", e),
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            let mut message = String::new();
            if let Some(mut stderr) = child.stderr.take() {
                use tokio::io::AsyncReadExt;
                let _ = stderr.read_to_string(&mut message).await;
            }
            return Err(EngineError::CommandFailed {
                command: "events".to_string(),
                message,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_docker_cli_pull_lines() {
        let event = parse_cli_pull_line("a2abf6c4d29d: Pull complete");
        assert_eq!(event.id.as_deref(), Some("a2abf6c4d29d"));
        assert_eq!(event.status, "Pull complete");

        let event = parse_cli_pull_line("latest: Pulling from library/nginx");
        assert!(event.id.is_none());
    }

    #[test]
    fn parses_podman_cli_pull_lines() {
        let event = parse_cli_pull_line("Copying blob sha256:5d3b2c done   |");
        assert_eq!(event.status, "Pull complete");
        let event = parse_cli_pull_line("Copying blob sha256:aa11 skipped: already exists");
        assert_eq!(event.status, "Pull complete");
        let event = parse_cli_pull_line("Copying blob sha256:bb22");
        assert_eq!(event.status, "Pulling fs layer");
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let runtime =
            ContainerRuntime::with_binary(RuntimeType::Docker, "/nonexistent/dockhand-engine");
        let err = runtime.list_containers(true).await.unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));
    }

    #[tokio::test]
    async fn rejects_invalid_ids_before_spawning() {
        let runtime =
            ContainerRuntime::with_binary(RuntimeType::Docker, "/nonexistent/dockhand-engine");
        let err = runtime.stop_container("abc; rm -rf /", None).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }
}
