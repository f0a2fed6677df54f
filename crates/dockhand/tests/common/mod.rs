//! Shared fixtures: a scripted engine and a server on an ephemeral port.

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use dockhand::api::{AppState, create_router};
use dockhand::db::Database;
use dockhand::engine::{
    Container, ContainerConfig, ContainerState, ContainerStats, ContainerUpdate, EngineApi,
    EngineError, EngineEvent, EngineResult, ImageSummary, NetworkSummary, PullEvent,
};
use dockhand::ops::Services;
use dockhand::registry::RemoteDigests;
use dockhand::settings::{ProxySetting, SettingsCell};
use dockhand::ws::{MessageRouter, SessionRegistry};

/// Images with this prefix pull until cancelled.
pub const SLOW_PREFIX: &str = "slow/";

/// Images with this prefix fail to pull directly.
pub const FAILING_PREFIX: &str = "unreachable/";

/// In-memory engine. Containers and images live in vectors; every call is
/// recorded as `verb:target`.
#[derive(Default)]
pub struct FakeEngine {
    containers: Mutex<Vec<Container>>,
    images: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    next_id: AtomicUsize,
    unavailable: Mutex<bool>,
    lifecycle_delay: Mutex<Option<Duration>>,
    active_pulls: AtomicUsize,
    subscribers: Mutex<Vec<mpsc::Sender<EngineEvent>>>,
}

impl FakeEngine {
    pub fn add_container(&self, id: &str, name: &str, image: &str, state: ContainerState) {
        self.containers.lock().unwrap().push(container(id, name, image, state));
    }

    pub fn add_image(&self, image: &str) {
        self.images.lock().unwrap().insert(image.to_string());
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.images.lock().unwrap().contains(image)
    }

    pub fn state_of(&self, id: &str) -> Option<ContainerState> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.state)
    }

    pub fn container_names(&self) -> Vec<String> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }

    /// Make start, stop and restart take `delay` before they act.
    pub fn set_lifecycle_delay(&self, delay: Duration) {
        *self.lifecycle_delay.lock().unwrap() = Some(delay);
    }

    /// Pulls currently inside `pull_image`.
    pub fn active_pulls(&self) -> usize {
        self.active_pulls.load(Ordering::SeqCst)
    }

    /// Deliver `event` to every open event stream.
    pub async fn emit_event(&self, event: EngineEvent) {
        let subscribers = self.subscribers.lock().unwrap().clone();
        for tx in subscribers {
            let _ = tx.send(event.clone()).await;
        }
    }

    /// Wait until an event stream is open. Panics after five seconds.
    pub async fn wait_for_event_subscriber(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.subscribers.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no event subscriber");
    }

    async fn lifecycle_pause(&self) {
        let delay = *self.lifecycle_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_available(&self) -> EngineResult<()> {
        if *self.unavailable.lock().unwrap() {
            Err(EngineError::Unavailable("engine socket closed".to_string()))
        } else {
            Ok(())
        }
    }

    fn set_state(&self, id: &str, state: ContainerState) -> EngineResult<()> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .iter_mut()
            .find(|c| c.id == id || c.name() == id)
            .ok_or_else(|| EngineError::ContainerNotFound(id.to_string()))?;
        container.state = state;
        Ok(())
    }
}

/// Counts a pull for as long as it is alive, dropped futures included.
struct ActivePull<'a>(&'a AtomicUsize);

impl<'a> ActivePull<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActivePull<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn container(id: &str, name: &str, image: &str, state: ContainerState) -> Container {
    Container {
        id: id.to_string(),
        names: vec![name.to_string()],
        image: image.to_string(),
        state,
        status: String::new(),
        created: String::new(),
        created_at: String::new(),
    }
}

#[async_trait]
impl EngineApi for FakeEngine {
    async fn health_check(&self) -> EngineResult<String> {
        self.check_available()?;
        Ok("fake 1.0".to_string())
    }

    async fn list_containers(&self, _all: bool) -> EngineResult<Vec<Container>> {
        self.check_available()?;
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<Value> {
        let containers = self.containers.lock().unwrap();
        let container = containers
            .iter()
            .find(|c| c.id == id || c.name() == id)
            .ok_or_else(|| EngineError::ContainerNotFound(id.to_string()))?;
        Ok(json!({ "Id": container.id, "Name": container.name(), "State": container.state }))
    }

    async fn create_container(&self, config: &ContainerConfig) -> EngineResult<String> {
        self.check_available()?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("created{n:04}");
        let name = config.name.clone().unwrap_or_else(|| id.clone());
        self.record(format!("create:{name}"));
        self.add_container(&id, &name, &config.image, ContainerState::Created);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        self.lifecycle_pause().await;
        self.record(format!("start:{id}"));
        self.set_state(id, ContainerState::Running)
    }

    async fn stop_container(&self, id: &str, _timeout_seconds: Option<u32>) -> EngineResult<()> {
        self.lifecycle_pause().await;
        self.record(format!("stop:{id}"));
        self.set_state(id, ContainerState::Exited)
    }

    async fn restart_container(&self, id: &str, _timeout_seconds: Option<u32>) -> EngineResult<()> {
        self.lifecycle_pause().await;
        self.record(format!("restart:{id}"));
        self.set_state(id, ContainerState::Running)
    }

    async fn remove_container(&self, id: &str, _force: bool) -> EngineResult<()> {
        self.record(format!("remove:{id}"));
        let mut containers = self.containers.lock().unwrap();
        let before = containers.len();
        containers.retain(|c| c.id != id && c.name() != id);
        if containers.len() == before {
            return Err(EngineError::ContainerNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn update_container(&self, id: &str, _update: &ContainerUpdate) -> EngineResult<()> {
        self.record(format!("update:{id}"));
        Ok(())
    }

    async fn container_logs(
        &self,
        id: &str,
        _tail: Option<u32>,
        _follow: bool,
        lines: mpsc::Sender<String>,
        _cancel: CancellationToken,
    ) -> EngineResult<()> {
        for n in 1..=2 {
            if lines.send(format!("{id} line {n}")).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn container_stats(&self, id: &str) -> EngineResult<ContainerStats> {
        Ok(ContainerStats {
            container_id: id.to_string(),
            name: id.to_string(),
            cpu_percent: "1.00%".to_string(),
            mem_usage: "10MiB / 1GiB".to_string(),
            mem_percent: "1.00%".to_string(),
            net_io: "0B / 0B".to_string(),
            block_io: "0B / 0B".to_string(),
            pids: "1".to_string(),
        })
    }

    async fn pull_image(
        &self,
        image: &str,
        events: mpsc::Sender<PullEvent>,
        cancel: CancellationToken,
    ) -> EngineResult<()> {
        self.record(format!("pull:{image}"));
        let _active = ActivePull::enter(&self.active_pulls);
        self.scripted_pull(image, events, cancel).await
    }

    async fn list_images(&self) -> EngineResult<Vec<ImageSummary>> {
        let images = self.images.lock().unwrap();
        Ok(images
            .iter()
            .map(|image| {
                let (repository, tag) = image.rsplit_once(':').unwrap_or((image, "latest"));
                ImageSummary {
                    id: format!("sha256:{repository}"),
                    repository: repository.to_string(),
                    tag: tag.to_string(),
                    size: "1MB".to_string(),
                    created_at: String::new(),
                }
            })
            .collect())
    }

    async fn inspect_image(&self, image: &str) -> EngineResult<Option<Value>> {
        Ok(self
            .has_image(image)
            .then(|| json!({ "Id": format!("sha256:{image}"), "RepoTags": [image] })))
    }

    async fn remove_image(&self, image: &str, _force: bool) -> EngineResult<()> {
        self.record(format!("rmi:{image}"));
        if self.images.lock().unwrap().remove(image) {
            Ok(())
        } else {
            Err(EngineError::ImageNotFound(image.to_string()))
        }
    }

    async fn tag_image(&self, source: &str, target: &str) -> EngineResult<()> {
        self.record(format!("tag:{source}->{target}"));
        if !self.has_image(source) {
            return Err(EngineError::ImageNotFound(source.to_string()));
        }
        self.add_image(target);
        Ok(())
    }

    async fn image_digest(&self, image: &str) -> EngineResult<Option<String>> {
        Ok(self.has_image(image).then(|| "sha256:local".to_string()))
    }

    async fn list_networks(&self) -> EngineResult<Vec<NetworkSummary>> {
        Ok(vec![NetworkSummary {
            id: "net1".to_string(),
            name: "bridge".to_string(),
            driver: "bridge".to_string(),
            scope: "local".to_string(),
        }])
    }

    async fn container_events(
        &self,
        events: mpsc::Sender<EngineEvent>,
        cancel: CancellationToken,
    ) -> EngineResult<()> {
        self.subscribers.lock().unwrap().push(events);
        cancel.cancelled().await;
        self.subscribers.lock().unwrap().clear();
        Err(EngineError::Cancelled)
    }
}

impl FakeEngine {
    async fn scripted_pull(
        &self,
        image: &str,
        events: mpsc::Sender<PullEvent>,
        cancel: CancellationToken,
    ) -> EngineResult<()> {
        if image.starts_with(FAILING_PREFIX) {
            return Err(EngineError::CommandFailed {
                command: format!("pull {image}"),
                message: format!("pull access denied for {image}"),
            });
        }
        if image.starts_with(SLOW_PREFIX) {
            for step in 1..=10_000u64 {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                }
                let current = step.min(9_999);
                let _ = events
                    .send(PullEvent::layer("slow", "Downloading", Some(current), Some(10_000)))
                    .await;
            }
            return Err(EngineError::Cancelled);
        }

        let steps = [
            PullEvent::layer("aaa", "Pulling fs layer", None, None),
            PullEvent::layer("bbb", "Pulling fs layer", None, None),
            PullEvent::layer("aaa", "Downloading", Some(50), Some(100)),
            PullEvent::layer("bbb", "Downloading", Some(100), Some(300)),
            PullEvent::layer("aaa", "Download complete", None, None),
            PullEvent::layer("bbb", "Downloading", Some(300), Some(300)),
            PullEvent::layer("aaa", "Pull complete", None, None),
            PullEvent::layer("bbb", "Pull complete", None, None),
            PullEvent::status("Status: Downloaded newer image"),
        ];
        for event in steps {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let _ = events.send(event).await;
        }
        self.add_image(image);
        Ok(())
    }
}

/// Registry that always reports a newer digest than the local one.
pub struct FakeRegistry;

#[async_trait]
impl RemoteDigests for FakeRegistry {
    async fn remote_digest(&self, _image: &str) -> Result<Option<String>> {
        Ok(Some("sha256:remote".to_string()))
    }
}

pub struct TestApp {
    pub engine: Arc<FakeEngine>,
    pub services: Arc<Services>,
    pub router: Router,
}

pub async fn test_app() -> TestApp {
    let database = Database::in_memory().await.unwrap();
    let engine = Arc::new(FakeEngine::default());
    let proxy = Arc::new(SettingsCell::new(ProxySetting::default()));
    let services = Arc::new(
        Services::new(
            engine.clone(),
            &database,
            Arc::new(FakeRegistry),
            Arc::new(SessionRegistry::default()),
        )
        .with_proxy(proxy.clone()),
    );
    let router = MessageRouter::new(services.clone()).unwrap();
    let state = AppState::new(router, proxy).with_ping_interval(Duration::from_secs(60));
    TestApp {
        engine,
        services,
        router: create_router(state),
    }
}

/// Serve `app` on 127.0.0.1 and return its address.
pub async fn spawn_server(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}/api/ws")).await.unwrap();
    ws
}

pub async fn send(client: &mut Client, frame: Value) {
    client
        .send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
}

/// Next JSON text frame, skipping pings. Panics after five seconds.
pub async fn recv(client: &mut Client) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let msg = client.next().await.expect("socket closed").unwrap();
            if let Message::Text(_) = msg {
                return serde_json::from_str::<Value>(msg.to_text().unwrap()).unwrap();
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

/// Frames up to and including the first one of type `kind`.
pub async fn recv_until(client: &mut Client, kind: &str) -> Vec<Value> {
    let mut frames = Vec::new();
    loop {
        let frame = recv(client).await;
        let done = frame["type"] == kind;
        frames.push(frame);
        if done {
            return frames;
        }
    }
}

/// Frames for `operation_id` up to and including its terminal event.
pub async fn recv_operation(client: &mut Client, operation_id: &str, terminal: &str) -> Vec<Value> {
    let mut frames = Vec::new();
    loop {
        let frame = recv(client).await;
        if frame["payload"]["operationId"] != operation_id {
            continue;
        }
        let done = frame["type"] == terminal;
        frames.push(frame);
        if done {
            return frames;
        }
    }
}
