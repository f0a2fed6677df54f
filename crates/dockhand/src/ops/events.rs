//! Engine event watch: keeps the mirror current between sync passes and
//! tells every session about containers changed outside this process.

use log::{debug, info, warn};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Services;
use crate::engine::{EngineEvent, EventAction};
use crate::sync::{ObservedContainer, SyncError};
use crate::ws::{Envelope, MessageType};

/// Restarts within [`RESTART_WINDOW`] that count as a restart loop.
const RESTART_LOOP_THRESHOLD: usize = 3;
const RESTART_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Follow the engine's event stream until `shutdown` fires, reconnecting
/// after `restart_delay` whenever the stream ends.
pub fn spawn_event_watch(
    services: Arc<Services>,
    restart_delay: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut restarts = RestartTracker::default();
        loop {
            let (tx, mut rx) = mpsc::channel::<EngineEvent>(256);
            let stream = services.engine.container_events(tx, shutdown.child_token());
            let apply = async {
                while let Some(event) = rx.recv().await {
                    apply_event(&services, &mut restarts, &event).await;
                }
            };
            let (result, ()) = tokio::join!(stream, apply);
            match result {
                Err(e) if e.is_cancelled() => break,
                Err(e) => warn!("Engine event stream failed: {}", e),
                Ok(()) => debug!("engine event stream ended"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(restart_delay) => {}
            }
        }
        debug!("engine event watch stopped");
    })
}

/// Mirror one event and announce it. Events that change nothing are
/// dropped.
pub async fn apply_event(services: &Services, restarts: &mut RestartTracker, event: &EngineEvent) {
    let id = event.container_id.as_str();
    let name = event.name.as_deref().unwrap_or(id);
    let sync = &services.sync;

    let (status, persisted) = match &event.action {
        EventAction::Create => {
            let persisted = match (&event.name, &event.image) {
                (Some(name), Some(image)) => {
                    sync.record_container(&ObservedContainer {
                        container_id: id.to_string(),
                        name: name.clone(),
                        image: image.clone(),
                        status: "created".to_string(),
                    })
                    .await
                }
                _ => sync.sync().await.map(|_| ()),
            };
            ("created", persisted)
        }
        EventAction::Start | EventAction::Unpause => {
            ("running", sync.update_container_status(id, "running").await)
        }
        EventAction::Stop => ("stopped", sync.update_container_status(id, "stopped").await),
        EventAction::Die => {
            if event.is_abnormal_exit() {
                warn!("Container {} died: {}", name, event.exit_reason());
            } else {
                info!("Container {} exited: {}", name, event.exit_reason());
            }
            ("stopped", sync.update_container_status(id, "stopped").await)
        }
        EventAction::Pause => ("paused", sync.update_container_status(id, "paused").await),
        EventAction::Restart => {
            if restarts.record(id, Instant::now()) {
                warn!(
                    "Container {} restarted {} times within {}s",
                    name,
                    RESTART_LOOP_THRESHOLD,
                    RESTART_WINDOW.as_secs()
                );
            }
            ("running", sync.update_container_status(id, "running").await)
        }
        EventAction::Destroy => {
            restarts.forget(id);
            ("removed", sync.remove_container_record(id).await)
        }
        EventAction::Rename => ("renamed", sync.sync().await.map(|_| ())),
        EventAction::Oom => {
            warn!("Container {} ran out of memory", name);
            return;
        }
        EventAction::HealthStatus => {
            if event.health.as_deref() == Some("unhealthy") {
                warn!("Container {} is unhealthy", name);
            }
            return;
        }
        // A stop or die follows when the kill takes effect.
        EventAction::Kill | EventAction::Other(_) => return,
    };

    if let Err(e) = persisted {
        match e {
            SyncError::Engine(e) => warn!("Event {:?} for {} not mirrored: {}", event.action, id, e),
            SyncError::Storage(e) => warn!("Event {:?} for {} not mirrored: {:#}", event.action, id, e),
        }
    }
    services.sessions.broadcast(Envelope::new(
        MessageType::ContainerStateChange,
        json!({
            "containerId": id,
            "name": name,
            "status": status,
            "action": event.action,
            "source": "engine",
        }),
    ));
}

/// Recent restart times per container.
#[derive(Debug, Default)]
pub struct RestartTracker {
    seen: HashMap<String, VecDeque<Instant>>,
}

impl RestartTracker {
    /// Note a restart at `at`. True when the container just reached the
    /// restart-loop threshold.
    pub fn record(&mut self, container_id: &str, at: Instant) -> bool {
        let times = self.seen.entry(container_id.to_string()).or_default();
        while times
            .front()
            .is_some_and(|first| at.duration_since(*first) > RESTART_WINDOW)
        {
            times.pop_front();
        }
        times.push_back(at);
        times.len() == RESTART_LOOP_THRESHOLD
    }

    pub fn forget(&mut self, container_id: &str) {
        self.seen.remove(container_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_restart_loops_once_per_window() {
        let mut tracker = RestartTracker::default();
        let start = Instant::now();
        assert!(!tracker.record("web", start));
        assert!(!tracker.record("web", start + Duration::from_secs(10)));
        assert!(tracker.record("web", start + Duration::from_secs(20)));
        assert!(!tracker.record("web", start + Duration::from_secs(30)));
        assert!(!tracker.record("db", start + Duration::from_secs(30)));
    }

    #[test]
    fn old_restarts_fall_out_of_the_window() {
        let mut tracker = RestartTracker::default();
        let start = Instant::now();
        tracker.record("web", start);
        tracker.record("web", start + Duration::from_secs(1));
        assert!(!tracker.record("web", start + RESTART_WINDOW + Duration::from_secs(2)));

        tracker.forget("web");
        assert!(!tracker.record("web", start + RESTART_WINDOW * 2));
    }
}
