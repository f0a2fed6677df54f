//! Image pull progress reporting.
//!
//! The engine reports one JSON message per layer state change. Layers are
//! downloaded concurrently, so the overall figure is recomputed from every
//! layer seen so far on each update.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One message from the engine's pull stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullEvent {
    /// Layer id for layer messages, tag or empty otherwise.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub progress_detail: Option<ProgressDetail>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProgressDetail {
    pub current: Option<u64>,
    pub total: Option<u64>,
}

impl PullEvent {
    pub fn layer(id: &str, status: &str, current: Option<u64>, total: Option<u64>) -> Self {
        Self {
            id: Some(id.to_string()),
            status: status.to_string(),
            progress_detail: Some(ProgressDetail { current, total }),
            error: None,
        }
    }

    pub fn status(status: &str) -> Self {
        Self {
            status: status.to_string(),
            ..Default::default()
        }
    }

    fn layer_phase(&self) -> Option<LayerPhase> {
        let phase = match self.status.as_str() {
            "Pulling fs layer" | "Waiting" => LayerPhase::Queued,
            "Downloading" => LayerPhase::Downloading,
            "Verifying Checksum" | "Download complete" | "Extracting" => LayerPhase::Downloaded,
            "Pull complete" | "Already exists" => LayerPhase::Done,
            _ => return None,
        };
        Some(phase)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerPhase {
    Queued,
    Downloading,
    Downloaded,
    Done,
}

#[derive(Debug, Clone, Default)]
struct LayerState {
    current: u64,
    total: Option<u64>,
    done: bool,
}

/// Point-in-time view sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullSnapshot {
    pub percent: u8,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub layers_done: usize,
    pub layers_total: usize,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
}

/// Aggregates per-layer progress into a monotonic percentage.
#[derive(Debug, Default)]
pub struct PullProgress {
    layers: HashMap<String, LayerState>,
    percent: u8,
}

impl PullProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one engine message in. Returns `None` for messages that are not
    /// about a layer (banners, digests).
    pub fn apply(&mut self, event: &PullEvent) -> Option<PullSnapshot> {
        let phase = event.layer_phase()?;
        let id = event.id.as_deref().filter(|id| !id.is_empty())?;
        let detail = event.progress_detail.unwrap_or_default();
        let layer = self.layers.entry(id.to_string()).or_default();

        match phase {
            LayerPhase::Queued => {}
            LayerPhase::Downloading => {
                if let Some(total) = detail.total.filter(|t| *t > 0) {
                    layer.total = Some(total);
                }
                if let Some(current) = detail.current {
                    layer.current = layer.current.max(current);
                }
            }
            LayerPhase::Downloaded => {
                if let Some(total) = layer.total {
                    layer.current = total;
                }
            }
            LayerPhase::Done => {
                if let Some(total) = layer.total {
                    layer.current = total;
                }
                layer.done = true;
            }
        }

        let (bytes_done, bytes_total) = self
            .layers
            .values()
            .filter_map(|l| l.total.map(|t| (l.current.min(t), t)))
            .fold((0u64, 0u64), |(d, t), (ld, lt)| (d + ld, t + lt));

        let layers_done = self.layers.values().filter(|l| l.done).count();
        let layers_total = self.layers.len();

        // Without byte counts (CLI pulls) fall back to finished layers.
        // 100 is reserved for the terminal event.
        let computed = if bytes_total > 0 {
            (bytes_done.saturating_mul(100) / bytes_total).min(99) as u8
        } else if layers_total > 0 {
            (layers_done * 100 / layers_total).min(99) as u8
        } else {
            0
        };
        self.percent = self.percent.max(computed);

        Some(PullSnapshot {
            percent: self.percent,
            bytes_done,
            bytes_total,
            layers_done,
            layers_total,
            status: event.status.clone(),
            layer: Some(id.to_string()),
        })
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_bytes_across_layers() {
        let mut progress = PullProgress::new();
        progress.apply(&PullEvent::layer("a", "Downloading", Some(50), Some(100)));
        let snap = progress
            .apply(&PullEvent::layer("b", "Downloading", Some(100), Some(300)))
            .unwrap();
        assert_eq!(snap.bytes_done, 150);
        assert_eq!(snap.bytes_total, 400);
        assert_eq!(snap.percent, 37);
        assert_eq!(snap.layers_total, 2);
    }

    #[test]
    fn percent_never_decreases_when_new_layers_appear() {
        let mut progress = PullProgress::new();
        let first = progress
            .apply(&PullEvent::layer("a", "Downloading", Some(90), Some(100)))
            .unwrap();
        assert_eq!(first.percent, 90);

        // A large layer shows up late and drags the raw ratio down.
        let second = progress
            .apply(&PullEvent::layer("b", "Downloading", Some(1), Some(1000)))
            .unwrap();
        assert_eq!(second.percent, 90);
        assert!(second.bytes_done * 100 / second.bytes_total < 90);
    }

    #[test]
    fn completed_layers_count_as_fully_downloaded() {
        let mut progress = PullProgress::new();
        progress.apply(&PullEvent::layer("a", "Downloading", Some(10), Some(100)));
        let snap = progress
            .apply(&PullEvent::layer("a", "Pull complete", None, None))
            .unwrap();
        assert_eq!(snap.bytes_done, 100);
        assert_eq!(snap.layers_done, 1);
        assert_eq!(snap.percent, 99);
    }

    #[test]
    fn falls_back_to_layer_count_without_sizes() {
        let mut progress = PullProgress::new();
        progress.apply(&PullEvent::layer("a", "Pulling fs layer", None, None));
        progress.apply(&PullEvent::layer("b", "Pulling fs layer", None, None));
        let snap = progress
            .apply(&PullEvent::layer("a", "Pull complete", None, None))
            .unwrap();
        assert_eq!(snap.bytes_total, 0);
        assert_eq!(snap.percent, 50);
    }

    #[test]
    fn ignores_non_layer_messages() {
        let mut progress = PullProgress::new();
        assert!(
            progress
                .apply(&PullEvent::status("Pulling from library/nginx"))
                .is_none()
        );
        assert!(
            progress
                .apply(&PullEvent::status("Digest: sha256:abc"))
                .is_none()
        );
        assert_eq!(progress.percent(), 0);
    }

    #[test]
    fn parses_engine_json() {
        let raw = r#"{"status":"Downloading","progressDetail":{"current":1024,"total":4096},"progress":"[==>  ]","id":"5d3b2c"}"#;
        let event: PullEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.id.as_deref(), Some("5d3b2c"));
        let mut progress = PullProgress::new();
        assert_eq!(progress.apply(&event).unwrap().percent, 25);
    }
}
