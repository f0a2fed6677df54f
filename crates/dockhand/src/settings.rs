//! Process-wide runtime settings.
//!
//! A [`SettingsCell`] holds the current value behind a watch channel: readers
//! call [`SettingsCell::get`] at the moment they need the value, and
//! background tasks can [`SettingsCell::subscribe`] to react to changes.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Outbound network settings for engine and registry calls: an HTTP proxy
/// and the registry mirrors image pulls fall back to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxySetting {
    pub url: Option<String>,
    pub mirror_urls: Vec<String>,
}

impl ProxySetting {
    pub fn new(url: Option<String>) -> Self {
        Self {
            url: url.filter(|u| !u.trim().is_empty()),
            mirror_urls: Vec::new(),
        }
    }

    pub fn with_mirrors(mut self, mirrors: impl IntoIterator<Item = String>) -> Self {
        self.mirror_urls = mirrors
            .into_iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(ref url) = self.url {
            let parsed =
                Url::parse(url).map_err(|e| format!("invalid proxy url '{url}': {e}"))?;
            if !matches!(parsed.scheme(), "http" | "https" | "socks5" | "socks5h") {
                return Err(format!(
                    "proxy url '{url}' must use http, https or socks5"
                ));
            }
            if parsed.host_str().is_none_or(str::is_empty) {
                return Err(format!("proxy url '{url}' has no host"));
            }
        }
        for mirror in &self.mirror_urls {
            mirror_host(mirror)?;
        }
        Ok(())
    }

    /// Mirror registries as `host[:port][/path]`, in configured order.
    /// Entries that do not parse are skipped.
    pub fn mirror_hosts(&self) -> Vec<String> {
        self.mirror_urls
            .iter()
            .filter_map(|m| mirror_host(m).ok())
            .collect()
    }
}

/// Normalize a mirror entry. A bare host is taken as https.
pub fn mirror_host(raw: &str) -> Result<String, String> {
    let raw = raw.trim();
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    let parsed =
        Url::parse(&with_scheme).map_err(|e| format!("invalid mirror url '{raw}': {e}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(format!("mirror url '{raw}' must use http or https"));
    }
    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| format!("mirror url '{raw}' has no host"))?;
    let mut out = host.to_string();
    if let Some(port) = parsed.port() {
        out.push_str(&format!(":{port}"));
    }
    let path = parsed.path().trim_matches('/');
    if !path.is_empty() {
        out.push('/');
        out.push_str(path);
    }
    Ok(out)
}

/// Shared, observable configuration value.
#[derive(Debug)]
pub struct SettingsCell<T> {
    tx: watch::Sender<T>,
}

impl<T> SettingsCell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replace the value. Returns false when it was unchanged, in which case
    /// subscribers are not woken.
    pub fn set(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

pub type ProxyCell = Arc<SettingsCell<ProxySetting>>;
