//! Engine-facing data types and input validation.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::error::{EngineError, EngineResult};

/// Accept either a JSON string or a JSON integer (podman reports unix timestamps).
fn string_or_int<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Signed(i64),
        Unsigned(u64),
        Float(f64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Signed(n) => n.to_string(),
        Raw::Unsigned(n) => n.to_string(),
        Raw::Float(n) => n.to_string(),
    })
}

/// Docker prints `Names` as a comma separated string, podman as an array.
fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::One(s) => s
            .split(',')
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect(),
        Raw::Many(v) => v,
    })
}

/// Parse `--format json` output, which is a JSON array (podman) or one
/// object per line (docker).
pub fn parse_json_records<T>(stdout: &str) -> EngineResult<Vec<T>>
where
    T: for<'de> Deserialize<'de>,
{
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| EngineError::ParseError(e.to_string()));
    }
    trimmed
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| EngineError::ParseError(e.to_string())))
        .collect()
}

/// Container state as reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ContainerState {
    /// Status string stored in the persisted mirror.
    ///
    /// `exited` and `dead` both collapse to `stopped`.
    pub fn record_status(&self) -> &'static str {
        match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Removing => "removing",
            ContainerState::Exited | ContainerState::Dead => "stopped",
            ContainerState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Removing => "removing",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
            ContainerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Container summary from `ps --format json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase", deserialize = "PascalCase"))]
pub struct Container {
    #[serde(alias = "ID")]
    pub id: String,

    #[serde(default, deserialize_with = "string_or_seq")]
    pub names: Vec<String>,

    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub state: ContainerState,

    /// Human status, e.g. "Up 5 minutes".
    #[serde(default)]
    pub status: String,

    /// Podman reports a unix timestamp here, docker omits it.
    #[serde(default, deserialize_with = "string_or_int")]
    pub created: String,

    #[serde(default)]
    pub created_at: String,
}

impl Container {
    /// Primary name without the leading slash docker sometimes adds.
    pub fn name(&self) -> &str {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/'))
            .unwrap_or("")
    }
}

/// Container resource statistics from `stats --no-stream --format json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase", deserialize = "PascalCase"))]
pub struct ContainerStats {
    #[serde(alias = "Container", alias = "id")]
    pub container_id: String,

    #[serde(default, alias = "name")]
    pub name: String,

    #[serde(default, alias = "CPUPerc", alias = "cpu_percent")]
    pub cpu_percent: String,

    #[serde(default, alias = "mem_usage")]
    pub mem_usage: String,

    #[serde(default, alias = "MemPerc", alias = "mem_percent")]
    pub mem_percent: String,

    #[serde(default, alias = "NetIO", alias = "net_io")]
    pub net_io: String,

    #[serde(default, alias = "BlockIO", alias = "block_io")]
    pub block_io: String,

    #[serde(default, alias = "PIDs", alias = "pids", deserialize_with = "string_or_int")]
    pub pids: String,
}

/// Local image summary from `images --format json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase", deserialize = "PascalCase"))]
pub struct ImageSummary {
    #[serde(alias = "ID")]
    pub id: String,

    #[serde(default)]
    pub repository: String,

    #[serde(default)]
    pub tag: String,

    #[serde(default, deserialize_with = "string_or_int")]
    pub size: String,

    #[serde(default)]
    pub created_at: String,
}

/// Network summary from `network ls --format json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase", deserialize = "PascalCase"))]
pub struct NetworkSummary {
    #[serde(alias = "ID", alias = "id")]
    pub id: String,

    #[serde(alias = "name")]
    pub name: String,

    #[serde(default, alias = "driver")]
    pub driver: String,

    #[serde(default, alias = "scope")]
    pub scope: String,
}

/// Host-to-container port publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub host_ip: Option<String>,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
}

impl PortMapping {
    pub fn new(host_port: u16, container_port: u16) -> Self {
        Self {
            host_ip: None,
            host_port,
            container_port,
            protocol: "tcp".to_string(),
        }
    }

    /// Value for `-p`.
    pub fn to_arg(&self) -> String {
        let mut arg = match self.host_ip {
            Some(ref ip) => format!("{}:{}:{}", ip, self.host_port, self.container_port),
            None => format!("{}:{}", self.host_port, self.container_port),
        };
        if self.protocol != "tcp" {
            arg.push('/');
            arg.push_str(&self.protocol);
        }
        arg
    }
}

impl FromStr for PortMapping {
    type Err = EngineError;

    /// Accepts `host:container`, `ip:host:container`, each with an optional
    /// `/tcp` or `/udp` suffix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EngineError::InvalidInput(format!("invalid port mapping '{s}'"));
        let (spec, protocol) = match s.rsplit_once('/') {
            Some((spec, proto @ ("tcp" | "udp"))) => (spec, proto.to_string()),
            Some(_) => return Err(invalid()),
            None => (s, "tcp".to_string()),
        };
        let parts: Vec<&str> = spec.split(':').collect();
        let (host_ip, host, container) = match parts.as_slice() {
            [host, container] => (None, *host, *container),
            [ip, host, container] if !ip.is_empty() => (Some(ip.to_string()), *host, *container),
            _ => return Err(invalid()),
        };
        let host_port: u16 = host.parse().map_err(|_| invalid())?;
        let container_port: u16 = container.parse().map_err(|_| invalid())?;
        if host_port == 0 || container_port == 0 {
            return Err(invalid());
        }
        Ok(Self {
            host_ip,
            host_port,
            container_port,
            protocol,
        })
    }
}

/// Configuration for creating a new container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub name: Option<String>,
    pub image: String,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub ports: Vec<PortMapping>,
    /// Volume mounts (host path or named volume -> container path).
    pub volumes: Vec<(String, String)>,
    pub restart_policy: Option<String>,
    pub network: Option<String>,
    pub labels: HashMap<String, String>,
}

impl ContainerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.push(PortMapping::new(host_port, container_port));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn volume(mut self, host: impl Into<String>, container: impl Into<String>) -> Self {
        self.volumes.push((host.into(), container.into()));
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Validate every field before it is turned into engine arguments.
    pub fn validate(&self) -> EngineResult<()> {
        validate_image_name(&self.image)?;
        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }
        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }
        for (host, container) in &self.volumes {
            validate_volume_source(host)?;
            validate_container_path(container)?;
        }
        if let Some(ref policy) = self.restart_policy {
            validate_restart_policy(policy)?;
        }
        if let Some(ref network) = self.network {
            validate_container_name(network)?;
        }
        Ok(())
    }
}

/// Container description as it arrives from clients and templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerSpec {
    #[serde(rename = "containerName", alias = "name")]
    pub name: Option<String>,
    pub image: String,
    pub ports: Vec<String>,
    pub env: HashMap<String, String>,
    pub volumes: Vec<String>,
    pub command: Vec<String>,
    pub restart_policy: Option<String>,
    pub network: Option<String>,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    pub fn to_config(&self) -> EngineResult<ContainerConfig> {
        let ports = self
            .ports
            .iter()
            .map(|p| p.parse())
            .collect::<EngineResult<Vec<PortMapping>>>()?;
        let volumes = self
            .volumes
            .iter()
            .map(|v| parse_volume(v))
            .collect::<EngineResult<Vec<_>>>()?;

        let config = ContainerConfig {
            name: self.name.clone(),
            image: self.image.clone(),
            command: self.command.clone(),
            env: self.env.clone(),
            ports,
            volumes,
            restart_policy: self.restart_policy.clone(),
            network: self.network.clone(),
            labels: self.labels.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// In-place resource and policy update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerUpdate {
    pub restart_policy: Option<String>,
    /// Memory limit such as `512m` or `1g`.
    pub memory: Option<String>,
    pub cpus: Option<f64>,
}

impl ContainerUpdate {
    pub fn is_empty(&self) -> bool {
        self.restart_policy.is_none() && self.memory.is_none() && self.cpus.is_none()
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.is_empty() {
            return Err(EngineError::InvalidInput(
                "update must set restartPolicy, memory or cpus".to_string(),
            ));
        }
        if let Some(ref policy) = self.restart_policy {
            validate_restart_policy(policy)?;
        }
        if let Some(ref memory) = self.memory
            && !MEMORY_RE.is_match(memory)
        {
            return Err(EngineError::InvalidInput(format!(
                "invalid memory limit '{memory}'"
            )));
        }
        if let Some(cpus) = self.cpus
            && !(cpus > 0.0 && cpus.is_finite())
        {
            return Err(EngineError::InvalidInput(format!("invalid cpu limit {cpus}")));
        }
        Ok(())
    }
}

// ============================================================================
// Input Validation
// ============================================================================

static IMAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._\-/:@]*$").expect("valid regex"));
static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]*$").expect("valid regex"));
static ENV_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));
static MEMORY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?i)[0-9]+[bkmg]?$").expect("valid regex"));
static RESTART_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(no|always|unless-stopped|on-failure(:[0-9]+)?)$").expect("valid regex")
});

const SHELL_METACHARS: &[char] = &[
    '$', '`', '!', '&', '|', ';', '<', '>', '(', ')', '{', '}', '[', ']', '*', '?', '\\', '"',
    '\'', '\n', '\r', '\0',
];

/// Validate an OCI image reference: `[registry/][namespace/]name[:tag][@digest]`.
pub fn validate_image_name(image: &str) -> EngineResult<()> {
    if image.is_empty() {
        return Err(EngineError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }
    if image.len() > 256 {
        return Err(EngineError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }
    if !IMAGE_RE.is_match(image) || image.contains("..") {
        return Err(EngineError::InvalidInput(format!(
            "image name '{image}' contains invalid characters"
        )));
    }
    Ok(())
}

pub fn validate_container_name(name: &str) -> EngineResult<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(EngineError::InvalidInput(
            "container name must be 1-128 characters".to_string(),
        ));
    }
    if !NAME_RE.is_match(name) {
        return Err(EngineError::InvalidInput(format!(
            "container name '{name}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Container ids are hex and names follow the naming rules, so one check covers both.
pub fn validate_container_id_or_name(id: &str) -> EngineResult<()> {
    validate_container_name(id).map_err(|_| {
        EngineError::InvalidInput(format!("'{id}' is not a valid container id or name"))
    })
}

pub fn validate_env_var_key(key: &str) -> EngineResult<()> {
    if !ENV_KEY_RE.is_match(key) {
        return Err(EngineError::InvalidInput(format!(
            "environment variable name '{key}' is invalid"
        )));
    }
    Ok(())
}

/// Host side of a mount: an absolute path or a named volume.
pub fn validate_volume_source(source: &str) -> EngineResult<()> {
    if source.is_empty() || source.len() > 4096 {
        return Err(EngineError::InvalidInput(
            "volume source must be 1-4096 characters".to_string(),
        ));
    }
    if let Some(c) = source.chars().find(|c| SHELL_METACHARS.contains(c)) {
        return Err(EngineError::InvalidInput(format!(
            "volume source contains forbidden character {c:?}"
        )));
    }
    if !source.starts_with('/') && !NAME_RE.is_match(source) {
        return Err(EngineError::InvalidInput(format!(
            "volume source '{source}' must be an absolute path or a volume name"
        )));
    }
    Ok(())
}

pub fn validate_container_path(path: &str) -> EngineResult<()> {
    if !path.starts_with('/') {
        return Err(EngineError::InvalidInput(format!(
            "container path '{path}' must be absolute"
        )));
    }
    if path.contains('\0') {
        return Err(EngineError::InvalidInput(
            "container path cannot contain null bytes".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_restart_policy(policy: &str) -> EngineResult<()> {
    if !RESTART_RE.is_match(policy) {
        return Err(EngineError::InvalidInput(format!(
            "unknown restart policy '{policy}'"
        )));
    }
    Ok(())
}

/// Split `source:target[:mode]` into its mount halves.
pub fn parse_volume(spec: &str) -> EngineResult<(String, String)> {
    let mut parts = spec.splitn(3, ':');
    match (parts.next(), parts.next()) {
        (Some(host), Some(container)) if !host.is_empty() && !container.is_empty() => {
            Ok((host.to_string(), container.to_string()))
        }
        _ => Err(EngineError::InvalidInput(format!(
            "invalid volume mapping '{spec}'"
        ))),
    }
}

#[cfg(test)]
mod validation_tests {
    use super::*;

    #[test]
    fn test_validate_image_name() {
        assert!(validate_image_name("nginx").is_ok());
        assert!(validate_image_name("nginx:1.27-alpine").is_ok());
        assert!(validate_image_name("ghcr.io/org/app:v1.0").is_ok());
        assert!(validate_image_name("gcr.io/project/image@sha256:abc123").is_ok());

        assert!(validate_image_name("").is_err());
        assert!(validate_image_name("image with spaces").is_err());
        assert!(validate_image_name("nginx;rm -rf /").is_err());
        assert!(validate_image_name("../etc/passwd").is_err());
    }

    #[test]
    fn test_validate_container_name() {
        assert!(validate_container_name("web").is_ok());
        assert!(validate_container_name("my_app-1.web").is_ok());
        assert!(validate_container_name("-leading").is_err());
        assert!(validate_container_name("has space").is_err());
        assert!(validate_container_name(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_validate_volume_source() {
        assert!(validate_volume_source("/srv/data").is_ok());
        assert!(validate_volume_source("pgdata").is_ok());
        assert!(validate_volume_source("relative/path").is_err());
        assert!(validate_volume_source("/srv/$(whoami)").is_err());
    }

    #[test]
    fn test_port_mapping_parse() {
        let p: PortMapping = "8080:80".parse().unwrap();
        assert_eq!(p, PortMapping::new(8080, 80));
        assert_eq!(p.to_arg(), "8080:80");

        let p: PortMapping = "127.0.0.1:5353:53/udp".parse().unwrap();
        assert_eq!(p.host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(p.protocol, "udp");
        assert_eq!(p.to_arg(), "127.0.0.1:5353:53/udp");

        assert!("80".parse::<PortMapping>().is_err());
        assert!("0:80".parse::<PortMapping>().is_err());
        assert!("8080:80/sctp".parse::<PortMapping>().is_err());
    }

    #[test]
    fn test_spec_to_config() {
        let spec = ContainerSpec {
            name: Some("web".to_string()),
            image: "nginx:latest".to_string(),
            ports: vec!["8080:80".to_string()],
            volumes: vec!["/srv/html:/usr/share/nginx/html:ro".to_string()],
            restart_policy: Some("unless-stopped".to_string()),
            ..Default::default()
        };
        let config = spec.to_config().unwrap();
        assert_eq!(config.ports.len(), 1);
        assert_eq!(
            config.volumes[0],
            ("/srv/html".to_string(), "/usr/share/nginx/html".to_string())
        );

        let bad = ContainerSpec {
            image: "nginx".to_string(),
            restart_policy: Some("sometimes".to_string()),
            ..Default::default()
        };
        assert!(bad.to_config().is_err());
    }

    #[test]
    fn test_container_update_validate() {
        assert!(ContainerUpdate::default().validate().is_err());
        let update = ContainerUpdate {
            memory: Some("512m".to_string()),
            cpus: Some(1.5),
            ..Default::default()
        };
        assert!(update.validate().is_ok());
        let update = ContainerUpdate {
            memory: Some("lots".to_string()),
            ..Default::default()
        };
        assert!(update.validate().is_err());
    }

    #[test]
    fn test_parse_container_records() {
        let docker = r#"{"ID":"abc123","Names":"web","Image":"nginx","State":"running","Status":"Up 2 minutes","CreatedAt":"2024-01-01 10:00:00 +0000 UTC"}
{"ID":"def456","Names":"db,db-alias","Image":"postgres","State":"exited","Status":"Exited (0)","CreatedAt":"2024-01-01 09:00:00 +0000 UTC"}"#;
        let containers: Vec<Container> = parse_json_records(docker).unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].name(), "web");
        assert_eq!(containers[1].names.len(), 2);
        assert_eq!(containers[1].state.record_status(), "stopped");

        let podman = r#"[{"Id":"abc","Names":["web"],"Image":"nginx","State":"running","Created":1700000000,"CreatedAt":"2 hours ago"}]"#;
        let containers: Vec<Container> = parse_json_records(podman).unwrap();
        assert_eq!(containers[0].created, "1700000000");
        assert_eq!(containers[0].state, ContainerState::Running);

        assert!(parse_json_records::<Container>("  \n").unwrap().is_empty());
    }
}
