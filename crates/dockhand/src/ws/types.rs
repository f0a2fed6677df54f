//! Control channel wire types.
//!
//! Every frame is a JSON envelope `{type, payload, correlationId}`. The `type`
//! tag is drawn from the closed [`MessageType`] set; each tag belongs to
//! exactly one [`Family`] by the prefix table below.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Message types
// ============================================================================

/// Protocol version of the tag set below.
pub const PROTOCOL_VERSION: u32 = 1;

/// Closed set of envelope tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    // ========== System ==========
    Heartbeat,
    TestNotify,
    TestNotifyResponse,
    Error,
    CancelOperation,

    // ========== Container ==========
    ContainerList,
    ContainerDetail,
    ContainerStart,
    ContainerStop,
    ContainerRestart,
    ContainerDelete,
    ContainerCreate,
    ContainerUpdate,
    ContainerLogs,
    ContainerStats,
    ContainerOperationResult,
    ContainerStateChange,

    // ========== Image / pull ==========
    PullImage,
    PullStart,
    PullProgress,
    PullComplete,
    CancelPull,
    ImageList,
    ImageDetail,
    ImageDelete,
    ImageUpdate,
    ImageBatchUpdate,
    ImageCancelPull,
    ImageCheckUpdates,
    ImageOperationResult,

    // ========== Install / network / import ==========
    InstallCheckImages,
    InstallValidate,
    InstallStart,
    InstallProgress,
    InstallLog,
    InstallStartResult,
    NetworkList,
    ImportTemplate,
    ImportTemplateResult,
}

/// Who may send a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server only.
    Request,
    /// Server to client only.
    Event,
    /// Sent by clients and echoed back under the same tag.
    Both,
}

impl MessageType {
    pub const ALL: &'static [MessageType] = &[
        MessageType::Heartbeat,
        MessageType::TestNotify,
        MessageType::TestNotifyResponse,
        MessageType::Error,
        MessageType::CancelOperation,
        MessageType::ContainerList,
        MessageType::ContainerDetail,
        MessageType::ContainerStart,
        MessageType::ContainerStop,
        MessageType::ContainerRestart,
        MessageType::ContainerDelete,
        MessageType::ContainerCreate,
        MessageType::ContainerUpdate,
        MessageType::ContainerLogs,
        MessageType::ContainerStats,
        MessageType::ContainerOperationResult,
        MessageType::ContainerStateChange,
        MessageType::PullImage,
        MessageType::PullStart,
        MessageType::PullProgress,
        MessageType::PullComplete,
        MessageType::CancelPull,
        MessageType::ImageList,
        MessageType::ImageDetail,
        MessageType::ImageDelete,
        MessageType::ImageUpdate,
        MessageType::ImageBatchUpdate,
        MessageType::ImageCancelPull,
        MessageType::ImageCheckUpdates,
        MessageType::ImageOperationResult,
        MessageType::InstallCheckImages,
        MessageType::InstallValidate,
        MessageType::InstallStart,
        MessageType::InstallProgress,
        MessageType::InstallLog,
        MessageType::InstallStartResult,
        MessageType::NetworkList,
        MessageType::ImportTemplate,
        MessageType::ImportTemplateResult,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::TestNotify => "TEST_NOTIFY",
            MessageType::TestNotifyResponse => "TEST_NOTIFY_RESPONSE",
            MessageType::Error => "ERROR",
            MessageType::CancelOperation => "CANCEL_OPERATION",
            MessageType::ContainerList => "CONTAINER_LIST",
            MessageType::ContainerDetail => "CONTAINER_DETAIL",
            MessageType::ContainerStart => "CONTAINER_START",
            MessageType::ContainerStop => "CONTAINER_STOP",
            MessageType::ContainerRestart => "CONTAINER_RESTART",
            MessageType::ContainerDelete => "CONTAINER_DELETE",
            MessageType::ContainerCreate => "CONTAINER_CREATE",
            MessageType::ContainerUpdate => "CONTAINER_UPDATE",
            MessageType::ContainerLogs => "CONTAINER_LOGS",
            MessageType::ContainerStats => "CONTAINER_STATS",
            MessageType::ContainerOperationResult => "CONTAINER_OPERATION_RESULT",
            MessageType::ContainerStateChange => "CONTAINER_STATE_CHANGE",
            MessageType::PullImage => "PULL_IMAGE",
            MessageType::PullStart => "PULL_START",
            MessageType::PullProgress => "PULL_PROGRESS",
            MessageType::PullComplete => "PULL_COMPLETE",
            MessageType::CancelPull => "CANCEL_PULL",
            MessageType::ImageList => "IMAGE_LIST",
            MessageType::ImageDetail => "IMAGE_DETAIL",
            MessageType::ImageDelete => "IMAGE_DELETE",
            MessageType::ImageUpdate => "IMAGE_UPDATE",
            MessageType::ImageBatchUpdate => "IMAGE_BATCH_UPDATE",
            MessageType::ImageCancelPull => "IMAGE_CANCEL_PULL",
            MessageType::ImageCheckUpdates => "IMAGE_CHECK_UPDATES",
            MessageType::ImageOperationResult => "IMAGE_OPERATION_RESULT",
            MessageType::InstallCheckImages => "INSTALL_CHECK_IMAGES",
            MessageType::InstallValidate => "INSTALL_VALIDATE",
            MessageType::InstallStart => "INSTALL_START",
            MessageType::InstallProgress => "INSTALL_PROGRESS",
            MessageType::InstallLog => "INSTALL_LOG",
            MessageType::InstallStartResult => "INSTALL_START_RESULT",
            MessageType::NetworkList => "NETWORK_LIST",
            MessageType::ImportTemplate => "IMPORT_TEMPLATE",
            MessageType::ImportTemplateResult => "IMPORT_TEMPLATE_RESULT",
        }
    }

    pub fn direction(&self) -> Direction {
        use MessageType::*;
        match self {
            Heartbeat | Error | ContainerList | ContainerDetail | ContainerLogs
            | ContainerStats | ImageList | ImageDetail | ImageCheckUpdates
            | InstallCheckImages | InstallValidate | NetworkList => Direction::Both,

            TestNotify | CancelOperation | ContainerStart | ContainerStop | ContainerRestart
            | ContainerDelete | ContainerCreate | ContainerUpdate | PullImage | CancelPull
            | ImageDelete | ImageUpdate | ImageBatchUpdate | ImageCancelPull | InstallStart
            | ImportTemplate => Direction::Request,

            TestNotifyResponse | ContainerOperationResult | ContainerStateChange | PullStart
            | PullProgress | PullComplete | ImageOperationResult | InstallProgress
            | InstallLog | InstallStartResult | ImportTemplateResult => Direction::Event,
        }
    }

    /// Tag of the single result a request is answered with.
    pub fn reply_type(&self) -> MessageType {
        use MessageType::*;
        match self {
            ContainerStart | ContainerStop | ContainerRestart | ContainerDelete
            | ContainerCreate | ContainerUpdate => ContainerOperationResult,
            ImageDelete => ImageOperationResult,
            ImportTemplate => ImportTemplateResult,
            TestNotify => TestNotifyResponse,
            InstallStart => InstallStartResult,
            PullImage | ImageUpdate | ImageBatchUpdate => PullComplete,
            other => *other,
        }
    }

    /// Whether clients may send this tag.
    pub fn is_inbound(&self) -> bool {
        !matches!(self.direction(), Direction::Event)
    }

    pub fn family(&self) -> Family {
        // Validated exhaustive at startup; System is never reached for a
        // listed tag.
        classify(self.as_str()).unwrap_or(Family::System)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown message type '{s}'"))
    }
}

// ============================================================================
// Families
// ============================================================================

/// Handler group a tag is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Container,
    Image,
    /// Install pipeline, app store, networks and template import.
    App,
    System,
}

impl Family {
    pub const ALL: &'static [Family] = &[Family::Container, Family::Image, Family::App, Family::System];
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Family::Container => "container",
            Family::Image => "image",
            Family::App => "app",
            Family::System => "system",
        };
        f.write_str(name)
    }
}

/// Prefix to family table. A tag belongs to every family whose prefix it
/// starts with; [`validate_routing_table`] requires that to be exactly one.
pub const PREFIX_TABLE: &[(&str, Family)] = &[
    ("CONTAINER_", Family::Container),
    ("IMAGE_", Family::Image),
    ("PULL_", Family::Image),
    ("CANCEL_PULL", Family::Image),
    ("INSTALL_", Family::App),
    ("NETWORK_", Family::App),
    ("IMPORT_", Family::App),
    ("HEARTBEAT", Family::System),
    ("TEST_", Family::System),
    ("ERROR", Family::System),
    ("CANCEL_OPERATION", Family::System),
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("no family for message type '{0}'")]
    Unmapped(String),

    #[error("message type '{tag}' matches several families: {families:?}")]
    Ambiguous { tag: String, families: Vec<Family> },
}

/// Classify a raw tag by prefix.
pub fn classify(tag: &str) -> Result<Family, RoutingError> {
    let families: Vec<Family> = PREFIX_TABLE
        .iter()
        .filter(|(prefix, _)| tag.starts_with(prefix))
        .map(|(_, family)| *family)
        .collect();
    match families.as_slice() {
        [] => Err(RoutingError::Unmapped(tag.to_string())),
        [one] => Ok(*one),
        _ => Err(RoutingError::Ambiguous {
            tag: tag.to_string(),
            families,
        }),
    }
}

/// Check that every known tag maps to exactly one family.
pub fn validate_routing_table() -> Result<(), Vec<RoutingError>> {
    let errors: Vec<RoutingError> = MessageType::ALL
        .iter()
        .filter_map(|t| classify(t.as_str()).err())
        .collect();
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

// ============================================================================
// Envelopes
// ============================================================================

/// Frame as received. The tag stays a string so unknown tags can be reported.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, alias = "data")]
    pub payload: Value,

    #[serde(default, alias = "taskId")]
    pub correlation_id: Option<String>,
}

impl InboundEnvelope {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// `payload.operationId`, else the correlation id.
    pub fn operation_id(&self) -> Option<String> {
        self.payload
            .get("operationId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| self.correlation_id.clone().filter(|s| !s.is_empty()))
    }
}

/// Frame as sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,

    #[serde(default)]
    pub payload: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
}

impl Envelope {
    pub fn new(kind: MessageType, payload: Value) -> Self {
        Self {
            kind,
            payload,
            correlation_id: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// `ERROR` envelope. `operation_id` is included when known.
    pub fn error(message: impl Into<String>, operation_id: Option<&str>) -> Self {
        let mut payload = Map::new();
        payload.insert("message".to_string(), Value::String(message.into()));
        if let Some(id) = operation_id {
            payload.insert("operationId".to_string(), Value::String(id.to_string()));
            payload.insert("phase".to_string(), json!(Phase::Error));
        }
        Self::new(MessageType::Error, Value::Object(payload))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// `payload.operationId` if present.
    pub fn operation_id(&self) -> Option<&str> {
        self.payload.get("operationId").and_then(Value::as_str)
    }

    /// `payload.phase` if present.
    pub fn phase(&self) -> Option<Phase> {
        self.payload
            .get("phase")
            .and_then(|p| serde_json::from_value(p.clone()).ok())
    }
}

// ============================================================================
// Progress phases
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Start,
    Progress,
    Complete,
    Error,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Error | Phase::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_table_is_exhaustive() {
        assert_eq!(validate_routing_table(), Ok(()));
    }

    #[test]
    fn serde_names_match_tags() {
        for tag in MessageType::ALL {
            let encoded = serde_json::to_value(tag).unwrap();
            assert_eq!(encoded, Value::String(tag.as_str().to_string()));
            assert_eq!(tag.as_str().parse::<MessageType>().unwrap(), *tag);
        }
    }

    #[test]
    fn families_follow_prefixes() {
        assert_eq!(MessageType::ContainerStop.family(), Family::Container);
        assert_eq!(MessageType::PullProgress.family(), Family::Image);
        assert_eq!(MessageType::CancelPull.family(), Family::Image);
        assert_eq!(MessageType::ImageCancelPull.family(), Family::Image);
        assert_eq!(MessageType::NetworkList.family(), Family::App);
        assert_eq!(MessageType::ImportTemplate.family(), Family::App);
        assert_eq!(MessageType::CancelOperation.family(), Family::System);
        assert_eq!(MessageType::TestNotifyResponse.family(), Family::System);
        assert!(matches!(classify("VOLUME_LIST"), Err(RoutingError::Unmapped(_))));
    }

    #[test]
    fn requests_reply_with_an_event_tag() {
        for tag in MessageType::ALL.iter().filter(|t| t.direction() == Direction::Request) {
            if matches!(tag, MessageType::CancelOperation | MessageType::CancelPull | MessageType::ImageCancelPull) {
                continue;
            }
            assert!(!tag.reply_type().is_inbound(), "{tag} replies with {}", tag.reply_type());
        }
        assert_eq!(MessageType::ContainerRestart.reply_type(), MessageType::ContainerOperationResult);
        assert_eq!(MessageType::ContainerList.reply_type(), MessageType::ContainerList);
    }

    #[test]
    fn inbound_accepts_aliases() {
        let env = InboundEnvelope::decode(
            r#"{"type":"CONTAINER_STOP","data":{"containerId":"abc"},"taskId":"t-1"}"#,
        )
        .unwrap();
        assert_eq!(env.kind, "CONTAINER_STOP");
        assert_eq!(env.payload["containerId"], "abc");
        assert_eq!(env.operation_id().as_deref(), Some("t-1"));

        let env = InboundEnvelope::decode(
            r#"{"type":"PULL_IMAGE","payload":{"operationId":"op-9"},"correlationId":"c"}"#,
        )
        .unwrap();
        assert_eq!(env.operation_id().as_deref(), Some("op-9"));

        let env = InboundEnvelope::decode(r#"{"type":"HEARTBEAT"}"#).unwrap();
        assert!(env.payload.is_null());
        assert_eq!(env.operation_id(), None);
    }

    #[test]
    fn error_envelope_carries_operation() {
        let env = Envelope::error("boom", Some("op-1"));
        let json: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "ERROR");
        assert_eq!(json["payload"]["operationId"], "op-1");
        assert_eq!(json["payload"]["phase"], "error");
        assert!(json["timestamp"].as_i64().unwrap() > 0);
        assert!(json.get("correlationId").is_none());
    }
}
