//! Container events from the engine's event stream.
//!
//! Docker and Podman print differently shaped JSON for `events`; both are
//! folded into [`EngineEvent`].

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

use super::error::{EngineError, EngineResult};

/// Container lifecycle actions the mirror reacts to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Create,
    Start,
    Stop,
    Kill,
    Die,
    Destroy,
    Rename,
    Restart,
    Pause,
    Unpause,
    Oom,
    HealthStatus,
    Other(String),
}

impl EventAction {
    fn parse(action: &str) -> Self {
        // Docker reports health as "health_status: healthy".
        let head = action.split(':').next().unwrap_or(action).trim();
        match head {
            "create" => EventAction::Create,
            "start" => EventAction::Start,
            "stop" => EventAction::Stop,
            "kill" => EventAction::Kill,
            "die" | "died" => EventAction::Die,
            "destroy" | "remove" => EventAction::Destroy,
            "rename" => EventAction::Rename,
            "restart" => EventAction::Restart,
            "pause" => EventAction::Pause,
            "unpause" => EventAction::Unpause,
            "oom" => EventAction::Oom,
            "health_status" => EventAction::HealthStatus,
            other => EventAction::Other(other.to_string()),
        }
    }
}

/// One container event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineEvent {
    pub action: EventAction,
    pub container_id: String,
    pub name: Option<String>,
    pub image: Option<String>,
    pub exit_code: Option<i32>,
    pub health: Option<String>,
}

impl EngineEvent {
    pub fn new(action: &str, container_id: &str) -> Self {
        Self {
            action: EventAction::parse(action),
            container_id: container_id.to_string(),
            name: None,
            image: None,
            exit_code: None,
            health: None,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Decode one line of `docker events --format '{{json .}}'` or
    /// `podman events --format json`. Non-container events yield `None`.
    pub fn from_json_line(line: &str) -> EngineResult<Option<Self>> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| EngineError::ParseError(e.to_string()))?;

        let kind = field(&value, &["Type", "type"]).unwrap_or("container");
        if !kind.eq_ignore_ascii_case("container") {
            return Ok(None);
        }

        let Some(action) = field(&value, &["Action", "status", "Status"]) else {
            return Ok(None);
        };
        let actor = value.get("Actor");
        let id = actor
            .and_then(|a| a.get("ID"))
            .and_then(Value::as_str)
            .or_else(|| field(&value, &["id", "ID"]));
        let Some(id) = id.filter(|id| !id.is_empty()) else {
            return Ok(None);
        };

        let attributes: HashMap<String, String> = actor
            .and_then(|a| a.get("Attributes"))
            .or_else(|| value.get("Attributes"))
            .and_then(|a| serde_json::from_value(a.clone()).ok())
            .unwrap_or_default();

        let mut event = EngineEvent::new(action, id);
        event.name = attributes
            .get("name")
            .cloned()
            .or_else(|| field(&value, &["Name"]).map(str::to_string));
        event.image = attributes
            .get("image")
            .cloned()
            .or_else(|| field(&value, &["Image", "from"]).map(str::to_string));
        event.exit_code = attributes
            .get("exitCode")
            .and_then(|c| c.parse().ok())
            .or_else(|| {
                value
                    .get("ContainerExitCode")
                    .and_then(Value::as_i64)
                    .map(|c| c as i32)
            });
        event.health = attributes
            .get("health_status")
            .cloned()
            .or_else(|| field(&value, &["HealthStatus"]).map(str::to_string))
            .or_else(|| {
                action
                    .split_once(':')
                    .map(|(_, status)| status.trim().to_string())
            })
            .filter(|h| !h.is_empty());
        Ok(Some(event))
    }

    /// Exit codes other than a clean exit or SIGTERM.
    pub fn is_abnormal_exit(&self) -> bool {
        !matches!(self.exit_code, Some(0) | Some(143))
    }

    /// Human summary of an exit code.
    pub fn exit_reason(&self) -> String {
        match self.exit_code {
            None => "unknown".to_string(),
            Some(0) => "exited normally".to_string(),
            Some(1) => "application error".to_string(),
            Some(125) => "engine failed to run the container".to_string(),
            Some(126) => "command cannot be invoked".to_string(),
            Some(127) => "command not found".to_string(),
            Some(130) => "interrupted".to_string(),
            Some(137) => "killed (SIGKILL)".to_string(),
            Some(143) => "terminated (SIGTERM)".to_string(),
            Some(code) if code > 128 => format!("fatal signal {}", code - 128),
            Some(_) => "application error".to_string(),
        }
    }
}

fn field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_docker_events() {
        let line = r#"{"status":"die","id":"abc123","from":"nginx:latest","Type":"container","Action":"die","Actor":{"ID":"abc123","Attributes":{"exitCode":"137","image":"nginx:latest","name":"web"}},"scope":"local","time":1700000000}"#;
        let event = EngineEvent::from_json_line(line).unwrap().unwrap();
        assert_eq!(event.action, EventAction::Die);
        assert_eq!(event.container_id, "abc123");
        assert_eq!(event.name.as_deref(), Some("web"));
        assert_eq!(event.image.as_deref(), Some("nginx:latest"));
        assert_eq!(event.exit_code, Some(137));
        assert!(event.is_abnormal_exit());
        assert_eq!(event.exit_reason(), "killed (SIGKILL)");
    }

    #[test]
    fn decodes_docker_health_status() {
        let line = r#"{"Type":"container","Action":"health_status: unhealthy","Actor":{"ID":"abc","Attributes":{"name":"web"}}}"#;
        let event = EngineEvent::from_json_line(line).unwrap().unwrap();
        assert_eq!(event.action, EventAction::HealthStatus);
        assert_eq!(event.health.as_deref(), Some("unhealthy"));
    }

    #[test]
    fn decodes_podman_events() {
        let line = r#"{"ID":"def456","Image":"docker.io/library/redis:7","Name":"cache","Status":"start","Type":"container","Attributes":{"image":"docker.io/library/redis:7","name":"cache"}}"#;
        let event = EngineEvent::from_json_line(line).unwrap().unwrap();
        assert_eq!(event.action, EventAction::Start);
        assert_eq!(event.container_id, "def456");
        assert_eq!(event.name.as_deref(), Some("cache"));
    }

    #[test]
    fn skips_non_container_events() {
        let line = r#"{"Type":"network","Action":"connect","Actor":{"ID":"net1"}}"#;
        assert!(EngineEvent::from_json_line(line).unwrap().is_none());
        assert!(EngineEvent::from_json_line("not json").is_err());
    }

    #[test]
    fn clean_exits_are_not_abnormal() {
        let mut event = EngineEvent::new("die", "abc");
        event.exit_code = Some(0);
        assert!(!event.is_abnormal_exit());
        event.exit_code = Some(143);
        assert!(!event.is_abnormal_exit());
        event.exit_code = None;
        assert!(event.is_abnormal_exit());
    }
}
