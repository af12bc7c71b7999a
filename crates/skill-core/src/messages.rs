//! Message bus envelope, event names, and payloads.
//!
//! Command names are the ones other device services already publish; status
//! names cover what the skill manager emits.

use crate::types::{PassReport, SchedulerSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl Message {
    pub fn new(msg_type: impl Into<String>, data: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            data,
            context: Map::new(),
        }
    }

    /// Build a message from a serializable payload.
    pub fn with_payload<T: Serialize>(
        msg_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(msg_type, serde_json::to_value(payload)?))
    }

    /// Reply to this message, swapping source and destination in the context.
    pub fn reply(&self, msg_type: impl Into<String>, data: Value) -> Self {
        let mut context = self.context.clone();
        let source = context.remove("source");
        let destination = context.remove("destination");
        if let Some(source) = source {
            context.insert("destination".to_string(), source);
        }
        if let Some(destination) = destination {
            context.insert("source".to_string(), destination);
        }
        Self {
            msg_type: msg_type.into(),
            data,
            context,
        }
    }

    /// Forward this message's data under a new type, keeping the context.
    pub fn forward(&self, msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            data: self.data.clone(),
            context: self.context.clone(),
        }
    }

    /// Deserialize the data field into a payload type.
    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Commands the skill manager subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Update,
    List,
    Deactivate,
    Keep,
    Activate,
    InternetConnected,
    Paired,
    ConverseRequest,
}

impl Command {
    /// All commands, in subscription order.
    pub const ALL: [Command; 8] = [
        Self::ConverseRequest,
        Self::InternetConnected,
        Self::Update,
        Self::List,
        Self::Deactivate,
        Self::Keep,
        Self::Activate,
        Self::Paired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "skillmanager.update",
            Self::List => "skillmanager.list",
            Self::Deactivate => "skillmanager.deactivate",
            Self::Keep => "skillmanager.keep",
            Self::Activate => "skillmanager.activate",
            Self::InternetConnected => "mycroft.internet.connected",
            Self::Paired => "mycroft.paired",
            Self::ConverseRequest => "skill.converse.request",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

/// Events the skill manager emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    PassStarted,
    PassCompleted,
    PassFailed,
    LocksRemoved,
    SkillsList,
    SkillLoaded,
    SkillLoadingFailure,
    SkillShutdown,
    SkillsInitialized,
    ConverseError,
}

impl StatusEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PassStarted => "skillmanager.pass.started",
            Self::PassCompleted => "skillmanager.pass.completed",
            Self::PassFailed => "skillmanager.pass.failed",
            Self::LocksRemoved => "skillmanager.locks.removed",
            Self::SkillsList => "mycroft.skills.list",
            Self::SkillLoaded => "mycroft.skills.loaded",
            Self::SkillLoadingFailure => "mycroft.skills.loading_failure",
            Self::SkillShutdown => "mycroft.skills.shutdown",
            Self::SkillsInitialized => "mycroft.skills.initialized",
            Self::ConverseError => "skill.converse.error",
        }
    }
}

/// Target name for a converse request forwarded to a skill.
pub fn converse_target(skill_id: &str) -> String {
    format!("{skill_id}.converse.request")
}

// --- Payloads ---

/// Payload for deactivate / activate / keep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillTarget {
    pub skill: String,
}

/// Payload for `skill.converse.request`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConverseRequest {
    pub skill_id: String,
    #[serde(default)]
    pub utterances: Vec<String>,
    #[serde(default)]
    pub lang: Option<String>,
}

/// Payload for `skill.converse.error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConverseErrorPayload {
    pub skill_id: String,
    pub error: String,
}

/// Payload for `skillmanager.pass.started`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassStartedPayload {
    pub pass_id: String,
    pub reason: String,
}

/// Payload for `skillmanager.pass.completed` and `skillmanager.pass.failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassFinishedPayload {
    pub report: PassReport,
}

/// Payload for `skillmanager.locks.removed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocksRemovedPayload {
    pub paths: Vec<String>,
}

/// Payload for `mycroft.skills.loaded`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillLoadedPayload {
    pub path: String,
    pub id: String,
    /// Unix seconds of the newest tracked file in the skill directory.
    pub modified: f64,
}

/// Payload for `mycroft.skills.shutdown` and `mycroft.skills.loading_failure`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillPathPayload {
    pub path: String,
    pub id: String,
}

/// One skill in the `mycroft.skills.list` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillListEntry {
    pub id: String,
    pub active: bool,
    pub loaded: bool,
    pub installed: bool,
    pub pinned: bool,
}

/// Payload for `mycroft.skills.list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillListPayload {
    pub skills: BTreeMap<String, SkillListEntry>,
    /// Installed set as of the last pass, in persisted order.
    pub installed: Vec<String>,
    /// Catalog identifiers as of the last successful fetch.
    pub catalog: Vec<String>,
    pub scheduler: SchedulerSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_serializes_type_field() {
        let msg = Message::new(Command::Update.as_str(), json!({}));
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"skillmanager.update\""));
    }

    #[test]
    fn message_deserializes_without_data_or_context() {
        let msg: Message = serde_json::from_str(r#"{"type": "skillmanager.list"}"#).unwrap();
        assert_eq!(msg.msg_type, "skillmanager.list");
        assert!(msg.data.is_null());
        assert!(msg.context.is_empty());
    }

    #[test]
    fn reply_swaps_source_and_destination() {
        let mut msg = Message::new("skill.converse.request", json!({"skill_id": "x"}));
        msg.context.insert("source".into(), json!("audio"));
        msg.context.insert("destination".into(), json!("skills"));
        msg.context.insert("session".into(), json!("abc"));

        let reply = msg.reply("skill.converse.error", json!({}));
        assert_eq!(reply.context["source"], json!("skills"));
        assert_eq!(reply.context["destination"], json!("audio"));
        assert_eq!(reply.context["session"], json!("abc"));
    }

    #[test]
    fn forward_keeps_data_and_context() {
        let mut msg = Message::new("skill.converse.request", json!({"skill_id": "x"}));
        msg.context.insert("session".into(), json!("abc"));
        let fwd = msg.forward(converse_target("x"));
        assert_eq!(fwd.msg_type, "x.converse.request");
        assert_eq!(fwd.data, msg.data);
        assert_eq!(fwd.context, msg.context);
    }

    #[test]
    fn command_names_round_trip() {
        for command in Command::ALL {
            assert_eq!(Command::from_name(command.as_str()), Some(command));
        }
        assert_eq!(Command::from_name("mycroft.skills.list"), None);
    }

    #[test]
    fn payload_parses_skill_target() {
        let msg = Message::new(Command::Deactivate.as_str(), json!({"skill": "skill-joke"}));
        let target: SkillTarget = msg.payload().unwrap();
        assert_eq!(target.skill, "skill-joke");

        let bad = Message::new(Command::Deactivate.as_str(), json!({}));
        assert!(bad.payload::<SkillTarget>().is_err());
    }

    #[test]
    fn converse_request_defaults_optional_fields() {
        let msg = Message::new(
            Command::ConverseRequest.as_str(),
            json!({"skill_id": "skill-timer"}),
        );
        let req: ConverseRequest = msg.payload().unwrap();
        assert!(req.utterances.is_empty());
        assert!(req.lang.is_none());
    }
}
