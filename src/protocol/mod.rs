//! Control-plane message contract
//!
//! Every control message travels in the same envelope:
//! `{dest, type, sender, scope, body}`. The `type` string selects a
//! [`MessageKind`] variant and `body` carries its payload. Parsing happens once,
//! at the boundary; everything past it matches on the typed enum.
//!
//! The registration contract between a node and the processes it launches is
//! also defined here, independent of any particular transport.

use std::path::PathBuf;

use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as Json;
use thiserror::Error;

use crate::config::EdgeDescriptor;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed control message: {0}")]
    Malformed(String),

    #[error("Unknown control message type '{0}'")]
    UnknownType(String),

    #[error("Invalid body for {kind}: {reason}")]
    InvalidBody { kind: String, reason: String },
}

/// Which part of the hierarchy a message addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
    Stage,
    Pipeline,
    StageInstance,
    Node,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipeAction {
    Start,
    Pause,
    Terminate,
}

/// Pipeline lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipeStatus {
    Init,
    Ready,
    Running,
    Paused,
    PendingTermination,
    Completed,
}

/// Queue wiring pushed to a stage instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueUpdate {
    pub stage_id: String,
    pub segment_dir: PathBuf,
    #[serde(default)]
    pub inbound: Vec<EdgeDescriptor>,
    #[serde(default)]
    pub outbound: Vec<EdgeDescriptor>,
    /// Pipeline sink, used by stages without outbound edges
    #[serde(default)]
    pub sink: Option<EdgeDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    QUpdate(QueueUpdate),
    ConfigUpdate(Json),
    RegistrationInfo { instance_id: u32 },
    RequestTermination,
    PipeControl { action: PipeAction },
    PipeStatus { status: PipeStatus },
}

impl MessageKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            MessageKind::QUpdate(_) => "Q_UPDATE",
            MessageKind::ConfigUpdate(_) => "CONFIG_UPDATE",
            MessageKind::RegistrationInfo { .. } => "REGISTRATION_INFO",
            MessageKind::RequestTermination => "REQUEST_TERMINATION",
            MessageKind::PipeControl { .. } => "PIPE_CONTROL",
            MessageKind::PipeStatus { .. } => "PIPE_STATUS",
        }
    }

    fn body(&self) -> Result<Json, serde_json::Error> {
        Ok(match self {
            MessageKind::QUpdate(update) => serde_json::to_value(update)?,
            MessageKind::ConfigUpdate(config) => config.clone(),
            MessageKind::RegistrationInfo { instance_id } => {
                serde_json::json!({ "instance_id": instance_id })
            }
            MessageKind::RequestTermination => Json::Null,
            MessageKind::PipeControl { action } => serde_json::json!({ "action": action }),
            MessageKind::PipeStatus { status } => serde_json::json!({ "status": status }),
        })
    }

    fn parse(type_name: &str, body: Json) -> Result<Self, ProtocolError> {
        #[derive(Deserialize)]
        struct Registration {
            instance_id: u32,
        }
        #[derive(Deserialize)]
        struct Control {
            action: PipeAction,
        }
        #[derive(Deserialize)]
        struct Status {
            status: PipeStatus,
        }

        let invalid = |e: serde_json::Error| ProtocolError::InvalidBody {
            kind: type_name.to_string(),
            reason: e.to_string(),
        };

        match type_name {
            "Q_UPDATE" => Ok(MessageKind::QUpdate(
                serde_json::from_value(body).map_err(invalid)?,
            )),
            "CONFIG_UPDATE" => Ok(MessageKind::ConfigUpdate(body)),
            "REGISTRATION_INFO" => {
                let r: Registration = serde_json::from_value(body).map_err(invalid)?;
                Ok(MessageKind::RegistrationInfo {
                    instance_id: r.instance_id,
                })
            }
            "REQUEST_TERMINATION" => Ok(MessageKind::RequestTermination),
            "PIPE_CONTROL" => {
                let c: Control = serde_json::from_value(body).map_err(invalid)?;
                Ok(MessageKind::PipeControl { action: c.action })
            }
            "PIPE_STATUS" => {
                let s: Status = serde_json::from_value(body).map_err(invalid)?;
                Ok(MessageKind::PipeStatus { status: s.status })
            }
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// Addressed control message
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub dest: String,
    pub sender: String,
    pub scope: Scope,
    pub kind: MessageKind,
}

/// Wire shape of the envelope
#[derive(Serialize, Deserialize)]
struct Envelope {
    dest: String,
    #[serde(rename = "type")]
    kind: String,
    sender: String,
    scope: Scope,
    #[serde(default)]
    body: Json,
}

impl ControlMessage {
    pub fn new(
        dest: impl Into<String>,
        sender: impl Into<String>,
        scope: Scope,
        kind: MessageKind,
    ) -> Self {
        Self {
            dest: dest.into(),
            sender: sender.into(),
            scope,
            kind,
        }
    }

    pub fn request_termination(dest: impl Into<String>, sender: impl Into<String>) -> Self {
        Self::new(dest, sender, Scope::StageInstance, MessageKind::RequestTermination)
    }

    pub fn pipe_status(pipe_id: impl Into<String>, status: PipeStatus) -> Self {
        let pipe_id = pipe_id.into();
        Self::new(
            pipe_id.clone(),
            pipe_id,
            Scope::Pipeline,
            MessageKind::PipeStatus { status },
        )
    }

    pub fn pipe_control(pipe_id: impl Into<String>, sender: impl Into<String>, action: PipeAction) -> Self {
        Self::new(pipe_id, sender, Scope::Pipeline, MessageKind::PipeControl { action })
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Self::from_envelope(envelope)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let kind = MessageKind::parse(&envelope.kind, envelope.body)?;
        Ok(Self {
            dest: envelope.dest,
            sender: envelope.sender,
            scope: envelope.scope,
            kind,
        })
    }

    fn to_envelope(&self) -> Result<Envelope, serde_json::Error> {
        Ok(Envelope {
            dest: self.dest.clone(),
            kind: self.kind.type_name().to_string(),
            sender: self.sender.clone(),
            scope: self.scope,
            body: self.kind.body()?,
        })
    }
}

impl Serialize for ControlMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_envelope()
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ControlMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let envelope = Envelope::deserialize(deserializer)?;
        Self::from_envelope(envelope).map_err(D::Error::custom)
    }
}

// ============================================================================
// Registration / transport contract
// ============================================================================

/// Identifies the stage a freshly started process belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRef {
    pub pipe_id: String,
    pub stage_id: String,
}

impl StageRef {
    pub fn new(pipe_id: impl Into<String>, stage_id: impl Into<String>) -> Self {
        Self {
            pipe_id: pipe_id.into(),
            stage_id: stage_id.into(),
        }
    }
}

/// Reply to `register_stage`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub instance_id: u32,
    pub config: Json,
    /// `REGISTRATION_INFO` followed by `Q_UPDATE`
    pub messages: Vec<ControlMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Node,
}

/// Reply to `load_pipe`: who now hosts the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub name: String,
    pub id: String,
    pub kind: ServerKind,
    pub pid: u32,
}

/// Reply to `push_queue`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_shape() {
        let msg = ControlMessage::pipe_control("p1", "cli", PipeAction::Pause);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "dest": "p1",
                "type": "PIPE_CONTROL",
                "sender": "cli",
                "scope": "PIPELINE",
                "body": {"action": "PAUSE"}
            })
        );
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        let kinds = vec![
            MessageKind::QUpdate(QueueUpdate {
                stage_id: "a".to_string(),
                segment_dir: PathBuf::from("/dev/shm"),
                inbound: vec![EdgeDescriptor::new("p", "a").with_size(4096)],
                outbound: vec![],
                sink: None,
            }),
            MessageKind::ConfigUpdate(json!({"threshold": 3})),
            MessageKind::RegistrationInfo { instance_id: 4 },
            MessageKind::RequestTermination,
            MessageKind::PipeControl {
                action: PipeAction::Terminate,
            },
            MessageKind::PipeStatus {
                status: PipeStatus::PendingTermination,
            },
        ];

        for kind in kinds {
            let msg = ControlMessage::new("d", "s", Scope::Stage, kind);
            let text = msg.to_json().unwrap();
            assert_eq!(ControlMessage::from_json(&text).unwrap(), msg);
        }
    }

    #[test]
    fn test_termination_without_body() {
        let text = r#"{"dest": "a", "type": "REQUEST_TERMINATION", "sender": "node", "scope": "STAGE_INSTANCE"}"#;
        let msg = ControlMessage::from_json(text).unwrap();
        assert_eq!(msg.kind, MessageKind::RequestTermination);
        assert_eq!(msg.scope, Scope::StageInstance);
    }

    #[test]
    fn test_unknown_type() {
        let text = r#"{"dest": "a", "type": "REBOOT", "sender": "x", "scope": "NODE", "body": null}"#;
        assert!(matches!(
            ControlMessage::from_json(text),
            Err(ProtocolError::UnknownType(t)) if t == "REBOOT"
        ));
    }

    #[test]
    fn test_bad_body() {
        let text = r#"{"dest": "a", "type": "PIPE_CONTROL", "sender": "x", "scope": "PIPELINE", "body": {"action": "EXPLODE"}}"#;
        assert!(matches!(
            ControlMessage::from_json(text),
            Err(ProtocolError::InvalidBody { .. })
        ));
    }

    #[test]
    fn test_not_json() {
        assert!(matches!(
            ControlMessage::from_json("{nope"),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
