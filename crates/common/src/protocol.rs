//! Wire protocol shared by primary and secondary instances.
//!
//! Every frame is one JSON object terminated by `\n`. The `type` field names
//! the operation and the payload fields sit beside it in camelCase:
//!
//! ```text
//! {"type":"RegisterInstance","instanceId":"4242-9917","pid":4242,"workerPid":null}
//! ```
//!
//! Decoding never panics; anything malformed comes back as a [`DecodeError`]
//! so the connection owner can close the offending peer.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Upper bound for a single frame, newline included.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Ordered key/value view of the primary-owned settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedSettings {
    pub version: u64,
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
}

impl SharedSettings {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Copy with `key` set and the version bumped by one.
    pub fn with_value(&self, key: &str, value: Value) -> Self {
        let mut values = self.values.clone();
        values.insert(key.to_string(), value);
        Self {
            version: self.version + 1,
            values,
        }
    }
}

/// `UpdateGlobalSettings` travels in two shapes depending on direction.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingsUpdate {
    /// Secondary asking the primary to set one key.
    Set { key: String, value: Value },
    /// Primary announcing the full mapping after a successful set.
    Broadcast(SharedSettings),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    RegisterInstance {
        instance_id: String,
        pid: u32,
        worker_pid: Option<u32>,
    },
    UnregisterInstance {
        instance_id: String,
    },
    RegisterWorker {
        instance_id: String,
        pid: u32,
    },
    ReleaseWorker {
        instance_id: String,
        pid: u32,
    },
    RequestGlobalSettings,
    GlobalSettingsSnapshot(SharedSettings),
    UpdateGlobalSettings(SettingsUpdate),
    ShutdownAll,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RegisterInstance { .. } => "RegisterInstance",
            Message::UnregisterInstance { .. } => "UnregisterInstance",
            Message::RegisterWorker { .. } => "RegisterWorker",
            Message::ReleaseWorker { .. } => "ReleaseWorker",
            Message::RequestGlobalSettings => "RequestGlobalSettings",
            Message::GlobalSettingsSnapshot(_) => "GlobalSettingsSnapshot",
            Message::UpdateGlobalSettings(_) => "UpdateGlobalSettings",
            Message::ShutdownAll => "ShutdownAll",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated frame")]
    Truncated,
    #[error("frame exceeds {MAX_FRAME_BYTES} bytes")]
    TooLong,
    #[error("frame is not valid JSON: {0}")]
    Malformed(String),
    #[error("missing message type")]
    MissingType,
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

// --- payload shapes ---------------------------------------------------------

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterInstancePayload {
    instance_id: String,
    pid: i64,
    #[serde(default)]
    worker_pid: Option<i64>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstancePayload {
    instance_id: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerPayload {
    instance_id: String,
    pid: i64,
}

#[derive(Serialize, Deserialize)]
struct SetPayload {
    key: String,
    value: Value,
}

/// Serialise a message into one newline-terminated frame.
pub fn encode(msg: &Message) -> Vec<u8> {
    let payload = match msg {
        Message::RegisterInstance {
            instance_id,
            pid,
            worker_pid,
        } => serde_json::json!({
            "instanceId": instance_id,
            "pid": pid,
            "workerPid": worker_pid,
        }),
        Message::UnregisterInstance { instance_id } => {
            serde_json::json!({ "instanceId": instance_id })
        }
        Message::RegisterWorker { instance_id, pid } | Message::ReleaseWorker { instance_id, pid } => {
            serde_json::json!({ "instanceId": instance_id, "pid": pid })
        }
        Message::RequestGlobalSettings | Message::ShutdownAll => serde_json::json!({}),
        Message::GlobalSettingsSnapshot(settings)
        | Message::UpdateGlobalSettings(SettingsUpdate::Broadcast(settings)) => {
            serde_json::json!({ "version": settings.version, "values": settings.values })
        }
        Message::UpdateGlobalSettings(SettingsUpdate::Set { key, value }) => {
            serde_json::json!({ "key": key, "value": value })
        }
    };

    let mut envelope = Map::new();
    envelope.insert("type".into(), Value::String(msg.kind().to_string()));
    if let Value::Object(fields) = payload {
        envelope.extend(fields);
    }

    let mut line = Value::Object(envelope).to_string();
    line.push('\n');
    line.into_bytes()
}

/// Parse a single frame. A trailing newline is optional.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(DecodeError::TooLong);
    }

    let trimmed = trim_ascii(bytes);
    if trimmed.is_empty() {
        return Err(DecodeError::Truncated);
    }

    let value: Value = serde_json::from_slice(trimmed).map_err(|err| {
        if err.is_eof() {
            DecodeError::Truncated
        } else {
            DecodeError::Malformed(err.to_string())
        }
    })?;

    let Value::Object(mut fields) = value else {
        return Err(DecodeError::Malformed("frame is not a JSON object".into()));
    };

    let kind = match fields.remove("type") {
        Some(Value::String(kind)) => kind,
        Some(_) => {
            return Err(DecodeError::InvalidField {
                field: "type",
                reason: "expected a string".into(),
            })
        }
        None => return Err(DecodeError::MissingType),
    };

    match kind.as_str() {
        "RegisterInstance" => {
            let p: RegisterInstancePayload = payload(fields)?;
            let worker_pid = p.worker_pid.map(|raw| pid_field("workerPid", raw)).transpose()?;
            Ok(Message::RegisterInstance {
                instance_id: instance_field(p.instance_id)?,
                pid: pid_field("pid", p.pid)?,
                worker_pid,
            })
        }
        "UnregisterInstance" => {
            let p: InstancePayload = payload(fields)?;
            Ok(Message::UnregisterInstance {
                instance_id: instance_field(p.instance_id)?,
            })
        }
        "RegisterWorker" => {
            let p: WorkerPayload = payload(fields)?;
            Ok(Message::RegisterWorker {
                instance_id: instance_field(p.instance_id)?,
                pid: pid_field("pid", p.pid)?,
            })
        }
        "ReleaseWorker" => {
            let p: WorkerPayload = payload(fields)?;
            Ok(Message::ReleaseWorker {
                instance_id: instance_field(p.instance_id)?,
                pid: pid_field("pid", p.pid)?,
            })
        }
        "RequestGlobalSettings" => Ok(Message::RequestGlobalSettings),
        "ShutdownAll" => Ok(Message::ShutdownAll),
        "GlobalSettingsSnapshot" => Ok(Message::GlobalSettingsSnapshot(payload(fields)?)),
        "UpdateGlobalSettings" => {
            if fields.contains_key("version") || fields.contains_key("values") {
                Ok(Message::UpdateGlobalSettings(SettingsUpdate::Broadcast(
                    payload(fields)?,
                )))
            } else {
                let p: SetPayload = payload(fields)?;
                if p.key.is_empty() {
                    return Err(DecodeError::InvalidField {
                        field: "key",
                        reason: "must not be empty".into(),
                    });
                }
                Ok(Message::UpdateGlobalSettings(SettingsUpdate::Set {
                    key: p.key,
                    value: p.value,
                }))
            }
        }
        other => Err(DecodeError::UnknownType(other.to_string())),
    }
}

fn payload<T: DeserializeOwned>(fields: Map<String, Value>) -> Result<T, DecodeError> {
    serde_json::from_value(Value::Object(fields)).map_err(|err| DecodeError::InvalidField {
        field: "payload",
        reason: err.to_string(),
    })
}

fn pid_field(field: &'static str, raw: i64) -> Result<u32, DecodeError> {
    match u32::try_from(raw) {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(DecodeError::InvalidField {
            field,
            reason: format!("{raw} is not a positive process id"),
        }),
    }
}

fn instance_field(id: String) -> Result<String, DecodeError> {
    if id.trim().is_empty() {
        return Err(DecodeError::InvalidField {
            field: "instanceId",
            reason: "must not be empty".into(),
        });
    }
    Ok(id)
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|idx| idx + 1)
        .unwrap_or(start);
    &bytes[start..end]
}
