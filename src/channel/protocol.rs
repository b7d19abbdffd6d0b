//! JSON frames exchanged with the results hub.
//!
//! Frames are tagged by `type`. Result payloads are kept as raw JSON until
//! [`decode_results`] runs so a bad payload only costs that one frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ChannelError;
use crate::models::{ElectionId, ResultEntry, ResultSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    JoinGroup { election_id: ElectionId },
    #[serde(rename_all = "camelCase")]
    LeaveGroup { election_id: ElectionId },
    #[serde(rename_all = "camelCase")]
    RequestResults {
        election_id: ElectionId,
        invocation_id: Uuid,
    },
}

impl ClientFrame {
    pub fn request_results(election_id: ElectionId) -> Self {
        ClientFrame::RequestResults {
            election_id,
            invocation_id: Uuid::new_v4(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    ResultsPushed { election_id: ElectionId, results: Value },
    #[serde(rename_all = "camelCase")]
    Completion {
        invocation_id: Uuid,
        #[serde(default)]
        results: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    Ping,
}

pub fn encode(frame: &ClientFrame) -> Result<String, ChannelError> {
    Ok(serde_json::to_string(frame)?)
}

pub fn decode(text: &str) -> Result<ServerFrame, ChannelError> {
    Ok(serde_json::from_str(text)?)
}

/// Accepts either a bare array of entries or an object wrapping one under
/// `results`. Anything else is a protocol error.
pub fn decode_results(payload: &Value) -> Result<ResultSet, ChannelError> {
    let items = match payload {
        Value::Array(_) => payload,
        Value::Object(map) => match map.get("results") {
            Some(inner @ Value::Array(_)) => inner,
            Some(_) => {
                return Err(ChannelError::Protocol(
                    "results field is not an array".to_string(),
                ));
            }
            None => {
                return Err(ChannelError::Protocol(
                    "object payload has no results field".to_string(),
                ));
            }
        },
        other => {
            return Err(ChannelError::Protocol(format!(
                "expected an array of results, got {}",
                kind(other)
            )));
        }
    };

    let entries = Vec::<ResultEntry>::deserialize(items)?;
    Ok(ResultSet::new(entries))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
