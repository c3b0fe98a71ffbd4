//! Wire frame types for the gateway's JSON-framed RPC protocol.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum size of a single frame, in bytes, either direction.
pub const MAX_FRAME_BYTES: usize = 25 * 1024 * 1024;

/// Protocol versions this server understands.
pub const PROTOCOL_MIN: u32 = 1;
pub const PROTOCOL_MAX: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

impl From<&CoreError> for WireError {
    fn from(err: &CoreError) -> Self {
        Self {
            code: err.wire_code().to_string(),
            message: err.user_message(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReqFrame {
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResFrame {
    pub id: Value,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl ResFrame {
    pub fn ok(id: Value, payload: Value) -> Self {
        Self {
            id,
            ok: true,
            payload: Some(payload),
            error: None,
            status: None,
        }
    }

    pub fn accepted(id: Value) -> Self {
        Self {
            id,
            ok: true,
            payload: None,
            error: None,
            status: Some("accepted".to_string()),
        }
    }

    pub fn err(id: Value, error: WireError) -> Self {
        Self {
            id,
            ok: false,
            payload: None,
            error: Some(error),
            status: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventFrame {
    pub event: String,
    pub payload: Value,
    pub seq: u64,
}

/// Tagged wire envelope, matching `{type: "req"|"res"|"event", ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutgoingFrame {
    Res(ResFrame),
    Event(EventFrame),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IncomingFrame {
    Req(ReqFrame),
}
