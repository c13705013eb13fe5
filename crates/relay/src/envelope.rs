//! Wire envelope exchanged with devices over the shared channel.
//!
//! Outgoing messages carry their body under `command`; replies from devices
//! carry it under `payload`. The peer on the other side of the broker expects
//! exactly this asymmetry, so both shapes are kept as-is.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use time::OffsetDateTime;

/// `device_id` used for broadcast requests and fleet-wide replies.
pub const ALL_DEVICES: &str = "all";

/// Value substituted for any envelope field missing from an inbound message.
pub const MISSING_FIELD: &str = "0";

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgType {
    Request,
    Reply,
}

impl MsgType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Reply => "reply",
        }
    }
}

/// Logical request kind. Not a correlation id: every request of the same
/// kind shares the same `msg_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgId {
    ReportMeasurements,
    GetLogs,
    SendTelegram,
    SetCommands,
}

impl MsgId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReportMeasurements => "reportMeasurements",
            Self::GetLogs => "getLogs",
            Self::SendTelegram => "sendTelegram",
            Self::SetCommands => "setCommands",
        }
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Outgoing
// ---------------------------------------------------------------------------

/// Envelope as written by this relay (body under `command`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub timestamp: String,
    pub msg_type: MsgType,
    pub msg_id: String,
    pub device_id: String,
    pub command: Value,
}

impl Request {
    /// Build a request stamped with the current UTC time.
    pub fn new(
        msg_type: MsgType,
        msg_id: impl Into<String>,
        device_id: impl Into<String>,
        command: impl Into<Value>,
    ) -> Self {
        Self {
            timestamp: timestamp_now(),
            msg_type,
            msg_id: msg_id.into(),
            device_id: device_id.into(),
            command: command.into(),
        }
    }

    /// The broadcast asking every device to report its measurements.
    pub fn report_measurements() -> Self {
        Self::new(
            MsgType::Request,
            MsgId::ReportMeasurements.as_str(),
            ALL_DEVICES,
            "1",
        )
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Envelope as written by devices (body under `payload`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub timestamp: String,
    pub msg_type: MsgType,
    pub msg_id: String,
    pub device_id: String,
    pub payload: Value,
}

impl Reply {
    pub fn new(msg_id: MsgId, device_id: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self {
            timestamp: timestamp_now(),
            msg_type: MsgType::Reply,
            msg_id: msg_id.as_str().to_string(),
            device_id: device_id.into(),
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

// ---------------------------------------------------------------------------
// Incoming
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope is not a json object")]
    NotAnObject,
}

/// Any envelope read off the channel. Fields are kept as raw JSON because
/// peers are not guaranteed to send strings; absent fields read as `"0"`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Inbound {
    #[serde(default = "missing")]
    pub msg_type: Value,
    #[serde(default = "missing")]
    pub msg_id: Value,
    #[serde(default = "missing")]
    pub device_id: Value,
    #[serde(default = "missing")]
    pub payload: Value,
}

fn missing() -> Value {
    Value::from(MISSING_FIELD)
}

impl Inbound {
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        match serde_json::from_slice::<Value>(raw)? {
            obj @ Value::Object(_) => Ok(serde_json::from_value(obj)?),
            _ => Err(DecodeError::NotAnObject),
        }
    }

    pub fn is_reply(&self) -> bool {
        self.msg_type == MsgType::Reply.as_str()
    }

    pub fn is(&self, id: MsgId) -> bool {
        self.msg_id == id.as_str()
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// `[YYYY.MM.DD_HH:MM:SS]` in UTC.
pub fn format_timestamp(at: OffsetDateTime) -> String {
    let at = at.to_offset(time::UtcOffset::UTC);
    format!(
        "[{:04}.{:02}.{:02}_{:02}:{:02}:{:02}]",
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    )
}

pub fn timestamp_now() -> String {
    format_timestamp(OffsetDateTime::now_utc())
}

// ===========================================================================
// Tests
// ===========================================================================
