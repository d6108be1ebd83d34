//! Signaling wire format.
//!
//! Every frame on the relay connection is one JSON object. Routed frames
//! (offer/answer/ice-candidate/file-request/file-response) carry mandatory
//! `type`, `from`, `to`, `data` and `timestamp` (unix ms) fields; the relay
//! never inspects `data`. Server-emitted frames (`connection`, `pong`,
//! `error`) use a subset of the fields, so everything beyond `type` is
//! optional here and omitted from the encoded form when absent.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Frame discriminator, encoded kebab-case (`ice-candidate`, `file-request`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Offer,
    Answer,
    IceCandidate,
    FileRequest,
    FileResponse,
    Register,
    Connection,
    Error,
    Ping,
    Pong,
}

impl MessageType {
    /// Types the relay routes peer-to-peer. `register`/`ping` are consumed by
    /// the relay itself; `connection`/`pong`/`error` only ever originate there.
    pub fn is_routable(self) -> bool {
        matches!(
            self,
            MessageType::Offer
                | MessageType::Answer
                | MessageType::IceCandidate
                | MessageType::FileRequest
                | MessageType::FileResponse
        )
    }
}

/// One signaling frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub msg_type: MessageType,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,

    /// Human-readable text on `connection` and `error` frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Temporary identifier assigned on `connection` frames.
    #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// The frame that failed to route, echoed back on `error` frames.
    #[serde(
        rename = "originalMessage",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub original_message: Option<Box<SignalingMessage>>,

    /// Parse failure detail on `error` frames for non-JSON input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Current unix time in milliseconds, the wire timestamp unit.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl SignalingMessage {
    fn routed(msg_type: MessageType, from: &str, to: &str, data: Value) -> Self {
        Self {
            msg_type,
            from: from.to_string(),
            to: to.to_string(),
            data,
            timestamp: Some(now_ms()),
            message: None,
            client_id: None,
            original_message: None,
            error: None,
        }
    }

    pub fn offer(from: &str, to: &str, data: Value) -> Self {
        Self::routed(MessageType::Offer, from, to, data)
    }

    pub fn answer(from: &str, to: &str, data: Value) -> Self {
        Self::routed(MessageType::Answer, from, to, data)
    }

    pub fn ice_candidate(from: &str, to: &str, data: Value) -> Self {
        Self::routed(MessageType::IceCandidate, from, to, data)
    }

    pub fn file_request(request: &FileTransferRequest) -> Self {
        Self::routed(
            MessageType::FileRequest,
            &request.sender,
            &request.recipient,
            serde_json::to_value(request).unwrap_or(Value::Null),
        )
    }

    pub fn file_response(from: &str, to: &str, file_id: &str, accepted: bool) -> Self {
        Self::routed(
            MessageType::FileResponse,
            from,
            to,
            serde_json::json!({ "fileId": file_id, "accepted": accepted }),
        )
    }

    /// Rebind the sending connection to `address` at the relay.
    pub fn register(address: &str) -> Self {
        Self::routed(
            MessageType::Register,
            "temp",
            "server",
            serde_json::json!({ "address": address }),
        )
    }

    pub fn ping() -> Self {
        Self::routed(MessageType::Ping, "", "", Value::Null)
    }

    pub fn pong() -> Self {
        Self {
            msg_type: MessageType::Pong,
            from: String::new(),
            to: String::new(),
            data: Value::Null,
            timestamp: Some(now_ms()),
            message: None,
            client_id: None,
            original_message: None,
            error: None,
        }
    }

    /// Connection-confirmation frame carrying the assigned temporary id.
    pub fn connection(client_id: &str) -> Self {
        Self {
            msg_type: MessageType::Connection,
            from: String::new(),
            to: String::new(),
            data: Value::Null,
            timestamp: Some(now_ms()),
            message: Some("Connected to signaling relay".to_string()),
            client_id: Some(client_id.to_string()),
            original_message: None,
            error: None,
        }
    }

    /// Routing failure reply, embedding the undeliverable frame.
    pub fn routing_error(target: &str, original: SignalingMessage) -> Self {
        Self {
            msg_type: MessageType::Error,
            from: String::new(),
            to: String::new(),
            data: Value::Null,
            timestamp: None,
            message: Some(format!("Target client {} not available", target)),
            client_id: None,
            original_message: Some(Box::new(original)),
            error: None,
        }
    }

    /// Generic reply for frames that failed to parse. The connection stays up.
    pub fn format_error(detail: &str) -> Self {
        Self {
            msg_type: MessageType::Error,
            from: String::new(),
            to: String::new(),
            data: Value::Null,
            timestamp: None,
            message: Some("Invalid message format".to_string()),
            client_id: None,
            original_message: None,
            error: Some(detail.to_string()),
        }
    }
}

/// Transfer announcement sent as the `data` of a `file-request` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransferRequest {
    #[serde(rename = "fileId")]
    pub file_id: String,
    pub sender: String,
    pub recipient: String,
    #[serde(rename = "fileMetadata")]
    pub file_metadata: crate::transfer::FileMetadata,
}
