#![cfg_attr(test, allow(clippy::unwrap_used))]

//! The controller protocol: one JSON document per UDP datagram.
//!
//! Every document is a [`TincanControl`]; requests carry a command-specific
//! object under `Request`, responses a `{Message, Success}` pair under
//! `Response`. The channel itself lives in [`channel`].

mod channel;
mod messages;

pub use channel::{ControlChannel, Responder};
pub use messages::{
    CreateCtrlRespLinkRequest, CreateVnetRequest, EchoRequest, IccRequest, InjectFrameRequest,
    LinkRequest, PeerInfo, QueryNodeInfoRequest, RemovePeerRequest, SetIgnoredInterfacesRequest,
    SetLoggingLevelRequest, UpdateMapRequest,
};

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u8 = 4;
pub const DEFAULT_CONTROL_PORT: u16 = 5800;

/// One datagram is one document; larger controls are a protocol violation.
pub const MAX_CONTROL_DATAGRAM: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlType {
    #[serde(rename = "TincanRequest")]
    Request,
    #[serde(rename = "TincanResponse")]
    Response,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Success")]
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TincanControl {
    #[serde(rename = "ProtocolVersion")]
    pub protocol_version: u8,
    #[serde(rename = "TransactionId", default)]
    pub transaction_id: u64,
    #[serde(rename = "ControlType")]
    pub control_type: ControlType,
    #[serde(rename = "Command")]
    pub command: String,
    #[serde(rename = "Request", default, skip_serializing_if = "Option::is_none")]
    pub request: Option<serde_json::Value>,
    #[serde(rename = "Response", default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ControlResponse>,
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("`{command}` request is malformed: {source}")]
    BadRequest {
        command: String,
        source: serde_json::Error,
    },
}

impl TincanControl {
    /// A request originated by this process (ICC delivery, route misses).
    pub fn request(command: impl Into<String>, request: serde_json::Value) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            transaction_id: 0,
            control_type: ControlType::Request,
            command: command.into(),
            request: Some(request),
            response: None,
        }
    }

    pub fn parse(datagram: &[u8]) -> Result<Self, ControlError> {
        let control: Self = serde_json::from_slice(datagram)?;

        if control.protocol_version != PROTOCOL_VERSION {
            return Err(ControlError::Version(control.protocol_version));
        }

        Ok(control)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!("Failed to serialise a control: {e}");
            String::new()
        })
    }

    /// Deserialises the command-specific `Request` payload.
    pub fn request_payload<'a, T: Deserialize<'a>>(&'a self) -> Result<T, ControlError> {
        let request = self.request.as_ref().unwrap_or(&serde_json::Value::Null);

        T::deserialize(request).map_err(|source| ControlError::BadRequest {
            command: self.command.clone(),
            source,
        })
    }

    /// Turns this control into its response in place.
    pub fn set_response(&mut self, message: impl Into<String>, success: bool) {
        self.control_type = ControlType::Response;
        self.request = None;
        self.response = Some(ControlResponse {
            message: message.into(),
            success,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_request_document() {
        let raw = r#"{
            "ProtocolVersion": 4,
            "TransactionId": 7,
            "ControlType": "TincanRequest",
            "Command": "Echo",
            "Request": { "Message": "ping" }
        }"#;

        let control = TincanControl::parse(raw.as_bytes()).unwrap();

        assert_eq!(control.transaction_id, 7);
        assert_eq!(control.control_type, ControlType::Request);
        assert_eq!(control.command, "Echo");

        let echo: EchoRequest = control.request_payload().unwrap();
        assert_eq!(echo.message, "ping");
    }

    #[test]
    fn rejects_other_protocol_versions() {
        let raw = r#"{
            "ProtocolVersion": 3,
            "TransactionId": 1,
            "ControlType": "TincanRequest",
            "Command": "Echo"
        }"#;

        assert!(matches!(
            TincanControl::parse(raw.as_bytes()),
            Err(ControlError::Version(3))
        ));
    }

    #[test]
    fn response_round_trips_the_transaction_id() {
        let raw = r#"{
            "ProtocolVersion": 4,
            "TransactionId": 42,
            "ControlType": "TincanRequest",
            "Command": "Echo",
            "Request": { "Message": "ping" }
        }"#;

        let mut control = TincanControl::parse(raw.as_bytes()).unwrap();
        control.set_response("pong", true);

        let reparsed = TincanControl::parse(control.to_json().as_bytes()).unwrap();
        assert_eq!(reparsed.transaction_id, 42);
        assert_eq!(reparsed.control_type, ControlType::Response);
        assert_eq!(reparsed.response.unwrap().message, "pong");
        assert!(reparsed.request.is_none());
    }

    #[test]
    fn malformed_payload_is_a_typed_error() {
        let raw = r#"{
            "ProtocolVersion": 4,
            "TransactionId": 1,
            "ControlType": "TincanRequest",
            "Command": "CreateCtrlRespLink",
            "Request": { "IP": "127.0.0.1" }
        }"#;

        let control = TincanControl::parse(raw.as_bytes()).unwrap();
        let result: Result<CreateCtrlRespLinkRequest, _> = control.request_payload();

        assert!(matches!(result, Err(ControlError::BadRequest { .. })));
    }
}
