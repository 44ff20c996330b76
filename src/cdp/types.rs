use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outgoing CDP command (server to Chrome).
#[derive(Debug, Serialize)]
pub struct CdpCommand {
    /// Unique message ID for response correlation.
    pub id: u64,
    /// CDP method name (e.g., `Fetch.continueRequest`).
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Session ID for target-scoped commands; absent for browser-level ones.
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Raw incoming CDP message before classification.
///
/// Every frame is deserialized into this union of response and event fields
/// first; [`classify`](Self::classify) then decides which it is.
#[derive(Debug, Deserialize)]
pub struct RawCdpMessage {
    /// Present for responses; absent for events.
    pub id: Option<u64>,
    /// Present for events.
    pub method: Option<String>,
    pub params: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<CdpProtocolError>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// Protocol error payload returned by Chrome inside a response.
#[derive(Debug, Clone, Deserialize)]
pub struct CdpProtocolError {
    pub code: i64,
    pub message: String,
}

/// A response correlated to a previously sent command.
#[derive(Debug)]
pub struct CdpResponse {
    pub id: u64,
    pub result: Result<Value, CdpProtocolError>,
    pub session_id: Option<String>,
}

/// An asynchronous event pushed by Chrome.
#[derive(Debug, Clone)]
pub struct CdpEvent {
    /// Event method name (e.g., `Fetch.requestPaused`).
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

/// Classification of a raw CDP message.
pub enum MessageKind {
    Response(CdpResponse),
    Event(CdpEvent),
}

impl RawCdpMessage {
    /// Classify this message: an `id` makes it a response, a bare `method`
    /// makes it an event. Returns `None` when neither field is present —
    /// the transport treats that as a malformed frame.
    #[must_use]
    pub fn classify(self) -> Option<MessageKind> {
        if let Some(id) = self.id {
            let result = match self.error {
                Some(error) => Err(error),
                None => Ok(self.result.unwrap_or(Value::Null)),
            };
            Some(MessageKind::Response(CdpResponse {
                id,
                result,
                session_id: self.session_id,
            }))
        } else if let Some(method) = self.method {
            Some(MessageKind::Event(CdpEvent {
                method,
                params: self.params.unwrap_or(Value::Null),
                session_id: self.session_id,
            }))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_omits_absent_fields() {
        let cmd = CdpCommand {
            id: 7,
            method: "Target.getTargets".into(),
            params: None,
            session_id: None,
        };
        let json: Value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["method"], "Target.getTargets");
        assert!(json.get("params").is_none());
        assert!(json.get("sessionId").is_none());
    }

    #[test]
    fn command_serializes_session_scope() {
        let cmd = CdpCommand {
            id: 8,
            method: "Fetch.enable".into(),
            params: Some(json!({"patterns": [{"urlPattern": "*"}]})),
            session_id: Some("sess-9".into()),
        };
        let json: Value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["sessionId"], "sess-9");
        assert_eq!(json["params"]["patterns"][0]["urlPattern"], "*");
    }

    #[test]
    fn classify_success_response() {
        let raw: RawCdpMessage =
            serde_json::from_str(r#"{"id": 3, "result": {"targetId": "T1"}}"#).unwrap();
        let Some(MessageKind::Response(resp)) = raw.classify() else {
            panic!("expected response");
        };
        assert_eq!(resp.id, 3);
        assert_eq!(resp.result.unwrap()["targetId"], "T1");
    }

    #[test]
    fn classify_error_response() {
        let raw: RawCdpMessage = serde_json::from_str(
            r#"{"id": 4, "error": {"code": -32602, "message": "Invalid parameters"}}"#,
        )
        .unwrap();
        let Some(MessageKind::Response(resp)) = raw.classify() else {
            panic!("expected response");
        };
        let err = resp.result.unwrap_err();
        assert_eq!(err.code, -32602);
        assert_eq!(err.message, "Invalid parameters");
    }

    #[test]
    fn classify_session_scoped_event() {
        let raw: RawCdpMessage = serde_json::from_str(
            r#"{"method": "Fetch.requestPaused", "params": {"requestId": "interception-1"}, "sessionId": "sess-2"}"#,
        )
        .unwrap();
        let Some(MessageKind::Event(event)) = raw.classify() else {
            panic!("expected event");
        };
        assert_eq!(event.method, "Fetch.requestPaused");
        assert_eq!(event.params["requestId"], "interception-1");
        assert_eq!(event.session_id.as_deref(), Some("sess-2"));
    }

    #[test]
    fn classify_event_without_params_yields_null() {
        let raw: RawCdpMessage =
            serde_json::from_str(r#"{"method": "Target.targetDestroyed"}"#).unwrap();
        let Some(MessageKind::Event(event)) = raw.classify() else {
            panic!("expected event");
        };
        assert_eq!(event.params, Value::Null);
    }

    #[test]
    fn classify_empty_object_is_none() {
        let raw: RawCdpMessage = serde_json::from_str("{}").unwrap();
        assert!(raw.classify().is_none());
    }

    #[test]
    fn classify_response_without_result_yields_null() {
        let raw: RawCdpMessage = serde_json::from_str(r#"{"id": 12}"#).unwrap();
        let Some(MessageKind::Response(resp)) = raw.classify() else {
            panic!("expected response");
        };
        assert_eq!(resp.result.unwrap(), Value::Null);
    }
}
