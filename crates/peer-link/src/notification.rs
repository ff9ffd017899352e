//! Closed set of notifications understood by the dispatcher.

use relay_bus::Envelope;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::{IceCandidate, SessionDescription};

pub const JOIN: &str = "join";
pub const LEAVE: &str = "leave";
pub const REQUEST: &str = "request";
pub const REQUEST_RESULT: &str = "requestResult";
pub const DESCRIPTION: &str = "rtcDescription";
pub const CANDIDATE: &str = "rtcCandidate";

const RESERVED: [&str; 6] = [JOIN, LEAVE, REQUEST, REQUEST_RESULT, DESCRIPTION, CANDIDATE];

pub fn is_reserved(name: &str) -> bool {
    RESERVED.contains(&name)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBody {
    pub request_id: u64,
    pub request_name: String,
    #[serde(default)]
    pub request_payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResultBody {
    pub request_id: u64,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Join,
    Leave,
    Description(SessionDescription),
    Candidate(IceCandidate),
    Request(RequestBody),
    RequestResult(RequestResultBody),
    /// Anything else; handed to subscribers untouched.
    Custom { name: String, payload: Value },
}

impl Notification {
    pub fn parse(name: &str, payload: &Value) -> Result<Self, serde_json::Error> {
        let notification = match name {
            JOIN => Notification::Join,
            LEAVE => Notification::Leave,
            DESCRIPTION => Notification::Description(SessionDescription::deserialize(payload)?),
            CANDIDATE => Notification::Candidate(IceCandidate::deserialize(payload)?),
            REQUEST => Notification::Request(RequestBody::deserialize(payload)?),
            REQUEST_RESULT => Notification::RequestResult(RequestResultBody::deserialize(payload)?),
            other => Notification::Custom {
                name: other.to_string(),
                payload: payload.clone(),
            },
        };
        Ok(notification)
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, serde_json::Error> {
        Self::parse(&envelope.notification_name, &envelope.notification_payload)
    }

    pub fn name(&self) -> &str {
        match self {
            Notification::Join => JOIN,
            Notification::Leave => LEAVE,
            Notification::Description(_) => DESCRIPTION,
            Notification::Candidate(_) => CANDIDATE,
            Notification::Request(_) => REQUEST,
            Notification::RequestResult(_) => REQUEST_RESULT,
            Notification::Custom { name, .. } => name,
        }
    }

    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Notification::Join | Notification::Leave => Ok(Value::Null),
            Notification::Description(description) => serde_json::to_value(description),
            Notification::Candidate(candidate) => serde_json::to_value(candidate),
            Notification::Request(body) => serde_json::to_value(body),
            Notification::RequestResult(body) => serde_json::to_value(body),
            Notification::Custom { payload, .. } => Ok(payload.clone()),
        }
    }

    pub fn to_envelope(&self, from: &str, to: Option<&str>) -> Result<Envelope, serde_json::Error> {
        Ok(Envelope {
            from_client_id: from.to_string(),
            to_client_id: to.map(str::to_string),
            notification_name: self.name().to_string(),
            notification_payload: self.payload()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reserved_names_parse_into_typed_variants() {
        let request = Notification::parse(
            REQUEST,
            &json!({"requestId": 3, "requestName": "get_state", "requestPayload": {"a": 1}}),
        )
        .expect("parse");
        assert_eq!(
            request,
            Notification::Request(RequestBody {
                request_id: 3,
                request_name: "get_state".into(),
                request_payload: json!({"a": 1}),
            })
        );

        let description =
            Notification::parse(DESCRIPTION, &json!({"type": "answer", "sdp": "v=0"})).expect("parse");
        assert!(matches!(description, Notification::Description(d) if !d.is_offer()));
    }

    #[test]
    fn unknown_names_pass_through() {
        let custom = Notification::parse("cursor", &json!([1, 2])).expect("parse");
        assert_eq!(custom.name(), "cursor");
        assert_eq!(custom.payload().expect("payload"), json!([1, 2]));
        assert!(!is_reserved("cursor"));
        assert!(is_reserved(REQUEST_RESULT));
    }

    #[test]
    fn malformed_reserved_payload_is_an_error() {
        assert!(Notification::parse(CANDIDATE, &json!({"nope": true})).is_err());
        assert!(Notification::parse(REQUEST_RESULT, &json!("x")).is_err());
    }

    #[test]
    fn envelope_carries_name_and_target() {
        let envelope = Notification::RequestResult(RequestResultBody {
            request_id: 9,
            result: json!("done"),
        })
        .to_envelope("bob", Some("alice"))
        .expect("envelope");
        assert_eq!(envelope.notification_name, REQUEST_RESULT);
        assert_eq!(envelope.to_client_id.as_deref(), Some("alice"));
        let round = Notification::from_envelope(&envelope).expect("parse");
        assert!(matches!(round, Notification::RequestResult(body) if body.request_id == 9));
    }
}
