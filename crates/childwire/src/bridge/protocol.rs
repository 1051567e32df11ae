//! Wire protocol types shared by parent and child.
//!
//! One message per line, discriminated by the `op` field:
//! - `request`: `{"op":"request","body":<any>,"id":<n>}`
//! - `response`: `{"op":"response","id":<n>,"body":<any>}`
//! - `stop`: `{"op":"stop"}`

use serde::{Deserialize, Serialize};

/// Correlation identifier linking a request to its response.
///
/// Issued by [`CorrelationTable::allocate`](crate::correlation::CorrelationTable::allocate),
/// which never hands out zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Message {
    /// Ask the peer to do something; answered by a `Response` with the same id.
    Request {
        #[serde(default)]
        body: serde_json::Value,
        id: RequestId,
    },

    Response {
        id: RequestId,
        #[serde(default)]
        body: serde_json::Value,
    },

    /// Ask the peer to shut down.
    Stop,

    /// Any `op` this side does not understand. Never sent.
    #[serde(other)]
    Unsupported,
}

impl Message {
    pub fn request(id: RequestId, body: serde_json::Value) -> Self {
        Self::Request { body, id }
    }

    pub fn response(id: RequestId, body: serde_json::Value) -> Self {
        Self::Response { id, body }
    }

    /// The value of the `op` tag.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Stop => "stop",
            Self::Unsupported => "unsupported",
        }
    }

    pub fn id(&self) -> Option<RequestId> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => Some(*id),
            Self::Stop | Self::Unsupported => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes() {
        let msg = Message::request(RequestId::new(7), json!({"sup": "buddy 420"}));
        insta::assert_json_snapshot!(msg, @r#"
        {
          "op": "request",
          "body": {
            "sup": "buddy 420"
          },
          "id": 7
        }
        "#);
    }

    #[test]
    fn response_serializes() {
        let msg = Message::response(RequestId::new(3), json!([1, 2]));
        insta::assert_json_snapshot!(msg, @r#"
        {
          "op": "response",
          "id": 3,
          "body": [
            1,
            2
          ]
        }
        "#);
    }

    #[test]
    fn stop_serializes() {
        insta::assert_json_snapshot!(Message::Stop, @r#"
        {
          "op": "stop"
        }
        "#);
    }

    #[test]
    fn request_wire_field_order() {
        let msg = Message::request(RequestId::new(1), json!("x"));
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"op":"request","body":"x","id":1}"#
        );
    }

    #[test]
    fn unknown_op_deserializes_as_unsupported() {
        let msg: Message = serde_json::from_str(r#"{"op":"ping"}"#).unwrap();
        assert_eq!(msg, Message::Unsupported);
        assert_eq!(msg.id(), None);
    }

    #[test]
    fn response_without_body_defaults_to_null() {
        let msg: Message = serde_json::from_str(r#"{"op":"response","id":9}"#).unwrap();
        assert_eq!(msg, Message::response(RequestId::new(9), serde_json::Value::Null));
    }

    #[test]
    fn response_requires_id() {
        assert!(serde_json::from_str::<Message>(r#"{"op":"response","body":1}"#).is_err());
    }

    #[test]
    fn op_names_match_tags() {
        assert_eq!(Message::Stop.op(), "stop");
        assert_eq!(Message::request(RequestId::new(1), json!(null)).op(), "request");
        assert_eq!(Message::response(RequestId::new(1), json!(null)).op(), "response");
    }
}
