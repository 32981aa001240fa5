//! # Wire Protocol Messages
//!
//! Every record exchanged over the overlay is a [`Message`]: a typed
//! envelope with source, destination, a hop budget, and the relay
//! trail used for loop avoidance and reverse-path hinting. Payloads
//! are structured JSON values with typed views defined per protocol.
//!
//! ## Message families
//!
//! | Family | Kinds | Carried by |
//! |--------|-------|------------|
//! | Handshake | `request-peer`, `offer`, `answer`, `icecandidate` | overlay flood / route hints |
//! | Rendezvous | `first-view`, `signal:keepalive` | rendezvous channel |
//! | Lifecycle | `connected` | in-process only |
//! | Gossip | `gossip:*` | direct neighbor exchange |
//! | Media | `media:*` | direct neighbor exchange (bulk is admission-gated) |
//!
//! ## Framing
//!
//! The rendezvous channel carries one JSON document per frame; the
//! hop budget is forced to zero on that path. Peer transports carry
//! the same record through whatever encoding the transport capability
//! chooses.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::SwarmError;

/// Opaque node identifier assigned by the rendezvous service.
pub type PeerId = String;

/// Reserved destination: the rendezvous service.
pub const SIGNAL: &str = "signal";

/// Reserved destination: the origin media server.
pub const SOURCE: &str = "source";

/// Reserved destination: any peer willing to answer.
pub const ANY_PEER: &str = "-1";

/// Default hop budget for locally originated messages.
pub const DEFAULT_TTL: u32 = 3;

/// Message kind tags. The router treats the tag as an opaque string;
/// this is the closed set the core and its extensions recognize.
pub mod kind {
    pub const REQUEST_PEER: &str = "request-peer";
    pub const OFFER: &str = "offer";
    pub const ANSWER: &str = "answer";
    pub const ICE_CANDIDATE: &str = "icecandidate";

    pub const FIRST_VIEW: &str = "first-view";
    pub const KEEPALIVE: &str = "signal:keepalive";

    /// Internal: a peer channel reached the open state.
    pub const CONNECTED: &str = "connected";

    pub const GOSSIP_REQUEST_EXCHANGE: &str = "gossip:request-exchange";
    pub const GOSSIP_ANSWER_REQUEST: &str = "gossip:answer-request";
    pub const GOSSIP_DESCRIPTOR_UPDATE: &str = "gossip:descriptor-update";
    pub const GOSSIP_VIEW_UPDATE: &str = "gossip:view-update";
    pub const GOSSIP_BANDWIDTH: &str = "gossip:bandwidth";
    pub const GOSSIP_WEIGHT: &str = "gossip:weight";

    pub const MEDIA_REQUEST_INDEX: &str = "media:request-index";
    pub const MEDIA_INDEX: &str = "media:index";
    pub const MEDIA_REQUEST_PART: &str = "media:request-part";
    pub const MEDIA_PART: &str = "media:part";
    pub const MEDIA_HAVE: &str = "media:have";
}

/// Kinds an intermediary may re-flood when it has no better route.
pub const FORWARDABLE: [&str; 4] = [
    kind::ICE_CANDIDATE,
    kind::REQUEST_PEER,
    kind::OFFER,
    kind::ANSWER,
];

/// The wire record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    pub from: PeerId,
    pub to: PeerId,
    #[serde(default)]
    pub ttl: u32,
    #[serde(default)]
    pub forward_by: Vec<PeerId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub route: Vec<PeerId>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Message {
    /// A message with an empty relay trail and the given payload.
    pub fn new(
        kind: impl Into<String>,
        from: impl Into<PeerId>,
        to: impl Into<PeerId>,
        ttl: u32,
        data: Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            from: from.into(),
            to: to.into(),
            ttl,
            forward_by: Vec::new(),
            route: Vec::new(),
            data,
        }
    }

    /// Schema validation; invalid messages are never handed to a
    /// transport.
    pub fn validate(&self) -> Result<(), SwarmError> {
        if self.kind.is_empty() {
            return Err(SwarmError::InvalidMessage("type"));
        }
        if self.from.is_empty() {
            return Err(SwarmError::InvalidMessage("from"));
        }
        if self.to.is_empty() {
            return Err(SwarmError::InvalidMessage("to"));
        }
        Ok(())
    }

    /// Serialize to one self-delimited JSON document (rendezvous frame).
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).expect("message serializes to JSON")
    }

    /// Parse a rendezvous frame, enforcing field presence.
    ///
    /// `ttl` and `forward_by` must be present on the wire for the
    /// handshake kinds; other kinds default them.
    pub fn from_frame(frame: &str) -> Result<Self, SwarmError> {
        let value: Value = serde_json::from_str(frame)
            .map_err(|_| SwarmError::InvalidMessage("frame"))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(SwarmError::InvalidMessage("type"))?;
        if FORWARDABLE.contains(&kind) {
            if value.get("ttl").and_then(Value::as_u64).is_none() {
                return Err(SwarmError::InvalidMessage("ttl"));
            }
            if value.get("forward_by").and_then(Value::as_array).is_none() {
                return Err(SwarmError::InvalidMessage("forward_by"));
            }
        }
        let message: Message = serde_json::from_value(value)
            .map_err(|_| SwarmError::InvalidMessage("frame"))?;
        message.validate()?;
        Ok(message)
    }

    /// Typed view of the payload.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, SwarmError> {
        serde_json::from_value(self.data.clone()).map_err(|_| SwarmError::InvalidMessage("data"))
    }
}

// ============================================================================
// Typed payloads
// ============================================================================

/// `offer` / `answer` payload: the session descriptor produced by the
/// transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub sdp: String,
}

/// `icecandidate` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
}

/// `first-view` payload from the rendezvous: the assigned identity and
/// an initial view of the network.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FirstView {
    pub id: PeerId,
    #[serde(default)]
    pub view: Vec<NodeDescriptor>,
}

/// A gossip view entry. `media` is an open-ended object extensions
/// patch through `gossip:descriptor-update`; the well-known fields are
/// read through [`NodeDescriptor::bandwidth`] and
/// [`NodeDescriptor::parts`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NodeDescriptor {
    pub id: PeerId,
    #[serde(default)]
    pub age: u32,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub media: Value,
    /// Fields added by extensions we do not interpret ourselves.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl NodeDescriptor {
    pub fn new(id: impl Into<PeerId>) -> Self {
        Self {
            id: id.into(),
            age: 0,
            media: Value::Null,
            extra: serde_json::Map::new(),
        }
    }

    /// Advertised mean bandwidth, if any.
    pub fn bandwidth(&self) -> Option<f64> {
        self.media.get("bandwidth").and_then(Value::as_f64)
    }

    /// Advertised media part numbers, if any.
    pub fn parts(&self) -> Option<Vec<usize>> {
        let parts = self.media.get("parts")?.as_array()?;
        Some(
            parts
                .iter()
                .filter_map(|p| p.as_u64().map(|n| n as usize))
                .collect(),
        )
    }
}

/// `gossip:request-exchange` / `gossip:answer-request` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViewExchange {
    pub view: Vec<NodeDescriptor>,
}

/// `gossip:descriptor-update` payload: a path-addressed patch applied
/// to the node's own descriptor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DescriptorPatch {
    pub path: Vec<String>,
    pub value: Value,
}

/// `gossip:view-update` payload, crossing from the gossip task back to
/// the peer task: the current view and the heavy-admission cap derived
/// from it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViewUpdatePayload {
    pub view: Vec<NodeDescriptor>,
    pub max_connections: usize,
}

/// Verbs of the connection weight protocol.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum WeightVerb {
    #[serde(rename = "request-heavy")]
    RequestHeavy,
    #[serde(rename = "ack-heavy")]
    AckHeavy,
    #[serde(rename = "noack-heavy")]
    NoackHeavy,
    #[serde(rename = "request-light")]
    RequestLight,
    #[serde(rename = "ack-light")]
    AckLight,
    #[serde(rename = "noack-light")]
    NoackLight,
}

/// `gossip:weight` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WeightPayload {
    pub value: WeightVerb,
}

/// `media:request-part` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartRequest {
    pub part: usize,
    pub chunk_size: usize,
}

/// `media:part` payload. `number` is `"p"` for a whole part or
/// `"p:c:n"` for chunk `c` of `n`; `bytes` is base64.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartPayload {
    pub number: String,
    pub bytes: String,
}

/// `media:have` payload: part numbers the sender can serve.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HavePayload {
    pub parts: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn offer(from: &str, to: &str) -> Message {
        Message::new(kind::OFFER, from, to, DEFAULT_TTL, json!({"sdp": "v=0"}))
    }

    #[test]
    fn frame_round_trip() {
        let msg = offer("a", "b");
        let frame = msg.to_frame();
        let back = Message::from_frame(&frame).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn frame_uses_type_tag() {
        let frame = offer("a", "b").to_frame();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "offer");
        assert!(value.get("kind").is_none());
    }

    #[test]
    fn handshake_kinds_require_ttl_and_forward_by() {
        let missing_ttl = r#"{"type":"offer","from":"a","to":"b","forward_by":[]}"#;
        assert!(matches!(
            Message::from_frame(missing_ttl),
            Err(SwarmError::InvalidMessage("ttl"))
        ));

        let missing_trail = r#"{"type":"offer","from":"a","to":"b","ttl":3}"#;
        assert!(matches!(
            Message::from_frame(missing_trail),
            Err(SwarmError::InvalidMessage("forward_by"))
        ));

        // Non-handshake kinds default both fields.
        let bare = r#"{"type":"gossip:bandwidth","from":"a","to":"b","data":12.5}"#;
        let msg = Message::from_frame(bare).unwrap();
        assert_eq!(msg.ttl, 0);
        assert!(msg.forward_by.is_empty());
    }

    #[test]
    fn validation_rejects_empty_fields() {
        let mut msg = offer("a", "b");
        msg.to = String::new();
        assert!(matches!(
            msg.validate(),
            Err(SwarmError::InvalidMessage("to"))
        ));
    }

    #[test]
    fn descriptor_media_accessors() {
        let mut descriptor = NodeDescriptor::new("n1");
        descriptor.age = 2;
        descriptor.media = json!({"bandwidth": 1200.0, "parts": [0, 3, 7]});
        assert_eq!(descriptor.bandwidth(), Some(1200.0));
        assert_eq!(descriptor.parts(), Some(vec![0, 3, 7]));

        let bare = NodeDescriptor::new("n2");
        assert_eq!(bare.bandwidth(), None);
        assert_eq!(bare.parts(), None);
    }

    #[test]
    fn weight_verbs_use_wire_names() {
        let payload = WeightPayload {
            value: WeightVerb::RequestHeavy,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["value"], "request-heavy");

        let back: WeightPayload =
            serde_json::from_value(json!({"value": "noack-light"})).unwrap();
        assert_eq!(back.value, WeightVerb::NoackLight);
    }

    #[test]
    fn first_view_payload_parses() {
        let frame = r#"{"type":"first-view","from":"signal","to":"p7","data":{"id":"p7"}}"#;
        let msg = Message::from_frame(frame).unwrap();
        let first: FirstView = msg.data_as().unwrap();
        assert_eq!(first.id, "p7");
        assert!(first.view.is_empty());
    }
}
