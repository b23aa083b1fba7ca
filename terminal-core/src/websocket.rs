//! Streaming protocol types
//!
//! These types define the wire envelope received from the streaming
//! endpoint, the requests the terminal sends back, and the connection and
//! topic states surfaced to consumers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{fields_from_json, EntityKey, EntityKind, FieldMap};
use crate::error::{TerminalError, TerminalResult};

// ============================================================================
// Topics
// ============================================================================

/// A wire-level channel streaming one entity, written `"<kind>:<id>"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicKey {
    pub kind: EntityKind,
    pub id: String,
}

impl TopicKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Key of the entity this topic streams
    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(self.kind, self.id.clone())
    }
}

impl From<&EntityKey> for TopicKey {
    fn from(key: &EntityKey) -> Self {
        Self::new(key.kind, key.id.clone())
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for TopicKey {
    type Err = TerminalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| TerminalError::parse(format!("Topic without kind prefix: {}", s)))?;
        if id.is_empty() {
            return Err(TerminalError::parse(format!("Topic without id: {}", s)));
        }
        Ok(Self::new(kind.parse()?, id))
    }
}

impl Serialize for TopicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TopicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Server -> Client
// ============================================================================

/// Envelope type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Snapshot,
    Delta,
    Heartbeat,
    Ack,
    Error,
}

/// Raw envelope as received from the streaming endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEnvelope {
    #[serde(rename = "type")]
    pub msg_type: EnvelopeType,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Server timestamp in epoch milliseconds
    #[serde(default)]
    pub timestamp: i64,
}

/// Status carried by a subscription acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Subscribed,
    Unsubscribed,
}

/// Server verdict on an optimistic mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MutationVerdict {
    Accepted,
    Rejected {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Full entity state establishing a new baseline
    Snapshot {
        topic: TopicKey,
        seq: u64,
        fields: FieldMap,
        timestamp: DateTime<Utc>,
    },
    /// Field-level changes covering `first_seq..=seq`
    ///
    /// `first_seq == seq` unless several deltas were coalesced.
    Delta {
        topic: TopicKey,
        first_seq: u64,
        seq: u64,
        fields: FieldMap,
        timestamp: DateTime<Utc>,
    },
    HeartbeatAck {
        timestamp: DateTime<Utc>,
    },
    SubscriptionAck {
        topic: TopicKey,
        status: SubscriptionStatus,
    },
    MutationAck {
        correlation_id: String,
        verdict: MutationVerdict,
    },
    Error {
        topic: Option<TopicKey>,
        code: Option<String>,
        message: String,
    },
}

#[derive(Debug, Deserialize)]
struct SubscriptionAckPayload {
    status: SubscriptionStatus,
}

#[derive(Debug, Deserialize)]
struct MutationAckPayload {
    correlation_id: String,
    #[serde(flatten)]
    verdict: MutationVerdict,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl InboundMessage {
    /// Decode a text frame
    pub fn parse(text: &str) -> TerminalResult<Self> {
        let envelope: WireEnvelope = serde_json::from_str(text)
            .map_err(|e| TerminalError::parse(format!("Invalid envelope: {}", e)))?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: WireEnvelope) -> TerminalResult<Self> {
        let timestamp = match envelope.timestamp {
            0 => Utc::now(),
            ms => DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now),
        };

        match envelope.msg_type {
            EnvelopeType::Snapshot => Ok(InboundMessage::Snapshot {
                topic: envelope.topic.parse()?,
                seq: envelope.seq,
                fields: payload_fields(&envelope.payload)?,
                timestamp,
            }),
            EnvelopeType::Delta => Ok(InboundMessage::Delta {
                topic: envelope.topic.parse()?,
                first_seq: envelope.seq,
                seq: envelope.seq,
                fields: payload_fields(&envelope.payload)?,
                timestamp,
            }),
            EnvelopeType::Heartbeat => Ok(InboundMessage::HeartbeatAck { timestamp }),
            EnvelopeType::Ack => {
                if envelope.payload.get("correlation_id").is_some() {
                    let ack: MutationAckPayload = serde_json::from_value(envelope.payload)
                        .map_err(|e| TerminalError::parse(format!("Invalid mutation ack: {}", e)))?;
                    Ok(InboundMessage::MutationAck {
                        correlation_id: ack.correlation_id,
                        verdict: ack.verdict,
                    })
                } else {
                    let ack: SubscriptionAckPayload = serde_json::from_value(envelope.payload)
                        .map_err(|e| TerminalError::parse(format!("Invalid subscription ack: {}", e)))?;
                    Ok(InboundMessage::SubscriptionAck {
                        topic: envelope.topic.parse()?,
                        status: ack.status,
                    })
                }
            }
            EnvelopeType::Error => {
                let payload: ErrorPayload =
                    serde_json::from_value(envelope.payload).unwrap_or_default();
                let topic = if envelope.topic.is_empty() {
                    None
                } else {
                    Some(envelope.topic.parse()?)
                };
                Ok(InboundMessage::Error {
                    topic,
                    code: payload.code,
                    message: payload.message.unwrap_or_else(|| "unspecified error".to_string()),
                })
            }
        }
    }

    /// Topic this message belongs to, if any
    pub fn topic(&self) -> Option<&TopicKey> {
        match self {
            InboundMessage::Snapshot { topic, .. }
            | InboundMessage::Delta { topic, .. }
            | InboundMessage::SubscriptionAck { topic, .. } => Some(topic),
            InboundMessage::Error { topic, .. } => topic.as_ref(),
            InboundMessage::HeartbeatAck { .. } | InboundMessage::MutationAck { .. } => None,
        }
    }
}

fn payload_fields(payload: &serde_json::Value) -> TerminalResult<FieldMap> {
    fields_from_json(payload)
        .ok_or_else(|| TerminalError::parse("Snapshot/delta payload must be an object"))
}

// ============================================================================
// Client -> Server
// ============================================================================

/// Requests sent to the streaming endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    Subscribe { topics: Vec<TopicKey> },
    Unsubscribe { topics: Vec<TopicKey> },
    /// Liveness probe
    Heartbeat { timestamp: i64 },
    /// Ask for fresh snapshots after a sequence gap
    Resync { topics: Vec<TopicKey> },
    /// Optimistic mutation submitted to the server
    Submit {
        correlation_id: String,
        topic: TopicKey,
        fields: FieldMap,
    },
}

impl ClientRequest {
    /// Topics referenced by this request
    pub fn topics(&self) -> &[TopicKey] {
        match self {
            ClientRequest::Subscribe { topics }
            | ClientRequest::Unsubscribe { topics }
            | ClientRequest::Resync { topics } => topics,
            ClientRequest::Submit { topic, .. } => std::slice::from_ref(topic),
            ClientRequest::Heartbeat { .. } => &[],
        }
    }
}

// ============================================================================
// States surfaced to consumers
// ============================================================================

/// Lifecycle state of the streaming connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Never connected
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Connected and receiving data
    Connected,
    /// Connection lost, waiting for the next attempt
    Reconnecting,
    /// Shut down, no further attempts
    Closed,
}

impl ConnectionState {
    /// True while the terminal should present data as degraded
    pub fn is_degraded(&self) -> bool {
        !matches!(self, ConnectionState::Connected)
    }
}

/// Wire-level state of a topic subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TopicState {
    /// Subscribe sent (or waiting for a connection), not yet acknowledged
    Pending,
    Active,
    /// Gave up after repeated failures
    Error { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FieldValue;
    use rust_decimal_macros::dec;

    #[test]
    fn test_topic_key_parse() {
        let topic: TopicKey = "instrument:EURUSD".parse().unwrap();
        assert_eq!(topic.kind, EntityKind::Instrument);
        assert_eq!(topic.id, "EURUSD");
        assert_eq!(topic.to_string(), "instrument:EURUSD");

        // Ids may themselves contain colons
        let topic: TopicKey = "deal:T:1".parse().unwrap();
        assert_eq!(topic.id, "T:1");

        assert!("EURUSD".parse::<TopicKey>().is_err());
        assert!("instrument:".parse::<TopicKey>().is_err());
    }

    #[test]
    fn test_parse_snapshot() {
        let msg = InboundMessage::parse(
            r#"{"type":"snapshot","topic":"instrument:EURUSD","seq":10,"payload":{"price":100},"timestamp":1700000000000}"#,
        )
        .unwrap();

        match msg {
            InboundMessage::Snapshot { topic, seq, fields, timestamp } => {
                assert_eq!(topic.id, "EURUSD");
                assert_eq!(seq, 10);
                assert_eq!(fields["price"], FieldValue::Number(dec!(100)));
                assert_eq!(timestamp.timestamp_millis(), 1_700_000_000_000);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_delta_sets_first_seq() {
        let msg = InboundMessage::parse(
            r#"{"type":"delta","topic":"position:ACC1","seq":11,"payload":{"qty":5}}"#,
        )
        .unwrap();
        match msg {
            InboundMessage::Delta { first_seq, seq, .. } => {
                assert_eq!(first_seq, 11);
                assert_eq!(seq, 11);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_acks() {
        let sub = InboundMessage::parse(
            r#"{"type":"ack","topic":"instrument:EURUSD","payload":{"status":"subscribed"}}"#,
        )
        .unwrap();
        assert!(matches!(
            sub,
            InboundMessage::SubscriptionAck { status: SubscriptionStatus::Subscribed, .. }
        ));

        let rejected = InboundMessage::parse(
            r#"{"type":"ack","payload":{"correlation_id":"c-1","status":"rejected","reason":"limit"}}"#,
        )
        .unwrap();
        assert_eq!(
            rejected,
            InboundMessage::MutationAck {
                correlation_id: "c-1".to_string(),
                verdict: MutationVerdict::Rejected { reason: Some("limit".to_string()) },
            }
        );
    }

    #[test]
    fn test_parse_error_with_and_without_topic() {
        let global = InboundMessage::parse(r#"{"type":"error","payload":{"message":"boom"}}"#).unwrap();
        assert!(global.topic().is_none());

        let topic = InboundMessage::parse(
            r#"{"type":"error","topic":"deal:T-1","payload":{"code":"E42","message":"no such deal"}}"#,
        )
        .unwrap();
        assert_eq!(topic.topic().map(|t| t.id.as_str()), Some("T-1"));
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        assert!(InboundMessage::parse("PONG").is_err());
        assert!(InboundMessage::parse(r#"{"type":"bogus"}"#).is_err());
        assert!(InboundMessage::parse(r#"{"type":"delta","topic":"instrument:X","seq":1,"payload":3}"#).is_err());
    }

    #[test]
    fn test_client_request_shape() {
        let request = ClientRequest::Subscribe {
            topics: vec!["instrument:EURUSD".parse().unwrap(), "position:ACC1".parse().unwrap()],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"action": "subscribe", "topics": ["instrument:EURUSD", "position:ACC1"]})
        );
    }
}
