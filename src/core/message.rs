//! Protocol messages and the wire codec.
//!
//! In memory a message is a sum type over the protocol's message kinds with
//! per-kind payloads. On the wire it is the flat, single-line JSON object
//! the cluster has always spoken: `message_type`, `sender_id`,
//! `transaction_id`, `query`, `data`, `checksum`, `timestamp`,
//! `communication_type`, `target_nodes`. Election acknowledgements and
//! prepare votes are distinct in memory but both travel as wire `"ACK"`;
//! the decoder tells them apart by the presence of a transaction identifier
//! and a `vote` field.

use crate::core::checksum;
use crate::core::node::NodeId;
use crate::core::result::QueryResult;
use crate::error::{DbError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// How a message is dispatched by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommunicationType {
    Unicast,
    Broadcast,
    Multicast,
}

/// The protocol's message kinds with their payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Query { sql: String },
    QueryResponse { result: QueryResult },
    Replicate { sql: String },
    ReplicateAck { success: bool },
    Heartbeat { is_coordinator: bool },
    Election,
    ElectionAck,
    Coordinator,
    Prepare { sql: String },
    PrepareVote { vote: bool, error: Option<String> },
    Commit,
    Abort,
}

impl Payload {
    /// The `message_type` value this payload travels under.
    pub fn wire_type(&self) -> &'static str {
        match self {
            Payload::Query { .. } => "QUERY",
            Payload::QueryResponse { .. } => "QUERY_RESPONSE",
            Payload::Replicate { .. } => "REPLICATE",
            Payload::ReplicateAck { .. } => "REPLICATE_ACK",
            Payload::Heartbeat { .. } => "HEARTBEAT",
            Payload::Election => "ELECTION",
            Payload::ElectionAck => "ACK",
            Payload::Coordinator => "COORDINATOR",
            Payload::Prepare { .. } => "PREPARE",
            Payload::PrepareVote { .. } => "ACK",
            Payload::Commit => "COMMIT",
            Payload::Abort => "ABORT",
        }
    }

    fn sql(&self) -> Option<&str> {
        match self {
            Payload::Query { sql } | Payload::Replicate { sql } | Payload::Prepare { sql } => {
                Some(sql)
            }
            _ => None,
        }
    }

    fn data(&self) -> Result<Value> {
        Ok(match self {
            Payload::Heartbeat { is_coordinator } => json!({ "is_coordinator": is_coordinator }),
            Payload::ReplicateAck { success } => json!({ "success": success }),
            Payload::PrepareVote { vote, error } => json!({ "vote": vote, "error": error }),
            Payload::QueryResponse { result } => serde_json::to_value(result)
                .map_err(|e| DbError::Serialization(e.to_string()))?,
            _ => Value::Null,
        })
    }
}

/// One protocol message: payload plus routing envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub payload: Payload,
    pub sender_id: NodeId,
    pub transaction_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub communication: CommunicationType,
    pub targets: Option<Vec<NodeId>>,
}

impl Message {
    /// Message addressed to exactly one node.
    pub fn unicast(payload: Payload, sender_id: NodeId, target: NodeId) -> Self {
        Self {
            payload,
            sender_id,
            transaction_id: None,
            timestamp: Utc::now(),
            communication: CommunicationType::Unicast,
            targets: Some(vec![target]),
        }
    }

    /// Message addressed to every configured node except the sender.
    pub fn broadcast(payload: Payload, sender_id: NodeId) -> Self {
        Self {
            payload,
            sender_id,
            transaction_id: None,
            timestamp: Utc::now(),
            communication: CommunicationType::Broadcast,
            targets: None,
        }
    }

    /// Message addressed to an explicit set of nodes.
    pub fn multicast(payload: Payload, sender_id: NodeId, targets: Vec<NodeId>) -> Self {
        Self {
            payload,
            sender_id,
            transaction_id: None,
            timestamp: Utc::now(),
            communication: CommunicationType::Multicast,
            targets: Some(targets),
        }
    }

    pub fn with_transaction(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    /// The single unicast target, when there is one.
    pub fn target(&self) -> Option<NodeId> {
        self.targets.as_ref().and_then(|t| t.first()).copied()
    }

    fn validate_targets(&self) -> Result<()> {
        let count = self.targets.as_ref().map_or(0, |t| t.len());
        match self.communication {
            CommunicationType::Unicast if count != 1 => Err(DbError::InvalidOperation(format!(
                "unicast requires exactly one target, got {}",
                count
            ))),
            CommunicationType::Multicast if count == 0 => Err(DbError::InvalidOperation(
                "multicast requires at least one target".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Serialize a message to its single-line wire form, checksum included.
/// The transport appends the terminating newline.
pub fn encode(message: &Message) -> Result<String> {
    message.validate_targets()?;

    let mut map = Map::new();
    map.insert(
        "message_type".to_string(),
        json!(message.payload.wire_type()),
    );
    map.insert("sender_id".to_string(), json!(message.sender_id));
    map.insert("transaction_id".to_string(), json!(message.transaction_id));
    map.insert("query".to_string(), json!(message.payload.sql()));
    map.insert("data".to_string(), message.payload.data()?);
    map.insert(
        "timestamp".to_string(),
        json!(message.timestamp.to_rfc3339()),
    );
    map.insert(
        "communication_type".to_string(),
        serde_json::to_value(message.communication)
            .map_err(|e| DbError::Serialization(e.to_string()))?,
    );
    map.insert("target_nodes".to_string(), json!(message.targets));
    checksum::stamp(&mut map);

    Ok(Value::Object(map).to_string())
}

/// Decode one wire frame, verifying its checksum first. A frame that fails
/// verification or parsing is dropped by the caller.
pub fn decode(frame: &str) -> Result<Message> {
    let value: Value = serde_json::from_str(frame.trim())
        .map_err(|e| DbError::Serialization(format!("malformed frame: {}", e)))?;
    let map = value
        .as_object()
        .ok_or_else(|| DbError::Serialization("frame is not a JSON object".to_string()))?;

    if !checksum::verify(map) {
        return Err(DbError::Checksum(format!(
            "frame of type {} failed verification",
            map.get("message_type")
                .and_then(Value::as_str)
                .unwrap_or("?")
        )));
    }

    decode_fields(map)
}

fn decode_fields(map: &Map<String, Value>) -> Result<Message> {
    let message_type = required_str(map, "message_type")?;
    let sender_id = map
        .get("sender_id")
        .and_then(Value::as_u64)
        .ok_or_else(|| DbError::Serialization("missing sender_id".to_string()))?;
    let transaction_id = optional_str(map, "transaction_id");
    let query = optional_str(map, "query");
    let data = map.get("data").filter(|v| !v.is_null());

    let timestamp = DateTime::parse_from_rfc3339(required_str(map, "timestamp")?)
        .map_err(|e| DbError::Serialization(format!("bad timestamp: {}", e)))?
        .with_timezone(&Utc);

    let communication = match required_str(map, "communication_type")? {
        "UNICAST" => CommunicationType::Unicast,
        "BROADCAST" => CommunicationType::Broadcast,
        "MULTICAST" => CommunicationType::Multicast,
        other => {
            return Err(DbError::Serialization(format!(
                "unknown communication type {}",
                other
            )))
        }
    };

    let targets = match map.get("target_nodes") {
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .map(|v| {
                    v.as_u64()
                        .ok_or_else(|| DbError::Serialization("bad target node id".to_string()))
                })
                .collect::<Result<Vec<NodeId>>>()?,
        ),
        _ => None,
    };

    let sql = || -> Result<String> {
        query
            .map(str::to_string)
            .ok_or_else(|| DbError::Serialization(format!("{} without query", message_type)))
    };

    let payload = match message_type {
        "QUERY" => Payload::Query { sql: sql()? },
        "QUERY_RESPONSE" => Payload::QueryResponse {
            result: serde_json::from_value(data.cloned().unwrap_or(Value::Null))
                .map_err(|e| DbError::Serialization(format!("bad query result: {}", e)))?,
        },
        "REPLICATE" => Payload::Replicate { sql: sql()? },
        "REPLICATE_ACK" => Payload::ReplicateAck {
            success: data
                .and_then(|d| d.get("success"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        "HEARTBEAT" => Payload::Heartbeat {
            is_coordinator: data
                .and_then(|d| d.get("is_coordinator"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        "ELECTION" => Payload::Election,
        "COORDINATOR" => Payload::Coordinator,
        "PREPARE" => Payload::Prepare { sql: sql()? },
        "COMMIT" => Payload::Commit,
        "ABORT" => Payload::Abort,
        // The wire reuses ACK for election acknowledgements and 2PC votes;
        // only votes carry a transaction identifier and a vote field.
        "ACK" => match (transaction_id.is_some(), data.and_then(|d| d.get("vote"))) {
            (true, Some(vote)) => Payload::PrepareVote {
                vote: vote.as_bool().unwrap_or(false),
                error: data
                    .and_then(|d| d.get("error"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            _ => Payload::ElectionAck,
        },
        other => {
            return Err(DbError::Serialization(format!(
                "unknown message type {}",
                other
            )))
        }
    };

    Ok(Message {
        payload,
        sender_id,
        transaction_id: transaction_id.map(str::to_string),
        timestamp,
        communication,
        targets,
    })
}

fn required_str<'a>(map: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    map.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| DbError::Serialization(format!("missing {}", key)))
}

fn optional_str<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str)
}
