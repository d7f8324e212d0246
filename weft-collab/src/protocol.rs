//! JSON wire protocol between replicas and the sync server.
//!
//! Every frame is a WebSocket text frame holding one tagged object:
//! ```text
//!   client → server   {"type":"op","op":{...}}
//!                     {"type":"cursor","payload":<any>}
//!                     {"type":"save","content":"..."}
//!
//!   server → client   {"type":"init","operations":[...],"peerId":"..."}
//!                     {"type":"op","op":{...},"peerId":"..."}
//!                     {"type":"cursor","payload":<any>,"peerId":"..."}
//!                     {"type":"peer-join","peerId":"...","user":"..."}
//!                     {"type":"peer-leave","peerId":"..."}
//! ```
//!
//! The server relays operations verbatim; it never interprets them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use weft_core::Operation;

/// Document identifier, one room per document.
pub type DocumentId = Uuid;

/// Server-assigned identifier of one connection.
pub type PeerId = Uuid;

/// Messages a replica sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// A CRDT operation to persist and relay.
    Op { op: Operation },
    /// Ephemeral presence data, relayed and never stored.
    Cursor { payload: serde_json::Value },
    /// Human-readable preview of the current text.
    Save { content: String },
}

/// Messages the server sends to a replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// First frame after joining: the full operation history.
    Init {
        operations: Vec<Operation>,
        peer_id: PeerId,
    },
    Op {
        op: Operation,
        peer_id: PeerId,
    },
    Cursor {
        payload: serde_json::Value,
        peer_id: PeerId,
    },
    PeerJoin {
        peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
    },
    PeerLeave {
        peer_id: PeerId,
    },
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// The peer this message originates from or concerns.
    pub fn peer_id(&self) -> PeerId {
        match self {
            ServerMessage::Init { peer_id, .. }
            | ServerMessage::Op { peer_id, .. }
            | ServerMessage::Cursor { peer_id, .. }
            | ServerMessage::PeerJoin { peer_id, .. }
            | ServerMessage::PeerLeave { peer_id } => *peer_id,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Frame is not valid JSON or not a known message.
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("encoding error: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{ElementId, ReplicaId, SequenceStore};

    fn sample_insert() -> Operation {
        let mut store = SequenceStore::new("r1");
        Operation::from(store.local_insert('h', 0).unwrap())
    }

    #[test]
    fn test_client_op_shape() {
        let msg = ClientMessage::Op { op: sample_insert() };
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "op");
        assert_eq!(json["op"]["type"], "insert");
        assert_eq!(json["op"]["element"]["char"], "h");
    }

    #[test]
    fn test_decode_delete_op() {
        let text = r#"{"type":"op","op":{"type":"delete","id":{"replica":"r1","counter":7}}}"#;
        let msg = ClientMessage::decode(text).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Op {
                op: Operation::Delete {
                    id: ElementId::new(ReplicaId::from("r1"), 7)
                }
            }
        );
    }

    #[test]
    fn test_cursor_payload_is_opaque() {
        let text = r#"{"type":"cursor","payload":{"line":3,"ch":[1,2]}}"#;
        match ClientMessage::decode(text).unwrap() {
            ClientMessage::Cursor { payload } => assert_eq!(payload["line"], 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_server_message_field_names() {
        let peer = Uuid::new_v4();
        let init = ServerMessage::Init {
            operations: vec![sample_insert()],
            peer_id: peer,
        };
        let json: serde_json::Value = serde_json::from_str(&init.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "init");
        assert_eq!(json["peerId"], peer.to_string());
        assert_eq!(json["operations"].as_array().unwrap().len(), 1);

        let join = ServerMessage::PeerJoin {
            peer_id: peer,
            user: Some("alice".into()),
        };
        let json: serde_json::Value = serde_json::from_str(&join.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "peer-join");
        assert_eq!(json["user"], "alice");

        let leave = ServerMessage::PeerLeave { peer_id: peer };
        assert_eq!(
            leave.encode().unwrap(),
            format!(r#"{{"type":"peer-leave","peerId":"{peer}"}}"#)
        );
    }

    #[test]
    fn test_peer_join_without_user() {
        let peer = Uuid::new_v4();
        let text = format!(r#"{{"type":"peer-join","peerId":"{peer}"}}"#);
        let msg = ServerMessage::decode(&text).unwrap();
        assert_eq!(msg, ServerMessage::PeerJoin { peer_id: peer, user: None });
        assert_eq!(msg.peer_id(), peer);
    }

    #[test]
    fn test_malformed_frames() {
        for text in [
            "not json",
            r#"{"type":"bogus"}"#,
            r#"{"type":"op"}"#,
            r#"{"type":"op","op":{"type":"insert"}}"#,
            r#"{"op":{"type":"delete","id":{"replica":"r","counter":1}}}"#,
        ] {
            assert!(
                matches!(ClientMessage::decode(text), Err(ProtocolError::Malformed(_))),
                "{text} should be rejected"
            );
        }
    }
}
