//! JSON event schema for the WebSocket protocol.
//!
//! Every frame is one externally-tagged event; the `type` tag carries the
//! kebab-case event name. Payloads are validated against this schema at
//! decode time, and malformed frames are answered with an explicit `error`
//! event rather than a silent no-op.

use serde::{Deserialize, Serialize};

use super::ProjectId;
use crate::project::FileNode;
use crate::store::{ChatMessage, SenderKind};

/// Schema version, reported by the health endpoint.
pub const SCHEMA_VERSION: u8 = 1;

/// Maximum accepted frame size (1 MiB).
pub const MAX_EVENT_SIZE: usize = 1024 * 1024;

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("event too large: {0} bytes (max: {1})")]
    EventTooLarge(usize, usize),
}

/// Events sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Register this session in the project's room.
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        project_id: ProjectId,
        user_id: String,
        user_name: String,
    },

    /// Send a chat message; the persisted record is echoed to the room.
    #[serde(rename_all = "camelCase")]
    SendMessage {
        project_id: ProjectId,
        sender: SenderKind,
        sender_id: Option<String>,
        sender_name: String,
        message: String,
    },

    /// Acknowledge having read the referenced messages.
    #[serde(rename_all = "camelCase")]
    MarkRead {
        project_id: ProjectId,
        message_ids: Vec<String>,
        user_id: String,
    },

    /// Ephemeral typing indicator. Never persisted.
    #[serde(rename_all = "camelCase")]
    Typing {
        project_id: ProjectId,
        user_name: String,
    },

    #[serde(rename_all = "camelCase")]
    StopTyping {
        project_id: ProjectId,
        user_name: String,
    },

    /// Update the legacy code scalar and append a version snapshot.
    #[serde(rename_all = "camelCase")]
    CodeChange {
        project_id: ProjectId,
        file_name: String,
        code: String,
    },

    /// Whole-tree replacement, guarded by the project revision.
    #[serde(rename_all = "camelCase")]
    SyncFiles {
        project_id: ProjectId,
        files: Vec<FileNode>,
        #[serde(default)]
        revision: u64,
    },

    /// Targeted single-file content update.
    #[serde(rename_all = "camelCase")]
    UpdateFile {
        project_id: ProjectId,
        file_id: String,
        new_content: String,
    },
}

impl ClientEvent {
    /// The project the event addresses.
    pub fn project_id(&self) -> &str {
        match self {
            ClientEvent::JoinRoom { project_id, .. }
            | ClientEvent::SendMessage { project_id, .. }
            | ClientEvent::MarkRead { project_id, .. }
            | ClientEvent::Typing { project_id, .. }
            | ClientEvent::StopTyping { project_id, .. }
            | ClientEvent::CodeChange { project_id, .. }
            | ClientEvent::SyncFiles { project_id, .. }
            | ClientEvent::UpdateFile { project_id, .. } => project_id,
        }
    }
}

/// Events sent from server to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    UserJoined {
        project_id: ProjectId,
        user_id: String,
        user_name: String,
        color: String,
    },

    #[serde(rename_all = "camelCase")]
    UpdateOnlineUsers {
        project_id: ProjectId,
        users: Vec<String>,
    },

    /// Full persisted chat record, including generated id and timestamp.
    #[serde(rename_all = "camelCase")]
    ReceiveMessage {
        project_id: ProjectId,
        message: ChatMessage,
    },

    #[serde(rename_all = "camelCase")]
    MessagesRead {
        project_id: ProjectId,
        message_ids: Vec<String>,
        user_id: String,
    },

    #[serde(rename_all = "camelCase")]
    ShowTyping {
        project_id: ProjectId,
        user_name: String,
    },

    #[serde(rename_all = "camelCase")]
    HideTyping {
        project_id: ProjectId,
        user_name: String,
    },

    #[serde(rename_all = "camelCase")]
    ReceiveCode {
        project_id: ProjectId,
        file_name: String,
        code: String,
    },

    #[serde(rename_all = "camelCase")]
    SyncFiles {
        project_id: ProjectId,
        files: Vec<FileNode>,
        revision: u64,
    },

    #[serde(rename_all = "camelCase")]
    FileUpdated {
        project_id: ProjectId,
        file_id: String,
        new_content: String,
    },

    #[serde(rename_all = "camelCase")]
    UserLeft {
        project_id: ProjectId,
        user_id: String,
    },

    #[serde(rename_all = "camelCase")]
    Error { code: ErrorCode, message: String },
}

/// Error codes carried by the `error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    InvalidEvent,
    StaleRevision,
    ProjectNotFound,
    FileNotFound,
    AiUnavailable,
    ServerError,
}

/// Decode a client frame, validating it against the schema.
pub fn decode_client(text: &str) -> Result<ClientEvent, ProtocolError> {
    if text.len() > MAX_EVENT_SIZE {
        return Err(ProtocolError::EventTooLarge(text.len(), MAX_EVENT_SIZE));
    }
    serde_json::from_str(text).map_err(|e| ProtocolError::InvalidEvent(e.to_string()))
}

/// Encode a server event to a JSON frame.
pub fn encode_server(event: &ServerEvent) -> Result<String, ProtocolError> {
    serde_json::to_string(event).map_err(|e| ProtocolError::InvalidEvent(e.to_string()))
}

/// Build an `error` event for the given code.
pub fn error_event(code: ErrorCode, message: impl Into<String>) -> ServerEvent {
    ServerEvent::Error {
        code,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_room_wire_shape() {
        let text = r#"{"type":"join-room","projectId":"proj-42","userId":"u1","userName":"Alice"}"#;
        let event = decode_client(text).unwrap();
        assert_eq!(
            event,
            ClientEvent::JoinRoom {
                project_id: "proj-42".to_string(),
                user_id: "u1".to_string(),
                user_name: "Alice".to_string(),
            }
        );
    }

    #[test]
    fn test_code_change_round_trip() {
        let event = ClientEvent::CodeChange {
            project_id: "proj-42".to_string(),
            file_name: "main.js".to_string(),
            code: "console.log(1)".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"code-change\""));
        assert!(json.contains("\"fileName\":\"main.js\""));
        assert_eq!(decode_client(&json).unwrap(), event);
    }

    #[test]
    fn test_sync_files_revision_defaults_to_zero() {
        let text = r#"{"type":"sync-files","projectId":"p","files":[]}"#;
        match decode_client(text).unwrap() {
            ClientEvent::SyncFiles { revision, .. } => assert_eq!(revision, 0),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_rejected() {
        let err = decode_client(r#"{"type":"launch-missiles","projectId":"p"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidEvent(_)));
    }

    #[test]
    fn test_missing_field_rejected() {
        // mark-read without its user id fails schema validation outright.
        let err =
            decode_client(r#"{"type":"mark-read","projectId":"p","messageIds":[]}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidEvent(_)));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let body = "x".repeat(MAX_EVENT_SIZE + 1);
        let err = decode_client(&body).unwrap_err();
        assert!(matches!(err, ProtocolError::EventTooLarge(_, _)));
    }

    #[test]
    fn test_server_event_names() {
        let event = ServerEvent::ReceiveCode {
            project_id: "p".to_string(),
            file_name: "main.js".to_string(),
            code: "x".to_string(),
        };
        assert!(encode_server(&event).unwrap().contains("\"type\":\"receive-code\""));

        let event = ServerEvent::UpdateOnlineUsers {
            project_id: "p".to_string(),
            users: vec!["u1".to_string()],
        };
        assert!(encode_server(&event)
            .unwrap()
            .contains("\"type\":\"update-online-users\""));
    }

    #[test]
    fn test_error_event_shape() {
        let event = error_event(ErrorCode::StaleRevision, "tree revision 0 is behind 2");
        let json = encode_server(&event).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("\"code\":\"stale-revision\""));
    }
}
