//! The synchronization engine.
//!
//! The engine is the only component that mutates room state or triggers
//! store writes in response to live traffic. Each incoming event is
//! handled to completion; broadcasts go to the sessions currently joined
//! to the room, never to the project's member list.
//!
//! The real-time path favors liveness over durability: a failed store
//! write is logged and the broadcast still goes out, so connected peers
//! see the update even when persistence is down. Validation failures on
//! structurally valid events are logged no-ops; schema-invalid frames are
//! rejected earlier, at decode time.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::protocol::{error_event, ClientEvent, ErrorCode, ServerEvent};
use super::registry::RoomRegistry;
use super::{EngineError, EngineResult, ProjectId, SessionId, UserId};
use crate::proxy::AiResponder;
use crate::store::{ChatMessage, MessageStore, ProjectStore, SenderKind, StoreError, VersionLog};

/// Configuration for the engine.
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// Substring of a chat body that summons the assistant.
    pub ai_mention: String,
    /// Display name for assistant-authored messages.
    pub assistant_name: String,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            ai_mention: "@ai".to_string(),
            assistant_name: "AI Assistant".to_string(),
        }
    }
}

/// Join state of a session once it has entered a room.
#[derive(Debug, Clone)]
pub struct JoinState {
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub user_name: String,
}

/// One live connection and its transient state.
pub struct Session {
    pub session_id: SessionId,
    pub color: String,
    tx: mpsc::UnboundedSender<ServerEvent>,
    pub joined: Option<JoinState>,
}

impl Session {
    fn new(
        session_id: impl Into<String>,
        color: impl Into<String>,
        tx: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            color: color.into(),
            tx,
            joined: None,
        }
    }

    /// Queue an event for delivery to this session.
    pub fn send(&self, event: ServerEvent) -> EngineResult<()> {
        self.tx.send(event).map_err(|_| EngineError::ConnectionClosed)
    }
}

/// Counters for the health endpoint.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub active_rooms: usize,
    pub active_sessions: usize,
}

/// The synchronization engine.
///
/// Cheap to clone; clones share all state. A clone is moved into the
/// assistant-reply task so the reply can be delivered after the event
/// handler has returned.
#[derive(Clone)]
pub struct SyncEngine {
    config: SyncEngineConfig,
    registry: Arc<RoomRegistry>,
    sessions: Arc<DashMap<SessionId, Arc<RwLock<Session>>>>,
    messages: MessageStore,
    projects: ProjectStore,
    versions: VersionLog,
    ai: Arc<dyn AiResponder>,
}

impl SyncEngine {
    pub fn new(
        registry: Arc<RoomRegistry>,
        messages: MessageStore,
        projects: ProjectStore,
        versions: VersionLog,
        ai: Arc<dyn AiResponder>,
        config: SyncEngineConfig,
    ) -> Self {
        Self {
            config,
            registry,
            sessions: Arc::new(DashMap::new()),
            messages,
            projects,
            versions,
            ai,
        }
    }

    /// Register a freshly connected session.
    pub fn register_session(
        &self,
        session_id: &str,
        color: &str,
        tx: mpsc::UnboundedSender<ServerEvent>,
    ) {
        let session = Session::new(session_id, color, tx);
        self.sessions
            .insert(session_id.to_string(), Arc::new(RwLock::new(session)));
        debug!("session registered: {}", session_id);
    }

    /// Dispatch one decoded client event.
    pub async fn handle_event(&self, session_id: &str, event: ClientEvent) {
        match event {
            ClientEvent::JoinRoom {
                project_id,
                user_id,
                user_name,
            } => self.handle_join(session_id, project_id, user_id, user_name),

            ClientEvent::SendMessage {
                project_id,
                sender,
                sender_id,
                sender_name,
                message,
            } => self.handle_send_message(project_id, sender, sender_id, sender_name, message),

            ClientEvent::MarkRead {
                project_id,
                message_ids,
                user_id,
            } => self.handle_mark_read(project_id, message_ids, user_id),

            ClientEvent::Typing {
                project_id,
                user_name,
            } => self.handle_typing(session_id, project_id, user_name, true),

            ClientEvent::StopTyping {
                project_id,
                user_name,
            } => self.handle_typing(session_id, project_id, user_name, false),

            ClientEvent::CodeChange {
                project_id,
                file_name,
                code,
            } => self.handle_code_change(session_id, project_id, file_name, code),

            ClientEvent::SyncFiles {
                project_id,
                files,
                revision,
            } => self.handle_sync_files(session_id, project_id, files, revision),

            ClientEvent::UpdateFile {
                project_id,
                file_id,
                new_content,
            } => self.handle_update_file(session_id, project_id, file_id, new_content),
        }
    }

    fn handle_join(&self, session_id: &str, project_id: String, user_id: String, user_name: String) {
        // Deliberate permissiveness: a join with missing identity is a
        // logged no-op, not an error back to the client.
        if project_id.is_empty() || user_id.is_empty() {
            debug!("ignoring join with missing project or user id");
            return;
        }

        let Some(session) = self.sessions.get(session_id).map(|s| s.clone()) else {
            warn!("join from unknown session {}", session_id);
            return;
        };

        {
            let mut session = session.write();
            if let Some(joined) = &session.joined {
                warn!(
                    "session {} already joined to {}; ignoring join to {}",
                    session_id, joined.project_id, project_id
                );
                return;
            }
            session.joined = Some(JoinState {
                project_id: project_id.clone(),
                user_id: user_id.clone(),
                user_name: user_name.clone(),
            });
        }

        let room = self.registry.get_or_create(&project_id);
        room.add_session(session_id, &user_id);

        info!("user {} joined room {}", user_id, project_id);

        let color = session.read().color.clone();
        self.broadcast_to_room(
            &project_id,
            Some(session_id),
            ServerEvent::UserJoined {
                project_id: project_id.clone(),
                user_id,
                user_name,
                color,
            },
        );
        self.broadcast_to_room(
            &project_id,
            Some(session_id),
            ServerEvent::UpdateOnlineUsers {
                project_id: project_id.clone(),
                users: room.online_users(),
            },
        );
    }

    fn handle_send_message(
        &self,
        project_id: String,
        sender: SenderKind,
        sender_id: Option<String>,
        sender_name: String,
        message: String,
    ) {
        if project_id.is_empty() || message.is_empty() {
            debug!("ignoring chat message with missing fields");
            return;
        }

        let chat = match sender {
            SenderKind::User => {
                let Some(sender_id) = sender_id else {
                    warn!("ignoring user chat message without sender id");
                    return;
                };
                ChatMessage::from_user(&project_id, sender_id, sender_name, &message)
            }
            SenderKind::Ai => ChatMessage::from_ai(&project_id, sender_name, &message),
        };

        // Liveness over durability: the room still sees the message when
        // the write fails.
        if let Err(e) = self.messages.append(&chat) {
            error!("failed to persist chat message: {}", e);
        }

        let mention = chat.sender == SenderKind::User
            && chat
                .message
                .to_lowercase()
                .contains(&self.config.ai_mention);

        // The sender gets the broadcast too; the round-trip is the
        // authoritative echo.
        self.broadcast_to_room(
            &project_id,
            None,
            ServerEvent::ReceiveMessage {
                project_id: project_id.clone(),
                message: chat.clone(),
            },
        );

        if mention {
            self.spawn_assistant_reply(project_id, chat.message);
        }
    }

    /// Ask the assistant for a reply off the event path, then persist and
    /// broadcast it as a second message.
    fn spawn_assistant_reply(&self, project_id: ProjectId, prompt: String) {
        let engine = self.clone();

        engine.broadcast_to_room(
            &project_id,
            None,
            ServerEvent::ShowTyping {
                project_id: project_id.clone(),
                user_name: engine.config.assistant_name.clone(),
            },
        );

        tokio::spawn(async move {
            let result = engine.ai.reply(&prompt).await;

            engine.broadcast_to_room(
                &project_id,
                None,
                ServerEvent::HideTyping {
                    project_id: project_id.clone(),
                    user_name: engine.config.assistant_name.clone(),
                },
            );

            match result {
                Ok(reply) => {
                    let chat =
                        ChatMessage::from_ai(&project_id, &engine.config.assistant_name, reply);
                    if let Err(e) = engine.messages.append(&chat) {
                        error!("failed to persist assistant message: {}", e);
                    }
                    engine.broadcast_to_room(
                        &project_id,
                        None,
                        ServerEvent::ReceiveMessage {
                            project_id: project_id.clone(),
                            message: chat,
                        },
                    );
                }
                Err(e) => {
                    warn!("assistant reply failed: {}", e);
                    engine.broadcast_to_room(
                        &project_id,
                        None,
                        error_event(ErrorCode::AiUnavailable, e.to_string()),
                    );
                }
            }
        });
    }

    fn handle_mark_read(&self, project_id: String, message_ids: Vec<String>, user_id: String) {
        if project_id.is_empty() || user_id.is_empty() || message_ids.is_empty() {
            debug!("ignoring mark-read with missing fields");
            return;
        }

        match self.messages.mark_read_by(&message_ids, &user_id) {
            Ok(updated) => debug!("{} marked {} messages read", user_id, updated),
            Err(e) => error!("failed to persist read receipts: {}", e),
        }

        self.broadcast_to_room(
            &project_id,
            None,
            ServerEvent::MessagesRead {
                project_id: project_id.clone(),
                message_ids,
                user_id,
            },
        );
    }

    fn handle_typing(&self, session_id: &str, project_id: String, user_name: String, typing: bool) {
        if project_id.is_empty() || user_name.is_empty() {
            return;
        }

        if let Some(room) = self.registry.get(&project_id) {
            if typing {
                room.typing_started(&user_name);
            } else {
                room.typing_stopped(&user_name);
            }
        }

        let event = if typing {
            ServerEvent::ShowTyping {
                project_id: project_id.clone(),
                user_name,
            }
        } else {
            ServerEvent::HideTyping {
                project_id: project_id.clone(),
                user_name,
            }
        };
        self.broadcast_to_room(&project_id, Some(session_id), event);
    }

    fn handle_code_change(
        &self,
        session_id: &str,
        project_id: String,
        file_name: String,
        code: String,
    ) {
        if project_id.is_empty() || file_name.is_empty() {
            debug!("ignoring code change with missing fields");
            return;
        }

        // Two independent writes; partial failure of one never rolls back
        // the other.
        match self.projects.set_code(&project_id, &code) {
            Ok(()) => {}
            Err(StoreError::NotFound(what)) => warn!("code change for unknown {}", what),
            Err(e) => error!("failed to persist code change: {}", e),
        }
        if let Err(e) = self.versions.append(&project_id, &file_name, &code) {
            error!("failed to append version snapshot: {}", e);
        }

        // The originator already has the content locally.
        self.broadcast_to_room(
            &project_id,
            Some(session_id),
            ServerEvent::ReceiveCode {
                project_id: project_id.clone(),
                file_name,
                code,
            },
        );
    }

    fn handle_sync_files(
        &self,
        session_id: &str,
        project_id: String,
        files: Vec<crate::project::FileNode>,
        revision: u64,
    ) {
        if project_id.is_empty() {
            return;
        }

        match self
            .projects
            .replace_file_tree(&project_id, files.clone(), revision)
        {
            Ok(new_revision) => {
                self.broadcast_to_room(
                    &project_id,
                    Some(session_id),
                    ServerEvent::SyncFiles {
                        project_id: project_id.clone(),
                        files,
                        revision: new_revision,
                    },
                );
            }
            Err(StoreError::StaleRevision { current, provided }) => {
                // A late writer acted on an old tree; reject instead of
                // letting it overwrite newer state.
                warn!(
                    "stale tree sync for {}: current {}, provided {}",
                    project_id, current, provided
                );
                let _ = self.send_to(
                    session_id,
                    error_event(
                        ErrorCode::StaleRevision,
                        format!("tree revision {} is behind {}", provided, current),
                    ),
                );
            }
            Err(StoreError::InvalidRecord(msg)) => {
                let _ = self.send_to(session_id, error_event(ErrorCode::InvalidEvent, msg));
            }
            Err(StoreError::NotFound(what)) => warn!("tree sync for unknown {}", what),
            Err(e) => error!("failed to persist file tree: {}", e),
        }
    }

    fn handle_update_file(
        &self,
        session_id: &str,
        project_id: String,
        file_id: String,
        new_content: String,
    ) {
        if project_id.is_empty() || file_id.is_empty() {
            return;
        }

        match self.projects.update_file(&project_id, &file_id, &new_content) {
            Ok(file_name) => {
                if let Err(e) = self.versions.append(&project_id, &file_name, &new_content) {
                    error!("failed to append version snapshot: {}", e);
                }
                self.broadcast_to_room(
                    &project_id,
                    Some(session_id),
                    ServerEvent::FileUpdated {
                        project_id: project_id.clone(),
                        file_id,
                        new_content,
                    },
                );
            }
            Err(StoreError::NotFound(what)) => warn!("file update for unknown {}", what),
            Err(e) => error!("failed to persist file update: {}", e),
        }
    }

    /// Tear down a session on disconnect.
    pub fn disconnect(&self, session_id: &str) {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return;
        };

        let joined = session.read().joined.clone();
        let Some(joined) = joined else {
            debug!("session {} disconnected before joining", session_id);
            return;
        };

        let Some(room) = self.registry.get(&joined.project_id) else {
            return;
        };

        if room.typing_stopped(&joined.user_name) {
            self.broadcast_to_room(
                &joined.project_id,
                Some(session_id),
                ServerEvent::HideTyping {
                    project_id: joined.project_id.clone(),
                    user_name: joined.user_name.clone(),
                },
            );
        }

        if let Some((user_id, went_offline)) = room.remove_session(session_id) {
            if went_offline {
                self.broadcast_to_room(
                    &joined.project_id,
                    Some(session_id),
                    ServerEvent::UserLeft {
                        project_id: joined.project_id.clone(),
                        user_id,
                    },
                );
                self.broadcast_to_room(
                    &joined.project_id,
                    Some(session_id),
                    ServerEvent::UpdateOnlineUsers {
                        project_id: joined.project_id.clone(),
                        users: room.online_users(),
                    },
                );
            }
        }

        self.registry.remove_if_empty(&joined.project_id);
        info!(
            "session {} left room {}",
            session_id, joined.project_id
        );
    }

    /// Send an event to every session joined to the room, optionally
    /// excluding one (usually the originator).
    pub fn broadcast_to_room(&self, project_id: &str, exclude: Option<&str>, event: ServerEvent) {
        let Some(room) = self.registry.get(project_id) else {
            return;
        };

        for session_id in room.session_ids() {
            if exclude == Some(session_id.as_str()) {
                continue;
            }
            if let Some(session) = self.sessions.get(&session_id) {
                let session = session.read();
                // A closed channel means the session is going away; its
                // disconnect handler cleans up.
                if session.send(event.clone()).is_err() {
                    debug!("dropping event for closed session {}", session.session_id);
                }
            }
        }
    }

    /// Send an event to one session.
    pub fn send_to(&self, session_id: &str, event: ServerEvent) -> EngineResult<()> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?
            .clone();
        let result = session.read().send(event);
        result
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            active_rooms: self.registry.room_count(),
            active_sessions: self.sessions.len(),
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::protocol::ErrorCode;
    use crate::project::FileNode;
    use crate::proxy::AiError;
    use crate::store::test_util::temp_database;
    use crate::store::Database;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    struct CannedAi {
        reply: String,
    }

    #[async_trait]
    impl AiResponder for CannedAi {
        async fn reply(&self, _prompt: &str) -> Result<String, AiError> {
            Ok(self.reply.clone())
        }
    }

    struct FailingAi;

    #[async_trait]
    impl AiResponder for FailingAi {
        async fn reply(&self, _prompt: &str) -> Result<String, AiError> {
            Err(AiError::Request("model offline".to_string()))
        }
    }

    fn test_engine(ai: Arc<dyn AiResponder>) -> (Arc<SyncEngine>, Database, TempDir) {
        let (db, dir) = temp_database();
        let engine = Arc::new(SyncEngine::new(
            Arc::new(RoomRegistry::new()),
            db.messages().unwrap(),
            db.projects().unwrap(),
            db.versions().unwrap(),
            ai,
            SyncEngineConfig::default(),
        ));
        (engine, db, dir)
    }

    fn connect(engine: &Arc<SyncEngine>, session_id: &str) -> UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        engine.register_session(session_id, "#3b82f6", tx);
        rx
    }

    async fn join(engine: &Arc<SyncEngine>, session_id: &str, project: &str, user: &str, name: &str) {
        engine
            .handle_event(
                session_id,
                ClientEvent::JoinRoom {
                    project_id: project.to_string(),
                    user_id: user.to_string(),
                    user_name: name.to_string(),
                },
            )
            .await;
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    async fn recv(rx: &mut UnboundedReceiver<ServerEvent>) -> ServerEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_join_then_disconnect_restores_online_set() {
        let (engine, _db, _dir) = test_engine(Arc::new(FailingAi));
        let mut rx_a = connect(&engine, "sa");
        let _rx_b = connect(&engine, "sb");

        join(&engine, "sa", "proj-1", "u1", "Alice").await;
        join(&engine, "sb", "proj-1", "u2", "Bob").await;

        let events = drain(&mut rx_a);
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::UserJoined { user_id, .. } if user_id == "u2"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::UpdateOnlineUsers { users, .. } if *users == vec!["u1", "u2"]
        )));

        engine.disconnect("sb");

        let events = drain(&mut rx_a);
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::UserLeft { user_id, .. } if user_id == "u2"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::UpdateOnlineUsers { users, .. } if *users == vec!["u1"]
        )));

        let room = engine.registry().get("proj-1").unwrap();
        assert_eq!(room.online_users(), vec!["u1"]);
    }

    #[tokio::test]
    async fn test_join_with_missing_ids_is_a_no_op() {
        let (engine, _db, _dir) = test_engine(Arc::new(FailingAi));
        let _rx = connect(&engine, "sa");

        join(&engine, "sa", "", "u1", "Alice").await;
        join(&engine, "sa", "proj-1", "", "Alice").await;

        assert_eq!(engine.registry().room_count(), 0);
    }

    #[tokio::test]
    async fn test_chat_broadcast_includes_sender_and_persists() {
        let (engine, db, _dir) = test_engine(Arc::new(FailingAi));
        let mut rx_a = connect(&engine, "sa");
        let mut rx_b = connect(&engine, "sb");

        join(&engine, "sa", "proj-1", "u1", "Alice").await;
        join(&engine, "sb", "proj-1", "u2", "Bob").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        engine
            .handle_event(
                "sa",
                ClientEvent::SendMessage {
                    project_id: "proj-1".to_string(),
                    sender: SenderKind::User,
                    sender_id: Some("u1".to_string()),
                    sender_name: "Alice".to_string(),
                    message: "hello room".to_string(),
                },
            )
            .await;

        // The broadcast round-trip is the authoritative echo: the sender
        // receives the persisted record too.
        for rx in [&mut rx_a, &mut rx_b] {
            match recv(rx).await {
                ServerEvent::ReceiveMessage { message, .. } => {
                    assert_eq!(message.message, "hello room");
                    assert_eq!(message.sender_id, Some("u1".to_string()));
                    assert!(!message.id.is_empty());
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }

        let stored = db.messages().unwrap().list_by_project("proj-1", None).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].sender, SenderKind::User);
        assert_eq!(stored[0].sender_id, Some("u1".to_string()));
    }

    #[tokio::test]
    async fn test_ai_mention_produces_second_message() {
        let (engine, db, _dir) = test_engine(Arc::new(CannedAi {
            reply: "2 + 2 = 4".to_string(),
        }));
        let mut rx_a = connect(&engine, "sa");
        join(&engine, "sa", "proj-1", "u1", "Alice").await;
        drain(&mut rx_a);

        engine
            .handle_event(
                "sa",
                ClientEvent::SendMessage {
                    project_id: "proj-1".to_string(),
                    sender: SenderKind::User,
                    sender_id: Some("u1".to_string()),
                    sender_name: "Alice".to_string(),
                    message: "hello @ai what is 2+2".to_string(),
                },
            )
            .await;

        // User echo, assistant typing indicator, then the reply.
        let mut got_user_echo = false;
        let mut got_show_typing = false;
        let mut got_hide_typing = false;
        loop {
            match recv(&mut rx_a).await {
                ServerEvent::ReceiveMessage { message, .. } => {
                    if message.sender == SenderKind::User {
                        got_user_echo = true;
                    } else {
                        assert!(got_user_echo, "assistant reply arrived before user echo");
                        assert!(got_hide_typing);
                        assert!(message.sender_id.is_none());
                        assert!(!message.message.is_empty());
                        break;
                    }
                }
                ServerEvent::ShowTyping { user_name, .. } => {
                    assert_eq!(user_name, "AI Assistant");
                    got_show_typing = true;
                }
                ServerEvent::HideTyping { .. } => {
                    assert!(got_show_typing);
                    got_hide_typing = true;
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }

        let stored = db.messages().unwrap().list_by_project("proj-1", None).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].sender, SenderKind::User);
        assert_eq!(stored[0].message, "hello @ai what is 2+2");
        assert_eq!(stored[1].sender, SenderKind::Ai);
        assert!(stored[1].sender_id.is_none());
        assert!(!stored[1].message.is_empty());
    }

    #[tokio::test]
    async fn test_ai_failure_clears_typing_and_reports() {
        let (engine, db, _dir) = test_engine(Arc::new(FailingAi));
        let mut rx_a = connect(&engine, "sa");
        join(&engine, "sa", "proj-1", "u1", "Alice").await;
        drain(&mut rx_a);

        engine
            .handle_event(
                "sa",
                ClientEvent::SendMessage {
                    project_id: "proj-1".to_string(),
                    sender: SenderKind::User,
                    sender_id: Some("u1".to_string()),
                    sender_name: "Alice".to_string(),
                    message: "@ai are you there".to_string(),
                },
            )
            .await;

        let mut got_hide_typing = false;
        loop {
            match recv(&mut rx_a).await {
                ServerEvent::Error { code, message } => {
                    assert_eq!(code, ErrorCode::AiUnavailable);
                    assert!(message.contains("model offline"));
                    assert!(got_hide_typing);
                    break;
                }
                ServerEvent::HideTyping { .. } => got_hide_typing = true,
                ServerEvent::ReceiveMessage { message, .. } => {
                    assert_eq!(message.sender, SenderKind::User);
                }
                ServerEvent::ShowTyping { .. } => {}
                other => panic!("unexpected event: {:?}", other),
            }
        }

        // Only the user message was persisted.
        let stored = db.messages().unwrap().list_by_project("proj-1", None).unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_read_is_idempotent_through_the_engine() {
        let (engine, db, _dir) = test_engine(Arc::new(FailingAi));
        let mut rx_a = connect(&engine, "sa");
        join(&engine, "sa", "proj-1", "u1", "Alice").await;

        let msg = ChatMessage::from_user("proj-1", "u1", "Alice", "read me");
        db.messages().unwrap().append(&msg).unwrap();
        drain(&mut rx_a);

        for _ in 0..2 {
            engine
                .handle_event(
                    "sa",
                    ClientEvent::MarkRead {
                        project_id: "proj-1".to_string(),
                        message_ids: vec![msg.id.clone()],
                        user_id: "u2".to_string(),
                    },
                )
                .await;
        }

        let events = drain(&mut rx_a);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, ServerEvent::MessagesRead { .. }))
                .count(),
            2
        );

        let loaded = db.messages().unwrap().get(&msg.id).unwrap().unwrap();
        assert_eq!(loaded.read_by.len(), 1);
        assert!(loaded.read_by.contains("u2"));
    }

    #[tokio::test]
    async fn test_code_change_reaches_peers_and_version_log() {
        let (engine, db, _dir) = test_engine(Arc::new(FailingAi));
        let mut rx_a = connect(&engine, "sa");
        let mut rx_b = connect(&engine, "sb");

        join(&engine, "sa", "proj-42", "u1", "Alice").await;
        join(&engine, "sb", "proj-42", "u2", "Bob").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        engine
            .handle_event(
                "sa",
                ClientEvent::CodeChange {
                    project_id: "proj-42".to_string(),
                    file_name: "main.js".to_string(),
                    code: "console.log(1)".to_string(),
                },
            )
            .await;

        match recv(&mut rx_b).await {
            ServerEvent::ReceiveCode {
                project_id,
                file_name,
                code,
            } => {
                assert_eq!(project_id, "proj-42");
                assert_eq!(file_name, "main.js");
                assert_eq!(code, "console.log(1)");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // The originator already has the content; no echo.
        assert!(drain(&mut rx_a).is_empty());

        let recent = db
            .versions()
            .unwrap()
            .list_recent("proj-42", Some("main.js"), 1)
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].content, "console.log(1)");
    }

    #[tokio::test]
    async fn test_broadcast_stays_inside_the_room() {
        let (engine, _db, _dir) = test_engine(Arc::new(FailingAi));
        let mut rx_b = connect(&engine, "sb");
        let mut rx_c = connect(&engine, "sc");
        let _rx_a = connect(&engine, "sa");

        join(&engine, "sa", "proj-1", "u1", "Alice").await;
        join(&engine, "sb", "proj-1", "u2", "Bob").await;
        join(&engine, "sc", "proj-2", "u3", "Carol").await;
        drain(&mut rx_b);
        drain(&mut rx_c);

        engine
            .handle_event(
                "sa",
                ClientEvent::CodeChange {
                    project_id: "proj-1".to_string(),
                    file_name: "main.js".to_string(),
                    code: "x".to_string(),
                },
            )
            .await;

        assert!(matches!(
            recv(&mut rx_b).await,
            ServerEvent::ReceiveCode { .. }
        ));
        assert!(drain(&mut rx_c).is_empty());
    }

    #[tokio::test]
    async fn test_sync_files_rejects_stale_revision() {
        let (engine, db, _dir) = test_engine(Arc::new(FailingAi));
        let projects = db.projects().unwrap();
        let project = projects.create("demo", vec![]).unwrap();

        let mut rx_a = connect(&engine, "sa");
        let mut rx_b = connect(&engine, "sb");
        join(&engine, "sa", &project.id, "u1", "Alice").await;
        join(&engine, "sb", &project.id, "u2", "Bob").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        let tree = vec![FileNode::file("f1", "main.js", "one")];
        engine
            .handle_event(
                "sa",
                ClientEvent::SyncFiles {
                    project_id: project.id.clone(),
                    files: tree.clone(),
                    revision: 0,
                },
            )
            .await;

        match recv(&mut rx_b).await {
            ServerEvent::SyncFiles { files, revision, .. } => {
                assert_eq!(files, tree);
                assert_eq!(revision, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // A second writer still at revision 0 is rejected and told so.
        engine
            .handle_event(
                "sb",
                ClientEvent::SyncFiles {
                    project_id: project.id.clone(),
                    files: vec![],
                    revision: 0,
                },
            )
            .await;

        match recv(&mut rx_b).await {
            ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::StaleRevision),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(drain(&mut rx_a).is_empty());

        let loaded = projects.get(&project.id).unwrap().unwrap();
        assert_eq!(loaded.files, tree);
        assert_eq!(loaded.revision, 1);
    }

    #[tokio::test]
    async fn test_update_file_broadcasts_and_versions() {
        let (engine, db, _dir) = test_engine(Arc::new(FailingAi));
        let projects = db.projects().unwrap();
        let project = projects.create("demo", vec![]).unwrap();
        projects
            .replace_file_tree(
                &project.id,
                vec![FileNode::file("f1", "main.js", "old")],
                0,
            )
            .unwrap();

        let mut rx_b = connect(&engine, "sb");
        let _rx_a = connect(&engine, "sa");
        join(&engine, "sa", &project.id, "u1", "Alice").await;
        join(&engine, "sb", &project.id, "u2", "Bob").await;
        drain(&mut rx_b);

        engine
            .handle_event(
                "sa",
                ClientEvent::UpdateFile {
                    project_id: project.id.clone(),
                    file_id: "f1".to_string(),
                    new_content: "new".to_string(),
                },
            )
            .await;

        match recv(&mut rx_b).await {
            ServerEvent::FileUpdated {
                file_id,
                new_content,
                ..
            } => {
                assert_eq!(file_id, "f1");
                assert_eq!(new_content, "new");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let recent = db
            .versions()
            .unwrap()
            .list_recent(&project.id, Some("main.js"), 1)
            .unwrap();
        assert_eq!(recent[0].content, "new");
    }

    #[tokio::test]
    async fn test_update_unknown_file_is_a_silent_no_op() {
        let (engine, db, _dir) = test_engine(Arc::new(FailingAi));
        let projects = db.projects().unwrap();
        let project = projects.create("demo", vec![]).unwrap();

        let mut rx_b = connect(&engine, "sb");
        let _rx_a = connect(&engine, "sa");
        join(&engine, "sa", &project.id, "u1", "Alice").await;
        join(&engine, "sb", &project.id, "u2", "Bob").await;
        drain(&mut rx_b);

        engine
            .handle_event(
                "sa",
                ClientEvent::UpdateFile {
                    project_id: project.id.clone(),
                    file_id: "ghost".to_string(),
                    new_content: "x".to_string(),
                },
            )
            .await;

        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_typing_indicators_skip_the_sender() {
        let (engine, _db, _dir) = test_engine(Arc::new(FailingAi));
        let mut rx_a = connect(&engine, "sa");
        let mut rx_b = connect(&engine, "sb");
        join(&engine, "sa", "proj-1", "u1", "Alice").await;
        join(&engine, "sb", "proj-1", "u2", "Bob").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        engine
            .handle_event(
                "sa",
                ClientEvent::Typing {
                    project_id: "proj-1".to_string(),
                    user_name: "Alice".to_string(),
                },
            )
            .await;

        assert!(matches!(
            recv(&mut rx_b).await,
            ServerEvent::ShowTyping { user_name, .. } if user_name == "Alice"
        ));
        assert!(drain(&mut rx_a).is_empty());

        engine
            .handle_event(
                "sa",
                ClientEvent::StopTyping {
                    project_id: "proj-1".to_string(),
                    user_name: "Alice".to_string(),
                },
            )
            .await;

        assert!(matches!(
            recv(&mut rx_b).await,
            ServerEvent::HideTyping { user_name, .. } if user_name == "Alice"
        ));
    }
}
