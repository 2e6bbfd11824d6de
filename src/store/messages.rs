//! Append-only chat log with read receipts.
//!
//! Messages are immutable after creation except for the read-acknowledgement
//! set, which only grows. Chronological retrieval goes through a secondary
//! order tree keyed by `{project}:{timestamp}:{id}`.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use uuid::Uuid;

use super::{StoreError, StoreResult};

const TREE_MESSAGES: &str = "messages";
const TREE_MESSAGE_ORDER: &str = "message_order";

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    User,
    Ai,
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub project_id: String,
    pub sender: SenderKind,
    /// Present iff `sender` is `User`.
    pub sender_id: Option<String>,
    pub sender_name: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// User ids that have acknowledged reading this message. Grow-only.
    #[serde(default)]
    pub read_by: BTreeSet<String>,
}

impl ChatMessage {
    /// Construct a user-authored message with a fresh id and timestamp.
    pub fn from_user(
        project_id: impl Into<String>,
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            sender: SenderKind::User,
            sender_id: Some(sender_id.into()),
            sender_name: sender_name.into(),
            message: message.into(),
            timestamp: Utc::now(),
            read_by: BTreeSet::new(),
        }
    }

    /// Construct an assistant-authored message. Sender id is always absent.
    pub fn from_ai(
        project_id: impl Into<String>,
        sender_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            sender: SenderKind::Ai,
            sender_id: None,
            sender_name: sender_name.into(),
            message: message.into(),
            timestamp: Utc::now(),
            read_by: BTreeSet::new(),
        }
    }
}

/// Sled-backed message store.
#[derive(Clone)]
pub struct MessageStore {
    messages: Tree,
    order: Tree,
}

impl MessageStore {
    pub(super) fn open(db: &Db) -> StoreResult<Self> {
        Ok(Self {
            messages: db.open_tree(TREE_MESSAGES)?,
            order: db.open_tree(TREE_MESSAGE_ORDER)?,
        })
    }

    fn order_key(msg: &ChatMessage) -> String {
        format!(
            "{}:{:016}:{}",
            msg.project_id,
            msg.timestamp.timestamp_millis(),
            msg.id
        )
    }

    /// Persist a message. The record must satisfy the sender invariant:
    /// user messages carry a sender id, assistant messages never do.
    pub fn append(&self, msg: &ChatMessage) -> StoreResult<()> {
        match (msg.sender, &msg.sender_id) {
            (SenderKind::User, None) => {
                return Err(StoreError::InvalidRecord(
                    "user message without sender id".to_string(),
                ))
            }
            (SenderKind::Ai, Some(_)) => {
                return Err(StoreError::InvalidRecord(
                    "assistant message with sender id".to_string(),
                ))
            }
            _ => {}
        }

        let bytes = bincode::serialize(msg)?;
        self.messages.insert(msg.id.as_bytes(), bytes)?;
        self.order
            .insert(Self::order_key(msg).as_bytes(), msg.id.as_bytes())?;
        Ok(())
    }

    /// Load a message by id.
    pub fn get(&self, message_id: &str) -> StoreResult<Option<ChatMessage>> {
        match self.messages.get(message_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List a project's messages in chronological order, oldest first.
    ///
    /// When `limit` is given only the most recent `limit` messages are
    /// returned (still oldest first).
    pub fn list_by_project(
        &self,
        project_id: &str,
        limit: Option<usize>,
    ) -> StoreResult<Vec<ChatMessage>> {
        let prefix = format!("{}:", project_id);
        let mut out = Vec::new();

        for item in self.order.scan_prefix(prefix.as_bytes()) {
            let (_, id) = item?;
            if let Some(bytes) = self.messages.get(&id)? {
                out.push(bincode::deserialize(&bytes)?);
            }
        }

        if let Some(limit) = limit {
            if out.len() > limit {
                out.drain(..out.len() - limit);
            }
        }

        Ok(out)
    }

    /// Add `user_id` to the read set of each referenced message.
    ///
    /// Set-union semantics: repeated calls are idempotent. Unknown ids are
    /// skipped. Returns the number of messages whose read set changed.
    pub fn mark_read_by(&self, message_ids: &[String], user_id: &str) -> StoreResult<usize> {
        let mut updated = 0;

        for message_id in message_ids {
            let Some(bytes) = self.messages.get(message_id.as_bytes())? else {
                continue;
            };
            let mut msg: ChatMessage = bincode::deserialize(&bytes)?;
            if msg.read_by.insert(user_id.to_string()) {
                let bytes = bincode::serialize(&msg)?;
                self.messages.insert(msg.id.as_bytes(), bytes)?;
                updated += 1;
            }
        }

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_util::temp_database;

    #[test]
    fn test_append_and_get() {
        let (db, _dir) = temp_database();
        let store = db.messages().unwrap();

        let msg = ChatMessage::from_user("proj-1", "user-1", "Alice", "hello");
        store.append(&msg).unwrap();

        let loaded = store.get(&msg.id).unwrap().unwrap();
        assert_eq!(loaded, msg);
        assert_eq!(loaded.sender_id, Some("user-1".to_string()));
    }

    #[test]
    fn test_ai_message_has_no_sender_id() {
        let (db, _dir) = temp_database();
        let store = db.messages().unwrap();

        let msg = ChatMessage::from_ai("proj-1", "AI Assistant", "2+2 is 4");
        store.append(&msg).unwrap();

        let loaded = store.get(&msg.id).unwrap().unwrap();
        assert_eq!(loaded.sender, SenderKind::Ai);
        assert!(loaded.sender_id.is_none());
    }

    #[test]
    fn test_sender_invariant_enforced() {
        let (db, _dir) = temp_database();
        let store = db.messages().unwrap();

        let mut msg = ChatMessage::from_user("proj-1", "user-1", "Alice", "hi");
        msg.sender_id = None;
        assert!(matches!(
            store.append(&msg),
            Err(StoreError::InvalidRecord(_))
        ));

        let mut msg = ChatMessage::from_ai("proj-1", "AI Assistant", "hi");
        msg.sender_id = Some("user-1".to_string());
        assert!(matches!(
            store.append(&msg),
            Err(StoreError::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_list_is_chronological_and_scoped() {
        let (db, _dir) = temp_database();
        let store = db.messages().unwrap();

        let mut first = ChatMessage::from_user("proj-1", "u1", "Alice", "first");
        let mut second = ChatMessage::from_user("proj-1", "u2", "Bob", "second");
        let other = ChatMessage::from_user("proj-2", "u3", "Carol", "elsewhere");

        // Pin timestamps so ordering does not depend on insertion speed.
        first.timestamp = Utc::now() - chrono::Duration::seconds(10);
        second.timestamp = Utc::now();

        store.append(&second).unwrap();
        store.append(&first).unwrap();
        store.append(&other).unwrap();

        let listed = store.list_by_project("proj-1", None).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].message, "first");
        assert_eq!(listed[1].message, "second");
    }

    #[test]
    fn test_list_limit_keeps_most_recent() {
        let (db, _dir) = temp_database();
        let store = db.messages().unwrap();

        for i in 0..5 {
            let mut msg = ChatMessage::from_user("proj-1", "u1", "Alice", format!("msg {}", i));
            msg.timestamp = Utc::now() + chrono::Duration::seconds(i);
            store.append(&msg).unwrap();
        }

        let listed = store.list_by_project("proj-1", Some(2)).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].message, "msg 3");
        assert_eq!(listed[1].message, "msg 4");
    }

    #[test]
    fn test_mark_read_is_idempotent() {
        let (db, _dir) = temp_database();
        let store = db.messages().unwrap();

        let msg = ChatMessage::from_user("proj-1", "u1", "Alice", "read me");
        store.append(&msg).unwrap();

        let ids = vec![msg.id.clone()];
        assert_eq!(store.mark_read_by(&ids, "u2").unwrap(), 1);
        assert_eq!(store.mark_read_by(&ids, "u2").unwrap(), 0);

        let loaded = store.get(&msg.id).unwrap().unwrap();
        assert_eq!(loaded.read_by.len(), 1);
        assert!(loaded.read_by.contains("u2"));
    }

    #[test]
    fn test_mark_read_skips_unknown_ids() {
        let (db, _dir) = temp_database();
        let store = db.messages().unwrap();

        let ids = vec!["ghost".to_string()];
        assert_eq!(store.mark_read_by(&ids, "u1").unwrap(), 0);
    }
}
