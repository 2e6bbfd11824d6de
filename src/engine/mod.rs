//! Real-time synchronization engine.
//!
//! This module mediates all live collaboration traffic for a room:
//! - Versioned JSON event schema with validation at decode time
//! - Room registry for membership, presence, and typing state
//! - The engine itself, which persists and rebroadcasts events
//!
//! Ordering is "last write observed by the server wins": events are
//! broadcast in the order the engine finishes processing them, with no
//! sequence numbers beyond the per-project tree revision counter.

pub mod protocol;
pub mod registry;
pub mod sync;

pub use registry::RoomRegistry;
pub use sync::{SyncEngine, SyncEngineConfig};

use thiserror::Error;

/// Unique identifier for a project (and its room).
pub type ProjectId = String;

/// Unique identifier for a user.
pub type UserId = String;

/// Unique identifier for one live connection.
pub type SessionId = String;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while mediating real-time events.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("connection closed")]
    ConnectionClosed,
}
