//! # Room State Store
//!
//! Durable per-room suction state with an append-only audit trail.
//!
//! ```text
//! store/
//! ├── state_store.rs  - StateStore: the serialized read/write surface used by the router and dashboards
//! ├── memory.rs       - In-memory backend
//! └── sqlite.rs       - rusqlite backend with versioned migrations
//! ```
//!
//! Backends are dumb row stores behind [`StoreBackend`]; all the "log if
//! changed, then overwrite" logic lives in [`StateStore`] so both backends
//! behave identically.

pub mod memory;
pub mod sqlite;
pub mod state_store;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;
pub use state_store::{SetOutcome, StateStore};

pub type RoomId = i64;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Room {
    pub id: RoomId,
    /// Human key, e.g. "OR-7"
    pub number: String,
    /// Motion-derived occupancy flag
    pub occupancy: bool,
    pub occupancy_changed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentState {
    pub room_id: RoomId,
    pub value: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateLogEntry {
    pub id: i64,
    pub room_id: RoomId,
    pub value: bool,
    pub at: DateTime<Utc>,
}

/// Dashboard read model for one room.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomSnapshot {
    pub id: RoomId,
    pub number: String,
    pub suction_on: bool,
    pub occupancy: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Unknown room id {0}")]
    UnknownRoom(RoomId),

    #[error("Invalid room number '{0}'")]
    InvalidRoomNumber(String),

    #[error("Schema migration failed: {0}")]
    Migration(String),
}

/// Row-level persistence. Implementations do no change detection of their
/// own.
pub trait StoreBackend: Send {
    fn find_room(&self, number: &str) -> Result<Option<Room>, StoreError>;

    /// Inserts the room if it does not exist yet and returns its id.
    fn insert_room(&mut self, number: &str) -> Result<RoomId, StoreError>;

    fn room(&self, id: RoomId) -> Result<Option<Room>, StoreError>;

    /// All rooms ordered by number.
    fn rooms(&self) -> Result<Vec<Room>, StoreError>;

    fn current_state(&self, room_id: RoomId) -> Result<Option<CurrentState>, StoreError>;

    fn latest_log(&self, room_id: RoomId) -> Result<Option<StateLogEntry>, StoreError>;

    /// Appends an immutable log row and returns its id.
    fn append_log(&mut self, room_id: RoomId, value: bool, at: DateTime<Utc>) -> Result<i64, StoreError>;

    fn upsert_current(&mut self, room_id: RoomId, value: bool, at: DateTime<Utc>) -> Result<(), StoreError>;

    fn set_occupancy(&mut self, room_id: RoomId, value: bool, changed_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Log rows for a room in observation order.
    fn log_entries(&self, room_id: RoomId) -> Result<Vec<StateLogEntry>, StoreError>;
}

/// Room numbers become topic segments, so they share the same rules.
pub fn validate_room_number(number: &str) -> Result<&str, StoreError> {
    let trimmed = number.trim();
    if trimmed.is_empty() || trimmed.contains(['/', '+', '#']) {
        return Err(StoreError::InvalidRoomNumber(number.to_string()));
    }
    Ok(trimmed)
}
