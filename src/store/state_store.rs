use super::{
    validate_room_number, MemoryBackend, Room, RoomId, RoomSnapshot, SqliteBackend, StateLogEntry, StoreBackend,
    StoreError,
};
use chrono::Utc;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// Value differed (or was unknown); a log row was appended
    Changed { log_id: i64 },
    /// Value matched; only the current-state timestamp moved
    Unchanged,
}

/// Per-room suction state. Every operation runs under one async lock, so
/// concurrent writers to the same room are serialized and the
/// log-then-overwrite sequence is never interleaved.
pub struct StateStore {
    backend: Mutex<Box<dyn StoreBackend>>,
}

impl StateStore {
    pub fn new(backend: Box<dyn StoreBackend>) -> Self {
        Self {
            backend: Mutex::new(backend),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryBackend::new()))
    }

    pub fn open_sqlite(path: &Path) -> Result<Self, StoreError> {
        info!("Opening state database {}", path.display());
        Ok(Self::new(Box::new(SqliteBackend::open(path)?)))
    }

    /// Returns the id for `number`, creating the room on first reference.
    pub async fn ensure_room(&self, number: &str) -> Result<RoomId, StoreError> {
        let number = validate_room_number(number)?;
        let mut backend = self.backend.lock().await;
        if let Some(room) = backend.find_room(number)? {
            return Ok(room.id);
        }
        let id = backend.insert_room(number)?;
        info!("Provisioned room {} (id {})", number, id);
        Ok(id)
    }

    /// Current value, falling back to the newest log row, then `false`.
    pub async fn get_current(&self, room_id: RoomId) -> Result<bool, StoreError> {
        let backend = self.backend.lock().await;
        require_room(backend.as_ref(), room_id)?;
        stored_value(backend.as_ref(), room_id)
    }

    /// Records `value` for a room. A log row is appended only when the value
    /// changes, and always before the current state is overwritten.
    pub async fn set_current(&self, room_id: RoomId, value: bool) -> Result<SetOutcome, StoreError> {
        let mut backend = self.backend.lock().await;
        require_room(backend.as_ref(), room_id)?;

        let known = match backend.current_state(room_id)? {
            Some(current) => Some(current.value),
            None => backend.latest_log(room_id)?.map(|entry| entry.value),
        };
        let now = Utc::now();

        let outcome = if known == Some(value) {
            SetOutcome::Unchanged
        } else {
            let log_id = backend.append_log(room_id, value, now)?;
            info!("Room {} suction {:?} -> {} (log {})", room_id, known, value, log_id);
            SetOutcome::Changed { log_id }
        };
        backend.upsert_current(room_id, value, now)?;
        debug!("Room {} current state {} at {}", room_id, value, now);
        Ok(outcome)
    }

    /// Updates the occupancy flag. Returns whether it changed; the timestamp
    /// only moves on a change.
    pub async fn set_occupancy(&self, room_id: RoomId, value: bool) -> Result<bool, StoreError> {
        let mut backend = self.backend.lock().await;
        let room = backend.room(room_id)?.ok_or(StoreError::UnknownRoom(room_id))?;
        if room.occupancy == value && room.occupancy_changed_at.is_some() {
            return Ok(false);
        }
        backend.set_occupancy(room_id, value, Utc::now())?;
        info!("Room {} occupancy -> {}", room.number, value);
        Ok(true)
    }

    pub async fn room(&self, room_id: RoomId) -> Result<Option<Room>, StoreError> {
        self.backend.lock().await.room(room_id)
    }

    pub async fn list_rooms(&self) -> Result<Vec<RoomSnapshot>, StoreError> {
        let backend = self.backend.lock().await;
        let mut snapshots = Vec::new();
        for room in backend.rooms()? {
            let (suction_on, updated_at) = match backend.current_state(room.id)? {
                Some(current) => (current.value, Some(current.updated_at)),
                None => match backend.latest_log(room.id)? {
                    Some(entry) => (entry.value, Some(entry.at)),
                    None => (false, None),
                },
            };
            snapshots.push(RoomSnapshot {
                id: room.id,
                number: room.number,
                suction_on,
                occupancy: room.occupancy,
                updated_at,
            });
        }
        Ok(snapshots)
    }

    /// Audit trail for a room, oldest first.
    pub async fn room_log(&self, room_id: RoomId) -> Result<Vec<StateLogEntry>, StoreError> {
        let backend = self.backend.lock().await;
        require_room(backend.as_ref(), room_id)?;
        backend.log_entries(room_id)
    }

    /// Pre-provisions rooms. Returns how many were newly created.
    pub async fn seed_rooms<I, S>(&self, numbers: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut created = 0;
        for number in numbers {
            let number = validate_room_number(number.as_ref())?;
            let mut backend = self.backend.lock().await;
            if backend.find_room(number)?.is_none() {
                backend.insert_room(number)?;
                created += 1;
            }
        }
        if created > 0 {
            info!("Seeded {} rooms", created);
        }
        Ok(created)
    }
}

fn require_room(backend: &dyn StoreBackend, room_id: RoomId) -> Result<(), StoreError> {
    backend
        .room(room_id)?
        .map(|_| ())
        .ok_or(StoreError::UnknownRoom(room_id))
}

fn stored_value(backend: &dyn StoreBackend, room_id: RoomId) -> Result<bool, StoreError> {
    if let Some(current) = backend.current_state(room_id)? {
        return Ok(current.value);
    }
    Ok(backend
        .latest_log(room_id)?
        .map(|entry| entry.value)
        .unwrap_or(false))
}
