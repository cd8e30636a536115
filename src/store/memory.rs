use super::{CurrentState, Room, RoomId, StateLogEntry, StoreBackend, StoreError};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    rooms: BTreeMap<RoomId, Room>,
    current: BTreeMap<RoomId, CurrentState>,
    log: Vec<StateLogEntry>,
    next_room_id: RoomId,
    next_log_id: i64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn require_room(&self, room_id: RoomId) -> Result<(), StoreError> {
        if self.rooms.contains_key(&room_id) {
            Ok(())
        } else {
            Err(StoreError::UnknownRoom(room_id))
        }
    }
}

impl StoreBackend for MemoryBackend {
    fn find_room(&self, number: &str) -> Result<Option<Room>, StoreError> {
        Ok(self.rooms.values().find(|r| r.number == number).cloned())
    }

    fn insert_room(&mut self, number: &str) -> Result<RoomId, StoreError> {
        if let Some(room) = self.find_room(number)? {
            return Ok(room.id);
        }
        self.next_room_id += 1;
        let id = self.next_room_id;
        self.rooms.insert(
            id,
            Room {
                id,
                number: number.to_string(),
                occupancy: false,
                occupancy_changed_at: None,
            },
        );
        Ok(id)
    }

    fn room(&self, id: RoomId) -> Result<Option<Room>, StoreError> {
        Ok(self.rooms.get(&id).cloned())
    }

    fn rooms(&self) -> Result<Vec<Room>, StoreError> {
        let mut rooms: Vec<Room> = self.rooms.values().cloned().collect();
        rooms.sort_by(|a, b| a.number.cmp(&b.number));
        Ok(rooms)
    }

    fn current_state(&self, room_id: RoomId) -> Result<Option<CurrentState>, StoreError> {
        Ok(self.current.get(&room_id).cloned())
    }

    fn latest_log(&self, room_id: RoomId) -> Result<Option<StateLogEntry>, StoreError> {
        Ok(self.log.iter().rev().find(|e| e.room_id == room_id).cloned())
    }

    fn append_log(&mut self, room_id: RoomId, value: bool, at: DateTime<Utc>) -> Result<i64, StoreError> {
        self.require_room(room_id)?;
        self.next_log_id += 1;
        self.log.push(StateLogEntry {
            id: self.next_log_id,
            room_id,
            value,
            at,
        });
        Ok(self.next_log_id)
    }

    fn upsert_current(&mut self, room_id: RoomId, value: bool, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.require_room(room_id)?;
        self.current.insert(
            room_id,
            CurrentState {
                room_id,
                value,
                updated_at: at,
            },
        );
        Ok(())
    }

    fn set_occupancy(&mut self, room_id: RoomId, value: bool, changed_at: DateTime<Utc>) -> Result<(), StoreError> {
        let room = self
            .rooms
            .get_mut(&room_id)
            .ok_or(StoreError::UnknownRoom(room_id))?;
        room.occupancy = value;
        room.occupancy_changed_at = Some(changed_at);
        Ok(())
    }

    fn log_entries(&self, room_id: RoomId) -> Result<Vec<StateLogEntry>, StoreError> {
        Ok(self
            .log
            .iter()
            .filter(|e| e.room_id == room_id)
            .cloned()
            .collect())
    }
}
