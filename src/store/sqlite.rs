use super::{CurrentState, Room, RoomId, StateLogEntry, StoreBackend, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tracing::{debug, info};

/// Applied in order; each entry ends by bumping `user_version`.
pub const MIGRATIONS: &[&str] = &[V1];

// language=sql
const V1: &str = r#"
    CREATE TABLE IF NOT EXISTS rooms (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        number TEXT NOT NULL UNIQUE,
        occupancy INTEGER NOT NULL DEFAULT 0,
        occupancy_changed_at TEXT DEFAULT NULL
    );

    CREATE TABLE IF NOT EXISTS current_state (
        room_id INTEGER NOT NULL UNIQUE REFERENCES rooms (id) ON DELETE CASCADE,
        value INTEGER NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS state_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        room_id INTEGER NOT NULL REFERENCES rooms (id),
        value INTEGER NOT NULL,
        at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS state_log_room_id
        ON state_log (room_id ASC, id DESC);

    PRAGMA user_version = 1;
"#;

const ROOM_COLUMNS: &str = "id, number, occupancy, occupancy_changed_at";

pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Migration(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path)?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        debug!("Opened {} (journal_mode={})", path.display(), mode);
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        migrate(&conn)?;
        Ok(Self { conn })
    }

    pub fn schema_version(&self) -> Result<usize, StoreError> {
        user_version(&self.conn)
    }
}

fn user_version(conn: &Connection) -> Result<usize, StoreError> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version.max(0) as usize)
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let version = user_version(conn)?;
    if version > MIGRATIONS.len() {
        return Err(StoreError::Migration(format!(
            "database schema version {} is newer than supported version {}",
            version,
            MIGRATIONS.len()
        )));
    }
    for (index, migration) in MIGRATIONS.iter().enumerate().skip(version) {
        conn.execute_batch(migration)
            .map_err(|e| StoreError::Migration(format!("step {}: {}", index + 1, e)))?;
        info!("Applied schema migration {}", index + 1);
    }
    Ok(())
}

fn room_from_row(row: &Row<'_>) -> rusqlite::Result<Room> {
    Ok(Room {
        id: row.get(0)?,
        number: row.get(1)?,
        occupancy: row.get(2)?,
        occupancy_changed_at: row.get(3)?,
    })
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<StateLogEntry> {
    Ok(StateLogEntry {
        id: row.get(0)?,
        room_id: row.get(1)?,
        value: row.get(2)?,
        at: row.get(3)?,
    })
}

impl StoreBackend for SqliteBackend {
    fn find_room(&self, number: &str) -> Result<Option<Room>, StoreError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {} FROM rooms WHERE number = ?1", ROOM_COLUMNS),
                params![number],
                room_from_row,
            )
            .optional()?)
    }

    fn insert_room(&mut self, number: &str) -> Result<RoomId, StoreError> {
        self.conn
            .execute("INSERT OR IGNORE INTO rooms (number) VALUES (?1)", params![number])?;
        Ok(self
            .conn
            .query_row("SELECT id FROM rooms WHERE number = ?1", params![number], |row| row.get(0))?)
    }

    fn room(&self, id: RoomId) -> Result<Option<Room>, StoreError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {} FROM rooms WHERE id = ?1", ROOM_COLUMNS),
                params![id],
                room_from_row,
            )
            .optional()?)
    }

    fn rooms(&self) -> Result<Vec<Room>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM rooms ORDER BY number", ROOM_COLUMNS))?;
        let rooms = stmt
            .query_map([], room_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rooms)
    }

    fn current_state(&self, room_id: RoomId) -> Result<Option<CurrentState>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT room_id, value, updated_at FROM current_state WHERE room_id = ?1",
                params![room_id],
                |row| {
                    Ok(CurrentState {
                        room_id: row.get(0)?,
                        value: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    fn latest_log(&self, room_id: RoomId) -> Result<Option<StateLogEntry>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, room_id, value, at FROM state_log WHERE room_id = ?1 ORDER BY id DESC LIMIT 1",
                params![room_id],
                log_from_row,
            )
            .optional()?)
    }

    fn append_log(&mut self, room_id: RoomId, value: bool, at: DateTime<Utc>) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO state_log (room_id, value, at) VALUES (?1, ?2, ?3)",
            params![room_id, value, at],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn upsert_current(&mut self, room_id: RoomId, value: bool, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO current_state (room_id, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (room_id) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![room_id, value, at],
        )?;
        Ok(())
    }

    fn set_occupancy(&mut self, room_id: RoomId, value: bool, changed_at: DateTime<Utc>) -> Result<(), StoreError> {
        let updated = self.conn.execute(
            "UPDATE rooms SET occupancy = ?2, occupancy_changed_at = ?3 WHERE id = ?1",
            params![room_id, value, changed_at],
        )?;
        if updated == 0 {
            return Err(StoreError::UnknownRoom(room_id));
        }
        Ok(())
    }

    fn log_entries(&self, room_id: RoomId) -> Result<Vec<StateLogEntry>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, room_id, value, at FROM state_log WHERE room_id = ?1 ORDER BY id ASC")?;
        let entries = stmt
            .query_map(params![room_id], log_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_run_once_and_set_user_version() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        assert_eq!(backend.schema_version().unwrap(), MIGRATIONS.len());
        // Re-running is a no-op
        migrate(&backend.conn).unwrap();
        assert_eq!(backend.schema_version().unwrap(), MIGRATIONS.len());
    }

    #[test]
    fn newer_schema_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 99).unwrap();
        assert!(matches!(migrate(&conn), Err(StoreError::Migration(_))));
    }

    #[test]
    fn insert_room_is_idempotent() {
        let mut backend = SqliteBackend::open_in_memory().unwrap();
        let first = backend.insert_room("OR-1").unwrap();
        let again = backend.insert_room("OR-1").unwrap();
        let other = backend.insert_room("OR-2").unwrap();
        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(backend.rooms().unwrap().len(), 2);
    }

    #[test]
    fn log_rows_require_an_existing_room() {
        let mut backend = SqliteBackend::open_in_memory().unwrap();
        assert!(matches!(
            backend.append_log(42, true, Utc::now()),
            Err(StoreError::Sqlite(_))
        ));
        assert!(matches!(
            backend.set_occupancy(42, true, Utc::now()),
            Err(StoreError::UnknownRoom(42))
        ));
    }

    #[test]
    fn file_database_survives_reopen() {
        let path = std::env::temp_dir().join(format!("suctionsense-{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        {
            let mut backend = SqliteBackend::open(&path).unwrap();
            let room = backend.insert_room("OR-3").unwrap();
            backend.append_log(room, true, Utc::now()).unwrap();
            backend.upsert_current(room, true, Utc::now()).unwrap();
        }
        let backend = SqliteBackend::open(&path).unwrap();
        let room = backend.find_room("OR-3").unwrap().unwrap();
        assert!(backend.current_state(room.id).unwrap().unwrap().value);
        assert_eq!(backend.log_entries(room.id).unwrap().len(), 1);

        drop(backend);
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
        }
    }
}
