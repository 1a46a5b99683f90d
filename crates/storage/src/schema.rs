use std::time::Duration;

use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

/// Per-connection settings. `busy_timeout` bounds how long a writer waits for
/// another transaction's lock before giving up.
pub fn configure_connection(conn: &Connection, busy_timeout: Duration) -> Result<(), StorageError> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA cache_size = -32000;
    ",
    )?;
    Ok(())
}

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS users (
    user_id BLOB PRIMARY KEY CHECK (length(user_id) = 16),
    account_type TEXT NOT NULL,
    creds_id TEXT NOT NULL,
    creds TEXT,
    UNIQUE (account_type, creds_id)
);

CREATE TABLE IF NOT EXISTS device_uuids (
    device_id BLOB PRIMARY KEY CHECK (length(device_id) = 16),
    user_id BLOB NOT NULL CHECK (length(user_id) = 16)
);
CREATE INDEX IF NOT EXISTS idx_device_uuids_user ON device_uuids (user_id);

CREATE TABLE IF NOT EXISTS sharing_groups (
    sharing_group_id BLOB PRIMARY KEY CHECK (length(sharing_group_id) = 16),
    name TEXT
);

CREATE TABLE IF NOT EXISTS sharing_group_users (
    sharing_group_id BLOB NOT NULL CHECK (length(sharing_group_id) = 16),
    user_id BLOB NOT NULL CHECK (length(user_id) = 16),
    permission TEXT NOT NULL CHECK (permission IN ('read', 'write', 'admin')),
    PRIMARY KEY (sharing_group_id, user_id)
);
CREATE INDEX IF NOT EXISTS idx_sharing_group_users_user ON sharing_group_users (user_id);

CREATE TABLE IF NOT EXISTS sharing_invitations (
    code BLOB PRIMARY KEY CHECK (length(code) = 16),
    sharing_group_id BLOB NOT NULL CHECK (length(sharing_group_id) = 16),
    owning_user_id BLOB NOT NULL CHECK (length(owning_user_id) = 16),
    permission TEXT NOT NULL CHECK (permission IN ('read', 'write', 'admin')),
    expiry INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS master_versions (
    sharing_group_id BLOB PRIMARY KEY CHECK (length(sharing_group_id) = 16),
    version INTEGER NOT NULL CHECK (version >= 0)
);

-- Lock marker rows, written by every acquire.
CREATE TABLE IF NOT EXISTS sharing_group_locks (
    sharing_group_id BLOB PRIMARY KEY CHECK (length(sharing_group_id) = 16),
    acquisitions INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS file_index (
    file_index_id INTEGER PRIMARY KEY AUTOINCREMENT,
    sharing_group_id BLOB NOT NULL CHECK (length(sharing_group_id) = 16),
    file_id BLOB NOT NULL CHECK (length(file_id) = 16),
    file_group_id BLOB CHECK (file_group_id IS NULL OR length(file_group_id) = 16),
    owner_user_id BLOB NOT NULL CHECK (length(owner_user_id) = 16),
    device_id BLOB NOT NULL CHECK (length(device_id) = 16),
    mime_type TEXT NOT NULL CHECK (length(mime_type) > 0),
    app_meta_data TEXT,
    deleted INTEGER NOT NULL DEFAULT 0,
    file_version INTEGER NOT NULL CHECK (file_version >= 0),
    size_bytes INTEGER NOT NULL CHECK (size_bytes >= 0),
    checksum TEXT,
    change_resolver_name TEXT,
    creation_date INTEGER NOT NULL,
    update_date INTEGER NOT NULL,
    UNIQUE (file_id, owner_user_id),
    UNIQUE (sharing_group_id, file_id)
);
CREATE INDEX IF NOT EXISTS idx_file_index_owner ON file_index (owner_user_id);

CREATE TABLE IF NOT EXISTS uploads (
    upload_id INTEGER PRIMARY KEY AUTOINCREMENT,
    sharing_group_id BLOB NOT NULL CHECK (length(sharing_group_id) = 16),
    file_id BLOB NOT NULL CHECK (length(file_id) = 16),
    file_group_id BLOB CHECK (file_group_id IS NULL OR length(file_group_id) = 16),
    owner_user_id BLOB NOT NULL CHECK (length(owner_user_id) = 16),
    device_id BLOB NOT NULL CHECK (length(device_id) = 16),
    mime_type TEXT,
    app_meta_data TEXT,
    is_file_upload INTEGER NOT NULL,
    file_version INTEGER NOT NULL CHECK (file_version >= 0),
    state TEXT NOT NULL CHECK (state IN ('uploading', 'uploaded')),
    size_bytes INTEGER CHECK (size_bytes IS NULL OR size_bytes >= 0),
    checksum TEXT,
    change_resolver_name TEXT,
    contents BLOB,
    UNIQUE (file_id, owner_user_id, device_id)
);
CREATE INDEX IF NOT EXISTS idx_uploads_device ON uploads (sharing_group_id, owner_user_id, device_id, state);

CREATE TABLE IF NOT EXISTS deferred_uploads (
    deferred_upload_id INTEGER PRIMARY KEY AUTOINCREMENT,
    sharing_group_id BLOB NOT NULL CHECK (length(sharing_group_id) = 16),
    file_group_id BLOB CHECK (file_group_id IS NULL OR length(file_group_id) = 16),
    file_id BLOB NOT NULL CHECK (length(file_id) = 16),
    owner_user_id BLOB NOT NULL CHECK (length(owner_user_id) = 16),
    status TEXT NOT NULL CHECK (status IN ('pendingChange', 'processed', 'discarded')),
    change_resolver_name TEXT NOT NULL,
    payload BLOB NOT NULL,
    completed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_deferred_uploads_pending ON deferred_uploads (status, sharing_group_id, deferred_upload_id);
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() -> Result<(), StorageError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        init_schema(&conn)?;
        let version: i32 =
            conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
        assert_eq!(version, SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn no_table_declares_foreign_keys() -> Result<(), StorageError> {
        let conn = Connection::open_in_memory()?;
        configure_connection(&conn, Duration::from_millis(100))?;
        init_schema(&conn)?;
        let enforced: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        assert_eq!(enforced, 0);

        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
        let tables = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        assert!(tables.len() >= 10);
        for table in tables {
            let keys: i64 =
                conn.query_row("SELECT COUNT(*) FROM pragma_foreign_key_list(?1)", [&table], |row| row.get(0))?;
            assert_eq!(keys, 0, "{table} declares a foreign key");
        }
        Ok(())
    }
}
