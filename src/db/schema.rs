//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS voice_transcripts (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            source TEXT NOT NULL,
            entries TEXT NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_voice_transcripts_session
            ON voice_transcripts(session_id);

        PRAGMA user_version = 1;
        ",
    )?;

    tracing::debug!("migrated to schema v1");
    Ok(())
}

/// Entry count column so listings don't need to parse the JSON
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        ALTER TABLE voice_transcripts ADD COLUMN entry_count INTEGER NOT NULL DEFAULT 0;

        UPDATE voice_transcripts SET entry_count = json_array_length(entries);

        CREATE INDEX IF NOT EXISTS idx_voice_transcripts_ended
            ON voice_transcripts(ended_at DESC);

        PRAGMA user_version = 2;
        ",
    )?;

    tracing::debug!("migrated to schema v2");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        init(&conn).unwrap();

        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
