//! Transcript repository

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;
use uuid::Uuid;

use super::DbPool;
use crate::voice::{TranscriptEntry, TranscriptRecord, TranscriptSource};
use crate::{Error, Result};

/// Listing row without the entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptSummary {
    pub id: Uuid,
    pub session_id: Uuid,
    pub source: TranscriptSource,
    pub entry_count: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Transcript repository
#[derive(Clone)]
pub struct TranscriptRepo {
    pool: DbPool,
}

impl TranscriptRepo {
    /// Create a new transcript repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Persist a finished transcript
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn save(&self, record: &TranscriptRecord) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let entries = serde_json::to_string(&record.entries)?;

        conn.execute(
            "INSERT INTO voice_transcripts (id, session_id, source, entries, entry_count, started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id.to_string(),
                record.session_id.to_string(),
                record.source.as_str(),
                entries,
                i64::try_from(record.entries.len()).unwrap_or(i64::MAX),
                record.started_at.to_rfc3339(),
                record.ended_at.to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        tracing::debug!(
            id = %record.id,
            session_id = %record.session_id,
            entries = record.entries.len(),
            "transcript saved"
        );
        Ok(())
    }

    /// Fetch one transcript
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, id: Uuid) -> Result<Option<TranscriptRecord>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let row = conn
            .query_row(
                "SELECT id, session_id, source, entries, started_at, ended_at
                 FROM voice_transcripts WHERE id = ?1",
                [id.to_string()],
                raw_record,
            )
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;

        row.map(RawRecord::into_record).transpose()
    }

    /// All transcripts recorded for a session, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_for_session(&self, session_id: Uuid) -> Result<Vec<TranscriptRecord>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, source, entries, started_at, ended_at
                 FROM voice_transcripts WHERE session_id = ?1 ORDER BY started_at ASC",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let rows = stmt
            .query_map([session_id.to_string()], raw_record)
            .map_err(|e| Error::Database(e.to_string()))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Database(e.to_string()))?;

        rows.into_iter().map(RawRecord::into_record).collect()
    }

    /// Most recently ended transcripts
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_recent(&self, limit: usize) -> Result<Vec<TranscriptSummary>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, source, entry_count, started_at, ended_at
                 FROM voice_transcripts ORDER BY ended_at DESC LIMIT ?1",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let summaries = stmt
            .query_map([i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(|e| Error::Database(e.to_string()))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Database(e.to_string()))?;

        summaries
            .into_iter()
            .map(|(id, session_id, source, count, started, ended)| {
                Ok(TranscriptSummary {
                    id: parse_uuid(&id)?,
                    session_id: parse_uuid(&session_id)?,
                    source: source.parse()?,
                    entry_count: usize::try_from(count).unwrap_or_default(),
                    started_at: parse_datetime(&started),
                    ended_at: parse_datetime(&ended),
                })
            })
            .collect()
    }
}

/// Columns as stored, decoded outside the rusqlite row closure
struct RawRecord {
    id: String,
    session_id: String,
    source: String,
    entries: String,
    started_at: String,
    ended_at: String,
}

fn raw_record(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        source: row.get(2)?,
        entries: row.get(3)?,
        started_at: row.get(4)?,
        ended_at: row.get(5)?,
    })
}

impl RawRecord {
    fn into_record(self) -> Result<TranscriptRecord> {
        let entries: Vec<TranscriptEntry> = serde_json::from_str(&self.entries)?;

        Ok(TranscriptRecord {
            id: parse_uuid(&self.id)?,
            session_id: parse_uuid(&self.session_id)?,
            source: self.source.parse()?,
            entries,
            started_at: parse_datetime(&self.started_at),
            ended_at: parse_datetime(&self.ended_at),
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::Database(format!("bad id {s:?}: {e}")))
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;
    use crate::voice::{Speaker, TranscriptLog};

    fn record(session_id: Uuid, source: TranscriptSource) -> TranscriptRecord {
        let mut log = TranscriptLog::new(session_id, source);
        log.push_user("Can you schedule a call tomorrow?");
        log.push_assistant("Sure, 10am works.");
        log.finish()
    }

    #[test]
    fn test_save_and_get() {
        let repo = TranscriptRepo::new(init_memory().unwrap());
        let saved = record(Uuid::new_v4(), TranscriptSource::Pipeline);
        repo.save(&saved).unwrap();

        let loaded = repo.get(saved.id).unwrap().unwrap();
        assert_eq!(loaded.id, saved.id);
        assert_eq!(loaded.source, TranscriptSource::Pipeline);
        assert_eq!(loaded.entries.len(), 2);
        assert_eq!(loaded.entries[0].speaker, Speaker::User);
        assert_eq!(loaded.entries[1].text, "Sure, 10am works.");
    }

    #[test]
    fn test_get_missing() {
        let repo = TranscriptRepo::new(init_memory().unwrap());
        assert!(repo.get(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_list_for_session() {
        let repo = TranscriptRepo::new(init_memory().unwrap());
        let session_id = Uuid::new_v4();
        repo.save(&record(session_id, TranscriptSource::Pipeline))
            .unwrap();
        repo.save(&record(session_id, TranscriptSource::Realtime))
            .unwrap();
        repo.save(&record(Uuid::new_v4(), TranscriptSource::Pipeline))
            .unwrap();

        let records = repo.list_for_session(session_id).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.session_id == session_id));
    }

    #[test]
    fn test_undecodable_rows_are_errors() {
        let pool = init_memory().unwrap();
        let repo = TranscriptRepo::new(pool.clone());
        let session_id = Uuid::new_v4();
        repo.save(&record(session_id, TranscriptSource::Pipeline))
            .unwrap();

        pool.get()
            .unwrap()
            .execute(
                "INSERT INTO voice_transcripts (id, session_id, source, entries, entry_count, started_at, ended_at)
                 VALUES ('not-a-uuid', ?1, 'carrier-pigeon', 'not json', 1, '', '')",
                [session_id.to_string()],
            )
            .unwrap();

        assert!(repo.list_for_session(session_id).is_err());
        assert!(repo.list_recent(10).is_err());
    }

    #[test]
    fn test_list_recent_orders_and_limits() {
        let repo = TranscriptRepo::new(init_memory().unwrap());

        let mut older = record(Uuid::new_v4(), TranscriptSource::Pipeline);
        older.ended_at -= chrono::Duration::hours(1);
        let newer = record(Uuid::new_v4(), TranscriptSource::Realtime);
        repo.save(&older).unwrap();
        repo.save(&newer).unwrap();

        let recent = repo.list_recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, newer.id);
        assert_eq!(recent[0].entry_count, 2);

        assert_eq!(repo.list_recent(1).unwrap().len(), 1);
    }
}
