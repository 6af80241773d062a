//! SQLite note store.
//!
//! A single connection behind a mutex; every call runs on the blocking
//! pool. Timestamps are stored as fixed-width RFC 3339 strings
//! (microseconds, `Z` suffix) so that string comparison in SQL is
//! chronological.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;

use super::{
    Claim, ClaimRequest, EligibilityFilter, NoteStore, OwnerUsage, PriorNote, StoreError,
};
use crate::domain::{
    AnalysisResult, AudioRef, ErrorPatch, Note, NoteEvent, NoteEventType, NoteUpdate,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS notes (
    id                    TEXT PRIMARY KEY,
    owner_id              TEXT NOT NULL,
    audio_ref             TEXT NOT NULL,
    audio_bytes           INTEGER NOT NULL DEFAULT 0,
    recorded_at           TEXT NOT NULL,
    transcription         TEXT,
    analysis              TEXT,
    processing_started_at TEXT,
    processed_at          TEXT,
    processing_attempts   INTEGER NOT NULL DEFAULT 0,
    error_message         TEXT,
    last_error_at         TEXT,
    claim_token           TEXT
);
CREATE INDEX IF NOT EXISTS idx_notes_pending ON notes (processed_at, recorded_at);
CREATE INDEX IF NOT EXISTS idx_notes_owner ON notes (owner_id, processed_at);

CREATE TABLE IF NOT EXISTS note_events (
    id          TEXT PRIMARY KEY,
    timestamp   TEXT NOT NULL,
    note_id     TEXT NOT NULL,
    owner_id    TEXT NOT NULL,
    event_type  TEXT NOT NULL,
    summary     TEXT NOT NULL,
    tokens      INTEGER,
    duration_ms INTEGER,
    error       TEXT
);
CREATE INDEX IF NOT EXISTS idx_events_note ON note_events (note_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_events_owner ON note_events (owner_id, event_type, timestamp);
";

const NOTE_COLUMNS: &str = "id, owner_id, audio_ref, audio_bytes, recorded_at, transcription, \
     analysis, processing_started_at, processed_at, processing_attempts, error_message, \
     last_error_at";

const EVENT_COLUMNS: &str =
    "id, timestamp, note_id, owner_id, event_type, summary, tokens, duration_ms, error";

/// Note store backed by a SQLite database
#[derive(Clone)]
pub struct SqliteNoteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteNoteStore {
    /// Open (or create) a database file
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl NoteStore for SqliteNoteStore {
    async fn insert_note(&self, note: &Note) -> Result<(), StoreError> {
        let note = note.clone();
        let analysis = note.analysis.as_ref().map(serde_json::to_string).transpose()?;

        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO notes ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    NOTE_COLUMNS
                ),
                params![
                    note.id.to_string(),
                    note.owner_id,
                    note.audio_ref.as_str(),
                    note.audio_bytes as i64,
                    ts(note.recorded_at),
                    note.transcription,
                    analysis,
                    note.processing_started_at.map(ts),
                    note.processed_at.map(ts),
                    note.processing_attempts,
                    note.error_message,
                    note.last_error_at.map(ts),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_note(&self, note_id: Uuid) -> Result<Note, StoreError> {
        self.with_conn(move |conn| load_note(conn, note_id)).await
    }

    async fn claim_note(&self, request: ClaimRequest) -> Result<Option<Claim>, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let id = request.note_id.to_string();
            let token = Uuid::new_v4();

            let changed = tx.execute(
                "UPDATE notes
                 SET processing_started_at = ?1,
                     claim_token = ?2,
                     processing_attempts = processing_attempts + 1
                 WHERE id = ?4
                   AND (processing_started_at IS NULL OR processing_started_at < ?5)
                   AND (?3 OR processed_at IS NULL)",
                params![
                    ts(request.now),
                    token.to_string(),
                    request.reopen,
                    id,
                    ts(request.stale_before),
                ],
            )?;

            if changed == 0 {
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM notes WHERE id = ?1)",
                    params![id],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Err(StoreError::NotFound(request.note_id));
                }
                return Ok(None);
            }

            let (owner_id, attempts): (String, u32) = tx.query_row(
                "SELECT owner_id, processing_attempts FROM notes WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            let event = NoteEvent::new(
                request.note_id,
                owner_id,
                NoteEventType::AttemptStarted,
                format!("Attempt {} started", attempts),
                request.now,
            );
            insert_event(&tx, &event)?;
            tx.commit()?;

            debug!(note_id = %request.note_id, attempts, "Note claimed");

            Ok(Some(Claim {
                note_id: request.note_id,
                token,
                started_at: request.now,
            }))
        })
        .await
    }

    async fn update_note(&self, claim: &Claim, update: NoteUpdate) -> Result<Note, StoreError> {
        let claim = claim.clone();
        let analysis = update.analysis.as_ref().map(serde_json::to_string).transpose()?;

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let id = claim.note_id.to_string();

            let held: Option<Option<String>> = tx
                .query_row(
                    "SELECT claim_token FROM notes WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;

            match held {
                None => return Err(StoreError::NotFound(claim.note_id)),
                Some(token) if token.as_deref() != Some(claim.token.to_string().as_str()) => {
                    return Err(StoreError::ConcurrentModification(claim.note_id));
                }
                Some(_) => {}
            }

            let (error_mode, error_message, error_at) = match update.error {
                ErrorPatch::Keep => ("keep", None, None),
                ErrorPatch::Set { message, at } => ("set", Some(message), Some(ts(at))),
                ErrorPatch::Clear => ("clear", None, None),
            };

            tx.execute(
                "UPDATE notes
                 SET transcription = COALESCE(?1, transcription),
                     analysis = COALESCE(?2, analysis),
                     processed_at = CASE WHEN ?9 THEN NULL
                                    ELSE COALESCE(?3, processed_at) END,
                     error_message = CASE ?4 WHEN 'set' THEN ?5 WHEN 'clear' THEN NULL
                                     ELSE error_message END,
                     last_error_at = CASE ?4 WHEN 'set' THEN ?6 WHEN 'clear' THEN NULL
                                     ELSE last_error_at END,
                     processing_started_at = CASE WHEN ?7 THEN NULL
                                             ELSE processing_started_at END,
                     claim_token = CASE WHEN ?7 THEN NULL ELSE claim_token END
                 WHERE id = ?8",
                params![
                    update.transcription,
                    analysis,
                    update.processed_at.map(ts),
                    error_mode,
                    error_message,
                    error_at,
                    update.release_claim,
                    id,
                    update.clear_processed,
                ],
            )?;

            let note = load_note(&tx, claim.note_id)?;
            tx.commit()?;
            Ok(note)
        })
        .await
    }

    async fn list_eligible_notes(
        &self,
        filter: &EligibilityFilter,
        limit: usize,
    ) -> Result<Vec<Note>, StoreError> {
        let filter = filter.clone();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM notes
                 WHERE processed_at IS NULL
                   AND (processing_started_at IS NULL
                        OR (?1 IS NOT NULL AND processing_started_at < ?1))
                   AND (?2 IS NULL OR processing_attempts < ?2)
                   AND (?3 IS NULL OR recorded_at >= ?3)
                 ORDER BY recorded_at ASC, id ASC
                 LIMIT ?4",
                NOTE_COLUMNS
            ))?;

            let notes = stmt
                .query_map(
                    params![
                        filter.stale_before.map(ts),
                        filter.max_attempts,
                        filter.recorded_after.map(ts),
                        limit as i64,
                    ],
                    note_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(notes)
        })
        .await
    }

    async fn list_stuck(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Note>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM notes
                 WHERE processing_started_at IS NOT NULL
                   AND processing_started_at < ?1
                 ORDER BY processing_started_at ASC
                 LIMIT ?2",
                NOTE_COLUMNS
            ))?;

            let notes = stmt
                .query_map(params![ts(stale_before), limit as i64], note_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(notes)
        })
        .await
    }

    async fn reset_stuck(
        &self,
        note_id: Uuid,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let id = note_id.to_string();

            let claimed: Option<(String, String)> = tx
                .query_row(
                    "SELECT owner_id, processing_started_at FROM notes
                     WHERE id = ?1
                       AND processing_started_at IS NOT NULL
                       AND processing_started_at < ?2",
                    params![id, ts(stale_before)],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((owner_id, started_at)) = claimed else {
                return Ok(false);
            };

            tx.execute(
                "UPDATE notes SET processing_started_at = NULL, claim_token = NULL
                 WHERE id = ?1 AND processing_started_at = ?2",
                params![id, started_at],
            )?;

            let event = NoteEvent::new(
                note_id,
                owner_id,
                NoteEventType::StuckReset,
                format!("Stale claim from {} cleared", started_at),
                now,
            );
            insert_event(&tx, &event)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn owner_usage(
        &self,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<OwnerUsage, StoreError> {
        let owner_id = owner_id.to_string();

        self.with_conn(move |conn| {
            let (note_count, storage_bytes): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(audio_bytes), 0) FROM notes WHERE owner_id = ?1",
                params![owner_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            if note_count == 0 {
                return Err(StoreError::UnknownOwner(owner_id));
            }

            let processing_last_hour: i64 = conn.query_row(
                "SELECT COUNT(*) FROM note_events
                 WHERE owner_id = ?1 AND event_type = ?2 AND timestamp >= ?3",
                params![
                    owner_id,
                    NoteEventType::AttemptStarted.as_str(),
                    ts(now - Duration::hours(1)),
                ],
                |row| row.get(0),
            )?;

            let tokens_last_day: i64 = conn.query_row(
                "SELECT COALESCE(SUM(tokens), 0) FROM note_events
                 WHERE owner_id = ?1 AND timestamp >= ?2",
                params![owner_id, ts(now - Duration::days(1))],
                |row| row.get(0),
            )?;

            Ok(OwnerUsage {
                note_count: note_count.max(0) as u64,
                storage_bytes: storage_bytes.max(0) as u64,
                processing_last_hour: processing_last_hour.max(0) as u64,
                tokens_last_day: tokens_last_day.max(0) as u64,
            })
        })
        .await
    }

    async fn record_event(&self, event: &NoteEvent) -> Result<(), StoreError> {
        let event = event.clone();
        self.with_conn(move |conn| insert_event(conn, &event)).await
    }

    async fn events_for(&self, note_id: Uuid) -> Result<Vec<NoteEvent>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM note_events WHERE note_id = ?1 ORDER BY timestamp ASC, rowid ASC",
                EVENT_COLUMNS
            ))?;

            let events = stmt
                .query_map(params![note_id.to_string()], event_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(events)
        })
        .await
    }

    async fn recent_completed(
        &self,
        owner_id: &str,
        exclude: Uuid,
        limit: usize,
    ) -> Result<Vec<PriorNote>, StoreError> {
        let owner_id = owner_id.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, recorded_at, analysis FROM notes
                 WHERE owner_id = ?1 AND id != ?2
                   AND processed_at IS NOT NULL AND analysis IS NOT NULL
                 ORDER BY processed_at DESC
                 LIMIT ?3",
            )?;

            let rows = stmt
                .query_map(
                    params![owner_id, exclude.to_string(), limit as i64],
                    |row| {
                        Ok((
                            uuid_column(row, 0)?,
                            ts_column(row, 1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(note_id, recorded_at, analysis)| {
                    let analysis: AnalysisResult = serde_json::from_str(&analysis)?;
                    Ok::<_, StoreError>(PriorNote {
                        note_id,
                        recorded_at,
                        title: analysis.title().map(str::to_string),
                        summary: analysis.summary().map(str::to_string),
                    })
                })
                .collect()
        })
        .await
    }
}

fn load_note(conn: &Connection, note_id: Uuid) -> Result<Note, StoreError> {
    conn.query_row(
        &format!("SELECT {} FROM notes WHERE id = ?1", NOTE_COLUMNS),
        params![note_id.to_string()],
        note_from_row,
    )
    .optional()?
    .ok_or(StoreError::NotFound(note_id))
}

fn insert_event(conn: &Connection, event: &NoteEvent) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO note_events ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            EVENT_COLUMNS
        ),
        params![
            event.id.to_string(),
            ts(event.timestamp),
            event.note_id.to_string(),
            event.owner_id,
            event.event_type.as_str(),
            event.summary,
            event.tokens.map(|t| t as i64),
            event.duration_ms.map(|d| d as i64),
            event.error,
        ],
    )?;
    Ok(())
}

fn note_from_row(row: &Row<'_>) -> rusqlite::Result<Note> {
    let analysis = match row.get::<_, Option<String>>(6)? {
        Some(json) => Some(
            serde_json::from_str::<AnalysisResult>(&json)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?,
        ),
        None => None,
    };

    Ok(Note {
        id: uuid_column(row, 0)?,
        owner_id: row.get(1)?,
        audio_ref: AudioRef::new(row.get::<_, String>(2)?),
        audio_bytes: row.get::<_, i64>(3)?.max(0) as u64,
        recorded_at: ts_column(row, 4)?,
        transcription: row.get(5)?,
        analysis,
        processing_started_at: opt_ts_column(row, 7)?,
        processed_at: opt_ts_column(row, 8)?,
        processing_attempts: row.get(9)?,
        error_message: row.get(10)?,
        last_error_at: opt_ts_column(row, 11)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<NoteEvent> {
    let raw_type: String = row.get(4)?;
    let event_type = NoteEventType::parse(&raw_type).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            Type::Text,
            format!("unknown event type: {}", raw_type).into(),
        )
    })?;

    Ok(NoteEvent {
        id: uuid_column(row, 0)?,
        timestamp: ts_column(row, 1)?,
        note_id: uuid_column(row, 2)?,
        owner_id: row.get(3)?,
        event_type,
        summary: row.get(5)?,
        tokens: row.get::<_, Option<i64>>(6)?.map(|t| t.max(0) as u64),
        duration_ms: row.get::<_, Option<i64>>(7)?.map(|d| d.max(0) as u64),
        error: row.get(8)?,
    })
}

/// Fixed-width timestamp encoding
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_ts(idx, &row.get::<_, String>(idx)?)
}

fn opt_ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| parse_ts(idx, &raw))
        .transpose()
}

fn uuid_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
