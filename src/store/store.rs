//! SQLite-backed relational store.
//!
//! Single writer connection behind a mutex; file-backed stores open an
//! additional read-only connection so long read queries never block the
//! writer. Domain writes and their outbox events always commit in the same
//! transaction.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::{params, types::Value as SqlValue, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::collaborators::ExtractedPoi;
use crate::error::{Error, Result};
use crate::store::evidence::{downgrade_after_cycle, would_close_cycle, EvidenceOutcome};
use crate::store::schema::{
    configure_connection, initialize_schema, normalize_orphans, NormalizationReport,
};
use crate::store::types::*;

/// Timestamp format used for reservation bookkeeping; fixed-width so
/// lexicographic comparison matches chronological order.
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// A relationship candidate produced by lookup-map synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipCandidate {
    pub source_poi_id: i64,
    pub target_poi_id: i64,
    pub rel_type: String,
    pub reason: String,
    pub evidence_type: String,
    pub agent_confidence: f64,
    pub evidence_payload: serde_json::Value,
}

/// Per-run row counts for the final summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunCounts {
    pub files_processed: usize,
    pub files_failed: usize,
    pub pois: usize,
    pub relationships_pending: usize,
    pub relationships_validated: usize,
    pub relationships_failed: usize,
    pub triangulation_sessions: usize,
    pub outbox_pending: usize,
    pub outbox_published: usize,
    pub outbox_failed: usize,
}

/// SQLite-backed store for all pipeline entities.
pub struct SqliteStore {
    writer: Mutex<Connection>,
    reader: Option<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>, wal: bool) -> Result<Self> {
        let path = path.as_ref();
        let writer = Connection::open(path)?;
        configure_connection(&writer, wal)?;
        initialize_schema(&writer)?;

        let reader = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        configure_connection(&reader, false)?;

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Some(Mutex::new(reader)),
        })
    }

    /// Create an in-memory store (for testing). Reads share the writer.
    pub fn in_memory() -> Result<Self> {
        let writer = Connection::open_in_memory()?;
        configure_connection(&writer, false)?;
        initialize_schema(&writer)?;
        Ok(Self {
            writer: Mutex::new(writer),
            reader: None,
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .writer
            .lock()
            .map_err(|e| Error::Internal(format!("writer lock poisoned: {e}")))?;
        f(&conn)
    }

    /// Execute a closure on the read connection, falling back to the writer
    /// for in-memory stores.
    fn with_reader<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        match &self.reader {
            Some(reader) => {
                let conn = reader
                    .lock()
                    .map_err(|e| Error::Internal(format!("reader lock poisoned: {e}")))?;
                f(&conn)
            }
            None => self.with_conn(f),
        }
    }

    /// Run a closure inside BEGIN IMMEDIATE .. COMMIT, rolling back on error.
    pub fn tx<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        self.with_conn(|conn| {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            match f(conn) {
                Ok(value) => {
                    conn.execute_batch("COMMIT")?;
                    Ok(value)
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e)
                }
            }
        })
    }

    /// Chunked multi-row INSERT. Returns the number of rows inserted.
    pub fn batch_insert(
        &self,
        table: &str,
        cols: &[&str],
        rows: Vec<Vec<SqlValue>>,
        batch_size: usize,
    ) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let batch_size = batch_size.max(1);
        self.tx(|conn| {
            let mut inserted = 0;
            for chunk in rows.chunks(batch_size) {
                let row_placeholder = format!(
                    "({})",
                    (0..cols.len()).map(|_| "?").collect::<Vec<_>>().join(", ")
                );
                let sql = format!(
                    "INSERT OR IGNORE INTO {table} ({}) VALUES {}",
                    cols.join(", "),
                    vec![row_placeholder; chunk.len()].join(", ")
                );
                let flat: Vec<&dyn rusqlite::ToSql> = chunk
                    .iter()
                    .flat_map(|row| row.iter().map(|v| v as &dyn rusqlite::ToSql))
                    .collect();
                inserted += conn.execute(&sql, flat.as_slice())?;
            }
            Ok(inserted)
        })
    }

    /// Run the startup normalization pass.
    pub fn normalize(&self) -> Result<NormalizationReport> {
        self.tx(normalize_orphans)
    }

    /// Force a WAL checkpoint; used by memory-pressure recovery.
    pub fn checkpoint(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")?;
            Ok(())
        })
    }

    /// Write-then-read round trip for dependency probes.
    pub fn probe_roundtrip(&self) -> Result<()> {
        let token = Uuid::new_v4().to_string();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO health_probe (id, token) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET token = ?1, probed_at = datetime('now')",
                params![token],
            )?;
            let read: String =
                conn.query_row("SELECT token FROM health_probe WHERE id = 1", [], |row| {
                    row.get(0)
                })?;
            if read != token {
                return Err(Error::dependency("store", "probe token mismatch"));
            }
            Ok(())
        })
    }

    // ==================== Files ====================

    /// Upsert a discovered file. A hash change marks the file dirty: status
    /// resets to pending. Returns the row and whether analysis is needed.
    pub fn upsert_file(&self, run_id: &str, path: &str, hash: &str) -> Result<(FileRecord, bool)> {
        self.tx(|conn| {
            let existing: Option<(i64, String, String)> = conn
                .query_row(
                    "SELECT id, content_hash, status FROM files
                     WHERE run_id = ?1 AND file_path = ?2",
                    params![run_id, path],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let dirty = match existing {
                Some((id, old_hash, status)) => {
                    if old_hash == hash && status == "processed" {
                        false
                    } else {
                        conn.execute(
                            "UPDATE files SET content_hash = ?1, status = 'pending',
                                    updated_at = datetime('now')
                             WHERE id = ?2",
                            params![hash, id],
                        )?;
                        true
                    }
                }
                None => {
                    conn.execute(
                        "INSERT INTO files (file_path, content_hash, status, run_id)
                         VALUES (?1, ?2, 'pending', ?3)",
                        params![path, hash, run_id],
                    )?;
                    true
                }
            };

            let record = conn.query_row(
                "SELECT id, file_path, content_hash, status, run_id, created_at, updated_at
                 FROM files WHERE run_id = ?1 AND file_path = ?2",
                params![run_id, path],
                row_to_file,
            )?;
            Ok((record, dirty))
        })
    }

    /// Update a file's processing status.
    pub fn set_file_status(&self, run_id: &str, path: &str, status: FileStatus) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE files SET status = ?1, updated_at = datetime('now')
                 WHERE run_id = ?2 AND file_path = ?3",
                params![status.as_str(), run_id, path],
            )?;
            Ok(())
        })
    }

    /// Fetch one file row.
    pub fn file_by_path(&self, run_id: &str, path: &str) -> Result<Option<FileRecord>> {
        self.with_reader(|conn| {
            conn.query_row(
                "SELECT id, file_path, content_hash, status, run_id, created_at, updated_at
                 FROM files WHERE run_id = ?1 AND file_path = ?2",
                params![run_id, path],
                row_to_file,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    // ==================== POIs ====================

    /// Upsert the POIs extracted from one file and write the `poi-created`
    /// outbox event, all in one transaction. POIs with a semantic id upsert
    /// onto `(run_id, semantic_id)`; re-processing the same content yields
    /// the same POI set. Returns the stable database ids, re-read after
    /// insert so downstream jobs reference real rows.
    pub fn insert_pois_with_event(
        &self,
        run_id: &str,
        file: &FileRecord,
        pois: &[ExtractedPoi],
    ) -> Result<Vec<i64>> {
        self.tx(|conn| {
            let mut ids = Vec::with_capacity(pois.len());
            for poi in pois {
                if poi.end_line < poi.start_line {
                    return Err(Error::MalformedPayload(format!(
                        "poi {} has end_line {} before start_line {}",
                        poi.name, poi.end_line, poi.start_line
                    )));
                }
                match &poi.semantic_id {
                    Some(semantic_id) => {
                        conn.execute(
                            "INSERT INTO pois (file_id, file_path, name, category, start_line,
                                               end_line, is_exported, semantic_id, quality_score,
                                               snippet, run_id)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                             ON CONFLICT(run_id, semantic_id) WHERE semantic_id IS NOT NULL DO UPDATE SET
                                 name = excluded.name,
                                 category = excluded.category,
                                 start_line = excluded.start_line,
                                 end_line = excluded.end_line,
                                 is_exported = excluded.is_exported,
                                 quality_score = excluded.quality_score,
                                 snippet = excluded.snippet",
                            params![
                                file.id,
                                file.file_path,
                                poi.name,
                                poi.category,
                                poi.start_line,
                                poi.end_line,
                                poi.is_exported,
                                semantic_id,
                                poi.quality_score,
                                poi.snippet,
                                run_id
                            ],
                        )?;
                        let id: i64 = conn.query_row(
                            "SELECT id FROM pois WHERE run_id = ?1 AND semantic_id = ?2",
                            params![run_id, semantic_id],
                            |row| row.get(0),
                        )?;
                        ids.push(id);
                    }
                    None => {
                        conn.execute(
                            "INSERT INTO pois (file_id, file_path, name, category, start_line,
                                               end_line, is_exported, quality_score, snippet, run_id)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                            params![
                                file.id,
                                file.file_path,
                                poi.name,
                                poi.category,
                                poi.start_line,
                                poi.end_line,
                                poi.is_exported,
                                poi.quality_score,
                                poi.snippet,
                                run_id
                            ],
                        )?;
                        ids.push(conn.last_insert_rowid());
                    }
                }
            }

            if !ids.is_empty() {
                insert_outbox_row(
                    conn,
                    run_id,
                    &OutboxPayload::PoiCreated {
                        file_path: file.file_path.clone(),
                        poi_ids: ids.clone(),
                    },
                )?;
            }
            Ok(ids)
        })
    }

    /// Fetch one POI.
    pub fn poi_by_id(&self, id: i64) -> Result<Option<Poi>> {
        self.with_reader(|conn| {
            conn.query_row(
                &format!("{POI_SELECT} WHERE id = ?1"),
                params![id],
                row_to_poi,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// All POIs in one file for a run, in id order.
    pub fn pois_by_file(&self, run_id: &str, file_path: &str) -> Result<Vec<Poi>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "{POI_SELECT} WHERE run_id = ?1 AND file_path = ?2 ORDER BY id"
            ))?;
            let rows = stmt.query_map(params![run_id, file_path], row_to_poi)?;
            collect_rows(rows)
        })
    }

    /// POIs across every file mapped into a directory, in id order.
    pub fn pois_in_directory(&self, run_id: &str, directory: &str) -> Result<Vec<Poi>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "{POI_SELECT} WHERE run_id = ?1 AND file_path IN (
                     SELECT file_path FROM directory_file_mappings
                     WHERE run_id = ?1 AND directory = ?2
                 ) ORDER BY id"
            ))?;
            let rows = stmt.query_map(params![run_id, directory], row_to_poi)?;
            collect_rows(rows)
        })
    }

    /// Paths of every file in a run under a directory prefix.
    pub fn files_with_prefix(&self, run_id: &str, directory: &str) -> Result<Vec<String>> {
        self.with_reader(|conn| {
            let prefix = format!("{}/%", directory.trim_end_matches('/'));
            let mut stmt = conn.prepare_cached(
                "SELECT file_path FROM files
                 WHERE run_id = ?1 AND file_path LIKE ?2 ORDER BY file_path",
            )?;
            let rows = stmt.query_map(params![run_id, prefix], |row| row.get(0))?;
            collect_rows(rows)
        })
    }

    // ==================== Directory mappings ====================

    /// Record which files belong to a directory scope.
    pub fn record_directory_mappings(
        &self,
        run_id: &str,
        directory: &str,
        files: &[String],
    ) -> Result<usize> {
        let rows: Vec<Vec<SqlValue>> = files
            .iter()
            .map(|f| {
                vec![
                    SqlValue::Text(run_id.to_string()),
                    SqlValue::Text(directory.to_string()),
                    SqlValue::Text(f.clone()),
                ]
            })
            .collect();
        self.batch_insert(
            "directory_file_mappings",
            &["run_id", "directory", "file_path"],
            rows,
            100,
        )
    }

    // ==================== Relationships ====================

    /// Persist candidate relationships as PENDING plus one evidence row and
    /// one `relationship-found` outbox event per newly inserted candidate,
    /// in a single transaction. Re-delivery of the same candidates is a
    /// no-op thanks to the `(run, source, target, type)` uniqueness.
    pub fn insert_candidates_with_events(
        &self,
        run_id: &str,
        candidates: &[RelationshipCandidate],
    ) -> Result<usize> {
        if candidates.is_empty() {
            return Ok(0);
        }
        self.tx(|conn| {
            let mut inserted = 0;
            for cand in candidates {
                let evidence_hash = hash_payload(&cand.evidence_payload);
                let changed = conn.execute(
                    "INSERT OR IGNORE INTO relationships
                         (source_poi_id, target_poi_id, type, confidence, status, reason,
                          evidence_type, evidence_hash, run_id)
                     VALUES (?1, ?2, ?3, ?4, 'PENDING', ?5, ?6, ?7, ?8)",
                    params![
                        cand.source_poi_id,
                        cand.target_poi_id,
                        cand.rel_type,
                        cand.agent_confidence,
                        cand.reason,
                        cand.evidence_type,
                        evidence_hash,
                        run_id
                    ],
                )?;
                if changed == 0 {
                    continue;
                }
                let relationship_id = conn.last_insert_rowid();
                conn.execute(
                    "INSERT INTO relationship_evidence (relationship_id, payload, agent_confidence)
                     VALUES (?1, ?2, ?3)",
                    params![
                        relationship_id,
                        cand.evidence_payload.to_string(),
                        cand.agent_confidence
                    ],
                )?;
                insert_outbox_row(
                    conn,
                    run_id,
                    &OutboxPayload::RelationshipFound { relationship_id },
                )?;
                inserted += 1;
            }
            Ok(inserted)
        })
    }

    /// Fetch one relationship.
    pub fn relationship_by_id(&self, id: i64) -> Result<Option<Relationship>> {
        self.with_reader(|conn| {
            conn.query_row(
                &format!("{REL_SELECT} WHERE id = ?1"),
                params![id],
                row_to_relationship,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// All evidence for one relationship, in id order.
    pub fn evidence_for(&self, relationship_id: i64) -> Result<Vec<EvidenceRecord>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, relationship_id, payload, agent_confidence, source_relationship_id
                 FROM relationship_evidence WHERE relationship_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![relationship_id], row_to_evidence)?;
            collect_rows(rows)
        })
    }

    /// Attach evidence to a relationship, rejecting edges that would close a
    /// derived-evidence cycle and downgrading the relationship when they do.
    pub fn add_evidence(
        &self,
        relationship_id: i64,
        payload: serde_json::Value,
        agent_confidence: f64,
        source_relationship_id: Option<i64>,
    ) -> Result<EvidenceOutcome> {
        self.tx(|conn| {
            if let Some(source) = source_relationship_id {
                if would_close_cycle(conn, relationship_id, source)? {
                    downgrade_after_cycle(conn, relationship_id)?;
                    return Ok(EvidenceOutcome::CycleRejected);
                }
            }
            conn.execute(
                "INSERT INTO relationship_evidence
                     (relationship_id, payload, agent_confidence, source_relationship_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    relationship_id,
                    payload.to_string(),
                    agent_confidence,
                    source_relationship_id
                ],
            )?;
            Ok(EvidenceOutcome::Inserted(conn.last_insert_rowid()))
        })
    }

    /// Finalize a relationship's validation and, for VALIDATED, enqueue its
    /// graph projection via the outbox — atomically. VALIDATED rows must
    /// reference resolvable POIs, carry positive confidence, and a non-empty
    /// type; violations surface as integrity errors instead of landing.
    pub fn finalize_validation(
        &self,
        relationship_id: i64,
        status: RelationshipStatus,
        confidence: f64,
        reason: &str,
    ) -> Result<()> {
        self.tx(|conn| {
            let rel = conn
                .query_row(
                    &format!("{REL_SELECT} WHERE id = ?1"),
                    params![relationship_id],
                    row_to_relationship,
                )
                .optional()?
                .ok_or_else(|| {
                    Error::UnresolvedReference(format!("relationship {relationship_id}"))
                })?;

            if status == RelationshipStatus::Validated {
                if confidence <= 0.0 || confidence > 1.0 {
                    return Err(Error::Constraint(format!(
                        "relationship {relationship_id}: VALIDATED requires confidence in (0,1], got {confidence}"
                    )));
                }
                if rel.rel_type.trim().is_empty() {
                    return Err(Error::Constraint(format!(
                        "relationship {relationship_id}: VALIDATED requires a type"
                    )));
                }
                let resolvable: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM pois
                     WHERE id IN (?1, ?2) AND run_id = ?3",
                    params![rel.source_poi_id, rel.target_poi_id, rel.run_id],
                    |row| row.get(0),
                )?;
                if resolvable != 2 {
                    return Err(Error::UnresolvedReference(format!(
                        "relationship {relationship_id}: POIs missing in run {}",
                        rel.run_id
                    )));
                }
            }

            conn.execute(
                "UPDATE relationships
                 SET status = ?1, confidence = ?2, reason = ?3, updated_at = datetime('now')
                 WHERE id = ?4",
                params![status.as_str(), confidence, reason, relationship_id],
            )?;

            if status == RelationshipStatus::Validated {
                insert_outbox_row(
                    conn,
                    &rel.run_id,
                    &OutboxPayload::GraphIngest {
                        relationship_ids: vec![relationship_id],
                    },
                )?;
            }
            Ok(())
        })
    }

    /// Relationships in a run currently holding the given status.
    pub fn relationships_by_status(
        &self,
        run_id: &str,
        status: RelationshipStatus,
    ) -> Result<Vec<Relationship>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "{REL_SELECT} WHERE run_id = ?1 AND status = ?2 ORDER BY id"
            ))?;
            let rows = stmt.query_map(params![run_id, status.as_str()], row_to_relationship)?;
            collect_rows(rows)
        })
    }

    // ==================== Outbox ====================

    /// Append one outbox event outside of a domain transaction.
    pub fn append_outbox_event(&self, run_id: &str, payload: &OutboxPayload) -> Result<i64> {
        self.tx(|conn| insert_outbox_row(conn, run_id, payload))
    }

    /// Reserve up to `limit` publishable events in ascending id order via an
    /// atomic status flip to RESERVING. Reclaims reservations older than
    /// `reservation_timeout_ms`. Events whose payload no longer decodes are
    /// marked FAILED and skipped.
    pub fn reserve_outbox_batch(
        &self,
        publisher_id: &str,
        limit: usize,
        reservation_timeout_ms: u64,
    ) -> Result<Vec<OutboxEvent>> {
        self.tx(|conn| {
            let cutoff = (Utc::now()
                - chrono::Duration::milliseconds(reservation_timeout_ms as i64))
            .format(TS_FORMAT)
            .to_string();
            let now = Utc::now().format(TS_FORMAT).to_string();

            conn.execute(
                "UPDATE outbox SET status = 'RESERVING', reserved_by = ?1, reserved_at = ?2
                 WHERE id IN (
                     SELECT id FROM outbox
                     WHERE status = 'PENDING'
                        OR (status = 'RESERVING' AND (reserved_at IS NULL OR reserved_at < ?3))
                     ORDER BY id
                     LIMIT ?4
                 )",
                params![publisher_id, now, cutoff, limit as i64],
            )?;

            let mut stmt = conn.prepare_cached(
                "SELECT id, payload, run_id, status, attempts, last_error, created_at, published_at
                 FROM outbox WHERE status = 'RESERVING' AND reserved_by = ?1 ORDER BY id",
            )?;
            let raw: Vec<(i64, String, String, String, u32, Option<String>, String, Option<String>)> =
                stmt.query_map(params![publisher_id], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                })?
                .collect::<rusqlite::Result<_>>()?;

            let mut events = Vec::with_capacity(raw.len());
            for (id, payload, run_id, status, attempts, last_error, created_at, published_at) in raw
            {
                match serde_json::from_str::<OutboxPayload>(&payload) {
                    Ok(decoded) => events.push(OutboxEvent {
                        id,
                        payload: decoded,
                        run_id,
                        status: OutboxStatus::parse(&status)?,
                        attempts,
                        last_error,
                        created_at: parse_ts(&created_at),
                        published_at: published_at.as_deref().map(parse_ts),
                    }),
                    Err(e) => {
                        warn!(event_id = id, error = %e, "undecodable outbox payload, marking FAILED");
                        conn.execute(
                            "UPDATE outbox SET status = 'FAILED', last_error = ?1 WHERE id = ?2",
                            params![format!("payload decode: {e}"), id],
                        )?;
                    }
                }
            }
            Ok(events)
        })
    }

    /// Mark an event PUBLISHED. Terminal.
    pub fn mark_outbox_published(&self, event_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE outbox SET status = 'PUBLISHED', published_at = datetime('now')
                 WHERE id = ?1 AND status = 'RESERVING'",
                params![event_id],
            )?;
            Ok(())
        })
    }

    /// Return a reserved event to PENDING (backpressure skip).
    pub fn release_outbox_event(&self, event_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE outbox SET status = 'PENDING', reserved_by = NULL, reserved_at = NULL
                 WHERE id = ?1 AND status = 'RESERVING'",
                params![event_id],
            )?;
            Ok(())
        })
    }

    /// Record a publish failure; the event stays PENDING until its attempt
    /// budget is spent, then flips to FAILED.
    pub fn record_outbox_failure(
        &self,
        event_id: i64,
        error: &str,
        max_attempts: u32,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE outbox
                 SET attempts = attempts + 1,
                     last_error = ?1,
                     reserved_by = NULL,
                     reserved_at = NULL,
                     status = CASE WHEN attempts + 1 >= ?2 THEN 'FAILED' ELSE 'PENDING' END
                 WHERE id = ?3",
                params![error, max_attempts, event_id],
            )?;
            Ok(())
        })
    }

    /// Unpublished (PENDING or RESERVING) events remaining for a run.
    pub fn pending_outbox_count(&self, run_id: &str) -> Result<usize> {
        self.with_reader(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM outbox
                 WHERE run_id = ?1 AND status IN ('PENDING', 'RESERVING')",
                params![run_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    // ==================== Triangulation sessions ====================

    /// Fetch or create the session for an escalated relationship.
    pub fn upsert_session(
        &self,
        relationship_id: i64,
        run_id: &str,
    ) -> Result<TriangulationSession> {
        let session_key = format!("rel-{relationship_id}");
        self.tx(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO triangulated_analysis_sessions
                     (session_key, relationship_id, run_id, status)
                 VALUES (?1, ?2, ?3, 'PENDING')",
                params![session_key, relationship_id, run_id],
            )?;
            conn.query_row(
                &format!("{SESSION_SELECT} WHERE session_key = ?1"),
                params![session_key],
                row_to_session,
            )
            .map_err(Into::into)
        })
    }

    /// Transition a session to RUNNING and bump its escalation count.
    pub fn mark_session_running(&self, session_id: i64, escalation: u32) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE triangulated_analysis_sessions
                 SET status = 'RUNNING', escalation_count = ?1, updated_at = datetime('now')
                 WHERE id = ?2",
                params![escalation, session_id],
            )?;
            Ok(())
        })
    }

    /// Complete a session: subagent rows, the consensus decision, and the
    /// COMPLETED transition land in one transaction.
    pub fn complete_session(
        &self,
        session_id: i64,
        final_confidence: f64,
        consensus: &ConsensusRecord,
        subagents: &[SubagentRecord],
    ) -> Result<()> {
        self.tx(|conn| {
            for agent in subagents {
                conn.execute(
                    "INSERT INTO subagent_analyses
                         (session_id, agent_type, status, confidence_score, processing_time_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        session_id,
                        agent.agent_type,
                        agent.status,
                        agent.confidence_score,
                        agent.processing_time_ms as i64
                    ],
                )?;
            }
            conn.execute(
                "INSERT INTO consensus_decisions
                     (session_id, final_decision, weighted_consensus, conflict_detected)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    session_id,
                    consensus.final_decision,
                    consensus.weighted_consensus,
                    consensus.conflict_detected
                ],
            )?;
            conn.execute(
                "UPDATE triangulated_analysis_sessions
                 SET status = 'COMPLETED', final_confidence = ?1, consensus_score = ?2,
                     updated_at = datetime('now')
                 WHERE id = ?3",
                params![final_confidence, consensus.weighted_consensus, session_id],
            )?;
            Ok(())
        })
    }

    /// Fail a session with an error message.
    pub fn fail_session(&self, session_id: i64, error: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE triangulated_analysis_sessions
                 SET status = 'FAILED', error_message = ?1, updated_at = datetime('now')
                 WHERE id = ?2",
                params![error, session_id],
            )?;
            Ok(())
        })
    }

    // ==================== Run status ====================

    /// Append one run-status transition.
    pub fn append_run_status(
        &self,
        run_id: &str,
        state: RunState,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO run_status (run_id, status, metadata) VALUES (?1, ?2, ?3)",
                params![run_id, state.as_str(), metadata.map(|m| m.to_string())],
            )?;
            debug!(run_id, state = state.as_str(), "run status transition");
            Ok(())
        })
    }

    /// The full status history for a run, oldest first.
    pub fn run_status_history(&self, run_id: &str) -> Result<Vec<RunStatusRow>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, run_id, status, metadata, created_at
                 FROM run_status WHERE run_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;
            let mut history = Vec::new();
            for row in rows {
                let (id, run_id, status, metadata, created_at) = row?;
                history.push(RunStatusRow {
                    id,
                    run_id,
                    state: RunState::parse(&status)?,
                    metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                    created_at: parse_ts(&created_at),
                });
            }
            Ok(history)
        })
    }

    // ==================== Summary ====================

    /// Per-run row counts for the final summary.
    pub fn run_counts(&self, run_id: &str) -> Result<RunCounts> {
        self.with_reader(|conn| {
            let mut counts = RunCounts::default();

            let mut stmt = conn.prepare_cached(
                "SELECT status, COUNT(*) FROM files WHERE run_id = ?1 GROUP BY status",
            )?;
            let file_counts: Vec<(String, i64)> = stmt
                .query_map(params![run_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;
            for (status, n) in file_counts {
                match status.as_str() {
                    "processed" => counts.files_processed = n as usize,
                    "failed" => counts.files_failed = n as usize,
                    _ => {}
                }
            }

            counts.pois = conn.query_row(
                "SELECT COUNT(*) FROM pois WHERE run_id = ?1",
                params![run_id],
                |row| row.get::<_, i64>(0),
            )? as usize;

            let mut stmt = conn.prepare_cached(
                "SELECT status, COUNT(*) FROM relationships WHERE run_id = ?1 GROUP BY status",
            )?;
            let rel_counts: Vec<(String, i64)> = stmt
                .query_map(params![run_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;
            for (status, n) in rel_counts {
                match status.as_str() {
                    "PENDING" => counts.relationships_pending = n as usize,
                    "VALIDATED" => counts.relationships_validated = n as usize,
                    "FAILED" => counts.relationships_failed = n as usize,
                    _ => {}
                }
            }

            counts.triangulation_sessions = conn.query_row(
                "SELECT COUNT(*) FROM triangulated_analysis_sessions WHERE run_id = ?1",
                params![run_id],
                |row| row.get::<_, i64>(0),
            )? as usize;

            let mut stmt = conn.prepare_cached(
                "SELECT status, COUNT(*) FROM outbox WHERE run_id = ?1 GROUP BY status",
            )?;
            let outbox_counts: Vec<(String, i64)> = stmt
                .query_map(params![run_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;
            for (status, n) in outbox_counts {
                match status.as_str() {
                    "PENDING" | "RESERVING" => counts.outbox_pending += n as usize,
                    "PUBLISHED" => counts.outbox_published = n as usize,
                    "FAILED" => counts.outbox_failed = n as usize,
                    _ => {}
                }
            }

            Ok(counts)
        })
    }
}

// ==================== Row mapping ====================

const POI_SELECT: &str = "SELECT id, file_id, file_path, name, category, start_line, end_line,
        is_exported, semantic_id, quality_score, snippet, run_id FROM pois";

const REL_SELECT: &str = "SELECT id, source_poi_id, target_poi_id, type, confidence, status,
        reason, evidence_type, evidence_hash, run_id, created_at, updated_at FROM relationships";

const SESSION_SELECT: &str = "SELECT id, session_key, relationship_id, run_id, status,
        final_confidence, consensus_score, escalation_count, error_message, created_at, updated_at
        FROM triangulated_analysis_sessions";

fn row_to_file(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        file_path: row.get(1)?,
        content_hash: row.get(2)?,
        status: FileStatus::parse(&row.get::<_, String>(3)?)
            .unwrap_or(FileStatus::Pending),
        run_id: row.get(4)?,
        created_at: parse_ts(&row.get::<_, String>(5)?),
        updated_at: parse_ts(&row.get::<_, String>(6)?),
    })
}

fn row_to_poi(row: &Row<'_>) -> rusqlite::Result<Poi> {
    Ok(Poi {
        id: row.get(0)?,
        file_id: row.get(1)?,
        file_path: row.get(2)?,
        name: row.get(3)?,
        category: row.get(4)?,
        start_line: row.get(5)?,
        end_line: row.get(6)?,
        is_exported: row.get(7)?,
        semantic_id: row.get(8)?,
        quality_score: row.get(9)?,
        snippet: row.get(10)?,
        run_id: row.get(11)?,
    })
}

fn row_to_relationship(row: &Row<'_>) -> rusqlite::Result<Relationship> {
    Ok(Relationship {
        id: row.get(0)?,
        source_poi_id: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
        target_poi_id: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
        rel_type: row.get(3)?,
        confidence: row.get(4)?,
        status: RelationshipStatus::parse(&row.get::<_, String>(5)?)
            .unwrap_or(RelationshipStatus::Pending),
        reason: row.get(6)?,
        evidence_type: row.get(7)?,
        evidence_hash: row.get(8)?,
        run_id: row.get(9)?,
        created_at: parse_ts(&row.get::<_, String>(10)?),
        updated_at: parse_ts(&row.get::<_, String>(11)?),
    })
}

fn row_to_evidence(row: &Row<'_>) -> rusqlite::Result<EvidenceRecord> {
    let payload: String = row.get(2)?;
    Ok(EvidenceRecord {
        id: row.get(0)?,
        relationship_id: row.get(1)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        agent_confidence: row.get(3)?,
        source_relationship_id: row.get(4)?,
    })
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<TriangulationSession> {
    Ok(TriangulationSession {
        id: row.get(0)?,
        session_key: row.get(1)?,
        relationship_id: row.get(2)?,
        run_id: row.get(3)?,
        status: SessionStatus::parse(&row.get::<_, String>(4)?)
            .unwrap_or(SessionStatus::Pending),
        final_confidence: row.get(5)?,
        consensus_score: row.get(6)?,
        escalation_count: row.get(7)?,
        error_message: row.get(8)?,
        created_at: parse_ts(&row.get::<_, String>(9)?),
        updated_at: parse_ts(&row.get::<_, String>(10)?),
    })
}

fn insert_outbox_row(conn: &Connection, run_id: &str, payload: &OutboxPayload) -> Result<i64> {
    let json = serde_json::to_string(payload)?;
    conn.execute(
        "INSERT INTO outbox (payload, run_id, status) VALUES (?1, ?2, 'PENDING')",
        params![json, run_id],
    )?;
    Ok(conn.last_insert_rowid())
}

fn hash_payload(payload: &serde_json::Value) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

fn collect_rows<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Parse timestamps written either by SQLite's `datetime('now')` or by the
/// millisecond-precision reservation format.
fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, TS_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> SqliteStore {
        SqliteStore::in_memory().unwrap()
    }

    fn extracted(name: &str, semantic_id: Option<&str>) -> ExtractedPoi {
        ExtractedPoi {
            name: name.to_string(),
            category: "function".to_string(),
            start_line: 1,
            end_line: 3,
            is_exported: true,
            semantic_id: semantic_id.map(str::to_string),
            quality_score: Some(0.9),
            snippet: format!("function {name}() {{ }}"),
        }
    }

    fn seed_file(store: &SqliteStore, run: &str, path: &str) -> FileRecord {
        store.upsert_file(run, path, "hash-1").unwrap().0
    }

    #[test]
    fn file_upsert_resets_status_on_hash_change() {
        let store = store();
        let (file, dirty) = store.upsert_file("run-1", "/a.js", "h1").unwrap();
        assert!(dirty);
        store
            .set_file_status("run-1", "/a.js", FileStatus::Processed)
            .unwrap();

        // Same hash, already processed: clean.
        let (_, dirty) = store.upsert_file("run-1", "/a.js", "h1").unwrap();
        assert!(!dirty);

        // New hash: dirty again, status back to pending.
        let (again, dirty) = store.upsert_file("run-1", "/a.js", "h2").unwrap();
        assert!(dirty);
        assert_eq!(again.id, file.id);
        assert_eq!(again.status, FileStatus::Pending);
    }

    #[test]
    fn poi_insert_writes_event_in_same_transaction() {
        let store = store();
        let file = seed_file(&store, "run-1", "/a.js");

        let ids = store
            .insert_pois_with_event(
                "run-1",
                &file,
                &[extracted("foo", Some("a.js:foo")), extracted("bar", None)],
            )
            .unwrap();
        assert_eq!(ids.len(), 2);

        let events = store
            .reserve_outbox_batch("pub-1", 10, 60_000)
            .unwrap();
        assert_eq!(events.len(), 1);
        match &events[0].payload {
            OutboxPayload::PoiCreated { poi_ids, .. } => assert_eq!(poi_ids, &ids),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn semantic_id_collision_upserts_onto_first_row() {
        let store = store();
        let file = seed_file(&store, "run-1", "/a.js");

        let first = store
            .insert_pois_with_event("run-1", &file, &[extracted("foo", Some("a.js:foo"))])
            .unwrap();
        let mut renamed = extracted("foo_v2", Some("a.js:foo"));
        renamed.start_line = 10;
        renamed.end_line = 12;
        let second = store
            .insert_pois_with_event("run-1", &file, &[renamed])
            .unwrap();

        assert_eq!(first, second);
        let poi = store.poi_by_id(first[0]).unwrap().unwrap();
        assert_eq!(poi.name, "foo_v2");
        assert_eq!(poi.start_line, 10);
    }

    #[test]
    fn candidate_insert_is_idempotent_and_emits_one_event_each() {
        let store = store();
        let file = seed_file(&store, "run-1", "/a.js");
        let ids = store
            .insert_pois_with_event(
                "run-1",
                &file,
                &[extracted("foo", Some("f")), extracted("bar", Some("b"))],
            )
            .unwrap();

        let cand = RelationshipCandidate {
            source_poi_id: ids[0],
            target_poi_id: ids[1],
            rel_type: "CALLS".to_string(),
            reason: "call site".to_string(),
            evidence_type: "function-call-pattern".to_string(),
            agent_confidence: 0.6,
            evidence_payload: serde_json::json!({"rule": "function-call-pattern"}),
        };

        assert_eq!(
            store
                .insert_candidates_with_events("run-1", &[cand.clone()])
                .unwrap(),
            1
        );
        // Duplicate delivery: no new row, no new event.
        assert_eq!(
            store.insert_candidates_with_events("run-1", &[cand]).unwrap(),
            0
        );

        let rels = store
            .relationships_by_status("run-1", RelationshipStatus::Pending)
            .unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(store.evidence_for(rels[0].id).unwrap().len(), 1);
    }

    #[test]
    fn finalize_validation_rejects_orphans() {
        let store = store();
        let file = seed_file(&store, "run-1", "/a.js");
        let ids = store
            .insert_pois_with_event("run-1", &file, &[extracted("foo", Some("f"))])
            .unwrap();

        let cand = RelationshipCandidate {
            source_poi_id: ids[0],
            target_poi_id: 9_999,
            rel_type: "CALLS".to_string(),
            reason: String::new(),
            evidence_type: "function-call-pattern".to_string(),
            agent_confidence: 0.6,
            evidence_payload: serde_json::Value::Null,
        };
        store.insert_candidates_with_events("run-1", &[cand]).unwrap();
        let rel = &store
            .relationships_by_status("run-1", RelationshipStatus::Pending)
            .unwrap()[0];

        let err = store
            .finalize_validation(rel.id, RelationshipStatus::Validated, 0.8, "ok")
            .unwrap_err();
        assert!(matches!(err, Error::UnresolvedReference(_)));
    }

    #[test]
    fn finalize_validation_enqueues_graph_ingest_event() {
        let store = store();
        let file = seed_file(&store, "run-1", "/a.js");
        let ids = store
            .insert_pois_with_event(
                "run-1",
                &file,
                &[extracted("foo", Some("f")), extracted("bar", Some("b"))],
            )
            .unwrap();
        let cand = RelationshipCandidate {
            source_poi_id: ids[0],
            target_poi_id: ids[1],
            rel_type: "CALLS".to_string(),
            reason: String::new(),
            evidence_type: "function-call-pattern".to_string(),
            agent_confidence: 0.6,
            evidence_payload: serde_json::Value::Null,
        };
        store.insert_candidates_with_events("run-1", &[cand]).unwrap();
        let rel_id = store
            .relationships_by_status("run-1", RelationshipStatus::Pending)
            .unwrap()[0]
            .id;

        store
            .finalize_validation(rel_id, RelationshipStatus::Validated, 0.8, "scored")
            .unwrap();

        let events = store.reserve_outbox_batch("pub-1", 100, 60_000).unwrap();
        assert!(events.iter().any(|e| matches!(
            &e.payload,
            OutboxPayload::GraphIngest { relationship_ids } if relationship_ids == &vec![rel_id]
        )));
    }

    #[test]
    fn outbox_reservation_is_exclusive_until_timeout() {
        let store = store();
        store
            .append_outbox_event(
                "run-1",
                &OutboxPayload::RelationshipFound { relationship_id: 1 },
            )
            .unwrap();

        let first = store.reserve_outbox_batch("pub-a", 10, 60_000).unwrap();
        assert_eq!(first.len(), 1);

        // Another publisher sees nothing while the reservation is fresh.
        let second = store.reserve_outbox_batch("pub-b", 10, 60_000).unwrap();
        assert!(second.is_empty());

        // A zero timeout makes the reservation immediately stale.
        let reclaimed = store.reserve_outbox_batch("pub-b", 10, 0).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, first[0].id);
    }

    #[test]
    fn published_is_terminal() {
        let store = store();
        let id = store
            .append_outbox_event(
                "run-1",
                &OutboxPayload::RelationshipFound { relationship_id: 1 },
            )
            .unwrap();

        let reserved = store.reserve_outbox_batch("pub-a", 10, 60_000).unwrap();
        store.mark_outbox_published(reserved[0].id).unwrap();

        assert_eq!(store.pending_outbox_count("run-1").unwrap(), 0);
        assert!(store.reserve_outbox_batch("pub-b", 10, 0).unwrap().is_empty());
        let _ = id;
    }

    #[test]
    fn outbox_failure_flips_to_failed_after_budget() {
        let store = store();
        let id = store
            .append_outbox_event(
                "run-1",
                &OutboxPayload::RelationshipFound { relationship_id: 1 },
            )
            .unwrap();

        store.record_outbox_failure(id, "enqueue failed", 2).unwrap();
        assert_eq!(store.pending_outbox_count("run-1").unwrap(), 1);
        store.record_outbox_failure(id, "enqueue failed", 2).unwrap();
        assert_eq!(store.pending_outbox_count("run-1").unwrap(), 0);

        let counts = store.run_counts("run-1").unwrap();
        assert_eq!(counts.outbox_failed, 1);
    }

    #[test]
    fn session_lifecycle_round_trips() {
        let store = store();
        let session = store.upsert_session(42, "run-1").unwrap();
        assert_eq!(session.status, SessionStatus::Pending);

        // Upsert is stable: same relationship, same session.
        let again = store.upsert_session(42, "run-1").unwrap();
        assert_eq!(again.id, session.id);

        store.mark_session_running(session.id, 0).unwrap();
        store
            .complete_session(
                session.id,
                0.7,
                &ConsensusRecord {
                    session_id: session.id,
                    final_decision: "ACCEPT".to_string(),
                    weighted_consensus: 0.7,
                    conflict_detected: false,
                },
                &[SubagentRecord {
                    id: 0,
                    session_id: session.id,
                    agent_type: "syntactic".to_string(),
                    status: "COMPLETED".to_string(),
                    confidence_score: Some(0.7),
                    processing_time_ms: 12,
                }],
            )
            .unwrap();
    }

    #[test]
    fn run_status_history_preserves_order() {
        let store = store();
        store.append_run_status("run-1", RunState::Started, None).unwrap();
        store
            .append_run_status("run-1", RunState::Processing, None)
            .unwrap();
        store
            .append_run_status(
                "run-1",
                RunState::Completed,
                Some(&serde_json::json!({"files": 3})),
            )
            .unwrap();

        let history = store.run_status_history("run-1").unwrap();
        let states: Vec<RunState> = history.iter().map(|h| h.state).collect();
        assert_eq!(
            states,
            vec![RunState::Started, RunState::Processing, RunState::Completed]
        );
    }

    #[test]
    fn probe_roundtrip_succeeds_on_healthy_store() {
        let store = store();
        store.probe_roundtrip().unwrap();
    }

    #[test]
    fn directory_mappings_feed_directory_scope_queries() {
        let store = store();
        let a = seed_file(&store, "run-1", "/src/a.js");
        let b = seed_file(&store, "run-1", "/src/b.js");
        store
            .insert_pois_with_event("run-1", &a, &[extracted("foo", Some("a:foo"))])
            .unwrap();
        store
            .insert_pois_with_event("run-1", &b, &[extracted("bar", Some("b:bar"))])
            .unwrap();
        store
            .record_directory_mappings(
                "run-1",
                "/src",
                &["/src/a.js".to_string(), "/src/b.js".to_string()],
            )
            .unwrap();

        let pois = store.pois_in_directory("run-1", "/src").unwrap();
        assert_eq!(pois.len(), 2);
    }
}
