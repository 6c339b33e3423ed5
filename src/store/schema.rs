//! SQLite schema, additive migrations, and startup normalization.
//!
//! Migration policy: absent tables and columns are created, existing ones
//! are never dropped. Orphan rows left behind by earlier schema versions are
//! normalized in a separate, explicitly gated pass.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Configure a connection with production pragmas: WAL for concurrent
/// readers during writes, NORMAL synchronous as the WAL durability
/// trade-off, and a busy timeout as the primary lock-contention mechanism.
pub fn configure_connection(conn: &Connection, wal: bool) -> Result<()> {
    if wal {
        conn.pragma_update(None, "journal_mode", "WAL")?;
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    Ok(())
}

/// Initialize the database schema. Idempotent; additive-only.
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_v1_schema(conn)?;
    }

    Ok(())
}

fn apply_v1_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_path TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            run_id TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (run_id, file_path)
        );

        CREATE TABLE IF NOT EXISTS pois (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id INTEGER NOT NULL,
            file_path TEXT NOT NULL,
            name TEXT NOT NULL,
            category TEXT NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            is_exported INTEGER NOT NULL DEFAULT 0,
            semantic_id TEXT,
            quality_score REAL,
            snippet TEXT NOT NULL DEFAULT '',
            run_id TEXT NOT NULL,
            FOREIGN KEY (file_id) REFERENCES files(id)
        );

        CREATE TABLE IF NOT EXISTS relationships (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_poi_id INTEGER,
            target_poi_id INTEGER,
            type TEXT NOT NULL,
            confidence REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'PENDING',
            reason TEXT NOT NULL DEFAULT '',
            evidence_type TEXT NOT NULL DEFAULT '',
            evidence_hash TEXT,
            run_id TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (run_id, source_poi_id, target_poi_id, type)
        );

        CREATE TABLE IF NOT EXISTS relationship_evidence (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            relationship_id INTEGER NOT NULL,
            payload TEXT NOT NULL,
            agent_confidence REAL NOT NULL DEFAULT 0,
            source_relationship_id INTEGER,
            FOREIGN KEY (relationship_id) REFERENCES relationships(id)
        );

        CREATE TABLE IF NOT EXISTS triangulated_analysis_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_key TEXT NOT NULL UNIQUE,
            relationship_id INTEGER NOT NULL,
            run_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            final_confidence REAL,
            consensus_score REAL,
            escalation_count INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS subagent_analyses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL,
            agent_type TEXT NOT NULL,
            status TEXT NOT NULL,
            confidence_score REAL,
            processing_time_ms INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (session_id) REFERENCES triangulated_analysis_sessions(id)
        );

        CREATE TABLE IF NOT EXISTS consensus_decisions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL,
            final_decision TEXT NOT NULL,
            weighted_consensus REAL NOT NULL,
            conflict_detected INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (session_id) REFERENCES triangulated_analysis_sessions(id)
        );

        CREATE TABLE IF NOT EXISTS outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            payload TEXT NOT NULL,
            run_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            reserved_by TEXT,
            reserved_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            published_at TEXT
        );

        CREATE TABLE IF NOT EXISTS run_status (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            status TEXT NOT NULL,
            metadata TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS directory_file_mappings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            directory TEXT NOT NULL,
            file_path TEXT NOT NULL,
            UNIQUE (run_id, directory, file_path)
        );

        CREATE TABLE IF NOT EXISTS health_probe (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            token TEXT NOT NULL,
            probed_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_files_path ON files(file_path);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_pois_semantic
            ON pois(run_id, semantic_id) WHERE semantic_id IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_pois_file_path ON pois(file_path);
        CREATE INDEX IF NOT EXISTS idx_pois_run ON pois(run_id);
        CREATE INDEX IF NOT EXISTS idx_relationships_run_status
            ON relationships(run_id, status);
        CREATE INDEX IF NOT EXISTS idx_relationships_source
            ON relationships(source_poi_id);
        CREATE INDEX IF NOT EXISTS idx_relationships_target
            ON relationships(target_poi_id);
        CREATE INDEX IF NOT EXISTS idx_outbox_status_id ON outbox(status, id);
        CREATE INDEX IF NOT EXISTS idx_evidence_relationship
            ON relationship_evidence(relationship_id);
        CREATE INDEX IF NOT EXISTS idx_dir_mappings
            ON directory_file_mappings(run_id, directory);
        ",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (1)",
        [],
    )?;
    Ok(())
}

/// Counts of rows touched by the startup normalization pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizationReport {
    /// VALIDATED relationships with unresolvable POI ids demoted to FAILED.
    pub orphans_demoted: usize,
    /// Confidences clamped back into [0,1].
    pub confidence_clamped: usize,
    /// PENDING relationships with no evidence reset to zero confidence.
    pub no_evidence_reset: usize,
    /// Non-terminal triangulation sessions demoted to FAILED.
    pub stale_sessions_failed: usize,
}

impl NormalizationReport {
    pub fn total(&self) -> usize {
        self.orphans_demoted
            + self.confidence_clamped
            + self.no_evidence_reset
            + self.stale_sessions_failed
    }
}

/// Normalize rows left inconsistent by crashes or older schema versions.
///
/// Runs at store open when `normalize_on_startup` is set; each sub-pass
/// logs the number of rows it touched.
pub fn normalize_orphans(conn: &Connection) -> Result<NormalizationReport> {
    let orphans_demoted = conn.execute(
        "UPDATE relationships SET status = 'FAILED',
                reason = 'orphaned: POI reference did not resolve',
                updated_at = datetime('now')
         WHERE status = 'VALIDATED'
           AND (source_poi_id IS NULL
                OR target_poi_id IS NULL
                OR source_poi_id NOT IN (SELECT id FROM pois)
                OR target_poi_id NOT IN (SELECT id FROM pois))",
        [],
    )?;

    let confidence_clamped = conn.execute(
        "UPDATE relationships
         SET confidence = MAX(0.0, MIN(1.0, confidence)), updated_at = datetime('now')
         WHERE confidence < 0.0 OR confidence > 1.0",
        [],
    )?;

    let no_evidence_reset = conn.execute(
        "UPDATE relationships SET confidence = 0.0, updated_at = datetime('now')
         WHERE status = 'PENDING' AND confidence > 0.0
           AND id NOT IN (SELECT DISTINCT relationship_id FROM relationship_evidence)",
        [],
    )?;

    // COMPLETED requires both scores; anything else mid-flight is dead.
    let stale_sessions_failed = conn.execute(
        "UPDATE triangulated_analysis_sessions
         SET status = 'FAILED',
             error_message = COALESCE(error_message, 'interrupted before completion'),
             updated_at = datetime('now')
         WHERE status IN ('PENDING', 'RUNNING')
            OR (status = 'COMPLETED'
                AND (final_confidence IS NULL OR consensus_score IS NULL))",
        [],
    )?;

    let report = NormalizationReport {
        orphans_demoted,
        confidence_clamped,
        no_evidence_reset,
        stale_sessions_failed,
    };
    if report.total() > 0 {
        info!(
            orphans = report.orphans_demoted,
            clamped = report.confidence_clamped,
            reset = report.no_evidence_reset,
            sessions = report.stale_sessions_failed,
            "normalized inconsistent rows at startup"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        configure_connection(&conn, false).unwrap();
        initialize_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn schema_initialization_is_idempotent() {
        let conn = test_conn();
        initialize_schema(&conn).unwrap();

        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn busy_timeout_is_configured() {
        let conn = Connection::open_in_memory().unwrap();
        configure_connection(&conn, false).unwrap();
        let timeout: i64 = conn
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))
            .unwrap();
        assert_eq!(timeout, 5000);
    }

    #[test]
    fn normalization_demotes_orphaned_validated_relationships() {
        let conn = test_conn();
        conn.execute(
            "INSERT INTO relationships (source_poi_id, target_poi_id, type, confidence, status, run_id)
             VALUES (999, 998, 'CALLS', 0.9, 'VALIDATED', 'run-1')",
            [],
        )
        .unwrap();

        let report = normalize_orphans(&conn).unwrap();
        assert_eq!(report.orphans_demoted, 1);

        let status: String = conn
            .query_row("SELECT status FROM relationships", [], |row| row.get(0))
            .unwrap();
        assert_eq!(status, "FAILED");
    }

    #[test]
    fn normalization_clamps_impossible_confidence() {
        let conn = test_conn();
        conn.execute(
            "INSERT INTO relationships (source_poi_id, target_poi_id, type, confidence, status, run_id)
             VALUES (NULL, NULL, 'CALLS', 3.5, 'PENDING', 'run-1')",
            [],
        )
        .unwrap();

        let report = normalize_orphans(&conn).unwrap();
        assert_eq!(report.confidence_clamped, 1);

        let confidence: f64 = conn
            .query_row("SELECT confidence FROM relationships", [], |row| row.get(0))
            .unwrap();
        // Clamped to 1.0, then reset to 0.0 by the no-evidence pass.
        assert!(confidence <= 1.0);
    }

    #[test]
    fn normalization_fails_interrupted_sessions() {
        let conn = test_conn();
        conn.execute(
            "INSERT INTO triangulated_analysis_sessions (session_key, relationship_id, run_id, status)
             VALUES ('k1', 1, 'run-1', 'RUNNING')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO triangulated_analysis_sessions
                 (session_key, relationship_id, run_id, status, final_confidence, consensus_score)
             VALUES ('k2', 2, 'run-1', 'COMPLETED', NULL, NULL)",
            [],
        )
        .unwrap();

        let report = normalize_orphans(&conn).unwrap();
        assert_eq!(report.stale_sessions_failed, 2);
    }

    #[test]
    fn semantic_id_uniqueness_is_enforced_per_run() {
        let conn = test_conn();
        conn.execute(
            "INSERT INTO files (file_path, content_hash, run_id) VALUES ('/a.js', 'h', 'run-1')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO pois (file_id, file_path, name, category, start_line, end_line, semantic_id, run_id)
             VALUES (1, '/a.js', 'foo', 'function', 1, 2, 'a.js:foo', 'run-1')",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO pois (file_id, file_path, name, category, start_line, end_line, semantic_id, run_id)
             VALUES (1, '/a.js', 'foo', 'function', 1, 2, 'a.js:foo', 'run-1')",
            [],
        );
        assert!(dup.is_err());

        // Same semantic id in another run is fine.
        conn.execute(
            "INSERT INTO pois (file_id, file_path, name, category, start_line, end_line, semantic_id, run_id)
             VALUES (1, '/a.js', 'foo', 'function', 1, 2, 'a.js:foo', 'run-2')",
            [],
        )
        .unwrap();
    }
}
