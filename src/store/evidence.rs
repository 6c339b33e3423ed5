//! Evidence cycle detection.
//!
//! Derived evidence links relationships into a directed graph via
//! `source_relationship_id`. The graph must stay acyclic; a bounded
//! recursive walk (<= 10 hops) checks each insert before it lands.

use rusqlite::{params, Connection};
use tracing::warn;

use crate::error::Result;

/// Maximum hops followed up a derived-evidence chain.
pub const MAX_EVIDENCE_HOPS: u32 = 10;

/// Outcome of an evidence insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceOutcome {
    /// Evidence row inserted with the given id.
    Inserted(i64),
    /// The edge would have closed a cycle; nothing was inserted and the
    /// originating relationship was downgraded.
    CycleRejected,
}

/// Would attaching evidence derived from `source_relationship_id` onto
/// `relationship_id` close a cycle?
///
/// Walks the existing derived-evidence chain upward from the source with
/// path-depth tracking, bounded to [`MAX_EVIDENCE_HOPS`].
pub fn would_close_cycle(
    conn: &Connection,
    relationship_id: i64,
    source_relationship_id: i64,
) -> Result<bool> {
    if relationship_id == source_relationship_id {
        return Ok(true);
    }

    let hits: i64 = conn.query_row(
        "WITH RECURSIVE chain(rel_id, depth) AS (
             SELECT ?1, 1
             UNION
             SELECT e.source_relationship_id, chain.depth + 1
             FROM relationship_evidence e
             JOIN chain ON e.relationship_id = chain.rel_id
             WHERE e.source_relationship_id IS NOT NULL
               AND chain.depth < ?3
         )
         SELECT COUNT(*) FROM chain WHERE rel_id = ?2",
        params![source_relationship_id, relationship_id, MAX_EVIDENCE_HOPS],
        |row| row.get(0),
    )?;
    Ok(hits > 0)
}

/// Downgrade a relationship after a cycle rejection: clamp its confidence
/// and, unless non-derived evidence still supports it, fail it outright.
pub fn downgrade_after_cycle(conn: &Connection, relationship_id: i64) -> Result<()> {
    let non_derived: i64 = conn.query_row(
        "SELECT COUNT(*) FROM relationship_evidence
         WHERE relationship_id = ?1 AND source_relationship_id IS NULL",
        params![relationship_id],
        |row| row.get(0),
    )?;

    if non_derived > 0 {
        conn.execute(
            "UPDATE relationships
             SET confidence = MIN(confidence, 0.5), updated_at = datetime('now')
             WHERE id = ?1",
            params![relationship_id],
        )?;
        warn!(relationship_id, "cyclic evidence rejected; confidence clamped");
    } else {
        conn.execute(
            "UPDATE relationships
             SET status = 'FAILED',
                 reason = 'rejected: derived evidence formed a cycle',
                 updated_at = datetime('now')
             WHERE id = ?1 AND status = 'PENDING'",
            params![relationship_id],
        )?;
        warn!(relationship_id, "cyclic evidence rejected; relationship failed");
    }
    Ok(())
}
