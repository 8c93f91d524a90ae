//! Proof challenge query functions.

use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use granary_types::clock::{day_start, SECS_PER_DAY};
use granary_types::{ChallengeState, FailureReason, ProofChallenge};

use crate::queries::files::parse_uuid;
use crate::{DbError, Result};

fn challenge_from_row(row: &rusqlite::Row) -> rusqlite::Result<ProofChallenge> {
    let challenge_id: String = row.get(0)?;
    let chunk_id: String = row.get(1)?;
    let seed: Vec<u8> = row.get(3)?;
    let state: String = row.get(6)?;
    let failure_reason: Option<String> = row.get(9)?;

    let seed: [u8; 32] = seed.try_into().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Blob,
            "seed is not 32 bytes".into(),
        )
    })?;

    Ok(ProofChallenge {
        challenge_id: parse_uuid(challenge_id, 0)?,
        chunk_id: parse_uuid(chunk_id, 1)?,
        peer_id: row.get(2)?,
        seed,
        difficulty: row.get::<_, i64>(4)? as u32,
        issued_at: row.get::<_, i64>(5)? as u64,
        state: state.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?,
        proof_hash: row.get(7)?,
        duration_ms: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
        failure_reason: failure_reason
            .map(|r| {
                r.parse().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        9,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })
            })
            .transpose()?,
    })
}

const CHALLENGE_COLUMNS: &str = "challenge_id, chunk_id, peer_id, seed, difficulty, \
     issued_at, state, proof_hash, duration_ms, failure_reason";

/// Insert a freshly issued `pending` challenge.
pub fn insert_pending(conn: &Connection, challenge: &ProofChallenge) -> Result<()> {
    conn.execute(
        "INSERT INTO proof_challenges (challenge_id, chunk_id, peer_id, seed,
             difficulty, issued_at, state)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending')",
        rusqlite::params![
            challenge.challenge_id.to_string(),
            challenge.chunk_id.to_string(),
            challenge.peer_id,
            challenge.seed.as_slice(),
            challenge.difficulty as i64,
            challenge.issued_at as i64,
        ],
    )?;
    Ok(())
}

/// Fetch a challenge that must exist.
pub fn get(conn: &Connection, challenge_id: Uuid) -> Result<ProofChallenge> {
    conn.query_row(
        &format!("SELECT {CHALLENGE_COLUMNS} FROM proof_challenges WHERE challenge_id = ?1"),
        [challenge_id.to_string()],
        challenge_from_row,
    )
    .optional()?
    .ok_or_else(|| DbError::NotFound(format!("challenge {challenge_id}")))
}

/// Terminal transition `pending → verified`.
pub fn mark_verified(
    conn: &Connection,
    challenge_id: Uuid,
    proof_hash: &str,
    duration_ms: u64,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE proof_challenges
         SET state = 'verified', proof_hash = ?1, duration_ms = ?2
         WHERE challenge_id = ?3 AND state = 'pending'",
        rusqlite::params![proof_hash, duration_ms as i64, challenge_id.to_string()],
    )?;
    if updated == 0 {
        return Err(DbError::NotFound(format!(
            "pending challenge {challenge_id}"
        )));
    }
    Ok(())
}

/// Terminal transition `pending → failed`.
pub fn mark_failed(
    conn: &Connection,
    challenge_id: Uuid,
    reason: FailureReason,
    proof_hash: Option<&str>,
    duration_ms: Option<u64>,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE proof_challenges
         SET state = 'failed', failure_reason = ?1, proof_hash = ?2, duration_ms = ?3
         WHERE challenge_id = ?4 AND state = 'pending'",
        rusqlite::params![
            reason.as_str(),
            proof_hash,
            duration_ms.map(|v| v as i64),
            challenge_id.to_string(),
        ],
    )?;
    if updated == 0 {
        return Err(DbError::NotFound(format!(
            "pending challenge {challenge_id}"
        )));
    }
    Ok(())
}

/// `(chunk, peer)` pairs due for a challenge: assignment `active`, peer
/// `active`, chunk never verified or verified before `now - period`.
pub fn due_pairs(
    conn: &Connection,
    now: u64,
    period_secs: u64,
    limit: u32,
) -> Result<Vec<(Uuid, String)>> {
    let cutoff = now.saturating_sub(period_secs) as i64;
    let mut stmt = conn.prepare(
        "SELECT a.chunk_id, a.peer_id
         FROM chunk_assignments a
         JOIN peers p ON p.peer_id = a.peer_id
         JOIN chunks c ON c.chunk_id = a.chunk_id
         WHERE a.state = 'active'
           AND p.status = 'active'
           AND (c.last_verified_at IS NULL OR c.last_verified_at < ?1)
         ORDER BY c.last_verified_at ASC NULLS FIRST
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![cutoff, limit as i64], |row| {
            let chunk_id: String = row.get(0)?;
            Ok((parse_uuid(chunk_id, 0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// `(verified, total)` challenge counts for a peer on one epoch-day.
pub fn day_stats(conn: &Connection, peer_id: &str, day: u64) -> Result<(u64, u64)> {
    let start = day_start(day) as i64;
    let end = start + SECS_PER_DAY as i64;
    conn.query_row(
        "SELECT
             COUNT(CASE WHEN state = 'verified' THEN 1 END),
             COUNT(*)
         FROM proof_challenges
         WHERE peer_id = ?1 AND issued_at >= ?2 AND issued_at < ?3",
        rusqlite::params![peer_id, start, end],
        |row| {
            Ok((
                row.get::<_, i64>(0)? as u64,
                row.get::<_, i64>(1)? as u64,
            ))
        },
    )
    .map_err(DbError::Sqlite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::{assignments, chunks};
    use crate::testutil::{seed_chunk, seed_file, seed_peer, test_db};
    use granary_types::AssignmentState;

    fn seed_challenge(conn: &Connection, chunk_id: Uuid, peer_id: &str, issued_at: u64) -> Uuid {
        let challenge = ProofChallenge {
            challenge_id: Uuid::new_v4(),
            chunk_id,
            peer_id: peer_id.to_string(),
            seed: [9u8; 32],
            difficulty: 1000,
            issued_at,
            state: ChallengeState::Pending,
            proof_hash: None,
            duration_ms: None,
            failure_reason: None,
        };
        insert_pending(conn, &challenge).expect("insert challenge");
        challenge.challenge_id
    }

    #[test]
    fn test_insert_and_get() {
        let conn = test_db();
        let file = seed_file(&conn);
        let chunk = seed_chunk(&conn, file.file_id, 0, 64);
        seed_peer(&conn, "p1");

        let id = seed_challenge(&conn, chunk.chunk_id, "p1", 7000);
        let loaded = get(&conn, id).expect("get");
        assert_eq!(loaded.state, ChallengeState::Pending);
        assert_eq!(loaded.seed, [9u8; 32]);
        assert_eq!(loaded.difficulty, 1000);
    }

    #[test]
    fn test_verified_is_terminal() {
        let conn = test_db();
        let file = seed_file(&conn);
        let chunk = seed_chunk(&conn, file.file_id, 0, 64);
        seed_peer(&conn, "p1");
        let id = seed_challenge(&conn, chunk.chunk_id, "p1", 7000);

        mark_verified(&conn, id, &"a".repeat(64), 120).expect("verify");
        let loaded = get(&conn, id).expect("get");
        assert_eq!(loaded.state, ChallengeState::Verified);
        assert_eq!(loaded.duration_ms, Some(120));

        // A second write to the same challenge must not land.
        assert!(mark_failed(&conn, id, FailureReason::Timeout, None, None).is_err());
    }

    #[test]
    fn test_failed_records_reason() {
        let conn = test_db();
        let file = seed_file(&conn);
        let chunk = seed_chunk(&conn, file.file_id, 0, 64);
        seed_peer(&conn, "p1");
        let id = seed_challenge(&conn, chunk.chunk_id, "p1", 7000);

        mark_failed(&conn, id, FailureReason::Mismatch, Some(&"b".repeat(64)), Some(90))
            .expect("fail");
        let loaded = get(&conn, id).expect("get");
        assert_eq!(loaded.state, ChallengeState::Failed);
        assert_eq!(loaded.failure_reason, Some(FailureReason::Mismatch));
    }

    #[test]
    fn test_due_pairs_selects_stale_active_only() {
        let conn = test_db();
        let file = seed_file(&conn);
        let fresh = seed_chunk(&conn, file.file_id, 0, 64);
        let stale = seed_chunk(&conn, file.file_id, 1, 64);
        let never = seed_chunk(&conn, file.file_id, 2, 64);
        seed_peer(&conn, "p1");

        for chunk_id in [fresh.chunk_id, stale.chunk_id, never.chunk_id] {
            let a = Uuid::new_v4();
            assignments::insert_pending(&conn, a, chunk_id, "p1", 100).expect("assign");
            assignments::set_state(&conn, a, AssignmentState::Active).expect("activate");
        }

        let now = 100_000;
        let period = 14_400;
        chunks::set_last_verified(&conn, fresh.chunk_id, now - 100).expect("stamp");
        chunks::set_last_verified(&conn, stale.chunk_id, now - period - 1).expect("stamp");

        let due = due_pairs(&conn, now, period, 10).expect("due");
        let due_chunks: Vec<Uuid> = due.iter().map(|(c, _)| *c).collect();
        assert_eq!(due.len(), 2);
        assert!(due_chunks.contains(&stale.chunk_id));
        assert!(due_chunks.contains(&never.chunk_id));
        assert!(!due_chunks.contains(&fresh.chunk_id));
    }

    #[test]
    fn test_due_pairs_skips_inactive_peer() {
        let conn = test_db();
        let file = seed_file(&conn);
        let chunk = seed_chunk(&conn, file.file_id, 0, 64);
        seed_peer(&conn, "p1");
        let a = Uuid::new_v4();
        assignments::insert_pending(&conn, a, chunk.chunk_id, "p1", 100).expect("assign");
        assignments::set_state(&conn, a, AssignmentState::Active).expect("activate");

        crate::queries::peers::set_status(&conn, "p1", granary_types::PeerStatus::Dead)
            .expect("kill");
        assert!(due_pairs(&conn, 100_000, 3600, 10).expect("due").is_empty());
    }

    #[test]
    fn test_day_stats() {
        let conn = test_db();
        let file = seed_file(&conn);
        let chunk = seed_chunk(&conn, file.file_id, 0, 64);
        seed_peer(&conn, "p1");

        let day = 19_000u64;
        let base = day_start(day);
        let ok = seed_challenge(&conn, chunk.chunk_id, "p1", base + 10);
        let bad = seed_challenge(&conn, chunk.chunk_id, "p1", base + 20);
        // Next day's challenge stays out of scope.
        seed_challenge(&conn, chunk.chunk_id, "p1", base + SECS_PER_DAY + 5);

        mark_verified(&conn, ok, &"a".repeat(64), 100).expect("verify");
        mark_failed(&conn, bad, FailureReason::Timeout, None, Some(2500)).expect("fail");

        assert_eq!(day_stats(&conn, "p1", day).expect("stats"), (1, 2));
        assert_eq!(day_stats(&conn, "p1", day + 1).expect("stats"), (0, 1));
    }
}
