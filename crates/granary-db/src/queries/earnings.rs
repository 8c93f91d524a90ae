//! Earnings ledger query functions.

use rusqlite::{Connection, OptionalExtension};

use granary_types::PeerEarnings;

use crate::Result;

fn earnings_from_row(row: &rusqlite::Row) -> rusqlite::Result<PeerEarnings> {
    Ok(PeerEarnings {
        peer_id: row.get(0)?,
        day: row.get::<_, i64>(1)? as u64,
        storage_bytes: row.get::<_, i64>(2)? as u64,
        gross_credits: row.get(3)?,
        uptime_penalty: row.get(4)?,
        proof_penalty: row.get(5)?,
        net_credits: row.get(6)?,
    })
}

const EARNINGS_COLUMNS: &str =
    "peer_id, day, storage_bytes, gross_credits, uptime_penalty, proof_penalty, net_credits";

/// Record one day's earnings for a peer and credit its balance, atomically.
///
/// Idempotent: the row insert is keyed by `(peer_id, day)` and the credit
/// increment only happens when the insert lands, so re-running a day never
/// double-credits. Returns whether this call applied the row.
pub fn record(conn: &mut Connection, earnings: &PeerEarnings) -> Result<bool> {
    let tx = conn.transaction()?;

    let inserted = tx.execute(
        "INSERT OR IGNORE INTO peer_earnings
             (peer_id, day, storage_bytes, gross_credits, uptime_penalty,
              proof_penalty, net_credits)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            earnings.peer_id,
            earnings.day as i64,
            earnings.storage_bytes as i64,
            earnings.gross_credits,
            earnings.uptime_penalty,
            earnings.proof_penalty,
            earnings.net_credits,
        ],
    )?;

    if inserted == 1 {
        tx.execute(
            "UPDATE peers SET earned_credits = earned_credits + ?1 WHERE peer_id = ?2",
            rusqlite::params![earnings.net_credits, earnings.peer_id],
        )?;
    }

    tx.commit()?;
    Ok(inserted == 1)
}

/// One peer's earnings row for a day, if evaluated.
pub fn get(conn: &Connection, peer_id: &str, day: u64) -> Result<Option<PeerEarnings>> {
    let row = conn
        .query_row(
            &format!("SELECT {EARNINGS_COLUMNS} FROM peer_earnings WHERE peer_id = ?1 AND day = ?2"),
            rusqlite::params![peer_id, day as i64],
            earnings_from_row,
        )
        .optional()?;
    Ok(row)
}

/// A peer's full ledger, most recent day first.
pub fn for_peer(conn: &Connection, peer_id: &str) -> Result<Vec<PeerEarnings>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EARNINGS_COLUMNS} FROM peer_earnings WHERE peer_id = ?1 ORDER BY day DESC"
    ))?;
    let rows = stmt
        .query_map([peer_id], earnings_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Sum of `net_credits` across a peer's ledger rows. By the record-time
/// invariant this always equals the peer's `earned_credits`.
pub fn total_net(conn: &Connection, peer_id: &str) -> Result<i64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(net_credits), 0) FROM peer_earnings WHERE peer_id = ?1",
        [peer_id],
        |row| row.get(0),
    )?;
    Ok(total)
}
