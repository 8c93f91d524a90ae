//! Peer registry query functions.

use rusqlite::{Connection, OptionalExtension};

use granary_types::clock::day_of;
use granary_types::{Peer, PeerStatus};

use crate::{map_insert_err, DbError, Result};

fn peer_from_row(row: &rusqlite::Row) -> rusqlite::Result<Peer> {
    let status: String = row.get(6)?;
    Ok(Peer {
        peer_id: row.get(0)?,
        transport_address: row.get(1)?,
        pubkey: row.get(2)?,
        credential_hash: row.get(3)?,
        declared_capacity_bytes: row.get::<_, i64>(4)? as u64,
        used_bytes: row.get::<_, i64>(5)? as u64,
        status: status.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?,
        last_heartbeat_at: row.get::<_, Option<i64>>(7)?.map(|v| v as u64),
        rolling_uptime_pct: row.get(8)?,
        earned_credits: row.get(9)?,
        created_at: row.get::<_, i64>(10)? as u64,
    })
}

const PEER_COLUMNS: &str = "peer_id, transport_address, pubkey, credential_hash, \
     declared_capacity_bytes, used_bytes, status, last_heartbeat_at, \
     rolling_uptime_pct, earned_credits, created_at";

/// Insert a newly registered peer.
///
/// Returns [`DbError::Constraint`] if the peer id is already registered.
pub fn insert(conn: &Connection, peer: &Peer) -> Result<()> {
    conn.execute(
        "INSERT INTO peers (peer_id, transport_address, pubkey, credential_hash,
             declared_capacity_bytes, used_bytes, status, last_heartbeat_at,
             rolling_uptime_pct, earned_credits, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            peer.peer_id,
            peer.transport_address,
            peer.pubkey,
            peer.credential_hash,
            peer.declared_capacity_bytes as i64,
            peer.used_bytes as i64,
            peer.status.as_str(),
            peer.last_heartbeat_at.map(|v| v as i64),
            peer.rolling_uptime_pct,
            peer.earned_credits,
            peer.created_at as i64,
        ],
    )
    .map_err(|e| map_insert_err(e, "peer already registered"))?;
    Ok(())
}

/// Fetch a peer, or `None` when unknown.
pub fn try_get(conn: &Connection, peer_id: &str) -> Result<Option<Peer>> {
    let peer = conn
        .query_row(
            &format!("SELECT {PEER_COLUMNS} FROM peers WHERE peer_id = ?1"),
            [peer_id],
            peer_from_row,
        )
        .optional()?;
    Ok(peer)
}

/// Fetch a peer that must exist.
pub fn get(conn: &Connection, peer_id: &str) -> Result<Peer> {
    try_get(conn, peer_id)?.ok_or_else(|| DbError::NotFound(format!("peer {peer_id}")))
}

/// All peers, newest first.
pub fn list(conn: &Connection) -> Result<Vec<Peer>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PEER_COLUMNS} FROM peers ORDER BY created_at DESC"
    ))?;
    let rows = stmt
        .query_map([], peer_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Peers currently in `active` status.
pub fn list_active(conn: &Connection) -> Result<Vec<Peer>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PEER_COLUMNS} FROM peers WHERE status = 'active'"
    ))?;
    let rows = stmt
        .query_map([], peer_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Set a peer's status.
pub fn set_status(conn: &Connection, peer_id: &str, status: PeerStatus) -> Result<()> {
    let updated = conn.execute(
        "UPDATE peers SET status = ?1 WHERE peer_id = ?2",
        rusqlite::params![status.as_str(), peer_id],
    )?;
    if updated == 0 {
        return Err(DbError::NotFound(format!("peer {peer_id}")));
    }
    Ok(())
}

/// Record a heartbeat: refresh `last_heartbeat_at` and `used_bytes`, revive
/// a dead peer, optionally update the dial address, and bump the per-day
/// heartbeat counter the economics job reads.
pub fn record_heartbeat(
    conn: &Connection,
    peer_id: &str,
    used_bytes: u64,
    address: Option<&str>,
    now: u64,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE peers SET
             last_heartbeat_at = ?1,
             used_bytes = ?2,
             transport_address = COALESCE(?3, transport_address),
             status = CASE WHEN status = 'dead' THEN 'active' ELSE status END
         WHERE peer_id = ?4",
        rusqlite::params![now as i64, used_bytes as i64, address, peer_id],
    )?;
    if updated == 0 {
        return Err(DbError::NotFound(format!("peer {peer_id}")));
    }

    conn.execute(
        "INSERT INTO peer_heartbeats (peer_id, day, count) VALUES (?1, ?2, 1)
         ON CONFLICT(peer_id, day) DO UPDATE SET count = count + 1",
        rusqlite::params![peer_id, day_of(now) as i64],
    )?;
    Ok(())
}

/// Heartbeats received from a peer during an epoch-day.
pub fn heartbeat_count(conn: &Connection, peer_id: &str, day: u64) -> Result<u64> {
    let count: i64 = conn
        .query_row(
            "SELECT COALESCE(
                 (SELECT count FROM peer_heartbeats WHERE peer_id = ?1 AND day = ?2), 0)",
            rusqlite::params![peer_id, day as i64],
            |row| row.get(0),
        )?;
    Ok(count as u64)
}

/// Adjust a peer's `used_bytes` by a signed delta, clamping at zero.
pub fn add_used_bytes(conn: &Connection, peer_id: &str, delta: i64) -> Result<()> {
    conn.execute(
        "UPDATE peers SET used_bytes = MAX(0, used_bytes + ?1) WHERE peer_id = ?2",
        rusqlite::params![delta, peer_id],
    )?;
    Ok(())
}

/// Mark peers whose last heartbeat is older than the liveness window as
/// `dead`. Returns the ids of peers that just died.
pub fn mark_dead_if_stale(conn: &Connection, now: u64, window_secs: u64) -> Result<Vec<String>> {
    let cutoff = now.saturating_sub(window_secs) as i64;
    let mut stmt = conn.prepare(
        "SELECT peer_id FROM peers
         WHERE status = 'active'
           AND (last_heartbeat_at IS NULL OR last_heartbeat_at < ?1)",
    )?;
    let stale = stmt
        .query_map([cutoff], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for peer_id in &stale {
        conn.execute(
            "UPDATE peers SET status = 'dead' WHERE peer_id = ?1",
            [peer_id],
        )?;
    }
    Ok(stale)
}

/// Stored credential hash for a peer, used by the heartbeat authenticator.
pub fn credential_hash(conn: &Connection, peer_id: &str) -> Result<String> {
    conn.query_row(
        "SELECT credential_hash FROM peers WHERE peer_id = ?1",
        [peer_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| DbError::NotFound(format!("peer {peer_id}")))
}

/// Update the blended uptime figure shown on the peer row.
pub fn set_rolling_uptime(conn: &Connection, peer_id: &str, pct: f64) -> Result<()> {
    conn.execute(
        "UPDATE peers SET rolling_uptime_pct = ?1 WHERE peer_id = ?2",
        rusqlite::params![pct, peer_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use granary_types::clock::SECS_PER_DAY;

    fn test_db() -> Connection {
        crate::open_memory().expect("open test db")
    }

    pub(crate) fn sample_peer(id: &str) -> Peer {
        Peer {
            peer_id: id.to_string(),
            transport_address: "127.0.0.1:4433".to_string(),
            pubkey: vec![7u8; 32],
            credential_hash: "ff".repeat(32),
            declared_capacity_bytes: 1 << 30,
            used_bytes: 0,
            status: PeerStatus::Active,
            last_heartbeat_at: None,
            rolling_uptime_pct: 100.0,
            earned_credits: 0,
            created_at: 1000,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let conn = test_db();
        insert(&conn, &sample_peer("p1")).expect("insert");

        let peer = get(&conn, "p1").expect("get");
        assert_eq!(peer.transport_address, "127.0.0.1:4433");
        assert_eq!(peer.status, PeerStatus::Active);
        assert_eq!(peer.declared_capacity_bytes, 1 << 30);
    }

    #[test]
    fn test_duplicate_registration_conflicts() {
        let conn = test_db();
        insert(&conn, &sample_peer("p1")).expect("insert");
        let err = insert(&conn, &sample_peer("p1")).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_unknown_peer_not_found() {
        let conn = test_db();
        assert!(try_get(&conn, "nope").expect("query").is_none());
        assert!(get(&conn, "nope").is_err());
    }

    #[test]
    fn test_heartbeat_updates_and_counts() {
        let conn = test_db();
        insert(&conn, &sample_peer("p1")).expect("insert");

        record_heartbeat(&conn, "p1", 512, None, 5000).expect("hb");
        record_heartbeat(&conn, "p1", 1024, Some("10.0.0.9:4444"), 5030).expect("hb");

        let peer = get(&conn, "p1").expect("get");
        assert_eq!(peer.last_heartbeat_at, Some(5030));
        assert_eq!(peer.used_bytes, 1024);
        assert_eq!(peer.transport_address, "10.0.0.9:4444");
        assert_eq!(heartbeat_count(&conn, "p1", day_of(5030)).expect("count"), 2);
    }

    #[test]
    fn test_heartbeat_revives_dead_peer() {
        let conn = test_db();
        insert(&conn, &sample_peer("p1")).expect("insert");
        set_status(&conn, "p1", PeerStatus::Dead).expect("set");

        record_heartbeat(&conn, "p1", 0, None, 9000).expect("hb");
        assert_eq!(get(&conn, "p1").expect("get").status, PeerStatus::Active);
    }

    #[test]
    fn test_heartbeat_does_not_revive_draining_peer() {
        let conn = test_db();
        insert(&conn, &sample_peer("p1")).expect("insert");
        set_status(&conn, "p1", PeerStatus::Draining).expect("set");

        record_heartbeat(&conn, "p1", 0, None, 9000).expect("hb");
        assert_eq!(get(&conn, "p1").expect("get").status, PeerStatus::Draining);
    }

    #[test]
    fn test_mark_dead_if_stale() {
        let conn = test_db();
        insert(&conn, &sample_peer("fresh")).expect("insert");
        insert(&conn, &sample_peer("stale")).expect("insert");
        insert(&conn, &sample_peer("silent")).expect("insert");

        let now = 10 * SECS_PER_DAY;
        record_heartbeat(&conn, "fresh", 0, None, now - 10).expect("hb");
        record_heartbeat(&conn, "stale", 0, None, now - 500).expect("hb");

        let died = mark_dead_if_stale(&conn, now, 90).expect("sweep");
        assert_eq!(died.len(), 2);
        assert!(died.contains(&"stale".to_string()));
        assert!(died.contains(&"silent".to_string()));
        assert_eq!(get(&conn, "fresh").expect("get").status, PeerStatus::Active);
        assert_eq!(get(&conn, "stale").expect("get").status, PeerStatus::Dead);
    }

    #[test]
    fn test_add_used_bytes_clamps_at_zero() {
        let conn = test_db();
        insert(&conn, &sample_peer("p1")).expect("insert");
        add_used_bytes(&conn, "p1", 100).expect("add");
        add_used_bytes(&conn, "p1", -500).expect("sub");
        assert_eq!(get(&conn, "p1").expect("get").used_bytes, 0);
    }

    #[test]
    fn test_list_active_excludes_others() {
        let conn = test_db();
        insert(&conn, &sample_peer("a")).expect("insert");
        insert(&conn, &sample_peer("b")).expect("insert");
        set_status(&conn, "b", PeerStatus::Draining).expect("set");

        let active = list_active(&conn).expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].peer_id, "a");
        assert_eq!(list(&conn).expect("list all").len(), 2);
    }
}
