//! Database migration system.
//!
//! Migrations are data, not code: an ordered table of `(target version,
//! SQL batch)` pairs. `run` walks the table, applies every step above the
//! database's `PRAGMA user_version` — each step in its own transaction,
//! stamped before commit — and refuses databases stamped newer than the
//! binary. Rollback does not exist; recovery is a rebuild.

use rusqlite::Connection;

use crate::{schema, DbError, Result, SCHEMA_VERSION};

/// Ordered migration steps. Appending `(2, "...")` here is the whole
/// procedure for the next schema change.
const MIGRATIONS: &[(u32, &str)] = &[(1, schema::SCHEMA_V1)];

/// Bring the database up to [`SCHEMA_VERSION`].
pub fn run(conn: &mut Connection) -> Result<()> {
    let mut version = stamped_version(conn)?;
    if version > SCHEMA_VERSION {
        return Err(DbError::Migration(format!(
            "database is at schema v{version}, this build supports up to v{SCHEMA_VERSION}"
        )));
    }

    for (target, sql) in MIGRATIONS {
        if *target <= version {
            continue;
        }
        if *target != version + 1 {
            return Err(DbError::Migration(format!(
                "no migration step from v{version} to v{target}"
            )));
        }

        tracing::info!(from = version, to = target, "applying schema migration");
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", *target)?;
        tx.commit()?;
        version = *target;
    }

    Ok(())
}

/// The schema version the database last committed.
fn stamped_version(conn: &Connection) -> Result<u32> {
    let version = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_database_reaches_current_version() {
        let mut conn = Connection::open_in_memory().expect("open");
        run(&mut conn).expect("migrate");
        assert_eq!(stamped_version(&conn).expect("version"), SCHEMA_VERSION);
    }

    #[test]
    fn test_rerun_is_a_no_op() {
        let mut conn = Connection::open_in_memory().expect("open");
        run(&mut conn).expect("first run");
        run(&mut conn).expect("second run");
        assert_eq!(stamped_version(&conn).expect("version"), SCHEMA_VERSION);
    }

    #[test]
    fn test_migration_table_is_contiguous() {
        for (position, (target, _)) in MIGRATIONS.iter().enumerate() {
            assert_eq!(*target, position as u32 + 1);
        }
        assert_eq!(
            MIGRATIONS.last().map(|(target, _)| *target),
            Some(SCHEMA_VERSION)
        );
    }

    #[test]
    fn test_tables_created() {
        let mut conn = Connection::open_in_memory().expect("open");
        run(&mut conn).expect("migrate");

        let expected_tables = [
            "peers",
            "peer_heartbeats",
            "files",
            "chunks",
            "chunk_staging",
            "chunk_assignments",
            "proof_challenges",
            "peer_earnings",
        ];

        for table in &expected_tables {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap_or_else(|_| panic!("table {table} check"));
            assert_eq!(count, 1, "table '{table}' should exist");
        }
    }

    #[test]
    fn test_newer_database_rejected() {
        let mut conn = Connection::open_in_memory().expect("open");
        run(&mut conn).expect("migrate");
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .expect("stamp ahead");

        let err = run(&mut conn).unwrap_err();
        assert!(err.to_string().contains("this build supports"));
    }
}
