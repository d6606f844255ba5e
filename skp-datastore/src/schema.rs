//! Schema versioning for the catalog database.
//!
//! Every table carries a row in `schema_version`. Opening a repository
//! written by a newer engine is refused; older versions are migrated
//! inside a single transaction before use.

use rusqlite::{Connection, OptionalExtension};

use crate::Error;

pub const SCHEMA_VERSION_TABLE_SQL: &str =
    "CREATE TABLE IF NOT EXISTS schema_version (
        table_name TEXT PRIMARY KEY,
        version INTEGER NOT NULL
    )";

/// Ensure `table` exists at `supported` version.
///
/// Missing tables are created from `create_sql` and stamped. Older
/// stamps run the migration chain; newer stamps are refused.
pub fn initialize_table(
    conn: &Connection,
    table: &str,
    supported: u32,
    create_sql: &str,
) -> Result<(), Error> {
    conn.execute(SCHEMA_VERSION_TABLE_SQL, [])?;

    let tx = conn.unchecked_transaction()?;

    let found: Option<u32> = tx
        .query_row(
            "SELECT version FROM schema_version WHERE table_name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()?;

    match found {
        None => {
            tx.execute_batch(create_sql)?;
            tx.execute(
                "INSERT INTO schema_version (table_name, version) VALUES (?1, ?2)",
                rusqlite::params![table, supported],
            )?;
        }
        Some(found) if found == supported => (),
        Some(found) if found < supported => {
            migrate_table(&tx, table, found, supported)?;
            tx.execute(
                "UPDATE schema_version SET version = ?2 WHERE table_name = ?1",
                rusqlite::params![table, supported],
            )?;
        }
        Some(found) => {
            return Err(Error::SchemaVersion {
                table: table.to_string(),
                found,
                supported,
            });
        }
    }

    tx.commit()?;
    Ok(())
}

fn migrate_table(
    _tx: &rusqlite::Transaction,
    table: &str,
    from: u32,
    to: u32,
) -> Result<(), Error> {
    // All tables are at version 1; migration steps get added here when
    // a schema changes.
    Err(Error::SchemaVersion {
        table: format!("{table} (no migration path {from} -> {to})"),
        found: from,
        supported: to,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn initialize_creates_and_stamps() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_table(&conn, "things", 1, "CREATE TABLE things (id INTEGER)").unwrap();
        // idempotent
        initialize_table(&conn, "things", 1, "CREATE TABLE things (id INTEGER)").unwrap();

        let version: u32 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE table_name = 'things'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn newer_versions_are_refused() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_table(&conn, "things", 1, "CREATE TABLE things (id INTEGER)").unwrap();
        conn.execute("UPDATE schema_version SET version = 99", [])
            .unwrap();

        match initialize_table(&conn, "things", 1, "CREATE TABLE things (id INTEGER)") {
            Err(Error::SchemaVersion { found, .. }) => assert_eq!(found, 99),
            other => panic!("expected schema version error, got {other:?}"),
        }
    }
}
