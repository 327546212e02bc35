//! Schema migrations, tracked with the `user_version` pragma.

pub mod v001_initial;
pub mod v002_file_hashes;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Migration = (u32, &'static str, fn(&Connection) -> rusqlite::Result<()>);

/// Ordered list; the version of the last entry is the current schema version.
const MIGRATIONS: &[Migration] = &[
    (1, "v001_initial", v001_initial::up),
    (2, "v002_file_hashes", v002_file_hashes::up),
];

pub const CURRENT_VERSION: u32 = 2;

/// Apply every migration newer than the database, each in its own transaction.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database is at version {current}, newer than supported {CURRENT_VERSION}"
        )));
    }

    for (version, name, up) in MIGRATIONS.iter().filter(|(v, _, _)| *v > current) {
        tracing::info!(version, name, "applying migration");
        let tx = conn.unchecked_transaction()?;
        up(&*tx).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_migration_is_current() {
        assert_eq!(MIGRATIONS.last().map(|m| m.0), Some(CURRENT_VERSION));
    }

    #[test]
    fn test_newer_database_refused() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", CURRENT_VERSION + 1)
            .unwrap();
        assert!(matches!(
            run_migrations(&conn),
            Err(StoreError::Migration(_))
        ));
    }
}
