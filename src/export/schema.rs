use anyhow::{bail, Context, Result};
use rusqlite::{Connection, OptionalExtension};

/// Embedded SQL migration.
struct Migration {
    version: u32,
    sql: &'static str,
}

/// All embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: include_str!("sql/001_init.sql"),
    },
    Migration {
        version: 2,
        sql: include_str!("sql/002_indexes.sql"),
    },
];

/// Latest schema version known to this build.
pub fn latest_version() -> u32 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}

/// Applies every pending migration, each in its own transaction.
pub fn migrate(conn: &mut Connection) -> Result<u32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL,
            dirty INTEGER NOT NULL
        )",
        [],
    )
    .context("creating schema_version table")?;

    let (current, dirty) = current_version(conn)?;
    if dirty {
        bail!("schema version {current} is dirty, manual intervention required");
    }
    if current > latest_version() {
        bail!(
            "database schema version {current} is newer than supported version {}",
            latest_version()
        );
    }

    let mut applied = 0u32;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tracing::debug!(version = migration.version, "applying schema migration");

        let tx = conn.transaction().context("starting migration transaction")?;
        tx.execute_batch(migration.sql)
            .with_context(|| format!("applying schema version {}", migration.version))?;
        tx.execute("DELETE FROM schema_version", [])
            .context("clearing schema_version")?;
        tx.execute(
            "INSERT INTO schema_version (version, dirty) VALUES (?1, 0)",
            [migration.version],
        )
        .context("recording schema version")?;
        tx.commit()
            .with_context(|| format!("committing schema version {}", migration.version))?;

        applied += 1;
    }

    let (version, _) = current_version(conn)?;
    if applied > 0 {
        tracing::debug!(version, applied, "schema migrations completed");
    }

    Ok(version)
}

/// Returns the recorded schema version and dirty flag, `(0, false)` when empty.
pub fn current_version(conn: &Connection) -> Result<(u32, bool)> {
    let row = conn
        .query_row(
            "SELECT version, dirty FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| Ok((row.get::<_, u32>(0)?, row.get::<_, i64>(1)? != 0)),
        )
        .optional()
        .context("querying schema version")?;

    Ok(row.unwrap_or((0, false)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_ordered() {
        for window in MIGRATIONS.windows(2) {
            assert!(
                window[0].version < window[1].version,
                "migrations not in order: {} >= {}",
                window[0].version,
                window[1].version,
            );
        }
    }

    #[test]
    fn test_migrations_embedded() {
        for m in MIGRATIONS {
            assert!(!m.sql.trim().is_empty(), "migration {} is empty", m.version);
        }
    }

    #[test]
    fn test_migrate_fresh_and_idempotent() {
        let mut conn = Connection::open_in_memory().expect("open");
        assert_eq!(migrate(&mut conn).expect("first run"), latest_version());
        assert_eq!(migrate(&mut conn).expect("second run"), latest_version());

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'task_track'",
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(tables, 1);
    }

    #[test]
    fn test_migrate_rejects_dirty() {
        let mut conn = Connection::open_in_memory().expect("open");
        migrate(&mut conn).expect("migrate");
        conn.execute("UPDATE schema_version SET dirty = 1", [])
            .expect("mark dirty");

        let err = migrate(&mut conn).expect_err("dirty schema");
        assert!(err.to_string().contains("dirty"));
    }
}
