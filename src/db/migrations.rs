use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::db::schema;

const SCHEMA_VERSION_KEY: &str = "schema_version";

struct Migration {
    version: u32,
    name: &'static str,
    apply: fn(&Connection) -> Result<()>,
}

// Ascending by version.
const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "mailbox replica tables",
    apply: schema::create_schema,
}];

fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

/// Brings the replica schema up to the newest known version. Each step
/// commits together with its version bump.
pub fn migrate(conn: &Connection) -> Result<()> {
    schema::create_metadata_table(conn).context("create metadata table")?;

    let stored = stored_version(conn)?;
    let latest = latest_version();
    if stored > latest {
        bail!("replica schema is at version {stored}, this build understands up to {latest}");
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > stored) {
        let tx = conn
            .unchecked_transaction()
            .with_context(|| format!("begin migration {}", migration.version))?;
        (migration.apply)(&tx)
            .with_context(|| format!("migration {} ({})", migration.version, migration.name))?;
        tx.execute(
            r#"
            INSERT INTO metadata (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
            params![SCHEMA_VERSION_KEY, migration.version.to_string()],
        )?;
        tx.commit()
            .with_context(|| format!("commit migration {}", migration.version))?;
        info!("replica schema migrated to v{} ({})", migration.version, migration.name);
    }

    Ok(())
}

fn stored_version(conn: &Connection) -> Result<u32> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            params![SCHEMA_VERSION_KEY],
            |row| row.get(0),
        )
        .optional()
        .context("read schema version")?;

    raw.map_or(Ok(0), |value| {
        value
            .parse()
            .with_context(|| format!("schema version {value:?} is not a number"))
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use anyhow::Result;
    use rusqlite::{params, Connection};
    use uuid::Uuid;

    use super::{latest_version, migrate, stored_version, SCHEMA_VERSION_KEY};

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("mailmirror-migrations-{}.db", Uuid::new_v4()))
    }

    #[test]
    fn fresh_database_gets_every_table() -> Result<()> {
        let db_path = temp_db_path();
        let conn = Connection::open(&db_path)?;

        migrate(&conn)?;
        assert_eq!(stored_version(&conn)?, latest_version());

        let tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('messages', 'labels', 'message_labels', 'contacts', 'metadata')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(tables, 5);

        let _ = std::fs::remove_file(db_path);
        Ok(())
    }

    #[test]
    fn rerunning_keeps_data_and_version() -> Result<()> {
        let db_path = temp_db_path();
        let conn = Connection::open(&db_path)?;

        migrate(&conn)?;
        conn.execute(
            "INSERT INTO labels (id, name, label_type) VALUES ('INBOX', 'INBOX', 'system')",
            [],
        )?;
        migrate(&conn)?;

        assert_eq!(stored_version(&conn)?, 1);
        let labels: i64 = conn.query_row("SELECT COUNT(*) FROM labels", [], |row| row.get(0))?;
        assert_eq!(labels, 1);

        let _ = std::fs::remove_file(db_path);
        Ok(())
    }

    #[test]
    fn newer_schema_is_refused() -> Result<()> {
        let db_path = temp_db_path();
        let conn = Connection::open(&db_path)?;

        migrate(&conn)?;
        conn.execute(
            "UPDATE metadata SET value = ?1 WHERE key = ?2",
            params!["99", SCHEMA_VERSION_KEY],
        )?;
        assert!(migrate(&conn).is_err());

        let _ = std::fs::remove_file(db_path);
        Ok(())
    }
}
