mod versioned_schema;

pub use versioned_schema::{
    Column, SqlType, Table, VersionedSchema, BASE_DB_VERSION, DEFAULT_TIMESTAMP,
};

use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use std::path::Path;
use tracing::info;

/// Open a database file, creating it with the latest schema when missing and
/// validating then migrating it otherwise. `label` names the database in logs.
pub fn open_versioned(
    path: &Path,
    schemas: &'static [VersionedSchema],
    label: &str,
) -> Result<Connection> {
    let is_new_db = !path.exists();
    let mut conn = Connection::open(path)
        .with_context(|| format!("Failed to open {} database at {:?}", label, path))?;
    if is_new_db {
        info!("Creating new {} database at {:?}", label, path);
    }
    initialize(&mut conn, is_new_db, schemas, label)?;
    Ok(conn)
}

/// In-memory database with the latest schema, for tests and dry runs.
pub fn open_in_memory(schemas: &'static [VersionedSchema], label: &str) -> Result<Connection> {
    let mut conn = Connection::open_in_memory()?;
    initialize(&mut conn, true, schemas, label)?;
    Ok(conn)
}

fn initialize(
    conn: &mut Connection,
    is_new_db: bool,
    schemas: &'static [VersionedSchema],
    label: &str,
) -> Result<()> {
    conn.execute("PRAGMA foreign_keys = ON;", [])?;
    let Some(latest) = schemas.last() else {
        bail!("No schema defined for {} database", label);
    };

    if is_new_db {
        latest.create(conn)?;
        return Ok(());
    }

    let raw_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    let db_version = raw_version - BASE_DB_VERSION as i64;
    if db_version < 1 {
        bail!(
            "{} database version {} is invalid (expected >= 1)",
            label,
            db_version
        );
    }

    let current = schemas
        .iter()
        .find(|s| s.version as i64 == db_version)
        .with_context(|| format!("Unknown {} database version {}", label, db_version))?;
    current.validate(conn).with_context(|| {
        format!(
            "{} database schema validation failed for version {}",
            label, db_version
        )
    })?;

    if (db_version as usize) < latest.version {
        info!(
            "Migrating {} database from version {} to {}",
            label, db_version, latest.version
        );
        migrate(conn, db_version as usize, schemas)?;
    }
    Ok(())
}

fn migrate(conn: &mut Connection, from_version: usize, schemas: &[VersionedSchema]) -> Result<()> {
    let tx = conn.transaction()?;
    let mut latest_from = from_version;
    for schema in schemas.iter().filter(|s| s.version > from_version) {
        if let Some(migration_fn) = schema.migration {
            migration_fn(&tx)
                .with_context(|| format!("Failed to run migration to version {}", schema.version))?;
        }
        latest_from = schema.version;
    }
    tx.execute(
        &format!("PRAGMA user_version = {}", BASE_DB_VERSION + latest_from),
        [],
    )?;
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_column;
    use tempfile::TempDir;

    const ITEMS_V1: Table = Table {
        name: "items",
        columns: &[sqlite_column!("id", &SqlType::Integer, is_primary_key = true)],
        indices: &[],
        unique_constraints: &[],
    };

    const ITEMS_V2: Table = Table {
        name: "items",
        columns: &[
            sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
            sqlite_column!("label", &SqlType::Text),
        ],
        indices: &[],
        unique_constraints: &[],
    };

    fn migrate_v1_to_v2(conn: &Connection) -> Result<()> {
        conn.execute("ALTER TABLE items ADD COLUMN label TEXT", [])?;
        Ok(())
    }

    const V1_ONLY: &[VersionedSchema] = &[VersionedSchema {
        version: 1,
        tables: &[ITEMS_V1],
        migration: None,
    }];

    const V1_AND_V2: &[VersionedSchema] = &[
        VersionedSchema {
            version: 1,
            tables: &[ITEMS_V1],
            migration: None,
        },
        VersionedSchema {
            version: 2,
            tables: &[ITEMS_V2],
            migration: Some(migrate_v1_to_v2),
        },
    ];

    #[test]
    fn test_reopen_migrates_to_latest() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("items.db");

        drop(open_versioned(&path, V1_ONLY, "items").unwrap());
        let conn = open_versioned(&path, V1_AND_V2, "items").unwrap();

        let version: i64 = conn
            .query_row("PRAGMA user_version;", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version as usize, BASE_DB_VERSION + 2);
        V1_AND_V2[1].validate(&conn).unwrap();
    }

    #[test]
    fn test_uninitialized_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("foreign.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute("CREATE TABLE other (x INTEGER)", []).unwrap();
        drop(conn);

        let err = open_versioned(&path, V1_ONLY, "items").unwrap_err();
        assert!(err.to_string().contains("invalid"));
    }
}
