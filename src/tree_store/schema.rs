//! SQLite schema for the tree store.
//!
//! Every record directly below a top-level collection (`posts/{id}`,
//! `applications/{id}`, ...) is one row holding the record's JSON.
//! `tree_inserts` logs every row insert, whichever connection made it, so
//! insertion feeds can follow writers in other processes.

use crate::sqlite_column;
use crate::sqlite_persistence::{SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP};
use anyhow::Result;
use rusqlite::Connection;

const TREE_NODES_TABLE_V1: Table = Table {
    name: "tree_nodes",
    columns: &[
        sqlite_column!("collection", &SqlType::Text, non_null = true),
        sqlite_column!("key", &SqlType::Text, non_null = true),
        sqlite_column!("value", &SqlType::Text, non_null = true),
        sqlite_column!(
            "updated_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[("idx_tree_nodes_collection", "collection")],
    unique_constraints: &[&["collection", "key"]],
};

const TREE_INSERTS_TABLE_V2: Table = Table {
    name: "tree_inserts",
    columns: &[
        sqlite_column!("seq", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("collection", &SqlType::Text, non_null = true),
        sqlite_column!("key", &SqlType::Text, non_null = true),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[("idx_tree_inserts_created_at", "created_at")],
    unique_constraints: &[],
};

/// Keeps `tree_inserts` filled. Not part of the table definitions, so it is
/// (re)created every time the store opens a database.
pub const INSERT_LOG_TRIGGER: &str = "CREATE TRIGGER IF NOT EXISTS tree_nodes_log_insert
    AFTER INSERT ON tree_nodes
    BEGIN
        INSERT INTO tree_inserts (collection, key) VALUES (NEW.collection, NEW.key);
    END";

fn migrate_v1_to_v2(conn: &Connection) -> Result<()> {
    TREE_INSERTS_TABLE_V2.create(conn)
}

pub const TREE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[TREE_NODES_TABLE_V1],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[TREE_NODES_TABLE_V1, TREE_INSERTS_TABLE_V2],
        migration: Some(migrate_v1_to_v2),
    },
];
