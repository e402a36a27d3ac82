//! Versioned schema changes for the SQLite engine.
//!
//! Version 1 is the schema created by `INIT_SCHEMA` in the SQLite engine. Every
//! later change is a [`Migration`] appended to [`MIGRATIONS`] with a unique,
//! increasing version and a `down` that exactly reverses its `up`. Pending
//! migrations run in one transaction on open.

use super::StorageError;
use rusqlite::{Connection, Transaction};
use tracing::info;

#[derive(Debug)]
#[allow(dead_code)]
pub struct Migration {
    pub version: i32,
    pub up: &'static str,
    pub down: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 2,
    up: r#"
        CREATE TABLE IF NOT EXISTS sync_dead_letters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            category_id TEXT NOT NULL,
            action TEXT NOT NULL,
            error TEXT NOT NULL,
            recorded_at TEXT NOT NULL
        );
    "#,
    down: "DROP TABLE IF EXISTS sync_dead_letters;",
}];

pub fn latest_version() -> i32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(1)
}

pub fn get_current_version(conn: &Connection) -> Result<i32, StorageError> {
    let version: i32 = conn
        .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
        .map_err(|e| StorageError::Storage(format!("Failed to get schema version: {}", e)))?;
    Ok(version)
}

/// Applies every migration newer than the stored version, in order, in one transaction.
pub fn apply_migrations(conn: &mut Connection) -> Result<(), StorageError> {
    let current_version = get_current_version(conn)?;
    if current_version >= latest_version() {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .map_err(|e| StorageError::Storage(format!("Failed to start transaction: {}", e)))?;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current_version) {
        apply_migration(&tx, migration)?;
    }
    tx.commit()
        .map_err(|e| StorageError::Storage(format!("Failed to commit transaction: {}", e)))?;

    info!(from = current_version, to = latest_version(), "migrated schema");
    Ok(())
}

fn apply_migration(tx: &Transaction, migration: &Migration) -> Result<(), StorageError> {
    tx.execute_batch(migration.up).map_err(|e| {
        StorageError::Storage(format!(
            "Failed to apply migration {}: {}",
            migration.version, e
        ))
    })?;

    tx.execute("UPDATE schema_version SET version = ?1", [migration.version])
        .map_err(|e| {
            StorageError::Storage(format!(
                "Failed to update schema version to {}: {}",
                migration.version, e
            ))
        })?;

    Ok(())
}

/// Reverts migrations down to `target_version`, newest first.
#[cfg(test)]
pub fn rollback_migrations(conn: &mut Connection, target_version: i32) -> Result<(), StorageError> {
    let current_version = get_current_version(conn)?;
    if current_version <= target_version {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .map_err(|e| StorageError::Storage(format!("Failed to start transaction: {}", e)))?;
    for migration in MIGRATIONS
        .iter()
        .filter(|m| m.version > target_version && m.version <= current_version)
        .rev()
    {
        tx.execute_batch(migration.down).map_err(|e| {
            StorageError::Storage(format!(
                "Failed to rollback migration {}: {}",
                migration.version, e
            ))
        })?;
        tx.execute(
            "UPDATE schema_version SET version = ?1",
            [migration.version - 1],
        )?;
    }
    tx.commit()
        .map_err(|e| StorageError::Storage(format!("Failed to commit transaction: {}", e)))?;
    Ok(())
}
