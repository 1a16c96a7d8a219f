//! Dense-array SQL migrator: a `_migrations(version)` table records the
//! highest applied block index; every block with a higher index is applied,
//! in order, on each call. Re-running is idempotent because every block's
//! DDL is `IF NOT EXISTS`.
//!
//! Each block may hold several `;`-separated statements. Neither backend's
//! prepared-statement path accepts more than one command per `execute`
//! (Postgres rejects it outright; SQLite silently runs only the first), so
//! every block is split into individual statements before being sent.

pub mod pg;
pub mod sqlite;

use crate::error::BackendError;

/// Splits a migration block into its individual `;`-terminated statements.
/// None of this migrator's DDL embeds a `;` inside a string literal, so a
/// plain split is sufficient.
fn statements(block: &str) -> impl Iterator<Item = &str> {
    block.split(';').map(str::trim).filter(|s| !s.is_empty())
}

pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), BackendError> {
    sqlx::query("CREATE TABLE IF NOT EXISTS _migrations (version INTEGER NOT NULL)")
        .execute(pool)
        .await
        .map_err(|e| BackendError::Database(e.to_string()))?;

    let current: Option<i32> = sqlx::query_scalar("SELECT MAX(version) FROM _migrations")
        .fetch_one(pool)
        .await
        .map_err(|e| BackendError::Database(e.to_string()))?;
    let current = current.unwrap_or(0);

    for (idx, block) in pg::BLOCKS.iter().enumerate() {
        let version = (idx + 1) as i32;
        if version <= current {
            continue;
        }
        for statement in statements(block) {
            sqlx::query(statement)
                .execute(pool)
                .await
                .map_err(|e| BackendError::Database(e.to_string()))?;
        }
        sqlx::query("INSERT INTO _migrations (version) VALUES ($1)")
            .bind(version)
            .execute(pool)
            .await
            .map_err(|e| BackendError::Database(e.to_string()))?;
    }

    Ok(())
}

pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), BackendError> {
    sqlx::query("CREATE TABLE IF NOT EXISTS _migrations (version INTEGER NOT NULL)")
        .execute(pool)
        .await
        .map_err(|e| BackendError::Database(e.to_string()))?;

    let current: Option<i32> = sqlx::query_scalar("SELECT MAX(version) FROM _migrations")
        .fetch_one(pool)
        .await
        .map_err(|e| BackendError::Database(e.to_string()))?;
    let current = current.unwrap_or(0);

    for (idx, block) in sqlite::BLOCKS.iter().enumerate() {
        let version = (idx + 1) as i32;
        if version <= current {
            continue;
        }
        for statement in statements(block) {
            sqlx::query(statement)
                .execute(pool)
                .await
                .map_err(|e| BackendError::Database(e.to_string()))?;
        }
        sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
            .bind(version)
            .execute(pool)
            .await
            .map_err(|e| BackendError::Database(e.to_string()))?;
    }

    Ok(())
}
