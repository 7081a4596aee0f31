//! Schema migrations for the snapshot database.
//!
//! Applied versions are recorded in `schema_versions`. A step and its
//! version row commit in the same transaction.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Ascending by version; append only.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "job_snapshots",
        sql: r#"
            CREATE TABLE IF NOT EXISTS job_snapshots (
                key TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                external_id TEXT,
                secondary_id TEXT,
                result TEXT,
                error TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                progress INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_job_snapshots_status ON job_snapshots(status);
        "#,
    },
    Migration {
        version: 2,
        name: "result_reconciliation",
        sql: r#"
            ALTER TABLE job_snapshots ADD COLUMN reconciled INTEGER NOT NULL DEFAULT 0;

            CREATE TABLE IF NOT EXISTS owner_results (
                owner TEXT PRIMARY KEY,
                result TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 3,
        name: "result_producer_and_batches",
        sql: r#"
            ALTER TABLE owner_results ADD COLUMN job_id TEXT;

            CREATE TABLE IF NOT EXISTS batch_sessions (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                total_slots INTEGER NOT NULL,
                concurrency_limit INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
        "#,
    },
];

const VERSIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_versions (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

/// Bring the schema up to the latest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(VERSIONS_TABLE, ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Cannot create schema_versions: {e}")))?;

    let applied = applied_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        tracing::debug!(version = applied, "Schema up to date");
        return Ok(());
    }

    for step in pending {
        tracing::info!(version = step.version, name = step.name, "Migrating schema");
        apply(conn, step).await?;
    }

    tracing::info!(version = applied_version(conn).await?, "Schema migrated");
    Ok(())
}

async fn apply(conn: &Connection, step: &Migration) -> Result<(), DatabaseError> {
    let batch = format!(
        "BEGIN;\n{}\nINSERT INTO schema_versions (version, name) VALUES ({}, '{}');\nCOMMIT;",
        step.sql, step.version, step.name
    );
    if let Err(e) = conn.execute_batch(&batch).await {
        let _ = conn.execute("ROLLBACK", ()).await;
        return Err(DatabaseError::Migration(format!(
            "V{} {} did not apply: {e}",
            step.version, step.name
        )));
    }
    Ok(())
}

/// Highest recorded version; 0 on a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_versions", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Cannot read schema version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("Bad schema version value: {e}"))),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Migration(format!("Cannot read schema version: {e}"))),
    }
}
