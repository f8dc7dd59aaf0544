//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially, each in
//! its own transaction together with its `_migrations` record.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS workers (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'idle'
                    CHECK (status IN ('idle', 'busy', 'failed', 'terminated')),
                current_job_id TEXT,
                endpoint TEXT,
                failure_reason TEXT,
                last_heartbeat_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK ((status = 'busy') = (current_job_id IS NOT NULL))
            );
            CREATE INDEX IF NOT EXISTS idx_workers_status ON workers(status);

            CREATE TABLE IF NOT EXISTS jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'running', 'completed', 'failed', 'cancelled')),
                task TEXT NOT NULL,
                assigned_worker_id TEXT REFERENCES workers(id) ON DELETE SET NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                available_at TEXT NOT NULL,
                result TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT,
                CHECK ((status IN ('completed', 'failed', 'cancelled')) = (completed_at IS NOT NULL))
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_pickup ON jobs(status, available_at, created_at, seq);

            CREATE TABLE IF NOT EXISTS idempotency_keys (
                key TEXT PRIMARY KEY,
                job_id TEXT REFERENCES jobs(id) ON DELETE SET NULL,
                created_at TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        name: "resource_allocations",
        sql: r#"
            CREATE TABLE IF NOT EXISTS allocations (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                worker_id TEXT NOT NULL REFERENCES workers(id) ON DELETE CASCADE,
                attempt INTEGER NOT NULL,
                allocated_at TEXT NOT NULL,
                released_at TEXT,
                release_reason TEXT,
                CHECK ((released_at IS NULL) = (release_reason IS NULL))
            );
            CREATE INDEX IF NOT EXISTS idx_allocations_job ON allocations(job_id);
            CREATE INDEX IF NOT EXISTS idx_allocations_worker ON allocations(worker_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_allocations_active_job
                ON allocations(job_id) WHERE released_at IS NULL;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_allocations_active_worker
                ON allocations(worker_id) WHERE released_at IS NULL;
        "#,
    },
];

/// Enable per-connection settings the schema relies on.
pub async fn configure_connection(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute("PRAGMA foreign_keys = ON", ())
        .await
        .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;
    Ok(())
}

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current_version) {
        let tx = conn.transaction().await.map_err(|e| {
            DatabaseError::Migration(format!("V{} ({}) begin: {e}", migration.version, migration.name))
        })?;

        let applied = async {
            tx.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(&tx, migration.version, migration.name).await
        }
        .await;

        match applied {
            Ok(()) => {
                tx.commit().await.map_err(|e| {
                    DatabaseError::Migration(format!(
                        "V{} ({}) commit: {e}",
                        migration.version, migration.name
                    ))
                })?;
                tracing::info!(
                    version = migration.version,
                    name = migration.name,
                    "Applied migration"
                );
            }
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        let conn = db.connect().unwrap();
        configure_connection(&conn).await.unwrap();
        conn
    }

    async fn count(conn: &Connection, sql: &str) -> i64 {
        let mut rows = conn.query(sql, ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        row.get(0).unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "workers",
            "jobs",
            "allocations",
            "idempotency_keys",
            "_migrations",
        ] {
            let n = count(
                &conn,
                &format!("SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='{table}'"),
            )
            .await;
            assert_eq!(n, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn busy_worker_requires_job_reference() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let result = conn
            .execute(
                "INSERT INTO workers (id, status, last_heartbeat_at, created_at, updated_at)
                 VALUES ('w1', 'busy', '2026-01-01', '2026-01-01', '2026-01-01')",
                (),
            )
            .await;
        assert!(result.is_err(), "busy worker without a job must be rejected");
    }

    #[tokio::test]
    async fn one_active_allocation_per_job() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute_batch(
            "INSERT INTO workers (id, status, last_heartbeat_at, created_at, updated_at)
                VALUES ('w1', 'idle', 't', 't', 't'), ('w2', 'idle', 't', 't', 't');
             INSERT INTO jobs (id, status, task, available_at, created_at, updated_at)
                VALUES ('j1', 'pending', '{}', 't', 't', 't');
             INSERT INTO allocations (id, job_id, worker_id, attempt, allocated_at)
                VALUES ('a1', 'j1', 'w1', 0, 't');",
        )
        .await
        .unwrap();

        let second = conn
            .execute(
                "INSERT INTO allocations (id, job_id, worker_id, attempt, allocated_at)
                 VALUES ('a2', 'j1', 'w2', 0, 't')",
                (),
            )
            .await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn allocations_require_existing_parents() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let orphan = conn
            .execute(
                "INSERT INTO allocations (id, job_id, worker_id, attempt, allocated_at)
                 VALUES ('a1', 'missing', 'missing', 0, 't')",
                (),
            )
            .await;
        assert!(orphan.is_err(), "foreign keys should be enforced");
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        let v1: i64 = row1.get(0).unwrap();
        let n1: String = row1.get(1).unwrap();
        assert_eq!(v1, 1);
        assert_eq!(n1, "initial_schema");

        let row2 = rows.next().await.unwrap().unwrap();
        let v2: i64 = row2.get(0).unwrap();
        let n2: String = row2.get(1).unwrap();
        assert_eq!(v2, 2);
        assert_eq!(n2, "resource_allocations");
    }
}
