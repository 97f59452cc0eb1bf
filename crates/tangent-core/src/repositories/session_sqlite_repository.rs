use std::path::PathBuf;

use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::info;

use super::error::{RepositoryError, RepositoryResult};
use super::session_repository::{
    BoxFuture, SessionData, SessionMetadata, SessionRepository,
};

/// Migrations applied in order. Each entry is (version, sql).
/// To add a new migration: append a tuple with the next version number and its SQL.
/// Never edit or remove existing entries; existing databases depend on them.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS sessions (
        id            TEXT    PRIMARY KEY,
        name          TEXT    NOT NULL DEFAULT '',
        messages      TEXT    NOT NULL DEFAULT '[]',
        threads       TEXT    NOT NULL DEFAULT '[]',
        message_forks TEXT    NOT NULL DEFAULT '{}',
        thread_name   TEXT,
        settings      TEXT    NOT NULL DEFAULT 'null',
        created_at    INTEGER NOT NULL DEFAULT 0,
        updated_at    INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_sessions_updated_at
        ON sessions (updated_at DESC);",
)];

/// SQLite-backed repository for sessions.
///
/// Uses WAL journal mode for concurrent reads during background saves.
/// `SqlitePool` is internally reference-counted and cheap to clone.
#[derive(Clone)]
pub struct SessionSqliteRepository {
    pool: SqlitePool,
}

impl SessionSqliteRepository {
    /// Open (or create) the SQLite database at the platform-specific config path.
    pub async fn new() -> RepositoryResult<Self> {
        Self::with_path(Self::db_path()?).await
    }

    /// Open (or create) the database at an explicit path.
    pub async fn with_path(db_path: PathBuf) -> RepositoryResult<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        info!(path = %db_path.display(), "Opened SQLite session database");

        Ok(Self { pool })
    }

    /// Create the schema_version table if absent, then apply any pending migrations.
    async fn run_migrations(pool: &SqlitePool) -> RepositoryResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        // Seed version 0 if the table is empty (fresh database).
        sqlx::query("INSERT INTO schema_version (version) SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM schema_version)")
            .execute(pool)
            .await?;

        let current: i64 = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_one(pool)
            .await?;

        for (version, sql) in MIGRATIONS {
            if *version > current {
                info!(version, "Applying schema migration");
                // sqlx doesn't support multiple statements in a single query call,
                // so split on ';' and execute each statement individually.
                for statement in sql.split(';') {
                    let trimmed = statement.trim();
                    if !trimmed.is_empty() {
                        sqlx::query(trimmed).execute(pool).await?;
                    }
                }
                sqlx::query("UPDATE schema_version SET version = ?")
                    .bind(version)
                    .execute(pool)
                    .await?;
            }
        }

        Ok(())
    }

    fn db_path() -> RepositoryResult<PathBuf> {
        dirs::config_dir()
            .ok_or_else(|| RepositoryError::Initialization {
                message: "Cannot find config directory".into(),
            })
            .map(|p| p.join("tangent").join("sessions.db"))
    }

    fn row_to_data(row: &sqlx::sqlite::SqliteRow) -> SessionData {
        SessionData {
            id: row.get("id"),
            name: row.get("name"),
            messages: row.get("messages"),
            threads: row.get("threads"),
            message_forks: row.get("message_forks"),
            thread_name: row.get("thread_name"),
            settings: row.get("settings"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

impl SessionRepository for SessionSqliteRepository {
    fn load_metadata(&self) -> BoxFuture<'static, RepositoryResult<Vec<SessionMetadata>>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT id, name, updated_at
                 FROM sessions
                 ORDER BY updated_at DESC",
            )
            .fetch_all(&pool)
            .await?;

            let metadata = rows
                .iter()
                .map(|row| SessionMetadata {
                    id: row.get("id"),
                    name: row.get("name"),
                    updated_at: row.get("updated_at"),
                })
                .collect();

            Ok(metadata)
        })
    }

    fn load_one(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<SessionData>>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT id, name, messages, threads, message_forks, thread_name,
                        settings, created_at, updated_at
                 FROM sessions
                 WHERE id = ?",
            )
            .bind(&id)
            .fetch_optional(&pool)
            .await?;

            Ok(row.map(|r| Self::row_to_data(&r)))
        })
    }

    fn load_all(&self) -> BoxFuture<'static, RepositoryResult<Vec<SessionData>>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT id, name, messages, threads, message_forks, thread_name,
                        settings, created_at, updated_at
                 FROM sessions
                 ORDER BY updated_at DESC",
            )
            .fetch_all(&pool)
            .await?;

            Ok(rows.iter().map(Self::row_to_data).collect())
        })
    }

    fn save(&self, _id: &str, data: SessionData) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO sessions
                    (id, name, messages, threads, message_forks, thread_name,
                     settings, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    name          = excluded.name,
                    messages      = excluded.messages,
                    threads       = excluded.threads,
                    message_forks = excluded.message_forks,
                    thread_name   = excluded.thread_name,
                    settings      = excluded.settings,
                    updated_at    = excluded.updated_at",
            )
            .bind(&data.id)
            .bind(&data.name)
            .bind(&data.messages)
            .bind(&data.threads)
            .bind(&data.message_forks)
            .bind(&data.thread_name)
            .bind(&data.settings)
            .bind(data.created_at)
            .bind(data.updated_at)
            .execute(&pool)
            .await?;

            Ok(())
        })
    }

    fn delete(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        Box::pin(async move {
            sqlx::query("DELETE FROM sessions WHERE id = ?")
                .bind(&id)
                .execute(&pool)
                .await?;
            Ok(())
        })
    }
}
