//! Postgres wiring: connection pool and schema.
//!
//! ## Error Mapping
//!
//! Every Postgres-backed store funnels `sqlx::Error` through [`describe_sqlx_error`]
//! and wraps the message in its own `Storage` variant. Unique violations
//! (`23505`) are reported separately via [`is_unique_violation`] so stores can
//! map them to `AlreadyExists`.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

/// Tables are created idempotently at startup, one statement per query.
const SCHEMA: &[(&str, &str)] = &[
    (
        "posts",
        r#"
        CREATE TABLE IF NOT EXISTS posts (
            id          UUID PRIMARY KEY,
            author_id   UUID NOT NULL,
            status      TEXT NOT NULL,
            media       JSONB NOT NULL DEFAULT '[]'::jsonb,
            likes       BIGINT NOT NULL DEFAULT 0 CHECK (likes >= 0),
            comments    BIGINT NOT NULL DEFAULT 0 CHECK (comments >= 0),
            created_at  TIMESTAMPTZ NOT NULL
        )
        "#,
    ),
    (
        "media_jobs",
        r#"
        CREATE TABLE IF NOT EXISTS media_jobs (
            seq          BIGSERIAL NOT NULL,
            id           UUID PRIMARY KEY,
            job_type     TEXT NOT NULL,
            post_id      UUID NOT NULL,
            media_id     TEXT NOT NULL,
            media_kind   TEXT NOT NULL,
            attempts     INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
            next_run_at  TIMESTAMPTZ NOT NULL,
            created_at   TIMESTAMPTZ NOT NULL,
            updated_at   TIMESTAMPTZ NOT NULL
        )
        "#,
    ),
    (
        "media_jobs_due_idx",
        "CREATE INDEX IF NOT EXISTS media_jobs_due_idx ON media_jobs (next_run_at, seq)",
    ),
    (
        "media_jobs_post_idx",
        "CREATE INDEX IF NOT EXISTS media_jobs_post_idx ON media_jobs (post_id)",
    ),
    (
        "upload_errors",
        r#"
        CREATE TABLE IF NOT EXISTS upload_errors (
            id            UUID PRIMARY KEY,
            post_id       UUID NOT NULL,
            user_id       UUID NOT NULL,
            filename      TEXT NOT NULL,
            message       TEXT NOT NULL,
            content_hash  TEXT NULL,
            created_at    TIMESTAMPTZ NOT NULL
        )
        "#,
    ),
    (
        "upload_errors_post_idx",
        "CREATE INDEX IF NOT EXISTS upload_errors_post_idx ON upload_errors (post_id, created_at)",
    ),
    (
        "upload_errors_user_idx",
        "CREATE INDEX IF NOT EXISTS upload_errors_user_idx ON upload_errors (user_id, created_at DESC)",
    ),
];

/// Connect to Postgres.
pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
}

/// Create the tables used by the Postgres stores if they do not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for &(name, statement) in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
        tracing::debug!(object = name, "schema object ensured");
    }
    info!(objects = SCHEMA.len(), "database schema ready");
    Ok(())
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

pub(crate) fn describe_sqlx_error(operation: &str, err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) => format!(
                "database error in {} ({}): {}",
                operation,
                code,
                db_err.message()
            ),
            None => format!("database error in {}: {}", operation, db_err.message()),
        },
        sqlx::Error::PoolClosed => format!("connection pool closed in {}", operation),
        sqlx::Error::RowNotFound => format!("unexpected row not found in {}", operation),
        other => format!("sqlx error in {}: {}", operation, other),
    }
}
