//! Postgres-backed image repository.
//!
//! Status changes are single guarded `UPDATE ... WHERE status IN (...)`
//! statements, so the forward-only rule holds even with several workers (or
//! processes) racing on the same image. When the guard matches no row the
//! record is re-read to tell "unknown image" from "illegal transition".
//!
//! ## Error Mapping
//!
//! | Situation | RepositoryError |
//! |-----------|-----------------|
//! | No row for the id | `NotFound` |
//! | Row exists, guard rejected the change | `InvalidTransition` |
//! | Any SQLx error, unknown status text | `Storage` |

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use roomstage_core::{ImageId, ImageRecord, ImageStatus};

use super::repository::{ImageRepository, RepositoryError};

/// Schema for the `images` table (idempotent).
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS images (
    image_id    TEXT PRIMARY KEY,
    status      TEXT NOT NULL DEFAULT 'queued'
                CHECK (status IN ('queued', 'processing', 'ready', 'error')),
    error       TEXT,
    staged_url  TEXT,
    started_at  TIMESTAMPTZ,
    finished_at TIMESTAMPTZ,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const COLUMNS: &str = "image_id, status, error, staged_url, started_at, finished_at, updated_at";

/// Statuses a record may leave towards `processing`, `ready` or `error`.
const OPEN_STATUSES: [&str; 2] = ["queued", "processing"];

#[derive(Debug, Clone)]
pub struct PostgresImageRepository {
    pool: PgPool,
}

impl PostgresImageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn fetch(&self, image_id: &ImageId) -> Result<Option<ImageRecord>, RepositoryError> {
        let row: Option<ImageRow> = sqlx::query_as(&format!("SELECT {COLUMNS} FROM images WHERE image_id = $1"))
            .bind(image_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(ImageRecord::try_from).transpose()
    }

    /// Run a guarded status update and explain an empty result.
    async fn transition(
        &self,
        image_id: &ImageId,
        to: ImageStatus,
        query: sqlx::query::QueryAs<'_, sqlx::Postgres, ImageRow, sqlx::postgres::PgArguments>,
    ) -> Result<ImageRecord, RepositoryError> {
        let updated: Option<ImageRow> = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(to.as_str(), e))?;

        if let Some(row) = updated {
            return ImageRecord::try_from(row);
        }

        match self.fetch(image_id).await? {
            None => Err(RepositoryError::NotFound(image_id.clone())),
            Some(current) => Err(RepositoryError::InvalidTransition {
                image_id: image_id.clone(),
                from: current.status,
                to,
            }),
        }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => {
            RepositoryError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => RepositoryError::Storage(format!("connection pool closed in {}", operation)),
        other => RepositoryError::Storage(format!("sqlx error in {}: {}", operation, other)),
    }
}

#[async_trait]
impl ImageRepository for PostgresImageRepository {
    #[instrument(skip(self), fields(image_id = %image_id))]
    async fn create_queued(&self, image_id: &ImageId) -> Result<ImageRecord, RepositoryError> {
        sqlx::query("INSERT INTO images (image_id, status) VALUES ($1, 'queued') ON CONFLICT (image_id) DO NOTHING")
            .bind(image_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_queued", e))?;

        self.get(image_id).await
    }

    async fn get(&self, image_id: &ImageId) -> Result<ImageRecord, RepositoryError> {
        self.fetch(image_id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(image_id.clone()))
    }

    #[instrument(skip(self), fields(image_id = %image_id))]
    async fn mark_processing(&self, image_id: &ImageId) -> Result<ImageRecord, RepositoryError> {
        let sql = format!(
            "UPDATE images
             SET status = 'processing', started_at = COALESCE(started_at, now()), updated_at = now()
             WHERE image_id = $1 AND status = ANY($2)
             RETURNING {COLUMNS}"
        );
        let query = sqlx::query_as(&sql).bind(image_id.as_str()).bind(&OPEN_STATUSES[..]);
        self.transition(image_id, ImageStatus::Processing, query).await
    }

    #[instrument(skip(self), fields(image_id = %image_id))]
    async fn mark_ready(&self, image_id: &ImageId, staged_url: &str) -> Result<ImageRecord, RepositoryError> {
        let sql = format!(
            "UPDATE images
             SET status = 'ready', staged_url = $3, error = NULL, finished_at = now(), updated_at = now()
             WHERE image_id = $1 AND status = ANY($2)
             RETURNING {COLUMNS}"
        );
        let query = sqlx::query_as(&sql)
            .bind(image_id.as_str())
            .bind(&OPEN_STATUSES[..])
            .bind(staged_url);
        self.transition(image_id, ImageStatus::Ready, query).await
    }

    #[instrument(skip(self, message), fields(image_id = %image_id))]
    async fn mark_error(&self, image_id: &ImageId, message: &str) -> Result<ImageRecord, RepositoryError> {
        let sql = format!(
            "UPDATE images
             SET status = 'error', error = $3, finished_at = now(), updated_at = now()
             WHERE image_id = $1 AND status = ANY($2)
             RETURNING {COLUMNS}"
        );
        let query = sqlx::query_as(&sql)
            .bind(image_id.as_str())
            .bind(&OPEN_STATUSES[..])
            .bind(message);
        self.transition(image_id, ImageStatus::Error, query).await
    }
}

// SQLx row type

#[derive(Debug)]
struct ImageRow {
    image_id: String,
    status: String,
    error: Option<String>,
    staged_url: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ImageRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ImageRow {
            image_id: row.try_get("image_id")?,
            status: row.try_get("status")?,
            error: row.try_get("error")?,
            staged_url: row.try_get("staged_url")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<ImageRow> for ImageRecord {
    type Error = RepositoryError;

    fn try_from(row: ImageRow) -> Result<Self, Self::Error> {
        let image_id = ImageId::new(row.image_id).map_err(|e| RepositoryError::Storage(e.to_string()))?;
        let status = ImageStatus::from_str(&row.status).map_err(|e| RepositoryError::Storage(e.to_string()))?;
        Ok(ImageRecord {
            image_id,
            status,
            error: row.error,
            staged_url: row.staged_url,
            started_at: row.started_at,
            finished_at: row.finished_at,
            updated_at: row.updated_at,
        })
    }
}
