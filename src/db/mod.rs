/// Database Module
///
/// PostgreSQL-backed progress cursor, used when a database URL is configured:
/// - Connection pool management
/// - Schema migrations
/// - Cursor read and upsert
pub mod progress;

pub use progress::{FileProgressStore, ProgressStore};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use crate::error::HarvestError;
use crate::models::ProgressCursor;

pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL database")?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await.context("Failed to run database migrations")?;

        tracing::info!("Database migrations completed successfully");
        Ok(())
    }

    /// Test the database connection
    pub async fn test_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await.context("Database connection test failed")?;

        Ok(())
    }
}

#[async_trait]
impl ProgressStore for Database {
    async fn read(&self, protocol: &str) -> crate::error::Result<ProgressCursor> {
        let row = sqlx::query("SELECT last_block_number FROM harvest_progress WHERE protocol = $1")
            .bind(protocol)
            .fetch_optional(&self.pool)
            .await?;

        let stored = match row {
            Some(row) => Some(row.try_get::<Option<i64>, _>("last_block_number")?),
            None => None,
        };

        cursor_from_row(protocol, stored)
    }

    async fn write(&self, cursor: &ProgressCursor) -> crate::error::Result<()> {
        let last = cursor_to_column(cursor)?;

        sqlx::query(
            r#"
            INSERT INTO harvest_progress (protocol, last_block_number, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (protocol)
            DO UPDATE SET
                last_block_number = EXCLUDED.last_block_number,
                updated_at = NOW()
            "#,
        )
        .bind(&cursor.protocol)
        .bind(last)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Cursor for {} upserted", cursor.protocol);
        Ok(())
    }
}

/// Cursor for a `harvest_progress` lookup. `None` is a missing row, `Some(None)` a row
/// without a committed block.
fn cursor_from_row(protocol: &str, stored: Option<Option<i64>>) -> crate::error::Result<ProgressCursor> {
    let last_block_number = stored
        .flatten()
        .map(|n| {
            u64::try_from(n).map_err(|_| HarvestError::Progress(format!("negative cursor {} for '{}'", n, protocol)))
        })
        .transpose()?;

    Ok(ProgressCursor { protocol: protocol.to_string(), last_block_number })
}

fn cursor_to_column(cursor: &ProgressCursor) -> crate::error::Result<Option<i64>> {
    cursor.last_block_number.map(i64::try_from).transpose().map_err(|_| {
        HarvestError::Progress(format!("block number for '{}' exceeds BIGINT range", cursor.protocol))
    })
}
