//! Postgres-backed version source.
//!
//! Per-table versions come from the `tracker_tables` bookkeeping installed by
//! the migrations: a statement-level trigger stamps `last_timestamp` on every
//! write. The global version is the timestamp of the last committed
//! transaction (requires `track_commit_timestamp = on`).

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::query_scalar;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::ticks;
use crate::tracker::source::{SourceError, VersionSource, validate_key};

pub const POSTGRES_SOURCE_ID: &str = "postgres";

#[derive(Clone)]
pub struct PostgresVersionSource {
    id: String,
    pool: Arc<PgPool>,
}

impl PostgresVersionSource {
    pub fn new(id: impl Into<String>, pool: PgPool) -> Self {
        Self {
            id: id.into(),
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(Into::into)
    }

    async fn flag(
        &self,
        sql: &'static str,
        key: &str,
        token: &CancellationToken,
    ) -> Result<bool, SourceError> {
        validate_key(key)?;
        let flag: Option<bool> = cancellable(
            token,
            query_scalar(sql).bind(key).fetch_one(self.pool()),
        )
        .await?;
        Ok(flag.unwrap_or(false))
    }
}

/// Race a query against the token; a fired token drops the query future.
async fn cancellable<T>(
    token: &CancellationToken,
    query: impl Future<Output = Result<T, sqlx::Error>>,
) -> Result<T, SourceError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(SourceError::Cancelled),
        result = query => result.map_err(SourceError::from),
    }
}

#[async_trait]
impl VersionSource for PostgresVersionSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn last_version(
        &self,
        key: &str,
        token: &CancellationToken,
    ) -> Result<i64, SourceError> {
        validate_key(key)?;
        let timestamp: Option<OffsetDateTime> = cancellable(
            token,
            query_scalar("SELECT get_last_timestamp($1)")
                .bind(key)
                .fetch_one(self.pool()),
        )
        .await?;

        timestamp
            .map(ticks::from_datetime)
            .ok_or_else(|| SourceError::key_not_found(key))
    }

    async fn global_version(&self, token: &CancellationToken) -> Result<i64, SourceError> {
        let timestamp: Option<OffsetDateTime> = cancellable(
            token,
            query_scalar("SELECT (pg_last_committed_xact()).timestamp").fetch_one(self.pool()),
        )
        .await?;

        timestamp.map(ticks::from_datetime).ok_or_else(|| {
            SourceError::backend(
                self.id.clone(),
                "no committed transaction timestamp (is track_commit_timestamp enabled?)",
            )
        })
    }

    async fn is_tracking(
        &self,
        key: &str,
        token: &CancellationToken,
    ) -> Result<bool, SourceError> {
        self.flag("SELECT is_table_tracked($1)", key, token).await
    }

    async fn enable_tracking(
        &self,
        key: &str,
        token: &CancellationToken,
    ) -> Result<bool, SourceError> {
        let enabled = self
            .flag("SELECT enable_table_tracking($1)", key, token)
            .await?;
        info!(source = %self.id, table = key, enabled, "table tracking enabled");
        Ok(enabled)
    }

    async fn disable_tracking(
        &self,
        key: &str,
        token: &CancellationToken,
    ) -> Result<bool, SourceError> {
        let disabled = self
            .flag("SELECT disable_table_tracking($1)", key, token)
            .await?;
        info!(source = %self.id, table = key, disabled, "table tracking disabled");
        Ok(disabled)
    }

    /// Stored at microsecond precision; sub-microsecond ticks are dropped.
    async fn set_last_version(
        &self,
        key: &str,
        value: i64,
        token: &CancellationToken,
    ) -> Result<bool, SourceError> {
        validate_key(key)?;
        let timestamp = ticks::to_datetime(value).ok_or_else(|| {
            SourceError::backend(self.id.clone(), format!("version {value} is not a timestamp"))
        })?;
        let updated: Option<bool> = cancellable(
            token,
            query_scalar("SELECT set_last_timestamp($1, $2)")
                .bind(key)
                .bind(timestamp)
                .fetch_one(self.pool()),
        )
        .await?;
        Ok(updated.unwrap_or(false))
    }

    /// Bumped in SQL: `timestamptz` keeps microseconds, so a tick-level
    /// increment computed here could round back to the stored value.
    async fn bump_version(
        &self,
        key: &str,
        token: &CancellationToken,
    ) -> Result<Option<i64>, SourceError> {
        validate_key(key)?;
        let timestamp: Option<OffsetDateTime> = cancellable(
            token,
            query_scalar("SELECT bump_last_timestamp($1)")
                .bind(key)
                .fetch_one(self.pool()),
        )
        .await?;
        Ok(timestamp.map(ticks::from_datetime))
    }
}
