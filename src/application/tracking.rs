//! Administrative operations on a version source: install or remove table
//! tracking, inspect it, and record writes.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::tracker::{SourceError, VersionSource};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableStatus {
    pub source: String,
    pub table: String,
    pub tracked: bool,
    pub last_version: Option<i64>,
}

#[derive(Clone)]
pub struct TrackingService {
    source: Arc<dyn VersionSource>,
}

impl TrackingService {
    pub fn new(source: Arc<dyn VersionSource>) -> Self {
        Self { source }
    }

    pub fn source_id(&self) -> &str {
        self.source.id()
    }

    pub async fn enable(&self, table: &str, token: &CancellationToken) -> Result<bool, SourceError> {
        let changed = self.source.enable_tracking(table, token).await?;
        info!(
            source = self.source.id(),
            table,
            changed,
            "enable tracking"
        );
        Ok(changed)
    }

    pub async fn disable(
        &self,
        table: &str,
        token: &CancellationToken,
    ) -> Result<bool, SourceError> {
        let changed = self.source.disable_tracking(table, token).await?;
        info!(
            source = self.source.id(),
            table,
            changed,
            "disable tracking"
        );
        Ok(changed)
    }

    pub async fn status(
        &self,
        table: &str,
        token: &CancellationToken,
    ) -> Result<TableStatus, SourceError> {
        let tracked = self.source.is_tracking(table, token).await?;
        let last_version = if tracked {
            Some(self.source.last_version(table, token).await?)
        } else {
            None
        };

        Ok(TableStatus {
            source: self.source.id().to_string(),
            table: table.to_string(),
            tracked,
            last_version,
        })
    }

    /// Record a write to `table`, always moving its version forward.
    /// Returns the stored version, or `None` when the table is not tracked.
    pub async fn touch(
        &self,
        table: &str,
        token: &CancellationToken,
    ) -> Result<Option<i64>, SourceError> {
        let version = self.source.bump_version(table, token).await?;
        debug!(source = self.source.id(), table, ?version, "touched table");
        Ok(version)
    }
}
