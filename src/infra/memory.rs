//! In-process version source.
//!
//! Tracks versions in a sharded map. Writers call [`MemoryVersionSource::touch`]
//! after mutating a table; versions are tick timestamps, bumped by one when
//! two touches land in the same tick so every touch is observable.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ticks;
use crate::tracker::source::{SourceError, VersionSource, validate_key};

pub const MEMORY_SOURCE_ID: &str = "memory";

pub struct MemoryVersionSource {
    id: String,
    versions: DashMap<String, i64>,
    global: AtomicI64,
}

impl MemoryVersionSource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            versions: DashMap::new(),
            global: AtomicI64::new(ticks::now()),
        }
    }

    /// Start tracking `tables` with the current time as their version.
    pub fn with_tables<I, S>(self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = ticks::now();
        for table in tables {
            self.versions.entry(table.into()).or_insert(now);
        }
        self
    }

    /// Record a change to `key` and return its new version.
    pub fn touch(&self, key: &str) -> Result<i64, SourceError> {
        validate_key(key)?;
        let mut entry = self
            .versions
            .get_mut(key)
            .ok_or_else(|| SourceError::key_not_found(key))?;
        let next = ticks::now().max(entry.value().saturating_add(1));
        *entry.value_mut() = next;
        drop(entry);

        self.bump_global(next);
        debug!(source = %self.id, key, version = next, "version bumped");
        Ok(next)
    }

    fn bump_global(&self, version: i64) {
        self.global.fetch_max(version, Ordering::AcqRel);
    }
}

impl Default for MemoryVersionSource {
    fn default() -> Self {
        Self::new(MEMORY_SOURCE_ID)
    }
}

#[async_trait]
impl VersionSource for MemoryVersionSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn last_version(
        &self,
        key: &str,
        token: &CancellationToken,
    ) -> Result<i64, SourceError> {
        validate_key(key)?;
        if token.is_cancelled() {
            return Err(SourceError::Cancelled);
        }
        self.versions
            .get(key)
            .map(|entry| *entry.value())
            .ok_or_else(|| SourceError::key_not_found(key))
    }

    async fn global_version(&self, token: &CancellationToken) -> Result<i64, SourceError> {
        if token.is_cancelled() {
            return Err(SourceError::Cancelled);
        }
        Ok(self.global.load(Ordering::Acquire))
    }

    async fn is_tracking(
        &self,
        key: &str,
        _token: &CancellationToken,
    ) -> Result<bool, SourceError> {
        validate_key(key)?;
        Ok(self.versions.contains_key(key))
    }

    async fn enable_tracking(
        &self,
        key: &str,
        _token: &CancellationToken,
    ) -> Result<bool, SourceError> {
        validate_key(key)?;
        let now = ticks::now();
        let mut inserted = false;
        self.versions.entry(key.to_string()).or_insert_with(|| {
            inserted = true;
            now
        });
        Ok(inserted)
    }

    async fn disable_tracking(
        &self,
        key: &str,
        _token: &CancellationToken,
    ) -> Result<bool, SourceError> {
        validate_key(key)?;
        Ok(self.versions.remove(key).is_some())
    }

    async fn set_last_version(
        &self,
        key: &str,
        value: i64,
        _token: &CancellationToken,
    ) -> Result<bool, SourceError> {
        validate_key(key)?;
        match self.versions.get_mut(key) {
            Some(mut entry) => {
                *entry.value_mut() = value;
                drop(entry);
                self.bump_global(value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn bump_version(
        &self,
        key: &str,
        _token: &CancellationToken,
    ) -> Result<Option<i64>, SourceError> {
        match self.touch(key) {
            Ok(version) => Ok(Some(version)),
            Err(SourceError::KeyNotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
