//! Scripted version source used by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::source::{SourceError, VersionSource, validate_key, validate_keys};

#[derive(Default)]
pub(crate) struct FakeSource {
    id: String,
    versions: HashMap<String, i64>,
    global: i64,
    stalled: bool,
    single: AtomicUsize,
    multi: AtomicUsize,
    global_reads: AtomicUsize,
}

impl FakeSource {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn with_version(mut self, key: &str, version: i64) -> Self {
        self.versions.insert(key.to_string(), version);
        self
    }

    pub(crate) fn with_global(mut self, version: i64) -> Self {
        self.global = version;
        self
    }

    /// Every read waits until the token is cancelled.
    pub(crate) fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }

    pub(crate) fn single_calls(&self) -> usize {
        self.single.load(Ordering::SeqCst)
    }

    pub(crate) fn multi_calls(&self) -> usize {
        self.multi.load(Ordering::SeqCst)
    }

    pub(crate) fn global_calls(&self) -> usize {
        self.global_reads.load(Ordering::SeqCst)
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.single_calls() + self.multi_calls() + self.global_calls()
    }

    async fn stall(&self, token: &CancellationToken) -> Result<(), SourceError> {
        if self.stalled {
            token.cancelled().await;
            return Err(SourceError::Cancelled);
        }
        Ok(())
    }

    fn lookup(&self, key: &str) -> Result<i64, SourceError> {
        self.versions
            .get(key)
            .copied()
            .ok_or_else(|| SourceError::key_not_found(key))
    }
}

#[async_trait]
impl VersionSource for FakeSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn last_version(
        &self,
        key: &str,
        token: &CancellationToken,
    ) -> Result<i64, SourceError> {
        validate_key(key)?;
        self.single.fetch_add(1, Ordering::SeqCst);
        self.stall(token).await?;
        self.lookup(key)
    }

    async fn global_version(&self, token: &CancellationToken) -> Result<i64, SourceError> {
        self.global_reads.fetch_add(1, Ordering::SeqCst);
        self.stall(token).await?;
        Ok(self.global)
    }

    async fn last_versions(
        &self,
        keys: &[String],
        slots: &mut [i64],
        token: &CancellationToken,
    ) -> Result<(), SourceError> {
        validate_keys(keys, slots.len())?;
        self.multi.fetch_add(1, Ordering::SeqCst);
        self.stall(token).await?;
        for (slot, key) in slots.iter_mut().zip(keys) {
            *slot = self.lookup(key)?;
        }
        Ok(())
    }

    async fn is_tracking(
        &self,
        key: &str,
        _token: &CancellationToken,
    ) -> Result<bool, SourceError> {
        Ok(self.versions.contains_key(key))
    }

    async fn enable_tracking(
        &self,
        _key: &str,
        _token: &CancellationToken,
    ) -> Result<bool, SourceError> {
        Ok(true)
    }

    async fn disable_tracking(
        &self,
        _key: &str,
        _token: &CancellationToken,
    ) -> Result<bool, SourceError> {
        Ok(true)
    }
}
