//! Fingerprint fetching: key-count policy plus pooled version buffers.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use super::error::TrackerError;
use super::hasher::VersionHasher;
use super::lock::mutex_lock;
use super::source::VersionSource;

const SOURCE: &str = "tracker::aggregate";

/// Bounded stack of reusable version buffers.
pub struct VersionBufferPool {
    buffers: Mutex<Vec<Vec<i64>>>,
    capacity: usize,
}

impl VersionBufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Hand out a zeroed buffer of exactly `len` slots.
    pub fn take(&self, len: usize) -> PooledVersions<'_> {
        let mut buffer = mutex_lock(&self.buffers, SOURCE, "take")
            .pop()
            .unwrap_or_default();
        buffer.clear();
        buffer.resize(len, 0);
        PooledVersions { pool: self, buffer }
    }

    /// Buffers currently parked in the pool.
    pub fn retained(&self) -> usize {
        mutex_lock(&self.buffers, SOURCE, "retained").len()
    }

    fn give_back(&self, buffer: Vec<i64>) {
        let mut buffers = mutex_lock(&self.buffers, SOURCE, "give_back");
        if buffers.len() < self.capacity {
            buffers.push(buffer);
        }
    }
}

impl Default for VersionBufferPool {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Buffer on loan from a [`VersionBufferPool`]; returned when dropped.
pub struct PooledVersions<'a> {
    pool: &'a VersionBufferPool,
    buffer: Vec<i64>,
}

impl Deref for PooledVersions<'_> {
    type Target = [i64];

    fn deref(&self) -> &[i64] {
        &self.buffer
    }
}

impl DerefMut for PooledVersions<'_> {
    fn deref_mut(&mut self) -> &mut [i64] {
        &mut self.buffer
    }
}

impl Drop for PooledVersions<'_> {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buffer));
    }
}

/// Fetch the fingerprint for `keys` from `source`.
///
/// - no keys: the source's global version
/// - one key: that key's version, unhashed
/// - several keys: per-key versions in key order, mixed by `hasher`
///
/// Any failure aborts the whole fetch. A fired token wins over a pending
/// backend call and yields [`TrackerError::Cancelled`].
pub async fn fetch_fingerprint(
    source: &dyn VersionSource,
    keys: &[String],
    hasher: &dyn VersionHasher,
    pool: &VersionBufferPool,
    token: &CancellationToken,
) -> Result<u64, TrackerError> {
    let fetch = async {
        match keys {
            [] => source.global_version(token).await.map(|v| v as u64),
            [key] => source.last_version(key, token).await.map(|v| v as u64),
            _ => {
                let mut slots = pool.take(keys.len());
                source.last_versions(keys, &mut slots, token).await?;
                Ok(hasher.hash(&slots))
            }
        }
    };

    tokio::select! {
        biased;
        _ = token.cancelled() => Err(TrackerError::Cancelled),
        result = fetch => result.map_err(|err| TrackerError::from_source(source.id(), err)),
    }
}
