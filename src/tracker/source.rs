//! Version source contract.
//!
//! A version source answers "what is the current freshness version of key K
//! (or of the whole store)?". Concrete backends live under `infra`; the engine
//! only ever sees `Arc<dyn VersionSource>`.

use std::fmt;

use async_trait::async_trait;
use futures::future::try_join_all;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("key must not be empty")]
    InvalidKey,
    #[error("{keys} keys supplied for {slots} version slots")]
    LengthMismatch { keys: usize, slots: usize },
    #[error("no version recorded for key `{key}`")]
    KeyNotFound { key: String },
    #[error("operation `{operation}` is not supported by this source")]
    Unsupported { operation: &'static str },
    #[error("backend `{source_id}` failed: {message}")]
    Backend { source_id: String, message: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("operation cancelled")]
    Cancelled,
}

impl SourceError {
    pub fn backend(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    pub fn key_not_found(key: impl Into<String>) -> Self {
        Self::KeyNotFound { key: key.into() }
    }
}

/// Freshness backend shared by every request that resolves to it.
///
/// Implementations must be safe for concurrent use; the coordinator never
/// serializes calls on their behalf. Every call receives the request's
/// cancellation token and should stop work once it fires.
#[async_trait]
pub trait VersionSource: Send + Sync {
    /// Unique identifier used for registry lookups.
    fn id(&self) -> &str;

    /// Last version recorded for a single key.
    async fn last_version(&self, key: &str, token: &CancellationToken)
    -> Result<i64, SourceError>;

    /// Aggregate version across everything the source tracks.
    async fn global_version(&self, token: &CancellationToken) -> Result<i64, SourceError>;

    /// Fill `slots[i]` with the last version of `keys[i]`.
    ///
    /// Arguments are validated before any I/O. The default implementation
    /// issues the per-key lookups concurrently and writes each result into the
    /// slot addressed by its key index.
    async fn last_versions(
        &self,
        keys: &[String],
        slots: &mut [i64],
        token: &CancellationToken,
    ) -> Result<(), SourceError> {
        validate_keys(keys, slots.len())?;

        let fetched = try_join_all(keys.iter().map(|key| self.last_version(key, token))).await?;
        for (slot, version) in slots.iter_mut().zip(fetched) {
            *slot = version;
        }
        Ok(())
    }

    async fn is_tracking(&self, key: &str, token: &CancellationToken)
    -> Result<bool, SourceError>;

    async fn enable_tracking(
        &self,
        key: &str,
        token: &CancellationToken,
    ) -> Result<bool, SourceError>;

    async fn disable_tracking(
        &self,
        key: &str,
        token: &CancellationToken,
    ) -> Result<bool, SourceError>;

    /// Overwrite the recorded version of a key. Read-only backends keep the
    /// default, which reports the operation as unsupported.
    async fn set_last_version(
        &self,
        _key: &str,
        _value: i64,
        _token: &CancellationToken,
    ) -> Result<bool, SourceError> {
        Err(SourceError::Unsupported {
            operation: "set_last_version",
        })
    }

    /// Move a key's version forward to at least the current time and strictly
    /// past its previous value, returning the stored result. `None` when the
    /// key is not tracked.
    async fn bump_version(
        &self,
        _key: &str,
        _token: &CancellationToken,
    ) -> Result<Option<i64>, SourceError> {
        Err(SourceError::Unsupported {
            operation: "bump_version",
        })
    }
}

impl fmt::Debug for dyn VersionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionSource")
            .field("id", &self.id())
            .finish()
    }
}

pub fn validate_key(key: &str) -> Result<(), SourceError> {
    if key.trim().is_empty() {
        return Err(SourceError::InvalidKey);
    }
    Ok(())
}

/// Reject empty keys and key/slot count mismatches.
pub fn validate_keys(keys: &[String], slots: usize) -> Result<(), SourceError> {
    if keys.len() != slots {
        return Err(SourceError::LengthMismatch {
            keys: keys.len(),
            slots,
        });
    }
    keys.iter().try_for_each(|key| validate_key(key))
}
