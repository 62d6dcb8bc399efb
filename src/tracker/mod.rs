//! Conditional-cache (ETag) engine.
//!
//! Instead of caching response bodies, the engine tracks a fingerprint of data
//! freshness per endpoint and answers `304 Not Modified` when the client's
//! copy is still current.

pub mod aggregate;
pub mod coordinator;
pub mod error;
pub mod etag;
pub mod hasher;
mod lock;
pub mod options;
pub mod registry;
pub mod resolver;
pub mod source;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregate::{PooledVersions, VersionBufferPool, fetch_fingerprint};
pub use coordinator::{
    Coordinator, CoordinatorConfig, Decision, SkipReason, TrackedEndpoint, correlation_id,
};
pub use error::{ErrorKind, TrackerError};
pub use etag::{BuildEpoch, build_etag, digit_count, etag_len, etag_matches};
pub use hasher::{Fnv1aHasher, HasherKind, Murmur3FinalizerHasher, Sha256Hasher, VersionHasher};
pub use options::{
    CacheControlBuilder, CacheOptions, ImmutableCacheOptions, OptionsBuilder, OptionsCache,
    OptionsSlot, RequestFilter, SourceFactory, StaticTableNames, SuffixFn, TableNameResolver,
    TrackSpec,
};
pub use registry::ProviderRegistry;
pub use resolver::{ContextId, ProviderResolver, ProviderSelection};
pub use source::{SourceError, VersionSource};
