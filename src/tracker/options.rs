//! Endpoint configuration: the user-authored options, their frozen per-endpoint
//! form, and the build-once cache that publishes it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::http::HeaderValue;
use axum::http::request::Parts;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use super::error::TrackerError;
use super::resolver::{ProviderResolver, ProviderSelection};
use super::source::VersionSource;

/// Builds a version source for one request.
pub type SourceFactory =
    Arc<dyn Fn(&Parts) -> Result<Arc<dyn VersionSource>, TrackerError> + Send + Sync>;

/// Derives the ETag suffix from a request; an empty string means no suffix.
pub type SuffixFn = Arc<dyn Fn(&Parts) -> String + Send + Sync>;

/// Eligibility predicate over a request.
pub type RequestFilter = Arc<dyn Fn(&Parts) -> bool + Send + Sync>;

pub const DEFAULT_CACHE_CONTROL: &str = "no-cache";

/// Mutable, user-authored defaults shared by every tracked endpoint.
#[derive(Clone)]
pub struct CacheOptions {
    pub tables: Vec<String>,
    pub entities: Vec<String>,
    pub source: Option<String>,
    pub source_provider: Option<Arc<dyn VersionSource>>,
    pub source_factory: Option<SourceFactory>,
    pub cache_control: Option<String>,
    pub cache_control_builder: Option<CacheControlBuilder>,
    pub suffix: Option<SuffixFn>,
    pub filter: Option<RequestFilter>,
    /// Response `Cache-Control` directives that disable tracking.
    pub invalid_response_directives: Vec<String>,
    /// Request `Cache-Control` directives that disable tracking.
    pub invalid_request_directives: Vec<String>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            tables: Vec::new(),
            entities: Vec::new(),
            source: None,
            source_provider: None,
            source_factory: None,
            cache_control: None,
            cache_control_builder: None,
            suffix: None,
            filter: None,
            invalid_response_directives: vec!["immutable".to_string(), "no-store".to_string()],
            invalid_request_directives: Vec::new(),
        }
    }
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("tables", &self.tables)
            .field("entities", &self.entities)
            .field("source", &self.source)
            .field(
                "source_provider",
                &self.source_provider.as_ref().map(|source| source.id()),
            )
            .field("source_factory", &self.source_factory.is_some())
            .field("cache_control", &self.cache_control)
            .field("suffix", &self.suffix.is_some())
            .field("filter", &self.filter.is_some())
            .field(
                "invalid_response_directives",
                &self.invalid_response_directives,
            )
            .field(
                "invalid_request_directives",
                &self.invalid_request_directives,
            )
            .finish()
    }
}

/// Declarative configuration attached to one route at registration time.
#[derive(Clone, Default)]
pub struct TrackSpec {
    pub endpoint: String,
    pub tables: Vec<String>,
    pub entities: Vec<String>,
    /// Explicit provider id; must be registered.
    pub provider: Option<String>,
    /// Provider id derived from a data-context type, see [`ContextId`].
    ///
    /// [`ContextId`]: super::resolver::ContextId
    pub context: Option<String>,
    pub cache_control: Option<String>,
    pub filter: Option<RequestFilter>,
    pub suffix: Option<SuffixFn>,
}

impl TrackSpec {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables.extend(tables.into_iter().map(Into::into));
        self
    }

    pub fn entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities.extend(entities.into_iter().map(Into::into));
        self
    }

    pub fn provider(mut self, id: impl Into<String>) -> Self {
        self.provider = Some(id.into());
        self
    }

    pub fn context<C: ?Sized>(mut self) -> Self {
        self.context = Some(super::resolver::ContextId::of::<C>());
        self
    }

    pub fn cache_control(mut self, value: impl Into<String>) -> Self {
        self.cache_control = Some(value.into());
        self
    }

    pub fn filter(mut self, filter: impl Fn(&Parts) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn suffix(mut self, suffix: impl Fn(&Parts) -> String + Send + Sync + 'static) -> Self {
        self.suffix = Some(Arc::new(suffix));
        self
    }
}

impl fmt::Debug for TrackSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackSpec")
            .field("endpoint", &self.endpoint)
            .field("tables", &self.tables)
            .field("entities", &self.entities)
            .field("provider", &self.provider)
            .field("context", &self.context)
            .field("cache_control", &self.cache_control)
            .finish_non_exhaustive()
    }
}

/// Fluent `Cache-Control` builder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControlBuilder {
    directives: Vec<String>,
}

impl CacheControlBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, directive: impl Into<String>) -> Self {
        let directive = directive.into();
        if !self
            .directives
            .iter()
            .any(|existing| existing.eq_ignore_ascii_case(&directive))
        {
            self.directives.push(directive);
        }
        self
    }

    pub fn no_cache(self) -> Self {
        self.push("no-cache")
    }

    pub fn no_store(self) -> Self {
        self.push("no-store")
    }

    pub fn must_revalidate(self) -> Self {
        self.push("must-revalidate")
    }

    pub fn proxy_revalidate(self) -> Self {
        self.push("proxy-revalidate")
    }

    pub fn private(self) -> Self {
        self.push("private")
    }

    pub fn public(self) -> Self {
        self.push("public")
    }

    pub fn no_transform(self) -> Self {
        self.push("no-transform")
    }

    pub fn immutable(self) -> Self {
        self.push("immutable")
    }

    pub fn max_age(self, seconds: u64) -> Self {
        self.push(format!("max-age={seconds}"))
    }

    pub fn s_maxage(self, seconds: u64) -> Self {
        self.push(format!("s-maxage={seconds}"))
    }

    pub fn directive(self, directive: impl Into<String>) -> Self {
        self.push(directive)
    }

    /// Comma-separated header value; the default policy when nothing was added.
    pub fn build(&self) -> String {
        if self.directives.is_empty() {
            return DEFAULT_CACHE_CONTROL.to_string();
        }
        self.directives.join(", ")
    }
}

/// Maps logical entity names to physical table names.
pub trait TableNameResolver: Send + Sync {
    fn table_names(&self, entities: &[String]) -> Result<Vec<String>, TrackerError>;
}

/// Entity mapping loaded from `[tracker.entities]`. Entity names are matched
/// case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct StaticTableNames {
    tables: HashMap<String, String>,
}

impl StaticTableNames {
    pub fn new(tables: HashMap<String, String>) -> Self {
        let tables = tables
            .into_iter()
            .map(|(entity, table)| (entity.to_ascii_lowercase(), table))
            .collect();
        Self { tables }
    }
}

impl TableNameResolver for StaticTableNames {
    fn table_names(&self, entities: &[String]) -> Result<Vec<String>, TrackerError> {
        entities
            .iter()
            .map(|entity| {
                self.tables.get(&entity.to_ascii_lowercase()).cloned().ok_or_else(|| {
                    TrackerError::configuration(format!(
                        "entity `{entity}` has no table mapping"
                    ))
                })
            })
            .collect()
    }
}

/// Frozen configuration for one endpoint.
pub struct ImmutableCacheOptions {
    pub endpoint: Arc<str>,
    /// Tracked keys, de-duplicated in first-seen order.
    pub tables: Vec<String>,
    pub provider: ProviderSelection,
    pub cache_control: HeaderValue,
    pub suffix: Option<SuffixFn>,
}

impl ImmutableCacheOptions {
    pub fn suffix_for(&self, parts: &Parts) -> String {
        self.suffix
            .as_ref()
            .map(|suffix| suffix(parts))
            .unwrap_or_default()
    }
}

impl fmt::Debug for ImmutableCacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImmutableCacheOptions")
            .field("endpoint", &self.endpoint)
            .field("tables", &self.tables)
            .field("provider", &self.provider)
            .field("cache_control", &self.cache_control)
            .field("suffix", &self.suffix.is_some())
            .finish()
    }
}

/// Freezes [`CacheOptions`] + [`TrackSpec`] into [`ImmutableCacheOptions`].
#[derive(Clone)]
pub struct OptionsBuilder {
    resolver: ProviderResolver,
    table_names: Arc<dyn TableNameResolver>,
}

impl OptionsBuilder {
    pub fn new(resolver: ProviderResolver, table_names: Arc<dyn TableNameResolver>) -> Self {
        Self {
            resolver,
            table_names,
        }
    }

    pub fn resolver(&self) -> &ProviderResolver {
        &self.resolver
    }

    pub fn build(
        &self,
        options: &CacheOptions,
        spec: &TrackSpec,
    ) -> Result<ImmutableCacheOptions, TrackerError> {
        let mut entities = options.entities.clone();
        entities.extend(spec.entities.iter().cloned());
        let entity_tables = if entities.is_empty() {
            Vec::new()
        } else {
            self.table_names.table_names(&entities)?
        };

        let candidates = options
            .tables
            .iter()
            .chain(spec.tables.iter())
            .chain(entity_tables.iter());
        let tables = dedup_tables(&spec.endpoint, candidates)?;

        let cache_control = resolve_cache_control(options, spec);
        let cache_control = HeaderValue::from_str(&cache_control).map_err(|_| {
            TrackerError::configuration(format!(
                "cache-control `{cache_control}` for `{}` is not a valid header value",
                spec.endpoint
            ))
        })?;

        let provider = self.resolver.select(
            spec.provider.as_deref(),
            spec.context.as_deref(),
            options,
        )?;

        let suffix = spec.suffix.clone().or_else(|| options.suffix.clone());

        debug!(
            endpoint = %spec.endpoint,
            tables = tables.len(),
            provider = provider.fixed_id().unwrap_or("factory"),
            "built endpoint cache options"
        );

        Ok(ImmutableCacheOptions {
            endpoint: Arc::from(spec.endpoint.as_str()),
            tables,
            provider,
            cache_control,
            suffix,
        })
    }
}

fn resolve_cache_control(options: &CacheOptions, spec: &TrackSpec) -> String {
    if let Some(value) = spec.cache_control.as_deref().or(options.cache_control.as_deref()) {
        return value.to_string();
    }
    options
        .cache_control_builder
        .as_ref()
        .map(CacheControlBuilder::build)
        .unwrap_or_else(|| DEFAULT_CACHE_CONTROL.to_string())
}

fn dedup_tables<'a>(
    endpoint: &str,
    candidates: impl Iterator<Item = &'a String>,
) -> Result<Vec<String>, TrackerError> {
    let mut seen = HashSet::new();
    let mut tables = Vec::new();
    for table in candidates {
        let table = table.trim();
        if table.is_empty() {
            return Err(TrackerError::configuration(format!(
                "endpoint `{endpoint}` lists an empty table name"
            )));
        }
        if seen.insert(table.to_string()) {
            tables.push(table.to_string());
        } else {
            warn!(endpoint, table, "duplicate tracked table ignored");
        }
    }
    Ok(tables)
}

/// Compute-once cell for one endpoint.
///
/// Endpoints hold their slot directly. Invalidation links a fresh successor
/// instead of resetting the cell, so a holder reaches the current options
/// through atomic loads alone.
#[derive(Debug, Default)]
pub struct OptionsSlot {
    cell: OnceCell<Arc<ImmutableCacheOptions>>,
    successor: OnceCell<Arc<OptionsSlot>>,
}

impl OptionsSlot {
    /// Published options, if any. An atomic load, no locking.
    pub fn get(&self) -> Option<&Arc<ImmutableCacheOptions>> {
        self.cell.get()
    }

    /// Newest slot reachable from `slot`.
    pub fn latest(mut slot: &Arc<OptionsSlot>) -> &Arc<OptionsSlot> {
        while let Some(next) = slot.successor.get() {
            slot = next;
        }
        slot
    }
}

/// Published endpoint options keyed by endpoint id.
///
/// The first caller for an endpoint builds while concurrent callers for the
/// same endpoint wait on the slot; a failed build publishes nothing, so the
/// next request retries. The map is only consulted to hand out slots and to
/// invalidate them.
#[derive(Default)]
pub struct OptionsCache {
    slots: DashMap<Arc<str>, Arc<OptionsSlot>>,
    builds: AtomicUsize,
}

impl OptionsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot for `endpoint`, created on first use.
    pub fn slot(&self, endpoint: &str) -> Arc<OptionsSlot> {
        if let Some(slot) = self.slots.get(endpoint) {
            return Arc::clone(slot.value());
        }
        Arc::clone(
            self.slots
                .entry(Arc::from(endpoint))
                .or_default()
                .value(),
        )
    }

    pub fn get_or_build<F>(
        &self,
        endpoint: &str,
        build: F,
    ) -> Result<Arc<ImmutableCacheOptions>, TrackerError>
    where
        F: FnOnce() -> Result<ImmutableCacheOptions, TrackerError>,
    {
        self.get_or_build_in(&self.slot(endpoint), build)
    }

    /// Like [`get_or_build`](Self::get_or_build) for a slot the caller
    /// already holds. Never touches the map.
    pub fn get_or_build_in<F>(
        &self,
        slot: &Arc<OptionsSlot>,
        build: F,
    ) -> Result<Arc<ImmutableCacheOptions>, TrackerError>
    where
        F: FnOnce() -> Result<ImmutableCacheOptions, TrackerError>,
    {
        let slot = OptionsSlot::latest(slot);
        if let Some(options) = slot.get() {
            return Ok(Arc::clone(options));
        }

        slot.cell
            .get_or_try_init(|| {
                self.builds.fetch_add(1, Ordering::SeqCst);
                build().map(Arc::new)
            })
            .map(Arc::clone)
    }

    /// Retire the published options for `endpoint`; the next request rebuilds.
    pub fn invalidate(&self, endpoint: &str) -> bool {
        let Some(mut entry) = self.slots.get_mut(endpoint) else {
            return false;
        };
        let fresh = Arc::new(OptionsSlot::default());
        let retired = std::mem::replace(entry.value_mut(), Arc::clone(&fresh));
        // Each retired slot is handed out by exactly one replace.
        let _ = retired.successor.set(fresh);
        true
    }

    /// Number of build attempts since creation.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
