//! Provider precedence: which version source answers a given endpoint.

use std::sync::Arc;

use axum::http::request::Parts;
use tracing::debug;

use super::error::TrackerError;
use super::options::{CacheOptions, SourceFactory};
use super::registry::ProviderRegistry;
use super::source::VersionSource;

/// Provider id derived from a declared data-context type.
///
/// `crate::db::BlogContext` becomes `blog_context`.
pub struct ContextId;

impl ContextId {
    pub fn of<C: ?Sized>() -> String {
        Self::from_type_name(std::any::type_name::<C>())
    }

    pub(crate) fn from_type_name(type_name: &str) -> String {
        // Generic arguments do not take part in the id.
        let base = type_name.split('<').next().unwrap_or(type_name);
        let last = base.rsplit("::").next().unwrap_or(base);
        snake_case(last)
    }
}

fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower = false;
        } else {
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
            out.push(ch);
        }
    }
    out
}

/// Outcome of provider resolution, fixed once per endpoint.
#[derive(Clone)]
pub enum ProviderSelection {
    Fixed(Arc<dyn VersionSource>),
    /// Invoked once per request.
    Factory(SourceFactory),
}

impl ProviderSelection {
    pub fn source_for(&self, parts: &Parts) -> Result<Arc<dyn VersionSource>, TrackerError> {
        match self {
            ProviderSelection::Fixed(source) => Ok(Arc::clone(source)),
            ProviderSelection::Factory(factory) => factory(parts),
        }
    }

    /// Source id when it is known without a request.
    pub fn fixed_id(&self) -> Option<&str> {
        match self {
            ProviderSelection::Fixed(source) => Some(source.id()),
            ProviderSelection::Factory(_) => None,
        }
    }
}

impl std::fmt::Debug for ProviderSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderSelection::Fixed(source) => f.debug_tuple("Fixed").field(&source.id()).finish(),
            ProviderSelection::Factory(_) => f.write_str("Factory"),
        }
    }
}

#[derive(Clone)]
pub struct ProviderResolver {
    registry: Arc<ProviderRegistry>,
}

impl ProviderResolver {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Resolve the provider for one endpoint. First match wins:
    ///
    /// 1. provider id given at the call site (must be registered)
    /// 2. source instance in the options
    /// 3. source factory in the options
    /// 4. id derived from the data context, when registered
    /// 5. `source` id in the options (must be registered)
    /// 6. the registry default
    pub fn select(
        &self,
        call_site_id: Option<&str>,
        context: Option<&str>,
        options: &CacheOptions,
    ) -> Result<ProviderSelection, TrackerError> {
        if let Some(id) = call_site_id {
            let source = self.registry.require(id)?;
            debug!(tier = "call_site", provider = id, "resolved version source");
            return Ok(ProviderSelection::Fixed(Arc::clone(source)));
        }

        if let Some(source) = &options.source_provider {
            debug!(tier = "instance", provider = source.id(), "resolved version source");
            return Ok(ProviderSelection::Fixed(Arc::clone(source)));
        }

        if let Some(factory) = &options.source_factory {
            debug!(tier = "factory", "resolved version source factory");
            return Ok(ProviderSelection::Factory(Arc::clone(factory)));
        }

        if let Some(context) = context
            && let Some(source) = self.registry.get(context)
        {
            debug!(tier = "context", provider = context, "resolved version source");
            return Ok(ProviderSelection::Fixed(Arc::clone(source)));
        }

        if let Some(id) = options.source.as_deref() {
            let source = self.registry.require(id)?;
            debug!(tier = "options", provider = id, "resolved version source");
            return Ok(ProviderSelection::Fixed(Arc::clone(source)));
        }

        let source = self.registry.default_source();
        debug!(tier = "default", provider = source.id(), "resolved version source");
        Ok(ProviderSelection::Fixed(Arc::clone(source)))
    }
}
