//! Immutable registry of version sources keyed by id.

use std::collections::HashMap;
use std::sync::Arc;

use super::error::TrackerError;
use super::source::VersionSource;

/// Id → source map built once at startup. The first registered source is the
/// default for requests that name no provider.
pub struct ProviderRegistry {
    ordered: Vec<Arc<dyn VersionSource>>,
    by_id: HashMap<String, usize>,
}

impl ProviderRegistry {
    pub fn new(sources: Vec<Arc<dyn VersionSource>>) -> Result<Self, TrackerError> {
        if sources.is_empty() {
            return Err(TrackerError::EmptyRegistry);
        }

        let mut by_id = HashMap::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            let id = source.id();
            if id.trim().is_empty() {
                return Err(TrackerError::configuration(
                    "version source ids must not be empty",
                ));
            }
            if by_id.insert(id.to_string(), index).is_some() {
                return Err(TrackerError::DuplicateProvider { id: id.to_string() });
            }
        }

        Ok(Self {
            ordered: sources,
            by_id,
        })
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn VersionSource>> {
        self.by_id.get(id).map(|&index| &self.ordered[index])
    }

    /// Look up `id`, failing with the list of registered ids.
    pub fn require(&self, id: &str) -> Result<&Arc<dyn VersionSource>, TrackerError> {
        self.get(id).ok_or_else(|| TrackerError::ProviderNotFound {
            id: id.to_string(),
            available: self.ids().collect::<Vec<_>>().join(", "),
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn default_source(&self) -> &Arc<dyn VersionSource> {
        // Construction rejects an empty source list.
        &self.ordered[0]
    }

    /// Registered ids in registration order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.ordered.iter().map(|source| source.id())
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
