//! Priority-ordered collection of extractors.

use tracing::debug;

use super::Extractor;

/// Registered extractors, tried in priority order then registration order.
#[derive(Default)]
pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn Extractor>>,
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractorRegistry")
            .field("extractors", &self.names())
            .finish()
    }
}

impl ExtractorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an extractor. Keeps the list sorted by priority; ties keep
    /// registration order.
    #[tracing::instrument(skip(self, extractor), fields(extractor_name = extractor.name()))]
    pub fn register(&mut self, extractor: Box<dyn Extractor>) {
        debug!(priority = ?extractor.priority(), "registering extractor");
        self.extractors.push(extractor);
        self.extractors.sort_by_key(|e| e.priority());
    }

    /// Number of registered extractors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }

    /// Extractor names in lookup order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.extractors.iter().map(|e| e.name()).collect()
    }

    /// First extractor whose pattern matches `url`.
    #[must_use]
    pub fn find(&self, url: &str) -> Option<&dyn Extractor> {
        let found = self
            .extractors
            .iter()
            .find(|e| e.supports(url))
            .map(AsRef::as_ref);
        debug!(url, extractor = ?found.map(|e| e.name()), "extractor lookup");
        found
    }
}
