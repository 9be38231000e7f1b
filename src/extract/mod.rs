//! Media discovery: turning a user URL into [`MediaItem`]s.
//!
//! Each content host is one [`Extractor`] selected by URL pattern through the
//! [`ExtractorRegistry`]. The crate ships two:
//!
//! - [`DirectExtractor`] - a URL that already points at a media file
//! - [`PageExtractor`] - last-resort scan of an HTML page for media links
//!
//! # Example
//!
//! ```no_run
//! use futures_util::StreamExt;
//! use mediagrab_core::download::HttpClient;
//! use mediagrab_core::extract::build_default_registry;
//!
//! # async fn example() {
//! let registry = build_default_registry(&HttpClient::new());
//! if let Some(extractor) = registry.find("https://cdn.example.com/a.jpg") {
//!     let mut items = extractor.extract("https://cdn.example.com/a.jpg");
//!     while let Some(item) = items.next().await {
//!         println!("{item:?}");
//!     }
//! }
//! # }
//! ```

mod direct;
mod error;
mod page;
mod registry;

pub use direct::DirectExtractor;
pub use error::ExtractError;
pub use page::PageExtractor;
pub use registry::ExtractorRegistry;

use std::pin::Pin;
use std::sync::LazyLock;

use async_trait::async_trait;
use futures_util::Stream;
use regex::Regex;

use crate::download::HttpClient;
use crate::media::MediaItem;

/// Lazy, finite stream of discovered items. Calling
/// [`Extractor::extract`] again restarts discovery from scratch.
pub type MediaStream<'a> = Pin<Box<dyn Stream<Item = Result<MediaItem, ExtractError>> + Send + 'a>>;

/// Registry ordering. Site extractors win over generic ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExtractorPriority {
    /// Host-specific extractors.
    Specialized = 0,
    /// Direct media links.
    Direct = 1,
    /// Catch-all page scanning.
    Fallback = 2,
}

/// One content host's extraction logic.
///
/// # Object Safety
///
/// Uses `async_trait` so the registry can hold `Box<dyn Extractor>`.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Short identifier, also stored as [`MediaItem::site`].
    fn name(&self) -> &str;

    /// URLs this extractor accepts.
    fn url_pattern(&self) -> &Regex;

    /// Where the extractor sits in registry order.
    fn priority(&self) -> ExtractorPriority {
        ExtractorPriority::Specialized
    }

    /// Whether `url` matches [`Extractor::url_pattern`].
    fn supports(&self, url: &str) -> bool {
        self.url_pattern().is_match(url)
    }

    /// Discovers the media behind `url`.
    fn extract<'a>(&'a self, url: &'a str) -> MediaStream<'a>;

    /// Resolves an item's final download URL, for hosts that need one extra
    /// request. Items returned here are expected to carry `resolved_url`.
    async fn resolve(&self, item: MediaItem) -> Result<MediaItem, ExtractError> {
        Ok(item)
    }
}

/// Builds the registry used by the CLI: direct links, then page scanning.
#[must_use]
pub fn build_default_registry(client: &HttpClient) -> ExtractorRegistry {
    let mut registry = ExtractorRegistry::new();
    registry.register(Box::new(DirectExtractor::new()));
    registry.register(Box::new(PageExtractor::new(client.clone())));
    registry
}

/// Compiles a regex at static init; panics on invalid pattern.
pub(crate) fn compile_static_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid static regex '{pattern}': {e}"))
}

/// Any http(s) URL.
pub(crate) static HTTP_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?i)^https?://[^\s/]+"));
