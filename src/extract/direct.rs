//! Direct media links: the URL is the file.

use std::sync::LazyLock;

use async_trait::async_trait;
use futures_util::stream;
use regex::Regex;

use super::{Extractor, ExtractorPriority, MediaStream, compile_static_regex};
use crate::media::{MediaItem, known_extensions};

static DIRECT_MEDIA_RE: LazyLock<Regex> = LazyLock::new(|| {
    let extensions = known_extensions()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("|");
    compile_static_regex(&format!(
        r"(?i)^https?://[^\s/?#]+/[^\s?#]*\.(?:{extensions})(?:[?#]\S*)?$"
    ))
});

/// Accepts http(s) URLs whose path ends in a known media extension and
/// yields exactly one item for them.
#[derive(Debug, Default)]
pub struct DirectExtractor;

impl DirectExtractor {
    /// Creates a new `DirectExtractor`.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Extractor for DirectExtractor {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn url_pattern(&self) -> &Regex {
        &DIRECT_MEDIA_RE
    }

    fn priority(&self) -> ExtractorPriority {
        ExtractorPriority::Direct
    }

    fn extract<'a>(&'a self, url: &'a str) -> MediaStream<'a> {
        Box::pin(stream::iter(std::iter::once_with(move || {
            Ok(MediaItem::new(url, self.name()).with_resolved_url(url))
        })))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::media::MediaKind;

    #[test]
    fn test_supports_media_extensions_only() {
        let direct = DirectExtractor::new();
        assert!(direct.supports("https://cdn.example.com/a/b/photo.JPG"));
        assert!(direct.supports("http://cdn.example.com/clip.mp4?token=abc"));
        assert!(direct.supports("https://cdn.example.com/pack.tar.gz#frag"));
        assert!(!direct.supports("https://example.com/gallery/123"));
        assert!(!direct.supports("https://example.com/"));
        assert!(!direct.supports("https://example.com/page.html"));
        assert!(!direct.supports("ftp://example.com/a.jpg"));
        assert!(!direct.supports("https://example.com/a.jpg.html"));
    }

    #[tokio::test]
    async fn test_extract_yields_single_resolved_item() {
        let direct = DirectExtractor::new();
        let url = "https://cdn.example.com/clip.webm";
        let items: Vec<_> = direct.extract(url).collect().await;
        assert_eq!(items.len(), 1);

        let item = items.into_iter().next().unwrap().unwrap();
        assert_eq!(item.site, "direct");
        assert_eq!(item.kind, MediaKind::Video);
        assert_eq!(item.download_url(), url);
    }

    #[tokio::test]
    async fn test_extract_is_restartable() {
        let direct = DirectExtractor::new();
        let url = "https://cdn.example.com/a.png";
        assert_eq!(direct.extract(url).count().await, 1);
        assert_eq!(direct.extract(url).count().await, 1);
    }

    #[tokio::test]
    async fn test_resolve_default_is_identity() {
        let direct = DirectExtractor::new();
        let item = MediaItem::new("https://cdn.example.com/a.png", "direct");
        let resolved = direct.resolve(item.clone()).await.unwrap();
        assert_eq!(resolved, item);
    }
}
