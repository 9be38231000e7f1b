//! Last-resort extractor: fetch an HTML page and collect links to media files.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use regex::Regex;
use tracing::{debug, instrument};
use url::Url;

use super::{ExtractError, Extractor, ExtractorPriority, HTTP_URL_RE, MediaStream, compile_static_regex};
use crate::download::HttpClient;
use crate::media::{MediaItem, MediaKind};

/// `href`, `src` and `data-src` attribute values.
static LINK_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"(?i)\b(?:href|src|data-src)\s*=\s*["']([^"'<>]+)["']"#)
});

/// Scans any http(s) page for `href`/`src` attributes pointing at media.
#[derive(Debug, Clone)]
pub struct PageExtractor {
    client: HttpClient,
}

impl PageExtractor {
    /// Creates an extractor that fetches pages with `client`, including its
    /// per-host headers.
    #[must_use]
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }

    #[instrument(skip(self), fields(extractor = "page"))]
    async fn fetch_links(&self, page_url: &str) -> Result<Vec<MediaItem>, ExtractError> {
        let base = Url::parse(page_url).map_err(|e| ExtractError::parse(page_url, e.to_string()))?;

        let response = self
            .client
            .get(&base)
            .send()
            .await
            .map_err(|e| ExtractError::page_fetch(page_url, e.to_string()))?;
        if !response.status().is_success() {
            return Err(ExtractError::page_fetch(
                page_url,
                format!("HTTP {}", response.status().as_u16()),
            ));
        }
        let body = response
            .text()
            .await
            .map_err(|e| ExtractError::page_fetch(page_url, e.to_string()))?;

        let items = media_links(&base, &body)
            .into_iter()
            .map(|link| {
                MediaItem::new(page_url, "page")
                    .with_resolved_url(link.as_str())
                    .with_origin_id(page_url)
            })
            .collect::<Vec<_>>();

        if items.is_empty() {
            return Err(ExtractError::parse(page_url, "no media links found"));
        }
        debug!(count = items.len(), "found media links");
        Ok(items)
    }
}

/// Absolute media URLs referenced by `html`, in document order, deduplicated.
fn media_links(base: &Url, html: &str) -> Vec<Url> {
    let mut seen = HashSet::new();
    LINK_ATTR_RE
        .captures_iter(html)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().replace("&amp;", "&"))
        .filter_map(|raw| base.join(raw.trim()).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .filter(|url| MediaKind::from_filename(url.path()) != MediaKind::Other)
        .filter(|url| seen.insert(url.as_str().to_string()))
        .collect()
}

#[async_trait]
impl Extractor for PageExtractor {
    fn name(&self) -> &'static str {
        "page"
    }

    fn url_pattern(&self) -> &Regex {
        &HTTP_URL_RE
    }

    fn priority(&self) -> ExtractorPriority {
        ExtractorPriority::Fallback
    }

    fn extract<'a>(&'a self, url: &'a str) -> MediaStream<'a> {
        Box::pin(
            stream::once(self.fetch_links(url)).flat_map(|result| {
                let items: Vec<Result<MediaItem, ExtractError>> = match result {
                    Ok(items) => items.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(items)
            }),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, ResponseTemplate};

    use super::*;
    use crate::download::{ClientOptions, HostHeaders};
    use crate::test_support::socket_guard::start_mock_server_or_skip;

    #[test]
    fn test_media_links_resolves_and_filters() {
        let base = Url::parse("https://site.example.com/post/1").unwrap();
        let html = r#"
            <a href="/files/a.jpg">a</a>
            <img src="https://cdn.example.com/b.PNG?w=100&amp;h=50">
            <a href="/files/a.jpg">dup</a>
            <a href="/about.html">about</a>
            <video><source data-src='clip.mp4'></video>
            <a href="mailto:x@example.com">mail</a>
        "#;
        let links: Vec<String> = media_links(&base, html)
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            links,
            vec![
                "https://site.example.com/files/a.jpg",
                "https://cdn.example.com/b.PNG?w=100&h=50",
                "https://site.example.com/post/clip.mp4",
            ]
        );
    }

    #[tokio::test]
    async fn test_extract_streams_items_from_page() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/gallery"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><img src="/a.jpg"><a href="/b.zip">zip</a></html>"#,
            ))
            .mount(&mock_server)
            .await;

        let page_url = format!("{}/gallery", mock_server.uri());
        let extractor = PageExtractor::new(HttpClient::new());
        let items: Vec<MediaItem> = extractor
            .extract(&page_url)
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].kind, MediaKind::Image);
        assert_eq!(items[1].kind, MediaKind::Archive);
        assert_eq!(items[0].source_url, page_url);
        assert_eq!(items[0].download_url(), format!("{}/a.jpg", mock_server.uri()));
    }

    #[tokio::test]
    async fn test_page_fetch_sends_host_headers() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/private"))
            .and(header("cookie", "session=abc"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"<img src="/secret.jpg">"#),
            )
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/private"))
            .respond_with(ResponseTemplate::new(403))
            .with_priority(10)
            .mount(&mock_server)
            .await;

        let host = Url::parse(&mock_server.uri())
            .unwrap()
            .host_str()
            .unwrap()
            .to_string();
        let mut host_headers = HostHeaders::new();
        host_headers.insert(host, vec![("Cookie".to_string(), "session=abc".to_string())]);
        let client = HttpClient::with_options(ClientOptions {
            host_headers,
            ..ClientOptions::default()
        })
        .unwrap();

        let page_url = format!("{}/private", mock_server.uri());
        let results: Vec<_> = PageExtractor::new(client).extract(&page_url).collect().await;
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].as_ref().unwrap().download_url(),
            format!("{}/secret.jpg", mock_server.uri())
        );
    }

    #[tokio::test]
    async fn test_extract_reports_fetch_and_parse_failures() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/empty"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&mock_server)
            .await;

        let extractor = PageExtractor::new(HttpClient::new());

        let missing = format!("{}/missing", mock_server.uri());
        let results: Vec<_> = extractor.extract(&missing).collect().await;
        assert!(matches!(results.as_slice(), [Err(ExtractError::PageFetch { .. })]));

        let empty = format!("{}/empty", mock_server.uri());
        let results: Vec<_> = extractor.extract(&empty).collect().await;
        assert!(matches!(results.as_slice(), [Err(ExtractError::Parse { .. })]));
    }
}
