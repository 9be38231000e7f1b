//! Discovered media items and their coarse kind.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tiff", "webp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm", "mov", "avi", "flv", "wmv", "m4v"];
const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx"];
const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "rar", "7z", "tar", "gz"];

/// Every extension [`MediaKind::from_extension`] classifies as non-`Other`.
pub(crate) fn known_extensions() -> impl Iterator<Item = &'static str> {
    IMAGE_EXTENSIONS
        .iter()
        .chain(VIDEO_EXTENSIONS)
        .chain(DOCUMENT_EXTENSIONS)
        .chain(ARCHIVE_EXTENSIONS)
        .copied()
}

/// Coarse media category used for batch filters and reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Still images.
    Image,
    /// Video files.
    Video,
    /// Office documents and PDFs.
    Document,
    /// Compressed archives.
    Archive,
    /// Anything not recognized by extension.
    #[default]
    Other,
}

impl MediaKind {
    /// Classifies a bare extension (with or without the leading dot).
    #[must_use]
    pub fn from_extension(ext: &str) -> Self {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        let ext = ext.as_str();
        if IMAGE_EXTENSIONS.contains(&ext) {
            Self::Image
        } else if VIDEO_EXTENSIONS.contains(&ext) {
            Self::Video
        } else if DOCUMENT_EXTENSIONS.contains(&ext) {
            Self::Document
        } else if ARCHIVE_EXTENSIONS.contains(&ext) {
            Self::Archive
        } else {
            Self::Other
        }
    }

    /// Classifies a filename or URL path by its final extension.
    #[must_use]
    pub fn from_filename(name: &str) -> Self {
        let path = name.split(['?', '#']).next().unwrap_or(name);
        Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .map_or(Self::Other, Self::from_extension)
    }

    /// Lowercase label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Document => "document",
            Self::Archive => "archive",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One downloadable unit produced by an extractor.
///
/// Immutable once built; the coordinator owns it until its task is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    /// Page or direct URL the item was discovered from.
    pub source_url: String,
    /// Direct download URL when it differs from `source_url`.
    pub resolved_url: Option<String>,
    /// Filename proposed by the extractor.
    pub suggested_filename: Option<String>,
    /// Media category.
    pub kind: MediaKind,
    /// Size in bytes if the extractor knows it.
    pub expected_size: Option<u64>,
    /// Identifier of the site/extractor that produced the item.
    pub site: String,
    /// Post or profile identifier on the origin site.
    pub origin_id: Option<String>,
    /// Publication date as reported by the site.
    pub published: Option<String>,
}

impl MediaItem {
    /// Creates an item whose kind is inferred from the URL's extension.
    pub fn new(source_url: impl Into<String>, site: impl Into<String>) -> Self {
        let source_url = source_url.into();
        let kind = kind_from_url(&source_url);
        Self {
            source_url,
            resolved_url: None,
            suggested_filename: None,
            kind,
            expected_size: None,
            site: site.into(),
            origin_id: None,
            published: None,
        }
    }

    /// Sets the resolved download URL; re-infers kind if it was unknown.
    #[must_use]
    pub fn with_resolved_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        if self.kind == MediaKind::Other {
            self.kind = kind_from_url(&url);
        }
        self.resolved_url = Some(url);
        self
    }

    /// Sets the suggested filename; re-infers kind if it was unknown.
    #[must_use]
    pub fn with_filename(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if self.kind == MediaKind::Other {
            self.kind = MediaKind::from_filename(&name);
        }
        self.suggested_filename = Some(name);
        self
    }

    /// Overrides the inferred kind.
    #[must_use]
    pub fn with_kind(mut self, kind: MediaKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the expected size in bytes.
    #[must_use]
    pub fn with_expected_size(mut self, bytes: u64) -> Self {
        self.expected_size = Some(bytes);
        self
    }

    /// Sets the origin post/profile identifier.
    #[must_use]
    pub fn with_origin_id(mut self, id: impl Into<String>) -> Self {
        self.origin_id = Some(id.into());
        self
    }

    /// Sets the publication date.
    #[must_use]
    pub fn with_published(mut self, date: impl Into<String>) -> Self {
        self.published = Some(date.into());
        self
    }

    /// The URL actually fetched: the resolved URL when present, else the source.
    #[must_use]
    pub fn download_url(&self) -> &str {
        self.resolved_url.as_deref().unwrap_or(&self.source_url)
    }
}

fn kind_from_url(url: &str) -> MediaKind {
    match url::Url::parse(url) {
        Ok(parsed) => MediaKind::from_filename(parsed.path()),
        Err(_) => MediaKind::from_filename(url),
    }
}
