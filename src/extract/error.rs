//! Error types for media extraction.
//!
//! Extraction failures are discovery failures: they land in the batch report,
//! never in a task's status.

use thiserror::Error;

/// Errors an [`Extractor`](super::Extractor) can produce.
#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    /// No extractor accepts the URL.
    #[error("unsupported URL '{url}'\n  Suggestion: {suggestion}")]
    UnsupportedUrl {
        /// The rejected URL.
        url: String,
        /// How to fix the issue.
        suggestion: String,
    },

    /// The page listing the media could not be fetched.
    #[error("failed to fetch page '{url}': {reason}")]
    PageFetch {
        /// Page URL.
        url: String,
        /// Transport or status description.
        reason: String,
    },

    /// The page was fetched but did not have the expected shape.
    #[error("failed to parse page '{url}': {reason}")]
    Parse {
        /// Page URL.
        url: String,
        /// What was missing or malformed.
        reason: String,
    },
}

impl ExtractError {
    /// Creates an `UnsupportedUrl` error.
    #[must_use]
    pub fn unsupported(url: &str) -> Self {
        Self::UnsupportedUrl {
            url: url.to_string(),
            suggestion: "Pass a direct media link or a page URL from a supported host".to_string(),
        }
    }

    /// Creates a `PageFetch` error.
    #[must_use]
    pub fn page_fetch(url: &str, reason: impl Into<String>) -> Self {
        Self::PageFetch {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    /// Creates a `Parse` error.
    #[must_use]
    pub fn parse(url: &str, reason: impl Into<String>) -> Self {
        Self::Parse {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    /// Snake-case label used in batch reports.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedUrl { .. } => "unsupported_url",
            Self::PageFetch { .. } => "page_fetch",
            Self::Parse { .. } => "parse",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_carries_suggestion() {
        let err = ExtractError::unsupported("ftp://example.com/a");
        let msg = err.to_string();
        assert!(msg.contains("ftp://example.com/a"));
        assert!(msg.contains("Suggestion:"));
        assert_eq!(err.kind(), "unsupported_url");
    }

    #[test]
    fn test_kinds() {
        assert_eq!(ExtractError::page_fetch("u", "404").kind(), "page_fetch");
        assert_eq!(ExtractError::parse("u", "no links").kind(), "parse");
    }
}
