//! Dedup key derivation from resolved download URLs.

use sha2::{Digest, Sha256};
use url::Url;

/// Query parameters that never change what a URL points at.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "ref", "ref_src", "igshid", "mc_cid", "mc_eid",
];

/// Returns the canonical form of `raw`, or `None` if it does not parse.
///
/// Scheme and host are lower-cased and the default port dropped by the
/// URL parser; on top of that the fragment is removed, tracking parameters
/// (`utm_*` plus [`TRACKING_PARAMS`]) are stripped, and the remaining query
/// pairs are sorted.
#[must_use]
pub fn canonicalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !is_tracking_param(name))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    Some(url.to_string())
}

fn is_tracking_param(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.starts_with("utm_") || TRACKING_PARAMS.contains(&name.as_str())
}

/// Stable dedup key: lowercase hex SHA-256 of the canonical URL.
///
/// Unparseable input is hashed as trimmed text so that it still has a key;
/// the transfer itself will fail with an invalid-URL error.
#[must_use]
pub fn dedup_key(resolved_url: &str) -> String {
    let canonical = canonicalize_url(resolved_url).unwrap_or_else(|| resolved_url.trim().to_string());
    hex_encode(&Sha256::digest(canonical.as_bytes()))
}

/// Lowercase hex encoding.
#[must_use]
pub fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_lowercases_scheme_and_host() {
        assert_eq!(
            canonicalize_url("HTTPS://CDN.Example.COM/Media/A.jpg").unwrap(),
            "https://cdn.example.com/Media/A.jpg"
        );
    }

    #[test]
    fn test_canonicalize_drops_default_port_and_fragment() {
        assert_eq!(
            canonicalize_url("https://example.com:443/a.jpg#frag").unwrap(),
            "https://example.com/a.jpg"
        );
        assert_eq!(
            canonicalize_url("http://example.com:8080/a.jpg").unwrap(),
            "http://example.com:8080/a.jpg"
        );
    }

    #[test]
    fn test_canonicalize_strips_tracking_and_sorts_query() {
        assert_eq!(
            canonicalize_url("https://example.com/v.mp4?z=1&utm_source=x&a=2&fbclid=abc&UTM_Medium=y")
                .unwrap(),
            "https://example.com/v.mp4?a=2&z=1"
        );
        assert_eq!(
            canonicalize_url("https://example.com/v.mp4?utm_campaign=q").unwrap(),
            "https://example.com/v.mp4"
        );
    }

    #[test]
    fn test_dedup_key_equal_for_equivalent_urls() {
        let a = dedup_key("https://Example.com:443/a.jpg?b=2&a=1&ref=home");
        let b = dedup_key("https://example.com/a.jpg?a=1&b=2#top");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_dedup_key_differs_for_different_paths() {
        assert_ne!(
            dedup_key("https://example.com/a.jpg"),
            dedup_key("https://example.com/b.jpg")
        );
    }

    #[test]
    fn test_dedup_key_for_unparseable_input() {
        assert_eq!(dedup_key(" not a url "), dedup_key("not a url"));
    }

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode(&[1_u8, 255_u8, 16_u8]), "01ff10");
    }
}
