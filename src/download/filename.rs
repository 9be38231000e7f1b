//! Filename derivation, sanitization, and collision handling.
//!
//! A transfer's target name comes from, in order: the item's suggested
//! filename, the URL's last path segment, the Content-Disposition header, and
//! finally `download_<timestamp><ext>` with the extension guessed from
//! Content-Type. [`NamingPolicy`] then decides what to do when that name is
//! already taken in the destination directory.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use url::Url;

use crate::dedup::hex_encode;

/// Upper bound on `name_N.ext` candidates tried before falling back to a timestamp.
const MAX_SEQUENTIAL_SUFFIX: usize = 10_000;

/// Number of hex characters of the content hash used in hash-suffixed names.
const HASH_SUFFIX_LEN: usize = 12;

/// Byte cap on sanitized names, leaving room for collision and `.part`
/// suffixes under the usual 255-byte filesystem limit.
pub const MAX_FILENAME_BYTES: usize = 200;

/// Longest trailing `.ext` kept intact when a name is shortened.
const MAX_KEPT_EXTENSION_BYTES: usize = 16;

/// How to resolve a filename that already exists in the destination directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NamingPolicy {
    /// `name.ext`, then `name_2.ext`, `name_3.ext`, ...
    #[default]
    SequentialSuffix,
    /// `name_<hash12>.ext`; an existing file with identical content is reused.
    ContentHash,
    /// Replace whatever is at `name.ext`.
    Overwrite,
    /// Leave an existing `name.ext` alone and skip the transfer.
    SkipIfExists,
}

impl NamingPolicy {
    /// Returns the kebab-case name used in config files and CLI flags.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SequentialSuffix => "sequential-suffix",
            Self::ContentHash => "content-hash",
            Self::Overwrite => "overwrite",
            Self::SkipIfExists => "skip-if-exists",
        }
    }

    /// Whether this policy needs the content hash to decide.
    #[must_use]
    pub fn needs_content_hash(self) -> bool {
        matches!(self, Self::ContentHash)
    }

    /// Pre-network check: returns the existing file when the skip-if-exists
    /// policy would skip `desired` in `dir`.
    pub async fn existing_to_skip(self, dir: &Path, desired: &str) -> Option<PathBuf> {
        if self != Self::SkipIfExists {
            return None;
        }
        let path = dir.join(safe_filename(desired));
        path_exists(&path).await.then_some(path)
    }

    /// Returns the name to actually use for `desired` inside `dir`.
    ///
    /// `content_hash` is the lowercase hex SHA-256 of the new file; the
    /// content-hash policy falls back to sequential suffixes without it.
    ///
    /// # Errors
    ///
    /// Returns an IO error if an existing file has to be hashed and cannot be read.
    pub async fn resolve(
        self,
        dir: &Path,
        desired: &str,
        content_hash: Option<&str>,
    ) -> std::io::Result<NameResolution> {
        let filename = safe_filename(desired);
        let base_path = dir.join(&filename);

        if !path_exists(&base_path).await {
            return Ok(NameResolution::Write(base_path));
        }

        match self {
            Self::Overwrite => Ok(NameResolution::Write(base_path)),
            Self::SkipIfExists => Ok(NameResolution::SkipExisting(base_path)),
            Self::SequentialSuffix => Ok(NameResolution::Write(
                next_sequential_path(dir, &filename).await,
            )),
            Self::ContentHash => {
                let Some(hash) = content_hash else {
                    return Ok(NameResolution::Write(
                        next_sequential_path(dir, &filename).await,
                    ));
                };
                if hash_file(&base_path).await? == hash {
                    return Ok(NameResolution::ReuseExisting(base_path));
                }

                let (stem, ext) = split_extension(&filename);
                let short = &hash[..hash.len().min(HASH_SUFFIX_LEN)];
                let hashed_name = format!("{stem}_{short}{ext}");
                let hashed_path = dir.join(&hashed_name);
                if !path_exists(&hashed_path).await {
                    return Ok(NameResolution::Write(hashed_path));
                }
                if hash_file(&hashed_path).await? == hash {
                    return Ok(NameResolution::ReuseExisting(hashed_path));
                }
                Ok(NameResolution::Write(
                    next_sequential_path(dir, &hashed_name).await,
                ))
            }
        }
    }
}

impl fmt::Display for NamingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NamingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential-suffix" | "sequential" | "suffix" => Ok(Self::SequentialSuffix),
            "content-hash" | "hash" => Ok(Self::ContentHash),
            "overwrite" => Ok(Self::Overwrite),
            "skip-if-exists" | "skip" => Ok(Self::SkipIfExists),
            other => Err(format!(
                "unknown naming policy '{other}' (expected sequential-suffix, content-hash, overwrite, skip-if-exists)"
            )),
        }
    }
}

/// Outcome of [`NamingPolicy::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameResolution {
    /// Move the new file to this path.
    Write(PathBuf),
    /// An identical file already exists here; discard the new copy.
    ReuseExisting(PathBuf),
    /// The target exists and the policy says to leave it alone.
    SkipExisting(PathBuf),
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn next_sequential_path(dir: &Path, filename: &str) -> PathBuf {
    let (stem, ext) = split_extension(filename);
    for i in 2..MAX_SEQUENTIAL_SUFFIX {
        let candidate = dir.join(format!("{stem}_{i}{ext}"));
        if !path_exists(&candidate).await {
            return candidate;
        }
    }

    dir.join(format!("{stem}_{}{ext}", unix_timestamp()))
}

fn split_extension(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(pos) if pos > 0 => (&filename[..pos], &filename[pos..]),
        _ => (filename, ""),
    }
}

/// SHA-256 of a file on disk, lowercase hex.
///
/// # Errors
///
/// Returns the IO error from opening or reading the file.
pub async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0_u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

/// Guess file extension from Content-Type header.
pub(crate) fn extension_from_content_type(content_type: &str) -> &'static str {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();

    match mime.as_str() {
        "image/jpeg" | "image/jpg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "image/bmp" => ".bmp",
        "image/tiff" => ".tiff",
        "video/mp4" => ".mp4",
        "video/webm" => ".webm",
        "video/quicktime" => ".mov",
        "video/x-matroska" => ".mkv",
        "video/x-msvideo" => ".avi",
        "audio/mpeg" => ".mp3",
        "application/pdf" => ".pdf",
        "application/zip" => ".zip",
        "application/gzip" => ".gz",
        "application/x-7z-compressed" => ".7z",
        "application/vnd.rar" | "application/x-rar-compressed" => ".rar",
        "text/html" => ".html",
        "text/plain" => ".txt",
        "application/json" => ".json",
        _ => ".bin",
    }
}

/// Parses Content-Disposition header to extract filename.
///
/// Handles:
/// - `attachment; filename="example.jpg"`
/// - `attachment; filename=example.jpg`
/// - `attachment; filename*=UTF-8''example.jpg` (RFC 5987)
pub(crate) fn parse_content_disposition(header: &str) -> Option<String> {
    if let Some(pos) = header.find("filename*=") {
        let value = header[pos + 10..].trim();
        // charset'language'encoded_value
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            if let Ok(decoded) = urlencoding::decode(encoded[..end].trim()) {
                return Some(decoded.into_owned());
            }
        }
    }

    if let Some(pos) = header.find("filename=") {
        let value = header[pos + 9..].trim();

        if let Some(stripped) = value.strip_prefix('"') {
            if let Some(end) = stripped.find('"') {
                return Some(stripped[..end].to_string());
            }
        } else {
            let end = value.find(';').unwrap_or(value.len());
            let filename = value[..end].trim();
            if !filename.is_empty() {
                return Some(filename.to_string());
            }
        }
    }

    None
}

/// Replaces path separators, reserved characters, and control characters.
///
/// Replaces characters that are invalid on common filesystems:
/// / \ : * ? " < > |
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    let sanitized = if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    };
    truncate_filename(sanitized, MAX_FILENAME_BYTES)
}

/// Shortens `name` to at most `max` bytes on a char boundary, keeping a short
/// extension.
fn truncate_filename(name: String, max: usize) -> String {
    if name.len() <= max {
        return name;
    }
    let ext = name
        .rfind('.')
        .filter(|&dot| dot > 0 && name.len() - dot <= MAX_KEPT_EXTENSION_BYTES)
        .map_or("", |dot| &name[dot..]);

    let mut end = max - ext.len();
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{ext}", &name[..end])
}

/// Sanitized name guaranteed to be a single, non-empty path segment.
fn safe_filename(name: &str) -> String {
    let sanitized = sanitize_filename(name);
    if sanitized.trim_matches('_').is_empty() {
        "download.bin".to_string()
    } else {
        sanitized
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Percent-decoded, sanitized last path segment of `url`, if it has one.
pub(crate) fn filename_from_url(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    if last.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(last).map_or_else(|_| last.to_string(), |d| d.into_owned());
    Some(sanitize_filename(&decoded))
}

/// `download_<timestamp><ext>` with the extension guessed from Content-Type.
pub(crate) fn timestamp_filename(content_type: Option<&str>) -> String {
    let extension = content_type.map_or(".bin", extension_from_content_type);
    format!("download_{}{extension}", unix_timestamp())
}

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
