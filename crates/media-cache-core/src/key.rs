//! Structured cache keys.
//!
//! A request names a remote reference plus the variant it wants. The pair
//! serializes deterministically to `full:<reference>` or `thumb:<reference>`,
//! which is the string stored as canonical and alias keys. Thumbnail and full
//! variants live in separate namespaces and are never aliased to each other.

use crate::config::PathsConfig;
use crate::error::{MediaCacheError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

const FULL_PREFIX: &str = "full";
const THUMB_PREFIX: &str = "thumb";
const LOCAL_REFERENCE_PREFIX: &str = "local/";

/// Which rendition of a remote object is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Full,
    Thumbnail,
}

impl Variant {
    pub fn from_thumbnail_flag(is_thumbnail: bool) -> Self {
        if is_thumbnail {
            Variant::Thumbnail
        } else {
            Variant::Full
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Full => FULL_PREFIX,
            Variant::Thumbnail => THUMB_PREFIX,
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            FULL_PREFIX => Some(Variant::Full),
            THUMB_PREFIX => Some(Variant::Thumbnail),
            _ => None,
        }
    }
}

/// What a stored entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Thumbnail,
    FullFile,
    UserLocal,
}

impl EntryKind {
    /// Dedup namespace of this kind.
    pub fn variant(&self) -> Variant {
        match self {
            EntryKind::Thumbnail => Variant::Thumbnail,
            EntryKind::FullFile | EntryKind::UserLocal => Variant::Full,
        }
    }

    /// Kind recorded for a completed download of `variant`.
    pub fn for_download(variant: Variant) -> Self {
        match variant {
            Variant::Thumbnail => EntryKind::Thumbnail,
            Variant::Full => EntryKind::FullFile,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Thumbnail => "thumbnail",
            EntryKind::FullFile => "full_file",
            EntryKind::UserLocal => "user_local",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "thumbnail" => Some(EntryKind::Thumbnail),
            "full_file" => Some(EntryKind::FullFile),
            "user_local" => Some(EntryKind::UserLocal),
            _ => None,
        }
    }
}

/// A `{ reference, variant }` request key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    reference: String,
    variant: Variant,
}

impl CacheKey {
    /// Build a key, rejecting empty references and `.` or `..` segments.
    pub fn new(reference: impl Into<String>, variant: Variant) -> Result<Self> {
        let reference = reference.into();
        if reference.trim().is_empty() {
            return Err(MediaCacheError::invalid_argument(
                "reference",
                "remote reference must not be empty",
            ));
        }
        if reference.split('/').any(|segment| segment == "." || segment == "..") {
            return Err(MediaCacheError::invalid_argument(
                "reference",
                format!("relative path segment in {}", reference),
            ));
        }
        Ok(Self { reference, variant })
    }

    /// Fresh key for a user-registered local file.
    pub fn local(variant: Variant) -> Self {
        Self {
            reference: format!("{}{}", LOCAL_REFERENCE_PREFIX, uuid::Uuid::new_v4()),
            variant,
        }
    }

    /// Parse the serialized form produced by [`CacheKey::as_storage_key`].
    pub fn parse(serialized: &str) -> Result<Self> {
        let (prefix, reference) = serialized.split_once(':').ok_or_else(|| {
            MediaCacheError::invalid_argument("key", format!("missing variant prefix: {serialized}"))
        })?;
        let variant = Variant::from_prefix(prefix).ok_or_else(|| {
            MediaCacheError::invalid_argument("key", format!("unknown variant prefix: {prefix}"))
        })?;
        Self::new(reference, variant)
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// Deterministic string form used by the metadata store.
    pub fn as_storage_key(&self) -> String {
        format!("{}:{}", self.variant.as_str(), self.reference)
    }

    /// File extension implied by the reference, falling back to `display_name`.
    pub fn extension_hint(&self, display_name: Option<&str>) -> Option<String> {
        sanitize_extension(Path::new(&self.reference).extension().and_then(|e| e.to_str()))
            .or_else(|| {
                display_name.and_then(|name| {
                    sanitize_extension(Path::new(name).extension().and_then(|e| e.to_str()))
                })
            })
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.variant.as_str(), self.reference)
    }
}

/// Normalize an extension to lowercase ASCII alphanumerics, or drop it.
pub fn sanitize_extension(ext: Option<&str>) -> Option<String> {
    let ext = ext?.trim_start_matches('.');
    if ext.is_empty()
        || ext.len() > PathsConfig::MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Deterministic file name for content with `hash` in `variant`'s namespace.
pub fn content_file_name(hash: &str, variant: Variant, extension: Option<&str>) -> String {
    let mut name = hash.to_string();
    if variant == Variant::Thumbnail {
        name.push_str(".thumb");
    }
    if let Some(ext) = extension {
        name.push('.');
        name.push_str(ext);
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_serialization() {
        let full = CacheKey::new("x/y.jpg", Variant::Full).unwrap();
        let thumb = CacheKey::new("x/y.jpg", Variant::Thumbnail).unwrap();

        assert_eq!(full.as_storage_key(), "full:x/y.jpg");
        assert_eq!(thumb.as_storage_key(), "thumb:x/y.jpg");
        assert_ne!(full.as_storage_key(), thumb.as_storage_key());
        assert_eq!(full.to_string(), full.as_storage_key());
    }

    #[test]
    fn test_parse_inverts_serialization() {
        let key = CacheKey::new("media/2024:01/clip.mp4", Variant::Thumbnail).unwrap();
        let parsed = CacheKey::parse(&key.as_storage_key()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_parse_rejects_unknown_prefix() {
        assert!(CacheKey::parse("preview:x/y.jpg").is_err());
        assert!(CacheKey::parse("no-prefix").is_err());
    }

    #[test]
    fn test_empty_reference_is_invalid_argument() {
        let err = CacheKey::new("  ", Variant::Full).unwrap_err();
        assert!(matches!(err, MediaCacheError::InvalidArgument { .. }));
    }

    #[test]
    fn test_dot_segments_are_invalid_argument() {
        for reference in ["a/../b.jpg", "../b.jpg", "a/./b.jpg", ".."] {
            let err = CacheKey::new(reference, Variant::Full).unwrap_err();
            assert!(matches!(err, MediaCacheError::InvalidArgument { .. }), "{reference}");
        }
        assert!(CacheKey::new("a/..b/c.d.jpg", Variant::Full).is_ok());
        assert!(CacheKey::parse("thumb:a/../b.jpg").is_err());
    }

    #[test]
    fn test_local_keys_are_unique() {
        let a = CacheKey::local(Variant::Full);
        let b = CacheKey::local(Variant::Full);
        assert_ne!(a, b);
        assert!(a.as_storage_key().starts_with("full:local/"));
    }

    #[test]
    fn test_extension_hint() {
        let key = CacheKey::new("photos/IMG_01.JPG", Variant::Full).unwrap();
        assert_eq!(key.extension_hint(None).as_deref(), Some("jpg"));

        let opaque = CacheKey::new("blobs/8c1f0a", Variant::Full).unwrap();
        assert_eq!(opaque.extension_hint(Some("holiday.mp4")).as_deref(), Some("mp4"));
        assert_eq!(opaque.extension_hint(None), None);
    }

    #[test]
    fn test_sanitize_extension_rejects_odd_values() {
        assert_eq!(sanitize_extension(Some("tar.gz")), None);
        assert_eq!(sanitize_extension(Some("averyveryverylongext")), None);
        assert_eq!(sanitize_extension(Some(".PNG")).as_deref(), Some("png"));
    }

    #[test]
    fn test_content_file_name() {
        assert_eq!(content_file_name("abc", Variant::Full, Some("jpg")), "abc.jpg");
        assert_eq!(
            content_file_name("abc", Variant::Thumbnail, Some("jpg")),
            "abc.thumb.jpg"
        );
        assert_eq!(content_file_name("abc", Variant::Full, None), "abc");
    }

    #[test]
    fn test_kind_variants() {
        assert_eq!(EntryKind::Thumbnail.variant(), Variant::Thumbnail);
        assert_eq!(EntryKind::UserLocal.variant(), Variant::Full);
        assert_eq!(EntryKind::for_download(Variant::Full), EntryKind::FullFile);
        assert_eq!(EntryKind::from_str("user_local"), Some(EntryKind::UserLocal));
    }
}
