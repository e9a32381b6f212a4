use std::fmt;
use std::path::PathBuf;

use url::Url;

use crate::blob::redacted_url;
use crate::error::MediaError;

/// Directory used for media that cannot be attributed to an owning entity.
/// Owner ids may not start with `_`, so it never collides with a real owner.
pub const UNAFFILIATED_DIR: &str = "_unaffiliated";

const MAX_EXTENSION_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MediaType {
    Photo,
    Video,
    Other,
}

impl MediaType {
    pub const ALL: [MediaType; 3] = [MediaType::Photo, MediaType::Video, MediaType::Other];

    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" | "png" | "heic" | "webp" | "gif" => Self::Photo,
            "mp4" | "mov" | "m4v" | "webm" => Self::Video,
            _ => Self::Other,
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Other => "other",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|media| media.dir_name() == name)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Owner {
    Entity(String),
    Unaffiliated,
}

impl Owner {
    pub fn entity(id: &str) -> Result<Self, MediaError> {
        if valid_owner_id(id) {
            Ok(Self::Entity(id.to_string()))
        } else {
            Err(MediaError::malformed(id, "invalid owner id"))
        }
    }

    pub fn dir_name(&self) -> &str {
        match self {
            Self::Entity(id) => id,
            Self::Unaffiliated => UNAFFILIATED_DIR,
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        if name == UNAFFILIATED_DIR {
            Some(Self::Unaffiliated)
        } else if valid_owner_id(name) {
            Some(Self::Entity(name.to_string()))
        } else {
            None
        }
    }

    pub fn as_entity(&self) -> Option<&str> {
        match self {
            Self::Entity(id) => Some(id),
            Self::Unaffiliated => None,
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

pub(crate) fn valid_owner_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('_')
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Location of one cached object: `{media_type}/{owner}/{entry_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    entry_id: String,
    owner: Owner,
    media_type: MediaType,
}

impl CacheKey {
    pub fn new(entry_id: impl Into<String>, owner: Owner, media_type: MediaType) -> Self {
        Self {
            entry_id: entry_id.into(),
            owner,
            media_type,
        }
    }

    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(self.media_type.dir_name())
            .join(self.owner.dir_name())
            .join(&self.entry_id)
    }

    pub(crate) fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = owner;
        self
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.media_type, self.owner, self.entry_id)
    }
}

/// Derives cache keys and owning entities from remote object URLs.
///
/// The entry id is the blake3 digest of the URL without query or fragment,
/// so rotating download tokens map to the same entry. The owner is the
/// second component of the percent-encoded object path held in the last
/// URL segment (`stupas%2F{owner}%2Fphotos%2F1.jpg`).
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyResolver;

impl KeyResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(raw: &str) -> Result<Url, MediaError> {
        let url = Url::parse(raw.trim())
            .map_err(|_| MediaError::malformed(raw, "not an absolute url"))?;
        if url.cannot_be_a_base() || url.host_str().is_none() {
            return Err(MediaError::malformed(raw, "url has no host"));
        }
        Ok(url)
    }

    /// Resolves the key and owner. Fails with `MalformedUrl` when the owner
    /// segment is absent or not a valid entity id.
    pub fn resolve(&self, url: &Url) -> Result<CacheKey, MediaError> {
        let object_path = object_path(url);
        let mut components = object_path.split('/');
        let owner = match (components.next(), components.next(), components.next()) {
            (Some(_prefix), Some(owner), Some(_rest)) => owner,
            _ => return Err(MediaError::malformed(url.as_str(), "missing owner segment")),
        };
        if !valid_owner_id(owner) {
            return Err(MediaError::malformed(url.as_str(), "invalid owner segment"));
        }
        Ok(self
            .unaffiliated_key(url)
            .with_owner(Owner::Entity(owner.to_string())))
    }

    /// Like [`KeyResolver::resolve`], but degrades to the unaffiliated owner.
    pub fn resolve_or_unaffiliated(&self, url: &Url) -> CacheKey {
        match self.resolve(url) {
            Ok(key) => key,
            Err(err) => {
                tracing::debug!(error = %err, "caching media without owner grouping");
                self.unaffiliated_key(url)
            }
        }
    }

    fn unaffiliated_key(&self, url: &Url) -> CacheKey {
        let digest = blake3::hash(redacted_url(url).as_bytes()).to_hex();

        let object_path = object_path(url);
        let file_name = object_path.rsplit('/').next().unwrap_or_default();
        let extension = file_extension(file_name);
        let media_type = extension
            .as_deref()
            .map(MediaType::from_extension)
            .unwrap_or(MediaType::Other);
        let entry_id = match extension {
            Some(ext) => format!("{digest}.{ext}"),
            None => digest.to_string(),
        };
        CacheKey::new(entry_id, Owner::Unaffiliated, media_type)
    }
}

fn object_path(url: &Url) -> String {
    let last_segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    String::from_utf8_lossy(&urlencoding::decode_binary(last_segment.as_bytes())).into_owned()
}

fn file_extension(file_name: &str) -> Option<String> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty()
        || ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.bytes().all(|b| b.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(raw: &str) -> Url {
        KeyResolver::parse(raw).expect("parse test url")
    }

    #[test]
    fn resolution_is_idempotent() {
        let resolver = KeyResolver::new();
        let u = url("https://store/x%2Fabc%2Fphoto1.jpg");
        assert_eq!(resolver.resolve(&u), resolver.resolve(&u));
        assert_eq!(
            resolver.resolve_or_unaffiliated(&u),
            resolver.resolve_or_unaffiliated(&u)
        );
    }

    #[test]
    fn extracts_owner_from_encoded_object_path() {
        let key = KeyResolver::new()
            .resolve(&url("https://store/x%2Fabc%2Fphoto1.jpg"))
            .expect("resolve");
        assert_eq!(key.owner(), &Owner::Entity("abc".to_string()));
        assert_eq!(key.media_type(), MediaType::Photo);
        assert!(key.entry_id().ends_with(".jpg"));
        assert_eq!(key.entry_id().len(), 64 + ".jpg".len());
    }

    #[test]
    fn firebase_download_urls_ignore_token_query() {
        let resolver = KeyResolver::new();
        let a = resolver
            .resolve(&url(
                "https://firebasestorage.googleapis.com/v0/b/app/o/stupas%2Fs1%2Fvideos%2F17.mp4?alt=media&token=aaa",
            ))
            .expect("resolve a");
        let b = resolver
            .resolve(&url(
                "https://firebasestorage.googleapis.com/v0/b/app/o/stupas%2Fs1%2Fvideos%2F17.mp4?alt=media&token=bbb",
            ))
            .expect("resolve b");
        assert_eq!(a, b);
        assert_eq!(a.owner().as_entity(), Some("s1"));
        assert_eq!(a.media_type(), MediaType::Video);
    }

    #[test]
    fn different_objects_get_different_keys() {
        let resolver = KeyResolver::new();
        let a = resolver.resolve_or_unaffiliated(&url("https://store/x%2Fabc%2Fphoto1.jpg"));
        let b = resolver.resolve_or_unaffiliated(&url("https://store/x%2Fabc%2Fphoto2.jpg"));
        let c = resolver.resolve_or_unaffiliated(&url("https://other/x%2Fabc%2Fphoto1.jpg"));
        assert_ne!(a.entry_id(), b.entry_id());
        assert_ne!(a.entry_id(), c.entry_id());
    }

    #[test]
    fn missing_owner_segment_is_malformed_and_degrades() {
        let resolver = KeyResolver::new();
        let u = url("https://cdn.example.com/images/banner.png");
        let err = resolver.resolve(&u).expect_err("no owner");
        assert!(matches!(err, MediaError::MalformedUrl { .. }));

        let key = resolver.resolve_or_unaffiliated(&u);
        assert_eq!(key.owner(), &Owner::Unaffiliated);
        assert_eq!(key.media_type(), MediaType::Photo);
        assert_eq!(
            key.relative_path(),
            PathBuf::from("photo")
                .join(UNAFFILIATED_DIR)
                .join(key.entry_id())
        );
    }

    #[test]
    fn rejects_path_traversal_in_owner() {
        let resolver = KeyResolver::new();
        let u = url("https://store/x%2F..%2Fphoto1.jpg");
        assert!(resolver.resolve(&u).is_err());
        let u = url("https://store/x%2F_hidden%2Fphoto1.jpg");
        assert!(resolver.resolve(&u).is_err());
    }

    #[test]
    fn non_urls_are_malformed() {
        assert!(KeyResolver::parse("not a url").is_err());
        assert!(KeyResolver::parse("mailto:someone@example.com").is_err());
    }

    #[test]
    fn odd_extensions_are_dropped() {
        let key = KeyResolver::new()
            .resolve_or_unaffiliated(&url("https://store/x%2Fabc%2Fclip.tar-gz_backup"));
        assert_eq!(key.entry_id().len(), 64);
        assert_eq!(key.media_type(), MediaType::Other);
    }
}
