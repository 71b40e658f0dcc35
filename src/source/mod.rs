//! Item fetchers and normalizers, one implementation per xkcd surface.
//!
//! A `Source` knows how to find the newest id, fetch one item's raw payload,
//! and turn that payload into an `ItemRecord`. It holds no sync state; the
//! watermark and the outstanding set belong to `crate::sync`.
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use std::path::{Path, PathBuf};

use crate::error::{DiscoveryError, ItemError};
use crate::model::{ItemRecord, SourceKind};
use crate::transport::{Payload, Session};

pub mod comics;
pub mod whatif;

pub use comics::Comics;
pub use whatif::Whatif;

#[async_trait]
pub trait Source: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Reserved id that never resolves to content.
    fn sentinel(&self) -> Option<i64> {
        None
    }

    fn is_sentinel(&self, id: i64) -> bool {
        self.sentinel() == Some(id)
    }

    /// Current maximum id published by the site.
    async fn latest_id(&self, session: &Session) -> Result<i64, DiscoveryError>;

    /// Raw payload for a single id. Sentinel ids fail without a request.
    async fn fetch(&self, session: &Session, id: i64) -> Result<Payload, ItemError>;

    /// Validate `raw` and build the canonical record. Media lands under
    /// `media_dir` following [`media_path`].
    fn normalize(&self, id: i64, raw: Payload, media_dir: &Path) -> Result<ItemRecord, ItemError>;
}

static EXTENSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9]{1,8}$").expect("valid extension pattern"));

/// Lowercased extension of the URL's last path segment, or `bin`.
pub fn media_extension(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.last())
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| EXTENSION.is_match(ext))
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| "bin".to_string())
}

/// `{media_dir}/{last digit of id}/{id}.{ext}`: at most ten buckets however
/// many items exist.
pub fn media_path(media_dir: &Path, id: i64, ext: &str) -> PathBuf {
    media_dir
        .join(id.rem_euclid(10).to_string())
        .join(format!("{id}.{ext}"))
}

/// Join a possibly relative reference onto `base`.
pub(crate) fn resolve_url(base: &Url, reference: &str) -> Option<Url> {
    let reference = reference.trim();
    if reference.is_empty() {
        return None;
    }
    // Protocol-relative links like `//imgs.xkcd.com/..` are handled by join.
    base.join(reference).ok()
}
