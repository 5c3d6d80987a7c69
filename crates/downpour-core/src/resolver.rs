//! Interface to the external URL resolver.
//!
//! Media-site links expire; when an item fails, the engine asks the
//! resolver for fresh effective URLs (up to `refresh_url_retries` times)
//! and restarts the download. The resolver itself (typically a video
//! extractor) lives outside this crate.

use crate::error::Result;
use crate::item::DownloadItem;
use async_trait::async_trait;

/// Fresh URLs for an expired item.
#[derive(Debug, Clone)]
pub struct ResolvedUrls {
    pub eff_url: String,
    pub audio_url: Option<String>,
    pub manifest_url: Option<String>,
}

#[async_trait]
pub trait UrlResolver: Send + Sync {
    /// Re-resolve the item's source and return replacement URLs.
    async fn refresh(&self, item: &DownloadItem) -> Result<ResolvedUrls>;
}
