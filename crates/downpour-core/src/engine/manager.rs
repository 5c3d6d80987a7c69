//! Engine facade: builds the shared HTTP client, owns the global pending
//! queue, applies the name-collision policy, and retries expired URLs
//! through the external resolver.

use crate::engine::{brain, EngineCtx, HotSettings};
use crate::error::{DownpourError, Result};
use crate::events::{forward_events, EventSink};
use crate::item::DownloadItem;
use crate::naming;
use crate::resolver::UrlResolver;
use downpour_types::{CollisionPolicy, CoreEvent, LinkInfo, Settings, Status};
use parking_lot::RwLock;
use reqwest::{header, Client};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

/// Build the HTTP client every transfer goes through.
///
/// `Accept-Encoding: *;q=0` forbids compressed transfer encoding so byte
/// ranges align with logical offsets.
pub fn build_http_client(settings: &Settings) -> Result<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::ACCEPT_ENCODING,
        header::HeaderValue::from_static("*;q=0"),
    );
    if let Some(cookie_file) = &settings.http.cookie_file {
        if let Some(cookie) = cookie_header_from_file(cookie_file) {
            if let Ok(value) = header::HeaderValue::from_str(&cookie) {
                headers.insert(header::COOKIE, value);
            }
        }
    }

    let mut builder = Client::builder()
        .user_agent(settings.http.user_agent().to_string())
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(10))
        .connect_timeout(Duration::from_secs(10))
        .danger_accept_invalid_certs(!settings.verify_ssl);

    if let Some(proxy) = &settings.proxy {
        if !proxy.is_valid_scheme() {
            return Err(DownpourError::InvalidUrl(format!(
                "unsupported proxy scheme: {}",
                proxy.url
            )));
        }
        builder = builder.proxy(
            reqwest::Proxy::all(&proxy.url)
                .map_err(|e| DownpourError::InvalidUrl(format!("invalid proxy: {e}")))?,
        );
    }

    Ok(builder.build()?)
}

/// Flatten a Netscape-format cookie jar into a `Cookie` header value.
fn cookie_header_from_file(path: &Path) -> Option<String> {
    let data = std::fs::read_to_string(path).ok()?;
    let mut pairs = Vec::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() >= 7 {
            pairs.push(format!("{}={}", fields[5], fields[6]));
        }
    }
    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join("; "))
    }
}

/// The engine: add items, they queue globally and start as slots free up.
pub struct Engine {
    ctx: EngineCtx,
    items: Arc<RwLock<HashMap<String, Arc<DownloadItem>>>>,
    pending_tx: mpsc::UnboundedSender<Arc<DownloadItem>>,
    resolver: Option<Arc<dyn UrlResolver>>,
}

impl Engine {
    pub fn new(settings: Settings) -> Result<Self> {
        Self::with_resolver(settings, None)
    }

    pub fn with_resolver(
        settings: Settings,
        resolver: Option<Arc<dyn UrlResolver>>,
    ) -> Result<Self> {
        let client = build_http_client(&settings)?;
        let (events, _) = broadcast::channel(1024);
        let ctx = EngineCtx {
            client,
            hot: Arc::new(HotSettings::from_settings(&settings)),
            settings: Arc::new(settings),
            events,
        };

        let items: Arc<RwLock<HashMap<String, Arc<DownloadItem>>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();

        tokio::spawn(service_pending_queue(
            pending_rx,
            ctx.clone(),
            items.clone(),
            resolver.clone(),
        ));

        Ok(Self {
            ctx,
            items,
            pending_tx,
            resolver,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.ctx.settings
    }

    pub fn hot(&self) -> &HotSettings {
        &self.ctx.hot
    }

    pub fn client(&self) -> &Client {
        &self.ctx.client
    }

    /// Subscribe to the engine's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.ctx.events.subscribe()
    }

    /// Install a sink; a forwarder task batches events into it.
    pub fn install_sink(&self, sink: Arc<dyn EventSink>) {
        tokio::spawn(forward_events(self.ctx.events.subscribe(), sink));
    }

    /// Probe a URL for name, size, and resumability.
    pub async fn probe(&self, url: &str) -> Result<LinkInfo> {
        crate::probe::probe(&self.ctx.client, url, self.ctx.settings.segment_size).await
    }

    /// Validate the destination, apply the collision policy, and put the
    /// item on the global pending queue.
    pub fn add(&self, mut item: DownloadItem, policy: CollisionPolicy) -> Result<Arc<DownloadItem>> {
        std::fs::create_dir_all(&item.folder).map_err(|e| DownpourError::Destination {
            path: item.folder.clone(),
            cause: e.to_string(),
        })?;

        let target = item.target_file();
        if target.exists() {
            match policy {
                CollisionPolicy::Overwrite => {
                    std::fs::remove_file(&target)?;
                }
                CollisionPolicy::Rename => {
                    let existing: Vec<String> = std::fs::read_dir(&item.folder)
                        .map(|entries| {
                            entries
                                .filter_map(|e| e.ok())
                                .map(|e| e.file_name().to_string_lossy().into_owned())
                                .collect()
                        })
                        .unwrap_or_default();
                    let new_name = naming::auto_rename(&item.name, &existing);
                    info!("target exists, renaming to {new_name}");
                    item.rename(&new_name);
                }
                CollisionPolicy::Cancel => {
                    return Err(DownpourError::TargetExists(target));
                }
            }
        }

        item.keep_temp = self.ctx.settings.keep_temp;
        if let Some(temp_dir) = &self.ctx.settings.temp_dir {
            if temp_dir.is_dir() {
                item.temp_base = temp_dir.clone();
            }
        }
        item.segment_size = self.ctx.settings.segment_size;
        if item.http.user_agent.is_none() {
            item.http = self.ctx.settings.http.clone();
        }

        let item = Arc::new(item);
        item.attach_events(self.ctx.events.clone());
        self.items.write().insert(item.uid.clone(), item.clone());

        item.set_status(Status::Scheduled);
        self.pending_tx
            .send(item.clone())
            .map_err(|_| DownpourError::InvalidOperation("engine is shut down".into()))?;
        Ok(item)
    }

    pub fn item(&self, uid: &str) -> Option<Arc<DownloadItem>> {
        self.items.read().get(uid).cloned()
    }

    pub fn items(&self) -> Vec<Arc<DownloadItem>> {
        self.items.read().values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.items
            .read()
            .values()
            .filter(|item| item.status().is_active())
            .count()
    }

    /// Stop an item. Its workers observe the status flip within a poll
    /// cycle; segment files stay on disk for a later resume.
    pub fn cancel(&self, uid: &str) {
        if let Some(item) = self.item(uid) {
            item.set_status(Status::Cancelled);
        }
    }

    /// Remove an item from the engine, optionally erasing its artifact.
    pub fn remove(&self, uid: &str, delete_file: bool) {
        self.cancel(uid);
        if let Some(item) = self.items.write().remove(uid) {
            item.delete_tempfiles(true);
            if delete_file {
                let _ = std::fs::remove_file(item.target_file());
            }
        }
    }

    /// Resolver installed at construction, if any.
    pub fn resolver(&self) -> Option<Arc<dyn UrlResolver>> {
        self.resolver.clone()
    }
}

/// One task services the queue, starting items while slots are free.
async fn service_pending_queue(
    mut pending_rx: mpsc::UnboundedReceiver<Arc<DownloadItem>>,
    ctx: EngineCtx,
    items: Arc<RwLock<HashMap<String, Arc<DownloadItem>>>>,
    resolver: Option<Arc<dyn UrlResolver>>,
) {
    while let Some(item) = pending_rx.recv().await {
        if item.status() == Status::Cancelled {
            continue;
        }

        loop {
            let active = items
                .read()
                .values()
                .filter(|i| i.status().is_active())
                .count();
            if active < ctx.settings.max_concurrent_downloads {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let ctx = ctx.clone();
        let resolver = resolver.clone();
        tokio::spawn(run_item(item, ctx, resolver));
    }
}

/// Run the brain, then retry through the resolver while the item keeps
/// failing on an expired URL.
async fn run_item(
    item: Arc<DownloadItem>,
    ctx: EngineCtx,
    resolver: Option<Arc<dyn UrlResolver>>,
) {
    brain(item.clone(), ctx.clone()).await;

    let mut attempts = 0;
    while item.status() == Status::Error && attempts < ctx.settings.refresh_url_retries {
        let Some(resolver) = &resolver else { break };
        attempts += 1;
        info!(
            "refreshing expired url for {} (attempt {attempts})",
            item.name
        );
        item.set_status(Status::RefreshingUrl);
        match resolver.refresh(&item).await {
            Ok(urls) => {
                *item.eff_url.write() = urls.eff_url;
                *item.audio_url.write() = urls.audio_url;
                item.set_status(Status::Pending);
                brain(item.clone(), ctx.clone()).await;
            }
            Err(e) => {
                warn!("url refresh failed for {}: {e}", item.name);
                item.set_status(Status::Error);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_jar_flattens_to_header() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("cookies.txt");
        std::fs::write(
            &jar,
            "# Netscape HTTP Cookie File\n\
             .example.com\tTRUE\t/\tFALSE\t0\tsession\tabc123\n\
             .example.com\tTRUE\t/\tFALSE\t0\ttoken\txyz\n",
        )
        .unwrap();
        assert_eq!(
            cookie_header_from_file(&jar).unwrap(),
            "session=abc123; token=xyz"
        );
        assert!(cookie_header_from_file(&dir.path().join("missing")).is_none());
    }

    #[tokio::test]
    async fn add_applies_rename_policy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("video.mp4"), b"x").unwrap();
        std::fs::write(dir.path().join("video_2.mp4"), b"x").unwrap();

        let mut settings = Settings::default();
        settings.download_dir = dir.path().to_path_buf();
        let engine = Engine::new(settings).unwrap();

        let item = DownloadItem::new("http://e.com/video.mp4", "video.mp4", dir.path());
        let old_uid = item.uid.clone();
        let added = engine.add(item, CollisionPolicy::Rename).unwrap();

        assert_eq!(added.name, "video_3.mp4");
        assert_ne!(added.uid, old_uid);
        // neither prior file was touched
        assert!(dir.path().join("video.mp4").exists());
        assert!(dir.path().join("video_2.mp4").exists());
    }

    #[tokio::test]
    async fn add_cancel_policy_refuses_collision() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.bin"), b"x").unwrap();

        let engine = Engine::new(Settings::default()).unwrap();
        let item = DownloadItem::new("http://e.com/f.bin", "f.bin", dir.path());
        let err = engine.add(item, CollisionPolicy::Cancel).unwrap_err();
        assert!(matches!(err, DownpourError::TargetExists(_)));
    }
}
