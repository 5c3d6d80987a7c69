//! Shared types for Downpour
//!
//! This crate contains the plain, serializable data structures used across
//! the engine and the CLI: lifecycle status, media classification, settings,
//! and the event records the engine publishes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Default segment size for ranged downloads: 100 KiB.
pub const SEGMENT_SIZE: u64 = 1024 * 100;

/// User-Agent sent when the caller doesn't supply one.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/74.0.3721.3";

// ============================================================================
// Lifecycle
// ============================================================================

/// Lifecycle state of a download item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Scheduled,
    Downloading,
    RefreshingUrl,
    Processing,
    Completed,
    Cancelled,
    Error,
}

impl Status {
    /// The engine is doing work and the item must not be re-started.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Status::Downloading | Status::Processing | Status::RefreshingUrl
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Scheduled => "scheduled",
            Status::Downloading => "downloading",
            Status::RefreshingUrl => "refreshing_url",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Cancelled => "cancelled",
            Status::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for Status {
    type Err = String;

    /// Accepts the legacy free-form spellings found in old journals,
    /// compared case-insensitively, and normalizes them.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Status::Pending),
            "scheduled" => Ok(Status::Scheduled),
            "downloading" => Ok(Status::Downloading),
            "refreshing_url" | "refreshing url" => Ok(Status::RefreshingUrl),
            "processing" => Ok(Status::Processing),
            "completed" => Ok(Status::Completed),
            "cancelled" | "canceled" => Ok(Status::Cancelled),
            "error" | "failed" => Ok(Status::Error),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

// ============================================================================
// Media classification
// ============================================================================

/// What a segment (or a whole item) carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    General,
    Video,
    Audio,
    Key,
}

impl<'de> Deserialize<'de> for MediaKind {
    /// Journals written by older versions stored the kind with arbitrary
    /// casing. Unknown values are rejected rather than guessed at.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.to_ascii_lowercase().as_str() {
            "general" => Ok(MediaKind::General),
            "video" => Ok(MediaKind::Video),
            "audio" => Ok(MediaKind::Audio),
            "key" => Ok(MediaKind::Key),
            other => Err(serde::de::Error::custom(format!(
                "unknown media kind: {other}"
            ))),
        }
    }
}

/// Delivery subtype tags. An item can carry several, e.g. `dash` + `hls`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubType {
    Normal,
    Dash,
    Hls,
    Fragmented,
    Encrypted,
    F4m,
    Ism,
}

// ============================================================================
// HTTP / network configuration
// ============================================================================

/// Proxy endpoint. The scheme selects the protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// e.g. `socks5h://127.0.0.1:9050` or `http://proxy:3128`
    pub url: String,
}

impl ProxyConfig {
    pub const SCHEMES: [&'static str; 6] =
        ["http", "https", "socks4", "socks4a", "socks5", "socks5h"];

    pub fn is_valid_scheme(&self) -> bool {
        Self::SCHEMES
            .iter()
            .any(|s| self.url.starts_with(&format!("{s}://")))
    }
}

/// Per-item HTTP options sent with every request.
///
/// `Accept-Encoding: *;q=0` is always added by the engine so byte ranges
/// align with logical offsets; it is not configurable here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpOptions {
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    /// (username, password) for `Authorization: Basic`.
    pub basic_auth: Option<(String, String)>,
    /// Netscape-format cookie jar to load.
    pub cookie_file: Option<PathBuf>,
    /// Extra headers, sent verbatim.
    pub extra: Vec<(String, String)>,
}

impl HttpOptions {
    pub fn user_agent(&self) -> &str {
        self.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT)
    }
}

/// What to do when the target file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Delete the existing file and proceed.
    Overwrite,
    /// Pick `<name>_<n><ext>` with the smallest free n.
    #[default]
    Rename,
    /// Refuse to start.
    Cancel,
}

// ============================================================================
// Settings
// ============================================================================

/// Engine settings, fixed for the lifetime of an item's run.
///
/// `max_connections` and `speed_limit` are also mirrored into a hot atomic
/// snapshot by the engine so they can be adjusted while downloads run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub download_dir: PathBuf,
    /// Optional alternative parent for temp folders; the item's destination
    /// folder is used when unset.
    pub temp_dir: Option<PathBuf>,
    pub max_connections: usize,
    pub max_concurrent_downloads: usize,
    pub segment_size: u64,
    /// Total bytes/sec across an item's workers; 0 = unlimited.
    pub speed_limit: u64,
    pub max_seg_retries: u32,
    /// URL re-resolve attempts after an item fails with an expired link.
    pub refresh_url_retries: u32,
    pub keep_temp: bool,
    pub verify_ssl: bool,
    pub proxy: Option<ProxyConfig>,
    pub http: HttpOptions,
    /// Seconds between speed samples.
    pub speed_refresh_rate: f64,
    /// Compute MD5 + SHA-256 of the final file.
    pub checksum: bool,
    pub write_metadata: bool,
    /// Set the target's mtime to the server's Last-Modified.
    pub use_server_timestamp: bool,
    /// Path of the external muxer binary.
    pub ffmpeg_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            temp_dir: None,
            max_connections: 10,
            max_concurrent_downloads: 3,
            segment_size: SEGMENT_SIZE,
            speed_limit: 0,
            max_seg_retries: 10,
            refresh_url_retries: 1,
            keep_temp: false,
            verify_ssl: true,
            proxy: None,
            http: HttpOptions::default(),
            speed_refresh_rate: 0.5,
            checksum: false,
            write_metadata: true,
            use_server_timestamp: false,
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// State-change records published by the engine.
///
/// Records are immutable snapshots; no engine object identity crosses this
/// boundary. Delivery is via a broadcast channel and, optionally, a batching
/// forwarder task feeding a caller-supplied sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Progress {
        uid: String,
        downloaded: u64,
        total: u64,
        speed: u64,
        eta: Option<u64>,
        live_connections: usize,
    },
    SegmentProgress {
        uid: String,
        index: usize,
        downloaded: u64,
    },
    /// Temp/audio/merged file completion percentages for media items.
    MediaProgress {
        uid: String,
        video: f64,
        audio: f64,
        merge: f64,
    },
    StatusChanged {
        uid: String,
        status: Status,
        error: Option<String>,
    },
    Completed {
        uid: String,
        path: PathBuf,
        size: u64,
        md5: Option<String>,
        sha256: Option<String>,
    },
}

// ============================================================================
// Probe result
// ============================================================================

/// What a URL probe discovered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkInfo {
    pub url: String,
    /// URL after redirects.
    pub eff_url: String,
    pub name: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub resumable: bool,
    pub last_modified: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states() {
        assert!(Status::Downloading.is_active());
        assert!(Status::Processing.is_active());
        assert!(Status::RefreshingUrl.is_active());
        assert!(!Status::Pending.is_active());
        assert!(!Status::Completed.is_active());
        assert!(!Status::Cancelled.is_active());
        assert!(!Status::Error.is_active());
    }

    #[test]
    fn legacy_status_strings_normalize() {
        assert_eq!("Downloading".parse::<Status>().unwrap(), Status::Downloading);
        assert_eq!("CANCELLED".parse::<Status>().unwrap(), Status::Cancelled);
        assert_eq!("canceled".parse::<Status>().unwrap(), Status::Cancelled);
        assert_eq!("failed".parse::<Status>().unwrap(), Status::Error);
        assert!("bogus".parse::<Status>().is_err());
    }

    #[test]
    fn media_kind_load_rejects_unknown() {
        let ok: MediaKind = serde_json::from_str("\"Video\"").unwrap();
        assert_eq!(ok, MediaKind::Video);
        let err: Result<MediaKind, _> = serde_json::from_str("\"subtitle2\"");
        assert!(err.is_err());
    }

    #[test]
    fn proxy_scheme_validation() {
        assert!(ProxyConfig { url: "socks5h://localhost:1080".into() }.is_valid_scheme());
        assert!(ProxyConfig { url: "http://proxy:3128".into() }.is_valid_scheme());
        assert!(!ProxyConfig { url: "ftp://nope:21".into() }.is_valid_scheme());
    }
}
