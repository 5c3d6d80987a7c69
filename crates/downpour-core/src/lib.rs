//! Downpour core - the download engine
//!
//! Multi-connection range-GET downloads with dynamic error-driven
//! throttling, auto-segmentation, lossless resume through a JSON progress
//! journal, and HLS/DASH assembly via an external muxer.

mod checksum;
mod error;
mod events;
mod hls;
mod item;
mod journal;
mod muxer;
mod naming;
mod probe;
mod resolver;

pub mod engine;

pub use checksum::*;
pub use error::*;
pub use events::*;
pub use hls::{check_supported, download_m3u8, parse_media_manifest, MediaManifest, PlaylistEntry};
pub use item::*;
pub use journal::JournalEntry;
pub use muxer::Muxer;
pub use naming::{auto_rename, uid, validate_file_name};
pub use probe::probe;
pub use resolver::{ResolvedUrls, UrlResolver};

pub use engine::{build_http_client, Engine};
