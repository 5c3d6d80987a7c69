//! HLS pre- and post-processing.
//!
//! The pre-processor turns media playlists into the item's segment graph
//! (one segment per `#EXTINF` entry, one per distinct `#EXT-X-KEY` URI) and
//! writes a local playlist whose entries point at the segment files on
//! disk; the post-processor hands that playlist to the external muxer.
//!
//! Master manifests are re-fetched before each session because media URLs
//! on most CDNs are short-lived.

use crate::error::{DownpourError, Result};
use crate::item::{join_url, DownloadItem, HlsKey, Segment};
use crate::muxer::Muxer;
use downpour_types::{MediaKind, SubType};
use reqwest::Client;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A media-playlist entry: one transferable segment.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistEntry {
    pub duration: f64,
    pub url: String,
    pub key: Option<HlsKey>,
}

/// Parsed media playlist with the tags needed to write it back out.
#[derive(Debug, Clone, Default)]
pub struct MediaManifest {
    pub version: Option<String>,
    pub playlist_type: Option<String>,
    pub target_duration: Option<String>,
    pub media_sequence: Option<String>,
    pub entries: Vec<PlaylistEntry>,
    pub encrypted: bool,
}

/// Extract `KEY=value` attributes from a tag line; values may be quoted.
pub fn parse_attributes(line: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let body = match line.find(':') {
        Some(i) => &line[i + 1..],
        None => return attrs,
    };

    let mut rest = body;
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim_matches(',').trim().to_string();
        let after = &rest[eq + 1..];
        let (value, remainder) = if let Some(stripped) = after.strip_prefix('"') {
            match stripped.find('"') {
                Some(end) => (stripped[..end].to_string(), &stripped[end + 1..]),
                None => (stripped.to_string(), ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (after[..end].to_string(), &after[end..]),
                None => (after.to_string(), ""),
            }
        };
        if !key.is_empty() {
            attrs.insert(key, value);
        }
        rest = remainder;
    }
    attrs
}

/// `skd://` key URIs are fetchable over https.
fn rewrite_key_scheme(url: &str) -> String {
    match url.strip_prefix("skd://") {
        Some(rest) => format!("https://{rest}"),
        None => url.to_string(),
    }
}

/// Parse a media playlist, carrying the current `#EXT-X-KEY` forward onto
/// each following entry by value-copy.
pub fn parse_media_manifest(doc: &str, playlist_url: &str) -> MediaManifest {
    let lines: Vec<&str> = doc.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

    let mut manifest = MediaManifest::default();
    let mut current_key: Option<HlsKey> = None;
    let mut duration = 0.0f64;

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];

        if let Some(value) = line.strip_prefix("#EXT-X-VERSION:") {
            manifest.version = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("#EXT-X-PLAYLIST-TYPE:") {
            manifest.playlist_type = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            manifest.target_duration = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            manifest.media_sequence = Some(value.to_string());
        } else if line.starts_with("#EXT-X-KEY") {
            let attrs = parse_attributes(line);
            if let (Some(method), Some(uri)) = (attrs.get("METHOD"), attrs.get("URI")) {
                let url = join_url(playlist_url, &rewrite_key_scheme(uri));
                current_key = Some(HlsKey {
                    method: method.clone(),
                    url,
                    iv: attrs.get("IV").cloned(),
                });
                manifest.encrypted = true;
            }
        } else if let Some(value) = line.strip_prefix("#EXTINF:") {
            duration = value
                .split(',')
                .next()
                .and_then(|d| d.parse().ok())
                .unwrap_or(0.0);

            // the EXTINF tag must be followed by the stream url
            if let Some(next) = lines.get(i + 1) {
                if !next.starts_with('#') {
                    let url = join_url(playlist_url, &rewrite_key_scheme(next));
                    manifest.entries.push(PlaylistEntry {
                        duration,
                        url,
                        key: current_key.clone(),
                    });
                }
            }
        } else if line.starts_with("#EXT-X-ENDLIST") {
            break;
        }
        i += 1;
    }

    manifest
}

/// SAMPLE-AES cannot be decrypted by the downstream muxer; such playlists
/// are fatal before any transfer starts.
pub fn check_supported(doc: &str) -> Result<()> {
    if doc.contains("#EXT-X-KEY:METHOD=SAMPLE-AES") {
        return Err(DownpourError::Unsupported(
            "SAMPLE-AES encryption is not supported".into(),
        ));
    }
    Ok(())
}

/// Fetch a playlist document, verifying it actually is one.
pub async fn download_m3u8(client: &Client, url: &str) -> Result<String> {
    let response = client.get(url).send().await?;
    let text = response.text().await?;
    if text.contains("#EXT") {
        Ok(text)
    } else {
        Err(DownpourError::Manifest(format!(
            "received invalid m3u8 file from {url}"
        )))
    }
}

/// Re-pick stream URLs from a refreshed master manifest using the item's
/// resolver-assigned format ids.
fn refresh_urls(item: &DownloadItem, master_doc: &str, master_url: &str) {
    let master = match m3u8_rs::parse_master_playlist_res(master_doc.as_bytes()) {
        Ok(master) => master,
        Err(e) => {
            warn!("cannot parse master manifest: {e:?}");
            return;
        }
    };

    if let Some(format_id) = &item.format_id {
        for variant in &master.variants {
            let bandwidth = variant.bandwidth.to_string();
            if format_id.contains(&bandwidth) {
                let url = join_url(master_url, &variant.uri);
                debug!("refreshed video url from master manifest");
                *item.eff_url.write() = url;
                break;
            }
        }
    }

    if let Some(audio_format_id) = &item.audio_format_id {
        for media in &master.alternatives {
            let matched = audio_format_id.contains(&media.group_id)
                || audio_format_id.contains(&media.name);
            if matched {
                if let Some(uri) = &media.uri {
                    debug!("refreshed audio url from master manifest");
                    *item.audio_url.write() = Some(join_url(master_url, uri));
                    break;
                }
            }
        }
    }
}

fn seg_file_name(kind: MediaKind, index: usize) -> String {
    let prefix = match kind {
        MediaKind::Audio => "audio",
        _ => "video",
    };
    format!("{prefix}_seg_{}.ts", index + 1)
}

/// Build the item's segments from one parsed media playlist and write its
/// local playlist. Key segments are deduplicated by URI.
fn build_stream_segments(
    item: &DownloadItem,
    manifest: &MediaManifest,
    kind: MediaKind,
    index_base: usize,
) -> Vec<Arc<Segment>> {
    let temp_folder = item.temp_folder();
    let temp_target = if kind == MediaKind::Audio {
        item.audio_file()
    } else {
        item.temp_file()
    };
    // encrypted streams are assembled by the muxer, not spliced by the
    // file manager
    let merge = !item.has_subtype(SubType::Encrypted);

    let mut segments: Vec<Arc<Segment>> = Vec::new();
    let mut key_paths: HashMap<String, PathBuf> = HashMap::new();

    for (i, entry) in manifest.entries.iter().enumerate() {
        if let Some(key) = &entry.key {
            if !key_paths.contains_key(&key.url) {
                let path = temp_folder.join(format!(
                    "{}_key_{}.key",
                    seg_file_name(kind, i).trim_end_matches(".ts"),
                    key_paths.len() + 1
                ));
                key_paths.insert(key.url.clone(), path.clone());

                let mut key_seg = Segment::new(
                    index_base + segments.len(),
                    path,
                    key.url.clone(),
                    None,
                    temp_target.clone(),
                    MediaKind::Key,
                );
                key_seg.merge = false;
                segments.push(Arc::new(key_seg));
            }
        }

        let mut seg = Segment::new(
            index_base + segments.len(),
            temp_folder.join(seg_file_name(kind, i)),
            entry.url.clone(),
            None,
            temp_target.clone(),
            kind,
        );
        seg.merge = merge;
        seg.duration = Some(entry.duration);
        seg.key = entry.key.clone();
        segments.push(Arc::new(seg));
    }

    segments
}

/// Serialize a manifest; `local` maps entries and keys to the on-disk
/// segment files instead of their source urls.
fn write_manifest(
    manifest: &MediaManifest,
    segments: &[Arc<Segment>],
    local: bool,
) -> String {
    let mut lines = vec!["#EXTM3U".to_string()];
    if let Some(version) = &manifest.version {
        lines.push(format!("#EXT-X-VERSION:{version}"));
    }
    if let Some(playlist_type) = &manifest.playlist_type {
        lines.push(format!("#EXT-X-PLAYLIST-TYPE:{playlist_type}"));
    }
    if let Some(target) = &manifest.target_duration {
        lines.push(format!("#EXT-X-TARGETDURATION:{target}"));
    }
    if let Some(sequence) = &manifest.media_sequence {
        lines.push(format!("#EXT-X-MEDIA-SEQUENCE:{sequence}"));
    }

    // key URI -> local key-file path, from the deduplicated key segments
    let key_paths: HashMap<&str, &PathBuf> = segments
        .iter()
        .filter(|seg| seg.media_kind == MediaKind::Key)
        .map(|seg| (seg.url.as_str(), &seg.path))
        .collect();

    let mut last_key: Option<&HlsKey> = None;
    for seg in segments {
        if seg.media_kind == MediaKind::Key {
            continue;
        }
        if seg.key.as_ref() != last_key {
            if let Some(key) = &seg.key {
                let uri = if local {
                    key_paths
                        .get(key.url.as_str())
                        .map(|p| p.to_string_lossy().replace('\\', "/"))
                        .unwrap_or_else(|| key.url.clone())
                } else {
                    key.url.clone()
                };
                let mut line = format!("#EXT-X-KEY:METHOD={},URI=\"{uri}\"", key.method);
                if let Some(iv) = &key.iv {
                    line.push_str(&format!(",IV={iv}"));
                }
                lines.push(line);
            }
            last_key = seg.key.as_ref();
        }

        lines.push(format!("#EXTINF:{},", seg.duration.unwrap_or(0.0)));
        if local {
            lines.push(seg.path.to_string_lossy().replace('\\', "/"));
        } else {
            lines.push(seg.url.clone());
        }
    }

    lines.push("#EXT-X-ENDLIST".to_string());
    lines.join("\n")
}

/// Parse manifests into the item's segment graph and write the local
/// playlists the muxer will assemble from.
pub async fn pre_process_hls(client: &Client, item: &Arc<DownloadItem>) -> Result<()> {
    info!("pre_process_hls: start processing {}", item.name);

    let temp_folder = item.temp_folder();
    tokio::fs::create_dir_all(&temp_folder)
        .await
        .map_err(|e| DownpourError::Destination {
            path: temp_folder.clone(),
            cause: e.to_string(),
        })?;

    // media URLs are short-lived: refresh them from the master manifest
    if let Some(manifest_url) = &item.manifest_url {
        debug!("master manifest: {manifest_url}");
        match download_m3u8(client, manifest_url).await {
            Ok(master_doc) => {
                // kept on disk for debugging
                let _ =
                    tokio::fs::write(temp_folder.join("master.m3u8"), &master_doc).await;

                // only master playlists lack EXT-X-TARGETDURATION; a media
                // playlist here means there is nothing to refresh
                if !master_doc.contains("#EXT-X-TARGETDURATION") {
                    refresh_urls(item, &master_doc, manifest_url);
                }
            }
            Err(e) => warn!("master manifest fetch failed: {e}"),
        }
    }

    let video_url = item.eff_url.read().clone();
    debug!("video m3u8: {video_url}");
    let video_doc = download_m3u8(client, &video_url).await?;

    let audio_doc = if item.has_subtype(SubType::Dash) {
        let audio_url = item
            .audio_url
            .read()
            .clone()
            .ok_or_else(|| DownpourError::Manifest("dash item without audio url".into()))?;
        debug!("audio m3u8: {audio_url}");
        Some((download_m3u8(client, &audio_url).await?, audio_url))
    } else {
        None
    };

    tokio::fs::write(temp_folder.join("remote_video.m3u8"), &video_doc).await?;
    if let Some((doc, _)) = &audio_doc {
        tokio::fs::write(temp_folder.join("remote_audio.m3u8"), doc).await?;
    }

    check_supported(&video_doc)?;
    if let Some((doc, _)) = &audio_doc {
        check_supported(doc)?;
    }

    if video_doc.contains("#EXT-X-KEY") {
        item.add_subtype(SubType::Encrypted);
    }

    let video_manifest = parse_media_manifest(&video_doc, &video_url);
    if video_manifest.entries.is_empty() {
        return Err(DownpourError::Manifest("media playlist has no segments".into()));
    }

    let mut segments = build_stream_segments(item, &video_manifest, MediaKind::Video, 0);
    tokio::fs::write(
        temp_folder.join("local_video.m3u8"),
        write_manifest(&video_manifest, &segments, true),
    )
    .await?;

    if let Some((doc, audio_url)) = &audio_doc {
        let audio_manifest = parse_media_manifest(doc, audio_url);
        let audio_segments =
            build_stream_segments(item, &audio_manifest, MediaKind::Audio, segments.len());
        tokio::fs::write(
            temp_folder.join("local_audio.m3u8"),
            write_manifest(&audio_manifest, &audio_segments, true),
        )
        .await?;
        segments.extend(audio_segments);
    }

    item.total_parts
        .store(segments.len(), std::sync::atomic::Ordering::Release);
    *item.segments.lock() = segments;
    item.invalidate_total_size();

    info!("pre_process_hls: done processing {}", item.name);
    Ok(())
}

/// Assemble the temp media file(s) from the local playlists through the
/// muxer.
pub async fn post_process_hls(muxer: &Muxer, item: &Arc<DownloadItem>) -> Result<()> {
    info!("post_process_hls: start processing {}", item.name);
    let temp_folder = item.temp_folder();

    muxer
        .assemble_playlist(&temp_folder.join("local_video.m3u8"), &item.temp_file(), item)
        .await?;

    if item.has_subtype(SubType::Dash) {
        muxer
            .assemble_playlist(
                &temp_folder.join("local_audio.m3u8"),
                &item.audio_file(),
                item,
            )
            .await?;
    }

    info!("post_process_hls: done processing {}", item.name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYLIST_URL: &str = "https://cdn.example.com/stream/index.m3u8";

    fn encrypted_playlist(entries: usize) -> String {
        let mut doc = String::from(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:0\n\
             #EXT-X-KEY:METHOD=AES-128,URI=\"keys/k1\",IV=0x8f6109d91fffb816bcd43fefe018db49\n",
        );
        for i in 0..entries {
            doc.push_str(&format!("#EXTINF:9.6,\nseg_{i}.ts\n"));
        }
        doc.push_str("#EXT-X-ENDLIST\n");
        doc
    }

    #[test]
    fn attribute_parser_handles_quotes() {
        let attrs = parse_attributes(
            "#EXT-X-KEY:METHOD=AES-128,URI=\"https://k.example.com/key?x=1,2\",IV=0xdead",
        );
        assert_eq!(attrs.get("METHOD").unwrap(), "AES-128");
        assert_eq!(attrs.get("URI").unwrap(), "https://k.example.com/key?x=1,2");
        assert_eq!(attrs.get("IV").unwrap(), "0xdead");
    }

    #[test]
    fn media_parse_carries_key_forward() {
        let manifest = parse_media_manifest(&encrypted_playlist(3), PLAYLIST_URL);
        assert_eq!(manifest.entries.len(), 3);
        assert!(manifest.encrypted);
        for entry in &manifest.entries {
            let key = entry.key.as_ref().unwrap();
            assert_eq!(key.method, "AES-128");
            assert_eq!(key.url, "https://cdn.example.com/stream/keys/k1");
            assert!(key.iv.is_some());
        }
        assert_eq!(
            manifest.entries[0].url,
            "https://cdn.example.com/stream/seg_0.ts"
        );
    }

    #[test]
    fn skd_scheme_is_rewritten() {
        let doc = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n\
                   #EXT-X-KEY:METHOD=AES-128,URI=\"skd://keys.example.com/k\"\n\
                   #EXTINF:4.0,\nseg.ts\n#EXT-X-ENDLIST\n";
        let manifest = parse_media_manifest(doc, PLAYLIST_URL);
        assert_eq!(
            manifest.entries[0].key.as_ref().unwrap().url,
            "https://keys.example.com/k"
        );
    }

    #[test]
    fn sample_aes_is_rejected() {
        let doc = "#EXTM3U\n#EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"k\"\n";
        assert!(matches!(
            check_supported(doc),
            Err(DownpourError::Unsupported(_))
        ));
        assert!(check_supported("#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"k\"\n").is_ok());
    }

    fn hls_item(dir: &std::path::Path) -> Arc<DownloadItem> {
        let mut item = DownloadItem::new("https://cdn.example.com/stream/index.m3u8", "v.mp4", dir);
        item.kind = MediaKind::Video;
        let item = Arc::new(item);
        item.set_subtypes(vec![SubType::Hls]);
        item
    }

    #[test]
    fn segment_graph_dedupes_keys() {
        let dir = tempfile::tempdir().unwrap();
        let item = hls_item(dir.path());
        item.add_subtype(SubType::Encrypted);

        let manifest = parse_media_manifest(&encrypted_playlist(500), PLAYLIST_URL);
        let segments = build_stream_segments(&item, &manifest, MediaKind::Video, 0);

        // 500 media segments + exactly one key segment
        assert_eq!(segments.len(), 501);
        let keys: Vec<_> = segments
            .iter()
            .filter(|s| s.media_kind == MediaKind::Key)
            .collect();
        assert_eq!(keys.len(), 1);
        // encrypted: the muxer assembles, the file manager must not splice
        assert!(segments.iter().all(|s| !s.merge));
        assert!(segments
            .iter()
            .filter(|s| s.media_kind == MediaKind::Video)
            .all(|s| s.range().is_none()));
    }

    #[test]
    fn unencrypted_segments_are_merged_by_file_manager() {
        let dir = tempfile::tempdir().unwrap();
        let item = hls_item(dir.path());
        let doc = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXTINF:9.0,\na.ts\n#EXTINF:9.0,\nb.ts\n#EXT-X-ENDLIST\n";
        let manifest = parse_media_manifest(doc, PLAYLIST_URL);
        let segments = build_stream_segments(&item, &manifest, MediaKind::Video, 0);
        assert_eq!(segments.len(), 2);
        assert!(segments.iter().all(|s| s.merge));
    }

    #[test]
    fn local_manifest_points_at_segment_files() {
        let dir = tempfile::tempdir().unwrap();
        let item = hls_item(dir.path());
        item.add_subtype(SubType::Encrypted);

        let manifest = parse_media_manifest(&encrypted_playlist(2), PLAYLIST_URL);
        let segments = build_stream_segments(&item, &manifest, MediaKind::Video, 0);
        let local = write_manifest(&manifest, &segments, true);

        let media_paths: Vec<_> = segments
            .iter()
            .filter(|s| s.media_kind == MediaKind::Video)
            .map(|s| s.path.to_string_lossy().into_owned())
            .collect();
        for path in &media_paths {
            assert!(local.contains(path), "missing {path} in:\n{local}");
        }
        // the key line is rewritten to the local key file
        let key_seg = segments
            .iter()
            .find(|s| s.media_kind == MediaKind::Key)
            .unwrap();
        assert!(local.contains(&format!("URI=\"{}\"", key_seg.path.to_string_lossy())));
        assert!(local.starts_with("#EXTM3U"));
        assert!(local.ends_with("#EXT-X-ENDLIST"));

        // the remote flavor keeps absolute source urls
        let remote = write_manifest(&manifest, &segments, false);
        assert!(remote.contains("https://cdn.example.com/stream/seg_0.ts"));
    }
}
