//! The progress journal: a JSON document under the item's temp folder,
//! rewritten after every file-manager tick. It is the single source of truth
//! for resume.
//!
//! The filename is `progress_info.txt` for compatibility with temp folders
//! written by earlier releases; the contents are JSON.

use crate::error::{DownpourError, Result};
use crate::item::{DownloadItem, Segment};
use downpour_types::{MediaKind, Status, SubType};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One persisted segment descriptor. Field names match the historical
/// on-disk format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub name: PathBuf,
    pub downloaded: bool,
    pub completed: bool,
    pub size: u64,
    #[serde(rename = "_range")]
    pub range: Option<(u64, u64)>,
    pub media_type: MediaKind,
}

impl JournalEntry {
    fn from_segment(seg: &Segment) -> Self {
        Self {
            name: seg.path.clone(),
            downloaded: seg.is_downloaded(),
            completed: seg.is_completed(),
            size: seg.size(),
            range: seg.range(),
            media_type: seg.media_kind,
        }
    }
}

/// Overwrite the journal atomically: write a sibling temp file, then rename
/// over the old journal.
pub fn save(item: &DownloadItem) -> Result<()> {
    let entries: Vec<JournalEntry> = item
        .segments_snapshot()
        .iter()
        .map(|seg| JournalEntry::from_segment(seg))
        .collect();

    let path = item.journal_file();
    let tmp = path.with_extension("txt.tmp");
    let data = serde_json::to_vec(&entries)
        .map_err(|e| DownpourError::Journal(e.to_string()))?;
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

/// Load the journal and fold it into the item's segment list.
///
/// `downloaded` and `completed` are set strictly from the on-disk byte count
/// matching the recorded size; for ranged resumable items the segment list
/// itself is reconstructed from the journal, since auto-segmentation may
/// have produced a different plan than the initial one.
pub fn load(item: &DownloadItem) -> Result<()> {
    // the target may already exist from a finished run that was interrupted
    // between rename and status flip
    let target = item.target_file();
    if item.status() != Status::Completed && target.is_file() {
        let size = std::fs::metadata(&target)?.len();
        if size > 0 {
            info!("target already on disk, reporting completed: {:?}", target);
            item.size.store(size, Ordering::Release);
            item.downloaded.store(size, Ordering::Release);
            item.set_status(Status::Completed);
            item.delete_tempfiles(false);
            return Ok(());
        }
    }

    let path = item.journal_file();
    if !path.is_file() {
        return Ok(());
    }

    let data = std::fs::read(&path)?;
    let entries: Vec<JournalEntry> = match serde_json::from_slice(&data) {
        Ok(entries) => entries,
        Err(e) => {
            // a malformed or unknown-typed journal is discarded, not guessed at
            warn!("ignoring unreadable progress journal {:?}: {}", path, e);
            return Err(DownpourError::Journal(e.to_string()));
        }
    };

    // verify each recorded segment against the bytes actually on disk
    let mut verified: Vec<JournalEntry> = Vec::with_capacity(entries.len());
    let mut downloaded_total = 0u64;
    for mut entry in entries {
        entry.downloaded = false;
        entry.completed = false;
        if let Ok(meta) = std::fs::metadata(&entry.name) {
            let on_disk = meta.len();
            downloaded_total += on_disk;
            if on_disk > 0 && on_disk == entry.size {
                entry.downloaded = true;
            }
        }
        verified.push(entry);
    }

    let dynamic_plan = item.size.load(Ordering::Acquire) > 0
        && item.resumable
        && item.fragments.is_none()
        && !item.has_subtype(SubType::Hls);

    if dynamic_plan {
        // auto-segmentation may have split the plan: rebuild from the journal
        let temp_file = item.temp_file();
        let audio_file = item.audio_file();
        let eff_url = item.eff_url.read().clone();
        let audio_url = item.audio_url.read().clone();

        let mut segments: Vec<Arc<Segment>> = Vec::with_capacity(verified.len());
        for (i, entry) in verified.iter().enumerate() {
            let (url, temp_target) = if entry.media_type == MediaKind::Audio {
                (
                    audio_url.clone().unwrap_or_else(|| eff_url.clone()),
                    audio_file.clone(),
                )
            } else {
                (eff_url.clone(), temp_file.clone())
            };
            let seg = Segment::new(
                i,
                entry.name.clone(),
                url,
                entry.range,
                temp_target,
                entry.media_type,
            );
            if entry.size > 0 {
                seg.set_size(entry.size);
            }
            seg.downloaded.store(entry.downloaded, Ordering::Release);
            segments.push(Arc::new(seg));
        }
        info!(
            "rebuilt {} segments from previous download for {}",
            segments.len(),
            item.name
        );
        item.total_parts.store(segments.len(), Ordering::Release);
        *item.segments.lock() = segments;
        item.invalidate_total_size();
    } else {
        // fixed plan: update the current segments in place
        let segments = item.segments_snapshot();
        for (seg, entry) in segments.iter().zip(verified.iter()) {
            if seg.path == entry.name {
                if entry.size > 0 && seg.size() == 0 {
                    seg.set_size(entry.size);
                }
                seg.downloaded.store(entry.downloaded, Ordering::Release);
            }
        }
        debug!("updated current segments from journal for {}", item.name);
    }

    item.downloaded.store(downloaded_total, Ordering::Release);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn ranged_item(dir: &std::path::Path) -> DownloadItem {
        let mut item = DownloadItem::new("http://example.com/f.bin", "f.bin", dir);
        item.resumable = true;
        item.size.store(250_000, Ordering::Release);
        item.segment_size = 100_000;
        item
    }

    #[test]
    fn round_trip_preserves_segment_state() {
        let dir = tempfile::tempdir().unwrap();
        let item = ranged_item(dir.path());
        item.build_segments();
        std::fs::create_dir_all(item.temp_folder()).unwrap();

        // simulate a fully transferred first segment
        let segments = item.segments_snapshot();
        std::fs::write(&segments[0].path, vec![0u8; 100_000]).unwrap();
        segments[0].downloaded.store(true, Ordering::Release);

        save(&item).unwrap();

        let data = std::fs::read(item.journal_file()).unwrap();
        let loaded: Vec<JournalEntry> = serde_json::from_slice(&data).unwrap();
        let saved: Vec<JournalEntry> = segments
            .iter()
            .map(|s| JournalEntry::from_segment(s))
            .collect();
        assert_eq!(loaded, saved);
    }

    #[test]
    fn load_rebuilds_dynamic_plan_and_counts_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let item = ranged_item(dir.path());
        item.build_segments();
        std::fs::create_dir_all(item.temp_folder()).unwrap();

        let segments = item.segments_snapshot();
        std::fs::write(&segments[0].path, vec![0u8; 100_000]).unwrap();
        std::fs::write(&segments[1].path, vec![0u8; 40_000]).unwrap(); // partial
        segments[0].downloaded.store(true, Ordering::Release);
        save(&item).unwrap();

        // fresh item, as after a process restart
        let resumed = ranged_item(dir.path());
        resumed.build_segments();
        load(&resumed).unwrap();

        let segs = resumed.segments_snapshot();
        assert_eq!(segs.len(), 3);
        assert!(segs[0].is_downloaded());
        assert!(!segs[1].is_downloaded());
        assert_eq!(resumed.downloaded.load(Ordering::Acquire), 140_000);
        assert_eq!(segs[1].range(), Some((100_000, 199_999)));
    }

    #[test]
    fn load_rejects_unknown_media_kind() {
        let dir = tempfile::tempdir().unwrap();
        let item = ranged_item(dir.path());
        item.build_segments();
        std::fs::create_dir_all(item.temp_folder()).unwrap();
        std::fs::write(
            item.journal_file(),
            br#"[{"name":"/tmp/x","downloaded":false,"completed":false,"size":10,"_range":null,"media_type":"hologram"}]"#,
        )
        .unwrap();

        assert!(matches!(load(&item), Err(DownpourError::Journal(_))));
    }

    #[test]
    fn journal_write_is_atomic_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let item = ranged_item(dir.path());
        item.build_segments();
        std::fs::create_dir_all(item.temp_folder()).unwrap();

        save(&item).unwrap();
        save(&item).unwrap(); // second write replaces, no tmp left behind
        assert!(item.journal_file().is_file());
        assert!(!item.journal_file().with_extension("txt.tmp").exists());
    }
}
