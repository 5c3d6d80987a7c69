//! File manager: the single consumer that splices completed segments into
//! the item's temp file(s) in the correct order, then finalizes the
//! artifact (rename, mux, subtitles, metadata, checksums) and keeps the
//! progress journal current.

use crate::engine::EngineCtx;
use crate::error::Result;
use crate::item::{DownloadItem, Segment};
use crate::muxer::Muxer;
use crate::{checksum, hls, journal};
use downpour_types::{CoreEvent, MediaKind, Status, SubType};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const MERGE_BUF: usize = 1024 * 1024;
const MAX_MERGE_ERRORS: u32 = 10;

/// Run the merge/finalize loop for one item. Returns when the item reaches
/// a terminal status or the quit channel fires.
pub async fn file_manager(
    item: Arc<DownloadItem>,
    ctx: EngineCtx,
    mut quit_rx: mpsc::Receiver<()>,
) {
    if let Err(e) = prepare_temp_files(&item).await {
        item.fail(format!("cannot prepare temp files: {e}"));
        return;
    }

    let muxer = Muxer::new(ctx.settings.ffmpeg_path.clone());

    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut job_list: Vec<Arc<Segment>> = item
            .segments_snapshot()
            .into_iter()
            .filter(|seg| !seg.is_completed())
            .collect();

        // writing in range order makes contiguous appends possible
        if job_list.iter().any(|seg| seg.range().is_some()) {
            job_list.sort_by_key(|seg| seg.range().map(|r| r.0).unwrap_or(u64::MAX));
        }

        let mut item_failed = false;
        for seg in &job_list {
            if !seg.is_downloaded() {
                if seg.range().is_none() {
                    // a rangeless segment must be appended strictly in list
                    // order; wait for it before touching later ones
                    break;
                } else {
                    continue;
                }
            }

            let merge_errors = seg.merge_errors.load(Ordering::Acquire);
            if merge_errors > MAX_MERGE_ERRORS {
                error!("merge max errors exceeded for {}", seg.basename());
                item.fail(format!("failed to merge segment {}", seg.basename()));
                item_failed = true;
                break;
            } else if merge_errors > 0 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }

            if seg.merge {
                if let Err(e) = merge_segment(seg).await {
                    seg.merge_errors.fetch_add(1, Ordering::AcqRel);
                    warn!(
                        "failed to merge segment {} - {:?} - {e}",
                        seg.basename(),
                        seg.range()
                    );
                    continue;
                }
            }

            seg.completed.store(true, Ordering::Release);
            debug!("completed segment: {}", seg.basename());

            // spliced-in segment bodies are no longer needed, except for
            // HLS where the muxer reads them through the local playlist
            if seg.merge && !item.keep_temp && !item.has_subtype(SubType::Hls) {
                let _ = tokio::fs::remove_file(&seg.path).await;
            }
        }

        if item_failed {
            break;
        }

        if job_list.is_empty() {
            finalize(&item, &ctx, &muxer).await;
            break;
        }

        // persist after every pass so an interrupted process resumes exactly
        if item.temp_folder().is_dir() {
            let _ = journal::save(&item);
        }

        if item.status() != Status::Downloading || quit_rx.try_recv().is_ok() {
            break;
        }
    }

    if item.temp_folder().is_dir() {
        let _ = journal::save(&item);
    }
    debug!("file_manager {}: quitting", item.uid);
}

/// Create the temp folder and an empty file for every distinct temp target,
/// so later open-for-seek-and-write succeeds.
async fn prepare_temp_files(item: &DownloadItem) -> Result<()> {
    tokio::fs::create_dir_all(item.temp_folder()).await?;
    let targets: BTreeSet<PathBuf> = item
        .segments_snapshot()
        .iter()
        .map(|seg| seg.temp_target.clone())
        .collect();
    for target in targets {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&target)
            .await?;
    }
    Ok(())
}

/// Splice one downloaded segment into its temp target.
///
/// The target is opened and closed per segment: keeping it open lets the OS
/// buffer writes, and some platforms then hold a rename lock for up to ~90
/// seconds after the last write.
async fn merge_segment(seg: &Segment) -> std::io::Result<()> {
    match seg.range() {
        Some((start, end)) => {
            let mut target = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&seg.temp_target)
                .await?;
            target.seek(std::io::SeekFrom::Start(start)).await?;

            // read no more than the range length: auto-segmentation can
            // leave extra bytes at the tail of the body file
            let mut remaining = end - start + 1;
            let mut src = File::open(&seg.path).await?;
            let mut buf = vec![0u8; MERGE_BUF];
            while remaining > 0 {
                let want = (remaining as usize).min(buf.len());
                let n = src.read(&mut buf[..want]).await?;
                if n == 0 {
                    break;
                }
                target.write_all(&buf[..n]).await?;
                remaining -= n as u64;
            }
            target.flush().await?;
        }
        None => {
            let mut target = OpenOptions::new()
                .append(true)
                .open(&seg.temp_target)
                .await?;
            let mut src = File::open(&seg.path).await?;
            let mut buf = vec![0u8; MERGE_BUF];
            loop {
                let n = src.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                target.write_all(&buf[..n]).await?;
            }
            target.flush().await?;
        }
    }
    Ok(())
}

/// All segments merged: assemble the final artifact.
async fn finalize(item: &Arc<DownloadItem>, ctx: &EngineCtx, muxer: &Muxer) {
    if item.has_subtype(SubType::Hls) {
        info!("handling hls stream for {}", item.name);
        item.set_status(Status::Processing);
        if let Err(e) = hls::post_process_hls(muxer, item).await {
            if item.status() == Status::Processing {
                item.fail(format!("hls post-processing failed: {e}"));
            }
            return;
        }
    }

    if item.has_subtype(SubType::Dash) {
        info!("merging dash video and audio for {}", item.name);
        item.set_status(Status::Processing);
        match muxer
            .merge_video_audio(&item.temp_file(), &item.audio_file(), &item.target_file(), item)
            .await
        {
            Ok(()) => {
                info!("done merging video and audio for {:?}", item.target_file());
            }
            Err(e) => {
                if item.status() == Status::Processing {
                    item.fail(format!("failed to merge audio: {e}"));
                }
                return;
            }
        }
    }

    if item.kind == MediaKind::Audio {
        info!("converting audio stream for {}", item.name);
        item.set_status(Status::Processing);
        if let Err(e) = muxer
            .convert_audio(&item.temp_file(), &item.target_file(), item)
            .await
        {
            if item.status() == Status::Processing {
                item.fail(format!("audio conversion failed: {e}"));
            }
            return;
        }
        item.delete_tempfiles(false);
    } else if item.target_file().is_file() {
        // target produced by the muxer (dash, hls-encrypted paths)
        item.delete_tempfiles(false);
    } else {
        // the journal is persisted strictly before the commit-point rename
        let _ = journal::save(item);
        match tokio::fs::rename(item.temp_file(), item.target_file()).await {
            Ok(()) => item.delete_tempfiles(false),
            Err(e) => {
                item.fail(format!("cannot rename temp file: {e}"));
                return;
            }
        }
    }

    if !item.selected_subtitles.is_empty() {
        let client = ctx.client.clone();
        let item_cloned = item.clone();
        let muxer_cloned = muxer.clone();
        tokio::spawn(async move {
            download_subtitles(client, item_cloned, muxer_cloned).await;
        });
    }

    if ctx.settings.write_metadata {
        if let Some(content) = &item.metadata {
            if let Err(e) = write_metadata(muxer, item, content).await {
                warn!("writing metadata failed: {e}");
            }
        }
    }

    if ctx.settings.use_server_timestamp {
        apply_server_timestamp(item);
    }

    if ctx.settings.checksum {
        let target = item.target_file();
        let digests =
            tokio::task::spawn_blocking(move || checksum::file_md5_sha256(&target)).await;
        if let Ok(Ok((md5, sha256))) = digests {
            *item.md5.lock() = Some(md5);
            *item.sha256.lock() = Some(sha256);
        }
    }

    item.set_status(Status::Completed);
    if let Some(tx) = item.events() {
        let size = std::fs::metadata(item.target_file())
            .map(|m| m.len())
            .unwrap_or(0);
        let _ = tx.send(CoreEvent::Completed {
            uid: item.uid.clone(),
            path: item.target_file(),
            size,
            md5: item.md5.lock().clone(),
            sha256: item.sha256.lock().clone(),
        });
    }
}

/// Fetch each selected subtitle next to the target file; `srt` requests
/// backed by a `vtt` source are converted through the muxer.
async fn download_subtitles(client: reqwest::Client, item: Arc<DownloadItem>, muxer: Muxer) {
    for (lang, sub) in &item.selected_subtitles {
        let stem = item.target_file().with_extension("");
        let out = PathBuf::from(format!("{}_{}.{}", stem.display(), lang, sub.ext));

        let body = match client.get(&sub.url).send().await {
            Ok(resp) => match resp.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("subtitle {lang}: body error: {e}");
                    continue;
                }
            },
            Err(e) => {
                warn!("subtitle {lang}: request error: {e}");
                continue;
            }
        };
        if tokio::fs::write(&out, &body).await.is_err() {
            continue;
        }

        if sub.ext == "vtt" {
            // the caller asked for srt: convert and replace
            let srt = out.with_extension("srt");
            if muxer.convert_subtitle(&out, &srt, &item).await.is_ok() {
                let _ = tokio::fs::remove_file(&out).await;
            }
        }
        info!("downloaded subtitle: {:?}", out);
    }
}

/// Write the metadata sidecar, re-mux it into the target, then drop the
/// sidecar.
async fn write_metadata(muxer: &Muxer, item: &Arc<DownloadItem>, content: &str) -> Result<()> {
    let sidecar = PathBuf::from(format!("{}.meta", item.target_file().display()));
    tokio::fs::write(&sidecar, content).await?;
    let result = muxer.write_metadata(&item.target_file(), &sidecar, item).await;
    let _ = tokio::fs::remove_file(&sidecar).await;
    result
}

/// Set the target's mtime to the server's Last-Modified.
fn apply_server_timestamp(item: &DownloadItem) {
    let Some(last_modified) = item.last_modified.read().clone() else {
        return;
    };
    let Ok(when) = chrono::DateTime::parse_from_rfc2822(&last_modified) else {
        return;
    };
    let mtime = std::time::UNIX_EPOCH + Duration::from_secs(when.timestamp().max(0) as u64);
    if let Ok(file) = std::fs::File::options().write(true).open(item.target_file()) {
        let times = std::fs::FileTimes::new().set_modified(mtime);
        let _ = file.set_times(times);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn make_item(dir: &std::path::Path, size: u64, seg_size: u64) -> Arc<DownloadItem> {
        let mut item = DownloadItem::new("http://e.com/f.bin", "f.bin", dir);
        item.resumable = true;
        item.size.store(size, Ordering::Release);
        item.segment_size = seg_size;
        let item = Arc::new(item);
        item.build_segments();
        item
    }

    #[tokio::test]
    async fn ranged_merge_reassembles_source_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let item = make_item(dir.path(), 300, 100);
        std::fs::create_dir_all(item.temp_folder()).unwrap();
        prepare_temp_files(&item).await.unwrap();

        let source: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        let segments = item.segments_snapshot();
        assert_eq!(segments.len(), 3);

        // merge out of order: ranges make seeks land each byte exactly once
        for seg in [&segments[2], &segments[0], &segments[1]] {
            let (a, b) = seg.range().unwrap();
            std::fs::write(&seg.path, &source[a as usize..=b as usize]).unwrap();
            merge_segment(seg).await.unwrap();
            seg.completed.store(true, Ordering::Release);
        }

        let merged = std::fs::read(item.temp_file()).unwrap();
        assert_eq!(merged, source);
    }

    #[tokio::test]
    async fn merge_strips_server_overread() {
        let dir = tempfile::tempdir().unwrap();
        let item = make_item(dir.path(), 200, 100);
        std::fs::create_dir_all(item.temp_folder()).unwrap();
        prepare_temp_files(&item).await.unwrap();

        let segments = item.segments_snapshot();
        // body carries 30 extra bytes beyond its range, as after a split
        let mut body = vec![7u8; 100];
        body.extend_from_slice(&[9u8; 30]);
        std::fs::write(&segments[0].path, &body).unwrap();
        std::fs::write(&segments[1].path, vec![8u8; 100]).unwrap();

        merge_segment(&segments[0]).await.unwrap();
        merge_segment(&segments[1]).await.unwrap();

        let merged = std::fs::read(item.temp_file()).unwrap();
        assert_eq!(merged.len(), 200);
        assert!(merged[..100].iter().all(|&b| b == 7));
        assert!(merged[100..].iter().all(|&b| b == 8));
    }

    #[tokio::test]
    async fn rangeless_merge_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let item = Arc::new(DownloadItem::new("http://e.com/f.ts", "f.ts", dir.path()));
        std::fs::create_dir_all(item.temp_folder()).unwrap();
        {
            let mut segments = item.segments.lock();
            for i in 0..3usize {
                segments.push(Arc::new(Segment::new(
                    i,
                    item.temp_folder().join(i.to_string()),
                    "http://e.com/f.ts".into(),
                    None,
                    item.temp_file(),
                    MediaKind::Video,
                )));
            }
        }
        prepare_temp_files(&item).await.unwrap();

        for (i, seg) in item.segments_snapshot().iter().enumerate() {
            std::fs::write(&seg.path, vec![i as u8; 10]).unwrap();
            merge_segment(seg).await.unwrap();
        }

        let merged = std::fs::read(item.temp_file()).unwrap();
        assert_eq!(merged.len(), 30);
        assert!(merged[..10].iter().all(|&b| b == 0));
        assert!(merged[10..20].iter().all(|&b| b == 1));
        assert!(merged[20..].iter().all(|&b| b == 2));
    }
}
