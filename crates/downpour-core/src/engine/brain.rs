//! Brain: the per-item supervisor. Seeds segments, loads the journal,
//! spawns the file manager, the thread manager, and the progress
//! reporters, then waits for a terminal status and tears everything down.

use crate::engine::{file_manager, thread_manager, EngineCtx};
use crate::item::DownloadItem;
use crate::{hls, journal};
use downpour_types::{CoreEvent, MediaKind, Status, SubType};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Drive one item to a terminal status (completed, cancelled, or error).
pub async fn brain(item: Arc<DownloadItem>, ctx: EngineCtx) {
    if item.status().is_active() {
        debug!("another brain may be running for {}", item.uid);
        return;
    }
    item.attach_events(ctx.events.clone());
    item.set_status(Status::Downloading);

    // protocols the downstream muxer cannot handle fail before any transfer
    if item.has_subtype(SubType::F4m) || item.has_subtype(SubType::Ism) {
        item.fail("unsupported stream protocol (f4m/ism)");
        return;
    }

    // the file manager appends rangeless segments blindly, so residual temp
    // bodies from a broken run must go first
    let _ = tokio::fs::remove_file(item.temp_file()).await;
    let _ = tokio::fs::remove_file(item.audio_file()).await;
    item.downloaded.store(0, Ordering::Release);
    item.set_speed_refresh_rate(ctx.settings.speed_refresh_rate);

    info!(
        "start downloading \"{}\", size: {}, to: {:?}",
        item.name,
        item.total_size(),
        item.folder
    );

    if item.has_subtype(SubType::Hls) {
        if let Err(e) = hls::pre_process_hls(&ctx.client, &item).await {
            item.fail(format!("hls pre-processing failed: {e}"));
            return;
        }
    } else {
        item.build_segments();
    }

    // resume state; a stale or unreadable journal just means a fresh start
    match journal::load(&item) {
        Ok(()) => {}
        Err(e) => warn!("journal not used for {}: {e}", item.name),
    }
    if item.status() == Status::Completed {
        return;
    }

    let (fm_quit_tx, fm_quit_rx) = mpsc::channel::<()>(1);
    let (tm_quit_tx, tm_quit_rx) = mpsc::channel::<()>(1);
    let (spr_quit_tx, spr_quit_rx) = mpsc::channel::<()>(1);
    let (fpr_quit_tx, fpr_quit_rx) = mpsc::channel::<()>(1);

    let mut handles = Vec::new();
    handles.push(tokio::spawn(file_manager(
        item.clone(),
        ctx.clone(),
        fm_quit_rx,
    )));
    handles.push(tokio::spawn(thread_manager(
        item.clone(),
        ctx.clone(),
        tm_quit_rx,
    )));
    handles.push(tokio::spawn(segment_progress_reporter(
        item.clone(),
        spr_quit_rx,
    )));
    if item.kind == MediaKind::Video {
        handles.push(tokio::spawn(media_progress_reporter(
            item.clone(),
            fpr_quit_rx,
        )));
    }

    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if !item.status().is_active() {
            debug!("file {}", item.status());
            break;
        }
    }

    // a zero-byte artifact means nothing was actually downloaded
    let target = item.target_file();
    if target.is_file() {
        if let Ok(meta) = std::fs::metadata(&target) {
            if meta.len() == 0 {
                warn!("nothing downloaded, file size is zero: {}", item.name);
                item.fail("downloaded file is empty");
                let _ = std::fs::remove_file(&target);
            }
        }
    }

    for quit in [fm_quit_tx, tm_quit_tx, spr_quit_tx, fpr_quit_tx] {
        let _ = quit.try_send(());
    }
    for handle in handles {
        let _ = handle.await;
    }

    debug!("brain {}: quitting", item.uid);
}

/// Publish overall and per-segment progress once a second.
async fn segment_progress_reporter(item: Arc<DownloadItem>, mut quit_rx: mpsc::Receiver<()>) {
    loop {
        if let Some(tx) = item.events() {
            let _ = tx.send(CoreEvent::Progress {
                uid: item.uid.clone(),
                downloaded: item.downloaded.load(Ordering::Acquire),
                total: item.total_size(),
                speed: item.speed(),
                eta: item.eta(),
                live_connections: item.live_connections.load(Ordering::Acquire),
            });

            // report active segments only; completed ones stopped moving
            for seg in item.segments_snapshot() {
                if seg.is_locked() {
                    let _ = tx.send(CoreEvent::SegmentProgress {
                        uid: item.uid.clone(),
                        index: seg.index,
                        downloaded: seg.down_bytes.load(Ordering::Acquire),
                    });
                }
            }
        }

        if !item.status().is_active() || quit_rx.try_recv().is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Publish temp/audio/merged media-file completion once a second for video
/// items.
async fn media_progress_reporter(item: Arc<DownloadItem>, mut quit_rx: mpsc::Receiver<()>) {
    fn percent(path: &std::path::Path, full: u64) -> f64 {
        if full == 0 {
            return 0.0;
        }
        let current = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        ((current as f64 * 100.0 / full as f64) * 100.0).round() / 100.0
    }

    loop {
        if let Some(tx) = item.events() {
            let (video, audio, merge) = if item.status() == Status::Completed {
                (100.0, 100.0, 100.0)
            } else {
                let video = percent(&item.temp_file(), item.video_size()).min(100.0);
                let audio = if item.has_subtype(SubType::Normal) {
                    video
                } else {
                    percent(
                        &item.audio_file(),
                        item.audio_size.load(Ordering::Acquire),
                    )
                    .min(100.0)
                };
                let merge = percent(&item.target_file(), item.total_size()).min(100.0);
                (video, audio, merge)
            };
            let _ = tx.send(CoreEvent::MediaProgress {
                uid: item.uid.clone(),
                video,
                audio,
                merge,
            });
        }

        if !item.status().is_active() || quit_rx.try_recv().is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
