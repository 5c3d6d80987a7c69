//! Thread manager: keeps at most `allowable_connections` workers
//! transferring, recovers from server errors by cutting concurrency,
//! grows it back gently, and subdivides long in-flight segments when the
//! job list runs dry so idle workers can help finish.

use crate::engine::worker::Worker;
use crate::engine::EngineCtx;
use crate::item::{DownloadItem, Segment};
use crate::journal;
use downpour_types::{MediaKind, Status};
use futures::FutureExt;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

const ERRORS_CHECK_INTERVAL: Duration = Duration::from_millis(200);
const MAX_ERRORS: u64 = 100;
/// Tighter watchdog for the last batch of live workers; prevents a
/// stragglers tail on flaky servers.
const LAST_BATCH_MIN_SPEED: u64 = 20 * 1024;
const LAST_BATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Sort jobs so that popping from the back yields the smallest range start
/// first, with video segments drained before the rest (watch-while-
/// downloading works better when the video stream leads).
fn sort_segs(segs: &mut Vec<Arc<Segment>>) {
    let sort_key = |seg: &Arc<Segment>| seg.range().map(|r| r.0).unwrap_or(seg.index as u64);

    let mut video: Vec<Arc<Segment>> = Vec::new();
    let mut others: Vec<Arc<Segment>> = Vec::new();
    for seg in segs.drain(..) {
        if seg.media_kind == MediaKind::Video {
            video.push(seg);
        } else {
            others.push(seg);
        }
    }
    others.sort_by_key(|s| std::cmp::Reverse(sort_key(s)));
    video.sort_by_key(|s| std::cmp::Reverse(sort_key(s)));

    // video at the end of the list gets popped first
    segs.extend(others);
    segs.extend(video);
}

fn rebuild_job_list(item: &DownloadItem) -> Vec<Arc<Segment>> {
    let mut list: Vec<Arc<Segment>> = item
        .segments_snapshot()
        .into_iter()
        .filter(|seg| !seg.is_downloaded() && !seg.is_locked())
        .collect();
    sort_segs(&mut list);
    list
}

/// Run the scheduling loop for one item until every segment is downloaded,
/// the item leaves `Downloading`, or the quit channel fires.
pub async fn thread_manager(
    item: Arc<DownloadItem>,
    ctx: EngineCtx,
    mut quit_rx: mpsc::Receiver<()>,
) {
    // soft start: connections grow gradually toward the user's maximum so
    // servers limiting multi-connection clients don't reply with errors
    let mut limited_connections: usize = 1;

    let (errors_tx, mut errors_rx) = mpsc::channel::<String>(128);
    let (jobs_tx, mut jobs_rx) = mpsc::channel::<Arc<Segment>>(128);

    let mut free_workers: Vec<Worker> = (0..ctx.hot.max_connections())
        .map(|tag| {
            Worker::new(
                tag,
                ctx.client.clone(),
                item.clone(),
                errors_tx.clone(),
                jobs_tx.clone(),
            )
        })
        .collect();
    let mut pool_size = free_workers.len();
    let mut running: JoinSet<Worker> = JoinSet::new();
    let mut num_live: usize = 0;

    let mut job_list = rebuild_job_list(&item);
    item.remaining_parts.store(job_list.len(), Ordering::Release);

    let mut downloaded: u64 = 0;
    let mut total_errors: u64 = 0;
    let mut errors_descriptions: HashSet<String> = HashSet::new();
    let mut error_timer = Instant::now();
    let mut conn_change_timer = Instant::now();
    let mut conn_increase_interval = Duration::from_millis(500);
    let mut segmentation_timer = Instant::now() - Duration::from_secs(1);

    let sl_timer = Instant::now();

    loop {
        tokio::time::sleep(Duration::from_millis(1)).await;

        // failed jobs returned from workers flag a job-list rebuild
        let mut saw_failed = false;
        while jobs_rx.try_recv().is_ok() {
            saw_failed = true;
        }
        if saw_failed {
            job_list = rebuild_job_list(&item);
        }

        // collect finished transfers, return workers to the free pool
        while let Some(Some(result)) = running.join_next().now_or_never() {
            if let Ok(worker) = result {
                free_workers.push(worker);
            }
        }

        let max_connections = ctx.hot.max_connections();

        // the user may raise max connections mid-download
        if max_connections > pool_size {
            for tag in pool_size..max_connections {
                free_workers.push(Worker::new(
                    tag,
                    ctx.client.clone(),
                    item.clone(),
                    errors_tx.clone(),
                    jobs_tx.clone(),
                ));
            }
            pool_size = max_connections;
        }

        let allowable_connections = max_connections.min(limited_connections);

        // dynamic connection manager ------------------------------------
        if error_timer.elapsed() >= ERRORS_CHECK_INTERVAL {
            error_timer = Instant::now();

            let mut errors_num = 0u64;
            while let Ok(description) = errors_rx.try_recv() {
                errors_descriptions.insert(description);
                errors_num += 1;
            }
            total_errors += errors_num;
            item.errors.store(total_errors, Ordering::Release);

            if total_errors >= 1 && limited_connections > 1 {
                limited_connections -= 1;
                conn_increase_interval += Duration::from_secs(1);
                conn_change_timer = Instant::now();
                debug!(
                    "received server errors ({:?}), connections limited to {}",
                    errors_descriptions, limited_connections
                );
            } else if limited_connections < max_connections
                && conn_change_timer.elapsed() >= conn_increase_interval
            {
                conn_change_timer = Instant::now();
                limited_connections += 1;
                debug!("allowable connections: {limited_connections}");
            }

            // any received data proves the server is serving again
            let current_downloaded = item.downloaded.load(Ordering::Acquire);
            if downloaded != current_downloaded {
                downloaded = current_downloaded;
                total_errors = 0;
            }

            if total_errors >= MAX_ERRORS {
                item.fail(format!(
                    "too many server errors: {:?}",
                    errors_descriptions
                ));
            }
        }

        // per-worker speed limit -----------------------------------------
        // give the dynamic manager time to settle before sharing the limit
        // across fewer connections
        let speed_limit = ctx.hot.speed_limit();
        let worker_sl = if sl_timer.elapsed()
            < ERRORS_CHECK_INTERVAL * max_connections as u32
        {
            speed_limit / max_connections as u64
        } else if allowable_connections > 0 {
            speed_limit / allowable_connections as u64
        } else {
            0
        };

        // lease workers --------------------------------------------------
        if item.status() == Status::Downloading
            && !free_workers.is_empty()
            && num_live < allowable_connections
        {
            let mut seg = job_list.pop();

            if seg.is_none() && segmentation_timer.elapsed() >= Duration::from_secs(1) {
                segmentation_timer = Instant::now();
                seg = auto_segment(&item, num_live, ctx.settings.segment_size);
            }

            if let Some(seg) = seg {
                if !seg.is_downloaded() && !seg.is_locked() {
                    // the download sometimes chokes when only one worker is
                    // left: apply the tighter tail watchdog for the last batch
                    let (minimum_speed, timeout) = if job_list.len() <= allowable_connections {
                        (Some(LAST_BATCH_MIN_SPEED), Some(LAST_BATCH_TIMEOUT))
                    } else {
                        (None, None)
                    };

                    let Some(mut worker) = free_workers.pop() else { continue };
                    if worker.reuse(seg.clone(), worker_sl, minimum_speed, timeout) {
                        if seg.retries.load(Ordering::Acquire) >= ctx.settings.max_seg_retries {
                            warn!(
                                "seg {} exceeded max of {} download retries",
                                seg.basename(),
                                ctx.settings.max_seg_retries
                            );
                            item.fail(format!(
                                "segment {} failed after {} retries",
                                seg.basename(),
                                ctx.settings.max_seg_retries
                            ));
                            seg.release();
                            free_workers.push(worker);
                        } else {
                            seg.retries.fetch_add(1, Ordering::AcqRel);
                            running.spawn(async move {
                                worker.run().await;
                                worker
                            });
                            if item.temp_folder().is_dir() {
                                let _ = journal::save(&item);
                            }
                        }
                    } else {
                        free_workers.push(worker);
                    }
                }
            }
        }

        num_live = pool_size - free_workers.len();
        item.live_connections.store(num_live, Ordering::Release);
        item.remaining_parts
            .store(num_live + job_list.len(), Ordering::Release);

        // exit check: when nothing is running and nothing is queued, make a
        // final sweep for segments that slipped through
        if num_live + job_list.len() == 0 {
            let mut leftovers: Vec<Arc<Segment>> = item
                .segments_snapshot()
                .into_iter()
                .filter(|seg| !seg.is_downloaded())
                .collect();
            if leftovers.is_empty() {
                break;
            }
            // remove orphan locks so the rebuilt list is leaseable
            for seg in &leftovers {
                seg.release();
            }
            sort_segs(&mut leftovers);
            job_list = leftovers;
        }

        if item.status() != Status::Downloading || quit_rx.try_recv().is_ok() {
            break;
        }
    }

    running.abort_all();
    item.live_connections.store(0, Ordering::Release);
    debug!("thread_manager {}: quitting", item.uid);
}

/// When the job list is dry but workers are idle, split the ranged segment
/// with the largest remaining span so another worker can take its tail.
///
/// The minimum split size scales with the per-worker speed so fast
/// connections don't thrash on tiny ranges; at speed 0 it collapses to the
/// configured segment size.
fn auto_segment(
    item: &Arc<DownloadItem>,
    num_live: usize,
    segment_size: u64,
) -> Option<Arc<Segment>> {
    let worker_speed = if num_live > 0 {
        item.speed() / num_live as u64
    } else {
        0
    };
    let min_seg_size = segment_size.max(worker_speed * 6);

    let mut candidates: Vec<Arc<Segment>> = item
        .segments_snapshot()
        .into_iter()
        .filter(|seg| seg.range().is_some() && seg.remaining() > min_seg_size * 2)
        .collect();
    sort_segs(&mut candidates);
    let current = candidates.pop()?;

    let (start, end) = current.range()?;
    let middle = start + current.current_size() + current.remaining() / 2;
    if middle >= end {
        return None;
    }

    // shrink the running segment, hand its tail to a new one
    current.truncate_range_end(middle);

    let (index, new_seg) = {
        let mut segments = item.segments.lock();
        let index = segments.len();
        let seg = Arc::new(Segment::new(
            index,
            item.temp_folder().join(index.to_string()),
            current.url.clone(),
            Some((middle + 1, end)),
            current.temp_target.clone(),
            current.media_kind,
        ));
        segments.push(seg.clone());
        (index, seg)
    };
    item.invalidate_total_size();

    info!(
        "new segment {index}: {:?}, updated seg {} to {:?}, min seg size {min_seg_size}",
        new_seg.range(),
        current.basename(),
        current.range()
    );

    if item.temp_folder().is_dir() {
        let _ = journal::save(item);
    }

    Some(new_seg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn seg(index: usize, range: Option<(u64, u64)>, kind: MediaKind) -> Arc<Segment> {
        Arc::new(Segment::new(
            index,
            PathBuf::from(format!("/tmp/{index}")),
            "http://e.com/f".into(),
            range,
            PathBuf::from("/tmp/t"),
            kind,
        ))
    }

    #[test]
    fn sort_pops_video_smallest_start_first() {
        let mut list = vec![
            seg(0, Some((200, 299)), MediaKind::Audio),
            seg(1, Some((0, 99)), MediaKind::Video),
            seg(2, Some((100, 199)), MediaKind::Video),
            seg(3, Some((0, 99)), MediaKind::Audio),
        ];
        sort_segs(&mut list);

        // popping drains video (ascending start) before audio
        assert_eq!(list.pop().unwrap().range(), Some((0, 99)));
        assert_eq!(list.pop().unwrap().media_kind, MediaKind::Video);
        let next = list.pop().unwrap();
        assert_eq!(next.media_kind, MediaKind::Audio);
        assert_eq!(next.range(), Some((0, 99)));
    }

    #[test]
    fn sort_uses_index_for_rangeless() {
        let mut list = vec![
            seg(2, None, MediaKind::Audio),
            seg(0, None, MediaKind::Audio),
            seg(1, None, MediaKind::Audio),
        ];
        sort_segs(&mut list);
        assert_eq!(list.pop().unwrap().index, 0);
        assert_eq!(list.pop().unwrap().index, 1);
        assert_eq!(list.pop().unwrap().index, 2);
    }

    #[test]
    fn auto_segment_splits_largest_remaining() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = DownloadItem::new("http://e.com/f.bin", "f.bin", dir.path());
        raw.resumable = true;
        raw.size
            .store(10_000_000, std::sync::atomic::Ordering::Release);
        raw.segment_size = 5_000_000;
        let item = Arc::new(raw);
        item.build_segments();

        let before: u64 = item
            .segments_snapshot()
            .iter()
            .map(|s| s.size())
            .sum();

        let new_seg = auto_segment(&item, 0, 100_000).expect("split happens");
        let segments = item.segments_snapshot();
        assert_eq!(segments.len(), 3);

        // union of ranges is unchanged by the split
        let after: u64 = segments.iter().map(|s| s.size()).sum();
        assert_eq!(before, after);

        let (ns, ne) = new_seg.range().unwrap();
        let parent = segments
            .iter()
            .find(|s| s.range().map(|r| r.1) == Some(ns - 1))
            .expect("parent truncated to meet the new segment");
        assert_eq!(parent.range().unwrap().1 + 1, ns);
        assert!(ne == 4_999_999 || ne == 9_999_999);
    }

    #[test]
    fn auto_segment_skips_short_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = DownloadItem::new("http://e.com/f.bin", "f.bin", dir.path());
        raw.resumable = true;
        raw.size.store(150_000, std::sync::atomic::Ordering::Release);
        raw.segment_size = 100_000;
        let item = Arc::new(raw);
        item.build_segments();

        // both segments are under 2 * min_seg_size
        assert!(auto_segment(&item, 0, 100_000).is_none());
        assert_eq!(item.segments_snapshot().len(), 2);
    }
}
