//! Worker: a reusable range-GET executor bound to one segment at a time.
//!
//! A worker streams bytes from the segment's URL into the segment's own
//! file, honoring resume (append with an adjusted range when partial bytes
//! exist), a per-worker speed cap, a minimum-speed watchdog, and the
//! HTML-body abort guard. Workers never raise across task boundaries: they
//! push error descriptions into the scheduler's error channel and either
//! mark the segment downloaded or hand it back to the jobs queue.

use crate::engine::rate_limiter::RateLimiter;
use crate::error::DownpourError;
use crate::item::{DownloadItem, Segment};
use downpour_types::{Status, SubType};
use futures::StreamExt;
use reqwest::{header, Client};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default minimum-speed watchdog: abort when slower than 1 KiB/s for 10 s.
const DEFAULT_MIN_SPEED: u64 = 1024;
const DEFAULT_LOW_SPEED_TIME: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq)]
enum OpenMode {
    Overwrite,
    Append,
}

pub struct Worker {
    pub tag: usize,
    client: Client,
    item: Arc<DownloadItem>,
    errors_tx: mpsc::Sender<String>,
    jobs_tx: mpsc::Sender<Arc<Segment>>,

    seg: Option<Arc<Segment>>,
    limiter: RateLimiter,
    minimum_speed: u64,
    low_speed_time: Duration,
    resume_range: Option<(u64, u64)>,
    mode: OpenMode,
    buffer: u64,
    flush_timer: Instant,
}

impl Worker {
    pub fn new(
        tag: usize,
        client: Client,
        item: Arc<DownloadItem>,
        errors_tx: mpsc::Sender<String>,
        jobs_tx: mpsc::Sender<Arc<Segment>>,
    ) -> Self {
        Self {
            tag,
            client,
            item,
            errors_tx,
            jobs_tx,
            seg: None,
            limiter: RateLimiter::unlimited(),
            minimum_speed: DEFAULT_MIN_SPEED,
            low_speed_time: DEFAULT_LOW_SPEED_TIME,
            resume_range: None,
            mode: OpenMode::Overwrite,
            buffer: 0,
            flush_timer: Instant::now(),
        }
    }

    /// Lease `seg` and arm this worker for one transfer. Returns false when
    /// the segment is already held by another worker.
    pub fn reuse(
        &mut self,
        seg: Arc<Segment>,
        speed_limit: u64,
        minimum_speed: Option<u64>,
        timeout: Option<Duration>,
    ) -> bool {
        if !seg.try_lease() {
            debug!(
                "seg {} in use by another worker - worker {}",
                seg.basename(),
                self.tag
            );
            return false;
        }

        self.reset();
        self.limiter = RateLimiter::new(speed_limit);
        self.minimum_speed = minimum_speed.unwrap_or(DEFAULT_MIN_SPEED);
        self.low_speed_time = timeout.unwrap_or(DEFAULT_LOW_SPEED_TIME);

        debug!(
            "seg {} start, size: {} range: {:?} - worker {}",
            seg.basename(),
            seg.size(),
            seg.range(),
            self.tag
        );

        self.seg = Some(seg);
        self.check_previous_download();
        true
    }

    fn reset(&mut self) {
        self.seg = None;
        self.resume_range = None;
        self.mode = OpenMode::Overwrite;
        self.buffer = 0;
        self.flush_timer = Instant::now();
    }

    /// Decide the open mode and adjusted range from whatever a previous
    /// session left on disk.
    fn check_previous_download(&mut self) {
        let seg = match &self.seg {
            Some(seg) => seg.clone(),
            None => return,
        };

        let current = seg.current_size();
        if current == 0 {
            self.mode = OpenMode::Overwrite;
            return;
        }

        let size = seg.size();
        if size == 0 {
            // unknown size: resume is not possible, start over
            self.report_download(&seg, -(current as i64));
            self.mode = OpenMode::Overwrite;
            debug!(
                "seg {} overwriting previous partial body - worker {}",
                seg.basename(),
                self.tag
            );
            return;
        }

        if current == size {
            debug!("seg {} already completed before - worker {}", seg.basename(), self.tag);
            seg.downloaded.store(true, Ordering::Release);
        } else if current > size {
            // the server sent extra bytes in a past session; trim to size
            debug!(
                "seg {} over-sized ({current} > {size}), truncating - worker {}",
                seg.basename(),
                self.tag
            );
            seg.downloaded.store(true, Ordering::Release);
            self.report_download(&seg, -((current - size) as i64));
            if let Ok(file) = std::fs::OpenOptions::new().write(true).open(&seg.path) {
                let _ = file.set_len(size);
            }
        } else if let Some((a, b)) = seg.range() {
            self.resume_range = Some((a + current, b));
            self.mode = OpenMode::Append;
            debug!(
                "seg {} resuming, new range: {:?}, current size: {current} - worker {}",
                seg.basename(),
                self.resume_range,
                self.tag
            );
        } else {
            self.report_download(&seg, -(current as i64));
            self.mode = OpenMode::Overwrite;
        }
    }

    /// Perform the transfer for the leased segment, then verify, requeue on
    /// shortfall, and release the lock.
    pub async fn run(&mut self) {
        let seg = match self.seg.take() {
            Some(seg) => seg,
            None => return,
        };

        if !seg.is_downloaded() {
            match self.transfer(&seg).await {
                Ok(()) => {}
                Err(DownpourError::Cancelled) => {
                    debug!("seg {} terminated - worker {}", seg.basename(), self.tag);
                }
                Err(e) => {
                    debug!("seg {} - worker {} quitting: {e}", seg.basename(), self.tag);
                    self.report_error(e.to_string());
                }
            }
        }

        // flush whatever the one-second timer hadn't pushed yet
        let leftover = self.buffer;
        self.buffer = 0;
        self.report_download(&seg, leftover as i64);

        if self.verify(&seg) {
            self.report_completed(&seg);
        } else {
            debug!(
                "seg {} did not complete - done {} of {} - worker {}",
                seg.basename(),
                seg.current_size(),
                seg.size(),
                self.tag
            );
            // hand it back for another attempt
            if self.jobs_tx.try_send(seg.clone()).is_err() {
                warn!("jobs queue full, seg {} waits for rebuild", seg.basename());
            }
        }

        seg.release();
    }

    async fn transfer(&mut self, seg: &Arc<Segment>) -> crate::error::Result<()> {
        if seg.url.is_empty() {
            return Err(DownpourError::InvalidUrl("segment has no url".into()));
        }

        if let Some(dir) = seg.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut request = self.client.get(&seg.url);
        if let Some(referer) = &self.item.http.referer {
            request = request.header(header::REFERER, referer.clone());
        }
        if let Some((user, pass)) = &self.item.http.basic_auth {
            request = request.basic_auth(user, Some(pass));
        }
        for (name, value) in &self.item.http.extra {
            request = request.header(name.as_str(), value.as_str());
        }
        let range = self.resume_range.or_else(|| seg.range());
        if let Some((a, b)) = range {
            request = request.header(header::RANGE, format!("bytes={a}-{b}"));
        }

        let response = request.send().await?;

        let code = response.status().as_u16();
        if (400..512).contains(&code) {
            debug!(
                "seg {} server refuse connection {code} - worker {}",
                seg.basename(),
                self.tag
            );
            return Err(DownpourError::Server {
                status: code,
                message: response.status().to_string(),
            });
        }

        // server-size discovery for segments planned without a known size
        if seg.size() == 0 {
            if let Some(len) = response.content_length() {
                if len > 0 {
                    seg.set_size(len);
                    let single = self.item.segments.lock().len() == 1;
                    let plain = !self.item.has_subtype(SubType::Hls)
                        && !self.item.has_subtype(SubType::Fragmented);
                    if single && plain && seg.range().is_none() {
                        // lets later resumes seek instead of starting over
                        seg.set_range(Some((0, len - 1)));
                    }
                }
            }
        }

        let html_content = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("text/html"))
            .unwrap_or(false);

        let mut file = match self.mode {
            OpenMode::Overwrite => {
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&seg.path)
                    .await?
            }
            OpenMode::Append => OpenOptions::new().append(true).open(&seg.path).await?,
        };

        let mut written = match self.mode {
            OpenMode::Append => seg.current_size(),
            OpenMode::Overwrite => 0,
        };
        let mut first_chunk = true;

        let mut window_start = Instant::now();
        let mut window_bytes = 0u64;

        let mut stream = response.bytes_stream();
        loop {
            // the status flip is the kill switch: cancellation, errors
            // elsewhere, and pauses all land here
            if self.item.status() != Status::Downloading {
                return Err(DownpourError::Cancelled);
            }

            let chunk =
                match tokio::time::timeout(Duration::from_millis(500), stream.next()).await {
                    Err(_) => {
                        self.check_watchdog(&mut window_start, &mut window_bytes)?;
                        continue;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => return Err(DownpourError::Network(e)),
                    Ok(Some(Ok(chunk))) => chunk,
                };

            if first_chunk && html_content && !self.item.accept_html {
                // some sites serve an HTML error page with status 200; a
                // real key or media body never opens with a document tag
                let head = String::from_utf8_lossy(&chunk[..chunk.len().min(512)])
                    .to_ascii_lowercase();
                if head.contains("<html") || head.contains("<!doctype html") {
                    debug!(
                        "seg {} received html contents, aborting - worker {}",
                        seg.basename(),
                        self.tag
                    );
                    return Err(DownpourError::HtmlBody);
                }
            }
            first_chunk = false;

            // trim anything past the declared size; the size is re-read per
            // chunk because auto-segmentation may shrink it mid-transfer,
            // possibly below what is already on disk
            let size = seg.size();
            let mut data = &chunk[..];
            let mut done = false;
            if size > 0 && written + data.len() as u64 > size {
                let keep = size.saturating_sub(written) as usize;
                data = &data[..keep.min(data.len())];
                done = true;
            }

            self.limiter.acquire(data.len() as u64).await;
            file.write_all(data).await?;
            written += data.len() as u64;
            self.buffer += data.len() as u64;
            window_bytes += data.len() as u64;

            if self.flush_timer.elapsed() >= Duration::from_secs(1) {
                self.flush_timer = Instant::now();
                let pending = self.buffer;
                self.buffer = 0;
                self.report_download(seg, pending as i64);
            }

            self.check_watchdog(&mut window_start, &mut window_bytes)?;

            if done {
                break;
            }
        }

        file.flush().await?;
        Ok(())
    }

    /// Abort the transfer when the running window stays below the minimum
    /// speed for the configured time.
    fn check_watchdog(
        &self,
        window_start: &mut Instant,
        window_bytes: &mut u64,
    ) -> crate::error::Result<()> {
        let elapsed = window_start.elapsed();
        if elapsed >= self.low_speed_time {
            let threshold = self.minimum_speed * self.low_speed_time.as_secs();
            if *window_bytes < threshold {
                return Err(DownpourError::LowSpeed {
                    limit: self.minimum_speed,
                    seconds: self.low_speed_time.as_secs(),
                });
            }
            *window_start = Instant::now();
            *window_bytes = 0;
        }
        Ok(())
    }

    /// Completed either when the on-disk size reaches the known size, or for
    /// unknown-size segments when any bytes arrived at all.
    fn verify(&self, seg: &Segment) -> bool {
        let size = seg.size();
        let current = seg.current_size();
        if size == 0 {
            current > 0
        } else {
            current >= size
        }
    }

    fn report_completed(&self, seg: &Arc<Segment>) {
        seg.downloaded.store(true, Ordering::Release);
        if seg.size() == 0 {
            seg.set_size(seg.current_size());
        }
        info!(
            "downloaded segment {} {:?} {} bytes - worker {}",
            seg.basename(),
            seg.range(),
            seg.size(),
            self.tag
        );
    }

    /// Push a transient error description to the scheduler so it can cut
    /// the connection count.
    fn report_error(&self, description: String) {
        let _ = self.errors_tx.try_send(description);
    }

    fn report_download(&self, seg: &Segment, value: i64) {
        if value == 0 {
            return;
        }
        self.item.add_downloaded(value);
        if value >= 0 {
            seg.down_bytes.fetch_add(value as u64, Ordering::AcqRel);
        } else {
            let dec = value.unsigned_abs();
            let current = seg.down_bytes.load(Ordering::Acquire);
            seg.down_bytes
                .store(current.saturating_sub(dec), Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use downpour_types::MediaKind;
    use std::path::PathBuf;

    fn test_worker(item: Arc<DownloadItem>) -> (Worker, mpsc::Receiver<String>, mpsc::Receiver<Arc<Segment>>) {
        let (errors_tx, errors_rx) = mpsc::channel(16);
        let (jobs_tx, jobs_rx) = mpsc::channel(16);
        let worker = Worker::new(0, Client::new(), item, errors_tx, jobs_tx);
        (worker, errors_rx, jobs_rx)
    }

    fn seg_with_file(dir: &std::path::Path, size: u64, body_len: u64) -> Arc<Segment> {
        let path = dir.join("0");
        std::fs::write(&path, vec![0u8; body_len as usize]).unwrap();
        let seg = Segment::new(
            0,
            path,
            "http://example.com/f".into(),
            Some((0, size - 1)),
            dir.join("_temp_f"),
            MediaKind::General,
        );
        Arc::new(seg)
    }

    #[test]
    fn reuse_refuses_locked_segment() {
        let item = Arc::new(DownloadItem::new("http://e.com/f", "f.bin", "/tmp/dl"));
        let (mut worker, _e, _j) = test_worker(item);
        let seg = Arc::new(Segment::new(
            0,
            PathBuf::from("/tmp/none"),
            "http://e.com/f".into(),
            None,
            PathBuf::from("/tmp/t"),
            MediaKind::General,
        ));
        assert!(seg.try_lease());
        assert!(!worker.reuse(seg.clone(), 0, None, None));
        seg.release();
        assert!(worker.reuse(seg, 0, None, None));
    }

    #[test]
    fn previous_partial_body_resumes_with_adjusted_range() {
        let dir = tempfile::tempdir().unwrap();
        let item = Arc::new(DownloadItem::new("http://e.com/f", "f.bin", dir.path()));
        let (mut worker, _e, _j) = test_worker(item);

        let seg = seg_with_file(dir.path(), 1000, 400);
        assert!(worker.reuse(seg, 0, None, None));
        assert_eq!(worker.mode, OpenMode::Append);
        assert_eq!(worker.resume_range, Some((400, 999)));
    }

    #[test]
    fn previous_complete_body_marks_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let item = Arc::new(DownloadItem::new("http://e.com/f", "f.bin", dir.path()));
        let (mut worker, _e, _j) = test_worker(item.clone());

        let seg = seg_with_file(dir.path(), 1000, 1000);
        assert!(worker.reuse(seg.clone(), 0, None, None));
        assert!(seg.is_downloaded());
    }

    #[test]
    fn oversized_body_is_truncated_to_size() {
        let dir = tempfile::tempdir().unwrap();
        let item = Arc::new(DownloadItem::new("http://e.com/f", "f.bin", dir.path()));
        let (mut worker, _e, _j) = test_worker(item);

        let seg = seg_with_file(dir.path(), 1000, 1400);
        assert!(worker.reuse(seg.clone(), 0, None, None));
        assert!(seg.is_downloaded());
        assert_eq!(seg.current_size(), 1000);
    }

    #[test]
    fn verify_unknown_size_accepts_any_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let item = Arc::new(DownloadItem::new("http://e.com/f", "f.bin", dir.path()));
        let (worker, _e, _j) = test_worker(item);

        let path = dir.path().join("u");
        std::fs::write(&path, b"data").unwrap();
        let seg = Segment::new(
            0,
            path,
            "http://e.com/f".into(),
            None,
            dir.path().join("t"),
            MediaKind::General,
        );
        assert!(worker.verify(&seg));

        let empty = Segment::new(
            1,
            dir.path().join("missing"),
            "http://e.com/f".into(),
            None,
            dir.path().join("t"),
            MediaKind::General,
        );
        assert!(!worker.verify(&empty));
    }
}
