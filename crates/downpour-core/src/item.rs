//! Segment and DownloadItem: the runtime data model of the engine.
//!
//! A `Segment` is the unit of work a single worker transfers end-to-end.
//! A `DownloadItem` owns the ordered segment list plus naming, sizing,
//! progress, and status. Workers mutate only their own segment's flags;
//! the file manager mutates `completed`; the scheduler may split a ranged
//! segment while it is in flight.

use crate::naming;
use downpour_types::{CoreEvent, HttpOptions, MediaKind, Status, SubType};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

/// AES key reference for encrypted HLS segments, carried by value-copy so a
/// later `#EXT-X-KEY` line cannot retroactively change earlier segments.
#[derive(Debug, Clone, PartialEq)]
pub struct HlsKey {
    pub method: String,
    /// Absolute URL after the `skd://` → `https://` rewrite and join against
    /// the playlist URL.
    pub url: String,
    pub iv: Option<String>,
}

/// A contiguous byte range (or an opaque fragment URL) transferred by one
/// worker.
#[derive(Debug)]
pub struct Segment {
    pub index: usize,
    /// Where the segment body is written on disk.
    pub path: PathBuf,
    pub url: String,
    /// The temp file this segment is spliced into by the file manager.
    pub temp_target: PathBuf,
    pub media_kind: MediaKind,
    pub key: Option<HlsKey>,
    /// False when the muxer assembles directly from segment files
    /// (encrypted HLS).
    pub merge: bool,
    /// `#EXTINF` duration, kept for writing the local playlist.
    pub duration: Option<f64>,

    range: Mutex<Option<(u64, u64)>>,
    size: AtomicU64,

    pub downloaded: AtomicBool,
    pub completed: AtomicBool,
    locked: AtomicBool,
    pub retries: AtomicU32,
    pub merge_errors: AtomicU32,
    pub down_bytes: AtomicU64,
}

impl Segment {
    pub fn new(
        index: usize,
        path: PathBuf,
        url: String,
        range: Option<(u64, u64)>,
        temp_target: PathBuf,
        media_kind: MediaKind,
    ) -> Self {
        let size = range.map(|(a, b)| b - a + 1).unwrap_or(0);
        Self {
            index,
            path,
            url,
            temp_target,
            media_kind,
            key: None,
            merge: true,
            duration: None,
            range: Mutex::new(range),
            size: AtomicU64::new(size),
            downloaded: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            locked: AtomicBool::new(false),
            retries: AtomicU32::new(0),
            merge_errors: AtomicU32::new(0),
            down_bytes: AtomicU64::new(0),
        }
    }

    pub fn range(&self) -> Option<(u64, u64)> {
        *self.range.lock()
    }

    /// Setting a range also fixes the size to `end - start + 1`.
    pub fn set_range(&self, range: Option<(u64, u64)>) {
        let mut guard = self.range.lock();
        *guard = range;
        if let Some((a, b)) = range {
            self.size.store(b - a + 1, Ordering::Release);
        }
    }

    /// Shrink the range end in place; used by auto-segmentation while the
    /// segment may be in flight. The worker re-reads `size()` per chunk, so
    /// the split takes effect on the live transfer.
    pub fn truncate_range_end(&self, new_end: u64) {
        let mut guard = self.range.lock();
        if let Some((start, _)) = *guard {
            *guard = Some((start, new_end));
            self.size.store(new_end - start + 1, Ordering::Release);
        }
    }

    /// Known size in bytes; 0 means unknown.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    /// Bytes of the segment body currently on disk.
    pub fn current_size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    pub fn remaining(&self) -> u64 {
        self.size().saturating_sub(self.current_size())
    }

    pub fn basename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "undefined".to_string())
    }

    /// Lease the segment to a worker. Fails when another worker holds it.
    pub fn try_lease(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn is_downloaded(&self) -> bool {
        self.downloaded.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

/// Fragment manifest for fragmented (non-HLS) streams: relative paths joined
/// against a base URL, one segment per fragment.
#[derive(Debug, Clone)]
pub struct FragmentList {
    pub base_url: String,
    pub paths: Vec<String>,
}

/// A subtitle source offered by the resolver.
#[derive(Debug, Clone)]
pub struct SubtitleSource {
    pub url: String,
    pub ext: String,
}

/// Moving-average speed over at least 10 samples.
struct SpeedTracker {
    prev_downloaded: u64,
    timer: Option<Instant>,
    buffer: VecDeque<f64>,
    value: u64,
    refresh_rate: f64,
}

impl SpeedTracker {
    fn new(refresh_rate: f64) -> Self {
        Self {
            prev_downloaded: 0,
            timer: None,
            buffer: VecDeque::new(),
            value: 0,
            refresh_rate,
        }
    }

    fn reset(&mut self) {
        self.prev_downloaded = 0;
        self.timer = None;
        self.buffer.clear();
        self.value = 0;
    }

    fn sample(&mut self, downloaded: u64) -> u64 {
        let now = Instant::now();
        let timer = match self.timer {
            Some(t) => t,
            None => {
                self.timer = Some(now);
                self.prev_downloaded = downloaded;
                return self.value;
            }
        };

        let elapsed = now.duration_since(timer).as_secs_f64();
        if elapsed >= self.refresh_rate {
            self.timer = Some(now);
            let delta = downloaded.saturating_sub(self.prev_downloaded);
            self.prev_downloaded = downloaded;
            self.buffer.push_back(delta as f64 / elapsed);
            let avg = self.buffer.iter().sum::<f64>() / self.buffer.len() as f64;
            if self.buffer.len() >= 10 {
                self.buffer.pop_front();
            }
            self.value = if avg > 0.0 { avg as u64 } else { 0 };
        }
        self.value
    }
}

/// The aggregate root: one user-facing download.
pub struct DownloadItem {
    /// Content-addressed identity: hex MD5 of `folder || name`.
    pub uid: String,
    pub name: String,
    pub title: String,
    pub extension: String,
    pub folder: PathBuf,
    /// Parent directory for the temp folder; usually `folder`.
    pub temp_base: PathBuf,

    pub url: String,
    pub eff_url: RwLock<String>,
    pub audio_url: RwLock<Option<String>>,
    pub manifest_url: Option<String>,
    /// Resolver-assigned stream ids, used to re-pick the right variant when
    /// a master manifest is refreshed.
    pub format_id: Option<String>,
    pub audio_format_id: Option<String>,

    pub kind: MediaKind,
    subtypes: RwLock<Vec<SubType>>,

    pub size: AtomicU64,
    pub audio_size: AtomicU64,
    total_size: AtomicU64,
    pub resumable: bool,
    pub segment_size: u64,

    pub downloaded: AtomicU64,
    status: Mutex<Status>,
    pub last_error: Mutex<Option<String>>,
    pub live_connections: AtomicUsize,
    pub remaining_parts: AtomicUsize,
    pub total_parts: AtomicUsize,
    pub errors: AtomicU64,
    speed: Mutex<SpeedTracker>,

    pub segments: Mutex<Vec<Arc<Segment>>>,
    pub fragments: Option<FragmentList>,
    pub audio_fragments: Option<FragmentList>,

    pub http: HttpOptions,
    pub accept_html: bool,
    pub keep_temp: bool,

    pub subtitles: HashMap<String, Vec<SubtitleSource>>,
    pub selected_subtitles: Vec<(String, SubtitleSource)>,
    pub metadata: Option<String>,
    pub last_modified: RwLock<Option<String>>,

    pub md5: Mutex<Option<String>>,
    pub sha256: Mutex<Option<String>>,

    events: RwLock<Option<broadcast::Sender<CoreEvent>>>,
}

impl std::fmt::Debug for DownloadItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadItem")
            .field("uid", &self.uid)
            .field("name", &self.name)
            .field("url", &self.url)
            .finish()
    }
}

impl DownloadItem {
    pub fn new(url: impl Into<String>, name: &str, folder: impl Into<PathBuf>) -> Self {
        let folder: PathBuf = folder.into();
        let name = naming::validate_file_name(name);
        let (title, extension) = naming::split_extension(&name);
        let uid = naming::uid(&folder, &name);
        let url = url.into();
        Self {
            uid,
            title,
            extension,
            temp_base: folder.clone(),
            folder,
            eff_url: RwLock::new(url.clone()),
            url,
            name,
            audio_url: RwLock::new(None),
            manifest_url: None,
            format_id: None,
            audio_format_id: None,
            kind: MediaKind::General,
            subtypes: RwLock::new(Vec::new()),
            size: AtomicU64::new(0),
            audio_size: AtomicU64::new(0),
            total_size: AtomicU64::new(0),
            resumable: false,
            segment_size: downpour_types::SEGMENT_SIZE,
            downloaded: AtomicU64::new(0),
            status: Mutex::new(Status::Pending),
            last_error: Mutex::new(None),
            live_connections: AtomicUsize::new(0),
            remaining_parts: AtomicUsize::new(0),
            total_parts: AtomicUsize::new(0),
            errors: AtomicU64::new(0),
            speed: Mutex::new(SpeedTracker::new(0.5)),
            segments: Mutex::new(Vec::new()),
            fragments: None,
            audio_fragments: None,
            http: HttpOptions::default(),
            accept_html: false,
            keep_temp: false,
            subtitles: HashMap::new(),
            selected_subtitles: Vec::new(),
            metadata: None,
            last_modified: RwLock::new(None),
            md5: Mutex::new(None),
            sha256: Mutex::new(None),
            events: RwLock::new(None),
        }
    }

    /// Rename the item (before start). Recomputes the UID, which also moves
    /// the temp folder.
    pub fn rename(&mut self, new_name: &str) {
        self.name = naming::validate_file_name(new_name);
        let (title, extension) = naming::split_extension(&self.name);
        self.title = title;
        self.extension = extension;
        self.uid = naming::uid(&self.folder, &self.name);
    }

    // ------------------------------------------------------------------
    // Derived paths
    // ------------------------------------------------------------------

    pub fn temp_folder(&self) -> PathBuf {
        self.temp_base.join(format!("dpr_{}", self.uid))
    }

    pub fn target_file(&self) -> PathBuf {
        self.folder.join(&self.name)
    }

    pub fn temp_file(&self) -> PathBuf {
        let name = format!("_temp_{}", self.name).replace(' ', "_");
        self.temp_folder().join(name)
    }

    pub fn audio_file(&self) -> PathBuf {
        let name = format!("audio_for_{}", self.name).replace(' ', "_");
        self.temp_folder().join(name)
    }

    pub fn journal_file(&self) -> PathBuf {
        self.temp_folder().join("progress_info.txt")
    }

    // ------------------------------------------------------------------
    // Status and events
    // ------------------------------------------------------------------

    pub fn status(&self) -> Status {
        *self.status.lock()
    }

    pub fn set_status(&self, status: Status) {
        {
            let mut guard = self.status.lock();
            if *guard == status {
                return;
            }
            *guard = status;
        }
        if let Some(tx) = self.events.read().as_ref() {
            let _ = tx.send(CoreEvent::StatusChanged {
                uid: self.uid.clone(),
                status,
                error: self.last_error.lock().clone(),
            });
        }
    }

    pub fn fail(&self, reason: impl Into<String>) {
        *self.last_error.lock() = Some(reason.into());
        self.set_status(Status::Error);
    }

    pub fn attach_events(&self, tx: broadcast::Sender<CoreEvent>) {
        *self.events.write() = Some(tx);
    }

    pub fn events(&self) -> Option<broadcast::Sender<CoreEvent>> {
        self.events.read().clone()
    }

    // ------------------------------------------------------------------
    // Subtypes
    // ------------------------------------------------------------------

    pub fn subtypes(&self) -> Vec<SubType> {
        self.subtypes.read().clone()
    }

    pub fn has_subtype(&self, sub: SubType) -> bool {
        self.subtypes.read().contains(&sub)
    }

    pub fn add_subtype(&self, sub: SubType) {
        let mut guard = self.subtypes.write();
        if !guard.contains(&sub) {
            guard.push(sub);
        }
    }

    pub fn set_subtypes(&self, subs: Vec<SubType>) {
        *self.subtypes.write() = subs;
    }

    // ------------------------------------------------------------------
    // Progress
    // ------------------------------------------------------------------

    pub fn add_downloaded(&self, bytes: i64) {
        if bytes >= 0 {
            self.downloaded.fetch_add(bytes as u64, Ordering::AcqRel);
        } else {
            let dec = bytes.unsigned_abs();
            // saturating: resets near start can otherwise underflow
            let mut current = self.downloaded.load(Ordering::Acquire);
            loop {
                let next = current.saturating_sub(dec);
                match self.downloaded.compare_exchange_weak(
                    current,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }
        }
    }

    /// Average transfer speed in bytes/sec; 0 unless downloading.
    pub fn speed(&self) -> u64 {
        let mut tracker = self.speed.lock();
        if self.status() != Status::Downloading {
            tracker.reset();
            return 0;
        }
        tracker.sample(self.downloaded.load(Ordering::Acquire))
    }

    pub fn set_speed_refresh_rate(&self, rate: f64) {
        self.speed.lock().refresh_rate = rate;
    }

    /// Seconds until completion at the current speed.
    pub fn eta(&self) -> Option<u64> {
        if self.status() != Status::Downloading {
            return None;
        }
        let speed = self.speed();
        if speed == 0 {
            return None;
        }
        let total = self.total_size();
        let downloaded = self.downloaded.load(Ordering::Acquire);
        Some(total.saturating_sub(downloaded) / speed)
    }

    /// Percent complete. Reads 99 until the item actually reaches
    /// `Completed`, so UIs never show a premature 100.
    pub fn progress(&self) -> f64 {
        if self.status() == Status::Completed {
            return 100.0;
        }

        let total = self.total_size();
        let p = if total == 0 {
            let segments = self.segments.lock();
            if segments.is_empty() {
                0.0
            } else {
                let finished = segments.iter().filter(|s| s.is_completed()).count();
                finished as f64 * 100.0 / segments.len() as f64
            }
        } else {
            self.downloaded.load(Ordering::Acquire) as f64 * 100.0 / total as f64
        };

        if p >= 100.0 {
            99.0
        } else {
            (p * 10.0).round() / 10.0
        }
    }

    // ------------------------------------------------------------------
    // Sizing
    // ------------------------------------------------------------------

    pub fn video_size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn total_size(&self) -> u64 {
        let cached = self.total_size.load(Ordering::Acquire);
        if cached != 0 {
            cached
        } else {
            self.recalc_total_size()
        }
    }

    /// Sum of known segment sizes, plus the per-known average for each
    /// unknown-size segment. Also refreshes `size`/`audio_size` per stream.
    pub fn recalc_total_size(&self) -> u64 {
        fn guess(sizes: &[u64], total_count: usize) -> u64 {
            let known: Vec<u64> = sizes.iter().copied().filter(|&s| s > 0).collect();
            let mut sum: u64 = known.iter().sum();
            let unknown = total_count - known.len();
            if !known.is_empty() && unknown > 0 {
                sum += (sum / known.len() as u64) * unknown as u64;
            }
            sum
        }

        let segments = self.segments.lock();
        let mut total = 0u64;
        if !segments.is_empty() {
            let video: Vec<u64> = segments
                .iter()
                .filter(|s| s.media_kind == MediaKind::Video)
                .map(|s| s.size())
                .collect();
            let audio: Vec<u64> = segments
                .iter()
                .filter(|s| s.media_kind == MediaKind::Audio)
                .map(|s| s.size())
                .collect();
            let other: Vec<u64> = segments
                .iter()
                .filter(|s| {
                    s.media_kind != MediaKind::Video && s.media_kind != MediaKind::Audio
                })
                .map(|s| s.size())
                .collect();

            let video_size = guess(&video, video.len());
            let audio_size = guess(&audio, audio.len());
            if video_size > 0 {
                self.size.store(video_size, Ordering::Release);
            }
            self.audio_size.store(audio_size, Ordering::Release);
            total = video_size + audio_size + guess(&other, other.len());
            self.total_parts.store(segments.len(), Ordering::Release);
        }

        let total = if total > 0 {
            total
        } else {
            self.size.load(Ordering::Acquire)
        };
        self.total_size.store(total, Ordering::Release);
        total
    }

    pub fn invalidate_total_size(&self) {
        self.total_size.store(0, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Segmentation plan
    // ------------------------------------------------------------------

    /// Build the initial segment plan. HLS items get their segments from the
    /// manifest pre-processor instead.
    pub fn build_segments(&self) {
        if self.has_subtype(SubType::Hls) {
            return;
        }

        let temp_folder = self.temp_folder();
        let temp_file = self.temp_file();
        let mut segments: Vec<Arc<Segment>> = Vec::new();

        if let Some(fragments) = &self.fragments {
            for (i, path) in fragments.paths.iter().enumerate() {
                segments.push(Arc::new(Segment::new(
                    i,
                    temp_folder.join(i.to_string()),
                    join_url(&fragments.base_url, path),
                    None,
                    temp_file.clone(),
                    MediaKind::Video,
                )));
            }
        } else {
            let size = self.size.load(Ordering::Acquire);
            let ranges = if self.resumable && size > 0 {
                range_list(size, self.segment_size)
            } else {
                vec![None]
            };
            let url = self.eff_url.read().clone();
            for (i, range) in ranges.into_iter().enumerate() {
                segments.push(Arc::new(Segment::new(
                    i,
                    temp_folder.join(i.to_string()),
                    url.clone(),
                    range,
                    temp_file.clone(),
                    self.kind,
                )));
            }
        }

        if self.has_subtype(SubType::Dash) {
            let audio_file = self.audio_file();
            if let Some(fragments) = &self.audio_fragments {
                for (i, path) in fragments.paths.iter().enumerate() {
                    segments.push(Arc::new(Segment::new(
                        segments.len(),
                        temp_folder.join(format!("{i}_audio")),
                        join_url(&fragments.base_url, path),
                        None,
                        audio_file.clone(),
                        MediaKind::Audio,
                    )));
                }
            } else if let Some(audio_url) = self.audio_url.read().clone() {
                let audio_size = self.audio_size.load(Ordering::Acquire);
                for (i, range) in range_list(audio_size, self.segment_size)
                    .into_iter()
                    .enumerate()
                {
                    segments.push(Arc::new(Segment::new(
                        segments.len(),
                        temp_folder.join(format!("{i}_audio")),
                        audio_url.clone(),
                        range,
                        audio_file.clone(),
                        MediaKind::Audio,
                    )));
                }
            }
        }

        self.total_parts.store(segments.len(), Ordering::Release);
        *self.segments.lock() = segments;
        self.invalidate_total_size();
    }

    pub fn segments_snapshot(&self) -> Vec<Arc<Segment>> {
        self.segments.lock().clone()
    }

    // ------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------

    pub fn delete_tempfiles(&self, force: bool) {
        if force || !self.keep_temp {
            let _ = std::fs::remove_dir_all(self.temp_folder());
            let _ = std::fs::remove_file(self.temp_file());
            let _ = std::fs::remove_file(self.audio_file());
        }
    }
}

/// Join a possibly-relative path against a base URL, tolerating bases
/// without a trailing slash the way browsers do.
pub fn join_url(base: &str, path: &str) -> String {
    match url::Url::parse(base) {
        Ok(base_url) => base_url
            .join(path)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| path.to_string()),
        Err(_) => path.to_string(),
    }
}

/// Split `[0, size-1]` into contiguous ranges of `segment_size`; the last
/// range absorbs the remainder shortfall. `size == 0` yields one rangeless
/// entry.
pub fn range_list(size: u64, segment_size: u64) -> Vec<Option<(u64, u64)>> {
    if size == 0 {
        return vec![None];
    }
    let segment_size = segment_size.max(1);
    let mut ranges = Vec::new();
    let mut start = 0u64;
    while start < size {
        let end = (start + segment_size - 1).min(size - 1);
        ranges.push(Some((start, end)));
        start = end + 1;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_list_covers_without_overlap() {
        let size = 10 * 1024 * 1024; // 10 MiB
        let ranges = range_list(size, downpour_types::SEGMENT_SIZE);
        assert_eq!(ranges.len(), 103);

        let mut expected_start = 0u64;
        for range in &ranges {
            let (a, b) = range.unwrap();
            assert_eq!(a, expected_start);
            assert!(b >= a);
            expected_start = b + 1;
        }
        assert_eq!(expected_start, size);
    }

    #[test]
    fn range_list_exact_multiple_and_small() {
        assert_eq!(range_list(200, 100), vec![Some((0, 99)), Some((100, 199))]);
        assert_eq!(range_list(50, 100), vec![Some((0, 49))]);
        assert_eq!(range_list(0, 100), vec![None]);
    }

    #[test]
    fn build_segments_fixed_plan() {
        let mut item = DownloadItem::new("http://example.com/f.bin", "f.bin", "/tmp/dl");
        item.resumable = true;
        item.size.store(10 * 1024 * 1024, Ordering::Release);
        item.build_segments();

        let segments = item.segments_snapshot();
        assert_eq!(segments.len(), 103);
        assert_eq!(segments[0].range(), Some((0, 102_399)));
        assert_eq!(segments[0].size(), 102_400);
        assert_eq!(
            segments.last().unwrap().range().unwrap().1,
            10 * 1024 * 1024 - 1
        );
        assert!(segments.iter().all(|s| s.temp_target == item.temp_file()));
    }

    #[test]
    fn build_segments_single_when_not_resumable() {
        let mut item = DownloadItem::new("http://example.com/f.bin", "f.bin", "/tmp/dl");
        item.resumable = false;
        item.size.store(5_000_000, Ordering::Release);
        item.build_segments();
        let segments = item.segments_snapshot();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].range(), None);
        assert_eq!(segments[0].size(), 0);
    }

    #[test]
    fn build_segments_dash_appends_audio_list() {
        let mut item = DownloadItem::new("http://example.com/v.mp4", "v.mp4", "/tmp/dl");
        item.kind = MediaKind::Video;
        item.resumable = true;
        item.size.store(300_000, Ordering::Release);
        item.audio_size.store(150_000, Ordering::Release);
        item.set_subtypes(vec![SubType::Dash]);
        *item.audio_url.write() = Some("http://example.com/a.m4a".to_string());
        item.build_segments();

        let segments = item.segments_snapshot();
        let video: Vec<_> = segments
            .iter()
            .filter(|s| s.media_kind == MediaKind::Video)
            .collect();
        let audio: Vec<_> = segments
            .iter()
            .filter(|s| s.media_kind == MediaKind::Audio)
            .collect();
        assert_eq!(video.len(), 3);
        assert_eq!(audio.len(), 2);
        assert!(audio.iter().all(|s| s.temp_target == item.audio_file()));
        assert_eq!(item.total_size(), 450_000);
    }

    #[test]
    fn total_size_estimates_unknown_segments() {
        let item = DownloadItem::new("http://example.com/x", "x.ts", "/tmp/dl");
        {
            let mut segments = item.segments.lock();
            for i in 0..4usize {
                let seg = Segment::new(
                    i,
                    PathBuf::from(format!("/tmp/dl/{i}")),
                    "http://example.com/x".into(),
                    None,
                    PathBuf::from("/tmp/dl/t"),
                    MediaKind::Video,
                );
                if i < 2 {
                    seg.set_size(1000);
                }
                segments.push(Arc::new(seg));
            }
        }
        // 2 known of 1000 each + 2 unknown estimated at the 1000 average
        assert_eq!(item.recalc_total_size(), 4000);
    }

    #[test]
    fn auto_split_preserves_union() {
        let seg = Segment::new(
            0,
            PathBuf::from("/tmp/0"),
            "http://example.com".into(),
            Some((100, 999)),
            PathBuf::from("/tmp/t"),
            MediaKind::General,
        );
        let (start, end) = seg.range().unwrap();
        let mid = 499;
        seg.truncate_range_end(mid);
        assert_eq!(seg.range(), Some((start, mid)));
        assert_eq!(seg.size(), mid - start + 1);
        // the new sibling would cover (mid+1, end): union unchanged
        assert_eq!((mid + 1, end), (500, 999));
    }

    #[test]
    fn lease_is_exclusive() {
        let seg = Segment::new(
            0,
            PathBuf::from("/tmp/0"),
            "http://example.com".into(),
            None,
            PathBuf::from("/tmp/t"),
            MediaKind::General,
        );
        assert!(seg.try_lease());
        assert!(!seg.try_lease());
        seg.release();
        assert!(seg.try_lease());
    }

    #[test]
    fn rename_recomputes_uid_and_paths() {
        let mut item = DownloadItem::new("http://example.com/v", "video.mp4", "/tmp/dl");
        let old_uid = item.uid.clone();
        let old_temp = item.temp_folder();
        item.rename("video_3.mp4");
        assert_eq!(item.name, "video_3.mp4");
        assert_eq!(item.title, "video_3");
        assert_eq!(item.extension, ".mp4");
        assert_ne!(item.uid, old_uid);
        assert_ne!(item.temp_folder(), old_temp);
    }

    #[test]
    fn temp_names_replace_spaces() {
        let item = DownloadItem::new("http://e.com/v", "my video.mp4", "/tmp/dl");
        assert!(item
            .temp_file()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("_temp_my_video"));
        assert!(item
            .audio_file()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("audio_for_my_video"));
    }
}
