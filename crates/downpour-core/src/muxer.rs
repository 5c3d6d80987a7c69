//! Adapter around the external muxer binary (ffmpeg).
//!
//! Every invocation is argv-based (no shell) and comes in two flavors:
//! stream-copy first, full re-encode when the copy fails. A running child
//! is killed as soon as the owning item is cancelled or errored.

use crate::error::{DownpourError, Result};
use crate::item::DownloadItem;
use downpour_types::Status;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Muxer {
    ffmpeg: PathBuf,
}

fn arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// `-i video -i audio [-c copy] output`
fn merge_args(video: &Path, audio: &Path, output: &Path, copy: bool) -> Vec<String> {
    let mut args = vec![
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
        "-i".into(),
        arg(video),
        "-i".into(),
        arg(audio),
    ];
    if copy {
        args.push("-c".into());
        args.push("copy".into());
    }
    args.push(arg(output));
    args
}

/// Assemble from a local media playlist; ffmpeg needs the protocol
/// whitelist to follow file/crypto entries inside the playlist.
fn playlist_args(playlist: &Path, output: &Path, copy: bool) -> Vec<String> {
    let mut args = vec![
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
        "-protocol_whitelist".into(),
        "file,http,https,tcp,tls,crypto".into(),
        "-allowed_extensions".into(),
        "ALL".into(),
        "-i".into(),
        arg(playlist),
    ];
    if copy {
        args.push("-c".into());
        args.push("copy".into());
    }
    args.push(format!("file:{}", output.display()));
    args
}

fn audio_args(input: &Path, output: &Path, copy: bool) -> Vec<String> {
    let mut args = vec![
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
        "-i".into(),
        arg(input),
    ];
    if copy {
        args.push("-acodec".into());
        args.push("copy".into());
    }
    args.push(arg(output));
    args
}

fn metadata_args(target: &Path, sidecar: &Path, output: &Path) -> Vec<String> {
    vec![
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
        "-i".into(),
        arg(target),
        "-i".into(),
        arg(sidecar),
        "-map_metadata".into(),
        "1".into(),
        "-c".into(),
        "copy".into(),
        arg(output),
    ]
}

impl Muxer {
    pub fn new(ffmpeg: PathBuf) -> Self {
        Self { ffmpeg }
    }

    /// Run one muxer invocation, killing the child if the item is cancelled
    /// or fails while it runs.
    async fn run(&self, args: Vec<String>, item: &DownloadItem) -> Result<()> {
        if matches!(item.status(), Status::Cancelled | Status::Error) {
            return Err(DownpourError::Cancelled);
        }
        debug!("muxer: {:?} {:?}", self.ffmpeg, args);

        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        let stderr = child.stderr.take();

        let status = loop {
            if matches!(item.status(), Status::Cancelled | Status::Error) {
                let _ = child.start_kill();
                let _ = child.wait().await;
                debug!("muxer cancelled");
                return Err(DownpourError::Cancelled);
            }
            match tokio::time::timeout(Duration::from_millis(100), child.wait()).await {
                Ok(status) => break status?,
                Err(_) => continue,
            }
        };

        if status.success() {
            return Ok(());
        }

        let mut message = String::new();
        if let Some(mut pipe) = stderr {
            let _ = pipe.read_to_string(&mut message).await;
        }
        let message = message.trim();
        Err(DownpourError::Muxer(if message.is_empty() {
            format!("exit status {status}")
        } else {
            message.to_string()
        }))
    }

    /// Try stream-copy first, fall back to a full re-encode.
    async fn run_copy_then_encode(
        &self,
        fast: Vec<String>,
        slow: Vec<String>,
        item: &DownloadItem,
    ) -> Result<()> {
        match self.run(fast, item).await {
            Ok(()) => Ok(()),
            Err(DownpourError::Cancelled) => Err(DownpourError::Cancelled),
            Err(e) => {
                warn!("stream-copy failed ({e}), retrying with re-encode");
                self.run(slow, item).await
            }
        }
    }

    /// Merge a video temp file and an audio temp file into the target.
    pub async fn merge_video_audio(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        item: &DownloadItem,
    ) -> Result<()> {
        self.run_copy_then_encode(
            merge_args(video, audio, output, true),
            merge_args(video, audio, output, false),
            item,
        )
        .await
    }

    /// Assemble a stream from a local media playlist.
    pub async fn assemble_playlist(
        &self,
        playlist: &Path,
        output: &Path,
        item: &DownloadItem,
    ) -> Result<()> {
        self.run_copy_then_encode(
            playlist_args(playlist, output, true),
            playlist_args(playlist, output, false),
            item,
        )
        .await
    }

    /// Transcode an audio temp file into the target container.
    pub async fn convert_audio(
        &self,
        input: &Path,
        output: &Path,
        item: &DownloadItem,
    ) -> Result<()> {
        self.run_copy_then_encode(
            audio_args(input, output, true),
            audio_args(input, output, false),
            item,
        )
        .await
    }

    /// Convert a subtitle file; the output extension selects the format.
    pub async fn convert_subtitle(
        &self,
        input: &Path,
        output: &Path,
        item: &DownloadItem,
    ) -> Result<()> {
        let args = vec![
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
            "-i".into(),
            arg(input),
            arg(output),
        ];
        self.run(args, item).await
    }

    /// Re-mux the sidecar's metadata into the target in place.
    pub async fn write_metadata(
        &self,
        target: &Path,
        sidecar: &Path,
        item: &DownloadItem,
    ) -> Result<()> {
        let staged = target.with_file_name(format!(
            "_meta_{}",
            target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "out".into())
        ));
        self.run(metadata_args(target, sidecar, &staged), item)
            .await?;
        tokio::fs::rename(&staged, target).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_stream_copy() {
        let fast = merge_args(
            Path::new("/t/v.mp4"),
            Path::new("/t/a.m4a"),
            Path::new("/t/out.mp4"),
            true,
        );
        assert_eq!(
            fast,
            vec![
                "-loglevel", "error", "-y", "-i", "/t/v.mp4", "-i", "/t/a.m4a", "-c", "copy",
                "/t/out.mp4"
            ]
        );

        let slow = merge_args(
            Path::new("/t/v.mp4"),
            Path::new("/t/a.m4a"),
            Path::new("/t/out.mp4"),
            false,
        );
        assert!(!slow.contains(&"copy".to_string()));
    }

    #[test]
    fn playlist_invocation_whitelists_protocols() {
        let args = playlist_args(Path::new("/t/local.m3u8"), Path::new("/t/out.ts"), true);
        let whitelist_pos = args
            .iter()
            .position(|a| a == "-protocol_whitelist")
            .unwrap();
        assert_eq!(args[whitelist_pos + 1], "file,http,https,tcp,tls,crypto");
        assert!(args.contains(&"-allowed_extensions".to_string()));
        assert_eq!(args.last().unwrap(), "file:/t/out.ts");
    }

    #[test]
    fn metadata_maps_from_sidecar() {
        let args = metadata_args(
            Path::new("/t/out.mp4"),
            Path::new("/t/out.mp4.meta"),
            Path::new("/t/_meta_out.mp4"),
        );
        let map_pos = args.iter().position(|a| a == "-map_metadata").unwrap();
        assert_eq!(args[map_pos + 1], "1");
    }
}
