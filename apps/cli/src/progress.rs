//! Terminal progress rendering for a single download.

use downpour_core::DownloadItem;
use downpour_types::{CoreEvent, Status};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

fn make_bar(total: u64) -> ProgressBar {
    let bar = if total > 0 {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{bar:32.cyan/blue}] {bytes}/{total_bytes} {msg}",
            )
            .expect("valid template")
            .progress_chars("=>-"),
        );
        bar
    } else {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.green} {bytes} {msg}")
                .expect("valid template"),
        );
        bar
    };
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

/// Render engine events for `item` until it reaches a terminal status.
pub async fn watch(
    mut events: broadcast::Receiver<CoreEvent>,
    item: Arc<DownloadItem>,
) -> Status {
    let mut bar = make_bar(item.total_size());
    let mut known_total = item.total_size();

    loop {
        let event = match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => break,
            Err(_) => {
                // no events flowing; fall back to polling the item
                if !item.status().is_active() && item.status() != Status::Pending
                    && item.status() != Status::Scheduled
                {
                    break;
                }
                continue;
            }
        };

        match event {
            CoreEvent::Progress {
                uid,
                downloaded,
                total,
                speed,
                eta,
                live_connections,
            } if uid == item.uid => {
                if total != known_total && total > 0 {
                    known_total = total;
                    bar.finish_and_clear();
                    bar = make_bar(total);
                }
                bar.set_position(downloaded);
                let eta = eta
                    .map(|s| format!("{s}s left"))
                    .unwrap_or_else(|| "--".to_string());
                bar.set_message(format!(
                    "{}/s | {live_connections} conn | {eta}",
                    human_bytes(speed)
                ));
            }
            CoreEvent::StatusChanged { uid, status, .. } if uid == item.uid => match status {
                Status::Processing => bar.set_message("processing...".to_string()),
                Status::RefreshingUrl => bar.set_message("refreshing url...".to_string()),
                Status::Completed | Status::Cancelled | Status::Error => {
                    bar.finish_and_clear();
                    return status;
                }
                _ => {}
            },
            _ => {}
        }
    }

    bar.finish_and_clear();
    item.status()
}
