//! The download engine.
//!
//! Per item, the brain supervises a file-manager task (merging + finalize),
//! a thread-manager task (connection scheduling), and two progress
//! reporters; the thread-manager leases workers for individual segment
//! transfers. A manager on top services the global pending queue.

mod brain;
mod file_manager;
mod manager;
mod rate_limiter;
mod thread_manager;
mod worker;

pub use brain::*;
pub use file_manager::*;
pub use manager::*;
pub use rate_limiter::*;
pub use thread_manager::*;
pub use worker::*;

use downpour_types::{CoreEvent, Settings};
use reqwest::Client;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Knobs that may change while downloads are running. The scheduler re-reads
/// them every tick; everything else in `Settings` is fixed at item start.
pub struct HotSettings {
    pub max_connections: AtomicUsize,
    pub speed_limit: AtomicU64,
}

impl HotSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_connections: AtomicUsize::new(settings.max_connections.max(1)),
            speed_limit: AtomicU64::new(settings.speed_limit),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.load(Ordering::Acquire).max(1)
    }

    pub fn speed_limit(&self) -> u64 {
        self.speed_limit.load(Ordering::Acquire)
    }
}

/// Shared engine context handed to every per-item task.
#[derive(Clone)]
pub struct EngineCtx {
    pub client: Client,
    pub settings: Arc<Settings>,
    pub hot: Arc<HotSettings>,
    pub events: broadcast::Sender<CoreEvent>,
}
