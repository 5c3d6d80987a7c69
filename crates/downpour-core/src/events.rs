//! Event delivery to the embedding layer.
//!
//! The engine publishes immutable `CoreEvent` records to a broadcast
//! channel. Callers either subscribe directly or install an `EventSink`;
//! a forwarder task then batches records and delivers them, so a slow UI
//! can never block the engine.

use downpour_types::CoreEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Receives batches of state-change records. Implementations must not
/// block for long; the forwarder buffers while `publish` runs.
pub trait EventSink: Send + Sync {
    fn publish(&self, records: &[CoreEvent]);
}

const BATCH_LIMIT: usize = 64;
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Forward events from `rx` to `sink` in batches until the channel closes.
pub async fn forward_events(mut rx: broadcast::Receiver<CoreEvent>, sink: Arc<dyn EventSink>) {
    let mut batch: Vec<CoreEvent> = Vec::with_capacity(BATCH_LIMIT);
    loop {
        match tokio::time::timeout(FLUSH_INTERVAL, rx.recv()).await {
            Ok(Ok(event)) => {
                batch.push(event);
                if batch.len() >= BATCH_LIMIT {
                    sink.publish(&batch);
                    batch.clear();
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                if !batch.is_empty() {
                    sink.publish(&batch);
                }
                return;
            }
            Err(_) => {
                if !batch.is_empty() {
                    sink.publish(&batch);
                    batch.clear();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use downpour_types::Status;
    use parking_lot::Mutex;

    struct Collector(Mutex<Vec<CoreEvent>>);

    impl EventSink for Collector {
        fn publish(&self, records: &[CoreEvent]) {
            self.0.lock().extend_from_slice(records);
        }
    }

    #[tokio::test]
    async fn delivers_all_records_then_stops_on_close() {
        let (tx, rx) = broadcast::channel(128);
        let sink = Arc::new(Collector(Mutex::new(Vec::new())));
        let handle = tokio::spawn(forward_events(rx, sink.clone()));

        for i in 0..10usize {
            tx.send(CoreEvent::SegmentProgress {
                uid: "u".into(),
                index: i,
                downloaded: 0,
            })
            .unwrap();
        }
        tx.send(CoreEvent::StatusChanged {
            uid: "u".into(),
            status: Status::Completed,
            error: None,
        })
        .unwrap();
        drop(tx);

        handle.await.unwrap();
        assert_eq!(sink.0.lock().len(), 11);
    }
}
