//! Progress fan-out
//!
//! Every update goes to a broadcast channel and to the registered sinks.
//! Values are clamped per operation so subscribers never see progress go
//! backwards.

use super::types::ClonePhase;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub operation_id: Uuid,
    pub progress: u8,
    pub phase: Option<ClonePhase>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Receives every progress update
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, update: &ProgressUpdate);
}

pub struct ProgressTracker {
    sender: broadcast::Sender<ProgressUpdate>,
    last: Mutex<HashMap<Uuid, u8>>,
    sinks: RwLock<Vec<Arc<dyn ProgressSink>>>,
}

impl ProgressTracker {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            last: Mutex::new(HashMap::new()),
            sinks: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.sender.subscribe()
    }

    pub fn add_sink(&self, sink: Arc<dyn ProgressSink>) {
        self.sinks.write().push(sink);
    }

    /// Publish progress, returning the value actually published
    pub fn update(&self, operation_id: Uuid, progress: u8, phase: Option<ClonePhase>, message: impl Into<String>) -> u8 {
        let published = {
            let mut last = self.last.lock();
            let entry = last.entry(operation_id).or_insert(0);
            *entry = (*entry).max(progress.min(100));
            *entry
        };

        let update = ProgressUpdate {
            operation_id,
            progress: published,
            phase,
            message: message.into(),
            timestamp: Utc::now(),
        };
        debug!("Clone {} at {}%: {}", operation_id, published, update.message);

        for sink in self.sinks.read().iter() {
            sink.on_progress(&update);
        }
        // no subscribers is fine
        let _ = self.sender.send(update);
        published
    }

    /// Drop the clamp state of a finished operation
    pub fn forget(&self, operation_id: Uuid) {
        self.last.lock().remove(&operation_id);
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<u8>>);

    impl ProgressSink for Recorder {
        fn on_progress(&self, update: &ProgressUpdate) {
            self.0.lock().push(update.progress);
        }
    }

    #[test]
    fn test_operations_are_clamped_independently() {
        let tracker = ProgressTracker::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(tracker.update(a, 40, Some(ClonePhase::Data), "a"), 40);
        assert_eq!(tracker.update(b, 10, Some(ClonePhase::Schema), "b"), 10);
        assert_eq!(tracker.update(a, 20, Some(ClonePhase::Data), "a again"), 40);
        assert_eq!(tracker.update(b, 250, None, "overshoot"), 100);
    }

    #[tokio::test]
    async fn test_subscribers_receive_updates_in_order() {
        let tracker = ProgressTracker::default();
        let mut rx = tracker.subscribe();
        let id = Uuid::new_v4();
        tracker.update(id, 5, Some(ClonePhase::Schema), "collecting");
        tracker.update(id, 30, Some(ClonePhase::Schema), "schema done");

        assert_eq!(rx.recv().await.unwrap().progress, 5);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.progress, 30);
        assert_eq!(second.message, "schema done");
    }

    proptest! {
        #[test]
        fn test_observed_progress_never_decreases(values in proptest::collection::vec(any::<u8>(), 1..64)) {
            let tracker = ProgressTracker::new(128);
            let recorder = Arc::new(Recorder::default());
            tracker.add_sink(recorder.clone());
            let mut rx = tracker.subscribe();
            let id = Uuid::new_v4();

            let returned: Vec<u8> = values.iter().map(|v| tracker.update(id, *v, None, "step")).collect();
            let mut received = Vec::new();
            while let Ok(update) = rx.try_recv() {
                received.push(update.progress);
            }

            for observed in [&returned, &received, &*recorder.0.lock()] {
                prop_assert_eq!(observed.len(), values.len());
                prop_assert!(observed.windows(2).all(|w| w[0] <= w[1]));
                prop_assert!(observed.iter().all(|p| *p <= 100));
            }
        }
    }
}
