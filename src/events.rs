use std::time::Duration;

use tokio::sync::broadcast;

use crate::file::FileId;

/// In-process pub/sub event taxonomy. Modeled as a single cloneable enum over
/// a `tokio::sync::broadcast` channel: subscribers may miss events under
/// backpressure (lagged), which is acceptable for progress/telemetry events.
#[derive(Debug, Clone)]
pub enum Event {
    UploadStart { file_id: FileId },
    UploadProgress { file_id: FileId, percent: u8, loaded: u64, total: u64 },
    UploadComplete { file_id: FileId, url: String },
    UploadError { file_id: FileId, message: String },
    UploadPause { file_id: FileId },
    UploadResume { file_id: FileId },
    UploadCancel { file_id: FileId },

    ChunkTaskCreated { file_id: FileId, chunk_count: u64 },
    ChunkTaskStatus { file_id: FileId, status: &'static str },
    ChunkTaskError { file_id: FileId, message: String },
    ChunkUploadStart { file_id: FileId, chunk_index: u64 },
    ChunkUploaded { file_id: FileId, chunk_index: u64 },
    ChunkError { file_id: FileId, chunk_index: u64, message: String },
    ChunkProgress { file_id: FileId, chunk_index: u64, loaded: u64, size: u64 },

    ChunkMergeStart { file_id: FileId },
    ChunkMergeComplete { file_id: FileId, url: String },
    ChunkMergeError { file_id: FileId, message: String },

    RetryStart { file_id: FileId, chunk_index: Option<u64>, retry_count: u32, delay: Duration },
    RetrySuccess { file_id: FileId, chunk_index: Option<u64> },
    RetryFailed { file_id: FileId, chunk_index: Option<u64>, recoverable: bool },
    RetryWaiting { file_id: FileId, chunk_index: Option<u64> },
    RetryCountdown { remaining_ms: u64 },
    RetryNetworkRecovered { file_id: FileId },
    RetryAdjusting { file_id: FileId, chunk_index: Option<u64>, new_chunk_size: u64 },

    PerformanceMetric { category: String, op: String, duration: Duration },

    Error { message: String },
    ErrorKind { kind: &'static str, message: String },
    FileError { file_id: FileId, message: String },
}

/// Thin wrapper over a broadcast channel. Cloning an `EventBus` shares the
/// same underlying channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publishes an event. No-op (event dropped) if there are no subscribers.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::UploadStart { file_id: FileId(1) });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::UploadStart { file_id } if file_id == FileId(1)));
    }
}
