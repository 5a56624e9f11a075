use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, Semaphore};

use crate::adapter::{MultipartBody, NetworkAdapter, RequestOptions};
use crate::chunk::ChunkDescriptor;
use crate::config::UploadConfig;
use crate::error::{ErrorKind, UploadError};
use crate::events::{Event, EventBus};
use crate::file::FileDescriptor;
use crate::progress::ProgressTracker;
use crate::retry::RetryController;
use crate::task::TaskStore;

/// Why an in-flight upload was asked to stop: distinguishes a resumable
/// pause from a permanent cancel, since both cooperatively signal through
/// the same `CancelHandle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Paused,
    Canceled,
}

/// Handed to each in-flight chunk upload; dropping or calling `cancel`/`pause`
/// flips a shared flag the upload future polls between steps.
#[derive(Clone)]
pub struct CancelHandle {
    reason: Arc<StdMutex<Option<StopReason>>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            reason: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn cancel(&self) {
        *self.reason.lock().unwrap() = Some(StopReason::Canceled);
    }

    pub fn pause(&self) {
        *self.reason.lock().unwrap() = Some(StopReason::Paused);
    }

    pub fn is_canceled(&self) -> bool {
        self.reason.lock().unwrap().is_some()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        *self.reason.lock().unwrap()
    }

    /// Builds the error to return from an in-flight step once stopped.
    fn stop_error(&self) -> UploadError {
        match self.stop_reason() {
            Some(StopReason::Paused) => UploadError::paused(),
            _ => UploadError::canceled(),
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate failure carrying the indices that never succeeded.
#[derive(Debug)]
pub struct DispatchFailed {
    pub failed_indices: Vec<u64>,
    pub last_error: Option<UploadError>,
}

impl std::fmt::Display for DispatchFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dispatch failed for chunks {:?}", self.failed_indices)
    }
}
impl std::error::Error for DispatchFailed {}

/// Reads a chunk's bytes from the source file. Abstracted so tests can
/// supply an in-memory byte buffer instead of touching the filesystem.
#[async_trait::async_trait]
pub trait ChunkSource: Send + Sync {
    async fn read_chunk(&self, chunk: &ChunkDescriptor) -> Result<Vec<u8>, UploadError>;
}

/// Uploads individual chunks and owns the concurrent/sequential dispatch
/// loop.
#[derive(Clone)]
pub struct ChunkUploader {
    adapter: Arc<dyn NetworkAdapter>,
    source: Arc<dyn ChunkSource>,
    retry: Arc<RetryController>,
    progress: Arc<ProgressTracker>,
    events: Arc<EventBus>,
    task_store: Arc<TaskStore>,
}

impl ChunkUploader {
    pub fn new(
        adapter: Arc<dyn NetworkAdapter>,
        source: Arc<dyn ChunkSource>,
        retry: Arc<RetryController>,
        progress: Arc<ProgressTracker>,
        events: Arc<EventBus>,
        task_store: Arc<TaskStore>,
    ) -> Self {
        Self {
            adapter,
            source,
            retry,
            progress,
            events,
            task_store,
        }
    }

    /// Uploads a single chunk once, with no retry.
    async fn upload_once(
        &self,
        file: &FileDescriptor,
        chunk: &ChunkDescriptor,
        total_chunks: u64,
        config: &UploadConfig,
        cancel: &CancelHandle,
    ) -> Result<(), UploadError> {
        if cancel.is_canceled() {
            return Err(cancel.stop_error().with_file(file.id).with_chunk(chunk.index));
        }

        let bytes = self.source.read_chunk(chunk).await?;

        let mut body = MultipartBody::new()
            .text("fileId", file.id.to_string())
            .text("fileName", file.name.clone())
            .text("fileType", file.mime.clone())
            .text("fileSize", file.size.to_string())
            .text("chunkIndex", chunk.index.to_string())
            .text("chunkSize", chunk.size().to_string())
            .text("totalChunks", total_chunks.to_string())
            .text("isLast", chunk.is_last.to_string());

        for (key, value) in &config.form_data {
            body = body.text(key.clone(), value.clone());
        }

        let filename = format!("{}.part{}", file.name, chunk.index);
        body = body.bytes(config.file_field_name.clone(), filename, bytes);

        let options = RequestOptions {
            timeout: None,
            headers: config.headers.clone(),
        };

        self.events.publish(Event::ChunkUploadStart {
            file_id: file.id,
            chunk_index: chunk.index,
        });

        if cancel.is_canceled() {
            return Err(cancel.stop_error().with_file(file.id).with_chunk(chunk.index));
        }

        let result = self.adapter.post(&config.target_url, body, options).await;

        match result {
            Ok(_response) => {
                self.events.publish(Event::ChunkUploaded {
                    file_id: file.id,
                    chunk_index: chunk.index,
                });
                self.events.publish(Event::ChunkProgress {
                    file_id: file.id,
                    chunk_index: chunk.index,
                    loaded: chunk.size(),
                    size: chunk.size(),
                });
                Ok(())
            }
            Err(_err) if cancel.is_canceled() => {
                Err(cancel.stop_error().with_file(file.id).with_chunk(chunk.index))
            }
            Err(err) => {
                self.events.publish(Event::ChunkError {
                    file_id: file.id,
                    chunk_index: chunk.index,
                    message: err.message.clone(),
                });
                Err(err.with_file(file.id).with_chunk(chunk.index))
            }
        }
    }

    /// Uploads a single chunk, retrying through `RetryController` on failure.
    pub async fn upload_chunk(
        &self,
        file: &FileDescriptor,
        chunk: &ChunkDescriptor,
        total_chunks: u64,
        config: &UploadConfig,
        cancel: &CancelHandle,
    ) -> Result<(), UploadError> {
        let result = match self.upload_once(file, chunk, total_chunks, config, cancel).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind == ErrorKind::Canceled || err.kind == ErrorKind::Paused => Err(err),
            Err(err) => {
                let outcome = self
                    .retry
                    .retry(file.id, Some(chunk.index), err, || {
                        self.upload_once(file, chunk, total_chunks, config, cancel)
                    })
                    .await;
                outcome.map_err(|exhausted| exhausted.last_error)
            }
        };

        if let Some(state) = self.retry.state_snapshot(file.id) {
            if let Some(&count) = state.chunk_retries.get(&chunk.index) {
                let _ = self.task_store.set_chunk_retry_count(file.id, chunk.index, count);
            }
        }

        result
    }

    /// Drives the full dispatch loop across every pending chunk for a task.
    /// `sequential` uploads in index order; otherwise fans out up to
    /// `config.chunk.concurrency` at once.
    pub async fn dispatch(
        &self,
        file: &FileDescriptor,
        chunks: Vec<ChunkDescriptor>,
        config: &UploadConfig,
        cancel: &CancelHandle,
    ) -> Result<(), DispatchFailed> {
        let total_chunks = chunks.len() as u64;
        let pending: Vec<ChunkDescriptor> = chunks
            .into_iter()
            .filter(|c| c.status != crate::chunk::ChunkStatus::Success)
            .collect();

        if config.chunk.sequential {
            self.dispatch_sequential(file, pending, total_chunks, config, cancel).await
        } else {
            self.dispatch_concurrent(file, pending, total_chunks, config, cancel).await
        }
    }

    async fn dispatch_sequential(
        &self,
        file: &FileDescriptor,
        chunks: Vec<ChunkDescriptor>,
        total_chunks: u64,
        config: &UploadConfig,
        cancel: &CancelHandle,
    ) -> Result<(), DispatchFailed> {
        let mut failed_indices = Vec::new();
        let mut last_error = None;
        for chunk in &chunks {
            self.task_store.register_in_flight(file.id, chunk.index);
            let result = self.upload_chunk(file, chunk, total_chunks, config, cancel).await;
            self.task_store.remove_in_flight(file.id, chunk.index);
            match result {
                Ok(()) => {
                    let _ = self.task_store.mark_chunk_uploaded(file.id, chunk.index);
                    self.report_progress(file.id);
                }
                Err(err) => {
                    failed_indices.push(chunk.index);
                    last_error = Some(err);
                    break;
                }
            }
        }
        if failed_indices.is_empty() {
            Ok(())
        } else {
            Err(DispatchFailed {
                failed_indices,
                last_error,
            })
        }
    }

    async fn dispatch_concurrent(
        &self,
        file: &FileDescriptor,
        chunks: Vec<ChunkDescriptor>,
        total_chunks: u64,
        config: &UploadConfig,
        cancel: &CancelHandle,
    ) -> Result<(), DispatchFailed> {
        let concurrency = config.chunk.concurrency.max(1) as usize;
        let max_retries = config.chunk.max_retries;
        let max_consecutive_failures = config.chunk.max_consecutive_failures;

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let (tx, mut rx) = mpsc::unbounded_channel::<(u64, Result<(), UploadError>)>();

        let mut by_index: HashMap<u64, ChunkDescriptor> =
            chunks.iter().map(|c| (c.index, c.clone())).collect();
        let mut queue: VecDeque<u64> = chunks.iter().map(|c| c.index).collect();
        let mut retry_counts: HashMap<u64, u32> = HashMap::new();
        let mut in_flight: HashSet<u64> = HashSet::new();
        let mut permanently_failed: Vec<u64> = Vec::new();
        let consecutive_failures = Arc::new(AtomicU32::new(0));
        let mut last_error = None;
        let mut aborted = false;

        while !(queue.is_empty() && in_flight.is_empty()) {
            while in_flight.len() < concurrency && !queue.is_empty() && !aborted {
                let index = queue.pop_front().unwrap();
                let chunk = by_index.get(&index).unwrap().clone();
                in_flight.insert(index);
                self.task_store.register_in_flight(file.id, index);

                let permit = semaphore.clone().acquire_owned().await.unwrap();
                let inner = self.clone();
                let file = file.clone();
                let config = config.clone();
                let cancel = cancel.clone();
                let tx = tx.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    let result = inner.upload_chunk(&file, &chunk, total_chunks, &config, &cancel).await;
                    let _ = tx.send((index, result));
                });
            }

            if aborted {
                break;
            }

            let Some((index, result)) = rx.recv().await else {
                break;
            };
            in_flight.remove(&index);
            self.task_store.remove_in_flight(file.id, index);

            match result {
                Ok(()) => {
                    consecutive_failures.store(0, Ordering::SeqCst);
                    by_index.remove(&index);
                    let _ = self.task_store.mark_chunk_uploaded(file.id, index);
                    self.report_progress(file.id);
                }
                Err(err) if err.kind == ErrorKind::Canceled || err.kind == ErrorKind::Paused => {
                    aborted = true;
                    last_error = Some(err);
                }
                Err(err) => {
                    let failures = consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    let count = retry_counts.entry(index).or_insert(0);
                    *count += 1;

                    if failures >= max_consecutive_failures {
                        aborted = true;
                        last_error = Some(err);
                        permanently_failed.push(index);
                    } else if *count <= max_retries {
                        queue.push_back(index);
                        last_error = Some(err);
                    } else {
                        permanently_failed.push(index);
                        last_error = Some(err);
                    }
                }
            }
        }

        drop(tx);
        while let Ok((index, result)) = rx.try_recv() {
            in_flight.remove(&index);
            if let Err(err) = result {
                if err.kind != ErrorKind::Canceled && err.kind != ErrorKind::Paused {
                    permanently_failed.push(index);
                }
            }
        }

        if permanently_failed.is_empty() && !aborted {
            Ok(())
        } else {
            Err(DispatchFailed {
                failed_indices: permanently_failed,
                last_error,
            })
        }
    }

    fn report_progress(&self, file_id: crate::file::FileId) {
        if let Some(snapshot) = self.task_store.snapshot(file_id) {
            let progress = self.progress.update(file_id, snapshot.uploaded_bytes);
            self.events.publish(Event::UploadProgress {
                file_id,
                percent: progress.percent,
                loaded: progress.loaded,
                total: progress.total,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileDescriptor;
    use crate::planner::ChunkPlanner;
    use std::sync::atomic::AtomicU32 as StdAtomicU32;

    struct InMemorySource;

    #[async_trait::async_trait]
    impl ChunkSource for InMemorySource {
        async fn read_chunk(&self, chunk: &ChunkDescriptor) -> Result<Vec<u8>, UploadError> {
            Ok(vec![0u8; chunk.size() as usize])
        }
    }

    struct FlakyAdapter {
        calls: StdAtomicU32,
        fail_first_n: u32,
    }

    #[async_trait::async_trait]
    impl NetworkAdapter for FlakyAdapter {
        async fn post(
            &self,
            _url: &str,
            _body: MultipartBody,
            _options: RequestOptions,
        ) -> Result<crate::adapter::AdapterResponse, UploadError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first_n {
                Err(UploadError::new(ErrorKind::Network, "transient"))
            } else {
                Ok(crate::adapter::AdapterResponse {
                    status: 200,
                    body: serde_json::json!({}),
                })
            }
        }
    }

    fn build_uploader(
        adapter: Arc<dyn NetworkAdapter>,
        task_store: Arc<TaskStore>,
    ) -> (ChunkUploader, Arc<EventBus>) {
        let events = Arc::new(EventBus::new());
        let network = Arc::new(crate::network::NetworkMonitor::new(crate::network::NetworkInfo {
            online: true,
            ..Default::default()
        }));
        let error_handler = Arc::new(crate::error::ErrorHandler::new());
        let retry = Arc::new(RetryController::new(
            crate::retry::RetryConfig {
                base_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(5),
                ..Default::default()
            },
            error_handler,
            network,
            None,
            events.clone(),
            "device".into(),
            "session".into(),
        ));
        let progress = Arc::new(ProgressTracker::default());
        (
            ChunkUploader::new(adapter, Arc::new(InMemorySource), retry, progress, events.clone(), task_store),
            events,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_uploads_every_chunk() {
        let adapter: Arc<dyn NetworkAdapter> = Arc::new(FlakyAdapter {
            calls: StdAtomicU32::new(0),
            fail_first_n: 0,
        });
        let file = FileDescriptor::new("video.mp4", 3 * 1024 * 1024, "video/mp4", 0);
        let chunks = ChunkPlanner::plan(&file, 1024 * 1024).unwrap();
        let task_store = Arc::new(TaskStore::new());
        task_store.create(crate::task::Task::new(file.clone(), chunks.clone(), 1024 * 1024)).unwrap();
        let (uploader, _events) = build_uploader(adapter, task_store.clone());

        let config = UploadConfig::new("https://example.test/upload");
        let cancel = CancelHandle::new();
        let result = uploader.dispatch(&file, chunks, &config, &cancel).await;
        assert!(result.is_ok());
        let snap = task_store.snapshot(file.id).unwrap();
        assert_eq!(snap.uploaded_chunks, snap.chunk_count);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_recovers_through_retry() {
        let adapter: Arc<dyn NetworkAdapter> = Arc::new(FlakyAdapter {
            calls: StdAtomicU32::new(0),
            fail_first_n: 1,
        });
        let file = FileDescriptor::new("a.bin", 10, "application/octet-stream", 0);
        let chunks = ChunkPlanner::plan(&file, 10).unwrap();
        let task_store = Arc::new(TaskStore::new());
        task_store.create(crate::task::Task::new(file.clone(), chunks.clone(), 10)).unwrap();
        let (uploader, _events) = build_uploader(adapter, task_store);

        let config = UploadConfig::new("https://example.test/upload");
        let cancel = CancelHandle::new();
        let dispatch = uploader.dispatch(&file, chunks, &config, &cancel);
        tokio::time::timeout(std::time::Duration::from_secs(5), dispatch)
            .await
            .expect("dispatch should not hang")
            .expect("dispatch should eventually succeed");
    }
}
