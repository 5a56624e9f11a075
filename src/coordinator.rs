use std::collections::HashMap;
use std::sync::Arc;

use crate::adapter::NetworkAdapter;
use crate::config::UploadConfig;
use crate::device::{device_id, new_session_id};
use crate::error::{ErrorHandler, ErrorKind, UploadError};
use crate::events::{Event, EventBus};
use crate::file::{FileDescriptor, FileId};
use crate::merge::MergeController;
use crate::network::NetworkMonitor;
use crate::performance::PerformanceTracker;
use crate::planner::ChunkPlanner;
use crate::progress::ProgressTracker;
use crate::resume_store::ResumeStore;
use crate::retry::RetryController;
use crate::task::{Task, TaskStatus, TaskStore};
use crate::uploader::{CancelHandle, ChunkSource, ChunkUploader};

/// Outcome of a completed upload.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub file_id: FileId,
    pub url: String,
}

/// A dispatch that's currently running or paused mid-flight, kept around so
/// `resume_task` has enough context to restart it.
#[derive(Clone)]
struct ActiveUpload {
    adapter: Arc<dyn NetworkAdapter>,
    config: UploadConfig,
    cancel: CancelHandle,
    uploader: ChunkUploader,
}

/// Top-level facade wiring every subsystem together: plans chunks, drives
/// dispatch, merges, and exposes pause/resume/cancel.
pub struct Coordinator {
    task_store: Arc<TaskStore>,
    progress: Arc<ProgressTracker>,
    performance: Arc<PerformanceTracker>,
    events: Arc<EventBus>,
    network: Arc<NetworkMonitor>,
    error_handler: Arc<ErrorHandler>,
    resume_store: Option<Arc<ResumeStore>>,
    active: std::sync::Mutex<HashMap<FileId, ActiveUpload>>,
    device_id: String,
    session_id: String,
}

impl Coordinator {
    pub fn new(network: Arc<NetworkMonitor>, resume_store: Option<Arc<ResumeStore>>) -> Self {
        let events = Arc::new(EventBus::new());
        Self {
            task_store: Arc::new(TaskStore::new()),
            progress: Arc::new(ProgressTracker::default()),
            performance: Arc::new(PerformanceTracker::new(events.clone())),
            events,
            network,
            error_handler: Arc::new(ErrorHandler::new()),
            resume_store,
            active: std::sync::Mutex::new(HashMap::new()),
            device_id: device_id(),
            session_id: new_session_id(),
        }
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn task_store(&self) -> Arc<TaskStore> {
        self.task_store.clone()
    }

    /// Plans, dispatches, and merges a single file end-to-end.
    pub async fn process(
        &self,
        file: FileDescriptor,
        adapter: Arc<dyn NetworkAdapter>,
        source: Arc<dyn ChunkSource>,
        config: UploadConfig,
    ) -> Result<UploadOutcome, UploadError> {
        self.events.publish(Event::UploadStart { file_id: file.id });

        let chunks = match config.chunk.chunk_size_strategy {
            crate::config::ChunkSizeStrategy::Adaptive => ChunkPlanner::plan_adaptive(&file),
            crate::config::ChunkSizeStrategy::Fixed => ChunkPlanner::plan(&file, config.chunk.chunk_size),
        }?;
        let chunk_size = chunks.first().map(|c| c.size()).unwrap_or(config.chunk.chunk_size);

        self.events.publish(Event::ChunkTaskCreated {
            file_id: file.id,
            chunk_count: chunks.len() as u64,
        });

        self.task_store
            .create(Task::new(file.clone(), chunks.clone(), chunk_size))
            .map_err(|_| UploadError::new(ErrorKind::FileError, "task already exists for this file"))?;
        self.progress.start(file.id, file.size);

        let cancel = CancelHandle::new();
        let retry = Arc::new(RetryController::new(
            config.retry.clone(),
            self.error_handler.clone(),
            self.network.clone(),
            self.resume_store.clone(),
            self.events.clone(),
            self.device_id.clone(),
            self.session_id.clone(),
        ));
        let uploader = ChunkUploader::new(
            adapter.clone(),
            source,
            retry,
            self.progress.clone(),
            self.events.clone(),
            self.task_store.clone(),
        );

        self.active.lock().unwrap().insert(
            file.id,
            ActiveUpload {
                adapter: adapter.clone(),
                config: config.clone(),
                cancel: cancel.clone(),
                uploader: uploader.clone(),
            },
        );

        self.task_store
            .set_status(file.id, TaskStatus::Uploading)
            .map_err(|_| UploadError::new(ErrorKind::FileError, "task disappeared"))?;

        let result = self
            .run_dispatch_and_merge(&file, &uploader, chunks, &config, &cancel, adapter)
            .await;

        if !matches!(&result, Err(e) if e.kind == ErrorKind::Paused) {
            self.active.lock().unwrap().remove(&file.id);
        }

        result
    }

    /// Restarts dispatch for a task that was previously paused, reusing the
    /// adapter/config/retry state captured when it was first started.
    pub async fn resume_task(&self, file_id: FileId) -> Result<UploadOutcome, UploadError> {
        let task = self
            .task_store
            .get(file_id)
            .ok_or_else(|| UploadError::new(ErrorKind::FileError, "no such task"))?;
        if task.status != TaskStatus::Paused {
            return Err(UploadError::new(ErrorKind::FileError, "task is not paused"));
        }

        let mut active = self
            .active
            .lock()
            .unwrap()
            .get(&file_id)
            .cloned()
            .ok_or_else(|| UploadError::new(ErrorKind::FileError, "no active upload to resume"))?;

        let cancel = CancelHandle::new();
        active.cancel = cancel.clone();
        self.active.lock().unwrap().insert(file_id, active.clone());

        self.task_store
            .set_status(file_id, TaskStatus::Uploading)
            .map_err(|_| UploadError::new(ErrorKind::FileError, "task disappeared"))?;
        self.task_store.clear_error(file_id).ok();
        self.events.publish(Event::UploadResume { file_id });

        let result = self
            .run_dispatch_and_merge(&task.file, &active.uploader, task.chunks, &active.config, &cancel, active.adapter.clone())
            .await;

        if !matches!(&result, Err(e) if e.kind == ErrorKind::Paused) {
            self.active.lock().unwrap().remove(&file_id);
        }

        result
    }

    /// Runs dispatch to completion, then merge, translating the
    /// cooperative pause/cancel stop-signal into the matching task status.
    async fn run_dispatch_and_merge(
        &self,
        file: &FileDescriptor,
        uploader: &ChunkUploader,
        chunks: Vec<crate::chunk::ChunkDescriptor>,
        config: &UploadConfig,
        cancel: &CancelHandle,
        adapter: Arc<dyn NetworkAdapter>,
    ) -> Result<UploadOutcome, UploadError> {
        let dispatch_timer = self.performance.start_timing("upload", "dispatch", Some(file.id));
        let dispatch_result = uploader.dispatch(file, chunks, config, cancel).await;
        self.performance.end(dispatch_timer);

        if let Err(failed) = dispatch_result {
            let err = failed
                .last_error
                .unwrap_or_else(|| UploadError::new(ErrorKind::ChunkUploadFailed, "chunk upload failed"));
            return Err(self.handle_stopped_dispatch(file.id, err));
        }

        if let Some(reason) = cancel.stop_reason() {
            let err = match reason {
                crate::uploader::StopReason::Paused => UploadError::paused().with_file(file.id),
                crate::uploader::StopReason::Canceled => UploadError::canceled().with_file(file.id),
            };
            return Err(self.handle_stopped_dispatch(file.id, err));
        }

        self.task_store
            .set_status(file.id, TaskStatus::Merging)
            .map_err(|_| UploadError::new(ErrorKind::FileError, "task disappeared"))?;
        self.events.publish(Event::ChunkMergeStart { file_id: file.id });

        let merge_timer = self.performance.start_timing("upload", "merge", Some(file.id));
        let merge_result = MergeController::merge(
            adapter.as_ref(),
            file,
            self.task_store.get(file.id).map(|t| t.chunk_count()).unwrap_or_default(),
            config,
        )
        .await;
        self.performance.end(merge_timer);

        match merge_result {
            Ok(merged) => {
                self.task_store.set_url(file.id, merged.url.clone()).ok();
                self.task_store.set_status(file.id, TaskStatus::Completed).ok();
                self.progress.complete(file.id);
                self.events.publish(Event::ChunkMergeComplete {
                    file_id: file.id,
                    url: merged.url.clone(),
                });
                self.events.publish(Event::UploadComplete {
                    file_id: file.id,
                    url: merged.url.clone(),
                });
                if let Some(store) = &self.resume_store {
                    let _ = store.delete(file.id).await;
                }
                Ok(UploadOutcome {
                    file_id: file.id,
                    url: merged.url,
                })
            }
            Err(err) => {
                self.events.publish(Event::ChunkMergeError {
                    file_id: file.id,
                    message: err.message.clone(),
                });
                let _ = self.task_store.set_error(file.id, &err);
                Err(err)
            }
        }
    }

    /// Applies the status transition matching why dispatch stopped, and
    /// publishes `ChunkTaskError` for genuine failures (pause/cancel already
    /// publish their own event from the call that triggered them).
    fn handle_stopped_dispatch(&self, file_id: FileId, err: UploadError) -> UploadError {
        match err.kind {
            ErrorKind::Paused => {
                let _ = self.task_store.set_status(file_id, TaskStatus::Paused);
                let _ = self.task_store.set_paused_marker(file_id);
            }
            ErrorKind::Canceled => {
                let _ = self.task_store.set_status(file_id, TaskStatus::Canceled);
            }
            _ => {
                self.events.publish(Event::ChunkTaskError {
                    file_id,
                    message: err.message.clone(),
                });
                let _ = self.task_store.set_error(file_id, &err);
            }
        }
        err
    }

    /// Signals the in-flight dispatch loop to stop without discarding
    /// progress; the loop itself transitions the task to `Paused` once it
    /// observes the signal.
    pub fn pause(&self, file_id: FileId) -> Result<(), UploadError> {
        let active = self.active.lock().unwrap();
        let entry = active
            .get(&file_id)
            .ok_or_else(|| UploadError::new(ErrorKind::FileError, "no active upload for this file"))?;
        entry.cancel.pause();
        drop(active);
        self.events.publish(Event::UploadPause { file_id });
        Ok(())
    }

    pub fn cancel(&self, file_id: FileId) {
        if let Some(entry) = self.active.lock().unwrap().get(&file_id) {
            entry.cancel.cancel();
        }
        self.task_store.abort_all(file_id);

        let status = self.task_store.snapshot(file_id).map(|s| s.status);
        if matches!(status, Some(TaskStatus::Pending) | Some(TaskStatus::Paused)) {
            let _ = self.task_store.set_status(file_id, TaskStatus::Canceled);
            self.active.lock().unwrap().remove(&file_id);
        }

        self.events.publish(Event::UploadCancel { file_id });
    }

    pub async fn cleanup(&self, file_id: FileId) {
        self.task_store.remove(file_id);
        self.progress.remove(file_id);
        self.active.lock().unwrap().remove(&file_id);
        if let Some(store) = &self.resume_store {
            let _ = store.delete(file_id).await;
        }
    }
}
