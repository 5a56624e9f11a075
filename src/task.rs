use std::collections::{HashMap, HashSet};
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk::ChunkDescriptor;
use crate::error::UploadError;
use crate::file::{FileDescriptor, FileId};

/// Lifecycle state of an upload task: `Pending -> Uploading -> Merging ->
/// Completed`, with `Paused`/`Canceled`/`Failed` reachable from `Uploading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Uploading,
    Paused,
    Merging,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Uploading)
                | (Pending, Canceled)
                | (Uploading, Paused)
                | (Uploading, Merging)
                | (Uploading, Failed)
                | (Uploading, Canceled)
                | (Paused, Uploading)
                | (Paused, Canceled)
                | (Merging, Completed)
                | (Merging, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub file: FileDescriptor,
    pub chunks: Vec<ChunkDescriptor>,
    pub status: TaskStatus,
    pub chunk_size: u64,
    pub uploaded_bytes: u64,
    pub url: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(file: FileDescriptor, chunks: Vec<ChunkDescriptor>, chunk_size: u64) -> Self {
        let now = Utc::now();
        Self {
            file,
            chunks,
            status: TaskStatus::Pending,
            chunk_size,
            uploaded_bytes: 0,
            url: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunks.len() as u64
    }

    pub fn uploaded_chunk_count(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.status == crate::chunk::ChunkStatus::Success)
            .count() as u64
    }

    pub fn is_complete(&self) -> bool {
        self.uploaded_chunk_count() == self.chunk_count()
    }
}

/// Returned by `TaskStore::set_status` when `from -> to` isn't a legal move.
#[derive(Debug)]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot transition task status from {:?} to {:?}", self.from, self.to)
    }
}
impl std::error::Error for InvalidTransition {}

#[derive(Debug)]
pub enum SetStatusError {
    NotFound,
    InvalidTransition(InvalidTransition),
}

impl std::fmt::Display for SetStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetStatusError::NotFound => write!(f, "no task registered for this file"),
            SetStatusError::InvalidTransition(t) => t.fmt(f),
        }
    }
}
impl std::error::Error for SetStatusError {}

#[derive(Debug)]
pub struct TaskConflict;

impl std::fmt::Display for TaskConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "a task is already registered for this file")
    }
}
impl std::error::Error for TaskConflict {}

#[derive(Debug)]
pub struct TaskNotFound;

impl std::fmt::Display for TaskNotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no task registered for this file")
    }
}
impl std::error::Error for TaskNotFound {}

/// Snapshot of a task's progress-relevant fields, safe to hand to callers
/// without exposing the lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub file_id: FileId,
    pub status: TaskStatus,
    pub chunk_count: u64,
    pub uploaded_chunks: u64,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub url: Option<String>,
    pub error: Option<String>,
}

/// In-process registry of in-flight/paused upload tasks, keyed by `FileId`.
///
/// A plain `std::sync::Mutex` is adequate since critical sections never hold
/// the lock across an `.await`.
#[derive(Default)]
pub struct TaskStore {
    tasks: StdMutex<HashMap<FileId, Task>>,
    in_flight: StdMutex<HashSet<(FileId, u64)>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, task: Task) -> Result<(), TaskConflict> {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.contains_key(&task.file.id) {
            return Err(TaskConflict);
        }
        tasks.insert(task.file.id, task);
        Ok(())
    }

    pub fn get(&self, file_id: FileId) -> Option<Task> {
        self.tasks.lock().unwrap().get(&file_id).cloned()
    }

    pub fn snapshot(&self, file_id: FileId) -> Option<TaskSnapshot> {
        self.tasks.lock().unwrap().get(&file_id).map(|task| TaskSnapshot {
            file_id: task.file.id,
            status: task.status,
            chunk_count: task.chunk_count(),
            uploaded_chunks: task.uploaded_chunk_count(),
            uploaded_bytes: task.uploaded_bytes,
            total_bytes: task.file.size,
            url: task.url.clone(),
            error: task.error.clone(),
        })
    }

    /// Moves `file_id` to `status`, rejecting the change if it isn't a legal
    /// transition from the task's current status. A no-op transition to the
    /// same status always succeeds.
    pub fn set_status(&self, file_id: FileId, status: TaskStatus) -> Result<(), SetStatusError> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(&file_id).ok_or(SetStatusError::NotFound)?;
        if task.status == status {
            return Ok(());
        }
        if !task.status.can_transition_to(status) {
            return Err(SetStatusError::InvalidTransition(InvalidTransition {
                from: task.status,
                to: status,
            }));
        }
        task.status = status;
        task.updated_at = Utc::now();
        Ok(())
    }

    pub fn set_error(&self, file_id: FileId, error: &UploadError) -> Result<(), TaskNotFound> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(&file_id).ok_or(TaskNotFound)?;
        task.status = TaskStatus::Failed;
        task.error = Some(error.message.clone());
        task.updated_at = Utc::now();
        Ok(())
    }

    /// Records that the task is paused, independent of `status`: distinct
    /// from `set_error`, this never forces `Failed`.
    pub fn set_paused_marker(&self, file_id: FileId) -> Result<(), TaskNotFound> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(&file_id).ok_or(TaskNotFound)?;
        task.error = Some(UploadError::paused().message);
        task.updated_at = Utc::now();
        Ok(())
    }

    pub fn clear_error(&self, file_id: FileId) -> Result<(), TaskNotFound> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(&file_id).ok_or(TaskNotFound)?;
        task.error = None;
        task.updated_at = Utc::now();
        Ok(())
    }

    pub fn set_url(&self, file_id: FileId, url: String) -> Result<(), TaskNotFound> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(&file_id).ok_or(TaskNotFound)?;
        task.url = Some(url);
        task.updated_at = Utc::now();
        Ok(())
    }

    /// Marks a chunk uploaded and advances `uploaded_bytes`. Idempotent: a
    /// chunk's byte range is only ever counted once.
    pub fn mark_chunk_uploaded(&self, file_id: FileId, chunk_index: u64) -> Result<(), TaskNotFound> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(&file_id).ok_or(TaskNotFound)?;
        let chunk = task
            .chunks
            .iter_mut()
            .find(|c| c.index == chunk_index)
            .ok_or(TaskNotFound)?;
        if chunk.status != crate::chunk::ChunkStatus::Success {
            task.uploaded_bytes += chunk.size();
            chunk.status = crate::chunk::ChunkStatus::Success;
            chunk.updated_at = Utc::now();
        }
        task.updated_at = Utc::now();
        Ok(())
    }

    /// Writes back the authoritative retry count for a chunk (sourced from
    /// `RetryController`'s own bookkeeping) so it's observable on the task.
    pub fn set_chunk_retry_count(&self, file_id: FileId, chunk_index: u64, retry_count: u32) -> Result<(), TaskNotFound> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(&file_id).ok_or(TaskNotFound)?;
        let chunk = task
            .chunks
            .iter_mut()
            .find(|c| c.index == chunk_index)
            .ok_or(TaskNotFound)?;
        chunk.retry_count = retry_count;
        chunk.updated_at = Utc::now();
        Ok(())
    }

    pub fn set_chunk_status(
        &self,
        file_id: FileId,
        chunk_index: u64,
        status: crate::chunk::ChunkStatus,
    ) -> Result<(), TaskNotFound> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(&file_id).ok_or(TaskNotFound)?;
        let chunk = task
            .chunks
            .iter_mut()
            .find(|c| c.index == chunk_index)
            .ok_or(TaskNotFound)?;
        chunk.status = status;
        chunk.updated_at = Utc::now();
        Ok(())
    }

    /// Registers a chunk as actively uploading. Returns `false` (no-op) if
    /// already registered, preventing the same chunk from being dispatched
    /// twice concurrently.
    pub fn register_in_flight(&self, file_id: FileId, chunk_index: u64) -> bool {
        self.in_flight.lock().unwrap().insert((file_id, chunk_index))
    }

    pub fn remove_in_flight(&self, file_id: FileId, chunk_index: u64) {
        self.in_flight.lock().unwrap().remove(&(file_id, chunk_index));
    }

    pub fn is_in_flight(&self, file_id: FileId, chunk_index: u64) -> bool {
        self.in_flight.lock().unwrap().contains(&(file_id, chunk_index))
    }

    pub fn abort_all(&self, file_id: FileId) {
        self.in_flight.lock().unwrap().retain(|(id, _)| *id != file_id);
    }

    pub fn remove(&self, file_id: FileId) -> Option<Task> {
        self.abort_all(file_id);
        self.tasks.lock().unwrap().remove(&file_id)
    }

    pub fn clear_all(&self) {
        self.tasks.lock().unwrap().clear();
        self.in_flight.lock().unwrap().clear();
    }

    pub fn active_file_ids(&self) -> Vec<FileId> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, t)| !t.status.is_terminal())
            .map(|(id, _)| *id)
            .collect()
    }
}
