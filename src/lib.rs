pub mod adapter;
pub mod chunk;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod events;
pub mod file;
pub mod merge;
pub mod network;
pub mod performance;
pub mod planner;
pub mod progress;
pub mod resume_store;
pub mod retry;
pub mod task;
pub mod uploader;

pub use adapter::{AdapterResponse, BodyPart, MultipartBody, NetworkAdapter, ReqwestNetworkAdapter, RequestOptions};
pub use chunk::{ChunkDescriptor, ChunkStatus};
pub use config::{ChunkConfig, ChunkSizeStrategy, UploadConfig};
pub use coordinator::{Coordinator, UploadOutcome};
pub use error::{Action, ErrorHandler, ErrorKind, UploadError};
pub use events::{Event, EventBus};
pub use file::{FileDescriptor, FileId, MimeClass};
pub use merge::{MergeController, MergeResult};
pub use network::{NetworkInfo, NetworkMonitor, NetworkType};
pub use performance::{PerformanceTracker, TimingStats};
pub use planner::ChunkPlanner;
pub use progress::{Progress, ProgressTracker};
pub use resume_store::{JsonFileStorage, MemoryStorage, ResumeStore, StorageProvider};
pub use retry::{RetryConfig, RetryController, RetryState};
pub use task::{Task, TaskStatus, TaskStore};
pub use uploader::{CancelHandle, ChunkSource, ChunkUploader, DispatchFailed};

/// Initializes the crate's `tracing` subscriber from `RUST_LOG`/`UPLOAD_LOG`,
/// falling back to `info`. Host applications embedding this engine may call
/// their own subscriber setup instead and skip this entirely.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("UPLOAD_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
