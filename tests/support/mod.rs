use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chunked_upload_engine::{
    AdapterResponse, BodyPart, ChunkDescriptor, ChunkSource, ErrorKind, FileDescriptor, MultipartBody, NetworkAdapter,
    NetworkInfo, NetworkMonitor, RequestOptions, UploadError,
};

pub fn make_file(name: &str, size: u64, mime: &str) -> FileDescriptor {
    FileDescriptor::new(name, size, mime, 0)
}

pub fn online_monitor() -> Arc<NetworkMonitor> {
    Arc::new(NetworkMonitor::new(NetworkInfo {
        online: true,
        ..Default::default()
    }))
}

pub struct ZeroSource;

#[async_trait]
impl ChunkSource for ZeroSource {
    async fn read_chunk(&self, chunk: &ChunkDescriptor) -> Result<Vec<u8>, UploadError> {
        Ok(vec![0u8; chunk.size() as usize])
    }
}

/// Like `ZeroSource` but yields briefly, giving cancellation a window to land
/// mid-chunk in cancel-focused tests.
pub struct SlowZeroSource;

#[async_trait]
impl ChunkSource for SlowZeroSource {
    async fn read_chunk(&self, chunk: &ChunkDescriptor) -> Result<Vec<u8>, UploadError> {
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        Ok(vec![0u8; chunk.size() as usize])
    }
}

enum AdapterMode {
    AlwaysOk,
    FailChunkOnce(u64),
    AlwaysForbidden,
}

/// Records every POST this test adapter receives, distinguishing chunk
/// requests (carry `chunkIndex`) from merge requests (carry `totalChunks`
/// but no `chunkIndex`).
pub struct RecordingAdapter {
    mode: AdapterMode,
    chunk_posts: AtomicU32,
    merge_posts: AtomicU32,
    chunk_attempts: Mutex<HashMap<u64, u32>>,
    failed_once: Mutex<std::collections::HashSet<u64>>,
}

impl RecordingAdapter {
    pub fn always_ok() -> Self {
        Self::new(AdapterMode::AlwaysOk)
    }

    pub fn fail_chunk_once(index: u64) -> Self {
        Self::new(AdapterMode::FailChunkOnce(index))
    }

    pub fn always_forbidden() -> Self {
        Self::new(AdapterMode::AlwaysForbidden)
    }

    fn new(mode: AdapterMode) -> Self {
        Self {
            mode,
            chunk_posts: AtomicU32::new(0),
            merge_posts: AtomicU32::new(0),
            chunk_attempts: Mutex::new(HashMap::new()),
            failed_once: Mutex::new(std::collections::HashSet::new()),
        }
    }

    pub fn chunk_post_count(&self) -> u32 {
        self.chunk_posts.load(Ordering::SeqCst)
    }

    pub fn merge_post_count(&self) -> u32 {
        self.merge_posts.load(Ordering::SeqCst)
    }

    pub fn chunk_attempts_for(&self, index: u64) -> u32 {
        *self.chunk_attempts.lock().unwrap().get(&index).unwrap_or(&0)
    }
}

#[async_trait]
impl NetworkAdapter for RecordingAdapter {
    async fn post(
        &self,
        _url: &str,
        body: MultipartBody,
        _options: RequestOptions,
    ) -> Result<AdapterResponse, UploadError> {
        let chunk_index = body.fields.iter().find_map(|(k, v)| {
            if k == "chunkIndex" {
                match v {
                    BodyPart::Text(s) => s.parse::<u64>().ok(),
                    _ => None,
                }
            } else {
                None
            }
        });

        if let Some(index) = chunk_index {
            self.chunk_posts.fetch_add(1, Ordering::SeqCst);
            *self.chunk_attempts.lock().unwrap().entry(index).or_insert(0) += 1;

            match &self.mode {
                AdapterMode::AlwaysOk => Ok(AdapterResponse {
                    status: 200,
                    body: serde_json::json!({}),
                }),
                AdapterMode::FailChunkOnce(target) => {
                    let mut failed = self.failed_once.lock().unwrap();
                    if index == *target && !failed.contains(&index) {
                        failed.insert(index);
                        Err(UploadError::new(ErrorKind::Network, "simulated transient failure"))
                    } else {
                        Ok(AdapterResponse {
                            status: 200,
                            body: serde_json::json!({}),
                        })
                    }
                }
                AdapterMode::AlwaysForbidden => {
                    Err(UploadError::new(ErrorKind::AuthorizationFailed, "forbidden").with_retryable(false))
                }
            }
        } else {
            self.merge_posts.fetch_add(1, Ordering::SeqCst);
            Ok(AdapterResponse {
                status: 200,
                body: serde_json::json!({"url": "https://cdn.test/merged"}),
            })
        }
    }
}
