use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkStatus {
    Pending,
    Uploading,
    Success,
    Failed,
    Paused,
}

/// A contiguous, half-open byte range `[start, end)` of the source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub index: u64,
    pub start: u64,
    pub end: u64,
    pub is_last: bool,
    pub status: ChunkStatus,
    pub retry_count: u32,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl ChunkDescriptor {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}
