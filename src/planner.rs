use chrono::Utc;

use crate::chunk::{ChunkDescriptor, ChunkStatus};
use crate::error::{ErrorKind, UploadError};
use crate::file::{FileDescriptor, MimeClass};

const MIN_ADAPTIVE_CHUNK: u64 = 256 * 1024;
const MAX_ADAPTIVE_CHUNK: u64 = 10 * 1024 * 1024;
const MIN_CHUNK_COUNT: u64 = 5;
const MAX_CHUNK_COUNT: u64 = 1000;

/// Splits a file into ordered, contiguous chunk descriptors.
pub struct ChunkPlanner;

impl ChunkPlanner {
    /// Plans fixed-size chunks covering `[0, file.size)`.
    ///
    /// `chunkCount = ceil(size / chunk_size)`; the last chunk may be smaller.
    pub fn plan(file: &FileDescriptor, chunk_size: u64) -> Result<Vec<ChunkDescriptor>, UploadError> {
        if file.size == 0 {
            return Err(UploadError::new(
                ErrorKind::InvalidParameter,
                "file size must be greater than zero",
            ));
        }
        if chunk_size == 0 {
            return Err(UploadError::new(
                ErrorKind::InvalidParameter,
                "chunk size must be greater than zero",
            ));
        }

        let chunk_count = file.size.div_ceil(chunk_size);
        let now = Utc::now();
        let mut chunks = Vec::with_capacity(chunk_count as usize);
        let mut start = 0u64;
        for index in 0..chunk_count {
            let end = (start + chunk_size).min(file.size);
            chunks.push(ChunkDescriptor {
                index,
                start,
                end,
                is_last: index == chunk_count - 1,
                status: ChunkStatus::Pending,
                retry_count: 0,
                updated_at: now,
            });
            start = end;
        }
        Ok(chunks)
    }

    /// Derives an adaptive chunk size from file size and MIME class, clamped to
    /// `[256KiB, 10MiB]` and nudged so the resulting chunk count falls in
    /// `[5, 1000]` when feasible, then plans with that size.
    pub fn plan_adaptive(file: &FileDescriptor) -> Result<Vec<ChunkDescriptor>, UploadError> {
        let chunk_size = Self::adaptive_chunk_size(file);
        Self::plan(file, chunk_size)
    }

    pub fn adaptive_chunk_size(file: &FileDescriptor) -> u64 {
        let base = match file.mime_class() {
            MimeClass::Video => 8 * 1024 * 1024,
            MimeClass::Image => 512 * 1024,
            MimeClass::Other => 2 * 1024 * 1024,
        };

        let mut size = base.clamp(MIN_ADAPTIVE_CHUNK, MAX_ADAPTIVE_CHUNK);

        // Nudge so chunk_count lands in [MIN_CHUNK_COUNT, MAX_CHUNK_COUNT] when feasible.
        let count_at = |s: u64| file.size.div_ceil(s.max(1));

        if count_at(size) < MIN_CHUNK_COUNT {
            let target = file.size.div_ceil(MIN_CHUNK_COUNT).max(1);
            size = target.clamp(MIN_ADAPTIVE_CHUNK, MAX_ADAPTIVE_CHUNK);
        } else if count_at(size) > MAX_CHUNK_COUNT {
            let target = file.size.div_ceil(MAX_CHUNK_COUNT).max(1);
            size = target.clamp(MIN_ADAPTIVE_CHUNK, MAX_ADAPTIVE_CHUNK);
        }

        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(size: u64, mime: &str) -> FileDescriptor {
        FileDescriptor::new("f", size, mime, 0)
    }

    #[test]
    fn zero_size_is_rejected() {
        let f = FileDescriptor::new("f", 0, "application/octet-stream", 0);
        let err = ChunkPlanner::plan(&f, 1024).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let f = file(1024, "application/octet-stream");
        let err = ChunkPlanner::plan(&f, 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
    }

    #[test]
    fn exact_multiple_produces_one_last_chunk() {
        let f = file(1024, "application/octet-stream");
        let chunks = ChunkPlanner::plan(&f, 1024).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_last);
    }

    #[test]
    fn remainder_produces_small_last_chunk() {
        let f = file(1025, "application/octet-stream");
        let chunks = ChunkPlanner::plan(&f, 1024).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].size(), 1);
        assert!(chunks[1].is_last);
        assert!(!chunks[0].is_last);
    }

    #[test]
    fn chunks_partition_file_in_order() {
        let f = file(10_000, "application/octet-stream");
        let chunks = ChunkPlanner::plan(&f, 777).unwrap();
        let mut expected_start = 0;
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i as u64);
            assert_eq!(c.start, expected_start);
            assert!(c.start < c.end);
            expected_start = c.end;
        }
        assert_eq!(expected_start, f.size);
    }

    #[test]
    fn planning_twice_is_deterministic() {
        let f = file(10_000, "application/octet-stream");
        let a = ChunkPlanner::plan(&f, 777).unwrap();
        let b = ChunkPlanner::plan(&f, 777).unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.start, y.start);
            assert_eq!(x.end, y.end);
            assert_eq!(x.index, y.index);
            assert_eq!(x.is_last, y.is_last);
        }
    }

    #[test]
    fn adaptive_size_is_clamped() {
        let huge_video = file(50 * 1024 * 1024 * 1024, "video/mp4");
        let size = ChunkPlanner::adaptive_chunk_size(&huge_video);
        assert!(size >= MIN_ADAPTIVE_CHUNK && size <= MAX_ADAPTIVE_CHUNK);

        let tiny_image = file(1024, "image/png");
        let size = ChunkPlanner::adaptive_chunk_size(&tiny_image);
        assert!(size >= MIN_ADAPTIVE_CHUNK && size <= MAX_ADAPTIVE_CHUNK);
    }

    #[test]
    fn adaptive_chunk_count_within_target_when_feasible() {
        let f = file(100 * 1024 * 1024, "application/octet-stream");
        let size = ChunkPlanner::adaptive_chunk_size(&f);
        let count = f.size.div_ceil(size);
        assert!((MIN_CHUNK_COUNT..=MAX_CHUNK_COUNT).contains(&count));
    }
}
