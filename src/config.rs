use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;

fn default_chunk_size() -> u64 {
    4 * 1024 * 1024
}

fn default_concurrency() -> u32 {
    3
}

fn default_index_base() -> u32 {
    0
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_field_name() -> String {
    "file".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkSizeStrategy {
    Fixed,
    Adaptive,
}

impl Default for ChunkSizeStrategy {
    fn default() -> Self {
        ChunkSizeStrategy::Adaptive
    }
}

/// Chunking knobs, recognized under `chunk.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default)]
    pub sequential: bool,
    #[serde(default = "default_index_base")]
    pub index_base: u32,
    #[serde(default)]
    pub chunk_size_strategy: ChunkSizeStrategy,
    pub merge_url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            concurrency: default_concurrency(),
            sequential: false,
            index_base: default_index_base(),
            chunk_size_strategy: ChunkSizeStrategy::default(),
            merge_url: None,
            max_retries: default_max_retries(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

/// Top-level configuration for a single `Coordinator.process` call. A
/// serde-derived struct with `#[serde(default = "...")]` per-field
/// fallbacks rather than a loosely-typed options bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub target_url: String,
    #[serde(default)]
    pub chunk: ChunkConfig,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub form_data: HashMap<String, String>,
    #[serde(default = "default_field_name")]
    pub file_field_name: String,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl UploadConfig {
    pub fn new(target_url: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            chunk: ChunkConfig::default(),
            headers: HashMap::new(),
            form_data: HashMap::new(),
            file_field_name: default_field_name(),
            retry: RetryConfig::default(),
        }
    }

    /// Resolves the merge endpoint: explicit override if set, else
    /// `target_url + "/merge"`, preserving any query string on `target_url`.
    pub fn resolved_merge_url(&self) -> String {
        if let Some(url) = &self.chunk.merge_url {
            return url.clone();
        }
        match self.target_url.split_once('?') {
            Some((base, query)) => format!("{base}/merge?{query}"),
            None => format!("{}/merge", self.target_url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_url_defaults_to_target_plus_suffix() {
        let cfg = UploadConfig::new("https://api.example.com/upload");
        assert_eq!(cfg.resolved_merge_url(), "https://api.example.com/upload/merge");
    }

    #[test]
    fn merge_url_preserves_query_string() {
        let cfg = UploadConfig::new("https://api.example.com/upload?token=abc");
        assert_eq!(
            cfg.resolved_merge_url(),
            "https://api.example.com/upload/merge?token=abc"
        );
    }

    #[test]
    fn explicit_merge_url_override_wins() {
        let mut cfg = UploadConfig::new("https://api.example.com/upload");
        cfg.chunk.merge_url = Some("https://api.example.com/finish".to_string());
        assert_eq!(cfg.resolved_merge_url(), "https://api.example.com/finish");
    }

    #[test]
    fn deserializes_with_defaults_for_missing_fields() {
        let json = r#"{"target_url": "https://x/upload"}"#;
        let cfg: UploadConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.chunk.concurrency, 3);
        assert_eq!(cfg.file_field_name, "file");
    }
}
