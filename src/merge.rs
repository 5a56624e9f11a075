use crate::adapter::{AdapterResponse, MultipartBody, NetworkAdapter, RequestOptions};
use crate::config::UploadConfig;
use crate::error::{ErrorKind, UploadError};
use crate::file::FileDescriptor;

const URL_FIELD_CANDIDATES: &[&str] = &["url", "fileUrl", "downloadUrl", "path", "location"];

/// Result of a successful merge call.
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub url: String,
    pub data: serde_json::Value,
}

/// Issues the final `mergeUrl` POST once every chunk has uploaded.
pub struct MergeController;

impl MergeController {
    pub async fn merge(
        adapter: &dyn NetworkAdapter,
        file: &FileDescriptor,
        total_chunks: u64,
        config: &UploadConfig,
    ) -> Result<MergeResult, UploadError> {
        let mut body = MultipartBody::new()
            .text("fileId", file.id.to_string())
            .text("fileName", file.name.clone())
            .text("fileType", file.mime.clone())
            .text("fileSize", file.size.to_string())
            .text("totalChunks", total_chunks.to_string());

        for (key, value) in &config.form_data {
            body = body.text(key.clone(), value.clone());
        }

        let options = RequestOptions {
            timeout: None,
            headers: config.headers.clone(),
        };

        let response = adapter
            .post(&config.resolved_merge_url(), body, options)
            .await
            .map_err(|e| e.with_file(file.id))?;

        Ok(Self::parse_response(response))
    }

    fn parse_response(response: AdapterResponse) -> MergeResult {
        let url = Self::extract_url(&response.body).unwrap_or_default();
        MergeResult {
            url,
            data: response.body,
        }
    }

    /// Resolution order: (1) top-level non-empty `url` string; (2)
    /// `data.url`; (3) the first populated field among common aliases; (4)
    /// empty string (caller treats `data` as the raw payload).
    fn extract_url(body: &serde_json::Value) -> Option<String> {
        if let Some(url) = non_empty_str(body, "url") {
            return Some(url);
        }
        if let Some(data) = body.get("data") {
            if let Some(url) = non_empty_str(data, "url") {
                return Some(url);
            }
        }
        for field in URL_FIELD_CANDIDATES {
            if let Some(url) = non_empty_str(body, field) {
                return Some(url);
            }
        }
        None
    }

    pub fn error_for_bad_merge(file_id: crate::file::FileId, message: impl Into<String>) -> UploadError {
        UploadError::new(ErrorKind::ServerError, message).with_file(file_id)
    }
}

fn non_empty_str(value: &serde_json::Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_url_prefers_top_level_url() {
        let body = serde_json::json!({"url": "https://x/file", "data": {"url": "https://y/file"}});
        assert_eq!(MergeController::extract_url(&body), Some("https://x/file".to_string()));
    }

    #[test]
    fn extract_url_falls_back_to_nested_data_url() {
        let body = serde_json::json!({"data": {"url": "https://y/file"}});
        assert_eq!(MergeController::extract_url(&body), Some("https://y/file".to_string()));
    }

    #[test]
    fn extract_url_falls_back_to_common_aliases() {
        let body = serde_json::json!({"downloadUrl": "https://z/file"});
        assert_eq!(MergeController::extract_url(&body), Some("https://z/file".to_string()));
    }

    #[test]
    fn extract_url_returns_none_when_nothing_matches() {
        let body = serde_json::json!({"status": "ok"});
        assert_eq!(MergeController::extract_url(&body), None);
    }
}
