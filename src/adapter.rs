use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use backoff::{future::retry_notify, Error as BackoffError, ExponentialBackoff};

use crate::error::{ErrorKind, UploadError};

/// Options accompanying a `NetworkAdapter::post` call.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub headers: HashMap<String, String>,
}

/// A part of a multipart body: either a plain text field or the chunk bytes.
#[derive(Debug, Clone)]
pub enum BodyPart {
    Text(String),
    Bytes { filename: String, data: Vec<u8> },
}

/// Transport-agnostic multipart request, built by `ChunkUploader`/`MergeController`
/// and sent through whichever `NetworkAdapter` the host supplies.
#[derive(Debug, Clone, Default)]
pub struct MultipartBody {
    pub fields: Vec<(String, BodyPart)>,
}

impl MultipartBody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), BodyPart::Text(value.into())));
        self
    }

    pub fn bytes(mut self, key: impl Into<String>, filename: impl Into<String>, data: Vec<u8>) -> Self {
        self.fields.push((
            key.into(),
            BodyPart::Bytes {
                filename: filename.into(),
                data,
            },
        ));
        self
    }
}

#[derive(Debug, Clone)]
pub struct AdapterResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

/// Transport seam the core dispatches requests through. Kept outside the
/// core's concurrency/retry/state machinery so the engine can be driven by
/// an in-memory adapter in tests without a real HTTP stack.
#[async_trait]
pub trait NetworkAdapter: Send + Sync {
    async fn post(
        &self,
        url: &str,
        body: MultipartBody,
        options: RequestOptions,
    ) -> Result<AdapterResponse, UploadError>;
}

/// Reference `reqwest`-backed adapter. Wraps each request in a short,
/// low-level transient retry via `retry_notify` + `ExponentialBackoff` — a
/// thin connection-hiccup guard, distinct from `RetryController`'s own
/// retry/backoff policy which operates one level up.
pub struct ReqwestNetworkAdapter {
    client: reqwest::Client,
}

impl Default for ReqwestNetworkAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqwestNetworkAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn build_form(body: &MultipartBody) -> reqwest::multipart::Form {
        let mut form = reqwest::multipart::Form::new();
        for (key, part) in &body.fields {
            form = match part {
                BodyPart::Text(value) => form.text(key.clone(), value.clone()),
                BodyPart::Bytes { filename, data } => {
                    let part = reqwest::multipart::Part::bytes(data.clone()).file_name(filename.clone());
                    form.part(key.clone(), part)
                }
            };
        }
        form
    }

    fn classify(status: reqwest::StatusCode) -> ErrorKind {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            ErrorKind::ServerOverload
        } else if status == reqwest::StatusCode::UNAUTHORIZED {
            ErrorKind::AuthenticationFailed
        } else if status == reqwest::StatusCode::FORBIDDEN {
            ErrorKind::AuthorizationFailed
        } else {
            ErrorKind::ServerError
        }
    }
}

#[async_trait]
impl NetworkAdapter for ReqwestNetworkAdapter {
    async fn post(
        &self,
        url: &str,
        body: MultipartBody,
        options: RequestOptions,
    ) -> Result<AdapterResponse, UploadError> {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(2),
            max_elapsed_time: Some(Duration::from_secs(5)),
            multiplier: 2.0,
            randomization_factor: 0.2,
            ..Default::default()
        };

        let result = retry_notify(
            backoff,
            || async {
                let mut request = self.client.post(url).multipart(Self::build_form(&body));
                for (key, value) in &options.headers {
                    request = request.header(key.clone(), value.clone());
                }
                if let Some(timeout) = options.timeout {
                    request = request.timeout(timeout);
                }

                let response = request.send().await.map_err(|e| {
                    if e.is_timeout() {
                        BackoffError::permanent(UploadError::new(ErrorKind::Timeout, e.to_string()))
                    } else if e.is_connect() {
                        BackoffError::transient(UploadError::new(ErrorKind::NetworkDisconnect, e.to_string()))
                    } else {
                        BackoffError::transient(UploadError::new(ErrorKind::Network, e.to_string()))
                    }
                })?;

                let status = response.status();
                if !status.is_success() {
                    let kind = Self::classify(status);
                    let text = response.text().await.unwrap_or_default();
                    let err = UploadError::new(kind, format!("http {status}: {text}"));
                    return Err(if matches!(kind, ErrorKind::ServerOverload) {
                        BackoffError::transient(err)
                    } else {
                        BackoffError::permanent(err)
                    });
                }

                let body = response
                    .json::<serde_json::Value>()
                    .await
                    .unwrap_or(serde_json::Value::Null);
                Ok(AdapterResponse {
                    status: status.as_u16(),
                    body,
                })
            },
            |err: UploadError, dur| {
                tracing::warn!(error = %err, retry_in = ?dur, "transient network error, retrying");
            },
        )
        .await;

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_body_builder_preserves_field_order() {
        let body = MultipartBody::new()
            .text("fileId", "1")
            .bytes("file", "a.txt.part0", vec![1, 2, 3]);
        assert_eq!(body.fields.len(), 2);
        assert_eq!(body.fields[0].0, "fileId");
        assert_eq!(body.fields[1].0, "file");
    }
}
