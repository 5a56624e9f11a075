use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::file::FileId;

/// Closed set of error kinds the engine can classify a failure into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    NetworkDisconnect,
    ServerError,
    ServerOverload,
    Timeout,
    ChunkUploadFailed,
    InvalidChunkSize,
    InvalidParameter,
    QuotaExceeded,
    AuthenticationFailed,
    AuthorizationFailed,
    FileError,
    StorageError,
    Canceled,
    Paused,
    Unknown,
}

impl ErrorKind {
    /// Default retryability before any explicit override.
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network
                | ErrorKind::NetworkDisconnect
                | ErrorKind::ServerError
                | ErrorKind::ServerOverload
                | ErrorKind::Timeout
                | ErrorKind::ChunkUploadFailed
        )
    }

    /// Bucket used to look up `max_retries_for_kind` and backoff multipliers.
    pub fn bucket(self) -> RetryBucket {
        match self {
            ErrorKind::Network | ErrorKind::NetworkDisconnect => RetryBucket::Network,
            ErrorKind::ServerError | ErrorKind::ServerOverload => RetryBucket::Server,
            ErrorKind::Timeout => RetryBucket::Timeout,
            _ => RetryBucket::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetryBucket {
    Network,
    Server,
    Timeout,
    Unknown,
}

/// A classified engine error, with an optional preserved cause chain.
#[derive(Debug)]
pub struct UploadError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub timestamp: SystemTime,
    pub file_id: Option<FileId>,
    pub chunk_index: Option<u64>,
    pub details: Option<serde_json::Value>,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl UploadError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let retryable = kind.default_retryable();
        Self {
            kind,
            message: message.into(),
            retryable,
            timestamp: SystemTime::now(),
            file_id: None,
            chunk_index: None,
            details: None,
            cause: None,
        }
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_file(mut self, file_id: FileId) -> Self {
        self.file_id = Some(file_id);
        self
    }

    pub fn with_chunk(mut self, chunk_index: u64) -> Self {
        self.chunk_index = Some(chunk_index);
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn canceled() -> Self {
        Self::new(ErrorKind::Canceled, "operation canceled").with_retryable(false)
    }

    pub fn paused() -> Self {
        Self::new(ErrorKind::Paused, "operation paused").with_retryable(false)
    }
}

impl Clone for UploadError {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            retryable: self.retryable,
            timestamp: self.timestamp,
            file_id: self.file_id,
            chunk_index: self.chunk_index,
            details: self.details.clone(),
            // The underlying cause isn't `Clone`-able in general; a classified
            // error's kind/message already carries what downstream code needs.
            cause: None,
        }
    }
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for UploadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Outcome of `ErrorHandler::handle`.
#[derive(Debug, Clone)]
pub enum Action {
    Retry { delay: Duration },
    WaitForConnection,
    AdjustAndRetry { new_chunk_size: u64 },
    Fail { recoverable: bool },
}

/// Context passed into `ErrorHandler::handle` describing retry history so far.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub retry_count: u32,
    pub max_retries: u32,
    pub chunk_size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct MaxRetriesForKind {
    pub network: u32,
    pub server: u32,
    pub timeout: u32,
    pub unknown: u32,
}

impl Default for MaxRetriesForKind {
    fn default() -> Self {
        Self {
            network: 5,
            server: 3,
            timeout: 3,
            unknown: 1,
        }
    }
}

impl MaxRetriesForKind {
    pub fn for_bucket(&self, bucket: RetryBucket) -> u32 {
        match bucket {
            RetryBucket::Network => self.network,
            RetryBucket::Server => self.server,
            RetryBucket::Timeout => self.timeout,
            RetryBucket::Unknown => self.unknown,
        }
    }
}

/// Classifies errors and decides the appropriate recovery action.
pub struct ErrorHandler {
    pub max_retries_for_kind: MaxRetriesForKind,
    /// Global `maxRetries` override; `None` means "use per-kind table".
    pub global_max_retries: Option<u32>,
    buffer: std::sync::Mutex<Vec<UploadError>>,
    buffer_cap: usize,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self {
            max_retries_for_kind: MaxRetriesForKind::default(),
            global_max_retries: None,
            buffer: std::sync::Mutex::new(Vec::new()),
            buffer_cap: 1000,
        }
    }

    fn max_retries_for(&self, kind: ErrorKind) -> u32 {
        self.global_max_retries
            .unwrap_or_else(|| self.max_retries_for_kind.for_bucket(kind.bucket()))
    }

    /// Classifies `error` against `ctx`'s retry history and decides what to do next.
    pub fn handle(&self, error: &UploadError, ctx: &ErrorContext) -> Action {
        self.record(error);

        match error.kind {
            ErrorKind::NetworkDisconnect => Action::WaitForConnection,
            ErrorKind::ServerOverload => {
                if ctx.retry_count <= ctx.max_retries + 1 {
                    Action::Retry {
                        delay: Duration::from_millis(30_000),
                    }
                } else {
                    Action::Fail { recoverable: true }
                }
            }
            ErrorKind::QuotaExceeded => Action::Fail { recoverable: false },
            ErrorKind::InvalidChunkSize => {
                let halved = ctx.chunk_size / 2;
                if halved >= 256 * 1024 {
                    Action::AdjustAndRetry {
                        new_chunk_size: halved,
                    }
                } else {
                    Action::Fail { recoverable: false }
                }
            }
            _ => {
                if error.retryable && ctx.retry_count < self.max_retries_for(error.kind) {
                    Action::Retry {
                        delay: crate::retry::exponential_base_delay(ctx.retry_count),
                    }
                } else {
                    Action::Fail {
                        recoverable: error.retryable,
                    }
                }
            }
        }
    }

    fn record(&self, error: &UploadError) {
        let mut buf = self.buffer.lock().unwrap();
        if buf.len() >= self.buffer_cap {
            buf.remove(0);
        }
        buf.push(error.clone());
    }

    /// Aggregates recorded errors within the last `time_window`.
    pub fn aggregate_errors(&self, time_window: Duration) -> ErrorAggregate {
        let now = SystemTime::now();
        let buf = self.buffer.lock().unwrap();
        let mut types: HashMap<ErrorKind, u32> = HashMap::new();
        let mut details = Vec::new();
        let mut count = 0;
        for err in buf.iter() {
            if now.duration_since(err.timestamp).unwrap_or_default() <= time_window {
                *types.entry(err.kind).or_insert(0) += 1;
                details.push(err.message.clone());
                count += 1;
            }
        }
        ErrorAggregate {
            count,
            types,
            details,
        }
    }

    pub fn reset(&self) {
        self.buffer.lock().unwrap().clear();
    }
}

#[derive(Debug, Clone, Default)]
pub struct ErrorAggregate {
    pub count: u32,
    pub types: HashMap<ErrorKind, u32>,
    pub details: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_disconnect_waits_for_connection() {
        let handler = ErrorHandler::new();
        let err = UploadError::new(ErrorKind::NetworkDisconnect, "offline");
        let action = handler.handle(&err, &ErrorContext::default());
        assert!(matches!(action, Action::WaitForConnection));
    }

    #[test]
    fn quota_exceeded_fails_unrecoverable() {
        let handler = ErrorHandler::new();
        let err = UploadError::new(ErrorKind::QuotaExceeded, "quota");
        let action = handler.handle(&err, &ErrorContext::default());
        assert!(matches!(action, Action::Fail { recoverable: false }));
    }

    #[test]
    fn invalid_chunk_size_halves_until_floor() {
        let handler = ErrorHandler::new();
        let err = UploadError::new(ErrorKind::InvalidChunkSize, "too big");
        let ctx = ErrorContext {
            chunk_size: 1024 * 1024,
            ..Default::default()
        };
        let action = handler.handle(&err, &ctx);
        match action {
            Action::AdjustAndRetry { new_chunk_size } => assert_eq!(new_chunk_size, 512 * 1024),
            other => panic!("unexpected action: {other:?}"),
        }

        let ctx_floor = ErrorContext {
            chunk_size: 256 * 1024,
            ..Default::default()
        };
        let action = handler.handle(&err, &ctx_floor);
        assert!(matches!(action, Action::Fail { recoverable: false }));
    }

    #[test]
    fn retryable_error_retries_until_kind_budget_exhausted() {
        let handler = ErrorHandler::new();
        let err = UploadError::new(ErrorKind::Timeout, "timed out");
        let ctx = ErrorContext {
            retry_count: 2,
            max_retries: 10,
            chunk_size: 1024,
        };
        assert!(matches!(handler.handle(&err, &ctx), Action::Retry { .. }));

        let ctx_exhausted = ErrorContext {
            retry_count: 3,
            ..ctx
        };
        assert!(matches!(
            handler.handle(&err, &ctx_exhausted),
            Action::Fail { .. }
        ));
    }

    #[test]
    fn non_retryable_kind_fails_immediately() {
        let handler = ErrorHandler::new();
        let err = UploadError::new(ErrorKind::AuthorizationFailed, "forbidden");
        let action = handler.handle(&err, &ErrorContext::default());
        assert!(matches!(action, Action::Fail { recoverable: false }));
    }

    #[test]
    fn aggregate_counts_recent_errors() {
        let handler = ErrorHandler::new();
        handler.handle(
            &UploadError::new(ErrorKind::Timeout, "a"),
            &ErrorContext::default(),
        );
        handler.handle(
            &UploadError::new(ErrorKind::Timeout, "b"),
            &ErrorContext::default(),
        );
        let agg = handler.aggregate_errors(Duration::from_secs(3600));
        assert_eq!(agg.count, 2);
        assert_eq!(*agg.types.get(&ErrorKind::Timeout).unwrap(), 2);
    }
}
