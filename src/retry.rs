use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Action, ErrorContext, ErrorHandler, ErrorKind, RetryBucket, UploadError};
use crate::events::{Event, EventBus};
use crate::file::FileId;
use crate::network::{NetworkInfo, NetworkMonitor};
use crate::resume_store::ResumeStore;

/// Default base delay for exponential/linear backoff (1s).
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
/// Default max delay clamp (30s).
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);

/// Pre-jitter exponential backoff: `baseDelay * 2^retryCount`, using the engine
/// default base delay. Exposed so `ErrorHandler` can compute a default `Retry`
/// delay without depending on a live `RetryController`.
pub fn exponential_base_delay(retry_count: u32) -> Duration {
    exponential_delay(retry_count, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
}

pub fn exponential_delay(retry_count: u32, base_delay: Duration, max_delay: Duration) -> Duration {
    let multiplier = 2u64.saturating_pow(retry_count.min(32));
    let delay = base_delay.saturating_mul(multiplier as u32);
    delay.min(max_delay).max(base_delay.min(max_delay))
}

pub fn linear_delay(retry_count: u32, base_delay: Duration, max_delay: Duration) -> Duration {
    let delay = base_delay.saturating_mul(retry_count + 1);
    delay.min(max_delay)
}

/// Per-error-kind delay multiplier.
pub fn kind_multiplier(bucket: RetryBucket) -> f64 {
    match bucket {
        RetryBucket::Network => 1.5,
        RetryBucket::Server => 2.0,
        RetryBucket::Timeout => 1.8,
        RetryBucket::Unknown => 1.0,
    }
}

/// `U(0, base_delay * 0.5)` jitter.
pub fn jitter(base_delay: Duration) -> Duration {
    let max_jitter_ms = (base_delay.as_millis() as f64 * 0.5).max(0.0);
    if max_jitter_ms <= 0.0 {
        return Duration::ZERO;
    }
    let ms = rand::thread_rng().gen_range(0.0..max_jitter_ms);
    Duration::from_millis(ms as u64)
}

#[derive(Debug, Clone, Copy)]
pub struct NetworkQualityThreshold {
    pub min_speed_mbps: f64,
    pub max_rtt_ms: u32,
}

impl Default for NetworkQualityThreshold {
    fn default() -> Self {
        Self {
            min_speed_mbps: 0.5,
            max_rtt_ms: 900,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub use_exponential_backoff: bool,
    pub max_retries_per_chunk: u32,
    pub network_quality_threshold: NetworkQualityThreshold,
    pub min_success_rate: f64,
    pub use_smart_decision: bool,
    pub persist_retry_state: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            use_exponential_backoff: true,
            max_retries_per_chunk: 5,
            network_quality_threshold: NetworkQualityThreshold::default(),
            min_success_rate: 0.25,
            use_smart_decision: true,
            persist_retry_state: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryTaskKind {
    Retry,
    NetworkRecovery,
    AdjustChunk,
}

/// Persisted per-file retry/resume bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryState {
    pub file_id: FileId,
    pub device_id: String,
    pub session_id: String,
    pub retry_count: u32,
    pub last_retry_time: Option<chrono::DateTime<chrono::Utc>>,
    pub chunk_retries: HashMap<u64, u32>,
    pub successful_retries: u32,
    pub failed_retries: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub network_history: Vec<NetworkInfo>,
    pub retry_history: Vec<RetryHistoryEntry>,
}

const MAX_NETWORK_HISTORY: usize = 20;
const MAX_RETRY_HISTORY: usize = 50;

impl RetryState {
    pub fn new(file_id: FileId, device_id: String, session_id: String, expiration: Duration) -> Self {
        let now = chrono::Utc::now();
        Self {
            file_id,
            device_id,
            session_id,
            retry_count: 0,
            last_retry_time: None,
            chunk_retries: HashMap::new(),
            successful_retries: 0,
            failed_retries: 0,
            created_at: now,
            updated_at: now,
            expires_at: now + chrono::Duration::from_std(expiration).unwrap_or_default(),
            network_history: Vec::new(),
            retry_history: Vec::new(),
        }
    }

    pub fn is_expired(&self) -> bool {
        chrono::Utc::now() > self.expires_at
    }

    fn push_network_sample(&mut self, info: NetworkInfo) {
        self.network_history.push(info);
        if self.network_history.len() > MAX_NETWORK_HISTORY {
            self.network_history.remove(0);
        }
    }

    fn push_retry_history(&mut self, entry: RetryHistoryEntry) {
        self.retry_history.push(entry);
        if self.retry_history.len() > MAX_RETRY_HISTORY {
            self.retry_history.remove(0);
        }
    }

    fn success_rate(&self) -> f64 {
        let total = self.successful_retries + self.failed_retries;
        if total == 0 {
            1.0
        } else {
            self.successful_retries as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryHistoryEntry {
    pub chunk_index: Option<u64>,
    pub succeeded: bool,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Error returned when the controller declines to retry.
#[derive(Debug)]
pub struct RetryExhausted {
    pub last_error: UploadError,
    pub recoverable: bool,
}

impl std::fmt::Display for RetryExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "retry exhausted: {}", self.last_error)
    }
}
impl std::error::Error for RetryExhausted {}

/// Drives the decide/backoff/queue/network-wait retry loop. Owns per-file
/// `RetryState` and coordinates with the `NetworkMonitor` for
/// connectivity-gated waiting.
pub struct RetryController {
    config: RetryConfig,
    error_handler: Arc<ErrorHandler>,
    network_monitor: Arc<NetworkMonitor>,
    resume_store: Option<Arc<ResumeStore>>,
    events: Arc<EventBus>,
    device_id: String,
    session_id: String,
    states: StdMutex<HashMap<FileId, RetryState>>,
}

impl RetryController {
    pub fn new(
        config: RetryConfig,
        error_handler: Arc<ErrorHandler>,
        network_monitor: Arc<NetworkMonitor>,
        resume_store: Option<Arc<ResumeStore>>,
        events: Arc<EventBus>,
        device_id: String,
        session_id: String,
    ) -> Self {
        Self {
            config,
            error_handler,
            network_monitor,
            resume_store,
            events,
            device_id,
            session_id,
            states: StdMutex::new(HashMap::new()),
        }
    }

    async fn ensure_loaded(&self, file_id: FileId) {
        if self.states.lock().unwrap().contains_key(&file_id) {
            return;
        }
        let loaded = if let Some(store) = &self.resume_store {
            store.load(file_id).await.ok().flatten()
        } else {
            None
        };
        let state = loaded.unwrap_or_else(|| {
            RetryState::new(
                file_id,
                self.device_id.clone(),
                self.session_id.clone(),
                Duration::from_secs(7 * 24 * 3600),
            )
        });
        self.states.lock().unwrap().insert(file_id, state);
    }

    async fn persist(&self, file_id: FileId) {
        if !self.config.persist_retry_state {
            return;
        }
        if let Some(store) = &self.resume_store {
            let state = self.states.lock().unwrap().get(&file_id).cloned();
            if let Some(state) = state {
                let _ = store.save(&state).await;
            }
        }
    }

    fn is_retryable(&self, error: &UploadError) -> bool {
        error.retryable
    }

    /// Drives retries for a failed operation. `handler` is invoked (possibly
    /// more than once) to re-attempt the operation after the computed delay.
    /// Returns the eventual success value, or `RetryExhausted` once the
    /// budget/backoff/smart-decision filters give up.
    pub async fn retry<T, F, Fut>(
        &self,
        file_id: FileId,
        chunk_index: Option<u64>,
        mut error: UploadError,
        mut handler: F,
    ) -> Result<T, RetryExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UploadError>>,
    {
        self.ensure_loaded(file_id).await;

        if !self.config.enabled {
            return Err(RetryExhausted {
                recoverable: error.retryable,
                last_error: error,
            });
        }

        loop {
            let retry_count = {
                let mut states = self.states.lock().unwrap();
                let state = states.get_mut(&file_id).unwrap();
                state.retry_count += 1;
                if let Some(idx) = chunk_index {
                    *state.chunk_retries.entry(idx).or_insert(0) += 1;
                }
                state.updated_at = chrono::Utc::now();
                state.retry_count
            };

            let retryable = self.is_retryable(&error);
            if !retryable || retry_count >= self.config.max_retries {
                self.mark_failed(file_id, chunk_index, &error).await;
                return Err(RetryExhausted {
                    recoverable: error.retryable,
                    last_error: error,
                });
            }

            let network = self.network_monitor.current();
            self.record_network_sample(file_id, network);
            self.bump_fail_count(file_id);

            if self.config.use_smart_decision && !self.smart_decision_allows(file_id, chunk_index) {
                self.events.publish(Event::RetryFailed {
                    file_id,
                    chunk_index,
                    recoverable: true,
                });
                self.persist(file_id).await;
                return Err(RetryExhausted {
                    recoverable: true,
                    last_error: error,
                });
            }

            let ctx = ErrorContext {
                retry_count,
                max_retries: self.config.max_retries,
                chunk_size: 0,
            };
            let action = self.error_handler.handle(&error, &ctx);

            match action {
                Action::WaitForConnection => {
                    self.events.publish(Event::RetryWaiting { file_id, chunk_index });
                    self.network_monitor.wait_until_online().await;
                    self.events.publish(Event::RetryNetworkRecovered { file_id });
                }
                Action::Fail { recoverable } => {
                    self.mark_failed(file_id, chunk_index, &error).await;
                    return Err(RetryExhausted {
                        recoverable,
                        last_error: error,
                    });
                }
                Action::AdjustAndRetry { new_chunk_size } => {
                    self.events.publish(Event::RetryAdjusting {
                        file_id,
                        chunk_index,
                        new_chunk_size,
                    });
                }
                Action::Retry { .. } => {}
            }

            let delay = self.compute_delay(&error, retry_count);
            self.events.publish(Event::RetryStart {
                file_id,
                chunk_index,
                retry_count,
                delay,
            });
            self.run_countdown(delay).await;

            match handler().await {
                Ok(value) => {
                    self.mark_success(file_id, chunk_index).await;
                    self.events.publish(Event::RetrySuccess { file_id, chunk_index });
                    return Ok(value);
                }
                Err(next_error) => {
                    error = next_error;
                    continue;
                }
            }
        }
    }

    fn compute_delay(&self, error: &UploadError, retry_count: u32) -> Duration {
        if error.kind == ErrorKind::ServerOverload {
            return Duration::from_millis(30_000).max(Duration::from_secs(5));
        }

        let base = if self.config.use_exponential_backoff {
            exponential_delay(retry_count, self.config.base_delay, self.config.max_delay)
        } else {
            linear_delay(retry_count, self.config.base_delay, self.config.max_delay)
        };

        let multiplier = kind_multiplier(error.kind.bucket());
        let scaled = Duration::from_secs_f64((base.as_secs_f64() * multiplier).max(0.0));
        let with_jitter = scaled + jitter(self.config.base_delay);

        let floor = if error.kind == ErrorKind::ServerOverload {
            Duration::from_secs(5)
        } else {
            Duration::ZERO
        };

        with_jitter.clamp(floor, self.config.max_delay)
    }

    async fn run_countdown(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        let tick = Duration::from_millis(200).min(delay);
        let mut remaining = delay;
        while !remaining.is_zero() {
            let step = tick.min(remaining);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
            self.events.publish(Event::RetryCountdown {
                remaining_ms: remaining.as_millis() as u64,
            });
        }
    }

    fn record_network_sample(&self, file_id: FileId, info: NetworkInfo) {
        let mut states = self.states.lock().unwrap();
        if let Some(state) = states.get_mut(&file_id) {
            state.push_network_sample(info);
        }
    }

    fn bump_fail_count(&self, file_id: FileId) {
        let mut states = self.states.lock().unwrap();
        if let Some(state) = states.get_mut(&file_id) {
            state.failed_retries += 1;
            state.push_retry_history(RetryHistoryEntry {
                chunk_index: None,
                succeeded: false,
                at: chrono::Utc::now(),
            });
        }
    }

    async fn mark_success(&self, file_id: FileId, chunk_index: Option<u64>) {
        {
            let mut states = self.states.lock().unwrap();
            if let Some(state) = states.get_mut(&file_id) {
                state.successful_retries += 1;
                state.last_retry_time = Some(chrono::Utc::now());
                state.push_retry_history(RetryHistoryEntry {
                    chunk_index,
                    succeeded: true,
                    at: chrono::Utc::now(),
                });
            }
        }
        self.persist(file_id).await;
    }

    async fn mark_failed(&self, file_id: FileId, chunk_index: Option<u64>, error: &UploadError) {
        self.events.publish(Event::RetryFailed {
            file_id,
            chunk_index,
            recoverable: error.retryable,
        });
        self.persist(file_id).await;
    }

    /// Smart-decision filter: refuses a retry when the file's recent success
    /// rate has collapsed, the network has looked poor for several samples
    /// running, or the chunk has exhausted its own per-chunk retry budget.
    fn smart_decision_allows(&self, file_id: FileId, chunk_index: Option<u64>) -> bool {
        let states = self.states.lock().unwrap();
        let Some(state) = states.get(&file_id) else {
            return true;
        };

        let total = state.successful_retries + state.failed_retries;
        if total > 5 && state.success_rate() < self.config.min_success_rate {
            return false;
        }

        if state.network_history.len() >= 3 {
            let last_three = &state.network_history[state.network_history.len() - 3..];
            let all_poor = last_three.iter().all(|n| {
                !n.online
                    || n.speed_mbps < self.config.network_quality_threshold.min_speed_mbps
                    || n.rtt_ms > self.config.network_quality_threshold.max_rtt_ms
            });
            if all_poor {
                return false;
            }
        }

        if let Some(idx) = chunk_index {
            if let Some(&count) = state.chunk_retries.get(&idx) {
                if count > self.config.max_retries_per_chunk {
                    return false;
                }
            }
        }

        true
    }

    pub fn state_snapshot(&self, file_id: FileId) -> Option<RetryState> {
        self.states.lock().unwrap().get(&file_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkType;

    fn bus() -> Arc<EventBus> {
        Arc::new(EventBus::new())
    }

    fn monitor() -> Arc<NetworkMonitor> {
        Arc::new(NetworkMonitor::new(NetworkInfo {
            online: true,
            network_type: NetworkType::Wifi,
            speed_mbps: 100.0,
            rtt_ms: 20,
        }))
    }

    #[test]
    fn exponential_backoff_matches_base_times_two_to_the_k() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(30);
        assert_eq!(exponential_delay(0, base, max), base);
        assert_eq!(exponential_delay(1, base, max), base * 2);
        assert_eq!(exponential_delay(2, base, max), base * 4);
        assert_eq!(exponential_delay(10, base, max), max);
    }

    #[tokio::test(start_paused = true)]
    async fn max_retries_zero_never_reschedules() {
        let handler = Arc::new(ErrorHandler::new());
        let controller = RetryController::new(
            RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            },
            handler,
            monitor(),
            None,
            bus(),
            "device".into(),
            "session".into(),
        );

        let file_id = FileId(1);
        let error = UploadError::new(ErrorKind::Network, "boom");
        let result = controller
            .retry::<(), _, _>(file_id, Some(0), error, || async { Ok(()) })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_handler_succeeds() {
        let handler = Arc::new(ErrorHandler::new());
        let controller = RetryController::new(
            RetryConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ..RetryConfig::default()
            },
            handler,
            monitor(),
            None,
            bus(),
            "device".into(),
            "session".into(),
        );

        let file_id = FileId(2);
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let error = UploadError::new(ErrorKind::Network, "boom");
        let result = controller
            .retry(file_id, Some(0), error, || {
                let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if n >= 1 {
                        Ok(42)
                    } else {
                        Err(UploadError::new(ErrorKind::Network, "still failing"))
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
    }
}
