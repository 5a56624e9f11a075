use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use crate::file::FileId;

/// Point-in-time progress for a single upload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub loaded: u64,
    pub total: u64,
    /// 0-99 while uploading; only reaches 100 once the task is `Completed` —
    /// never before the merge response arrives.
    pub percent: u8,
    pub speed_mbps: f64,
    pub eta_seconds: Option<u64>,
}

impl Progress {
    fn zero(total: u64) -> Self {
        Self {
            loaded: 0,
            total,
            percent: 0,
            speed_mbps: 0.0,
            eta_seconds: None,
        }
    }
}

struct TrackedState {
    total: u64,
    loaded: u64,
    speed_mbps: f64,
    started_at: Instant,
    last_sample_at: Instant,
    last_sample_loaded: u64,
    completed: bool,
}

/// Smooths instantaneous throughput with an exponential moving average and
/// derives `percent`/`eta_seconds`.
pub struct ProgressTracker {
    smoothing: f64,
    states: StdMutex<HashMap<FileId, TrackedState>>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(0.7)
    }
}

impl ProgressTracker {
    pub fn new(smoothing: f64) -> Self {
        Self {
            smoothing,
            states: StdMutex::new(HashMap::new()),
        }
    }

    pub fn start(&self, file_id: FileId, total: u64) {
        let now = Instant::now();
        self.states.lock().unwrap().insert(
            file_id,
            TrackedState {
                total,
                loaded: 0,
                speed_mbps: 0.0,
                started_at: now,
                last_sample_at: now,
                last_sample_loaded: 0,
                completed: false,
            },
        );
    }

    /// Records cumulative bytes uploaded so far and returns the updated snapshot.
    pub fn update(&self, file_id: FileId, loaded: u64) -> Progress {
        let mut states = self.states.lock().unwrap();
        let Some(state) = states.get_mut(&file_id) else {
            return Progress::zero(0);
        };

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_sample_at).as_secs_f64();
        if elapsed > 0.0 {
            let delta_bytes = loaded.saturating_sub(state.last_sample_loaded) as f64;
            let instantaneous_mbps = (delta_bytes / (1024.0 * 1024.0)) / elapsed;
            state.speed_mbps = self.smoothing * instantaneous_mbps + (1.0 - self.smoothing) * state.speed_mbps;
            state.last_sample_at = now;
            state.last_sample_loaded = loaded;
        }
        state.loaded = loaded.min(state.total);

        let percent = if state.total == 0 {
            0
        } else {
            ((state.loaded as f64 / state.total as f64) * 100.0).floor() as u8
        };
        let percent = if state.completed { 100 } else { percent.min(99) };

        let remaining = state.total.saturating_sub(state.loaded);
        let eta_seconds = if state.speed_mbps > 0.0 && !state.completed {
            let remaining_mb = remaining as f64 / (1024.0 * 1024.0);
            Some((remaining_mb / state.speed_mbps).ceil() as u64)
        } else if state.completed {
            Some(0)
        } else {
            None
        };

        Progress {
            loaded: state.loaded,
            total: state.total,
            percent,
            speed_mbps: state.speed_mbps,
            eta_seconds,
        }
    }

    /// Marks the task complete; subsequent reads report `percent = 100`.
    pub fn complete(&self, file_id: FileId) -> Progress {
        let mut states = self.states.lock().unwrap();
        let Some(state) = states.get_mut(&file_id) else {
            return Progress::zero(0);
        };
        state.completed = true;
        state.loaded = state.total;
        Progress {
            loaded: state.total,
            total: state.total,
            percent: 100,
            speed_mbps: state.speed_mbps,
            eta_seconds: Some(0),
        }
    }

    pub fn snapshot(&self, file_id: FileId) -> Option<Progress> {
        let states = self.states.lock().unwrap();
        let state = states.get(&file_id)?;
        let percent = if state.completed {
            100
        } else if state.total == 0 {
            0
        } else {
            (((state.loaded as f64 / state.total as f64) * 100.0).floor() as u8).min(99)
        };
        Some(Progress {
            loaded: state.loaded,
            total: state.total,
            percent,
            speed_mbps: state.speed_mbps,
            eta_seconds: if state.completed { Some(0) } else { None },
        })
    }

    pub fn elapsed(&self, file_id: FileId) -> Option<std::time::Duration> {
        let states = self.states.lock().unwrap();
        states.get(&file_id).map(|s| s.started_at.elapsed())
    }

    pub fn remove(&self, file_id: FileId) {
        self.states.lock().unwrap().remove(&file_id);
    }
}
