use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use crate::events::{Event, EventBus};
use crate::file::FileId;

/// Min/max/avg/median timing stats for a named (category, op) bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingStats {
    pub count: u64,
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
    pub median: Duration,
}

/// An in-flight timing measurement. Dropping without calling `end` discards
/// the sample.
pub struct TimingHandle {
    category: String,
    op: String,
    file_id: Option<FileId>,
    started_at: Instant,
}

/// Tracks operation durations bucketed by `(category, op)` (e.g.
/// `("upload", "dispatch")`, `("upload", "merge")`), exposing aggregate stats
/// for diagnostics/telemetry and emitting `performance:metric` as each
/// measurement completes.
pub struct PerformanceTracker {
    samples: StdMutex<HashMap<(String, String), Vec<Duration>>>,
    events: Arc<EventBus>,
}

const MAX_SAMPLES_PER_CATEGORY: usize = 500;

impl PerformanceTracker {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            samples: StdMutex::new(HashMap::new()),
            events,
        }
    }

    pub fn start_timing(&self, category: impl Into<String>, op: impl Into<String>, file_id: Option<FileId>) -> TimingHandle {
        TimingHandle {
            category: category.into(),
            op: op.into(),
            file_id,
            started_at: Instant::now(),
        }
    }

    /// Records the elapsed duration and publishes `Event::PerformanceMetric`.
    pub fn end(&self, handle: TimingHandle) -> Duration {
        let elapsed = handle.started_at.elapsed();
        let _ = handle.file_id;
        self.record(handle.category.clone(), handle.op.clone(), elapsed);
        self.events.publish(Event::PerformanceMetric {
            category: handle.category,
            op: handle.op,
            duration: elapsed,
        });
        elapsed
    }

    pub fn record(&self, category: impl Into<String>, op: impl Into<String>, duration: Duration) {
        let mut samples = self.samples.lock().unwrap();
        let bucket = samples.entry((category.into(), op.into())).or_default();
        if bucket.len() >= MAX_SAMPLES_PER_CATEGORY {
            bucket.remove(0);
        }
        bucket.push(duration);
    }

    /// Stats for a single `(category, op)` bucket, or aggregated across every
    /// `op` recorded under `category` when `op` is `None`.
    pub fn get_stats(&self, category: &str, op: Option<&str>) -> Option<TimingStats> {
        let samples = self.samples.lock().unwrap();
        let mut combined: Vec<Duration> = Vec::new();
        match op {
            Some(op) => {
                combined.extend(samples.get(&(category.to_string(), op.to_string()))?.iter().copied());
            }
            None => {
                for ((cat, _), values) in samples.iter() {
                    if cat == category {
                        combined.extend(values.iter().copied());
                    }
                }
            }
        }
        if combined.is_empty() {
            return None;
        }
        combined.sort();

        let count = combined.len() as u64;
        let min = combined[0];
        let max = combined[combined.len() - 1];
        let total: Duration = combined.iter().sum();
        let avg = total / count as u32;
        let median = if combined.len() % 2 == 0 {
            let mid = combined.len() / 2;
            (combined[mid - 1] + combined[mid]) / 2
        } else {
            combined[combined.len() / 2]
        };

        Some(TimingStats {
            count,
            min,
            max,
            avg,
            median,
        })
    }

    pub fn reset(&self) {
        self.samples.lock().unwrap().clear();
    }

    pub fn reset_category(&self, category: &str) {
        self.samples.lock().unwrap().retain(|(cat, _), _| cat != category);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PerformanceTracker {
        PerformanceTracker::new(Arc::new(EventBus::new()))
    }

    #[test]
    fn stats_computed_over_recorded_samples() {
        let tracker = tracker();
        tracker.record("upload", "chunk_upload", Duration::from_millis(100));
        tracker.record("upload", "chunk_upload", Duration::from_millis(200));
        tracker.record("upload", "chunk_upload", Duration::from_millis(300));

        let stats = tracker.get_stats("upload", Some("chunk_upload")).unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, Duration::from_millis(100));
        assert_eq!(stats.max, Duration::from_millis(300));
        assert_eq!(stats.median, Duration::from_millis(200));
    }

    #[test]
    fn unknown_category_returns_none() {
        let tracker = tracker();
        assert!(tracker.get_stats("nope", None).is_none());
    }

    #[test]
    fn start_timing_end_records_elapsed_sample_and_publishes_event() {
        let tracker = tracker();
        let mut rx = tracker.events.subscribe();
        let handle = tracker.start_timing("upload", "merge", Some(FileId(1)));
        tracker.end(handle);
        assert_eq!(tracker.get_stats("upload", Some("merge")).unwrap().count, 1);
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, Event::PerformanceMetric { category, op, .. } if category == "upload" && op == "merge"));
    }

    #[test]
    fn get_stats_with_no_op_aggregates_across_ops_in_category() {
        let tracker = tracker();
        tracker.record("upload", "dispatch", Duration::from_millis(50));
        tracker.record("upload", "merge", Duration::from_millis(150));
        let stats = tracker.get_stats("upload", None).unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.min, Duration::from_millis(50));
        assert_eq!(stats.max, Duration::from_millis(150));
    }
}
