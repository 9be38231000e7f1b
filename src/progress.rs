//! Batch-level transfer progress.
//!
//! Workers push byte deltas through [`ProgressAggregator::update`], which is a
//! single atomic add. Consumers call [`ProgressAggregator::snapshot`] on a
//! timer; the speed window and cached snapshot sit behind a short lock that
//! only snapshot recomputation touches, at most once per refresh interval.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::trace;

use crate::task::TaskId;

/// Default snapshot refresh interval.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(250);

/// Default width of the speed sliding window.
pub const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(5);

/// Consistent view of byte progress at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// Bytes received by attempts still counted.
    pub bytes_done: u64,
    /// Sum of known expected sizes, if any task reported one.
    pub bytes_expected: Option<u64>,
    /// Bytes per second over the sliding window.
    pub speed_bps: f64,
    /// Estimated time remaining; needs an expected total and non-zero speed.
    pub eta: Option<Duration>,
    /// Time since the aggregator was created.
    pub elapsed: Duration,
}

#[derive(Debug)]
struct Window {
    samples: VecDeque<(Instant, u64)>,
    cached: Option<(Instant, ProgressSnapshot)>,
}

/// Thread-safe progress accumulator for one batch.
#[derive(Debug)]
pub struct ProgressAggregator {
    started: Instant,
    bytes_done: AtomicU64,
    bytes_expected: AtomicU64,
    expected: Mutex<HashMap<TaskId, u64>>,
    window: Mutex<Window>,
    refresh_interval: Duration,
    speed_window: Duration,
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_INTERVAL, DEFAULT_SPEED_WINDOW)
    }
}

impl ProgressAggregator {
    /// Creates an aggregator with explicit refresh interval and speed window.
    #[must_use]
    pub fn new(refresh_interval: Duration, speed_window: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            bytes_done: AtomicU64::new(0),
            bytes_expected: AtomicU64::new(0),
            expected: Mutex::new(HashMap::new()),
            window: Mutex::new(Window {
                samples: VecDeque::from([(started, 0)]),
                cached: None,
            }),
            refresh_interval,
            speed_window,
        }
    }

    /// Adds `delta` received bytes for `task`.
    pub fn update(&self, task: TaskId, delta: u64) {
        self.bytes_done.fetch_add(delta, Ordering::Relaxed);
        trace!(%task, delta, "progress");
    }

    /// Records `task`'s expected size. Replaces any earlier value for the task.
    pub fn set_expected(&self, task: TaskId, total: u64) {
        let mut expected = lock(&self.expected);
        let previous = expected.insert(task, total).unwrap_or(0);
        self.bytes_expected.fetch_add(total, Ordering::Relaxed);
        self.bytes_expected.fetch_sub(previous, Ordering::Relaxed);
    }

    /// Removes bytes of an abandoned attempt from the running total.
    pub fn rewind(&self, task: TaskId, bytes: u64) {
        // Saturating: never go below zero even if callers over-report.
        let _ = self
            .bytes_done
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |done| {
                Some(done.saturating_sub(bytes))
            });
        trace!(%task, bytes, "progress rewound");
    }

    /// Drops `task`'s expected size (it will not finish).
    pub fn discard_expected(&self, task: TaskId) {
        if let Some(previous) = lock(&self.expected).remove(&task) {
            self.bytes_expected.fetch_sub(previous, Ordering::Relaxed);
        }
    }

    /// Current snapshot, recomputed at most once per refresh interval.
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot_at(Instant::now())
    }

    /// Snapshot bypassing the refresh throttle (used for terminal reports).
    #[must_use]
    pub fn snapshot_now(&self) -> ProgressSnapshot {
        let now = Instant::now();
        let mut window = lock(&self.window);
        self.recompute(&mut window, now)
    }

    fn snapshot_at(&self, now: Instant) -> ProgressSnapshot {
        let mut window = lock(&self.window);
        if let Some((at, cached)) = window.cached
            && now.saturating_duration_since(at) < self.refresh_interval
        {
            return cached;
        }
        self.recompute(&mut window, now)
    }

    #[allow(clippy::cast_precision_loss)]
    fn recompute(&self, window: &mut Window, now: Instant) -> ProgressSnapshot {
        let bytes_done = self.bytes_done.load(Ordering::Relaxed);
        let expected = self.bytes_expected.load(Ordering::Relaxed);

        window.samples.push_back((now, bytes_done));
        // Keep one sample at or before the window start as the baseline.
        while window.samples.len() > 2
            && window
                .samples
                .get(1)
                .is_some_and(|(t, _)| now.saturating_duration_since(*t) >= self.speed_window)
        {
            window.samples.pop_front();
        }

        let speed_bps = match window.samples.front() {
            Some(&(t0, b0)) => {
                let span = now.saturating_duration_since(t0).as_secs_f64();
                if span > 0.0 {
                    bytes_done.saturating_sub(b0) as f64 / span
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        let bytes_expected = (expected > 0).then_some(expected);
        let eta = bytes_expected.and_then(|total| {
            (speed_bps > 0.0)
                .then(|| Duration::from_secs_f64(total.saturating_sub(bytes_done) as f64 / speed_bps))
        });

        let snapshot = ProgressSnapshot {
            bytes_done,
            bytes_expected,
            speed_bps,
            eta,
            elapsed: now.saturating_duration_since(self.started),
        };
        window.cached = Some((now, snapshot));
        snapshot
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_updates_accumulate() {
        let agg = ProgressAggregator::new(Duration::ZERO, DEFAULT_SPEED_WINDOW);
        agg.update(TaskId(1), 100);
        agg.update(TaskId(2), 50);
        assert_eq!(agg.snapshot().bytes_done, 150);
    }

    #[test]
    fn test_snapshot_is_throttled() {
        let agg = ProgressAggregator::new(Duration::from_secs(60), DEFAULT_SPEED_WINDOW);
        let first = agg.snapshot();
        agg.update(TaskId(1), 1000);
        assert_eq!(agg.snapshot(), first, "cached snapshot expected within interval");
        assert_eq!(agg.snapshot_now().bytes_done, 1000);
    }

    #[test]
    fn test_expected_replaced_and_discarded() {
        let agg = ProgressAggregator::new(Duration::ZERO, DEFAULT_SPEED_WINDOW);
        agg.set_expected(TaskId(1), 1000);
        agg.set_expected(TaskId(1), 1200);
        agg.set_expected(TaskId(2), 300);
        assert_eq!(agg.snapshot().bytes_expected, Some(1500));

        agg.discard_expected(TaskId(2));
        assert_eq!(agg.snapshot().bytes_expected, Some(1200));
        agg.discard_expected(TaskId(1));
        assert_eq!(agg.snapshot().bytes_expected, None);
    }

    #[test]
    fn test_rewind_saturates() {
        let agg = ProgressAggregator::new(Duration::ZERO, DEFAULT_SPEED_WINDOW);
        agg.update(TaskId(1), 10);
        agg.rewind(TaskId(1), 25);
        assert_eq!(agg.snapshot().bytes_done, 0);
    }

    #[test]
    fn test_speed_and_eta_over_window() {
        let agg = ProgressAggregator::new(Duration::ZERO, DEFAULT_SPEED_WINDOW);
        let t0 = agg.started;
        agg.set_expected(TaskId(1), 3000);
        agg.update(TaskId(1), 1000);

        let snap = agg.snapshot_at(t0 + Duration::from_secs(1));
        assert!((snap.speed_bps - 1000.0).abs() < 1.0, "speed {}", snap.speed_bps);
        let eta = snap.eta.unwrap();
        assert!((eta.as_secs_f64() - 2.0).abs() < 0.01, "eta {eta:?}");
    }

    #[test]
    fn test_speed_window_slides() {
        let agg = ProgressAggregator::new(Duration::ZERO, Duration::from_secs(5));
        let t0 = agg.started;
        agg.update(TaskId(1), 10_000);
        let _ = agg.snapshot_at(t0 + Duration::from_secs(1));
        let _ = agg.snapshot_at(t0 + Duration::from_secs(2));

        // No new bytes for well over a window: speed decays to zero.
        let snap = agg.snapshot_at(t0 + Duration::from_secs(20));
        assert!(snap.speed_bps < 1.0, "speed {}", snap.speed_bps);
        assert_eq!(snap.eta, None);
    }

    #[test]
    fn test_concurrent_updates() {
        let agg = Arc::new(ProgressAggregator::default());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let agg = Arc::clone(&agg);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        agg.update(TaskId(i), 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(agg.snapshot_now().bytes_done, 8000);
    }
}
