//! Sliding-window rate counter

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sliding-window counter over a fixed-size ring of time slices.
///
/// Callers `increment` as events occur; readers get the sum, covered duration
/// and per-second rate of the most recent window. All synchronization is
/// internal.
#[derive(Debug)]
pub struct PerformanceWindow {
    slice_interval: Duration,
    slice_count: usize,
    state: Mutex<WindowState>,
}

#[derive(Debug)]
struct WindowState {
    slices: VecDeque<Slice>,
}

#[derive(Debug)]
struct Slice {
    start: Instant,
    count: u64,
}

impl Default for PerformanceWindow {
    fn default() -> Self {
        // 20 half-second slices: a ten second window
        Self::new(Duration::from_millis(500), 20)
    }
}

impl PerformanceWindow {
    /// Create a window of `slice_count` slices of `slice_interval` each
    pub fn new(slice_interval: Duration, slice_count: usize) -> Self {
        assert!(slice_count > 0, "window needs at least one slice");
        Self {
            slice_interval,
            slice_count,
            state: Mutex::new(WindowState {
                slices: VecDeque::with_capacity(slice_count + 1),
            }),
        }
    }

    /// Add `count` to the current slice
    pub fn increment(&self, count: u64) {
        let mut state = self.state.lock().unwrap();
        self.roll(&mut state, Instant::now());
        if let Some(current) = state.slices.back_mut() {
            current.count += count;
        }
    }

    /// Sum of counts across the window
    pub fn window_sum(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        self.roll(&mut state, Instant::now());
        state.slices.iter().map(|s| s.count).sum()
    }

    /// Wall time covered by the window (elapsed since the oldest slice began)
    pub fn window_duration(&self) -> Duration {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        self.roll(&mut state, now);
        state
            .slices
            .front()
            .map(|s| now.duration_since(s.start))
            .unwrap_or_default()
    }

    /// Events per second over the window
    pub fn window_rate(&self) -> f64 {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        self.roll(&mut state, now);
        let sum: u64 = state.slices.iter().map(|s| s.count).sum();
        let duration = state
            .slices
            .front()
            .map(|s| now.duration_since(s.start))
            .unwrap_or_default();
        if duration.as_secs_f64() > 0.0 {
            sum as f64 / duration.as_secs_f64()
        } else {
            0.0
        }
    }

    /// Discard all slices
    pub fn reset(&self) {
        self.state.lock().unwrap().slices.clear();
    }

    /// Close out stale slices and open the current one
    fn roll(&self, state: &mut WindowState, now: Instant) {
        let needs_new = match state.slices.back() {
            Some(current) => now.duration_since(current.start) >= self.slice_interval,
            None => true,
        };
        if needs_new {
            state.slices.push_back(Slice {
                start: now,
                count: 0,
            });
        }
        while state.slices.len() > self.slice_count {
            state.slices.pop_front();
        }
    }
}
