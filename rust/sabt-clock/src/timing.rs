//! Latency timers
//!
//! Middlewares observe their own latency on every outcome; tests swap in a
//! deterministic timer with scripted durations.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

/// Handle returned by `Timer::start`
pub trait TimerHandle: Send {
    fn elapsed(&self) -> f64;
}

/// Latency timer factory
pub trait Timer: Send + Sync {
    fn start(&self) -> Box<dyn TimerHandle>;
}

struct PerfHandle {
    started: Instant,
}

impl TimerHandle for PerfHandle {
    fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

/// Real timer backed by the monotonic OS clock
#[derive(Default)]
pub struct MonotonicTimer;

impl Timer for MonotonicTimer {
    fn start(&self) -> Box<dyn TimerHandle> {
        Box::new(PerfHandle {
            started: Instant::now(),
        })
    }
}

struct ScriptedHandle {
    duration: f64,
    recorded: Arc<Mutex<Vec<f64>>>,
}

impl TimerHandle for ScriptedHandle {
    fn elapsed(&self) -> f64 {
        self.recorded.lock().push(self.duration);
        self.duration
    }
}

/// Timer for tests, cycling through scripted durations
pub struct DeterministicTimer {
    durations: Vec<f64>,
    cursor: Mutex<usize>,
    recorded: Arc<Mutex<Vec<f64>>>,
}

impl DeterministicTimer {
    pub fn new(durations: Vec<f64>) -> Self {
        let durations = if durations.is_empty() {
            vec![0.0]
        } else {
            durations
        };
        Self {
            durations,
            cursor: Mutex::new(0),
            recorded: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Durations observed through handles so far
    pub fn recorded(&self) -> Vec<f64> {
        self.recorded.lock().clone()
    }
}

impl Timer for DeterministicTimer {
    fn start(&self) -> Box<dyn TimerHandle> {
        let mut cursor = self.cursor.lock();
        let duration = self.durations[*cursor % self.durations.len()];
        *cursor += 1;
        Box::new(ScriptedHandle {
            duration,
            recorded: Arc::clone(&self.recorded),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_timer_reports_nonnegative_elapsed() {
        let timer = MonotonicTimer;
        let handle = timer.start();
        assert!(handle.elapsed() >= 0.0);
    }

    #[test]
    fn deterministic_timer_cycles_and_records() {
        let timer = DeterministicTimer::new(vec![0.01, 0.02]);
        assert_eq!(timer.start().elapsed(), 0.01);
        assert_eq!(timer.start().elapsed(), 0.02);
        assert_eq!(timer.start().elapsed(), 0.01);
        assert_eq!(timer.recorded(), vec![0.01, 0.02, 0.01]);
    }
}
