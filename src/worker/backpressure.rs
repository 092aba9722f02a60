//! Load-aware task acceptance so a worker pool stops pulling new step tasks
//! before it drowns, and resumes once load has actually dropped (hysteresis
//! via high/low watermarks, not a single threshold that would flap).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackpressureConfig {
    /// Stop accepting step tasks once load exceeds this fraction of `worker.concurrency`.
    pub high_watermark: f64,
    /// Resume once load drops at or below this fraction.
    pub low_watermark: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_watermark: 0.9,
            low_watermark: 0.7,
        }
    }
}

impl BackpressureConfig {
    pub fn with_high_watermark(mut self, watermark: f64) -> Self {
        self.high_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    pub fn with_low_watermark(mut self, watermark: f64) -> Self {
        self.low_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    pub fn validate(&self) -> Result<(), BackpressureError> {
        if self.low_watermark >= self.high_watermark {
            return Err(BackpressureError::InvalidConfig(
                "low_watermark must be less than high_watermark".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackpressureError {
    #[error("invalid backpressure configuration: {0}")]
    InvalidConfig(String),
}

/// Tracks in-flight step-task count against `worker.concurrency` (§5, §6.3).
pub struct BackpressureState {
    config: BackpressureConfig,
    current_load: AtomicUsize,
    max_concurrency: usize,
    accepting_tasks: AtomicBool,
}

impl BackpressureState {
    pub fn new(config: BackpressureConfig, max_concurrency: usize) -> Self {
        Self {
            config,
            current_load: AtomicUsize::new(0),
            max_concurrency,
            accepting_tasks: AtomicBool::new(true),
        }
    }

    pub fn should_accept(&self) -> bool {
        let currently_accepting = self.accepting_tasks.load(Ordering::Relaxed);
        let load_ratio = self.load_ratio();

        if currently_accepting {
            if load_ratio >= self.config.high_watermark {
                self.accepting_tasks.store(false, Ordering::Relaxed);
                return false;
            }
            true
        } else if load_ratio <= self.config.low_watermark {
            self.accepting_tasks.store(true, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn current_load(&self) -> usize {
        self.current_load.load(Ordering::Relaxed)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn load_ratio(&self) -> f64 {
        self.current_load.load(Ordering::Relaxed) as f64 / self.max_concurrency.max(1) as f64
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting_tasks.load(Ordering::Relaxed)
    }

    pub fn task_started(&self) {
        self.current_load.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_completed(&self) {
        self.current_load.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn available_slots(&self) -> usize {
        self.max_concurrency.saturating_sub(self.current_load())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_accepting_past_high_watermark_and_resumes_past_low() {
        let state = BackpressureState::new(BackpressureConfig::default(), 10);
        for _ in 0..9 {
            state.task_started();
        }
        assert!(!state.should_accept());

        for _ in 0..3 {
            state.task_completed();
        }
        assert!(state.should_accept());
    }

    #[test]
    fn invalid_watermarks_are_rejected() {
        let config = BackpressureConfig::default().with_low_watermark(0.95);
        assert!(config.validate().is_err());
    }

    #[test]
    fn available_slots_tracks_load() {
        let state = BackpressureState::new(BackpressureConfig::default(), 4);
        state.task_started();
        state.task_started();
        assert_eq!(state.available_slots(), 2);
    }
}
