//! Process-wide ingest pause flags. While a flag is set the corresponding
//! facade `add_*` drops the payload silently: no failure count, no
//! subscriber notification, no replay on resume.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct PauseManager {
    structured_logs: AtomicBool,
    traces: AtomicBool,
    metrics: AtomicBool,
}

impl PauseManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn structured_logs_paused(&self) -> bool {
        self.structured_logs.load(Ordering::Relaxed)
    }

    pub fn set_structured_logs_paused(&self, paused: bool) {
        self.structured_logs.store(paused, Ordering::Relaxed);
    }

    pub fn traces_paused(&self) -> bool {
        self.traces.load(Ordering::Relaxed)
    }

    pub fn set_traces_paused(&self, paused: bool) {
        self.traces.store(paused, Ordering::Relaxed);
    }

    pub fn metrics_paused(&self) -> bool {
        self.metrics.load(Ordering::Relaxed)
    }

    pub fn set_metrics_paused(&self, paused: bool) {
        self.metrics.store(paused, Ordering::Relaxed);
    }
}
