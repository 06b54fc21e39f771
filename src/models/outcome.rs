use std::sync::Mutex;

use serde::Serialize;

/// A pipeline phase, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fetch,
    Transform,
    Store,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Fetch => "fetch",
            Phase::Transform => "transform",
            Phase::Store => "store",
        }
    }
}

/// Elapsed milliseconds per completed pipeline phase.
///
/// Phases that never finished stay unset, which is what failure-phase
/// detection keys on.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTimings {
    pub fetch: Option<u64>,
    pub transform: Option<u64>,
    pub store: Option<u64>,
}

impl PhaseTimings {
    pub fn record(&mut self, phase: Phase, elapsed_ms: u64) {
        match phase {
            Phase::Fetch => self.fetch = Some(elapsed_ms),
            Phase::Transform => self.transform = Some(elapsed_ms),
            Phase::Store => self.store = Some(elapsed_ms),
        }
    }

    /// First phase with no recorded timing, or "unknown" when all three ran.
    pub fn failure_phase(&self) -> &'static str {
        if self.fetch.is_none() {
            Phase::Fetch.as_str()
        } else if self.transform.is_none() {
            Phase::Transform.as_str()
        } else if self.store.is_none() {
            Phase::Store.as_str()
        } else {
            "unknown"
        }
    }

    /// Sum of the recorded phase timings, the `processingTime` on success
    /// events.
    pub fn total_ms(&self) -> u64 {
        self.fetch.unwrap_or(0) + self.transform.unwrap_or(0) + self.store.unwrap_or(0)
    }

    pub fn is_complete(&self) -> bool {
        self.fetch.is_some() && self.transform.is_some() && self.store.is_some()
    }
}

/// Shared timing cell. The pipeline writes through it as phases complete so
/// the consumer still observes partial timings after a deadline abort drops
/// the pipeline future.
#[derive(Debug, Default)]
pub struct PhaseRecorder {
    timings: Mutex<PhaseTimings>,
}

impl PhaseRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, phase: Phase, elapsed_ms: u64) {
        self.timings
            .lock()
            .expect("phase timings lock poisoned")
            .record(phase, elapsed_ms);
    }

    pub fn snapshot(&self) -> PhaseTimings {
        self.timings
            .lock()
            .expect("phase timings lock poisoned")
            .clone()
    }
}

/// Result of a pipeline run that reached the store phase.
#[derive(Debug, Clone)]
pub struct PipelineSuccess {
    pub processed_url: String,
    pub public_id: String,
    pub timings: PhaseTimings,
}
