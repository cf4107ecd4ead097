//! Watchdog detecting stalled pipeline stages.
//!
//! The frame pump and the processing loop emit heartbeats. When either stops beating the
//! watchdog records which one and clears the shared running flag so the orchestrator can
//! wind the run down.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use chrono::Utc;
use tracing::error;

use crate::pipeline::PipelineError;

/// Sleep interval between watchdog health checks.
pub const WATCHDOG_POLL_INTERVAL_MS: u64 = 500;
/// Time without a heartbeat before a component is considered stalled.
pub const WATCHDOG_STALE_THRESHOLD_MS: u64 = 1_500;
/// Grace period at startup allowing components to warm up before monitoring.
pub const WATCHDOG_STARTUP_GRACE_MS: u64 = 5_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// Logical components monitored by the watchdog.
pub enum HealthComponent {
    Capture,
    Processing,
}

impl HealthComponent {
    /// Human readable label used in log messages.
    pub fn label(self) -> &'static str {
        match self {
            HealthComponent::Capture => "capture",
            HealthComponent::Processing => "processing",
        }
    }
}

pub struct PipelineHealth {
    capture: AtomicU64,
    processing: AtomicU64,
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineHealth {
    /// Initialise the health tracker with grace periods for each component.
    pub fn new() -> Self {
        Self::starting_at(current_millis())
    }

    pub fn starting_at(now: u64) -> Self {
        let grace_deadline = now.saturating_add(WATCHDOG_STARTUP_GRACE_MS);
        Self {
            capture: AtomicU64::new(grace_deadline),
            processing: AtomicU64::new(grace_deadline),
        }
    }

    /// Register a heartbeat for the supplied component.
    pub fn beat(&self, component: HealthComponent) {
        self.beat_at(component, current_millis());
    }

    pub fn beat_at(&self, component: HealthComponent, now: u64) {
        match component {
            HealthComponent::Capture => self.capture.store(now, Ordering::Relaxed),
            HealthComponent::Processing => self.processing.store(now, Ordering::Relaxed),
        }
    }

    /// Returns the first component that has not produced a heartbeat recently.
    pub fn stale_component(&self, now: u64) -> Option<HealthComponent> {
        if now.saturating_sub(self.capture.load(Ordering::Relaxed)) > WATCHDOG_STALE_THRESHOLD_MS {
            return Some(HealthComponent::Capture);
        }
        if now.saturating_sub(self.processing.load(Ordering::Relaxed))
            > WATCHDOG_STALE_THRESHOLD_MS
        {
            return Some(HealthComponent::Processing);
        }
        None
    }
}

/// Shared state exposing watchdog triggers to the orchestrator.
#[derive(Default)]
pub struct WatchdogState {
    triggered: AtomicBool,
    reason: Mutex<Option<HealthComponent>>,
}

impl WatchdogState {
    /// Create an unarmed watchdog state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a trigger reason and mark the watchdog as fired.
    pub fn arm(&self, component: HealthComponent) {
        if let Ok(mut guard) = self.reason.lock() {
            *guard = Some(component);
        }
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Describe the component that caused the trigger, if known.
    pub fn reason(&self) -> Option<HealthComponent> {
        match self.reason.lock() {
            Ok(guard) => *guard,
            Err(_) => None,
        }
    }

    /// The trigger as a pipeline error, if the watchdog fired.
    pub fn error(&self) -> Option<PipelineError> {
        self.is_triggered().then(|| PipelineError::Stalled {
            component: self.reason().map_or("unknown", HealthComponent::label),
        })
    }
}

/// Spawn the watchdog thread that polls component health while `running` is set.
pub fn spawn_watchdog(
    health: Arc<PipelineHealth>,
    running: Arc<AtomicBool>,
    state: Arc<WatchdogState>,
) -> Result<thread::JoinHandle<()>, PipelineError> {
    thread::Builder::new()
        .name("v2v-watchdog".into())
        .spawn(move || {
            while running.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(WATCHDOG_POLL_INTERVAL_MS));
                if let Some(component) = health.stale_component(current_millis()) {
                    error!(
                        "Watchdog detected stalled {} stage; stopping the run",
                        component.label()
                    );
                    state.arm(component);
                    running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        })
        .map_err(|source| PipelineError::Spawn {
            name: "watchdog",
            source,
        })
}

fn current_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}
