//! Frame processing and its supervision.

mod processing;
pub mod watchdog;

use std::io;

use thiserror::Error;

pub use processing::{
    CalibrationTrigger, ProcessingContext, ProcessingHandle, ProcessingStats,
    spawn_processing_loop,
};
pub use watchdog::{HealthComponent, PipelineHealth, WatchdogState, spawn_watchdog};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{component} stage stalled")]
    Stalled { component: &'static str },
    #[error("marker detector unavailable: {0}")]
    DetectorUnavailable(String),
    #[error("failed to spawn {name} thread")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{0} thread panicked")]
    Panicked(&'static str),
}
