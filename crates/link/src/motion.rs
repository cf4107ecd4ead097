//! Motion telemetry and the emergency-stop trigger.
//!
//! Each motion sample either becomes a telemetry record or, on hard deceleration, a stop
//! record plus the local stop indicator. Records go to whatever session is bound to the
//! [`TelemetryChannel`] at that moment; with no session bound they are dropped.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicI64, Ordering},
    },
    thread,
    time::Duration,
};

use chrono::Utc;
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    connection::{STOP_RECORD, SessionHandle},
    error::LinkError,
    events::{EventKind, EventRecord, EventSink},
};

/// Any axis below this acceleration (m/s²) counts as an emergency stop.
pub const STOP_THRESHOLD: f32 = -3.0;
/// How long the local stop indicator stays on after a trigger.
pub const STOP_DISPLAY_MS: i64 = 1_000;
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(60);

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    pub ax: f32,
    pub ay: f32,
    pub az: f32,
    #[serde(default)]
    pub timestamp_ms: i64,
}

fn round3(value: f32) -> f32 {
    (value * 1000.0).round() / 1000.0
}

impl MotionSample {
    pub fn new(ax: f32, ay: f32, az: f32, timestamp_ms: i64) -> Self {
        Self {
            ax,
            ay,
            az,
            timestamp_ms,
        }
    }

    pub fn is_emergency(&self) -> bool {
        self.ax < STOP_THRESHOLD || self.ay < STOP_THRESHOLD || self.az < STOP_THRESHOLD
    }

    /// `ax,ay,az` rounded to three decimals.
    pub fn telemetry_record(&self) -> String {
        format!(
            "{:?},{:?},{:?}",
            round3(self.ax),
            round3(self.ay),
            round3(self.az)
        )
    }
}

/// Local visual stop signal, on for [`STOP_DISPLAY_MS`] after each trigger.
pub struct StopIndicator {
    until_ms: AtomicI64,
    sink: Arc<dyn EventSink>,
}

impl StopIndicator {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            until_ms: AtomicI64::new(i64::MIN),
            sink,
        }
    }

    /// Switch the indicator on (or extend it) from `now_ms`. Returns `true` if it was off.
    pub fn trigger(&self, now_ms: i64) -> bool {
        let until = now_ms.saturating_add(STOP_DISPLAY_MS);
        let previous = self.until_ms.fetch_max(until, Ordering::SeqCst);
        let activated = previous <= now_ms;
        if activated {
            info!("local stop indicator on");
            self.sink
                .append(EventRecord::at(EventKind::LocalStop, now_ms));
        }
        activated
    }

    pub fn is_active(&self, now_ms: i64) -> bool {
        now_ms < self.until_ms.load(Ordering::SeqCst)
    }

    pub fn is_active_now(&self) -> bool {
        self.is_active(Utc::now().timestamp_millis())
    }
}

/// The session motion telemetry is currently sent on, if any.
#[derive(Default)]
pub struct TelemetryChannel {
    active: Mutex<Option<SessionHandle>>,
}

impl TelemetryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<SessionHandle>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bind(&self, handle: SessionHandle) {
        debug!(peer = handle.peer(), "telemetry bound to session");
        *self.slot() = Some(handle);
    }

    pub fn release(&self) {
        if let Some(handle) = self.slot().take() {
            debug!(peer = handle.peer(), "telemetry released from session");
        }
    }

    pub fn snapshot(&self) -> Option<SessionHandle> {
        self.slot().clone()
    }

    pub fn is_bound(&self) -> bool {
        self.slot().is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MotionOutcome {
    Telemetry { delivered: bool },
    EmergencyStop { delivered: bool },
}

pub struct MotionMonitor {
    channel: Arc<TelemetryChannel>,
    stop: Arc<StopIndicator>,
}

impl MotionMonitor {
    pub fn new(channel: Arc<TelemetryChannel>, stop: Arc<StopIndicator>) -> Self {
        Self { channel, stop }
    }

    pub fn on_sample(&self, sample: &MotionSample) -> MotionOutcome {
        let session = self.channel.snapshot();
        if sample.is_emergency() {
            self.stop.trigger(sample.timestamp_ms);
            let delivered = session.is_some_and(|session| session.send(STOP_RECORD));
            MotionOutcome::EmergencyStop { delivered }
        } else {
            let record = sample.telemetry_record();
            let delivered = session.is_some_and(|session| session.send(&record));
            MotionOutcome::Telemetry { delivered }
        }
    }
}

/// Device delivering motion samples.
pub trait MotionSource: Send {
    fn name(&self) -> &str;

    /// Next sample, or `None` when the source is exhausted.
    fn next_sample(&mut self) -> Option<MotionSample>;
}

/// Replays a fixed list of samples in a loop, stamping each with the current time.
pub struct ScriptedMotion {
    samples: Vec<MotionSample>,
    cursor: usize,
}

impl ScriptedMotion {
    pub fn new(samples: Vec<MotionSample>) -> Self {
        Self { samples, cursor: 0 }
    }
}

impl MotionSource for ScriptedMotion {
    fn name(&self) -> &str {
        "scripted"
    }

    fn next_sample(&mut self) -> Option<MotionSample> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sample = self.samples[self.cursor % self.samples.len()];
        self.cursor = self.cursor.wrapping_add(1);
        sample.timestamp_ms = Utc::now().timestamp_millis();
        Some(sample)
    }
}

/// Registration of a [`MotionMonitor`] with a motion source. Dropping it unregisters.
pub struct MotionSubscription {
    stop: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<u64>>,
}

impl MotionSubscription {
    /// Stop delivery and return the number of samples delivered.
    pub fn unregister(mut self) -> u64 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u64 {
        self.stop.take();
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                warn!("motion thread panicked");
                0
            }),
            None => 0,
        }
    }
}

impl Drop for MotionSubscription {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Deliver samples from `source` to `monitor` every `interval` on a dedicated thread.
pub fn subscribe(
    mut source: Box<dyn MotionSource>,
    monitor: MotionMonitor,
    interval: Duration,
) -> Result<MotionSubscription, LinkError> {
    let (stop, stop_rx) = bounded::<()>(0);
    let handle = thread::Builder::new()
        .name("v2v-motion".into())
        .spawn(move || {
            debug!(source = source.name(), ?interval, "motion source registered");
            let mut delivered = 0u64;
            while let Some(sample) = source.next_sample() {
                monitor.on_sample(&sample);
                delivered += 1;
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!(delivered, "motion source unregistered");
            delivered
        })
        .map_err(LinkError::spawn("motion"))?;
    Ok(MotionSubscription {
        stop: Some(stop),
        handle: Some(handle),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;

    #[test]
    fn telemetry_is_rounded_to_three_decimals() {
        let sample = MotionSample::new(0.12345, -1.0, 9.81, 0);
        assert!(!sample.is_emergency());
        assert_eq!(sample.telemetry_record(), "0.123,-1.0,9.81");
    }

    #[test]
    fn any_axis_below_threshold_is_an_emergency() {
        assert!(MotionSample::new(-3.5, 0.0, 0.0, 0).is_emergency());
        assert!(MotionSample::new(0.0, 0.0, -9.0, 0).is_emergency());
        assert!(!MotionSample::new(-3.0, -3.0, -3.0, 0).is_emergency());
    }

    #[test]
    fn stop_indicator_holds_for_one_second_and_logs_activation_once() {
        let sink = Arc::new(MemoryEventSink::new());
        let stop = StopIndicator::new(sink.clone());
        assert!(!stop.is_active(0));

        assert!(stop.trigger(10_000));
        assert!(stop.is_active(10_999));
        assert!(!stop.trigger(10_500), "retrigger only extends the window");
        assert!(stop.is_active(11_499));
        assert!(!stop.is_active(11_500));
        assert_eq!(sink.count(&EventKind::LocalStop), 1);

        assert!(stop.trigger(20_000));
        assert_eq!(sink.count(&EventKind::LocalStop), 2);
    }

    #[test]
    fn samples_without_a_session_are_dropped_silently() {
        let sink = Arc::new(MemoryEventSink::new());
        let stop = Arc::new(StopIndicator::new(sink.clone()));
        let monitor = MotionMonitor::new(Arc::new(TelemetryChannel::new()), stop.clone());

        assert_eq!(
            monitor.on_sample(&MotionSample::new(0.0, 0.0, 9.8, 1_000)),
            MotionOutcome::Telemetry { delivered: false }
        );
        assert_eq!(
            monitor.on_sample(&MotionSample::new(-4.0, 0.0, 9.8, 2_000)),
            MotionOutcome::EmergencyStop { delivered: false }
        );
        assert!(stop.is_active(2_500));
    }

    #[test]
    fn scripted_motion_cycles_and_stamps_samples() {
        let mut source = ScriptedMotion::new(vec![
            MotionSample::new(1.0, 0.0, 0.0, 0),
            MotionSample::new(2.0, 0.0, 0.0, 0),
        ]);
        let picks: Vec<f32> = (0..3)
            .filter_map(|_| source.next_sample())
            .map(|sample| sample.ax)
            .collect();
        assert_eq!(picks, vec![1.0, 2.0, 1.0]);
        assert!(ScriptedMotion::new(Vec::new()).next_sample().is_none());
    }

    #[test]
    fn unregister_stops_delivery() {
        let sink = Arc::new(MemoryEventSink::new());
        let monitor = MotionMonitor::new(
            Arc::new(TelemetryChannel::new()),
            Arc::new(StopIndicator::new(sink)),
        );
        let source = ScriptedMotion::new(vec![MotionSample::new(0.0, 0.0, 9.8, 0)]);
        let subscription =
            subscribe(Box::new(source), monitor, Duration::from_millis(5)).expect("subscribe");
        thread::sleep(Duration::from_millis(40));
        let delivered = subscription.unregister();
        assert!(delivered >= 1);
    }
}
