//! Run supervisor tying together the frame pump, the processing loop, the session layer and
//! the motion monitor.
//!
//! The orchestrator wires the components, watches for operator commands and pipeline
//! faults, and tears everything down in dependency order when the run ends.

use std::{
    sync::{
        Arc, Mutex, Once,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use link::{
    EventSink, FileEventSink, LogNotifier, MotionMonitor, Notifier, ScriptedMotion,
    SessionManager, StopIndicator, TcpTransport, subscribe,
};
use marker_core::ScriptedDetector;
use tracing::{debug, info, info_span, warn};
use video_ingest::{FrameSlot, SlotStats, SyntheticSource, spawn_frame_pump};
use vision::{
    CalibrationTrigger, HealthComponent, LogSurface, OwnMarker, PipelineHealth,
    ProcessingContext, ProcessingStats, ProximityTracker, WatchdogState, spawn_processing_loop,
    spawn_watchdog,
};

use crate::{
    config::SimulatorConfig,
    console::{self, ConsoleCommand},
    scenario::Scenario,
    telemetry,
};

/// How often the supervisor checks component health between operator commands.
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(100);
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// Why a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Quit,
    SourceEnded,
    ProcessingEnded,
    Stalled,
}

#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub processing: ProcessingStats,
    pub slot: SlotStats,
    pub motion_samples: u64,
}

/// Run the simulator until the operator quits or a component fails.
pub fn run(config: SimulatorConfig) -> Result<()> {
    let _telemetry_guard = telemetry::install(&config.telemetry);
    let _ = telemetry::init_metrics_recorder();

    let scenario = match config.scenario.as_deref() {
        Some(path) => Scenario::load(path)?,
        None => {
            info!("no scenario given; running with an idle camera and motion sensor");
            Scenario::default()
        }
    };

    let (commands_tx, commands_rx) = unbounded();
    install_ctrlc_handler(commands_tx.clone());
    if let Err(err) = console::spawn_console(commands_tx.clone()) {
        warn!("operator console unavailable: {err}");
    }

    let report = run_scenario(&config, scenario, &commands_rx)?;
    drop(commands_tx);

    info!(
        outcome = ?report.outcome,
        frames = report.processing.frames,
        published = report.slot.published,
        overwritten = report.slot.overwritten,
        detector_failures = report.processing.detector_failures,
        sessions_opened = report.processing.sessions_opened,
        sessions_cancelled = report.processing.sessions_cancelled,
        motion_samples = report.motion_samples,
        "run finished"
    );
    if let Some(rendered) = telemetry::render_metrics() {
        debug!("final metrics:\n{rendered}");
    }
    Ok(())
}

fn install_ctrlc_handler(commands: Sender<ConsoleCommand>) {
    static CTRL_HANDLER: Once = Once::new();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            let _ = commands.send(ConsoleCommand::Quit);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });
}

/// Wire every component for `scenario` and supervise until the run ends.
///
/// A closed `commands` channel counts as a quit request.
pub fn run_scenario(
    config: &SimulatorConfig,
    scenario: Scenario,
    commands: &Receiver<ConsoleCommand>,
) -> Result<RunReport> {
    let geometry = scenario.geometry(&config.frame)?;
    let run_span = info_span!(
        "v2v.run",
        address = config.own_address.as_deref().unwrap_or("-"),
        listen = %config.listen,
        peers = config.peers.len(),
        width = geometry.width,
        height = geometry.height,
        fps = geometry.fps
    );
    let _run_span_guard = run_span.enter();

    let file_sink = Arc::new(FileEventSink::open(&config.log_dir).with_context(|| {
        format!("failed to open event log in {}", config.log_dir.display())
    })?);
    let sink: Arc<dyn EventSink> = file_sink.clone();
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let stop = Arc::new(StopIndicator::new(sink.clone()));

    let transport = Arc::new(TcpTransport::new(config.listen, config.peers.clone()));
    let sessions = Arc::new(SessionManager::new(
        transport,
        sink.clone(),
        notifier.clone(),
        stop.clone(),
    ));
    sessions
        .start_server()
        .with_context(|| format!("failed to listen on {}", config.listen))?;

    let health = Arc::new(PipelineHealth::new());
    let running = Arc::new(AtomicBool::new(true));
    let watchdog_state = Arc::new(WatchdogState::new());

    let slot = Arc::new(FrameSlot::new());
    let _slot_guard = SlotShutdown(slot.clone());
    let source = SyntheticSource::new(geometry).context("failed to open frame source")?;
    let pump = {
        let health = health.clone();
        spawn_frame_pump(Box::new(source), slot.clone(), move || {
            health.beat(HealthComponent::Capture)
        })
        .context("failed to start frame pump")?
    };

    let calibration = CalibrationTrigger::new();
    let processing = spawn_processing_loop(ProcessingContext {
        slot: slot.clone(),
        detector: Arc::new(ScriptedDetector::new(scenario.frames, scenario.looping)),
        tracker: Arc::new(Mutex::new(ProximityTracker::new())),
        sessions: sessions.clone(),
        sink: sink.clone(),
        notifier: notifier.clone(),
        stop: stop.clone(),
        surface: Arc::new(LogSurface::new()),
        own_marker: OwnMarker::new(config.own_address.as_deref()),
        calibration: calibration.clone(),
        calibrate_at_frame: config.calibrate_at_frame,
        health: Some(health.clone()),
    })
    .context("failed to start processing loop")?;

    if scenario.motion.is_empty() {
        info!("no motion samples scripted; telemetry disabled");
    }
    let motion = subscribe(
        Box::new(ScriptedMotion::new(scenario.motion)),
        MotionMonitor::new(sessions.telemetry_channel(), stop.clone()),
        config.motion_interval,
    )
    .context("failed to register motion monitor")?;

    let watchdog = spawn_watchdog(health, running.clone(), watchdog_state.clone())
        .context("failed to start watchdog")?;

    info!("simulator running; type `calibrate` or `quit`");
    let mut last_status = Instant::now();
    let outcome = loop {
        match commands.recv_timeout(SUPERVISE_INTERVAL) {
            Ok(ConsoleCommand::Calibrate) => {
                info!("calibration requested");
                calibration.request();
            }
            Ok(ConsoleCommand::Quit) | Err(RecvTimeoutError::Disconnected) => {
                break RunOutcome::Quit;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        if watchdog_state.is_triggered() {
            break RunOutcome::Stalled;
        }
        if processing.is_finished() {
            break RunOutcome::ProcessingEnded;
        }
        if pump.is_finished() {
            break RunOutcome::SourceEnded;
        }

        if last_status.elapsed() >= STATUS_INTERVAL {
            last_status = Instant::now();
            let stats = slot.stats();
            debug!(
                published = stats.published,
                overwritten = stats.overwritten,
                claimed = stats.claimed,
                server = ?sessions.server_status().state,
                client = ?sessions.client_status().state,
                "status"
            );
        }
    };
    info!(?outcome, "stopping simulator");

    running.store(false, Ordering::SeqCst);
    let motion_samples = motion.unregister();
    let pump_result = pump.stop();
    slot.shutdown();
    let processing_result = processing.join();
    sessions.shutdown();
    if watchdog.join().is_err() {
        warn!("watchdog thread panicked");
    }
    sink.flush();
    debug!(dir = %file_sink.dir().display(), "event log flushed");

    if let Some(err) = watchdog_state.error() {
        return Err(err).context("pipeline stalled");
    }
    let processing_stats = processing_result.context("processing loop failed")?;
    pump_result.context("frame source failed")?;

    Ok(RunReport {
        outcome,
        processing: processing_stats,
        slot: slot.stats(),
        motion_samples,
    })
}

/// Releases the processing thread if the run is abandoned half way through wiring.
struct SlotShutdown(Arc<FrameSlot>);

impl Drop for SlotShutdown {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}
