use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use link::{
    EventKind, MemoryEventSink, MemoryNetwork, MotionMonitor, MotionSample, RecordingNotifier,
    SessionManager, SessionState, StopIndicator,
};
use marker_core::{DecodedMarker, DetectError, DetectionTask, MarkerDetector, Point};
use vision::{
    CalibrationTrigger, Direction, MarkerImage, OwnMarker, PipelineError, ProcessingContext,
    ProximityTracker, RecordingSurface, spawn_processing_loop,
};
use video_ingest::{Frame, FrameFormat, FrameSlot, PooledBuffer, Rotation};

const LEADER: &str = "AA:BB:CC:DD:EE:FF";
const FOLLOWER: &str = "11:22:33:44:55:66";
const WIDTH: i32 = 1280;
const HEIGHT: i32 = 720;

fn frame(sequence: u64) -> Frame {
    Frame {
        data: PooledBuffer::unpooled(vec![0; 16]),
        width: WIDTH,
        height: HEIGHT,
        rotation: Rotation::Deg0,
        timestamp_ms: 0,
        sequence,
        format: FrameFormat::Nv21,
    }
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Detector whose view can be changed while the pipeline runs.
#[derive(Default)]
struct SceneDetector {
    scene: Mutex<Vec<DecodedMarker>>,
}

impl SceneDetector {
    fn show(&self, markers: Vec<DecodedMarker>) {
        *self.scene.lock().expect("scene") = markers;
    }
}

impl MarkerDetector for SceneDetector {
    fn detect(&self, _frame: &Frame) -> DetectionTask {
        DetectionTask::ready(Ok(self.scene.lock().expect("scene").clone()))
    }
}

/// Detector completing on a worker thread after a delay, counting overlapping calls.
struct SlowDetector {
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl MarkerDetector for SlowDetector {
    fn detect(&self, _frame: &Frame) -> DetectionTask {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (completer, task) = DetectionTask::pending();
        let in_flight = self.in_flight.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(3));
            in_flight.fetch_sub(1, Ordering::SeqCst);
            completer.complete(Ok(Vec::new()));
        });
        task
    }
}

struct FailingDetector {
    unavailable_after: u64,
}

impl MarkerDetector for FailingDetector {
    fn detect(&self, frame: &Frame) -> DetectionTask {
        if frame.sequence >= self.unavailable_after {
            DetectionTask::ready(Err(DetectError::Unavailable("camera revoked".into())))
        } else {
            DetectionTask::ready(Err(DetectError::Failed("blurred".into())))
        }
    }
}

struct Follower {
    slot: Arc<FrameSlot>,
    sessions: Arc<SessionManager>,
    sink: Arc<MemoryEventSink>,
    notifier: Arc<RecordingNotifier>,
    surface: Arc<RecordingSurface>,
    tracker: Arc<Mutex<ProximityTracker>>,
    calibration: CalibrationTrigger,
}

fn follower(
    network: &MemoryNetwork,
    detector: Arc<dyn MarkerDetector>,
) -> (Follower, vision::ProcessingHandle) {
    let slot = Arc::new(FrameSlot::new());
    let sink = Arc::new(MemoryEventSink::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let stop = Arc::new(StopIndicator::new(sink.clone()));
    let sessions = Arc::new(SessionManager::new(
        Arc::new(network.transport(FOLLOWER)),
        sink.clone(),
        notifier.clone(),
        stop.clone(),
    ));
    let surface = Arc::new(RecordingSurface::new());
    let tracker = Arc::new(Mutex::new(ProximityTracker::new()));
    let calibration = CalibrationTrigger::new();
    let handle = spawn_processing_loop(ProcessingContext {
        slot: slot.clone(),
        detector,
        tracker: tracker.clone(),
        sessions: sessions.clone(),
        sink: sink.clone(),
        notifier: notifier.clone(),
        stop,
        surface: surface.clone(),
        own_marker: OwnMarker::new(Some(FOLLOWER)),
        calibration: calibration.clone(),
        calibrate_at_frame: None,
        health: None,
    })
    .expect("spawn processing loop");
    (
        Follower {
            slot,
            sessions,
            sink,
            notifier,
            surface,
            tracker,
            calibration,
        },
        handle,
    )
}

#[test]
fn sighting_a_leader_opens_a_session_that_carries_its_telemetry() {
    let network = MemoryNetwork::new();
    let leader_sink = Arc::new(MemoryEventSink::new());
    let leader_stop = Arc::new(StopIndicator::new(leader_sink.clone()));
    let leader = SessionManager::new(
        Arc::new(network.transport(LEADER)),
        leader_sink.clone(),
        Arc::new(RecordingNotifier::new()),
        leader_stop.clone(),
    );
    leader.start_server().expect("leader listens");

    let detector = Arc::new(SceneDetector::default());
    detector.show(vec![DecodedMarker::centered(
        LEADER,
        Point::new(HEIGHT / 2, 300),
        160,
    )]);
    let (follower, processing) = follower(&network, detector.clone());

    let mut sequence = 0;
    let mut publish = |follower: &Follower| {
        follower.slot.publish(frame(sequence));
        sequence += 1;
    };

    publish(&follower);
    wait_until("outbound session", || {
        follower.sessions.client_status().state == SessionState::Connected
    });
    assert_eq!(follower.sessions.client_status().peer.as_deref(), Some(LEADER));
    assert!(follower.notifier.contains(&format!("Connected to {LEADER}!")));
    wait_until("leader accepts", || {
        leader.server_status().state == SessionState::Connected
    });

    let monitor = MotionMonitor::new(leader.telemetry_channel(), leader_stop.clone());
    monitor.on_sample(&MotionSample::new(0.5, 0.0, 9.8, 0));
    wait_until("telemetry at follower", || {
        follower.sink.count(&EventKind::Received("0.5,0.0,9.8".into())) == 1
    });

    publish(&follower);
    follower.calibration.request();
    publish(&follower);
    wait_until("calibration", || follower.notifier.contains("Distance set"));
    assert_eq!(
        follower
            .tracker
            .lock()
            .expect("tracker")
            .calibration()
            .map(|c| c.constant()),
        Some(80.0)
    );

    detector.show(vec![DecodedMarker::centered(
        &format!("{LEADER}:STOP"),
        Point::new(HEIGHT / 2, 300),
        160,
    )]);
    publish(&follower);
    wait_until("peer stop recorded", || {
        follower.sink.count(&EventKind::PeerStop) == 1
    });

    monitor.on_sample(&MotionSample::new(0.0, -5.0, 9.8, 1_000));
    wait_until("remote stop at follower", || {
        follower
            .notifier
            .contains(&format!("Emergency stop from {LEADER}!"))
    });
    publish(&follower);
    wait_until("stop marker displayed", || {
        follower
            .surface
            .states()
            .iter()
            .any(|state| state.marker == MarkerImage::Stop(format!("{FOLLOWER}:STOP")))
    });

    let states = follower.surface.states();
    assert!(states.iter().all(|state| state.direction == Direction::None));
    assert_eq!(
        states.first().map(|state| state.marker.clone()),
        Some(MarkerImage::Address(FOLLOWER.into()))
    );

    follower.slot.shutdown();
    let stats = processing.join().expect("clean processing exit");
    assert_eq!(stats.sessions_opened, 1);
    assert_eq!(stats.detector_failures, 0);
    follower.sessions.shutdown();
    leader.shutdown();
}

#[test]
fn detector_never_sees_two_frames_at_once() {
    let network = MemoryNetwork::new();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let detector = Arc::new(SlowDetector {
        in_flight: in_flight.clone(),
        max_in_flight: max_in_flight.clone(),
        calls: calls.clone(),
    });
    let (follower, processing) = follower(&network, detector);

    for sequence in 0..300 {
        follower.slot.publish(frame(sequence));
        if sequence % 20 == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }
    wait_until("backlog drained", || {
        !follower.slot.is_in_flight() && !follower.slot.has_pending()
    });
    follower.slot.shutdown();
    let stats = processing.join().expect("clean processing exit");

    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst) as u64, stats.frames);
    assert!(stats.frames < 300, "stale frames are dropped, not queued");
    let slot_stats = follower.slot.stats();
    assert_eq!(slot_stats.claimed, stats.frames);
}

#[test]
fn failed_detections_release_the_slot_and_unavailability_ends_the_loop() {
    let network = MemoryNetwork::new();
    let (follower, processing) = follower(&network, Arc::new(FailingDetector { unavailable_after: 3 }));

    for sequence in 0..3 {
        follower.slot.publish(frame(sequence));
        wait_until("failed frame processed", || {
            follower.slot.stats().claimed == sequence + 1 && !follower.slot.is_in_flight()
        });
    }
    follower.slot.publish(frame(3));

    let outcome = processing.join();
    assert!(matches!(outcome, Err(PipelineError::DetectorUnavailable(_))));
    assert!(!follower.slot.is_in_flight());
    assert_eq!(follower.surface.states().len(), 3);
}
