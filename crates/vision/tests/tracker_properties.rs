use marker_core::{DecodedMarker, Point};
use proptest::prelude::*;
use vision::{Direction, ProximityTracker, SessionCommand, TrackerEvent};

const HEIGHT: i32 = 720;

fn address(index: usize) -> String {
    format!("02:00:00:00:{:02X}:{:02X}", index / 256, index % 256)
}

fn marker(payload: &str, x: i32, size: i32) -> DecodedMarker {
    DecodedMarker::centered(payload, Point::new(x, HEIGHT / 2), size)
}

fn central_x() -> impl Strategy<Value = i32> {
    (HEIGHT / 4)..=(3 * (HEIGHT / 4))
}

proptest! {
    #[test]
    fn closer_candidates_always_replace_the_engaged_peer(
        base in 40i32..200,
        steps in prop::collection::vec((1i32..40, central_x()), 1..25),
    ) {
        let mut tracker = ProximityTracker::new();
        let anchor = "02:FF:FF:FF:FF:FF";
        tracker.observe_frame(&[marker(anchor, HEIGHT / 2, base)], HEIGHT, 0);
        prop_assert!(tracker.calibrate().is_some());

        let mut size = base;
        let mut last_distance = tracker.engaged().and_then(|e| e.distance_m);
        for (index, (grow, x)) in steps.into_iter().enumerate() {
            size += grow;
            let candidate = address(index);
            let now = 10 * (index as i64 + 1);
            let decision = tracker.observe_frame(&[marker(&candidate, x, size)], HEIGHT, now);

            prop_assert_eq!(decision.commands, vec![SessionCommand::Open(candidate.clone())]);
            let engaged = tracker.engaged().expect("engaged after replacement");
            prop_assert_eq!(&engaged.content, &candidate);
            prop_assert!(engaged.distance_m < last_distance);
            last_distance = engaged.distance_m;
        }
    }

    #[test]
    fn uncalibrated_distance_never_blocks_acquisition(
        steps in prop::collection::vec((1i32..400, central_x()), 1..25),
    ) {
        let mut tracker = ProximityTracker::new();
        for (index, (size, x)) in steps.into_iter().enumerate() {
            let candidate = address(index);
            let decision = tracker.observe_frame(&[marker(&candidate, x, size)], HEIGHT, index as i64);
            prop_assert_eq!(decision.commands, vec![SessionCommand::Open(candidate.clone())]);
            prop_assert_eq!(tracker.engaged().map(|e| e.distance_m), Some(None));
        }
    }

    #[test]
    fn calibrated_distance_is_exact(reference in 2i32..800, size in 1i32..800) {
        let mut tracker = ProximityTracker::new();
        tracker.observe_frame(&[marker(&address(0), HEIGHT / 2, reference)], HEIGHT, 0);
        let k = tracker.calibrate().expect("engaged peer").constant();
        prop_assert_eq!(k, reference as f32 / 2.0);

        tracker.observe_frame(&[marker(&address(0), HEIGHT / 2, size)], HEIGHT, 1);
        let engaged = tracker.engaged().expect("same peer refreshed");
        prop_assert_eq!(engaged.distance_m, Some(2.0 * k / size as f32));
    }

    #[test]
    fn staleness_cancels_exactly_once(gap in 0i64..20_000) {
        let mut tracker = ProximityTracker::new();
        tracker.observe_frame(&[marker(&address(1), HEIGHT / 2, 100)], HEIGHT, 0);
        let decision = tracker.observe_frame(&[], HEIGHT, gap);
        let follow_up = tracker.observe_frame(&[], HEIGHT, gap + 1);
        let cancels = decision
            .commands
            .iter()
            .chain(follow_up.commands.iter())
            .filter(|command| **command == SessionCommand::Cancel)
            .count();
        let expected = usize::from(gap + 1 > 5_000);
        prop_assert_eq!(cancels, expected);
    }
}

#[test]
fn two_sightings_of_one_peer_open_a_single_session() {
    let peer = "11:22:33:44:55:66";
    let mut tracker = ProximityTracker::new();

    let first = tracker.observe_frame(&[marker(peer, HEIGHT / 2, 200)], HEIGHT, 0);
    let second = tracker.observe_frame(&[marker(peer, HEIGHT / 2, 150)], HEIGHT, 40);

    let opens: Vec<_> = first
        .commands
        .iter()
        .chain(second.commands.iter())
        .filter(|command| matches!(command, SessionCommand::Open(_)))
        .collect();
    assert_eq!(opens, vec![&SessionCommand::Open(peer.into())]);
    assert_eq!(tracker.engaged().expect("engaged").apparent_size, 150);
    assert_eq!(first.direction, Direction::None);
    assert_eq!(second.direction, Direction::None);
}

#[test]
fn stop_marker_is_recognised_then_cleared() {
    let peer = "AA:BB:CC:DD:EE:FF";
    let stop = "AA:BB:CC:DD:EE:FF:STOP";
    let mut tracker = ProximityTracker::new();
    tracker.observe_frame(&[marker(peer, HEIGHT / 2, 120)], HEIGHT, 0);

    let stopped = tracker.observe_frame(&[marker(stop, HEIGHT / 2, 120)], HEIGHT, 10);
    let stop_events = stopped
        .events
        .iter()
        .filter(|event| matches!(event, TrackerEvent::PeerStop(_)))
        .count();
    assert_eq!(stop_events, 1);
    assert_eq!(tracker.engaged().expect("engaged").content, stop);

    tracker.observe_frame(&[marker(peer, HEIGHT / 2, 120)], HEIGHT, 20);
    assert_eq!(tracker.engaged().expect("engaged").content, peer);
}
