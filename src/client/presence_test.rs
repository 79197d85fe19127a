use std::sync::{Arc, Mutex};

use uuid::Uuid;

use super::*;

const TIMEOUT: Duration = Duration::from_secs(30);

fn state(name: &str) -> PeerState {
    PeerState { name: name.into(), color: "#ff0000".into(), cursor: None, viewport: None }
}

fn remote(peer: PeerId, clock: u64, name: &str) -> AwarenessUpdate {
    AwarenessUpdate { peer_id: peer, clock, state: state(name) }
}

#[test]
fn local_state_counts_as_a_peer() {
    let mut awareness = Awareness::new(Uuid::new_v4(), TIMEOUT);
    assert_eq!(awareness.peer_count(), 0);
    let update = awareness.set_local_state(state("me"));
    assert_eq!(update.clock, 1);
    assert_eq!(awareness.peer_count(), 1);
}

#[test]
fn remote_publish_replaces_state_wholesale() {
    let mut awareness = Awareness::new(Uuid::new_v4(), TIMEOUT);
    let other = Uuid::new_v4();
    assert!(awareness.apply_remote(remote(other, 1, "a")));

    let mut next = remote(other, 2, "b");
    next.state.cursor = Some(Point { x: 1.0, y: 2.0 });
    assert!(awareness.apply_remote(next.clone()));

    let states = awareness.states();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0], (other, next.state));
}

#[test]
fn stale_clock_is_rejected() {
    let mut awareness = Awareness::new(Uuid::new_v4(), TIMEOUT);
    let other = Uuid::new_v4();
    awareness.apply_remote(remote(other, 5, "new"));
    assert!(!awareness.apply_remote(remote(other, 4, "old")));
    assert_eq!(awareness.states()[0].1.name, "new");
}

#[test]
fn own_echo_is_ignored() {
    let me = Uuid::new_v4();
    let mut awareness = Awareness::new(me, TIMEOUT);
    assert!(!awareness.apply_remote(remote(me, 9, "echo")));
    assert_eq!(awareness.peer_count(), 0);
}

#[test]
fn many_publishes_keep_one_entry_per_peer() {
    let mut awareness = Awareness::new(Uuid::new_v4(), TIMEOUT);
    let other = Uuid::new_v4();
    for clock in 1..=1_000 {
        awareness.apply_remote(remote(other, clock, &format!("n{clock}")));
    }
    assert_eq!(awareness.states().len(), 1);
}

#[test]
fn remove_and_clear_drop_remote_peers() {
    let mut awareness = Awareness::new(Uuid::new_v4(), TIMEOUT);
    awareness.set_local_state(state("me"));
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    awareness.apply_remote(remote(a, 1, "a"));
    awareness.apply_remote(remote(b, 1, "b"));
    assert_eq!(awareness.peer_count(), 3);

    assert!(awareness.remove_peer(a));
    assert!(!awareness.remove_peer(a));
    assert_eq!(awareness.peer_count(), 2);

    awareness.clear_remote();
    assert_eq!(awareness.peer_count(), 1);
}

#[test]
fn prune_removes_silent_peers_only() {
    let start = Instant::now();
    let mut awareness = Awareness::new(Uuid::new_v4(), TIMEOUT);
    let quiet = Uuid::new_v4();
    let chatty = Uuid::new_v4();
    awareness.apply_remote_at(remote(quiet, 1, "q"), start);
    awareness.apply_remote_at(remote(chatty, 1, "c"), start);
    awareness.apply_remote_at(remote(chatty, 2, "c"), start + Duration::from_secs(20));

    let removed = awareness.prune(start + Duration::from_secs(31));
    assert_eq!(removed, vec![quiet]);
    assert_eq!(awareness.peer_count(), 1);
}

#[test]
fn same_state_refreshes_liveness_without_event() {
    let start = Instant::now();
    let mut awareness = Awareness::new(Uuid::new_v4(), TIMEOUT);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    awareness.on_update(move |e| sink.lock().unwrap().push(e.clone()));

    let other = Uuid::new_v4();
    awareness.apply_remote_at(remote(other, 1, "a"), start);
    assert!(!awareness.apply_remote_at(remote(other, 2, "a"), start + Duration::from_secs(25)));
    assert!(awareness.prune(start + Duration::from_secs(40)).is_empty());
    assert_eq!(*events.lock().unwrap(), vec![PresenceEvent::Updated(other)]);
}

#[test]
fn heartbeat_due_after_half_timeout() {
    let start = Instant::now();
    let mut awareness = Awareness::new(Uuid::new_v4(), TIMEOUT);
    assert!(!awareness.heartbeat_due(start));

    awareness.set_local_state_at(state("me"), start);
    assert!(!awareness.heartbeat_due(start + Duration::from_secs(14)));
    assert!(awareness.heartbeat_due(start + Duration::from_secs(15)));

    let beat = awareness.publish_at(start + Duration::from_secs(15)).unwrap();
    assert_eq!(beat.clock, 2);
    assert!(!awareness.heartbeat_due(start + Duration::from_secs(20)));
}

#[test]
fn update_local_edits_in_place() {
    let mut awareness = Awareness::new(Uuid::new_v4(), TIMEOUT);
    awareness.set_local_state(state("me"));
    let update = awareness.update_local_at(Instant::now(), |s| {
        s.viewport = Some(Viewport { scroll_x: 5.0, scroll_y: 6.0, zoom: 2.0 });
    });
    assert_eq!(update.state.name, "me");
    assert_eq!(awareness.local_state().unwrap().viewport.unwrap().zoom, 2.0);
}

#[test]
fn awareness_update_data_round_trip() {
    let update = remote(Uuid::new_v4(), 3, "x");
    let data = update.to_data();
    assert_eq!(data["clock"], serde_json::json!(3));
    assert_eq!(AwarenessUpdate::from_data(&data).unwrap(), update);

    let mut broken = data;
    broken.remove("peer_id");
    assert!(AwarenessUpdate::from_data(&broken).is_err());
}

#[test]
fn events_report_removal_and_clear() {
    let mut awareness = Awareness::new(Uuid::new_v4(), TIMEOUT);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    awareness.on_update(move |e| sink.lock().unwrap().push(e.clone()));

    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    awareness.apply_remote(remote(a, 1, "a"));
    awareness.apply_remote(remote(b, 1, "b"));
    awareness.remove_peer(a);
    awareness.clear_remote();
    awareness.clear_remote();

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            PresenceEvent::Updated(a),
            PresenceEvent::Updated(b),
            PresenceEvent::Removed(a),
            PresenceEvent::Cleared,
        ]
    );
}
