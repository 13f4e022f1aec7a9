//! Two existing members establishing an encrypted session, and the
//! transport-facing behaviors around it: ordering, duplicates, stored
//! replay, stop and reconnect.

use std::time::Duration;

use cohort_auth::connection::{ConnectionConfig, ConnectionContext};
use cohort_auth::message::{Envelope, Message};
use cohort_auth::team::TeamHandle;
use cohort_testkit::MemTeam;
use cohort_testkit::harness::{
    connect_pair, enroll, found_team, pipe, pipe_duplicating, pipe_swapping_first_two, pump,
    replica, spawn_unpiped, wait_connected, wait_disconnected, wait_message,
};

fn member_pair() -> (
    ConnectionContext<MemTeam>,
    ConnectionContext<MemTeam>,
    TeamHandle<MemTeam>,
    TeamHandle<MemTeam>,
) {
    cohort_testkit::harness::init_tracing();
    let (alice_user, alice_device, alice_team) = found_team("devteam", "alice", "laptop");
    let (bob_user, bob_device) = enroll(&alice_team, "bob", "phone");
    let bob_team = replica(&alice_team, &bob_device);
    (
        ConnectionContext::member(alice_device, alice_user, alice_team.clone()),
        ConnectionContext::member(bob_device, bob_user, bob_team.clone()),
        alice_team,
        bob_team,
    )
}

#[tokio::test]
async fn two_members_connect_and_exchange_traffic() {
    let (a, b, _, _) = member_pair();
    let ((alice, mut alice_events), (bob, mut bob_events)) = connect_pair(a, b);

    wait_connected(&mut alice_events).await;
    wait_connected(&mut bob_events).await;

    // Traffic decrypts in both directions, so both sides hold the same
    // session key.
    alice.send(b"hello bob".to_vec());
    assert_eq!(wait_message(&mut bob_events).await, b"hello bob");
    bob.send(b"hello alice".to_vec());
    assert_eq!(wait_message(&mut alice_events).await, b"hello alice");
}

#[tokio::test]
async fn out_of_order_delivery_is_reordered() {
    let (a, b, _, _) = member_pair();
    let (alice, mut alice_events, a_out) = spawn_unpiped(a, ConnectionConfig::default());
    let (bob, mut bob_events, b_out) = spawn_unpiped(b, ConnectionConfig::default());
    // Bob sees Alice's second message before her first.
    pipe_swapping_first_two(a_out, bob.clone());
    pipe(b_out, alice.clone());
    alice.start();
    bob.start();

    wait_connected(&mut alice_events).await;
    wait_connected(&mut bob_events).await;
}

#[tokio::test]
async fn duplicated_deliveries_are_dropped() {
    let (a, b, _, _) = member_pair();
    let (alice, mut alice_events, a_out) = spawn_unpiped(a, ConnectionConfig::default());
    let (bob, mut bob_events, b_out) = spawn_unpiped(b, ConnectionConfig::default());
    pipe_duplicating(a_out, bob.clone());
    pipe_duplicating(b_out, alice.clone());
    alice.start();
    bob.start();

    wait_connected(&mut alice_events).await;
    wait_connected(&mut bob_events).await;

    // Each payload arrives exactly once despite the double delivery.
    alice.send(b"one".to_vec());
    alice.send(b"two".to_vec());
    assert_eq!(wait_message(&mut bob_events).await, b"one");
    assert_eq!(wait_message(&mut bob_events).await, b"two");
}

#[tokio::test]
async fn stored_messages_replay_on_start() {
    let (a, b, _, _) = member_pair();
    let (alice, mut alice_events, mut a_out) = spawn_unpiped(a, ConnectionConfig::default());
    let (bob, mut bob_events, b_out) = spawn_unpiped(b, ConnectionConfig::default());

    // Alice greets before Bob's connection exists; the host stores the
    // message and hands it to Bob at start.
    alice.start();
    let stored = a_out.recv().await.expect("alice greets");
    pipe(a_out, bob.clone());
    pipe(b_out, alice.clone());
    bob.start_with(vec![stored]);

    wait_connected(&mut alice_events).await;
    wait_connected(&mut bob_events).await;
}

#[tokio::test]
async fn stranger_is_rejected() {
    let (alice_user, alice_device, alice_team) = found_team("devteam", "alice", "laptop");
    let a = ConnectionContext::member(alice_device, alice_user, alice_team);
    // Mallory has her own team; neither side knows the other.
    let (mallory_user, mallory_device, mallory_team) =
        found_team("other team", "mallory", "laptop");
    let m = ConnectionContext::member(mallory_device, mallory_user, mallory_team);

    let ((_alice, mut alice_events), (_mallory, mut mallory_events)) = connect_pair(a, m);
    let reason = wait_disconnected(&mut alice_events).await;
    assert!(reason.contains("member is not on the team"), "{reason}");
    let reason = wait_disconnected(&mut mallory_events).await;
    assert!(!reason.is_empty());
}

#[tokio::test]
async fn stop_is_clean_and_idempotent() {
    let (a, b, _, _) = member_pair();
    let ((alice, mut alice_events), (_bob, mut bob_events)) = connect_pair(a, b);
    wait_connected(&mut alice_events).await;
    wait_connected(&mut bob_events).await;

    alice.stop();
    assert_eq!(wait_disconnected(&mut alice_events).await, "stopped");
    assert_eq!(wait_disconnected(&mut bob_events).await, "peer disconnected");

    // A second stop is a no-op: no further lifecycle events.
    alice.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = alice_events.try_recv() {
        assert_ne!(event.name(), "disconnected");
    }
}

#[tokio::test]
async fn reconnect_after_disconnect() {
    let (a, b, _, _) = member_pair();
    let (alice, mut alice_events, mut a_out) = spawn_unpiped(a, ConnectionConfig::default());
    let (bob, mut bob_events, mut b_out) = spawn_unpiped(b, ConnectionConfig::default());
    alice.start();
    bob.start();
    pump(&mut a_out, &bob, &mut b_out, &alice).await;
    wait_connected(&mut alice_events).await;
    wait_connected(&mut bob_events).await;

    // Alice hangs up; both machines end cleanly.
    alice.stop();
    pump(&mut a_out, &bob, &mut b_out, &alice).await;
    wait_disconnected(&mut alice_events).await;
    wait_disconnected(&mut bob_events).await;

    // Alice restarts. Her greeting lands while Bob is still down, so the
    // host stores it and replays it when Bob restarts.
    alice.start();
    let stored = a_out.recv().await.expect("alice re-greets");
    bob.start_with(vec![stored]);
    pump(&mut a_out, &bob, &mut b_out, &alice).await;
    wait_connected(&mut alice_events).await;
    wait_connected(&mut bob_events).await;

    alice.send(b"back again".to_vec());
    pump(&mut a_out, &bob, &mut b_out, &alice).await;
    assert_eq!(wait_message(&mut bob_events).await, b"back again");
}

#[tokio::test]
async fn gap_that_never_closes_times_out() {
    let (a, _, _, _) = member_pair();
    let config = ConnectionConfig {
        handshake_timeout: Duration::from_millis(300),
        sync_timeout: Duration::from_millis(300),
    };
    let (alice, mut alice_events, _a_out) = spawn_unpiped(a, config);
    alice.start();
    // A message beyond a gap that never closes: the machine stays in
    // place until the phase deadline fires.
    alice.deliver(Envelope::new(5, Message::Ready));
    let reason = wait_disconnected(&mut alice_events).await;
    assert!(reason.contains("timed out"), "{reason}");

    // Events so far never included `connected`.
    while let Ok(event) = alice_events.try_recv() {
        assert_ne!(event.name(), "connected");
    }
}
