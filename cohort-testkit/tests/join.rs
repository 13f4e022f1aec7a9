//! Newcomers joining with an invitation seed: the happy paths and every
//! way a proof can be refused.

use cohort_auth::connection::ConnectionContext;
use cohort_auth::team::Team;
use cohort_testkit::harness::{
    connect_pair, enroll, found_team, replica, wait_connected, wait_disconnected, wait_joined,
    wait_message,
};

#[tokio::test]
async fn invitee_joins_and_connects() {
    let (alice_user, alice_device, alice_team) = found_team("devteam", "alice", "laptop");
    alice_team
        .lock()
        .invite_member("bob", "passw0rd")
        .expect("invitation files on the chain");

    let a = ConnectionContext::member(alice_device, alice_user, alice_team.clone());
    let b = ConnectionContext::joining_member("bob", "phone", "passw0rd");
    let ((alice, mut alice_events), (bob, mut bob_events)) = connect_pair(a, b);

    // Bob's join fires before the session comes up.
    let bob_team = wait_joined(&mut bob_events).await;
    wait_connected(&mut bob_events).await;
    wait_connected(&mut alice_events).await;

    assert!(alice_team.lock().has_member("bob"));
    assert!(bob_team.lock().has_member("alice"));
    assert!(bob_team.lock().has_member("bob"));
    assert_eq!(bob_team.lock().head(), alice_team.lock().head());

    alice.send(b"welcome".to_vec());
    assert_eq!(wait_message(&mut bob_events).await, b"welcome");
    bob.send(b"thanks".to_vec());
    assert_eq!(wait_message(&mut alice_events).await, b"thanks");
}

#[tokio::test]
async fn seed_normalization_tolerates_transcription() {
    let (alice_user, alice_device, alice_team) = found_team("devteam", "alice", "laptop");
    alice_team
        .lock()
        .invite_member("bob", "abc def ghi")
        .expect("invitation files on the chain");

    let a = ConnectionContext::member(alice_device, alice_user, alice_team);
    // Bob typed the seed with plus signs; the starter keys still match.
    let b = ConnectionContext::joining_member("bob", "phone", "abc+def+ghi");
    let ((_alice, mut alice_events), (_bob, mut bob_events)) = connect_pair(a, b);

    wait_joined(&mut bob_events).await;
    wait_connected(&mut bob_events).await;
    wait_connected(&mut alice_events).await;
}

#[tokio::test]
async fn forged_invitee_name_is_rejected() {
    let (alice_user, alice_device, alice_team) = found_team("devteam", "alice", "laptop");
    alice_team
        .lock()
        .invite_member("bob", "passw0rd")
        .expect("invitation files on the chain");

    let a = ConnectionContext::member(alice_device, alice_user, alice_team.clone());
    // Eve holds Bob's seed but presents herself under her own name.
    let e = ConnectionContext::joining_member("eve", "phone", "passw0rd");
    let ((_alice, mut alice_events), (_eve, mut eve_events)) = connect_pair(a, e);

    let reason = wait_disconnected(&mut alice_events).await;
    assert!(reason.contains("User names don't match"), "{reason}");
    let reason = wait_disconnected(&mut eve_events).await;
    assert!(reason.contains("User names don't match"), "{reason}");
    assert!(!alice_team.lock().has_member("eve"));
}

#[tokio::test]
async fn revoked_invitation_is_rejected_by_a_synced_replica() {
    let (_alice_user, _alice_device, alice_team) = found_team("devteam", "alice", "laptop");
    let (bob_user, bob_device) = enroll(&alice_team, "bob", "phone");
    let id = alice_team
        .lock()
        .invite_member("charlie", "s3cret")
        .expect("invitation files on the chain");
    alice_team
        .lock()
        .revoke_invitation(&id)
        .expect("revocation files on the chain");

    // Bob's replica is loaded after the revocation persisted; Charlie
    // presents his proof to Bob.
    let bob_team = replica(&alice_team, &bob_device);
    let b = ConnectionContext::member(bob_device, bob_user, bob_team);
    let c = ConnectionContext::joining_member("charlie", "phone", "s3cret");
    let ((_bob, mut bob_events), (_charlie, mut charlie_events)) = connect_pair(b, c);

    let reason = wait_disconnected(&mut bob_events).await;
    assert!(reason.contains("revoked"), "{reason}");
    let reason = wait_disconnected(&mut charlie_events).await;
    assert!(reason.contains("revoked"), "{reason}");
}

#[tokio::test]
async fn two_invitees_cannot_admit_each_other() {
    let b = ConnectionContext::<cohort_testkit::MemTeam>::joining_member("bob", "phone", "seed one");
    let c = ConnectionContext::joining_member("charlie", "tablet", "seed two");
    let ((_bob, mut bob_events), (_charlie, mut charlie_events)) = connect_pair(b, c);

    let reason = wait_disconnected(&mut bob_events).await;
    assert!(reason.contains("neither"), "{reason}");
    let reason = wait_disconnected(&mut charlie_events).await;
    assert!(reason.contains("neither"), "{reason}");
}

#[tokio::test]
async fn new_device_joins_via_lockbox() {
    let (alice_user, alice_device, alice_team) = found_team("devteam", "alice", "laptop");
    alice_team
        .lock()
        .invite_device("tablet seed", &alice_user)
        .expect("device invitation files on the chain");

    let a = ConnectionContext::member(alice_device, alice_user.clone(), alice_team.clone());
    let t = ConnectionContext::joining_device("alice", "tablet", "tablet seed");
    let ((_laptop, mut laptop_events), (_tablet, mut tablet_events)) = connect_pair(a, t);

    let tablet_team = wait_joined(&mut tablet_events).await;
    wait_connected(&mut tablet_events).await;
    wait_connected(&mut laptop_events).await;

    // The new device appears on both replicas, and the tablet recovered
    // the user keys from the lockbox.
    let member = alice_team.lock().member("alice").expect("alice is a member");
    assert!(member.devices.iter().any(|d| d.device_name == "tablet"));
    let member = tablet_team.lock().member("alice").expect("alice is a member");
    assert_eq!(member.keys, alice_user.keys.public());
}
