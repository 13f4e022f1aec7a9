//! Wiring helpers for pair-connection tests.
//!
//! Connections talk to each other through JSON-serialized envelopes, the
//! same framing a real transport would carry, so every test also
//! exercises the codec. Panics freely: this module exists for tests.

use std::time::Duration;

use tokio::sync::mpsc;

use cohort_auth::connection::{Connection, ConnectionConfig, ConnectionContext};
use cohort_auth::event::ConnectionEvent;
use cohort_auth::message::Envelope;
use cohort_auth::team::{DeviceInfo, Member, Team, TeamHandle, UserInfo};

use crate::team::MemTeam;

/// Event stream of one connection under test.
pub type Events = mpsc::UnboundedReceiver<ConnectionEvent<MemTeam>>;

/// Install a `RUST_LOG`-driven subscriber, once per process. Call at the
/// top of a test to watch the protocol run.
pub fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Found a fresh team and return the founder's identity and replica.
pub fn found_team(
    team_name: &str,
    user_name: &str,
    device_name: &str,
) -> (UserInfo, DeviceInfo, TeamHandle<MemTeam>) {
    let user = UserInfo::generate(user_name);
    let device = DeviceInfo::generate(user_name, device_name);
    let team = MemTeam::create(team_name, &user, &device)
        .expect("founding a team succeeds")
        .into_handle();
    (user, device, team)
}

/// Enroll a member directly (keys known out of band) and return its
/// identity.
pub fn enroll(
    team: &TeamHandle<MemTeam>,
    user_name: &str,
    device_name: &str,
) -> (UserInfo, DeviceInfo) {
    let user = UserInfo::generate(user_name);
    let device = DeviceInfo::generate(user_name, device_name);
    team.lock()
        .add_member(Member {
            user_name: user_name.to_string(),
            keys: user.keys.public(),
            admin: false,
            devices: vec![device.record()],
        })
        .expect("enrolling a member succeeds");
    (user, device)
}

/// An independent replica of `team` for another device.
pub fn replica(team: &TeamHandle<MemTeam>, device: &DeviceInfo) -> TeamHandle<MemTeam> {
    let saved = team.lock().save();
    MemTeam::load(&saved, device)
        .expect("replica loads from saved chain")
        .into_handle()
}

fn reframe(envelope: &Envelope) -> Envelope {
    let wire = serde_json::to_string(envelope).expect("envelope serializes");
    serde_json::from_str(&wire).expect("envelope deserializes")
}

/// Forward envelopes to the peer, through a JSON round-trip.
pub fn pipe(mut outbound: mpsc::UnboundedReceiver<Envelope>, to: Connection) {
    tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            to.deliver(reframe(&envelope));
        }
    });
}

/// Forward envelopes, delivering every one of them twice.
pub fn pipe_duplicating(mut outbound: mpsc::UnboundedReceiver<Envelope>, to: Connection) {
    tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            to.deliver(reframe(&envelope));
            to.deliver(reframe(&envelope));
        }
    });
}

/// Forward envelopes, holding the first back until the second arrives and
/// then delivering the two in swapped order.
pub fn pipe_swapping_first_two(mut outbound: mpsc::UnboundedReceiver<Envelope>, to: Connection) {
    tokio::spawn(async move {
        let first = outbound.recv().await;
        let second = outbound.recv().await;
        if let Some(second) = second {
            to.deliver(reframe(&second));
        }
        if let Some(first) = first {
            to.deliver(reframe(&first));
        }
        while let Some(envelope) = outbound.recv().await {
            to.deliver(reframe(&envelope));
        }
    });
}

/// Spawn two connections without wiring them, for tests that drive the
/// transport by hand.
pub fn spawn_unpiped(
    context: ConnectionContext<MemTeam>,
    config: ConnectionConfig,
) -> (Connection, Events, mpsc::UnboundedReceiver<Envelope>) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (conn, events) = Connection::spawn(context, config, out_tx);
    (conn, events, out_rx)
}

/// Spawn, wire and start a connected pair.
pub fn connect_pair(
    a: ConnectionContext<MemTeam>,
    b: ConnectionContext<MemTeam>,
) -> ((Connection, Events), (Connection, Events)) {
    connect_pair_with(a, b, ConnectionConfig::default())
}

pub fn connect_pair_with(
    a: ConnectionContext<MemTeam>,
    b: ConnectionContext<MemTeam>,
    config: ConnectionConfig,
) -> ((Connection, Events), (Connection, Events)) {
    let (a_conn, a_events, a_out) = spawn_unpiped(a, config.clone());
    let (b_conn, b_events, b_out) = spawn_unpiped(b, config);
    pipe(a_out, b_conn.clone());
    pipe(b_out, a_conn.clone());
    a_conn.start();
    b_conn.start();
    ((a_conn, a_events), (b_conn, b_events))
}

/// Ferry envelopes in both directions until the wire has been quiet for a
/// moment. For tests that need to hold, inspect or replay traffic between
/// rounds.
pub async fn pump(
    a_out: &mut mpsc::UnboundedReceiver<Envelope>,
    to_b: &Connection,
    b_out: &mut mpsc::UnboundedReceiver<Envelope>,
    to_a: &Connection,
) {
    loop {
        tokio::select! {
            Some(envelope) = a_out.recv() => to_b.deliver(reframe(&envelope)),
            Some(envelope) = b_out.recv() => to_a.deliver(reframe(&envelope)),
            _ = tokio::time::sleep(Duration::from_millis(200)) => break,
        }
    }
}

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// The next event, or panic after a deadline.
pub async fn next_event(events: &mut Events) -> ConnectionEvent<MemTeam> {
    tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for a connection event")
        .expect("event channel closed")
}

/// Skip events until one with the given name arrives.
pub async fn wait_for(events: &mut Events, name: &str) -> ConnectionEvent<MemTeam> {
    loop {
        let event = next_event(events).await;
        if event.name() == name {
            return event;
        }
    }
}

pub async fn wait_connected(events: &mut Events) {
    wait_for(events, "connected").await;
}

pub async fn wait_joined(events: &mut Events) -> TeamHandle<MemTeam> {
    match wait_for(events, "joined").await {
        ConnectionEvent::Joined { team } => team,
        _ => unreachable!(),
    }
}

pub async fn wait_disconnected(events: &mut Events) -> String {
    match wait_for(events, "disconnected").await {
        ConnectionEvent::Disconnected { reason } => reason,
        _ => unreachable!(),
    }
}

pub async fn wait_message(events: &mut Events) -> Vec<u8> {
    match wait_for(events, "message").await {
        ConnectionEvent::Message { payload } => payload,
        _ => unreachable!(),
    }
}

pub async fn wait_updated(events: &mut Events) -> String {
    match wait_for(events, "updated").await {
        ConnectionEvent::Updated { head } => head,
        _ => unreachable!(),
    }
}
