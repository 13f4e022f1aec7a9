//! Per-peer connection driver.
//!
//! Each connection runs as one cooperative task that owns all mutable
//! state: the protocol phase, the connection context, the outbound index
//! counter and the inbound reassembly buffer. The host talks to it through
//! a cloneable [`Connection`] handle and listens on the event channel
//! returned by [`Connection::spawn`].
//!
//! The handler split mirrors the protocol itself:
//! - [`machine`] — the phase and handshake sub-state types
//! - `handshake` — HELLO, invitation resolution, identity challenges
//! - `sync` — chain reconciliation, seed negotiation, session traffic

pub mod machine;

mod handshake;
mod sync;

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::challenge::IdentityChallenge;
use crate::crypto::Sealed;
use crate::delivery::DeliveryBuffer;
use crate::error::{AuthError, ErrorPayload};
use crate::event::ConnectionEvent;
use crate::invitation::ProofOfInvitation;
use crate::message::{Envelope, Message};
use crate::team::{
    DeviceInfo, Hash, IdentityClaim, IdentityKind, Invitee, Member, Team, TeamHandle, UserInfo,
};

use self::machine::{Handshake, Phase};

/// Tunable connection timeouts.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Budget for the whole handshake (starting through identity
    /// acceptance).
    pub handshake_timeout: Duration,
    /// Budget for each synchronization or negotiation pass.
    pub sync_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(60),
        }
    }
}

/// Everything one connection knows, mutable only from its own task.
pub struct ConnectionContext<T: Team> {
    /// The local device identity.
    pub device: DeviceInfo,
    /// The local user identity. `None` iff this side is an unjoined
    /// invitee.
    pub user: Option<UserInfo>,
    /// Set iff this side is joining via invitation.
    pub invitee: Option<Invitee>,
    pub invitation_seed: Option<String>,
    /// The local team replica. `None` iff this side is an unjoined
    /// invitee.
    pub team: Option<TeamHandle<T>>,

    /// User identity generated up front by a member-kind invitee; moved
    /// into `user` once `join` succeeds.
    pub(crate) new_user: Option<UserInfo>,

    pub(crate) their_identity_claim: Option<IdentityClaim>,
    pub(crate) they_have_invitation: bool,
    pub(crate) their_proof: Option<ProofOfInvitation>,
    pub(crate) my_proof: Option<ProofOfInvitation>,
    pub(crate) proof_sent: bool,
    pub(crate) peer: Option<Member>,
    pub(crate) challenge: Option<IdentityChallenge>,
    pub(crate) seed: Option<[u8; 32]>,
    pub(crate) their_encrypted_seed: Option<Sealed>,
    pub(crate) session_key: Option<[u8; 32]>,
    pub(crate) their_head: Option<Hash>,
    pub(crate) error: Option<ErrorPayload>,
}

impl<T: Team> ConnectionContext<T> {
    fn empty(device: DeviceInfo) -> Self {
        Self {
            device,
            user: None,
            invitee: None,
            invitation_seed: None,
            team: None,
            new_user: None,
            their_identity_claim: None,
            they_have_invitation: false,
            their_proof: None,
            my_proof: None,
            proof_sent: false,
            peer: None,
            challenge: None,
            seed: None,
            their_encrypted_seed: None,
            session_key: None,
            their_head: None,
            error: None,
        }
    }

    /// Context for an existing team member.
    pub fn member(device: DeviceInfo, user: UserInfo, team: TeamHandle<T>) -> Self {
        Self {
            user: Some(user),
            team: Some(team),
            ..Self::empty(device)
        }
    }

    /// Context for a new user joining with an invitation seed. Fresh user
    /// and device keys are generated here; `user` is populated once the
    /// join completes.
    pub fn joining_member(user_name: &str, device_name: &str, invitation_seed: &str) -> Self {
        Self {
            invitee: Some(Invitee {
                kind: IdentityKind::Member,
                name: user_name.to_string(),
            }),
            invitation_seed: Some(invitation_seed.to_string()),
            new_user: Some(UserInfo::generate(user_name)),
            ..Self::empty(DeviceInfo::generate(user_name, device_name))
        }
    }

    /// Context for a new device of an existing user, joining with an
    /// invitation seed. The user keys are recovered from the chain's
    /// lockbox during join.
    pub fn joining_device(user_name: &str, device_name: &str, invitation_seed: &str) -> Self {
        let device = DeviceInfo::generate(user_name, device_name);
        Self {
            invitee: Some(Invitee {
                kind: IdentityKind::Device,
                name: device.device_id(),
            }),
            invitation_seed: Some(invitation_seed.to_string()),
            ..Self::empty(device)
        }
    }

    /// True while we hold an unredeemed invitation.
    pub(crate) fn i_have_invitation(&self) -> bool {
        self.invitee.is_some() && self.team.is_none()
    }

    /// Clear per-life negotiation state before a reconnect. Identity,
    /// team and the cached invitation proof survive.
    fn reset_for_reconnect(&mut self) {
        self.their_identity_claim = None;
        self.they_have_invitation = false;
        self.their_proof = None;
        self.proof_sent = false;
        self.peer = None;
        self.challenge = None;
        self.seed = None;
        self.their_encrypted_seed = None;
        self.session_key = None;
        self.their_head = None;
        self.error = None;
    }
}

pub(crate) enum Command {
    Start { stored: Vec<Envelope> },
    Stop,
    Send { payload: Vec<u8> },
    Deliver { envelope: Envelope },
}

/// Cloneable handle to a running connection task.
#[derive(Clone)]
pub struct Connection {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Connection {
    /// Spawn a connection task. Outbound envelopes go to `outbound`; the
    /// returned receiver carries lifecycle and traffic events.
    pub fn spawn<T: Team>(
        context: ConnectionContext<T>,
        config: ConnectionConfig,
        outbound: mpsc::UnboundedSender<Envelope>,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent<T>>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let task = ConnectionTask {
            ctx: context,
            phase: Phase::Idle,
            config,
            outbound,
            events: event_tx,
            next_index: 0,
            buffer: DeliveryBuffer::new(),
            deadline: None,
            started: false,
            pending_start: Vec::new(),
        };
        tokio::spawn(task.run(cmd_rx));
        (Self { cmd_tx }, event_rx)
    }

    /// Start the machine and greet the peer.
    pub fn start(&self) {
        self.start_with(Vec::new());
    }

    /// Start, then replay messages the host stored from a previous
    /// transport session, in their original arrival order.
    pub fn start_with(&self, stored: Vec<Envelope>) {
        let _ = self.cmd_tx.send(Command::Start { stored });
    }

    /// Tear the connection down: tell the peer, end the machine, notify
    /// the host. Idempotent; safe from any state. A stopped machine can
    /// be revived with [`Connection::start`] (which replays as a
    /// reconnect); the task itself lives until every handle is dropped.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop);
    }

    /// Encrypt an application payload under the session key and send it.
    /// Dropped with a warning if the session key is not established.
    pub fn send(&self, payload: Vec<u8>) {
        let _ = self.cmd_tx.send(Command::Send { payload });
    }

    /// Feed one inbound envelope from the transport.
    pub fn deliver(&self, envelope: Envelope) {
        let _ = self.cmd_tx.send(Command::Deliver { envelope });
    }
}

/// The task side: owns the machine and every piece of mutable state.
pub(crate) struct ConnectionTask<T: Team> {
    pub(crate) ctx: ConnectionContext<T>,
    pub(crate) phase: Phase,
    pub(crate) config: ConnectionConfig,
    pub(crate) outbound: mpsc::UnboundedSender<Envelope>,
    pub(crate) events: mpsc::UnboundedSender<ConnectionEvent<T>>,
    pub(crate) next_index: u64,
    pub(crate) buffer: DeliveryBuffer,
    pub(crate) deadline: Option<Instant>,
    pub(crate) started: bool,
    /// Envelopes that arrived before `start()`; replayed once the machine
    /// is running.
    pub(crate) pending_start: Vec<Envelope>,
}

impl<T: Team> ConnectionTask<T> {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let mut team_updates: Option<broadcast::Receiver<Hash>> = None;
        let mut updates_closed = false;
        loop {
            // Subscribe to replica changes as soon as a team exists (for
            // an invitee, that is after the join).
            if team_updates.is_none() && !updates_closed {
                if let Some(team) = &self.ctx.team {
                    team_updates = Some(team.lock().updates());
                }
            }
            let deadline = self.deadline;
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None => break,
                    Some(Command::Start { stored }) => self.on_start(stored),
                    Some(Command::Stop) => self.on_stop(),
                    Some(Command::Send { payload }) => self.on_send(payload),
                    Some(Command::Deliver { envelope }) => self.on_deliver(envelope),
                },
                head = next_update(&mut team_updates) => match head {
                    Some(head) => self.on_input(Message::LocalUpdate { head }),
                    None => {
                        team_updates = None;
                        updates_closed = true;
                    }
                },
                _ = sleep_until(deadline), if deadline.is_some() && self.phase.is_running() => {
                    self.fail(AuthError::Timeout);
                }
            }
        }
        tracing::debug!(peer = %self.peer_name(), "connection task ended");
    }

    // ── Command handlers ───────────────────────────────────────────

    fn on_start(&mut self, stored: Vec<Envelope>) {
        if !self.started {
            self.started = true;
            self.enter_phase(Phase::Starting);
            self.send_message(Message::Ready);
        } else {
            self.on_input(Message::Reconnect);
        }
        // Host-stored messages from the previous transport session come
        // first, then anything that raced in before start().
        let early = std::mem::take(&mut self.pending_start);
        for envelope in stored.into_iter().chain(early) {
            self.on_deliver(envelope);
        }
    }

    fn on_stop(&mut self) {
        if self.phase.is_running() {
            self.send_message(Message::Disconnect);
            self.local_disconnect("stopped");
        } else if self.phase == Phase::Idle {
            self.phase = Phase::Disconnected;
        }
    }

    fn on_send(&mut self, payload: Vec<u8>) {
        match self.ctx.session_key {
            Some(key) => {
                let sealed = crate::session::encrypt(&key, &payload);
                self.send_message(Message::EncryptedMessage { payload: sealed });
            }
            None => {
                tracing::warn!(
                    peer = %self.peer_name(),
                    "send() before the session key is established; payload dropped"
                );
            }
        }
    }

    fn on_deliver(&mut self, envelope: Envelope) {
        if !self.started {
            self.pending_start.push(envelope);
            return;
        }
        if self.phase.is_terminal() {
            tracing::trace!(index = envelope.index, "dropping delivery, machine not accepting");
            return;
        }
        for message in self.buffer.push(envelope) {
            if self.phase.is_terminal() {
                break;
            }
            self.on_input(message);
        }
    }

    // ── Machine input ──────────────────────────────────────────────

    pub(crate) fn on_input(&mut self, message: Message) {
        if message == Message::Reconnect {
            self.on_reconnect();
            return;
        }
        if !self.phase.is_running() {
            tracing::trace!(kind = message.kind(), "ignoring input in terminal state");
            return;
        }
        tracing::trace!(peer = %self.peer_name(), kind = message.kind(), "⇠");
        let result = match message {
            Message::Error { message, details } => {
                self.on_peer_error(message, details);
                Ok(())
            }
            Message::Disconnect => {
                self.local_disconnect("peer disconnected");
                Ok(())
            }
            other => match self.phase {
                Phase::Starting => self.on_starting_message(other),
                Phase::Handshake(_) => self.on_handshake_message(other),
                Phase::Synchronizing => self.on_sync_message(other),
                Phase::Negotiating => self.on_negotiating_message(other),
                Phase::Connected => self.on_connected_message(other),
                Phase::Idle | Phase::Disconnected | Phase::Failed => Ok(()),
            },
        };
        if let Err(err) = result {
            self.fail(err);
        }
    }

    fn on_starting_message(&mut self, message: Message) -> Result<(), AuthError> {
        match message {
            Message::Ready => self.begin_handshake(),
            other => {
                tracing::debug!(kind = other.kind(), "unexpected message while starting");
                Ok(())
            }
        }
    }

    fn on_reconnect(&mut self) {
        match self.phase {
            Phase::Disconnected => {
                tracing::debug!(peer = %self.peer_name(), "reconnecting");
                self.ctx.reset_for_reconnect();
                self.enter_phase(Phase::Starting);
                self.send_message(Message::Ready);
            }
            Phase::Failed => {
                tracing::warn!("cannot reconnect a failed connection; open a new one");
            }
            _ => tracing::debug!("start() while already running; ignored"),
        }
    }

    fn on_peer_error(&mut self, message: String, details: Option<serde_json::Value>) {
        tracing::warn!(peer = %self.peer_name(), error = %message, "peer reported an error");
        let reason = AuthError::PeerError { message: message.clone() }.to_string();
        self.ctx.error = Some(ErrorPayload { message, details });
        self.enter_phase(Phase::Failed);
        self.emit(ConnectionEvent::Disconnected { reason });
    }

    // ── Shared plumbing ────────────────────────────────────────────

    pub(crate) fn emit(&self, event: ConnectionEvent<T>) {
        let _ = self.events.send(event);
    }

    fn emit_change(&self) {
        self.emit(ConnectionEvent::Change { summary: self.phase.summary() });
    }

    /// Serialize one outbound message, stamping the next index.
    pub(crate) fn send_message(&mut self, message: Message) {
        debug_assert!(!message.is_local(), "local message kinds never go outbound");
        tracing::trace!(peer = %self.peer_name(), kind = message.kind(), index = self.next_index, "⇢");
        let envelope = Envelope::new(self.next_index, message);
        self.next_index += 1;
        if self.outbound.send(envelope).is_err() {
            tracing::debug!("outbound channel closed");
        }
    }

    /// Move to a new top-level phase: reset the phase deadline and notify
    /// observers.
    pub(crate) fn enter_phase(&mut self, phase: Phase) {
        tracing::debug!(peer = %self.peer_name(), state = %phase.summary(), "state change");
        self.phase = phase;
        let now = Instant::now();
        self.deadline = match phase {
            Phase::Starting | Phase::Handshake(_) => Some(now + self.config.handshake_timeout),
            Phase::Synchronizing | Phase::Negotiating => Some(now + self.config.sync_timeout),
            Phase::Idle | Phase::Connected | Phase::Disconnected | Phase::Failed => None,
        };
        self.emit_change();
    }

    /// Update handshake sub-states without touching the phase deadline.
    pub(crate) fn update_handshake(&mut self, handshake: Handshake) {
        self.phase = Phase::Handshake(handshake);
        self.emit_change();
    }

    /// Terminal failure: record the error, tell the peer, notify the host.
    pub(crate) fn fail(&mut self, err: AuthError) {
        if self.phase.is_terminal() {
            return;
        }
        tracing::warn!(peer = %self.peer_name(), error = %err, "connection failed");
        let payload = err.to_payload();
        self.send_message(Message::error(&payload));
        self.ctx.error = Some(payload);
        self.enter_phase(Phase::Failed);
        self.emit(ConnectionEvent::Disconnected { reason: err.to_string() });
    }

    /// Clean termination (local stop or peer DISCONNECT).
    pub(crate) fn local_disconnect(&mut self, reason: &str) {
        if self.phase.is_terminal() {
            return;
        }
        tracing::debug!(peer = %self.peer_name(), reason, "disconnected");
        self.enter_phase(Phase::Disconnected);
        self.emit(ConnectionEvent::Disconnected { reason: reason.to_string() });
    }

    /// Best available name for the peer, for log lines.
    pub(crate) fn peer_name(&self) -> String {
        if let Some(peer) = &self.ctx.peer {
            return peer.user_name.clone();
        }
        if let Some(claim) = &self.ctx.their_identity_claim {
            return claim.name.clone();
        }
        if let Some(proof) = &self.ctx.their_proof {
            return proof.invitee.name.clone();
        }
        "?".into()
    }

    /// The user name the peer authenticated as.
    pub(crate) fn peer_user_name(&self) -> Result<String, AuthError> {
        self.ctx
            .their_identity_claim
            .as_ref()
            .map(|claim| claim.user_name().to_string())
            .ok_or(AuthError::Chain { reason: "peer identity claim missing".into() })
    }

    /// The shared team replica, which must exist past the handshake.
    pub(crate) fn team(&self) -> Result<TeamHandle<T>, AuthError> {
        self.ctx
            .team
            .clone()
            .ok_or(AuthError::Chain { reason: "no team replica".into() })
    }

    /// The local user identity, which must exist past the handshake.
    pub(crate) fn user(&self) -> Result<UserInfo, AuthError> {
        self.ctx
            .user
            .clone()
            .ok_or(AuthError::Chain { reason: "no local user identity".into() })
    }
}

async fn next_update(rx: &mut Option<broadcast::Receiver<Hash>>) -> Option<Hash> {
    match rx {
        Some(rx) => loop {
            match rx.recv().await {
                Ok(head) => return Some(head),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "lagged behind team updates");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        },
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
