//! Connection state machine types.
//!
//! The handshake runs three concerns side by side (resolving an
//! invitation, proving our identity, verifying the peer's), so
//! [`Handshake`] is a struct of three independent sub-states rather than a
//! single ladder. The driver advances whichever sub-state an inbound
//! message belongs to and moves on to synchronization once all three are
//! settled.

/// Top-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Constructed but not started.
    Idle,
    /// Started; waiting for the peer's `READY`.
    Starting,
    /// Mutual authentication in progress.
    Handshake(Handshake),
    /// Trading chain links until both heads match.
    Synchronizing,
    /// Exchanging key-agreement seeds.
    Negotiating,
    /// Session key established; application traffic flows.
    Connected,
    /// Ended cleanly. Terminal for the machine, revivable via `start()`.
    Disconnected,
    /// Ended with an error. Permanently terminal.
    Failed,
}

impl Phase {
    /// No further protocol events are accepted in these states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Disconnected | Phase::Failed)
    }

    pub fn is_running(&self) -> bool {
        !matches!(self, Phase::Idle | Phase::Disconnected | Phase::Failed)
    }

    /// Human-readable description, carried on `change` events.
    pub fn summary(&self) -> String {
        match self {
            Phase::Idle => "idle".into(),
            Phase::Starting => "starting".into(),
            Phase::Handshake(h) => format!(
                "connecting (invitation: {}, claiming: {}, verifying: {})",
                h.invitation.label(),
                h.claiming.label(),
                h.verifying.label()
            ),
            Phase::Synchronizing => "synchronizing".into(),
            Phase::Negotiating => "negotiating".into(),
            Phase::Connected => "connected".into(),
            Phase::Disconnected => "disconnected".into(),
            Phase::Failed => "failed".into(),
        }
    }
}

/// The three orthogonal handshake sub-states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Our own invitation, if we are joining as a newcomer.
    pub invitation: InvitationStatus,
    /// Our identity being verified by the peer.
    pub claiming: ClaimingStatus,
    /// Us verifying the peer's identity.
    pub verifying: VerifyingStatus,
}

impl Handshake {
    /// Initial sub-states; `invited` is true when this side holds an
    /// unredeemed invitation.
    pub fn begin(invited: bool) -> Self {
        Self {
            invitation: if invited {
                InvitationStatus::AwaitingAcceptance
            } else {
                InvitationStatus::Inapplicable
            },
            claiming: ClaimingStatus::AwaitingChallenge,
            verifying: VerifyingStatus::AwaitingHello,
        }
    }

    /// All three concerns settled; ready to synchronize.
    pub fn complete(&self) -> bool {
        matches!(
            self.invitation,
            InvitationStatus::Inapplicable | InvitationStatus::Done
        ) && self.claiming == ClaimingStatus::Done
            && self.verifying == VerifyingStatus::Done
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationStatus {
    /// We are not joining by invitation.
    Inapplicable,
    /// Our proof went out with `HELLO`; waiting for `ACCEPT_INVITATION`.
    AwaitingAcceptance,
    /// We joined the team.
    Done,
}

impl InvitationStatus {
    fn label(&self) -> &'static str {
        match self {
            InvitationStatus::Inapplicable => "n/a",
            InvitationStatus::AwaitingAcceptance => "awaiting acceptance",
            InvitationStatus::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimingStatus {
    /// Waiting for the peer to challenge the claim we sent in `HELLO`.
    AwaitingChallenge,
    /// We answered the challenge; waiting for `ACCEPT_IDENTITY`.
    AwaitingAcceptance,
    /// The peer accepted our identity.
    Done,
}

impl ClaimingStatus {
    fn label(&self) -> &'static str {
        match self {
            ClaimingStatus::AwaitingChallenge => "awaiting challenge",
            ClaimingStatus::AwaitingAcceptance => "proving",
            ClaimingStatus::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyingStatus {
    /// No `HELLO` from the peer yet.
    AwaitingHello,
    /// We have the peer's claim but no team to check it against yet; the
    /// challenge goes out once our invitation resolves.
    AwaitingTeam,
    /// Challenge sent; waiting for `PROVE_IDENTITY`.
    AwaitingProof,
    /// We accepted the peer's identity.
    Done,
}

impl VerifyingStatus {
    fn label(&self) -> &'static str {
        match self {
            VerifyingStatus::AwaitingHello => "awaiting hello",
            VerifyingStatus::AwaitingTeam => "awaiting team",
            VerifyingStatus::AwaitingProof => "awaiting proof",
            VerifyingStatus::Done => "done",
        }
    }
}
