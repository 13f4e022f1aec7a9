//! Handshake handlers: HELLO exchange, invitation proof resolution, and
//! the mutual identity challenge.
//!
//! Three things have to settle before synchronization starts, and they
//! overlap on the wire:
//!
//! - if we hold an invitation, the peer must accept it and hand us the
//!   chain;
//! - the peer challenges the identity we claimed, and must accept our
//!   proof;
//! - we challenge the identity the peer claimed, and must accept its
//!   proof.
//!
//! An inviter admits the newcomer *before* challenging it, so the
//! newcomer's device key is on the chain by the time its proof is
//! checked. A newcomer can't challenge anyone until it has a chain, so
//! its verifying sub-state parks at `AwaitingTeam` until the join
//! completes.

use std::sync::Arc;

use crate::challenge::{self, IdentityChallenge};
use crate::error::AuthError;
use crate::event::ConnectionEvent;
use crate::invitation::{self, ProofOfInvitation};
use crate::message::Message;
use crate::team::{IdentityClaim, IdentityKind, Team, TeamHandle};

use super::machine::{ClaimingStatus, Handshake, InvitationStatus, Phase, VerifyingStatus};
use super::{ConnectionContext, ConnectionTask};

fn build_proof<T: Team>(ctx: &ConnectionContext<T>) -> Option<ProofOfInvitation> {
    let invitee = ctx.invitee.clone()?;
    let seed = ctx.invitation_seed.as_deref()?;
    let keys = ctx.new_user.as_ref().map(|user| user.keys.public());
    Some(invitation::generate_proof(seed, invitee, keys, ctx.device.record()))
}

impl<T: Team> ConnectionTask<T> {
    /// The peer is ready: introduce ourselves and open the handshake.
    pub(super) fn begin_handshake(&mut self) -> Result<(), AuthError> {
        self.send_hello();
        self.enter_phase(Phase::Handshake(Handshake::begin(self.ctx.i_have_invitation())));
        Ok(())
    }

    fn send_hello(&mut self) {
        let identity_claim =
            IdentityClaim::device(&self.ctx.device.user_name, &self.ctx.device.device_name);
        // The proof goes out at most once; once we have a team it is
        // never sent again.
        let proof_of_invitation = if self.ctx.i_have_invitation() && !self.ctx.proof_sent {
            if self.ctx.my_proof.is_none() {
                self.ctx.my_proof = build_proof(&self.ctx);
            }
            self.ctx.proof_sent = self.ctx.my_proof.is_some();
            self.ctx.my_proof.clone()
        } else {
            None
        };
        self.send_message(Message::Hello { identity_claim, proof_of_invitation });
    }

    pub(super) fn on_handshake_message(&mut self, message: Message) -> Result<(), AuthError> {
        let Phase::Handshake(handshake) = self.phase else {
            return Ok(());
        };
        match message {
            Message::Hello { identity_claim, proof_of_invitation } => {
                self.handle_hello(handshake, identity_claim, proof_of_invitation)
            }
            Message::AcceptInvitation { chain } => {
                self.handle_accept_invitation(handshake, chain)
            }
            Message::ChallengeIdentity { challenge } => {
                self.handle_challenge(handshake, challenge)
            }
            Message::ProveIdentity { challenge, proof } => {
                self.handle_prove(handshake, challenge, proof)
            }
            Message::AcceptIdentity => self.handle_accept_identity(handshake),
            // A duplicate greeting is harmless.
            Message::Ready => Ok(()),
            other => {
                tracing::debug!(kind = other.kind(), "unexpected message during handshake");
                Ok(())
            }
        }
    }

    fn handle_hello(
        &mut self,
        mut handshake: Handshake,
        claim: IdentityClaim,
        proof: Option<ProofOfInvitation>,
    ) -> Result<(), AuthError> {
        if handshake.verifying != VerifyingStatus::AwaitingHello {
            tracing::debug!("duplicate HELLO ignored");
            return Ok(());
        }
        self.ctx.their_identity_claim = Some(claim);
        self.ctx.they_have_invitation = proof.is_some();
        self.ctx.their_proof = proof;

        self.confirm_identity_exists()?;

        if self.ctx.they_have_invitation && self.ctx.team.is_none() {
            // Two strangers holding invitations can't admit each other.
            return Err(AuthError::NeitherIsMember);
        }

        if self.ctx.they_have_invitation {
            self.accept_invitation()?;
            handshake.verifying = self.challenge_peer()?;
        } else if self.ctx.team.is_some() {
            handshake.verifying = self.challenge_peer()?;
        } else {
            // We are the newcomer; the challenge waits for the chain.
            handshake.verifying = VerifyingStatus::AwaitingTeam;
        }
        self.update_handshake(handshake);
        self.check_handshake_complete()
    }

    /// When we have a team and the peer is not a newcomer, its claimed
    /// identity must resolve to a live device on the chain.
    fn confirm_identity_exists(&self) -> Result<(), AuthError> {
        if self.ctx.they_have_invitation {
            return Ok(());
        }
        let (Some(team), Some(claim)) = (&self.ctx.team, &self.ctx.their_identity_claim) else {
            return Ok(());
        };
        match team.lock().lookup_identity(claim).into_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Inviter side: check the newcomer's proof, put it on the chain, and
    /// send the whole chain back.
    fn accept_invitation(&mut self) -> Result<(), AuthError> {
        let proof = self
            .ctx
            .their_proof
            .clone()
            .ok_or(AuthError::Chain { reason: "proof of invitation missing".into() })?;
        let team = self.team()?;
        {
            let mut team = team.lock();
            team.validate_invitation(&proof)?;
            team.admit(&proof)?;
        }
        tracing::info!(peer = %self.peer_name(), "invitation accepted");
        let chain = team.lock().save();
        self.send_message(Message::AcceptInvitation { chain });
        Ok(())
    }

    /// Invitee side: rebuild the team from the received chain, make sure
    /// it is the team that actually invited us, and complete the join.
    fn handle_accept_invitation(
        &mut self,
        mut handshake: Handshake,
        chain: serde_json::Value,
    ) -> Result<(), AuthError> {
        if handshake.invitation != InvitationStatus::AwaitingAcceptance {
            tracing::debug!("unexpected ACCEPT_INVITATION ignored");
            return Ok(());
        }
        let proof = self
            .ctx
            .my_proof
            .clone()
            .ok_or(AuthError::Chain { reason: "no proof of invitation was sent".into() })?;
        let seed = self
            .ctx
            .invitation_seed
            .clone()
            .ok_or(AuthError::Chain { reason: "no invitation seed".into() })?;

        let mut team = T::load(&chain, &self.ctx.device)?;
        if !team.has_invitation(&proof.id) {
            // A rogue team could "accept" us to learn our keys; only a
            // chain carrying our invitation counts.
            return Err(AuthError::WrongTeam);
        }
        let recovered = team.join(&proof, &seed)?;
        let user = match recovered {
            Some(user) => user,
            None => self
                .ctx
                .new_user
                .take()
                .ok_or(AuthError::Chain { reason: "join produced no user identity".into() })?,
        };
        tracing::info!(user = %user.user_name, team = %team.team_name(), "joined team");
        self.ctx.user = Some(user);
        let handle: TeamHandle<T> = Arc::new(parking_lot::Mutex::new(team));
        self.ctx.team = Some(handle.clone());
        handshake.invitation = InvitationStatus::Done;
        self.emit(ConnectionEvent::Joined { team: handle });

        // Now that we have a chain, the inviter's claim can be checked
        // and challenged.
        self.confirm_identity_exists()?;
        if handshake.verifying == VerifyingStatus::AwaitingTeam {
            handshake.verifying = self.challenge_peer()?;
        }
        self.update_handshake(handshake);
        self.check_handshake_complete()
    }

    fn challenge_peer(&mut self) -> Result<VerifyingStatus, AuthError> {
        let claim = self
            .ctx
            .their_identity_claim
            .clone()
            .ok_or(AuthError::Chain { reason: "peer identity claim missing".into() })?;
        let challenge = challenge::issue(claim);
        self.ctx.challenge = Some(challenge.clone());
        self.send_message(Message::ChallengeIdentity { challenge });
        Ok(VerifyingStatus::AwaitingProof)
    }

    /// The peer challenged the identity we claimed: sign it.
    fn handle_challenge(
        &mut self,
        mut handshake: Handshake,
        challenge: IdentityChallenge,
    ) -> Result<(), AuthError> {
        if handshake.claiming != ClaimingStatus::AwaitingChallenge {
            tracing::debug!("unexpected CHALLENGE_IDENTITY ignored");
            return Ok(());
        }
        if challenge.claim.kind != IdentityKind::Device
            || challenge.claim.name != self.ctx.device.device_id()
        {
            // A challenge for somebody else's identity is not ours to
            // answer.
            return Err(AuthError::IdentityProofInvalid);
        }
        let proof = challenge::prove(&challenge, &self.ctx.device.keys);
        self.send_message(Message::ProveIdentity { challenge, proof });
        handshake.claiming = ClaimingStatus::AwaitingAcceptance;
        self.update_handshake(handshake);
        Ok(())
    }

    /// The peer answered our challenge: verify against the chain.
    fn handle_prove(
        &mut self,
        mut handshake: Handshake,
        challenge: IdentityChallenge,
        proof: String,
    ) -> Result<(), AuthError> {
        if handshake.verifying != VerifyingStatus::AwaitingProof {
            tracing::debug!("unexpected PROVE_IDENTITY ignored");
            return Ok(());
        }
        let issued = self.ctx.challenge.clone().ok_or(AuthError::IdentityProofInvalid)?;
        if issued != challenge {
            return Err(AuthError::IdentityProofInvalid);
        }
        let team = self.team()?;
        if !team.lock().verify_identity_proof(&challenge, &proof) {
            return Err(AuthError::IdentityProofInvalid);
        }
        self.send_message(Message::AcceptIdentity);
        let peer_name = challenge.claim.user_name().to_string();
        self.ctx.peer = team.lock().member(&peer_name);
        tracing::info!(peer = %peer_name, "peer identity verified");
        handshake.verifying = VerifyingStatus::Done;
        self.update_handshake(handshake);
        self.check_handshake_complete()
    }

    fn handle_accept_identity(&mut self, mut handshake: Handshake) -> Result<(), AuthError> {
        if handshake.claiming != ClaimingStatus::AwaitingAcceptance {
            tracing::debug!("unexpected ACCEPT_IDENTITY ignored");
            return Ok(());
        }
        handshake.claiming = ClaimingStatus::Done;
        self.update_handshake(handshake);
        self.check_handshake_complete()
    }

    fn check_handshake_complete(&mut self) -> Result<(), AuthError> {
        if let Phase::Handshake(handshake) = self.phase {
            if handshake.complete() {
                self.enter_sync()?;
            }
        }
        Ok(())
    }
}
