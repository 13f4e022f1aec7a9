//! [`MemTeam`]: an in-memory reference implementation of the
//! [`cohort_auth::team::Team`] seam over the signed chain.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast;

use cohort_auth::challenge::{self, IdentityChallenge};
use cohort_auth::crypto::{self, Keyset};
use cohort_auth::error::AuthError;
use cohort_auth::invitation::{self, ProofOfInvitation};
use cohort_auth::team::{
    ChainSummary, DeviceInfo, DeviceRecord, Hash, IdentityClaim, IdentityKind, IdentityLookup,
    Invitee, Link, Member, Team, TeamHandle, UserInfo,
};

use crate::chain::{Chain, LinkBody, SignedLink, TeamState};

fn chain_err(reason: impl Into<String>) -> AuthError {
    AuthError::Chain { reason: reason.into() }
}

/// An in-memory team replica: the signed chain plus its folded state and
/// the local device that authors new links.
pub struct MemTeam {
    chain: Chain,
    state: TeamState,
    device: DeviceInfo,
    updates: broadcast::Sender<Hash>,
}

impl MemTeam {
    /// Found a team: the genesis link names the founder as its first
    /// (admin) member.
    pub fn create(
        team_name: &str,
        founder: &UserInfo,
        device: &DeviceInfo,
    ) -> Result<Self, AuthError> {
        let member = Member {
            user_name: founder.user_name.clone(),
            keys: founder.keys.public(),
            admin: true,
            devices: vec![device.record()],
        };
        let chain = Chain::genesis(team_name, member, device)?;
        let state = chain.fold()?;
        Ok(Self {
            chain,
            state,
            device: device.clone(),
            updates: broadcast::channel(64).0,
        })
    }

    /// Wrap in the shared handle the connection driver expects.
    pub fn into_handle(self) -> TeamHandle<Self> {
        Arc::new(parking_lot::Mutex::new(self))
    }

    fn commit(&mut self, body: LinkBody) -> Result<Hash, AuthError> {
        let head = self.chain.append(body, &self.device)?;
        self.state = self.chain.fold()?;
        let _ = self.updates.send(head.clone());
        Ok(head)
    }

    /// Directly enroll a member whose keys are already known (out-of-band
    /// bootstrap, as opposed to the invitation flow).
    pub fn add_member(&mut self, member: Member) -> Result<(), AuthError> {
        self.commit(LinkBody::AddMember { member })?;
        Ok(())
    }

    pub fn add_device(&mut self, user_name: &str, device: DeviceRecord) -> Result<(), AuthError> {
        self.commit(LinkBody::AddDevice { user_name: user_name.to_string(), device })?;
        Ok(())
    }

    /// Invite a new user. Returns the invitation id filed on the chain.
    pub fn invite_member(&mut self, user_name: &str, seed: &str) -> Result<String, AuthError> {
        let id = invitation::invitation_id(seed);
        let starter_keys = invitation::derive_starter_keys(seed).public();
        self.commit(LinkBody::Invite {
            id: id.clone(),
            invitee: Invitee { kind: IdentityKind::Member, name: user_name.to_string() },
            starter_keys,
            lockbox: None,
        })?;
        Ok(id)
    }

    /// Invite a new device for `user`. The user's secret keys travel in a
    /// lockbox sealed to the starter keys, so the joining device can
    /// recover its user identity from the chain alone.
    pub fn invite_device(&mut self, seed: &str, user: &UserInfo) -> Result<String, AuthError> {
        let id = invitation::invitation_id(seed);
        let starter = invitation::derive_starter_keys(seed);
        let lockbox = crypto::seal(
            &user.keys,
            &starter.public().encryption,
            &user.keys.secret_bytes(),
        )?;
        self.commit(LinkBody::Invite {
            id: id.clone(),
            invitee: Invitee { kind: IdentityKind::Device, name: user.user_name.clone() },
            starter_keys: starter.public(),
            lockbox: Some(lockbox),
        })?;
        Ok(id)
    }

    pub fn revoke_invitation(&mut self, id: &str) -> Result<(), AuthError> {
        self.commit(LinkBody::RevokeInvitation { id: id.to_string() })?;
        Ok(())
    }

    pub fn remove_member(&mut self, user_name: &str) -> Result<(), AuthError> {
        self.commit(LinkBody::RemoveMember { user_name: user_name.to_string() })?;
        Ok(())
    }

    pub fn remove_device(&mut self, user_name: &str, device_name: &str) -> Result<(), AuthError> {
        self.commit(LinkBody::RemoveDevice {
            user_name: user_name.to_string(),
            device_name: device_name.to_string(),
        })?;
        Ok(())
    }

    /// All live members.
    pub fn members(&self) -> Vec<Member> {
        self.state
            .members
            .keys()
            .filter_map(|name| self.state.member_record(name))
            .collect()
    }
}

impl Team for MemTeam {
    fn load(source: &serde_json::Value, device: &DeviceInfo) -> Result<Self, AuthError> {
        let chain = Chain::load(source)?;
        let state = chain.fold()?;
        Ok(Self {
            chain,
            state,
            device: device.clone(),
            updates: broadcast::channel(64).0,
        })
    }

    fn save(&self) -> serde_json::Value {
        self.chain.save()
    }

    fn team_name(&self) -> &str {
        &self.state.team_name
    }

    fn root(&self) -> Hash {
        self.chain.root()
    }

    fn head(&self) -> Hash {
        self.chain.head()
    }

    fn link_hashes(&self) -> Vec<Hash> {
        self.chain.hashes()
    }

    fn missing_links(&self, theirs: &ChainSummary) -> Vec<Link> {
        if theirs.root != self.root() {
            return Vec::new();
        }
        let known: HashSet<&str> = theirs.hashes.iter().map(String::as_str).collect();
        self.chain
            .links_missing_from(&known)
            .into_iter()
            .map(|link| serde_json::to_value(link).expect("links are serializable"))
            .collect()
    }

    fn receive_missing_links(&mut self, head: &Hash, links: &[Link]) -> Result<(), AuthError> {
        let parsed: Vec<SignedLink> = links
            .iter()
            .map(|value| serde_json::from_value(value.clone()))
            .collect::<Result<_, _>>()
            .map_err(|e| chain_err(format!("unreadable link: {e}")))?;
        self.chain.merge(parsed)?;
        self.state = self.chain.fold()?;
        if !self.chain.hashes().contains(head) {
            // The peer advertised a head it didn't ship; our merge is
            // still internally consistent, so note it and move on.
            tracing::debug!(%head, "peer head not among received links");
        }
        let _ = self.updates.send(self.chain.head());
        Ok(())
    }

    fn validate_invitation(&self, proof: &ProofOfInvitation) -> Result<(), AuthError> {
        let record = self.state.invitations.get(&proof.id).ok_or_else(|| {
            AuthError::InvitationInvalid { reason: "no invitation found for this proof".into() }
        })?;
        if record.revoked {
            return Err(AuthError::InvitationRevoked);
        }
        let name_matches = record.invitee.kind == proof.invitee.kind
            && match record.invitee.kind {
                IdentityKind::Member => proof.invitee.name == record.invitee.name,
                // Device proofs name `user::device`; the invitation pins
                // the user half.
                IdentityKind::Device => proof
                    .invitee
                    .name
                    .split_once("::")
                    .is_some_and(|(user, _)| user == record.invitee.name),
            };
        if !name_matches {
            return Err(AuthError::InvitationInvalid {
                reason: format!(
                    "User names don't match (invitation was issued to '{}')",
                    record.invitee.name
                ),
            });
        }
        if !invitation::verify_proof_signature(proof, &record.starter_keys.signing) {
            return Err(AuthError::InvitationInvalid {
                reason: "proof signature is not valid".into(),
            });
        }
        Ok(())
    }

    fn has_invitation(&self, id: &str) -> bool {
        self.state.invitations.contains_key(id)
    }

    fn admit(&mut self, proof: &ProofOfInvitation) -> Result<(), AuthError> {
        self.validate_invitation(proof)?;
        if proof.invitee.kind == IdentityKind::Member
            && self.state.members.contains_key(&proof.invitee.name)
        {
            return Err(AuthError::InvitationInvalid {
                reason: "invitation was already used".into(),
            });
        }
        self.commit(LinkBody::Admit {
            id: proof.id.clone(),
            invitee: proof.invitee.clone(),
            member_keys: proof.keys.clone(),
            device: proof.device.clone(),
        })?;
        Ok(())
    }

    fn join(
        &mut self,
        proof: &ProofOfInvitation,
        seed: &str,
    ) -> Result<Option<UserInfo>, AuthError> {
        let record = self
            .state
            .invitations
            .get(&proof.id)
            .ok_or(AuthError::WrongTeam)?;
        match record.invitee.kind {
            IdentityKind::Member => {
                if self.state.live_member(&record.invitee.name).is_none() {
                    return Err(chain_err("chain does not record our admission"));
                }
                Ok(None)
            }
            IdentityKind::Device => {
                let user_name = record.invitee.name.clone();
                let lockbox = record
                    .lockbox
                    .clone()
                    .ok_or_else(|| chain_err("device invitation carries no lockbox"))?;
                let member = self
                    .state
                    .live_member(&user_name)
                    .ok_or_else(|| chain_err("lockbox owner is not a live member"))?;
                let starter = invitation::derive_starter_keys(seed);
                let secret = crypto::open(&starter, &member.keys.encryption, &lockbox)
                    .map_err(|_| AuthError::DecryptionFailed)?;
                let keys = Keyset::from_secret_bytes(&secret)?;
                Ok(Some(UserInfo { user_name, keys }))
            }
        }
    }

    fn lookup_identity(&self, claim: &IdentityClaim) -> IdentityLookup {
        let Some((user, device)) = claim.name.split_once("::") else {
            return IdentityLookup::DeviceUnknown;
        };
        match self.state.members.get(user) {
            None => IdentityLookup::MemberUnknown,
            Some(member) if member.removed => IdentityLookup::MemberRemoved,
            Some(member) => match member.devices.get(device) {
                None => IdentityLookup::DeviceUnknown,
                Some(d) if d.removed => IdentityLookup::DeviceRemoved,
                Some(_) => IdentityLookup::ValidDevice,
            },
        }
    }

    fn verify_identity_proof(&self, challenge: &IdentityChallenge, signature: &str) -> bool {
        if self.lookup_identity(&challenge.claim) != IdentityLookup::ValidDevice {
            return false;
        }
        let Some((user, device)) = challenge.claim.name.split_once("::") else {
            return false;
        };
        let signing_key = &self.state.members[user].devices[device].keys.signing;
        challenge::verify(challenge, signing_key, signature)
    }

    fn has_member(&self, user_name: &str) -> bool {
        self.state.live_member(user_name).is_some()
    }

    fn member(&self, user_name: &str) -> Option<Member> {
        self.state.member_record(user_name)
    }

    fn updates(&self) -> broadcast::Receiver<Hash> {
        self.updates.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn founded() -> (UserInfo, DeviceInfo, MemTeam) {
        let alice = UserInfo::generate("alice");
        let device = DeviceInfo::generate("alice", "laptop");
        let team = MemTeam::create("devteam", &alice, &device).unwrap();
        (alice, device, team)
    }

    fn member_proof(seed: &str, user_name: &str) -> (ProofOfInvitation, UserInfo, DeviceInfo) {
        let user = UserInfo::generate(user_name);
        let device = DeviceInfo::generate(user_name, "phone");
        let proof = invitation::generate_proof(
            seed,
            Invitee { kind: IdentityKind::Member, name: user_name.to_string() },
            Some(user.keys.public()),
            device.record(),
        );
        (proof, user, device)
    }

    #[test]
    fn invite_validate_admit() {
        let (_, _, mut team) = founded();
        team.invite_member("bob", "passw0rd").unwrap();
        let (proof, _, _) = member_proof("passw0rd", "bob");
        team.validate_invitation(&proof).unwrap();
        team.admit(&proof).unwrap();
        assert!(team.has_member("bob"));
        let bob = team.member("bob").unwrap();
        assert!(!bob.admin);
        assert_eq!(bob.devices.len(), 1);
    }

    #[test]
    fn forged_invitee_name_is_rejected_with_message() {
        let (_, _, mut team) = founded();
        team.invite_member("bob", "passw0rd").unwrap();
        // Eve derives a proof from Bob's seed but names herself.
        let (proof, _, _) = member_proof("passw0rd", "eve");
        let err = team.validate_invitation(&proof).unwrap_err();
        assert!(err.to_string().contains("User names don't match"), "{err}");
    }

    #[test]
    fn revoked_invitation_is_rejected() {
        let (_, _, mut team) = founded();
        let id = team.invite_member("charlie", "s3cret").unwrap();
        team.revoke_invitation(&id).unwrap();
        let (proof, _, _) = member_proof("s3cret", "charlie");
        assert_eq!(team.admit(&proof), Err(AuthError::InvitationRevoked));
    }

    #[test]
    fn unknown_proof_is_rejected() {
        let (_, _, team) = founded();
        let (proof, _, _) = member_proof("never issued", "bob");
        assert!(matches!(
            team.validate_invitation(&proof),
            Err(AuthError::InvitationInvalid { .. })
        ));
    }

    #[test]
    fn reused_invitation_is_rejected() {
        let (_, _, mut team) = founded();
        team.invite_member("bob", "passw0rd").unwrap();
        let (proof, _, _) = member_proof("passw0rd", "bob");
        team.admit(&proof).unwrap();
        assert!(matches!(
            team.admit(&proof),
            Err(AuthError::InvitationInvalid { .. })
        ));
    }

    #[test]
    fn seed_normalization_matches_across_sides() {
        let (_, _, mut team) = founded();
        team.invite_member("bob", "abc def ghi").unwrap();
        let (proof, _, _) = member_proof("abc+def+ghi", "bob");
        team.validate_invitation(&proof).unwrap();
    }

    #[test]
    fn save_load_preserves_membership_view() {
        let (_, _, mut team) = founded();
        team.invite_member("bob", "passw0rd").unwrap();
        let (proof, _, _) = member_proof("passw0rd", "bob");
        team.admit(&proof).unwrap();

        let restored =
            MemTeam::load(&team.save(), &DeviceInfo::generate("bob", "phone")).unwrap();
        assert_eq!(restored.head(), team.head());
        assert!(restored.has_member("alice"));
        assert!(restored.has_member("bob"));
        assert!(restored.member("alice").unwrap().admin);
        assert!(!restored.member("bob").unwrap().admin);
        assert_eq!(restored.members().len(), team.members().len());
    }

    #[test]
    fn lookup_identity_outcomes() {
        let (_, _, mut team) = founded();
        assert_eq!(
            team.lookup_identity(&IdentityClaim::device("alice", "laptop")),
            IdentityLookup::ValidDevice
        );
        assert_eq!(
            team.lookup_identity(&IdentityClaim::device("alice", "tablet")),
            IdentityLookup::DeviceUnknown
        );
        assert_eq!(
            team.lookup_identity(&IdentityClaim::device("bob", "phone")),
            IdentityLookup::MemberUnknown
        );

        team.remove_device("alice", "laptop").unwrap();
        assert_eq!(
            team.lookup_identity(&IdentityClaim::device("alice", "laptop")),
            IdentityLookup::DeviceRemoved
        );
    }

    #[test]
    fn removed_member_lookup() {
        let (_, _, mut team) = founded();
        team.invite_member("bob", "passw0rd").unwrap();
        let (proof, _, _) = member_proof("passw0rd", "bob");
        team.admit(&proof).unwrap();
        team.remove_member("bob").unwrap();
        assert!(!team.has_member("bob"));
        assert_eq!(
            team.lookup_identity(&IdentityClaim::device("bob", "phone")),
            IdentityLookup::MemberRemoved
        );
    }

    #[test]
    fn identity_proof_verification_is_chain_bound() {
        let (_, alice_device, team) = founded();
        let claim = IdentityClaim::device("alice", "laptop");
        let challenge = challenge::issue(claim.clone());
        let sig = challenge::prove(&challenge, &alice_device.keys);
        assert!(team.verify_identity_proof(&challenge, &sig));

        // A signature from a key that isn't on the chain fails.
        let imposter = DeviceInfo::generate("alice", "laptop");
        let sig = challenge::prove(&challenge, &imposter.keys);
        assert!(!team.verify_identity_proof(&challenge, &sig));
    }

    #[test]
    fn device_join_recovers_user_keys_from_lockbox() {
        let (alice, _, mut team) = founded();
        let seed = "tablet seed";
        team.invite_device(seed, &alice).unwrap();

        let new_device = DeviceInfo::generate("alice", "tablet");
        let proof = invitation::generate_proof(
            seed,
            Invitee { kind: IdentityKind::Device, name: new_device.device_id() },
            None,
            new_device.record(),
        );
        team.validate_invitation(&proof).unwrap();
        team.admit(&proof).unwrap();

        // The joining device rebuilds the team and opens the lockbox.
        let mut replica = MemTeam::load(&team.save(), &new_device).unwrap();
        let recovered = replica.join(&proof, seed).unwrap().unwrap();
        assert_eq!(recovered.user_name, "alice");
        assert_eq!(recovered.keys.public(), alice.keys.public());
    }

    #[test]
    fn missing_links_roundtrip_between_replicas() {
        let (_, _, mut team) = founded();
        let stale = MemTeam::load(&team.save(), &DeviceInfo::generate("x", "y")).unwrap();
        team.invite_member("bob", "passw0rd").unwrap();

        let delta = team.missing_links(&stale.summary());
        assert_eq!(delta.len(), 1);

        let mut stale = stale;
        stale.receive_missing_links(&team.head(), &delta).unwrap();
        assert_eq!(stale.head(), team.head());
        assert!(stale.has_invitation(&invitation::invitation_id("passw0rd")));
    }

    #[test]
    fn updates_fire_on_mutation() {
        let (_, _, mut team) = founded();
        let mut rx = team.updates();
        team.invite_member("bob", "passw0rd").unwrap();
        let head = rx.try_recv().unwrap();
        assert_eq!(head, team.head());
    }
}
