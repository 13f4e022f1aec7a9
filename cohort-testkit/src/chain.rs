//! A hash-linked log of signed membership operations.
//!
//! Every link carries its parent hash, its author (a device id) and an
//! Ed25519 signature over the canonical link payload. Replicas converge by
//! pooling links and re-linearizing them in a deterministic topological
//! order, so two replicas holding the same set of links always agree on
//! the head hash.

use std::collections::{BTreeMap, HashSet};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use cohort_auth::crypto::{self, PublicKeyset, Sealed};
use cohort_auth::error::AuthError;
use cohort_auth::team::{DeviceInfo, DeviceRecord, Hash, IdentityKind, Invitee, Member};

fn chain_err(reason: impl Into<String>) -> AuthError {
    AuthError::Chain { reason: reason.into() }
}

/// One membership operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkBody {
    /// Genesis: names the team and its founder.
    Root { team_name: String, founder: Member },
    AddMember { member: Member },
    AddDevice { user_name: String, device: DeviceRecord },
    /// An open invitation: the starter public key lets the team recognize
    /// the future proof. Device invitations carry the user's secret keys
    /// in a lockbox sealed to the starter encryption key.
    Invite {
        id: String,
        invitee: Invitee,
        starter_keys: PublicKeyset,
        #[serde(skip_serializing_if = "Option::is_none")]
        lockbox: Option<Sealed>,
    },
    RevokeInvitation { id: String },
    /// Redemption of an invitation: places the newcomer's real keys on
    /// the chain.
    Admit {
        id: String,
        invitee: Invitee,
        #[serde(skip_serializing_if = "Option::is_none")]
        member_keys: Option<PublicKeyset>,
        device: DeviceRecord,
    },
    RemoveMember { user_name: String },
    RemoveDevice { user_name: String, device_name: String },
}

/// A link as stored and shipped: body, parentage, authorship, signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedLink {
    pub body: LinkBody,
    pub prev: Option<Hash>,
    /// Device id (`user::device`) of the author.
    pub author: String,
    /// Author's signature over the canonical payload, base64url.
    pub signature: String,
}

impl SignedLink {
    fn payload(body: &LinkBody, prev: Option<&Hash>, author: &str) -> Vec<u8> {
        #[derive(Serialize)]
        struct Payload<'a> {
            body: &'a LinkBody,
            prev: Option<&'a Hash>,
            author: &'a str,
        }
        serde_json::to_vec(&Payload { body, prev, author })
            .expect("link payload is serializable")
    }

    /// Sign a new link as `author`.
    pub fn seal(body: LinkBody, prev: Option<Hash>, author: &DeviceInfo) -> Self {
        let author_id = author.device_id();
        let signature = author
            .keys
            .sign(&Self::payload(&body, prev.as_ref(), &author_id));
        Self { body, prev, author: author_id, signature }
    }

    /// The link's content hash.
    pub fn hash(&self) -> Hash {
        let payload = Self::payload(&self.body, self.prev.as_ref(), &self.author);
        B64.encode(Sha256::digest(&payload))
    }

    fn verify_signature(&self, signing_key: &str) -> bool {
        let payload = Self::payload(&self.body, self.prev.as_ref(), &self.author);
        crypto::verify(signing_key, &payload, &self.signature)
    }
}

// ── Derived state ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DeviceState {
    pub keys: PublicKeyset,
    pub removed: bool,
}

#[derive(Debug, Clone)]
pub struct MemberState {
    pub keys: PublicKeyset,
    pub admin: bool,
    pub devices: BTreeMap<String, DeviceState>,
    pub removed: bool,
}

#[derive(Debug, Clone)]
pub struct InvitationState {
    pub invitee: Invitee,
    pub starter_keys: PublicKeyset,
    pub lockbox: Option<Sealed>,
    pub revoked: bool,
}

/// Membership view folded from the chain.
#[derive(Debug, Clone)]
pub struct TeamState {
    pub team_name: String,
    pub members: BTreeMap<String, MemberState>,
    pub invitations: BTreeMap<String, InvitationState>,
}

impl TeamState {
    pub fn live_member(&self, user_name: &str) -> Option<&MemberState> {
        self.members.get(user_name).filter(|m| !m.removed)
    }

    pub fn member_record(&self, user_name: &str) -> Option<Member> {
        let member = self.live_member(user_name)?;
        Some(Member {
            user_name: user_name.to_string(),
            keys: member.keys.clone(),
            admin: member.admin,
            devices: member
                .devices
                .iter()
                .filter(|(_, d)| !d.removed)
                .map(|(name, d)| DeviceRecord {
                    device_name: name.clone(),
                    keys: d.keys.clone(),
                })
                .collect(),
        })
    }
}

// ── The chain ──────────────────────────────────────────────────────

/// An append-only log of [`SignedLink`]s in canonical order.
#[derive(Debug, Clone)]
pub struct Chain {
    links: Vec<SignedLink>,
    hashes: Vec<Hash>,
}

impl Chain {
    /// Start a chain from a genesis link.
    pub fn genesis(team_name: &str, founder: Member, device: &DeviceInfo) -> Result<Self, AuthError> {
        let root = SignedLink::seal(
            LinkBody::Root { team_name: team_name.to_string(), founder },
            None,
            device,
        );
        let chain = Self { hashes: vec![root.hash()], links: vec![root] };
        // Fold once so a bad genesis is caught at construction.
        chain.fold()?;
        Ok(chain)
    }

    pub fn root(&self) -> Hash {
        self.hashes[0].clone()
    }

    pub fn head(&self) -> Hash {
        self.hashes[self.hashes.len() - 1].clone()
    }

    pub fn hashes(&self) -> Vec<Hash> {
        self.hashes.clone()
    }

    pub fn links(&self) -> &[SignedLink] {
        &self.links
    }

    /// Links of ours that are absent from the peer's hash set.
    pub fn links_missing_from(&self, theirs: &HashSet<&str>) -> Vec<SignedLink> {
        self.links
            .iter()
            .zip(&self.hashes)
            .filter(|(_, hash)| !theirs.contains(hash.as_str()))
            .map(|(link, _)| link.clone())
            .collect()
    }

    /// Append one authored link. The candidate chain is folded before the
    /// append commits, so an invalid operation leaves the chain untouched.
    pub fn append(&mut self, body: LinkBody, author: &DeviceInfo) -> Result<Hash, AuthError> {
        let link = SignedLink::seal(body, Some(self.head()), author);
        let hash = link.hash();
        let mut candidate = self.clone();
        candidate.links.push(link);
        candidate.hashes.push(hash.clone());
        candidate.fold()?;
        *self = candidate;
        Ok(hash)
    }

    /// Pool foreign links with ours and re-linearize. Convergent: two
    /// replicas holding the same link set end with the same order and
    /// head.
    pub fn merge(&mut self, foreign: Vec<SignedLink>) -> Result<(), AuthError> {
        let mut pool: BTreeMap<Hash, SignedLink> = BTreeMap::new();
        for link in self.links.iter().cloned().chain(foreign) {
            pool.insert(link.hash(), link);
        }
        let merged = Self::linearize(pool)?;
        merged.fold()?;
        *self = merged;
        Ok(())
    }

    /// Rebuild from a serialized chain, verifying linkage and signatures.
    pub fn load(source: &serde_json::Value) -> Result<Self, AuthError> {
        let links: Vec<SignedLink> = serde_json::from_value(source.clone())
            .map_err(|e| chain_err(format!("unreadable chain: {e}")))?;
        if links.is_empty() {
            return Err(chain_err("chain is empty"));
        }
        let pool: BTreeMap<Hash, SignedLink> =
            links.into_iter().map(|l| (l.hash(), l)).collect();
        let chain = Self::linearize(pool)?;
        chain.fold()?;
        Ok(chain)
    }

    pub fn save(&self) -> serde_json::Value {
        serde_json::to_value(&self.links).expect("chain is serializable")
    }

    /// Deterministic topological order: repeatedly take the
    /// smallest-hashed link whose parent has already been placed.
    fn linearize(mut pool: BTreeMap<Hash, SignedLink>) -> Result<Self, AuthError> {
        let mut links = Vec::with_capacity(pool.len());
        let mut hashes = Vec::with_capacity(pool.len());
        let mut placed: HashSet<Hash> = HashSet::new();
        while !pool.is_empty() {
            let next = pool
                .iter()
                .find(|(_, link)| match &link.prev {
                    None => placed.is_empty(),
                    Some(prev) => placed.contains(prev),
                })
                .map(|(hash, _)| hash.clone());
            let Some(hash) = next else {
                return Err(chain_err("chain links do not connect to the root"));
            };
            let link = pool.remove(&hash).expect("key came from the pool");
            placed.insert(hash.clone());
            hashes.push(hash);
            links.push(link);
        }
        Ok(Self { links, hashes })
    }

    /// Fold the chain into a membership view, verifying authorship as we
    /// go.
    pub fn fold(&self) -> Result<TeamState, AuthError> {
        let mut iter = self.links.iter();
        let root = iter.next().ok_or_else(|| chain_err("chain is empty"))?;

        let LinkBody::Root { team_name, founder } = &root.body else {
            return Err(chain_err("first link is not a root"));
        };
        if root.prev.is_some() {
            return Err(chain_err("root link has a parent"));
        }
        let founder_device = founder
            .devices
            .iter()
            .find(|d| format!("{}::{}", founder.user_name, d.device_name) == root.author)
            .ok_or_else(|| chain_err("root not authored by a founder device"))?;
        if !root.verify_signature(&founder_device.keys.signing) {
            return Err(chain_err("root signature is not valid"));
        }

        let mut state = TeamState {
            team_name: team_name.clone(),
            members: BTreeMap::new(),
            invitations: BTreeMap::new(),
        };
        apply_member(&mut state, founder)?;

        for link in iter {
            let author_key = author_signing_key(&state, &link.author)
                .ok_or_else(|| chain_err(format!("unknown link author {}", link.author)))?;
            if !link.verify_signature(&author_key) {
                return Err(chain_err("link signature is not valid"));
            }
            apply_link(&mut state, &link.body)?;
        }
        Ok(state)
    }
}

fn author_signing_key(state: &TeamState, author: &str) -> Option<String> {
    let (user, device) = author.split_once("::")?;
    let member = state.live_member(user)?;
    let device = member.devices.get(device)?;
    if device.removed {
        return None;
    }
    Some(device.keys.signing.clone())
}

fn apply_member(state: &mut TeamState, member: &Member) -> Result<(), AuthError> {
    if state.members.contains_key(&member.user_name) {
        return Err(chain_err(format!("member {} already exists", member.user_name)));
    }
    state.members.insert(
        member.user_name.clone(),
        MemberState {
            keys: member.keys.clone(),
            admin: member.admin,
            devices: member
                .devices
                .iter()
                .map(|d| {
                    (d.device_name.clone(), DeviceState { keys: d.keys.clone(), removed: false })
                })
                .collect(),
            removed: false,
        },
    );
    Ok(())
}

fn apply_link(state: &mut TeamState, body: &LinkBody) -> Result<(), AuthError> {
    match body {
        LinkBody::Root { .. } => Err(chain_err("second root link")),
        LinkBody::AddMember { member } => apply_member(state, member),
        LinkBody::AddDevice { user_name, device } => {
            let member = state
                .members
                .get_mut(user_name)
                .filter(|m| !m.removed)
                .ok_or_else(|| chain_err(format!("no such member {user_name}")))?;
            if member.devices.contains_key(&device.device_name) {
                return Err(chain_err(format!("device {} already exists", device.device_name)));
            }
            member.devices.insert(
                device.device_name.clone(),
                DeviceState { keys: device.keys.clone(), removed: false },
            );
            Ok(())
        }
        LinkBody::Invite { id, invitee, starter_keys, lockbox } => {
            if state.invitations.contains_key(id) {
                return Err(chain_err(format!("invitation {id} already exists")));
            }
            state.invitations.insert(
                id.clone(),
                InvitationState {
                    invitee: invitee.clone(),
                    starter_keys: starter_keys.clone(),
                    lockbox: lockbox.clone(),
                    revoked: false,
                },
            );
            Ok(())
        }
        LinkBody::RevokeInvitation { id } => {
            let invitation = state
                .invitations
                .get_mut(id)
                .ok_or_else(|| chain_err(format!("no such invitation {id}")))?;
            invitation.revoked = true;
            Ok(())
        }
        LinkBody::Admit { id, invitee, member_keys, device } => {
            let invitation = state
                .invitations
                .get(id)
                .ok_or_else(|| chain_err(format!("no such invitation {id}")))?;
            if invitation.revoked {
                return Err(chain_err(format!("invitation {id} was revoked")));
            }
            match invitee.kind {
                IdentityKind::Member => {
                    let keys = member_keys
                        .clone()
                        .ok_or_else(|| chain_err("member admission without member keys"))?;
                    apply_member(
                        state,
                        &Member {
                            user_name: invitee.name.clone(),
                            keys,
                            admin: false,
                            devices: vec![device.clone()],
                        },
                    )
                }
                IdentityKind::Device => {
                    let user_name = invitee
                        .name
                        .split_once("::")
                        .map(|(user, _)| user)
                        .unwrap_or(invitee.name.as_str())
                        .to_string();
                    apply_link(
                        state,
                        &LinkBody::AddDevice { user_name, device: device.clone() },
                    )
                }
            }
        }
        LinkBody::RemoveMember { user_name } => {
            let member = state
                .members
                .get_mut(user_name)
                .ok_or_else(|| chain_err(format!("no such member {user_name}")))?;
            member.removed = true;
            Ok(())
        }
        LinkBody::RemoveDevice { user_name, device_name } => {
            let member = state
                .members
                .get_mut(user_name)
                .filter(|m| !m.removed)
                .ok_or_else(|| chain_err(format!("no such member {user_name}")))?;
            let device = member
                .devices
                .get_mut(device_name)
                .ok_or_else(|| chain_err(format!("no such device {device_name}")))?;
            device.removed = true;
            Ok(())
        }
    }
}
