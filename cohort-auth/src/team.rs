//! The team seam: membership types and the [`Team`] trait.
//!
//! The team itself, a hash-linked log of signed membership operations, is
//! an external collaborator. The protocol only consumes the operations
//! declared here; `cohort-testkit` ships a reference in-memory
//! implementation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::challenge::IdentityChallenge;
use crate::crypto::{Keyset, PublicKeyset};
use crate::error::AuthError;
use crate::invitation::ProofOfInvitation;

/// Hash of a chain link, base64url.
pub type Hash = String;

/// An opaque serialized chain link.
pub type Link = serde_json::Value;

/// Separator between user and device name in a device id.
pub const DEVICE_SEPARATOR: &str = "::";

/// What a chain head looks like from the outside: enough for the peer to
/// compute which links we are missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSummary {
    pub root: Hash,
    pub head: Hash,
    pub hashes: Vec<Hash>,
}

/// Whether a principal is a user or a single device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdentityKind {
    Member,
    Device,
}

/// An unauthenticated statement of who a peer claims to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaim {
    pub kind: IdentityKind,
    /// For device claims, `user::device`.
    pub name: String,
}

impl IdentityClaim {
    /// A device claim for `user::device`.
    pub fn device(user_name: &str, device_name: &str) -> Self {
        Self {
            kind: IdentityKind::Device,
            name: format!("{user_name}{DEVICE_SEPARATOR}{device_name}"),
        }
    }

    /// The user-name half of a device claim.
    pub fn user_name(&self) -> &str {
        match self.name.split_once(DEVICE_SEPARATOR) {
            Some((user, _)) => user,
            None => &self.name,
        }
    }
}

/// Who an invitation is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitee {
    pub kind: IdentityKind,
    /// Member invitations: the new user's name. Device invitations: the
    /// new device's id (`user::device`).
    pub name: String,
}

/// A device's public record as stored on the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_name: String,
    pub keys: PublicKeyset,
}

/// A member's public record as stored on the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub user_name: String,
    pub keys: PublicKeyset,
    #[serde(default)]
    pub admin: bool,
    pub devices: Vec<DeviceRecord>,
}

/// The local device identity, including secrets.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub user_name: String,
    pub device_name: String,
    pub keys: Keyset,
}

impl DeviceInfo {
    /// Generate a fresh device for a user.
    pub fn generate(user_name: &str, device_name: &str) -> Self {
        Self {
            user_name: user_name.to_string(),
            device_name: device_name.to_string(),
            keys: Keyset::generate(),
        }
    }

    /// Stable id `user::device`.
    pub fn device_id(&self) -> String {
        format!("{}{DEVICE_SEPARATOR}{}", self.user_name, self.device_name)
    }

    /// The public record placed on the chain.
    pub fn record(&self) -> DeviceRecord {
        DeviceRecord {
            device_name: self.device_name.clone(),
            keys: self.keys.public(),
        }
    }
}

/// The local user identity, including secrets.
#[derive(Debug, Clone)]
pub struct UserInfo {
    pub user_name: String,
    pub keys: Keyset,
}

impl UserInfo {
    /// Generate a fresh user identity.
    pub fn generate(user_name: &str) -> Self {
        Self {
            user_name: user_name.to_string(),
            keys: Keyset::generate(),
        }
    }
}

/// Outcome of resolving an identity claim against the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityLookup {
    ValidDevice,
    MemberUnknown,
    MemberRemoved,
    DeviceUnknown,
    DeviceRemoved,
}

impl IdentityLookup {
    /// Map a lookup outcome to the protocol error it implies, if any.
    pub fn into_error(self) -> Option<AuthError> {
        match self {
            IdentityLookup::ValidDevice => None,
            IdentityLookup::MemberUnknown => Some(AuthError::MemberUnknown),
            IdentityLookup::MemberRemoved => Some(AuthError::MemberRemoved),
            IdentityLookup::DeviceUnknown => Some(AuthError::DeviceUnknown),
            IdentityLookup::DeviceRemoved => Some(AuthError::DeviceRemoved),
        }
    }
}

/// Shared handle to a team replica. The team outlives any one connection
/// and may be shared by several.
pub type TeamHandle<T> = Arc<parking_lot::Mutex<T>>;

/// The team signature chain, as consumed by the connection protocol.
///
/// Implementations must be cheap to lock: the protocol calls these methods
/// from a single task and never holds the handle lock across an await.
pub trait Team: Send + Sized + 'static {
    /// Rebuild a replica from a serialized chain, for the given local
    /// device.
    fn load(source: &serde_json::Value, device: &DeviceInfo) -> Result<Self, AuthError>;

    /// Serialize the full chain.
    fn save(&self) -> serde_json::Value;

    fn team_name(&self) -> &str;
    fn root(&self) -> Hash;
    fn head(&self) -> Hash;
    fn link_hashes(&self) -> Vec<Hash>;

    /// The view of our chain advertised in `UPDATE` messages.
    fn summary(&self) -> ChainSummary {
        ChainSummary {
            root: self.root(),
            head: self.head(),
            hashes: self.link_hashes(),
        }
    }

    /// Links we hold that the peer, per its summary, does not.
    fn missing_links(&self, theirs: &ChainSummary) -> Vec<Link>;

    /// Fold links received from the peer into our replica.
    fn receive_missing_links(&mut self, head: &Hash, links: &[Link]) -> Result<(), AuthError>;

    /// Check a proof of invitation: known id, not revoked, names match,
    /// starter-key signature valid.
    fn validate_invitation(&self, proof: &ProofOfInvitation) -> Result<(), AuthError>;

    /// Whether the chain records the invitation with this id (used by a
    /// newcomer to confirm the chain it received is the team that invited
    /// it).
    fn has_invitation(&self, id: &str) -> bool;

    /// Admit the holder of a valid proof, placing their keys on the chain.
    fn admit(&mut self, proof: &ProofOfInvitation) -> Result<(), AuthError>;

    /// Complete our own admission after loading a chain that contains it.
    ///
    /// Returns `Some(user)` when the chain carries the user's keys for us
    /// (device invitations recover them from a lockbox sealed to the
    /// starter keys); `None` when the joiner already holds its own user
    /// keys (member invitations).
    fn join(&mut self, proof: &ProofOfInvitation, seed: &str) -> Result<Option<UserInfo>, AuthError>;

    /// Resolve an identity claim against the chain.
    fn lookup_identity(&self, claim: &IdentityClaim) -> IdentityLookup;

    /// Verify a signed challenge against the claimed device's signing key
    /// on the chain.
    fn verify_identity_proof(&self, challenge: &IdentityChallenge, signature: &str) -> bool;

    fn has_member(&self, user_name: &str) -> bool;
    fn member(&self, user_name: &str) -> Option<Member>;

    /// Subscribe to chain-head changes. Fires on every local mutation,
    /// including those made through other connections sharing the replica.
    fn updates(&self) -> broadcast::Receiver<Hash>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_claim_splits_user_name() {
        let claim = IdentityClaim::device("alice", "laptop");
        assert_eq!(claim.name, "alice::laptop");
        assert_eq!(claim.user_name(), "alice");
        assert_eq!(claim.kind, IdentityKind::Device);
    }

    #[test]
    fn identity_kind_wire_names() {
        let json = serde_json::to_string(&IdentityKind::Member).unwrap();
        assert_eq!(json, "\"MEMBER\"");
        let json = serde_json::to_string(&IdentityKind::Device).unwrap();
        assert_eq!(json, "\"DEVICE\"");
    }

    #[test]
    fn lookup_outcomes_map_to_errors() {
        assert_eq!(IdentityLookup::ValidDevice.into_error(), None);
        assert_eq!(
            IdentityLookup::MemberRemoved.into_error(),
            Some(AuthError::MemberRemoved)
        );
        assert_eq!(
            IdentityLookup::DeviceUnknown.into_error(),
            Some(AuthError::DeviceUnknown)
        );
    }
}
