//! Invitation proofs.
//!
//! An invitation is a shared secret (the seed). Both sides derive the same
//! *starter keys* from it: the inviter records the public half on the chain
//! when the invitation is issued, and the invitee signs its proof with the
//! secret half. That signature is how the team recognizes a newcomer that
//! has no keys on the chain yet.
//!
//! Seeds are normalized before derivation so a seed read aloud or typed on
//! a phone keyboard ("abc+def+ghi" vs "abc def ghi") still matches.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::{Keyset, PublicKeyset};
use crate::team::{DeviceRecord, Invitee};

/// Length of a displayed invitation id.
const ID_LEN: usize = 16;

/// Proof that the sender holds an invitation seed.
///
/// Beyond the invitee binding, the proof carries the newcomer's real public
/// keys so that admission can place them on the chain: `keys` for a new
/// member's user keyset, `device` for the joining device. All fields are
/// covered by the starter-key signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOfInvitation {
    /// Invitation id, derived from the seed.
    pub id: String,
    pub invitee: Invitee,
    /// The joining user's public keyset (member invitations only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<PublicKeyset>,
    /// The joining device's public record.
    pub device: DeviceRecord,
    /// Starter-key signature over the fields above, base64url.
    pub signature: String,
}

/// Normalize a human-transcribed seed: trim, lowercase, treat `+` as a
/// space, collapse whitespace runs.
pub fn normalize_seed(seed: &str) -> String {
    seed.trim()
        .to_lowercase()
        .replace('+', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministically derive the starter keypair from a seed.
pub fn derive_starter_keys(seed: &str) -> Keyset {
    let normalized = normalize_seed(seed);
    Keyset::from_ikm(format!("invitation:{normalized}").as_bytes())
}

/// The invitation id under which the inviter files the starter public key.
pub fn invitation_id(seed: &str) -> String {
    let starter = derive_starter_keys(seed).public();
    let digest = Sha256::digest(starter.signing.as_bytes());
    let mut id = B64.encode(digest);
    id.truncate(ID_LEN);
    id
}

fn proof_payload(
    id: &str,
    invitee: &Invitee,
    keys: Option<&PublicKeyset>,
    device: &DeviceRecord,
) -> Vec<u8> {
    #[derive(Serialize)]
    struct Payload<'a> {
        id: &'a str,
        invitee: &'a Invitee,
        keys: Option<&'a PublicKeyset>,
        device: &'a DeviceRecord,
    }
    serde_json::to_vec(&Payload { id, invitee, keys, device })
        .expect("proof payload is serializable")
}

/// Build a proof of invitation for the given seed and newcomer keys.
pub fn generate_proof(
    seed: &str,
    invitee: Invitee,
    keys: Option<PublicKeyset>,
    device: DeviceRecord,
) -> ProofOfInvitation {
    let starter = derive_starter_keys(seed);
    let id = invitation_id(seed);
    let signature = starter.sign(&proof_payload(&id, &invitee, keys.as_ref(), &device));
    ProofOfInvitation { id, invitee, keys, device, signature }
}

/// Check a proof's signature against a starter public signing key, as
/// recorded on the chain when the invitation was issued.
pub fn verify_proof_signature(proof: &ProofOfInvitation, starter_signing: &str) -> bool {
    let payload = proof_payload(&proof.id, &proof.invitee, proof.keys.as_ref(), &proof.device);
    crate::crypto::verify(starter_signing, &payload, &proof.signature)
}
