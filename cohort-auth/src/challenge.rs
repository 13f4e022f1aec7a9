//! Identity challenges.
//!
//! To verify that a peer controls the device it claims, we send it a fresh
//! nonce bound to the claim; the peer signs the whole challenge with its
//! device signing key. Binding the signature to a key on the chain is the
//! team's job ([`crate::team::Team::verify_identity_proof`]); this module
//! only issues challenges and produces signatures.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use serde::{Deserialize, Serialize};

use crate::crypto::{self, Keyset};
use crate::team::IdentityClaim;

/// A nonce challenge over an identity claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityChallenge {
    pub claim: IdentityClaim,
    /// 256-bit random nonce, base64url.
    pub nonce: String,
}

/// The canonical byte serialization that gets signed.
fn challenge_payload(challenge: &IdentityChallenge) -> Vec<u8> {
    serde_json::to_vec(challenge).expect("challenge is serializable")
}

/// Issue a challenge for the peer's claim.
pub fn issue(claim: IdentityClaim) -> IdentityChallenge {
    IdentityChallenge {
        claim,
        nonce: B64.encode(crypto::random_bytes()),
    }
}

/// Sign a received challenge with our device keys.
pub fn prove(challenge: &IdentityChallenge, device_keys: &Keyset) -> String {
    device_keys.sign(&challenge_payload(challenge))
}

/// Check a challenge signature against a known public signing key.
///
/// Team implementations use this once they have resolved the claimed
/// device's key on the chain.
pub fn verify(challenge: &IdentityChallenge, signing_key: &str, signature: &str) -> bool {
    crypto::verify(signing_key, &challenge_payload(challenge), signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim() -> IdentityClaim {
        IdentityClaim::device("alice", "laptop")
    }

    #[test]
    fn nonces_are_fresh_and_256_bit() {
        let a = issue(claim());
        let b = issue(claim());
        assert_ne!(a.nonce, b.nonce);
        assert_eq!(B64.decode(&a.nonce).unwrap().len(), 32);
    }

    #[test]
    fn prove_and_verify() {
        let keys = Keyset::generate();
        let challenge = issue(claim());
        let sig = prove(&challenge, &keys);
        assert!(verify(&challenge, &keys.public().signing, &sig));
    }

    #[test]
    fn signature_is_bound_to_the_challenge() {
        let keys = Keyset::generate();
        let challenge = issue(claim());
        let sig = prove(&challenge, &keys);

        // A different nonce, or a different claim, invalidates the proof.
        let other = issue(claim());
        assert!(!verify(&other, &keys.public().signing, &sig));

        let mut altered = challenge.clone();
        altered.claim = IdentityClaim::device("mallory", "laptop");
        assert!(!verify(&altered, &keys.public().signing, &sig));
    }

    #[test]
    fn wrong_key_fails() {
        let challenge = issue(claim());
        let sig = prove(&challenge, &Keyset::generate());
        assert!(!verify(&challenge, &Keyset::generate().public().signing, &sig));
    }
}
