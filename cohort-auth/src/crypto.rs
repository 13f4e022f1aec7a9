//! Cryptographic primitives used by the protocol.
//!
//! Everything here wraps vetted ecosystem crates; no primitive is
//! hand-rolled:
//!
//! - **Signatures**: Ed25519 (`ed25519-dalek`).
//! - **Asymmetric box**: X25519 Diffie-Hellman → HKDF-SHA256 → AES-256-GCM.
//!   Authenticated in both directions: the sender's static encryption key
//!   participates in the DH, so only the claimed sender could have produced
//!   a ciphertext the recipient can open.
//! - **Symmetric AEAD**: AES-256-GCM with a random 96-bit nonce.
//! - **Key derivation**: HKDF-SHA256, domain-separated by `info` strings.
//!
//! Key material crosses the wire base64url-encoded without padding.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use ed25519_dalek::{Signer, Verifier};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::AuthError;

/// Derive 32 bytes from input key material via HKDF-SHA256.
pub(crate) fn hkdf32(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = hkdf::Hkdf::<Sha256>::new(salt, ikm);
    let mut out = [0u8; 32];
    hk.expand(info, &mut out).expect("32 bytes valid for HKDF");
    out
}

/// Fill a fresh 32-byte buffer from the OS RNG.
pub fn random_bytes() -> [u8; 32] {
    use rand::RngCore;
    let mut buf = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

// ── Keysets ────────────────────────────────────────────────────────

/// Secret half of an identity: an Ed25519 signing key and an X25519
/// encryption key.
#[derive(Clone)]
pub struct Keyset {
    signing: ed25519_dalek::SigningKey,
    encryption: StaticSecret,
}

impl Keyset {
    /// Generate a fresh random keyset.
    pub fn generate() -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::generate(&mut OsRng),
            encryption: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Derive a keyset deterministically from input key material.
    ///
    /// Used for starter keys, where both the inviter and the invitee must
    /// arrive at the same keypair knowing only the invitation seed.
    pub fn from_ikm(ikm: &[u8]) -> Self {
        let signing = ed25519_dalek::SigningKey::from_bytes(&hkdf32(None, ikm, b"keyset/signing"));
        let encryption = StaticSecret::from(hkdf32(None, ikm, b"keyset/encryption"));
        Self { signing, encryption }
    }

    /// Restore from the 64 bytes produced by [`Keyset::secret_bytes`].
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, AuthError> {
        let bytes: &[u8; 64] = bytes.try_into().map_err(|_| AuthError::BadKey)?;
        let mut signing = [0u8; 32];
        let mut encryption = [0u8; 32];
        signing.copy_from_slice(&bytes[..32]);
        encryption.copy_from_slice(&bytes[32..]);
        Ok(Self {
            signing: ed25519_dalek::SigningKey::from_bytes(&signing),
            encryption: StaticSecret::from(encryption),
        })
    }

    /// Serialize both secrets (for lockboxes).
    pub fn secret_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.signing.to_bytes());
        out[32..].copy_from_slice(&self.encryption.to_bytes());
        out
    }

    /// The public half, as carried on the chain and the wire.
    pub fn public(&self) -> PublicKeyset {
        PublicKeyset {
            signing: B64.encode(self.signing.verifying_key().as_bytes()),
            encryption: B64.encode(PublicKey::from(&self.encryption).as_bytes()),
        }
    }

    /// Sign a message with the Ed25519 key; returns a base64url signature.
    pub fn sign(&self, message: &[u8]) -> String {
        B64.encode(self.signing.sign(message).to_bytes())
    }

    pub(crate) fn encryption_secret(&self) -> &StaticSecret {
        &self.encryption
    }
}

impl std::fmt::Debug for Keyset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print secrets.
        f.debug_struct("Keyset").field("public", &self.public()).finish()
    }
}

/// Public half of a [`Keyset`], base64url-encoded.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PublicKeyset {
    /// Ed25519 verifying key.
    pub signing: String,
    /// X25519 public key.
    pub encryption: String,
}

fn decode32(encoded: &str) -> Result<[u8; 32], AuthError> {
    let bytes = B64.decode(encoded).map_err(|_| AuthError::BadKey)?;
    bytes.as_slice().try_into().map_err(|_| AuthError::BadKey)
}

/// Verify an Ed25519 signature against a base64url verifying key.
pub fn verify(signing_key: &str, message: &[u8], signature: &str) -> bool {
    let Ok(key_bytes) = decode32(signing_key) else {
        return false;
    };
    let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = B64.decode(signature) else {
        return false;
    };
    let Ok(sig) = ed25519_dalek::Signature::from_slice(&sig_bytes) else {
        return false;
    };
    key.verify(message, &sig).is_ok()
}

// ── AEAD ───────────────────────────────────────────────────────────

/// A nonce plus ciphertext, as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Sealed {
    /// 96-bit AES-GCM nonce, base64url.
    pub nonce: String,
    /// Ciphertext with authentication tag, base64url.
    pub ciphertext: String,
}

fn aead_seal(key: &[u8; 32], plaintext: &[u8]) -> Sealed {
    let cipher = Aes256Gcm::new_from_slice(key).expect("32-byte AES-256 key");
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .expect("AES-GCM encryption is infallible for in-memory buffers");
    Sealed {
        nonce: B64.encode(nonce),
        ciphertext: B64.encode(ciphertext),
    }
}

fn aead_open(key: &[u8; 32], sealed: &Sealed) -> Result<Vec<u8>, AuthError> {
    let nonce_bytes = B64
        .decode(&sealed.nonce)
        .map_err(|_| AuthError::DecryptionFailed)?;
    if nonce_bytes.len() != 12 {
        return Err(AuthError::DecryptionFailed);
    }
    let ct = B64
        .decode(&sealed.ciphertext)
        .map_err(|_| AuthError::DecryptionFailed)?;
    let cipher = Aes256Gcm::new_from_slice(key).expect("32-byte AES-256 key");
    cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ct.as_slice())
        .map_err(|_| AuthError::DecryptionFailed)
}

/// Symmetric AEAD encryption with a raw 256-bit key.
pub fn symmetric_encrypt(key: &[u8; 32], plaintext: &[u8]) -> Sealed {
    aead_seal(key, plaintext)
}

/// Symmetric AEAD decryption. Fails on tampering or a wrong key.
pub fn symmetric_decrypt(key: &[u8; 32], sealed: &Sealed) -> Result<Vec<u8>, AuthError> {
    aead_open(key, sealed)
}

// ── Asymmetric box ─────────────────────────────────────────────────

fn box_key(secret: &StaticSecret, public: &PublicKey) -> [u8; 32] {
    let shared = secret.diffie_hellman(public);
    hkdf32(None, shared.as_bytes(), b"box/v1")
}

/// Seal a payload from `sender` to the peer's public encryption key.
pub fn seal(sender: &Keyset, recipient_encryption: &str, plaintext: &[u8]) -> Result<Sealed, AuthError> {
    let recipient = PublicKey::from(decode32(recipient_encryption)?);
    let key = box_key(sender.encryption_secret(), &recipient);
    Ok(aead_seal(&key, plaintext))
}

/// Open a payload sealed by the peer to our encryption key.
pub fn open(recipient: &Keyset, sender_encryption: &str, sealed: &Sealed) -> Result<Vec<u8>, AuthError> {
    let sender = PublicKey::from(decode32(sender_encryption)?);
    let key = box_key(recipient.encryption_secret(), &sender);
    aead_open(&key, sealed)
}
