//! Session key derivation.
//!
//! During negotiation each peer contributes a random 256-bit seed,
//! exchanged under the asymmetric box. The session key is an HKDF over the
//! *sorted* pair, so both peers compute the same key no matter which side
//! contributed which seed.

use crate::crypto::{self, Sealed};
use crate::error::AuthError;

/// Size of seeds and of the derived session key, in bytes.
pub const KEY_BYTES: usize = 32;

/// Derive the shared session key from our seed and the peer's.
///
/// Symmetric in its arguments: `derive_session_key(a, b) ==
/// derive_session_key(b, a)`.
pub fn derive_session_key(ours: &[u8; KEY_BYTES], theirs: &[u8; KEY_BYTES]) -> [u8; KEY_BYTES] {
    let (lo, hi) = if ours <= theirs { (ours, theirs) } else { (theirs, ours) };
    let mut ikm = [0u8; 2 * KEY_BYTES];
    ikm[..KEY_BYTES].copy_from_slice(lo);
    ikm[KEY_BYTES..].copy_from_slice(hi);
    crypto::hkdf32(None, &ikm, b"session-key/v1")
}

/// Encrypt an application payload under the session key.
pub fn encrypt(session_key: &[u8; KEY_BYTES], payload: &[u8]) -> Sealed {
    crypto::symmetric_encrypt(session_key, payload)
}

/// Decrypt an application payload under the session key.
pub fn decrypt(session_key: &[u8; KEY_BYTES], sealed: &Sealed) -> Result<Vec<u8>, AuthError> {
    crypto::symmetric_decrypt(session_key, sealed)
}
