//! Error taxonomy for the connection protocol.
//!
//! Every failure path in the protocol maps to one of these variants. The
//! `Display` string of a variant is exactly what goes over the wire in an
//! `ERROR` message, so the peer sees the same description the local host
//! does.

use serde::{Deserialize, Serialize};

/// Protocol and seam errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    // ── Identity ───────────────────────────────────────────────────

    #[error("member is not on the team")]
    MemberUnknown,
    #[error("member was removed from the team")]
    MemberRemoved,
    #[error("device is not listed on the team")]
    DeviceUnknown,
    #[error("device was removed from the team")]
    DeviceRemoved,
    #[error("identity proof is not valid")]
    IdentityProofInvalid,

    // ── Invitation ─────────────────────────────────────────────────

    #[error("invitation is not valid: {reason}")]
    InvitationInvalid { reason: String },
    #[error("this invitation has been revoked")]
    InvitationRevoked,
    #[error("the chain we received does not contain our invitation")]
    WrongTeam,
    #[error("neither peer is a member of the team, so neither can admit the other")]
    NeitherIsMember,

    // ── Membership ─────────────────────────────────────────────────

    #[error("peer is no longer a member of the team")]
    PeerRemoved,

    // ── Protocol ───────────────────────────────────────────────────

    #[error("timed out waiting for the peer")]
    Timeout,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("peer reported an error: {message}")]
    PeerError { message: String },

    // ── Seams ──────────────────────────────────────────────────────

    #[error("malformed key material")]
    BadKey,
    #[error("signature chain error: {reason}")]
    Chain { reason: String },
}

impl AuthError {
    /// Stable machine-readable code, carried in `ERROR.details`.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MemberUnknown => "MEMBER_UNKNOWN",
            AuthError::MemberRemoved => "MEMBER_REMOVED",
            AuthError::DeviceUnknown => "DEVICE_UNKNOWN",
            AuthError::DeviceRemoved => "DEVICE_REMOVED",
            AuthError::IdentityProofInvalid => "IDENTITY_PROOF_INVALID",
            AuthError::InvitationInvalid { .. } => "INVITATION_INVALID",
            AuthError::InvitationRevoked => "INVITATION_REVOKED",
            AuthError::WrongTeam => "WRONG_TEAM",
            AuthError::NeitherIsMember => "NEITHER_IS_MEMBER",
            AuthError::PeerRemoved => "PEER_REMOVED",
            AuthError::Timeout => "TIMEOUT",
            AuthError::DecryptionFailed => "DECRYPTION_FAILED",
            AuthError::PeerError { .. } => "PEER_ERROR",
            AuthError::BadKey => "BAD_KEY",
            AuthError::Chain { .. } => "CHAIN_ERROR",
        }
    }

    /// The payload sent to the peer in an outbound `ERROR` message.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            message: self.to_string(),
            details: Some(serde_json::json!({ "code": self.code() })),
        }
    }
}

/// The first terminal error recorded on a connection, mirroring the wire
/// `ERROR` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings_are_wire_messages() {
        let err = AuthError::InvitationInvalid {
            reason: "User names don't match (invitation was issued to 'bob')".into(),
        };
        let payload = err.to_payload();
        assert!(payload.message.contains("User names don't match"));
        assert_eq!(
            payload.details.unwrap()["code"].as_str(),
            Some("INVITATION_INVALID")
        );
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(AuthError::PeerRemoved.code(), "PEER_REMOVED");
        assert_eq!(AuthError::Timeout.code(), "TIMEOUT");
        assert_eq!(
            AuthError::PeerError { message: "x".into() }.code(),
            "PEER_ERROR"
        );
    }
}
