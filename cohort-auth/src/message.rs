//! The on-wire message set.
//!
//! Messages are JSON objects tagged by `type`. Every message that actually
//! travels to the peer is wrapped in an [`Envelope`] carrying a strictly
//! increasing `index`; `LOCAL_UPDATE` and `RECONNECT` exist only inside the
//! machine and are never enveloped.

use serde::{Deserialize, Serialize};

use crate::challenge::IdentityChallenge;
use crate::crypto::Sealed;
use crate::error::ErrorPayload;
use crate::invitation::ProofOfInvitation;
use crate::team::{Hash, IdentityClaim, Link};

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Sent once by each side when its connection starts.
    Ready,

    /// Opens the handshake: who we claim to be, plus proof that we were
    /// invited if we are a newcomer.
    Hello {
        identity_claim: IdentityClaim,
        #[serde(skip_serializing_if = "Option::is_none")]
        proof_of_invitation: Option<ProofOfInvitation>,
    },

    /// Inviter → invitee: your proof checked out; here is the whole team
    /// chain.
    AcceptInvitation { chain: serde_json::Value },

    ChallengeIdentity { challenge: IdentityChallenge },

    ProveIdentity {
        challenge: IdentityChallenge,
        /// Device-key signature over the challenge, base64url.
        proof: String,
    },

    AcceptIdentity,

    /// Advertise our chain so the peer can work out what we're missing.
    Update {
        root: Hash,
        head: Hash,
        hashes: Vec<Hash>,
    },

    /// Links the sender holds that the recipient reported not having.
    MissingLinks { head: Hash, links: Vec<Link> },

    /// Machine-internal: our own replica changed. Never on the wire.
    LocalUpdate { head: Hash },

    /// Our key-agreement seed, boxed to the peer's encryption key.
    Seed { encrypted_seed: Sealed },

    /// Application traffic under the session key.
    EncryptedMessage { payload: Sealed },

    Disconnect,

    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },

    /// Machine-internal: revive a cleanly disconnected machine. Never on
    /// the wire.
    Reconnect,
}

impl Message {
    /// The wire tag, for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ready => "READY",
            Message::Hello { .. } => "HELLO",
            Message::AcceptInvitation { .. } => "ACCEPT_INVITATION",
            Message::ChallengeIdentity { .. } => "CHALLENGE_IDENTITY",
            Message::ProveIdentity { .. } => "PROVE_IDENTITY",
            Message::AcceptIdentity => "ACCEPT_IDENTITY",
            Message::Update { .. } => "UPDATE",
            Message::MissingLinks { .. } => "MISSING_LINKS",
            Message::LocalUpdate { .. } => "LOCAL_UPDATE",
            Message::Seed { .. } => "SEED",
            Message::EncryptedMessage { .. } => "ENCRYPTED_MESSAGE",
            Message::Disconnect => "DISCONNECT",
            Message::Error { .. } => "ERROR",
            Message::Reconnect => "RECONNECT",
        }
    }

    /// Whether this kind exists only inside the machine.
    pub fn is_local(&self) -> bool {
        matches!(self, Message::LocalUpdate { .. } | Message::Reconnect)
    }

    pub fn error(payload: &ErrorPayload) -> Self {
        Message::Error {
            message: payload.message.clone(),
            details: payload.details.clone(),
        }
    }
}

/// A numbered message as it travels over the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub index: u64,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    pub fn new(index: u64, message: Message) -> Self {
        debug_assert!(!message.is_local(), "local message kinds are never enveloped");
        Self { index, message }
    }
}
