//! Events emitted by a connection for the host to consume.

use crate::team::{Hash, Team, TeamHandle};

/// Lifecycle and traffic events. This is the only observable surface of a
/// connection; hosts receive them on the channel returned by
/// [`crate::connection::Connection::spawn`].
pub enum ConnectionEvent<T: Team> {
    /// The machine moved; `summary` is a human-readable state description.
    Change { summary: String },

    /// Handshake, sync and negotiation all completed; the session key is
    /// established.
    Connected,

    /// We joined the team via our invitation. Carries the freshly built
    /// replica so an invitee host can keep it.
    Joined { team: TeamHandle<T> },

    /// Our replica changed as a result of links received from the peer.
    Updated { head: Hash },

    /// The connection ended, cleanly or not.
    Disconnected { reason: String },

    /// Decrypted application traffic from the peer.
    Message { payload: Vec<u8> },
}

impl<T: Team> ConnectionEvent<T> {
    /// Event name, for log lines and test assertions.
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::Change { .. } => "change",
            ConnectionEvent::Connected => "connected",
            ConnectionEvent::Joined { .. } => "joined",
            ConnectionEvent::Updated { .. } => "updated",
            ConnectionEvent::Disconnected { .. } => "disconnected",
            ConnectionEvent::Message { .. } => "message",
        }
    }
}

impl<T: Team> std::fmt::Debug for ConnectionEvent<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionEvent::Change { summary } => {
                f.debug_struct("Change").field("summary", summary).finish()
            }
            ConnectionEvent::Connected => f.write_str("Connected"),
            ConnectionEvent::Joined { .. } => f.write_str("Joined"),
            ConnectionEvent::Updated { head } => {
                f.debug_struct("Updated").field("head", head).finish()
            }
            ConnectionEvent::Disconnected { reason } => {
                f.debug_struct("Disconnected").field("reason", reason).finish()
            }
            ConnectionEvent::Message { payload } => f
                .debug_struct("Message")
                .field("len", &payload.len())
                .finish(),
        }
    }
}
