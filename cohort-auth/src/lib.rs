//! Pairwise connection protocol for decentralized team authentication.
//!
//! Two peers, each a device belonging to a user, use this crate to
//! establish that they are mutually authorized members of a shared team,
//! admit a newcomer that holds only an invitation secret, reconcile the
//! team's membership signature chain, and derive a session key for
//! encrypted application traffic.
//!
//! The team chain itself is an external collaborator behind the
//! [`team::Team`] trait; `cohort-testkit` provides a reference in-memory
//! implementation.
//!
//! # Overview
//!
//! ```text
//! transport → codec → delivery buffer → machine → actions
//!                                                   ├→ outbound messages
//!                                                   ├→ team mutations
//!                                                   └→ host events
//! ```
//!
//! A connection is spawned with a [`connection::ConnectionContext`]
//! describing who we are (an existing member, or an invitee holding a
//! seed), an outbound channel for [`message::Envelope`]s, and yields a
//! stream of [`event::ConnectionEvent`]s. Inbound envelopes are pushed in
//! via [`connection::Connection::deliver`]; ordering and duplicates are
//! handled internally, so the transport only has to be reliable-ish.

pub mod challenge;
pub mod connection;
pub mod crypto;
pub mod delivery;
pub mod error;
pub mod event;
pub mod invitation;
pub mod message;
pub mod session;
pub mod team;

pub use connection::{Connection, ConnectionConfig, ConnectionContext};
pub use error::AuthError;
pub use event::ConnectionEvent;
pub use message::{Envelope, Message};
pub use team::{DeviceInfo, Team, TeamHandle, UserInfo};
