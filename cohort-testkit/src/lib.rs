//! Test kit for the `cohort-auth` connection protocol.
//!
//! Provides the two things the protocol treats as external:
//!
//! - [`team::MemTeam`] — a reference in-memory team: a hash-linked log of
//!   signed membership operations implementing the
//!   [`cohort_auth::team::Team`] seam, with invitations, revocation,
//!   admissions and device lockboxes;
//! - [`harness`] — transport wiring that connects two live connections
//!   through JSON-framed envelopes, plus event-stream helpers.
//!
//! The end-to-end protocol tests live in this crate's `tests/` directory.

pub mod chain;
pub mod harness;
pub mod team;

pub use team::MemTeam;
