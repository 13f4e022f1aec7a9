//! Synchronization and negotiation handlers.
//!
//! Both sides advertise their chain with `UPDATE`; whoever holds links the
//! other lacks ships them in `MISSING_LINKS`. When the heads match, each
//! side contributes a random seed (boxed to the peer's encryption key) and
//! derives the session key. A chain change on either side while connected
//! drops the pair back into synchronization; the established session key
//! survives.

use crate::crypto;
use crate::error::AuthError;
use crate::event::ConnectionEvent;
use crate::message::Message;
use crate::session;
use crate::team::{ChainSummary, Hash, Link, Team};

use super::machine::Phase;
use super::ConnectionTask;

impl<T: Team> ConnectionTask<T> {
    /// Handshake settled on both sides: start trading chain state.
    pub(super) fn enter_sync(&mut self) -> Result<(), AuthError> {
        self.enter_phase(Phase::Synchronizing);
        self.send_update()
    }

    fn send_update(&mut self) -> Result<(), AuthError> {
        let team = self.team()?;
        let summary = team.lock().summary();
        self.send_message(Message::Update {
            root: summary.root,
            head: summary.head,
            hashes: summary.hashes,
        });
        Ok(())
    }

    pub(super) fn on_sync_message(&mut self, message: Message) -> Result<(), AuthError> {
        match message {
            Message::Update { root, head, hashes } => {
                self.handle_update(ChainSummary { root, head, hashes })
            }
            Message::MissingLinks { head, links } => self.handle_missing_links(head, links),
            Message::LocalUpdate { .. } => {
                self.send_update()?;
                self.check_sync_advance()
            }
            // The peer can reach negotiation one message ahead of us;
            // park its seed until we get there.
            Message::Seed { encrypted_seed } => {
                self.ctx.their_encrypted_seed = Some(encrypted_seed);
                Ok(())
            }
            other => {
                tracing::debug!(kind = other.kind(), "unexpected message while synchronizing");
                Ok(())
            }
        }
    }

    fn handle_update(&mut self, theirs: ChainSummary) -> Result<(), AuthError> {
        self.ctx.their_head = Some(theirs.head.clone());
        let team = self.team()?;
        let (root, head, links) = {
            let team = team.lock();
            (team.root(), team.head(), team.missing_links(&theirs))
        };
        if theirs.root != root {
            // Same member set can't grow from two different roots.
            return Err(AuthError::WrongTeam);
        }
        if !links.is_empty() {
            tracing::debug!(peer = %self.peer_name(), count = links.len(), "sending missing links");
            self.send_message(Message::MissingLinks { head, links });
        }
        self.check_sync_advance()
    }

    fn handle_missing_links(&mut self, head: Hash, links: Vec<Link>) -> Result<(), AuthError> {
        let team = self.team()?;
        let new_head = {
            let mut team = team.lock();
            team.receive_missing_links(&head, &links)?;
            team.head()
        };
        tracing::debug!(peer = %self.peer_name(), head = %new_head, "chain updated from peer");
        self.emit(ConnectionEvent::Updated { head: new_head });
        self.send_update()?;
        self.check_sync_advance()
    }

    /// Once the heads agree (and the peer is still a member), move on:
    /// negotiate a session key if we don't have one, otherwise we're
    /// connected again.
    fn check_sync_advance(&mut self) -> Result<(), AuthError> {
        let team = self.team()?;
        let peer_name = self.peer_user_name()?;
        let (our_head, peer_is_member) = {
            let team = team.lock();
            (team.head(), team.has_member(&peer_name))
        };
        if !peer_is_member {
            return Err(AuthError::PeerRemoved);
        }
        if self.ctx.their_head.as_deref() != Some(our_head.as_str()) {
            return Ok(());
        }
        if self.ctx.session_key.is_none() {
            self.enter_negotiating()
        } else {
            self.enter_phase(Phase::Connected);
            self.emit(ConnectionEvent::Connected);
            Ok(())
        }
    }

    fn enter_negotiating(&mut self) -> Result<(), AuthError> {
        self.enter_phase(Phase::Negotiating);
        // The seed is sticky for the life of the connection, so a
        // re-negotiation after an interrupted pass stays consistent.
        let seed = *self.ctx.seed.get_or_insert_with(crypto::random_bytes);

        let peer_name = self.peer_user_name()?;
        let team = self.team()?;
        self.ctx.peer = team.lock().member(&peer_name);
        let peer = self.ctx.peer.clone().ok_or(AuthError::PeerRemoved)?;
        let user = self.user()?;

        let encrypted_seed = crypto::seal(&user.keys, &peer.keys.encryption, &seed)?;
        self.send_message(Message::Seed { encrypted_seed });

        // The peer may have advanced first and its seed may already be
        // parked.
        self.try_derive_session_key()
    }

    pub(super) fn on_negotiating_message(&mut self, message: Message) -> Result<(), AuthError> {
        match message {
            Message::Seed { encrypted_seed } => {
                self.ctx.their_encrypted_seed = Some(encrypted_seed);
                self.try_derive_session_key()
            }
            // A chain change mid-negotiation sends us back to sync. An
            // equal-heads echo changes nothing and is absorbed.
            Message::Update { root, head, hashes } => {
                self.ctx.their_head = Some(head.clone());
                if head == self.team()?.lock().head() {
                    return Ok(());
                }
                self.enter_phase(Phase::Synchronizing);
                self.send_update()?;
                self.handle_update(ChainSummary { root, head, hashes })
            }
            Message::MissingLinks { head, links } => {
                self.enter_phase(Phase::Synchronizing);
                self.handle_missing_links(head, links)
            }
            Message::LocalUpdate { head } => {
                if self.ctx.their_head.as_ref() == Some(&head) {
                    return Ok(());
                }
                self.enter_phase(Phase::Synchronizing);
                self.send_update()?;
                self.check_sync_advance()
            }
            other => {
                tracing::debug!(kind = other.kind(), "unexpected message while negotiating");
                Ok(())
            }
        }
    }

    fn try_derive_session_key(&mut self) -> Result<(), AuthError> {
        let (Some(sealed), Some(seed)) = (self.ctx.their_encrypted_seed.clone(), self.ctx.seed)
        else {
            return Ok(());
        };
        let peer = self.ctx.peer.clone().ok_or(AuthError::PeerRemoved)?;
        let user = self.user()?;
        let plaintext = crypto::open(&user.keys, &peer.keys.encryption, &sealed)
            .map_err(|_| AuthError::DecryptionFailed)?;
        let theirs: [u8; 32] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| AuthError::DecryptionFailed)?;
        self.ctx.session_key = Some(session::derive_session_key(&seed, &theirs));
        tracing::info!(peer = %self.peer_name(), "session key established");
        self.enter_phase(Phase::Connected);
        self.emit(ConnectionEvent::Connected);
        Ok(())
    }

    pub(super) fn on_connected_message(&mut self, message: Message) -> Result<(), AuthError> {
        match message {
            Message::EncryptedMessage { payload } => {
                let key = self
                    .ctx
                    .session_key
                    .ok_or(AuthError::DecryptionFailed)?;
                let plaintext = session::decrypt(&key, &payload)?;
                self.emit(ConnectionEvent::Message { payload: plaintext });
                Ok(())
            }
            // The peer's chain moved: re-enter synchronization. An
            // equal-heads echo is absorbed, or the two sides would
            // volley UPDATEs at each other forever.
            Message::Update { root, head, hashes } => {
                self.ctx.their_head = Some(head.clone());
                if head == self.team()?.lock().head() {
                    return Ok(());
                }
                self.enter_phase(Phase::Synchronizing);
                self.send_update()?;
                self.handle_update(ChainSummary { root, head, hashes })
            }
            // Our own replica moved: advertise it, unless the peer is
            // already at this head.
            Message::LocalUpdate { head } => {
                if self.ctx.their_head.as_ref() == Some(&head) {
                    return Ok(());
                }
                self.enter_phase(Phase::Synchronizing);
                self.send_update()?;
                self.check_sync_advance()
            }
            Message::Seed { .. } => {
                // Leftover from a negotiation we already completed.
                Ok(())
            }
            other => {
                tracing::debug!(kind = other.kind(), "unexpected message while connected");
                Ok(())
            }
        }
    }
}
