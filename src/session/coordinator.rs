//! Session coordinator
//!
//! Owns every [`WalletSigningSession`] of this node and drives them through
//! the two MuSig2 rounds. Each session sits behind its own mutex inside the
//! session map, so protocol steps of one session are serialized while other
//! sessions proceed independently. No lock is held while messages are sent.

use crate::config::CoordinatorConfig;
use crate::crypto::{random_id, KeyPair};
use crate::discovery::DiscoveryCache;
use crate::error::{CoordinatorError, Result};
use crate::events::{EventBus, SessionEvent, Subscription};
use crate::network::{DialTarget, Envelope, PeerTransport, PollSchedule, ProtocolMessage, RosterEntry};
use crate::session::backend::{MusigBackend, SigningContext};
use crate::session::state::SessionState;
use crate::session::types::{ParticipantRecord, SessionAnnouncement, WalletSigningSession};
use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Reason recorded on sessions that ran out of time
pub const EXPIRED_REASON: &str = "session-expired";

struct SessionSlot {
    session: WalletSigningSession,
    /// Signing key of the local participant
    key: Arc<KeyPair>,
}

type SlotRef = Arc<Mutex<SessionSlot>>;

/// Message prepared under the session lock, sent after it is released
struct Outbound {
    /// (peer id, public key) of each recipient
    recipients: Vec<(String, String)>,
    envelope: Envelope,
}

pub struct SessionCoordinator {
    transport: Arc<dyn PeerTransport>,
    cache: Arc<RwLock<DiscoveryCache>>,
    backend: Arc<dyn MusigBackend>,
    config: CoordinatorConfig,
    sessions: RwLock<HashMap<String, SlotRef>>,
    /// Invitations received but not joined yet
    announcements: RwLock<HashMap<String, SessionAnnouncement>>,
    events: Arc<EventBus<SessionEvent>>,
    running: AtomicBool,
}

impl SessionCoordinator {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        cache: Arc<RwLock<DiscoveryCache>>,
        backend: Arc<dyn MusigBackend>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            transport,
            cache,
            backend,
            config,
            sessions: RwLock::new(HashMap::new()),
            announcements: RwLock::new(HashMap::new()),
            events: Arc::new(EventBus::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            log::info!(
                "Session coordinator started for peer {}",
                self.transport.local_peer_id()
            );
        }
    }

    /// Tear down all sessions. Returns their final snapshots.
    pub async fn stop(&self) -> Vec<WalletSigningSession> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Vec::new();
        }

        let slots: Vec<SlotRef> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        self.announcements.write().await.clear();

        let mut snapshots = Vec::with_capacity(slots.len());
        for slot in slots {
            let slot = slot.lock().await;
            self.backend.forget(&slot.session.id);
            snapshots.push(slot.session.clone());
        }
        log::info!("Session coordinator stopped ({} sessions)", snapshots.len());
        snapshots
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(CoordinatorError::NotInitialized("session coordinator"))
        }
    }

    pub fn local_peer_id(&self) -> &str {
        self.transport.local_peer_id()
    }

    pub fn events(&self) -> Subscription<SessionEvent> {
        self.events.subscribe()
    }

    async fn slot(&self, session_id: &str) -> Result<SlotRef> {
        self.ensure_running()?;
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::SessionNotFound(session_id.to_string()))
    }

    /// Start a session as initiator. `public_keys` lists the co-signers; our
    /// own key is added if missing.
    pub async fn create_signing_session(
        &self,
        public_keys: Vec<String>,
        my_key: Arc<KeyPair>,
        message_hex: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<String> {
        self.ensure_running()?;
        hex::decode(message_hex)
            .map_err(|_| CoordinatorError::InvalidSession("message is not hex".into()))?;

        let my_public_key = my_key.public_key_hex();
        let mut keys: BTreeSet<String> = public_keys.into_iter().collect();
        keys.insert(my_public_key.clone());
        if keys.len() < 2 {
            return Err(CoordinatorError::InsufficientParticipants {
                needed: 2,
                available: keys.len(),
            });
        }
        for key in &keys {
            crate::crypto::public_key_from_hex(key)?;
        }

        let local_peer = self.local_peer_id().to_string();
        let participants = self
            .resolve_participants(&keys, &my_public_key, &local_peer, None)
            .await;

        let session = WalletSigningSession::new(
            random_id(),
            true,
            local_peer,
            my_public_key,
            participants,
            message_hex.to_string(),
            metadata,
            Utc::now() + self.config.session_ttl(),
        )?;
        let id = session.id.clone();

        log::info!(
            "Created signing session {} with {} participants",
            id,
            session.participants.len()
        );
        self.sessions.write().await.insert(
            id.clone(),
            Arc::new(Mutex::new(SessionSlot {
                session,
                key: my_key,
            })),
        );
        Ok(id)
    }

    /// Build participant records, filling in peer ids and nicknames from
    /// the discovery cache
    async fn resolve_participants(
        &self,
        keys: &BTreeSet<String>,
        my_public_key: &str,
        local_peer: &str,
        coordinator: Option<(&str, &str)>,
    ) -> Vec<ParticipantRecord> {
        let cache = self.cache.read().await;
        keys.iter()
            .map(|key| {
                if key == my_public_key {
                    return ParticipantRecord::me(key, local_peer);
                }
                let mut record = ParticipantRecord::new(key);
                if let Some(ad) = cache.get_by_public_key(key) {
                    record.peer_id = Some(ad.peer_id.clone());
                    record.nickname = ad.nickname.clone();
                }
                if let Some((coordinator_key, coordinator_peer)) = coordinator {
                    if key == coordinator_key {
                        record.peer_id = Some(coordinator_peer.to_string());
                        record.has_joined = true;
                    }
                }
                record
            })
            .collect()
    }

    /// Send the invitation to every participant we can reach. Delivery is
    /// best-effort; the returned announcement can also be passed on out of
    /// band.
    pub async fn announce_session(&self, session_id: &str) -> Result<SessionAnnouncement> {
        let slot = self.slot(session_id).await?;
        let (announcement, outbound) = {
            let mut slot = slot.lock().await;
            self.check_active(&mut slot.session)?;
            if !slot.session.is_initiator {
                return Err(CoordinatorError::InvalidSession(format!(
                    "only the initiator can announce session {}",
                    session_id
                )));
            }
            let announcement = slot.session.announcement()?;
            let outbound = self.outbound(
                &slot,
                ProtocolMessage::SessionAnnounce(announcement.clone()),
            )?;
            (announcement, outbound)
        };

        let delivered = self.deliver(outbound).await;
        log::info!(
            "Announced session {} to {}/{} co-signers",
            session_id,
            delivered,
            announcement.required_signers - 1
        );
        Ok(announcement)
    }

    /// Join a session we were invited to
    pub async fn join_session(
        &self,
        announcement: SessionAnnouncement,
        my_key: Arc<KeyPair>,
    ) -> Result<String> {
        self.ensure_running()?;
        announcement.verify(Utc::now())?;

        let my_public_key = my_key.public_key_hex();
        if !announcement.signers.contains(&my_public_key) {
            return Err(CoordinatorError::InvalidSession(format!(
                "not a signer of session {}",
                announcement.session_id
            )));
        }

        let id = announcement.session_id.clone();
        if self.sessions.read().await.contains_key(&id) {
            return Ok(id);
        }

        let local_peer = self.local_peer_id().to_string();
        let keys: BTreeSet<String> = announcement.signers.iter().cloned().collect();
        let participants = self
            .resolve_participants(
                &keys,
                &my_public_key,
                &local_peer,
                Some((
                    &announcement.coordinator_public_key,
                    &announcement.coordinator_peer_id,
                )),
            )
            .await;

        let session = WalletSigningSession::new(
            id.clone(),
            false,
            announcement.coordinator_peer_id.clone(),
            announcement.coordinator_public_key.clone(),
            participants,
            announcement.message_hex.clone(),
            announcement.metadata.clone(),
            announcement.expires_at,
        )?;

        let join = ProtocolMessage::SessionJoin {
            session_id: id.clone(),
            public_key: my_public_key,
            peer_id: local_peer.clone(),
        };
        let outbound = Outbound {
            recipients: vec![(
                announcement.coordinator_peer_id.clone(),
                announcement.coordinator_public_key.clone(),
            )],
            envelope: Envelope::seal(&local_peer, &my_key, join)?,
        };

        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&id) {
                return Ok(id);
            }
            sessions.insert(
                id.clone(),
                Arc::new(Mutex::new(SessionSlot {
                    session,
                    key: my_key,
                })),
            );
        }
        self.announcements.write().await.remove(&id);

        if self.deliver(outbound).await == 0 {
            log::warn!(
                "Join for session {} did not reach coordinator {}",
                id,
                announcement.coordinator_peer_id
            );
        }
        log::info!("Joined signing session {}", id);
        Ok(id)
    }

    /// Invitations received and not yet joined
    pub async fn pending_announcements(&self) -> Vec<SessionAnnouncement> {
        self.announcements.read().await.values().cloned().collect()
    }

    /// Poll until every participant has joined. Returns whether they did.
    pub async fn wait_for_participants(
        &self,
        session_id: &str,
        schedule: &PollSchedule,
    ) -> Result<bool> {
        self.slot(session_id).await?;
        let joined = schedule
            .poll(move || async move {
                match self.get_session(session_id).await {
                    Ok(session) if session.all_joined() => Some(()),
                    _ => None,
                }
            })
            .await;
        Ok(joined.is_some())
    }

    /// Wait until `condition` holds for the session, re-checking on every
    /// session event. Fails if the session ends first or `timeout` passes.
    pub async fn wait_until<F>(
        &self,
        session_id: &str,
        timeout: std::time::Duration,
        condition: F,
    ) -> Result<WalletSigningSession>
    where
        F: Fn(&WalletSigningSession) -> bool,
    {
        let mut events = self.events();
        let wait = async {
            loop {
                let session = self.get_session(session_id).await?;
                if condition(&session) {
                    return Ok(session);
                }
                if session.state.is_terminal() {
                    return Err(CoordinatorError::SessionClosed {
                        session_id: session_id.to_string(),
                        state: session.state,
                    });
                }
                loop {
                    match events.recv().await {
                        Some(event) if event.session_id() == session_id => break,
                        Some(_) => continue,
                        None => return Err(CoordinatorError::NotInitialized("session events")),
                    }
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            CoordinatorError::SessionNotReady(format!("{} timed out waiting", session_id))
        })?
    }

    /// Run key aggregation if needed, generate our nonce and send it to
    /// every co-signer. Returns our public nonce.
    pub async fn share_nonces(&self, session_id: &str) -> Result<String> {
        let slot = self.slot(session_id).await?;
        let (nonce, outbound) = {
            let mut guard = slot.lock().await;
            let slot = &mut *guard;
            self.check_active(&mut slot.session)?;
            let session = &mut slot.session;
            let my_public_key = slot.key.public_key_hex();

            if session.state == SessionState::Created {
                if !session.all_joined() {
                    return Err(CoordinatorError::InsufficientParticipants {
                        needed: session.participants.len(),
                        available: session.joined_count(),
                    });
                }
                session.transition(SessionState::KeyAggregation)?;
                let aggregated = match self.backend.aggregate_keys(&session.public_keys()) {
                    Ok(aggregated) => aggregated,
                    Err(e) => {
                        session.terminate(SessionState::Failed, &e.to_string())?;
                        self.publish(session);
                        return Err(e);
                    }
                };
                session.aggregated_key = Some(aggregated);
                session.transition(SessionState::KeysAggregated)?;
                session.transition(SessionState::NonceExchange)?;
            }

            let nonce = match session.nonces.get(&my_public_key) {
                Some(existing) => existing.clone(),
                None => {
                    let nonce = self.backend.generate_nonce(session_id, &slot.key)?;
                    session.record_nonce(&my_public_key, &nonce)?;
                    session.advance_nonce_round()?;
                    nonce
                }
            };
            self.publish(session);

            let outbound = self.outbound(
                slot,
                ProtocolMessage::Nonce {
                    session_id: session_id.to_string(),
                    public_key: my_public_key,
                    nonce: nonce.clone(),
                },
            )?;
            (nonce, outbound)
        };

        self.deliver(outbound).await;
        Ok(nonce)
    }

    /// Record a co-signer's public nonce
    pub async fn receive_nonce(&self, session_id: &str, public_key: &str, nonce: &str) -> Result<()> {
        self.apply_nonce(session_id, public_key, nonce, None).await
    }

    async fn apply_nonce(
        &self,
        session_id: &str,
        public_key: &str,
        nonce: &str,
        from_peer: Option<&str>,
    ) -> Result<()> {
        let slot = self.slot(session_id).await?;
        let mut slot = slot.lock().await;
        let session = &mut slot.session;
        self.check_active(session)?;

        session.record_nonce(public_key, nonce)?;
        if let Some(peer_id) = from_peer {
            session.mark_joined(public_key, Some(peer_id))?;
        }
        log::debug!("Session {}: nonce from {}", session_id, short(public_key));

        self.events.emit(SessionEvent::ParticipantUpdated {
            session_id: session_id.to_string(),
            public_key: public_key.to_string(),
        });
        self.publish(session);
        Ok(())
    }

    /// Produce our partial signature and send it to every co-signer
    pub async fn share_partial_signature(&self, session_id: &str) -> Result<String> {
        let slot = self.slot(session_id).await?;
        let (partial, outbound) = {
            let mut guard = slot.lock().await;
            let slot = &mut *guard;
            self.check_active(&mut slot.session)?;
            let session = &mut slot.session;
            let my_public_key = slot.key.public_key_hex();

            let partial = match session.state {
                SessionState::NoncesExchanged => {
                    let context = signing_context(session)?;
                    let partial = self.backend.partial_sign(&slot.key, &context)?;
                    session.transition(SessionState::Signing)?;
                    session.record_partial_signature(&my_public_key, &partial)?;
                    self.publish(session);
                    partial
                }
                SessionState::Signing => session
                    .partial_signatures
                    .get(&my_public_key)
                    .cloned()
                    .ok_or_else(|| {
                        CoordinatorError::InvalidSession(format!(
                            "session {} is signing without our partial signature",
                            session_id
                        ))
                    })?,
                state => {
                    return Err(CoordinatorError::OutOfOrderProtocolMessage(format!(
                        "session {} is {}; nonces must be exchanged before signing",
                        session_id, state
                    )))
                }
            };

            let outbound = self.outbound(
                slot,
                ProtocolMessage::PartialSignature {
                    session_id: session_id.to_string(),
                    public_key: my_public_key,
                    partial: partial.clone(),
                },
            )?;
            (partial, outbound)
        };

        self.deliver(outbound).await;
        Ok(partial)
    }

    /// Record a co-signer's partial signature. Rejected when that co-signer's
    /// nonce is not known yet.
    pub async fn receive_partial_signature(
        &self,
        session_id: &str,
        public_key: &str,
        partial: &str,
    ) -> Result<()> {
        let slot = self.slot(session_id).await?;
        let mut slot = slot.lock().await;
        let session = &mut slot.session;
        self.check_active(session)?;

        session.record_partial_signature(public_key, partial)?;
        log::debug!(
            "Session {}: partial signature from {}",
            session_id,
            short(public_key)
        );
        self.events.emit(SessionEvent::ParticipantUpdated {
            session_id: session_id.to_string(),
            public_key: public_key.to_string(),
        });
        Ok(())
    }

    /// True iff every participant has supplied a partial signature
    pub async fn can_finalize_session(&self, session_id: &str) -> Result<bool> {
        Ok(self.get_session(session_id).await?.can_finalize())
    }

    /// Aggregate the partial signatures into the final signature.
    ///
    /// Calling this again on a completed session returns the same signature.
    pub async fn finalize_session(&self, session_id: &str) -> Result<String> {
        let slot = self.slot(session_id).await?;
        let mut slot = slot.lock().await;
        let session = &mut slot.session;

        if session.state == SessionState::Completed {
            return session.final_signature.clone().ok_or_else(|| {
                CoordinatorError::InvalidSession(format!(
                    "completed session {} has no signature",
                    session_id
                ))
            });
        }
        self.check_active(session)?;

        if !session.can_finalize() || session.state != SessionState::Signing {
            return Err(CoordinatorError::SessionNotReady(format!(
                "{} has {}/{} partial signatures",
                session_id,
                session.partial_signatures.len(),
                session.participants.len()
            )));
        }

        let context = signing_context(session)?;
        let signature = match self
            .backend
            .aggregate_signatures(&context, &session.partial_signatures)
        {
            Ok(signature) => signature,
            Err(e) => {
                log::warn!("Session {} failed to aggregate: {}", session_id, e);
                session.terminate(
                    SessionState::Failed,
                    &format!("signature aggregation failed: {}", e),
                )?;
                self.backend.forget(session_id);
                self.publish(session);
                return Err(e);
            }
        };
        session.final_signature = Some(signature.clone());
        session.transition(SessionState::Completed)?;
        self.backend.forget(session_id);
        self.publish(session);

        log::info!("Session {} completed", session_id);
        Ok(signature)
    }

    /// Abort a session and tell the co-signers. The local state change
    /// stands even if nobody hears about it.
    pub async fn abort_session(&self, session_id: &str, reason: &str) -> Result<()> {
        let slot = self.slot(session_id).await?;
        let outbound = {
            let mut guard = slot.lock().await;
            let slot = &mut *guard;
            let session = &mut slot.session;
            if session.state.is_terminal() {
                return Err(CoordinatorError::SessionClosed {
                    session_id: session_id.to_string(),
                    state: session.state,
                });
            }

            let reason = if reason.trim().is_empty() {
                "aborted"
            } else {
                reason
            };
            session.terminate(SessionState::Aborted, reason)?;
            self.backend.forget(session_id);
            self.publish(session);
            log::warn!("Session {} aborted: {}", session_id, reason);

            self.outbound(
                slot,
                ProtocolMessage::SessionAbort {
                    session_id: session_id.to_string(),
                    reason: reason.to_string(),
                },
            )?
        };

        self.deliver(outbound).await;
        Ok(())
    }

    /// Snapshot of one session. An overdue session is failed first.
    pub async fn get_session(&self, session_id: &str) -> Result<WalletSigningSession> {
        let slot = self.slot(session_id).await?;
        let mut slot = slot.lock().await;
        self.expire_if_due(&mut slot.session);
        Ok(slot.session.clone())
    }

    /// Snapshots of every session, terminal ones included
    pub async fn get_all_sessions(&self) -> Vec<WalletSigningSession> {
        let slots: Vec<SlotRef> = self.sessions.read().await.values().cloned().collect();
        let mut sessions = Vec::with_capacity(slots.len());
        for slot in slots {
            let mut slot = slot.lock().await;
            self.expire_if_due(&mut slot.session);
            sessions.push(slot.session.clone());
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    /// Fail every overdue session. Returns how many were failed.
    pub async fn expire_sessions(&self) -> usize {
        let slots: Vec<SlotRef> = self.sessions.read().await.values().cloned().collect();
        let mut expired = 0;
        for slot in slots {
            if self.expire_if_due(&mut slot.lock().await.session) {
                expired += 1;
            }
        }
        expired
    }

    /// Dispatch an inbound envelope
    pub async fn handle_envelope(&self, envelope: Envelope) -> Result<()> {
        self.ensure_running()?;
        let body = envelope.open()?;
        log::debug!(
            "Received {} from {}",
            body.type_name(),
            envelope.from_peer
        );

        match body {
            ProtocolMessage::SessionAnnounce(announcement) => {
                if envelope.from_peer != announcement.coordinator_peer_id
                    || envelope.sender_key != announcement.coordinator_public_key
                {
                    return Err(CoordinatorError::InvalidMessage(format!(
                        "announcement for {} not sent by its coordinator",
                        announcement.session_id
                    )));
                }
                if self.sessions.read().await.contains_key(&announcement.session_id) {
                    return Ok(());
                }
                announcement.verify(Utc::now())?;
                self.announcements
                    .write()
                    .await
                    .insert(announcement.session_id.clone(), announcement.clone());
                self.events
                    .emit(SessionEvent::Announced(announcement.clone()));
                Ok(())
            }
            ProtocolMessage::SessionJoin {
                session_id,
                public_key,
                peer_id,
            } => {
                require_sender(&envelope, public_key)?;
                self.apply_join(session_id, public_key, peer_id).await
            }
            ProtocolMessage::SessionRoster { session_id, joined } => {
                self.apply_roster(&envelope, session_id, joined).await
            }
            ProtocolMessage::Nonce {
                session_id,
                public_key,
                nonce,
            } => {
                require_sender(&envelope, public_key)?;
                self.apply_nonce(session_id, public_key, nonce, Some(&envelope.from_peer))
                    .await
            }
            ProtocolMessage::PartialSignature {
                session_id,
                public_key,
                partial,
            } => {
                require_sender(&envelope, public_key)?;
                self.receive_partial_signature(session_id, public_key, partial)
                    .await
            }
            ProtocolMessage::SessionAbort { session_id, reason } => {
                self.apply_remote_abort(&envelope, session_id, reason).await
            }
            ProtocolMessage::Ping(_) | ProtocolMessage::Pong(_) => Ok(()),
        }
    }

    async fn apply_join(&self, session_id: &str, public_key: &str, peer_id: &str) -> Result<()> {
        let slot = self.slot(session_id).await?;
        let outbound = {
            let mut guard = slot.lock().await;
            let slot = &mut *guard;
            self.check_active(&mut slot.session)?;
            let newly_joined = slot.session.mark_joined(public_key, Some(peer_id))?;
            if newly_joined {
                log::info!(
                    "Session {}: {} joined ({}/{})",
                    session_id,
                    short(public_key),
                    slot.session.joined_count(),
                    slot.session.participants.len()
                );
                self.events.emit(SessionEvent::ParticipantUpdated {
                    session_id: session_id.to_string(),
                    public_key: public_key.to_string(),
                });
            }

            if slot.session.is_initiator {
                let joined = slot
                    .session
                    .participants
                    .iter()
                    .filter(|p| p.has_joined)
                    .map(|p| RosterEntry {
                        public_key: p.public_key_hex.clone(),
                        peer_id: p.peer_id.clone(),
                    })
                    .collect();
                Some(self.outbound(
                    slot,
                    ProtocolMessage::SessionRoster {
                        session_id: session_id.to_string(),
                        joined,
                    },
                )?)
            } else {
                None
            }
        };

        if let Some(outbound) = outbound {
            self.deliver(outbound).await;
        }
        Ok(())
    }

    async fn apply_roster(
        &self,
        envelope: &Envelope,
        session_id: &str,
        joined: &[RosterEntry],
    ) -> Result<()> {
        let slot = self.slot(session_id).await?;
        let mut slot = slot.lock().await;
        let session = &mut slot.session;
        self.check_active(session)?;
        if envelope.sender_key != session.coordinator_public_key {
            return Err(CoordinatorError::InvalidMessage(format!(
                "roster for {} not sent by its coordinator",
                session_id
            )));
        }

        for entry in joined {
            match session.mark_joined(&entry.public_key, entry.peer_id.as_deref()) {
                Ok(true) => self.events.emit(SessionEvent::ParticipantUpdated {
                    session_id: session_id.to_string(),
                    public_key: entry.public_key.clone(),
                }),
                Ok(false) => {}
                Err(e) => log::warn!("Ignoring roster entry: {}", e),
            }
        }
        Ok(())
    }

    async fn apply_remote_abort(
        &self,
        envelope: &Envelope,
        session_id: &str,
        reason: &str,
    ) -> Result<()> {
        let slot = self.slot(session_id).await?;
        let mut slot = slot.lock().await;
        let session = &mut slot.session;
        if session.participant(&envelope.sender_key).is_none() {
            return Err(CoordinatorError::InvalidMessage(format!(
                "abort for {} from a non-participant",
                session_id
            )));
        }
        if session.state.is_terminal() {
            return Ok(());
        }

        let reason = format!("aborted by {}: {}", envelope.from_peer, reason);
        session.terminate(SessionState::Aborted, &reason)?;
        self.backend.forget(session_id);
        self.publish(session);
        log::warn!("Session {} {}", session_id, reason);
        Ok(())
    }

    /// Fail the session if it has run out of time. Returns whether it did.
    fn expire_if_due(&self, session: &mut WalletSigningSession) -> bool {
        if session.state.is_terminal() || !session.is_expired_at(Utc::now()) {
            return false;
        }
        if session.terminate(SessionState::Failed, EXPIRED_REASON).is_err() {
            return false;
        }
        self.backend.forget(&session.id);
        self.publish(session);
        log::warn!("Session {} expired", session.id);
        true
    }

    /// Gate for protocol steps: the session must be live and in time
    fn check_active(&self, session: &mut WalletSigningSession) -> Result<()> {
        if self.expire_if_due(session) {
            return Err(CoordinatorError::SessionExpired(session.id.clone()));
        }
        if session.state.is_terminal() {
            if session.state == SessionState::Failed
                && session.reason.as_deref() == Some(EXPIRED_REASON)
            {
                return Err(CoordinatorError::SessionExpired(session.id.clone()));
            }
            return Err(CoordinatorError::SessionClosed {
                session_id: session.id.clone(),
                state: session.state,
            });
        }
        Ok(())
    }

    /// Emit events for the transitions recorded on `session`
    fn publish(&self, session: &mut WalletSigningSession) {
        for (from, to) in session.take_transitions() {
            log::info!("Session {}: {} -> {}", session.id, from, to);
            self.events.emit(SessionEvent::StateChanged {
                session_id: session.id.clone(),
                from,
                to,
            });
            if to.is_terminal() && to != SessionState::Completed {
                self.events.emit(SessionEvent::Terminated {
                    session_id: session.id.clone(),
                    state: to,
                    reason: session.reason.clone().unwrap_or_default(),
                });
            }
        }
    }

    fn outbound(&self, slot: &SessionSlot, body: ProtocolMessage) -> Result<Outbound> {
        let recipients = slot
            .session
            .remote_participants()
            .filter_map(|p| {
                p.peer_id
                    .as_ref()
                    .map(|peer| (peer.clone(), p.public_key_hex.clone()))
            })
            .collect();
        Ok(Outbound {
            recipients,
            envelope: Envelope::seal(self.local_peer_id(), &slot.key, body)?,
        })
    }

    /// Send to all recipients concurrently, dialing where needed. Returns
    /// how many deliveries succeeded.
    async fn deliver(&self, outbound: Outbound) -> usize {
        let targets: Vec<DialTarget> = {
            let cache = self.cache.read().await;
            outbound
                .recipients
                .iter()
                .map(|(peer_id, public_key)| {
                    let multiaddrs = cache
                        .get_by_public_key(public_key)
                        .filter(|ad| &ad.peer_id == peer_id)
                        .map(|ad| ad.multiaddrs.clone())
                        .unwrap_or_default();
                    DialTarget::new(peer_id, multiaddrs)
                })
                .collect()
        };

        let kind = outbound.envelope.body.type_name();
        let sends = targets.iter().map(|target| {
            let envelope = outbound.envelope.clone();
            async move {
                if !self
                    .transport
                    .connection_state(&target.peer_id)
                    .await
                    .is_connected()
                {
                    self.transport.connect(target).await?;
                }
                self.transport.send(&target.peer_id, envelope).await
            }
        });

        let results = join_all(sends).await;
        let mut delivered = 0;
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => log::warn!("Could not send {} to {}: {}", kind, target.peer_id, e),
            }
        }
        delivered
    }
}

fn signing_context(session: &WalletSigningSession) -> Result<SigningContext> {
    let aggregated_key = session.aggregated_key.clone().ok_or_else(|| {
        CoordinatorError::InvalidSession(format!("session {} has no aggregate key", session.id))
    })?;
    Ok(SigningContext {
        session_id: session.id.clone(),
        message: session.message_bytes()?,
        aggregated_key,
        nonces: session.nonces.clone(),
    })
}

/// Nonces and partial signatures must be signed by the key they report for
fn require_sender(envelope: &Envelope, public_key: &str) -> Result<()> {
    if envelope.sender_key == public_key {
        Ok(())
    } else {
        Err(CoordinatorError::InvalidMessage(format!(
            "peer {} reported for key {} it does not hold",
            envelope.from_peer,
            short(public_key)
        )))
    }
}

fn short(public_key: &str) -> &str {
    public_key.get(..16).unwrap_or(public_key)
}
