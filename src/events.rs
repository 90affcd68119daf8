//! Typed event streams
//!
//! Each service owns an [`EventBus`] for its outbound events. Consumers hold a
//! [`Subscription`]; dropping it or calling [`Subscription::unsubscribe`]
//! detaches the listener, so nothing leaks when a view goes away.

use crate::discovery::SignerAdvertisement;
use crate::session::{SessionAnnouncement, SessionState};
use tokio::sync::broadcast;

/// Events buffered per subscriber before the slowest one starts lagging
const EVENT_CAPACITY: usize = 256;

/// Events emitted by the session coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A session moved between states
    StateChanged {
        session_id: String,
        from: SessionState,
        to: SessionState,
    },
    /// A participant joined or reported a nonce/partial signature
    ParticipantUpdated {
        session_id: String,
        public_key: String,
    },
    /// A peer invited us to a session
    Announced(SessionAnnouncement),
    /// The session reached a terminal failure state
    Terminated {
        session_id: String,
        state: SessionState,
        reason: String,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::StateChanged { session_id, .. }
            | SessionEvent::ParticipantUpdated { session_id, .. }
            | SessionEvent::Terminated { session_id, .. } => session_id,
            SessionEvent::Announced(announcement) => &announcement.session_id,
        }
    }
}

/// Events emitted by the discovery service
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    SignerDiscovered(SignerAdvertisement),
    SignerWithdrawn { id: String, public_key: String },
}

/// Broadcast channel for one event type
#[derive(Debug)]
pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: E) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> Subscription<E> {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an event stream
#[derive(Debug)]
pub struct Subscription<E> {
    rx: broadcast::Receiver<E>,
}

impl<E: Clone> Subscription<E> {
    /// Wait for the next event. Returns `None` once the bus is gone.
    ///
    /// A subscriber that falls behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Stop listening
    pub fn unsubscribe(self) {}
}
