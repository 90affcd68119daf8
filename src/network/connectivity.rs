//! Connectivity preflight and session connection monitoring
//!
//! Signing is n-of-n, so one unreachable co-signer blocks the whole session.
//! This module checks reachability before protocol rounds start, dials with
//! exponential backoff, and watches live sessions for dropped participants.

use crate::config::CoordinatorConfig;
use crate::discovery::DiscoveryCache;
use crate::error::{CoordinatorError, Result};
use crate::network::retry::RetryPolicy;
use crate::network::transport::{ConnectionState, DialTarget, PeerTransport};
use crate::session::{ParticipantRecord, SessionCoordinator};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Abort reason used when a co-signer cannot be reached again
pub const PARTICIPANT_DISCONNECTED: &str = "participant-disconnected";

/// A co-signer as seen by the connectivity checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantRef {
    pub public_key_hex: String,
    pub peer_id: Option<String>,
    pub nickname: Option<String>,
}

impl From<&ParticipantRecord> for ParticipantRef {
    fn from(record: &ParticipantRecord) -> Self {
        Self {
            public_key_hex: record.public_key_hex.clone(),
            peer_id: record.peer_id.clone(),
            nickname: record.nickname.clone(),
        }
    }
}

/// Outcome of a preflight over all remote participants
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreflightReport {
    pub all_reachable: bool,
    pub already_connected: Vec<ParticipantRef>,
    pub newly_connected: Vec<ParticipantRef>,
    pub unreachable: Vec<ParticipantRef>,
}

impl PreflightReport {
    pub fn reachable(&self) -> impl Iterator<Item = &ParticipantRef> {
        self.already_connected.iter().chain(self.newly_connected.iter())
    }
}

/// Outcome of connecting to a batch of peers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectSummary {
    pub connected: Vec<String>,
    pub failed: Vec<String>,
}

impl ConnectSummary {
    pub fn all_connected(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of [`ConnectivityMonitor::connect_with_retry`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome {
    pub connected: bool,
    /// Dial attempts made, including the successful one
    pub attempts: u32,
    /// Backoff delays waited after failed attempts
    pub delays: Vec<Duration>,
    pub last_error: Option<String>,
}

/// What the application wants done about a lost co-signer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Try to reconnect once more with the full retry policy
    Retry,
    /// Give up and abort the session
    Abandon,
}

/// Application hook consulted before a session is abandoned
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    async fn on_participant_lost(&self, session_id: &str, peer_id: &str) -> RecoveryDecision;
}

/// How a connection failure was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Reconnected,
    /// Reconnected after the recovery handler asked for a retry
    Recovered,
    Aborted,
}

pub struct ConnectivityMonitor {
    transport: Arc<dyn PeerTransport>,
    coordinator: Arc<SessionCoordinator>,
    cache: Arc<RwLock<DiscoveryCache>>,
    config: CoordinatorConfig,
}

impl ConnectivityMonitor {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        coordinator: Arc<SessionCoordinator>,
        cache: Arc<RwLock<DiscoveryCache>>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            transport,
            coordinator,
            cache,
            config,
        }
    }

    /// Build a dial target from what discovery knows about a co-signer
    async fn dial_target(&self, peer_id: &str, public_key_hex: Option<&str>) -> DialTarget {
        let cache = self.cache.read().await;
        let advertisement = match public_key_hex {
            Some(key) => cache.get_by_public_key(key).cloned(),
            None => None,
        }
        .filter(|ad| ad.peer_id == peer_id)
        .or_else(|| {
            cache
                .valid_signers()
                .into_iter()
                .find(|ad| ad.peer_id == peer_id)
                .cloned()
        });

        DialTarget::new(
            peer_id,
            advertisement.map(|ad| ad.multiaddrs).unwrap_or_default(),
        )
    }

    async fn resolve_peer_id(&self, participant: &ParticipantRecord) -> Option<String> {
        if participant.peer_id.is_some() {
            return participant.peer_id.clone();
        }
        self.cache
            .read()
            .await
            .get_by_public_key(&participant.public_key_hex)
            .map(|ad| ad.peer_id.clone())
    }

    /// Try to reach every participant except ourselves. Never fails; the
    /// report says who could not be reached.
    pub async fn preflight_signing_session(
        &self,
        participants: &[ParticipantRecord],
    ) -> PreflightReport {
        let checks = participants.iter().filter(|p| !p.is_me).map(|participant| async move {
            let mut reference = ParticipantRef::from(participant);
            let peer_id = match self.resolve_peer_id(participant).await {
                Some(peer_id) => peer_id,
                None => return (reference, None),
            };
            reference.peer_id = Some(peer_id.clone());

            if self.transport.connection_state(&peer_id).await.is_connected() {
                return (reference, Some(false));
            }
            let target = self
                .dial_target(&peer_id, Some(&participant.public_key_hex))
                .await;
            match self.transport.connect(&target).await {
                Ok(()) => (reference, Some(true)),
                Err(e) => {
                    log::debug!("Preflight: {} unreachable: {}", peer_id, e);
                    (reference, None)
                }
            }
        });

        let mut report = PreflightReport::default();
        for (participant, outcome) in join_all(checks).await {
            match outcome {
                Some(false) => report.already_connected.push(participant),
                Some(true) => report.newly_connected.push(participant),
                None => report.unreachable.push(participant),
            }
        }
        report.all_reachable = report.unreachable.is_empty();

        log::info!(
            "Preflight: {} connected, {} new, {} unreachable",
            report.already_connected.len(),
            report.newly_connected.len(),
            report.unreachable.len()
        );
        report
    }

    /// Preflight over the participants of an existing session
    pub async fn preflight_session(&self, session_id: &str) -> Result<PreflightReport> {
        let session = self.coordinator.get_session(session_id).await?;
        Ok(self.preflight_signing_session(&session.participants).await)
    }

    /// Dial all peers that are not connected yet, concurrently, and wait
    /// for every attempt to finish
    pub async fn ensure_participants_connected(&self, peer_ids: &[String]) -> ConnectSummary {
        let attempts = peer_ids.iter().map(|peer_id| async move {
            if self.transport.connection_state(peer_id).await.is_connected() {
                return (peer_id.clone(), true);
            }
            let target = self.dial_target(peer_id, None).await;
            match self.transport.connect(&target).await {
                Ok(()) => (peer_id.clone(), true),
                Err(e) => {
                    log::debug!("Could not connect to {}: {}", peer_id, e);
                    (peer_id.clone(), false)
                }
            }
        });

        let mut summary = ConnectSummary::default();
        for (peer_id, connected) in join_all(attempts).await {
            if connected {
                summary.connected.push(peer_id);
            } else {
                summary.failed.push(peer_id);
            }
        }
        summary
    }

    /// Dial with exponential backoff. A delay follows every failed attempt.
    pub async fn connect_with_retry(&self, target: &DialTarget, policy: &RetryPolicy) -> RetryOutcome {
        let mut outcome = RetryOutcome {
            connected: false,
            attempts: 0,
            delays: Vec::new(),
            last_error: None,
        };

        for attempt in 1..=policy.max_retries.max(1) {
            outcome.attempts = attempt;
            match self.transport.connect(target).await {
                Ok(()) => {
                    if attempt > 1 {
                        log::info!("Connected to {} after {} attempts", target.peer_id, attempt);
                    }
                    outcome.connected = true;
                    outcome.last_error = None;
                    return outcome;
                }
                Err(e) => {
                    let delay = policy.delay_for(attempt);
                    log::debug!(
                        "Connect to {} failed (attempt {}), retrying in {:?}: {}",
                        target.peer_id,
                        attempt,
                        delay,
                        e
                    );
                    outcome.last_error = Some(e.to_string());
                    outcome.delays.push(delay);
                    sleep(delay).await;
                }
            }
        }

        log::warn!(
            "Giving up on {} after {} attempts",
            target.peer_id,
            outcome.attempts
        );
        outcome
    }

    /// Watch a session's participants until the session ends or the handle
    /// is dropped
    pub async fn monitor_session_connections(
        self: &Arc<Self>,
        session_id: &str,
        recovery: Option<Arc<dyn RecoveryHandler>>,
    ) -> Result<MonitorHandle> {
        let session = self.coordinator.get_session(session_id).await?;
        if session.state.is_terminal() {
            return Err(CoordinatorError::SessionClosed {
                session_id: session_id.to_string(),
                state: session.state,
            });
        }

        let monitor = self.clone();
        let id = session_id.to_string();
        let period = self.config.monitor_interval();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let session = match monitor.coordinator.get_session(&id).await {
                    Ok(session) => session,
                    Err(_) => break,
                };
                if session.state.is_terminal() {
                    log::debug!("Session {} is {}, monitor stopping", id, session.state);
                    break;
                }

                for participant in session.remote_participants() {
                    let peer_id = match &participant.peer_id {
                        Some(peer_id) => peer_id,
                        None => continue,
                    };
                    let state = monitor.transport.connection_state(peer_id).await;
                    if matches!(
                        state,
                        ConnectionState::Disconnected | ConnectionState::Failed
                    ) {
                        log::warn!("Session {}: lost connection to {}", id, peer_id);
                        match monitor
                            .handle_session_connection_failure(&id, peer_id, recovery.as_deref())
                            .await
                        {
                            Ok(FailureOutcome::Aborted) => break,
                            Ok(_) => {}
                            Err(e) => log::warn!("Connection failure handling failed: {}", e),
                        }
                    }
                }
            }
        });

        log::debug!("Monitoring connections of session {}", session_id);
        Ok(MonitorHandle {
            session_id: session_id.to_string(),
            task,
        })
    }

    /// Make one bounded reconnect. If that fails, ask `recovery` (when
    /// given) whether to retry; otherwise abort the session.
    pub async fn handle_session_connection_failure(
        &self,
        session_id: &str,
        failed_peer_id: &str,
        recovery: Option<&dyn RecoveryHandler>,
    ) -> Result<FailureOutcome> {
        let session = self.coordinator.get_session(session_id).await?;
        let public_key = session
            .participants
            .iter()
            .find(|p| p.peer_id.as_deref() == Some(failed_peer_id))
            .map(|p| p.public_key_hex.clone());
        let target = self.dial_target(failed_peer_id, public_key.as_deref()).await;

        if self
            .connect_with_retry(&target, &self.config.reconnect)
            .await
            .connected
        {
            log::info!("Session {}: reconnected to {}", session_id, failed_peer_id);
            return Ok(FailureOutcome::Reconnected);
        }

        if let Some(handler) = recovery {
            if handler.on_participant_lost(session_id, failed_peer_id).await
                == RecoveryDecision::Retry
                && self
                    .connect_with_retry(&target, &self.config.connect_retry)
                    .await
                    .connected
            {
                log::info!("Session {}: recovered {}", session_id, failed_peer_id);
                return Ok(FailureOutcome::Recovered);
            }
        }

        match self
            .coordinator
            .abort_session(session_id, PARTICIPANT_DISCONNECTED)
            .await
        {
            Ok(()) | Err(CoordinatorError::SessionClosed { .. }) => Ok(FailureOutcome::Aborted),
            Err(e) => Err(e),
        }
    }
}

/// Stops the monitor when stopped or dropped
#[derive(Debug)]
pub struct MonitorHandle {
    session_id: String,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether the monitor has ended on its own
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stop(self) {
        log::debug!("Stopping connection monitor for session {}", self.session_id);
        self.task.abort();
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::discovery::{SignerAdvertisement, SignerConfig, TxTypes};
    use crate::events::SessionEvent;
    use crate::network::MemoryNetwork;
    use crate::session::{SessionState, TranscriptBackend};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        network: Arc<MemoryNetwork>,
        monitor: Arc<ConnectivityMonitor>,
        coordinator: Arc<SessionCoordinator>,
        session_id: String,
    }

    /// Alice's node with a session over Alice, Bob and Carol
    async fn fixture(config: CoordinatorConfig) -> Fixture {
        let network = MemoryNetwork::new();
        let (transport, _rx) = network.register("alice").await;
        let cache = Arc::new(RwLock::new(DiscoveryCache::new()));

        let mut keys = Vec::new();
        for name in ["bob", "carol"] {
            network.register(name).await;
            let key = KeyPair::generate();
            let ad = SignerAdvertisement::create(
                &key,
                name,
                vec![format!("/memory/{}", name)],
                &SignerConfig::new(TxTypes::SPEND).with_nickname(name),
                chrono::Duration::minutes(10),
            )
            .unwrap();
            cache.write().await.upsert(ad);
            keys.push(key.public_key_hex());
        }

        let coordinator = Arc::new(SessionCoordinator::new(
            transport.clone(),
            cache.clone(),
            Arc::new(TranscriptBackend::new()),
            config.clone(),
        ));
        coordinator.start();
        let session_id = coordinator
            .create_signing_session(
                keys,
                Arc::new(KeyPair::generate()),
                &hex::encode(b"msg"),
                BTreeMap::new(),
            )
            .await
            .unwrap();

        let monitor = Arc::new(ConnectivityMonitor::new(
            transport,
            coordinator.clone(),
            cache,
            config,
        ));
        Fixture {
            network,
            monitor,
            coordinator,
            session_id,
        }
    }

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            monitor_interval_ms: 50,
            reconnect: RetryPolicy::single(10),
            connect_retry: RetryPolicy::new(2, 10, 20),
            ..CoordinatorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_preflight_classifies_participants() {
        let fx = fixture(CoordinatorConfig::default()).await;
        fx.network.set_reachable("carol", false).await;

        let report = fx.monitor.preflight_session(&fx.session_id).await.unwrap();
        assert!(!report.all_reachable);
        assert_eq!(report.newly_connected.len(), 1);
        assert_eq!(report.newly_connected[0].nickname.as_deref(), Some("bob"));
        assert_eq!(report.unreachable.len(), 1);
        assert_eq!(report.unreachable[0].peer_id.as_deref(), Some("carol"));

        fx.network.set_reachable("carol", true).await;
        let report = fx.monitor.preflight_session(&fx.session_id).await.unwrap();
        assert!(report.all_reachable);
        assert_eq!(report.already_connected.len(), 1);
        assert_eq!(report.reachable().count(), 2);
    }

    #[tokio::test]
    async fn test_preflight_without_peer_id_is_unreachable() {
        let fx = fixture(CoordinatorConfig::default()).await;
        let stranger = ParticipantRecord::new(&KeyPair::generate().public_key_hex());

        let report = fx.monitor.preflight_signing_session(&[stranger]).await;
        assert!(!report.all_reachable);
        assert_eq!(report.unreachable[0].peer_id, None);
    }

    #[tokio::test]
    async fn test_ensure_connected_waits_for_all() {
        let fx = fixture(CoordinatorConfig::default()).await;
        fx.network.set_reachable("carol", false).await;

        let summary = fx
            .monitor
            .ensure_participants_connected(&["bob".into(), "carol".into(), "dave".into()])
            .await;
        assert_eq!(summary.connected, vec!["bob".to_string()]);
        assert_eq!(summary.failed.len(), 2);
        assert!(!summary.all_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_with_retry_backoff() {
        let fx = fixture(CoordinatorConfig::default()).await;
        fx.network.set_reachable("bob", false).await;

        let started = tokio::time::Instant::now();
        let outcome = fx
            .monitor
            .connect_with_retry(&DialTarget::peer("bob"), &RetryPolicy::new(3, 100, 1000))
            .await;

        assert!(!outcome.connected);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(
            outcome.delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
        assert_eq!(started.elapsed(), Duration::from_millis(700));
        assert_eq!(fx.network.connect_attempts("bob").await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_with_retry_succeeds_late() {
        let fx = fixture(CoordinatorConfig::default()).await;
        fx.network.set_reachable("bob", false).await;

        let network = fx.network.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(150)).await;
            network.set_reachable("bob", true).await;
        });

        let outcome = fx
            .monitor
            .connect_with_retry(&DialTarget::peer("bob"), &RetryPolicy::new(5, 100, 1000))
            .await;
        assert!(outcome.connected);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_aborts_on_lost_participant() {
        let fx = fixture(fast_config()).await;
        fx.monitor.preflight_session(&fx.session_id).await.unwrap();
        let mut events = fx.coordinator.events();

        let handle = fx
            .monitor
            .monitor_session_connections(&fx.session_id, None)
            .await
            .unwrap();
        fx.network.set_reachable("carol", false).await;

        let terminated = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(SessionEvent::Terminated { reason, .. }) = events.recv().await {
                    return reason;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(terminated, PARTICIPANT_DISCONNECTED);

        let session = fx.coordinator.get_session(&fx.session_id).await.unwrap();
        assert_eq!(session.state, SessionState::Aborted);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_finished() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_monitor_leaves_session_alone() {
        let fx = fixture(fast_config()).await;
        fx.monitor.preflight_session(&fx.session_id).await.unwrap();
        let handle = fx
            .monitor
            .monitor_session_connections(&fx.session_id, None)
            .await
            .unwrap();
        handle.stop();

        fx.network.set_reachable("carol", false).await;
        sleep(Duration::from_millis(500)).await;

        let session = fx.coordinator.get_session(&fx.session_id).await.unwrap();
        assert_eq!(session.state, SessionState::Created);
        assert!(session.reason.is_none());
    }

    struct RetryOnce {
        network: Arc<MemoryNetwork>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RecoveryHandler for RetryOnce {
        async fn on_participant_lost(&self, _session_id: &str, peer_id: &str) -> RecoveryDecision {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.network.set_reachable(peer_id, true).await;
            RecoveryDecision::Retry
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_handler_can_save_session() {
        let fx = fixture(fast_config()).await;
        fx.monitor.preflight_session(&fx.session_id).await.unwrap();
        fx.network.set_reachable("bob", false).await;

        let handler = RetryOnce {
            network: fx.network.clone(),
            calls: AtomicUsize::new(0),
        };
        let outcome = fx
            .monitor
            .handle_session_connection_failure(&fx.session_id, "bob", Some(&handler))
            .await
            .unwrap();

        assert_eq!(outcome, FailureOutcome::Recovered);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let session = fx.coordinator.get_session(&fx.session_id).await.unwrap();
        assert_eq!(session.state, SessionState::Created);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_without_handler_aborts() {
        let fx = fixture(fast_config()).await;
        fx.network.set_reachable("bob", false).await;

        let outcome = fx
            .monitor
            .handle_session_connection_failure(&fx.session_id, "bob", None)
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Aborted);

        let session = fx.coordinator.get_session(&fx.session_id).await.unwrap();
        assert_eq!(session.state, SessionState::Aborted);
        assert_eq!(session.reason.as_deref(), Some(PARTICIPANT_DISCONNECTED));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_stops_when_session_ends() {
        let fx = fixture(fast_config()).await;
        let handle = fx
            .monitor
            .monitor_session_connections(&fx.session_id, None)
            .await
            .unwrap();
        fx.coordinator
            .abort_session(&fx.session_id, "done")
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_finished() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(fx
            .monitor
            .monitor_session_connections(&fx.session_id, None)
            .await
            .is_err());
    }
}
