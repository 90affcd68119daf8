//! Signing node
//!
//! Wires the transport, discovery service, session coordinator and
//! connectivity monitor together and runs the background loops that feed
//! them. Its lifecycle follows the wallet's P2P connection: `start` when
//! connected, `stop` on disconnect or logout.

use crate::config::CoordinatorConfig;
use crate::crypto::KeyPair;
use crate::discovery::{DiscoveryCache, DiscoveryService, LocalPeer, SignerDirectory};
use crate::error::{CoordinatorError, Result};
use crate::events::SessionEvent;
use crate::network::{ConnectivityMonitor, Envelope, PeerTransport, ProtocolMessage};
use crate::session::{MusigBackend, SessionCoordinator};
use crate::storage::SessionStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

pub struct SigningNode {
    config: CoordinatorConfig,
    identity: Arc<KeyPair>,
    transport: Arc<dyn PeerTransport>,
    /// Parked here while the inbound loop is not running
    inbound: Mutex<Option<mpsc::Receiver<Envelope>>>,
    coordinator: Arc<SessionCoordinator>,
    discovery: Arc<DiscoveryService>,
    connectivity: Arc<ConnectivityMonitor>,
    store: Option<SessionStore>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    inbound_task: Mutex<Option<JoinHandle<mpsc::Receiver<Envelope>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl SigningNode {
    pub fn new(
        config: CoordinatorConfig,
        identity: Arc<KeyPair>,
        transport: Arc<dyn PeerTransport>,
        inbound_rx: mpsc::Receiver<Envelope>,
        directory: Arc<dyn SignerDirectory>,
        backend: Arc<dyn MusigBackend>,
    ) -> Self {
        let cache = Arc::new(RwLock::new(DiscoveryCache::new()));
        let local = LocalPeer {
            peer_id: transport.local_peer_id().to_string(),
            multiaddrs: transport.listen_addrs(),
            identity: identity.clone(),
        };

        let discovery = Arc::new(DiscoveryService::new(
            local,
            directory,
            cache.clone(),
            config.clone(),
        ));
        let coordinator = Arc::new(SessionCoordinator::new(
            transport.clone(),
            cache.clone(),
            backend,
            config.clone(),
        ));
        let connectivity = Arc::new(ConnectivityMonitor::new(
            transport.clone(),
            coordinator.clone(),
            cache,
            config.clone(),
        ));

        Self {
            config,
            identity,
            transport,
            inbound: Mutex::new(Some(inbound_rx)),
            coordinator,
            discovery,
            connectivity,
            store: None,
            shutdown_tx: Mutex::new(None),
            inbound_task: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Persist session history in `store`
    pub fn with_session_store(mut self, store: SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Start all services and background loops
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let inbound = match self.inbound.lock().await.take() {
            Some(inbound) => inbound,
            None => {
                self.running.store(false, Ordering::SeqCst);
                return Err(CoordinatorError::NotInitialized("inbound envelope stream"));
            }
        };

        self.coordinator.start();
        self.discovery.start().await;

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.lock().await = Some(shutdown_tx);
        *self.inbound_task.lock().await = Some(self.spawn_inbound(inbound, shutdown_rx));

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.spawn_expiry_sweep());
        if let Some(store) = &self.store {
            tasks.push(self.spawn_history_writer(store.clone()));
        }

        log::info!(
            "Signing node {} started (key {})",
            self.peer_id(),
            self.identity.public_key_hex()
        );
        Ok(())
    }

    /// Stop everything, withdraw our advertisement and save session history
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(shutdown_tx) = self.shutdown_tx.lock().await.take() {
            let _ = shutdown_tx.send(()).await;
        }
        if let Some(task) = self.inbound_task.lock().await.take() {
            match task.await {
                Ok(inbound) => *self.inbound.lock().await = Some(inbound),
                Err(e) => log::error!("Inbound loop ended abnormally: {}", e),
            }
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        self.discovery.stop().await;
        let sessions = self.coordinator.stop().await;
        if let Some(store) = &self.store {
            store.save_all(&sessions)?;
        }

        log::info!("Signing node {} stopped", self.peer_id());
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn spawn_inbound(
        &self,
        mut inbound: mpsc::Receiver<Envelope>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> JoinHandle<mpsc::Receiver<Envelope>> {
        let coordinator = self.coordinator.clone();
        let transport = self.transport.clone();
        let identity = self.identity.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    envelope = inbound.recv() => {
                        let envelope = match envelope {
                            Some(envelope) => envelope,
                            None => break,
                        };
                        if let ProtocolMessage::Ping(nonce) = &envelope.body {
                            if let Err(e) = envelope.open() {
                                log::debug!("Dropping ping from {}: {}", envelope.from_peer, e);
                                continue;
                            }
                            let pong = Envelope::seal(
                                transport.local_peer_id(),
                                &identity,
                                ProtocolMessage::Pong(*nonce),
                            );
                            match pong {
                                Ok(pong) => {
                                    if let Err(e) = transport.send(&envelope.from_peer, pong).await {
                                        log::debug!("Pong to {} failed: {}", envelope.from_peer, e);
                                    }
                                }
                                Err(e) => log::error!("Failed to seal pong: {}", e),
                            }
                            continue;
                        }

                        let kind = envelope.body.type_name();
                        let from = envelope.from_peer.clone();
                        if let Err(e) = coordinator.handle_envelope(envelope).await {
                            log::warn!("Rejected {} from {}: {}", kind, from, e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        log::debug!("Inbound loop shutting down");
                        break;
                    }
                }
            }
            inbound
        })
    }

    fn spawn_expiry_sweep(&self) -> JoinHandle<()> {
        let coordinator = self.coordinator.clone();
        let period = self.config.monitor_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let expired = coordinator.expire_sessions().await;
                if expired > 0 {
                    log::info!("Expired {} signing sessions", expired);
                }
            }
        })
    }

    /// Save a session whenever it reaches a terminal state
    fn spawn_history_writer(&self, store: SessionStore) -> JoinHandle<()> {
        let coordinator = self.coordinator.clone();
        let mut events = coordinator.events();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let SessionEvent::StateChanged { session_id, to, .. } = event {
                    if !to.is_terminal() {
                        continue;
                    }
                    match coordinator.get_session(&session_id).await {
                        Ok(session) => {
                            if let Err(e) = store.save(&session) {
                                log::error!("Failed to save session {}: {}", session_id, e);
                            }
                        }
                        Err(e) => log::debug!("Session {} gone before save: {}", session_id, e),
                    }
                }
            }
        })
    }

    pub fn peer_id(&self) -> &str {
        self.transport.local_peer_id()
    }

    pub fn identity(&self) -> Arc<KeyPair> {
        self.identity.clone()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn transport(&self) -> Arc<dyn PeerTransport> {
        self.transport.clone()
    }

    pub fn coordinator(&self) -> Arc<SessionCoordinator> {
        self.coordinator.clone()
    }

    pub fn discovery(&self) -> Arc<DiscoveryService> {
        self.discovery.clone()
    }

    pub fn connectivity(&self) -> Arc<ConnectivityMonitor> {
        self.connectivity.clone()
    }

    pub fn session_store(&self) -> Option<&SessionStore> {
        self.store.as_ref()
    }
}
