//! Signer discovery service
//!
//! Publishes this node's own advertisement, queries and watches the signer
//! directory, and feeds everything it learns into the [`DiscoveryCache`].

use crate::config::CoordinatorConfig;
use crate::crypto::KeyPair;
use crate::discovery::advertisement::{SignerAdvertisement, SignerConfig, SignerCriteria};
use crate::discovery::cache::{DiscoveryCache, UpsertOutcome};
use crate::discovery::directory::{DirectoryRecord, SignerDirectory};
use crate::error::{CoordinatorError, Result};
use crate::events::{DiscoveryEvent, EventBus, Subscription};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Handle returned by [`DiscoveryService::subscribe_to_signers`]
pub type SubscriptionId = u64;

/// Who we are on the network
#[derive(Debug, Clone)]
pub struct LocalPeer {
    pub peer_id: String,
    pub multiaddrs: Vec<String>,
    pub identity: Arc<KeyPair>,
}

pub struct DiscoveryService {
    local: LocalPeer,
    directory: Arc<dyn SignerDirectory>,
    cache: Arc<RwLock<DiscoveryCache>>,
    config: CoordinatorConfig,
    /// Our currently published advertisement
    own: Arc<RwLock<Option<SignerAdvertisement>>>,
    subscriptions: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
    next_subscription: AtomicU64,
    /// Sweep and refresh loops
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: Arc<EventBus<DiscoveryEvent>>,
    running: AtomicBool,
}

impl DiscoveryService {
    pub fn new(
        local: LocalPeer,
        directory: Arc<dyn SignerDirectory>,
        cache: Arc<RwLock<DiscoveryCache>>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            local,
            directory,
            cache,
            config,
            own: Arc::new(RwLock::new(None)),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
            events: Arc::new(EventBus::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Start the cache sweep and the advertisement refresh loops
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Starting signer discovery for peer {}", self.local.peer_id);

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.spawn_sweep());
        tasks.push(self.spawn_refresh());
    }

    /// Stop background work, end all subscriptions and withdraw our advertisement
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        for (_, task) in self.subscriptions.lock().await.drain() {
            task.abort();
        }

        if let Some(own) = self.own.write().await.take() {
            if let Err(e) = self.directory.withdraw(&own.id).await {
                log::warn!("Failed to withdraw advertisement {}: {}", own.id, e);
            }
        }
        log::info!("Stopped signer discovery");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(CoordinatorError::NotInitialized("discovery service"))
        }
    }

    /// Publish this node as an available co-signer
    pub async fn advertise_signer(&self, signer: SignerConfig) -> Result<SignerAdvertisement> {
        self.ensure_running()?;

        let advertisement = SignerAdvertisement::create(
            &self.local.identity,
            &self.local.peer_id,
            self.local.multiaddrs.clone(),
            &signer,
            self.config.advertisement_ttl(),
        )?;

        // A previous advertisement with a different id would linger otherwise
        let previous = self.own.read().await.clone();
        if let Some(previous) = previous {
            if previous.id != advertisement.id {
                self.directory.withdraw(&previous.id).await?;
            }
        }

        self.directory.publish(advertisement.clone()).await?;
        *self.own.write().await = Some(advertisement.clone());

        log::info!(
            "Advertised signer {} (types: {:?})",
            advertisement.id,
            advertisement.transaction_types
        );
        Ok(advertisement)
    }

    /// Withdraw our advertisement. Returns whether one was published.
    pub async fn withdraw_signer(&self) -> Result<bool> {
        self.ensure_running()?;

        let own = self.own.write().await.take();
        match own {
            Some(own) => {
                self.directory.withdraw(&own.id).await?;
                log::info!("Withdrew signer advertisement {}", own.id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Our currently published advertisement
    pub async fn own_advertisement(&self) -> Option<SignerAdvertisement> {
        self.own.read().await.clone()
    }

    /// Query the directory and return matching live signers, best reputation
    /// first. Our own advertisement is never included.
    pub async fn discover_signers(
        &self,
        criteria: &SignerCriteria,
    ) -> Result<Vec<SignerAdvertisement>> {
        self.ensure_running()?;

        let found = self.directory.query(criteria).await?;
        log::debug!("Directory returned {} advertisements", found.len());

        {
            let mut cache = self.cache.write().await;
            for advertisement in found {
                ingest(&mut cache, &self.events, &self.local, advertisement);
            }
        }

        let cache = self.cache.read().await;
        let own_key = self.local.identity.public_key_hex();
        let mut signers: Vec<SignerAdvertisement> = cache
            .valid_signers()
            .into_iter()
            .filter(|ad| ad.public_key_hex != own_key && criteria.matches(ad))
            .cloned()
            .collect();

        signers.sort_by(|a, b| b.reputation.cmp(&a.reputation).then(a.id.cmp(&b.id)));
        if let Some(max) = criteria.max_results {
            signers.truncate(max);
        }
        Ok(signers)
    }

    /// Watch the directory; `on_found` runs for every matching advertisement
    /// published from now on
    pub async fn subscribe_to_signers<F>(
        &self,
        criteria: SignerCriteria,
        on_found: F,
    ) -> Result<SubscriptionId>
    where
        F: Fn(SignerAdvertisement) + Send + Sync + 'static,
    {
        self.ensure_running()?;

        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let mut updates = self.directory.watch();
        let cache = self.cache.clone();
        let events = self.events.clone();
        let local = self.local.clone();

        let task = tokio::spawn(async move {
            // What this subscription has already reported, by advertisement id
            let mut notified: HashMap<String, SignerAdvertisement> = HashMap::new();
            loop {
                match updates.recv().await {
                    Ok(DirectoryRecord::Published(advertisement)) => {
                        let accepted = {
                            let mut cache = cache.write().await;
                            ingest(&mut cache, &events, &local, advertisement)
                        };
                        let advertisement = match accepted {
                            Some(advertisement) if criteria.matches(&advertisement) => advertisement,
                            _ => continue,
                        };
                        let known = notified
                            .get(&advertisement.id)
                            .map(|seen| seen.same_content(&advertisement))
                            .unwrap_or(false);
                        notified.insert(advertisement.id.clone(), advertisement.clone());
                        if !known {
                            on_found(advertisement);
                        }
                    }
                    Ok(DirectoryRecord::Withdrawn { id, public_key }) => {
                        notified.remove(&id);
                        let removed = cache.write().await.delete(&id);
                        if removed.is_some() {
                            log::debug!("Signer {} withdrew", id);
                            events.emit(DiscoveryEvent::SignerWithdrawn { id, public_key });
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Signer subscription {} skipped {} records", id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.subscriptions.lock().await.insert(id, task);
        log::debug!("Signer subscription {} started", id);
        Ok(id)
    }

    /// End a subscription. Returns whether it existed.
    pub async fn unsubscribe_from_signers(&self, id: SubscriptionId) -> bool {
        match self.subscriptions.lock().await.remove(&id) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    /// Live advertisement for a public key, if cached
    pub async fn signer_by_public_key(&self, public_key_hex: &str) -> Option<SignerAdvertisement> {
        self.cache
            .read()
            .await
            .get_by_public_key(public_key_hex)
            .cloned()
    }

    pub async fn valid_signers(&self) -> Vec<SignerAdvertisement> {
        self.cache
            .read()
            .await
            .valid_signers()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn cache(&self) -> Arc<RwLock<DiscoveryCache>> {
        self.cache.clone()
    }

    pub fn events(&self) -> Subscription<DiscoveryEvent> {
        self.events.subscribe()
    }

    fn spawn_sweep(&self) -> JoinHandle<()> {
        let cache = self.cache.clone();
        let interval = self.config.cache_sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = cache.write().await.cleanup_expired();
                if removed > 0 {
                    log::debug!("Swept {} expired signer advertisements", removed);
                }
            }
        })
    }

    /// Re-publish our advertisement at half its lifetime
    fn spawn_refresh(&self) -> JoinHandle<()> {
        let own = self.own.clone();
        let directory = self.directory.clone();
        let identity = self.local.identity.clone();
        let ttl = self.config.advertisement_ttl();
        let period = std::time::Duration::from_secs((self.config.advertisement_ttl_secs / 2).max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let renewed = {
                    let mut own = own.write().await;
                    match own.as_mut() {
                        Some(advertisement) => match advertisement.renew(&identity, ttl) {
                            Ok(()) => Some(advertisement.clone()),
                            Err(e) => {
                                log::error!("Failed to renew advertisement: {}", e);
                                None
                            }
                        },
                        None => None,
                    }
                };
                if let Some(advertisement) = renewed {
                    match directory.publish(advertisement.clone()).await {
                        Ok(()) => log::debug!("Refreshed advertisement {}", advertisement.id),
                        Err(e) => log::warn!("Advertisement refresh failed: {}", e),
                    }
                }
            }
        })
    }
}

/// Verify and cache one advertisement. Returns it when it was accepted,
/// whether or not the cache already held it.
fn ingest(
    cache: &mut DiscoveryCache,
    events: &EventBus<DiscoveryEvent>,
    local: &LocalPeer,
    advertisement: SignerAdvertisement,
) -> Option<SignerAdvertisement> {
    if advertisement.public_key_hex == local.identity.public_key_hex() {
        return None;
    }
    if let Err(e) = advertisement.verify() {
        log::warn!("Dropping advertisement from {}: {}", advertisement.peer_id, e);
        return None;
    }

    match cache.upsert(advertisement.clone()) {
        UpsertOutcome::Refreshed => {}
        UpsertOutcome::Inserted | UpsertOutcome::Replaced => {
            log::debug!(
                "Discovered signer {} at peer {}",
                advertisement.id,
                advertisement.peer_id
            );
            events.emit(DiscoveryEvent::SignerDiscovered(advertisement.clone()));
        }
    }
    Some(advertisement)
}
