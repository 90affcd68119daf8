//! Signer directory (the DHT the advertisements live in)
//!
//! The directory itself is an external collaborator; this module defines the
//! seam and an in-process implementation shared between nodes in tests and in
//! the simulator.

use crate::discovery::advertisement::{SignerAdvertisement, SignerCriteria};
use crate::error::{CoordinatorError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Change notifications pushed to directory watchers
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryRecord {
    Published(SignerAdvertisement),
    Withdrawn { id: String, public_key: String },
}

#[async_trait]
pub trait SignerDirectory: Send + Sync {
    /// Store (or overwrite) an advertisement
    async fn publish(&self, advertisement: SignerAdvertisement) -> Result<()>;

    /// Remove an advertisement by id
    async fn withdraw(&self, id: &str) -> Result<()>;

    /// Fetch advertisements matching `criteria`
    async fn query(&self, criteria: &SignerCriteria) -> Result<Vec<SignerAdvertisement>>;

    /// Stream of publish/withdraw records from now on
    fn watch(&self) -> broadcast::Receiver<DirectoryRecord>;
}

/// Directory held in memory, shared by cloning the `Arc`
#[derive(Debug)]
pub struct MemoryDirectory {
    records: RwLock<HashMap<String, SignerAdvertisement>>,
    updates: broadcast::Sender<DirectoryRecord>,
    available: AtomicBool,
}

impl MemoryDirectory {
    pub fn new() -> Arc<Self> {
        let (updates, _) = broadcast::channel(1024);
        Arc::new(Self {
            records: RwLock::new(HashMap::new()),
            updates,
            available: AtomicBool::new(true),
        })
    }

    /// Simulate the directory becoming unreachable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoordinatorError::Transport("signer directory unreachable".into()))
        }
    }
}

#[async_trait]
impl SignerDirectory for MemoryDirectory {
    async fn publish(&self, advertisement: SignerAdvertisement) -> Result<()> {
        self.check_available()?;
        self.records
            .write()
            .await
            .insert(advertisement.id.clone(), advertisement.clone());
        let _ = self.updates.send(DirectoryRecord::Published(advertisement));
        Ok(())
    }

    async fn withdraw(&self, id: &str) -> Result<()> {
        self.check_available()?;
        if let Some(removed) = self.records.write().await.remove(id) {
            let _ = self.updates.send(DirectoryRecord::Withdrawn {
                id: removed.id,
                public_key: removed.public_key_hex,
            });
        }
        Ok(())
    }

    async fn query(&self, criteria: &SignerCriteria) -> Result<Vec<SignerAdvertisement>> {
        self.check_available()?;
        let now = Utc::now();
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|ad| ad.is_valid_at(now) && criteria.matches(ad))
            .cloned()
            .collect())
    }

    fn watch(&self) -> broadcast::Receiver<DirectoryRecord> {
        self.updates.subscribe()
    }
}
