//! TTL-bounded cache of signer advertisements
//!
//! Entries are keyed by advertisement id with a secondary index from public
//! key to id. Expiry is checked on every read, so a stale entry is never
//! returned even if the periodic sweep has not run yet.

use crate::discovery::advertisement::SignerAdvertisement;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// What an upsert did to the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New advertisement
    Inserted,
    /// Same content re-advertised; only the expiry moved
    Refreshed,
    /// Content changed, or a new id took over a known public key
    Replaced,
}

/// In-memory signer cache
#[derive(Debug, Default)]
pub struct DiscoveryCache {
    /// Advertisements by id
    entries: HashMap<String, SignerAdvertisement>,
    /// Public key (hex) to advertisement id
    by_public_key: HashMap<String, String>,
}

impl DiscoveryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update an advertisement
    pub fn upsert(&mut self, entry: SignerAdvertisement) -> UpsertOutcome {
        let mut displaced = false;

        // One advertisement per public key
        if let Some(old_id) = self.by_public_key.get(&entry.public_key_hex).cloned() {
            if old_id != entry.id {
                self.entries.remove(&old_id);
                displaced = true;
            }
        }

        let outcome = match self.entries.get_mut(&entry.id) {
            Some(existing) => {
                if existing.public_key_hex != entry.public_key_hex {
                    self.by_public_key.remove(&existing.public_key_hex);
                }

                if existing.same_content(&entry) {
                    existing.expires_at = entry.expires_at;
                    existing.signature = entry.signature;
                    UpsertOutcome::Refreshed
                } else {
                    *existing = entry.clone();
                    UpsertOutcome::Replaced
                }
            }
            None => {
                self.entries.insert(entry.id.clone(), entry.clone());
                if displaced {
                    UpsertOutcome::Replaced
                } else {
                    UpsertOutcome::Inserted
                }
            }
        };

        self.by_public_key.insert(entry.public_key_hex, entry.id);
        outcome
    }

    /// Look up a live advertisement by id
    pub fn get(&self, id: &str) -> Option<&SignerAdvertisement> {
        self.get_at(id, Utc::now())
    }

    pub fn get_at(&self, id: &str, now: DateTime<Utc>) -> Option<&SignerAdvertisement> {
        self.entries.get(id).filter(|e| e.is_valid_at(now))
    }

    /// Look up a live advertisement by the signer's public key
    pub fn get_by_public_key(&self, public_key_hex: &str) -> Option<&SignerAdvertisement> {
        self.get_by_public_key_at(public_key_hex, Utc::now())
    }

    pub fn get_by_public_key_at(
        &self,
        public_key_hex: &str,
        now: DateTime<Utc>,
    ) -> Option<&SignerAdvertisement> {
        self.by_public_key
            .get(public_key_hex)
            .and_then(|id| self.get_at(id, now))
    }

    /// All advertisements that have not expired
    pub fn valid_signers(&self) -> Vec<&SignerAdvertisement> {
        self.valid_signers_at(Utc::now())
    }

    pub fn valid_signers_at(&self, now: DateTime<Utc>) -> Vec<&SignerAdvertisement> {
        self.entries.values().filter(|e| e.is_valid_at(now)).collect()
    }

    /// Drop every expired entry; returns how many were removed
    pub fn cleanup_expired(&mut self) -> usize {
        self.cleanup_expired_at(Utc::now())
    }

    pub fn cleanup_expired_at(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|e| !e.is_valid_at(now))
            .map(|e| e.id.clone())
            .collect();

        for id in &expired {
            self.delete(id);
        }
        expired.len()
    }

    pub fn delete(&mut self, id: &str) -> Option<SignerAdvertisement> {
        let removed = self.entries.remove(id)?;
        if self.by_public_key.get(&removed.public_key_hex) == Some(&removed.id) {
            self.by_public_key.remove(&removed.public_key_hex);
        }
        Some(removed)
    }

    pub fn delete_by_public_key(&mut self, public_key_hex: &str) -> Option<SignerAdvertisement> {
        let id = self.by_public_key.remove(public_key_hex)?;
        self.entries.remove(&id)
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_public_key.clear();
    }

    /// Both indices describe the same set of entries
    pub fn is_consistent(&self) -> bool {
        self.entries.len() == self.by_public_key.len()
            && self.by_public_key.iter().all(|(pk, id)| {
                self.entries
                    .get(id)
                    .map(|e| &e.public_key_hex == pk)
                    .unwrap_or(false)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::advertisement::{SignerConfig, TxTypes};
    use crate::crypto::KeyPair;
    use chrono::Duration;

    fn advertisement(key: &KeyPair, ttl: Duration) -> SignerAdvertisement {
        SignerAdvertisement::create(
            key,
            &format!("peer-{}", &key.public_key_hex()[..8]),
            vec!["/ip4/10.0.0.1/tcp/9000".into()],
            &SignerConfig::new(TxTypes::SPEND),
            ttl,
        )
        .unwrap()
    }

    fn expired(key: &KeyPair) -> SignerAdvertisement {
        let mut ad = advertisement(key, Duration::minutes(5));
        ad.created_at = Utc::now() - Duration::minutes(10);
        ad.expires_at = Utc::now() - Duration::milliseconds(1);
        ad
    }

    #[test]
    fn test_upsert_and_lookup() {
        let mut cache = DiscoveryCache::new();
        let key = KeyPair::generate();
        let ad = advertisement(&key, Duration::minutes(5));

        assert_eq!(cache.upsert(ad.clone()), UpsertOutcome::Inserted);
        assert_eq!(cache.get(&ad.id).unwrap().peer_id, ad.peer_id);
        assert_eq!(cache.get_by_public_key(&key.public_key_hex()).unwrap().id, ad.id);
        assert!(cache.get("missing").is_none());
        assert!(cache.is_consistent());
    }

    #[test]
    fn test_expired_entry_hidden_before_sweep() {
        let mut cache = DiscoveryCache::new();
        let key = KeyPair::generate();
        let ad = expired(&key);

        cache.upsert(ad.clone());
        assert_eq!(cache.len(), 1);
        assert!(cache.valid_signers().is_empty());
        assert!(cache.get(&ad.id).is_none());
        assert!(cache.get_by_public_key(&key.public_key_hex()).is_none());
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut cache = DiscoveryCache::new();
        let ad = advertisement(&KeyPair::generate(), Duration::minutes(5));

        cache.upsert(ad.clone());
        assert_eq!(cache.upsert(ad.clone()), UpsertOutcome::Refreshed);
        assert_eq!(cache.len(), 1);
        assert!(cache.is_consistent());
    }

    #[test]
    fn test_refresh_keeps_created_at() {
        let mut cache = DiscoveryCache::new();
        let key = KeyPair::generate();
        let ad = advertisement(&key, Duration::minutes(5));
        cache.upsert(ad.clone());

        let mut renewed = ad.clone();
        renewed.created_at = ad.created_at + Duration::seconds(30);
        renewed.renew(&key, Duration::hours(1)).unwrap();

        assert_eq!(cache.upsert(renewed.clone()), UpsertOutcome::Refreshed);
        let stored = cache.get(&ad.id).unwrap();
        assert_eq!(stored.created_at, ad.created_at);
        assert_eq!(stored.expires_at, renewed.expires_at);
    }

    #[test]
    fn test_changed_content_replaces() {
        let mut cache = DiscoveryCache::new();
        let ad = advertisement(&KeyPair::generate(), Duration::minutes(5));
        cache.upsert(ad.clone());

        let mut changed = ad.clone();
        changed.nickname = Some("carol".into());
        changed.created_at = ad.created_at + Duration::seconds(1);

        assert_eq!(cache.upsert(changed.clone()), UpsertOutcome::Replaced);
        let stored = cache.get(&ad.id).unwrap();
        assert_eq!(stored.nickname.as_deref(), Some("carol"));
        assert_eq!(stored.created_at, changed.created_at);
    }

    #[test]
    fn test_new_id_for_known_key_displaces_old_entry() {
        let mut cache = DiscoveryCache::new();
        let key = KeyPair::generate();
        let first = advertisement(&key, Duration::minutes(5));
        let mut second = first.clone();
        second.id = "another-id".into();

        cache.upsert(first.clone());
        assert_eq!(cache.upsert(second.clone()), UpsertOutcome::Replaced);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&first.id).is_none());
        assert_eq!(cache.get_by_public_key(&key.public_key_hex()).unwrap().id, "another-id");
        assert!(cache.is_consistent());
    }

    #[test]
    fn test_cleanup_expired() {
        let mut cache = DiscoveryCache::new();
        let live = advertisement(&KeyPair::generate(), Duration::minutes(5));
        cache.upsert(live.clone());
        cache.upsert(expired(&KeyPair::generate()));
        cache.upsert(expired(&KeyPair::generate()));

        assert_eq!(cache.cleanup_expired(), 2);
        assert_eq!(cache.cleanup_expired(), 0);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&live.id).is_some());
        assert!(cache.is_consistent());
    }

    #[test]
    fn test_delete_both_indices() {
        let mut cache = DiscoveryCache::new();
        let key_a = KeyPair::generate();
        let key_b = KeyPair::generate();
        let a = advertisement(&key_a, Duration::minutes(5));
        let b = advertisement(&key_b, Duration::minutes(5));
        cache.upsert(a.clone());
        cache.upsert(b.clone());

        assert!(cache.delete(&a.id).is_some());
        assert!(cache.get_by_public_key(&key_a.public_key_hex()).is_none());
        assert!(cache.delete_by_public_key(&key_b.public_key_hex()).is_some());
        assert!(cache.get(&b.id).is_none());
        assert!(cache.is_empty());
        assert!(cache.is_consistent());

        assert!(cache.delete("gone").is_none());
    }
}
