//! Signer advertisements and search criteria

use crate::crypto::{public_key_from_hex, sha256, verify_signature, KeyPair};
use crate::error::{CoordinatorError, Result};
use bitflags::bitflags;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Longest nickname a signer may advertise
pub const MAX_NICKNAME_LENGTH: usize = 64;

/// Most addresses carried in one advertisement
pub const MAX_MULTIADDRS: usize = 16;

bitflags! {
    /// Transaction kinds a signer is willing to co-sign
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TxTypes: u32 {
        const SPEND = 1 << 0;
        const SWAP = 1 << 1;
        const COINJOIN = 1 << 2;
        const CUSTODY = 1 << 3;
        const ESCROW = 1 << 4;
        const CHANNEL = 1 << 5;
    }
}

/// Inclusive amount bounds, in base units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountRange {
    pub min: u64,
    pub max: u64,
}

impl AmountRange {
    pub fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, amount: u64) -> bool {
        amount >= self.min && amount <= self.max
    }
}

/// What this node offers when it advertises itself as a signer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignerConfig {
    pub transaction_types: TxTypes,
    pub amount_range: Option<AmountRange>,
    pub nickname: Option<String>,
}

impl SignerConfig {
    pub fn new(transaction_types: TxTypes) -> Self {
        Self {
            transaction_types,
            amount_range: None,
            nickname: None,
        }
    }

    pub fn with_amount_range(mut self, min: u64, max: u64) -> Self {
        self.amount_range = Some(AmountRange::new(min, max));
        self
    }

    pub fn with_nickname(mut self, nickname: &str) -> Self {
        self.nickname = Some(nickname.to_string());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.transaction_types.is_empty() {
            return Err(CoordinatorError::AdvertisementInvalid(
                "at least one transaction type is required".into(),
            ));
        }
        if let Some(range) = &self.amount_range {
            if range.min > range.max {
                return Err(CoordinatorError::AdvertisementInvalid(format!(
                    "amount range min {} exceeds max {}",
                    range.min, range.max
                )));
            }
        }
        if let Some(nickname) = &self.nickname {
            if nickname.trim().is_empty() || nickname.len() > MAX_NICKNAME_LENGTH {
                return Err(CoordinatorError::AdvertisementInvalid(format!(
                    "nickname must be 1..={} characters",
                    MAX_NICKNAME_LENGTH
                )));
            }
        }
        Ok(())
    }
}

/// A peer's offer to co-sign, as published to the signer directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignerAdvertisement {
    pub id: String,
    pub peer_id: String,
    pub public_key_hex: String,
    pub multiaddrs: Vec<String>,
    pub transaction_types: TxTypes,
    pub amount_range: Option<AmountRange>,
    pub nickname: Option<String>,
    pub reputation: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Signature by `public_key_hex` over [`SignerAdvertisement::signing_data`]
    pub signature: String,
}

impl SignerAdvertisement {
    /// Build and sign an advertisement for `identity`
    pub fn create(
        identity: &KeyPair,
        peer_id: &str,
        multiaddrs: Vec<String>,
        config: &SignerConfig,
        ttl: Duration,
    ) -> Result<Self> {
        config.validate()?;
        let now = Utc::now();
        let public_key_hex = identity.public_key_hex();
        let id = hex::encode(&sha256(format!("{}:{}", public_key_hex, peer_id).as_bytes())[..16]);

        let mut advertisement = Self {
            id,
            peer_id: peer_id.to_string(),
            public_key_hex,
            multiaddrs,
            transaction_types: config.transaction_types,
            amount_range: config.amount_range,
            nickname: config.nickname.clone(),
            reputation: 0,
            created_at: now,
            expires_at: now + ttl,
            signature: String::new(),
        };
        advertisement.sign(identity)?;
        Ok(advertisement)
    }

    /// Push the expiry out and re-sign
    pub fn renew(&mut self, identity: &KeyPair, ttl: Duration) -> Result<()> {
        self.expires_at = Utc::now() + ttl;
        self.sign(identity)
    }

    /// Bytes covered by the signature (everything except reputation, which
    /// is assigned by observers, and the signature itself)
    pub fn signing_data(&self) -> Vec<u8> {
        let data = format!(
            "{}|{}|{}|{}|{}|{:?}|{:?}|{}|{}",
            self.id,
            self.peer_id,
            self.public_key_hex,
            self.multiaddrs.join(","),
            self.transaction_types.bits(),
            self.amount_range.map(|r| (r.min, r.max)),
            self.nickname,
            self.created_at.timestamp_millis(),
            self.expires_at.timestamp_millis(),
        );
        sha256(data.as_bytes())
    }

    fn sign(&mut self, identity: &KeyPair) -> Result<()> {
        let signature = identity.sign(&self.signing_data())?;
        self.signature = hex::encode(signature);
        Ok(())
    }

    /// Check shape, lifetime ordering and the signature
    pub fn verify(&self) -> Result<()> {
        if self.id.is_empty() || self.peer_id.is_empty() {
            return Err(CoordinatorError::AdvertisementInvalid(
                "missing id or peer id".into(),
            ));
        }
        if self.expires_at <= self.created_at {
            return Err(CoordinatorError::AdvertisementInvalid(format!(
                "advertisement {} expires before it was created",
                self.id
            )));
        }
        if self.multiaddrs.len() > MAX_MULTIADDRS {
            return Err(CoordinatorError::AdvertisementInvalid(format!(
                "too many addresses: {}",
                self.multiaddrs.len()
            )));
        }

        let public_key = public_key_from_hex(&self.public_key_hex)
            .map_err(|_| CoordinatorError::AdvertisementInvalid("bad public key".into()))?;
        let signature = hex::decode(&self.signature)
            .map_err(|_| CoordinatorError::AdvertisementInvalid("bad signature hex".into()))?;

        if !verify_signature(&public_key, &self.signing_data(), &signature)? {
            return Err(CoordinatorError::AdvertisementInvalid(format!(
                "signature check failed for {}",
                self.id
            )));
        }
        Ok(())
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Same offer, ignoring timestamps and signature
    pub fn same_content(&self, other: &Self) -> bool {
        self.peer_id == other.peer_id
            && self.public_key_hex == other.public_key_hex
            && self.multiaddrs == other.multiaddrs
            && self.transaction_types == other.transaction_types
            && self.amount_range == other.amount_range
            && self.nickname == other.nickname
    }
}

/// Signer search filter; every set field must match
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignerCriteria {
    /// All of these transaction types must be offered
    pub transaction_types: Option<TxTypes>,
    /// Amount the signer must accept
    pub amount: Option<u64>,
    pub min_reputation: Option<u32>,
    pub max_results: Option<usize>,
}

impl SignerCriteria {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_transaction(transaction_types: TxTypes) -> Self {
        Self {
            transaction_types: Some(transaction_types),
            ..Default::default()
        }
    }

    pub fn with_amount(mut self, amount: u64) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_min_reputation(mut self, reputation: u32) -> Self {
        self.min_reputation = Some(reputation);
        self
    }

    pub fn with_max_results(mut self, max: usize) -> Self {
        self.max_results = Some(max);
        self
    }

    pub fn matches(&self, advertisement: &SignerAdvertisement) -> bool {
        if let Some(types) = self.transaction_types {
            if !advertisement.transaction_types.contains(types) {
                return false;
            }
        }
        if let (Some(amount), Some(range)) = (self.amount, advertisement.amount_range) {
            if !range.contains(amount) {
                return false;
            }
        }
        if let Some(min) = self.min_reputation {
            if advertisement.reputation < min {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advertisement(config: &SignerConfig) -> (SignerAdvertisement, KeyPair) {
        let key = KeyPair::generate();
        let ad = SignerAdvertisement::create(
            &key,
            "peer-a",
            vec!["/ip4/127.0.0.1/tcp/9000".into()],
            config,
            Duration::minutes(10),
        )
        .unwrap();
        (ad, key)
    }

    #[test]
    fn test_config_validation() {
        assert!(SignerConfig::new(TxTypes::SPEND).validate().is_ok());
        assert!(matches!(
            SignerConfig::new(TxTypes::empty()).validate(),
            Err(CoordinatorError::AdvertisementInvalid(_))
        ));
        assert!(SignerConfig::new(TxTypes::SPEND)
            .with_amount_range(10, 5)
            .validate()
            .is_err());
        assert!(SignerConfig::new(TxTypes::SPEND)
            .with_nickname(&"x".repeat(65))
            .validate()
            .is_err());
    }

    #[test]
    fn test_signed_advertisement_verifies() {
        let (ad, key) = advertisement(&SignerConfig::new(TxTypes::SPEND | TxTypes::SWAP));
        assert_eq!(ad.public_key_hex, key.public_key_hex());
        assert!(ad.expires_at > ad.created_at);
        ad.verify().unwrap();
    }

    #[test]
    fn test_tampered_advertisement_rejected() {
        let (mut ad, _) = advertisement(&SignerConfig::new(TxTypes::SPEND));
        ad.transaction_types = TxTypes::all();
        assert!(matches!(
            ad.verify(),
            Err(CoordinatorError::AdvertisementInvalid(_))
        ));
    }

    #[test]
    fn test_renew_keeps_content() {
        let (ad, key) = advertisement(&SignerConfig::new(TxTypes::SPEND));
        let mut renewed = ad.clone();
        renewed.renew(&key, Duration::hours(2)).unwrap();
        renewed.verify().unwrap();
        assert!(renewed.same_content(&ad));
        assert!(renewed.expires_at > ad.expires_at);
    }

    #[test]
    fn test_criteria_conjunction() {
        let config = SignerConfig::new(TxTypes::SPEND | TxTypes::COINJOIN).with_amount_range(100, 1000);
        let (mut ad, _) = advertisement(&config);
        ad.reputation = 40;

        assert!(SignerCriteria::any().matches(&ad));
        assert!(SignerCriteria::for_transaction(TxTypes::SPEND).matches(&ad));
        assert!(!SignerCriteria::for_transaction(TxTypes::SPEND | TxTypes::SWAP).matches(&ad));
        assert!(SignerCriteria::any().with_amount(500).matches(&ad));
        assert!(!SignerCriteria::any().with_amount(5000).matches(&ad));
        assert!(!SignerCriteria::for_transaction(TxTypes::SPEND)
            .with_amount(500)
            .with_min_reputation(50)
            .matches(&ad));
    }

    #[test]
    fn test_tx_types_serde() {
        let types = TxTypes::SPEND | TxTypes::ESCROW;
        let json = serde_json::to_string(&types).unwrap();
        let back: TxTypes = serde_json::from_str(&json).unwrap();
        assert_eq!(back, types);
    }
}
