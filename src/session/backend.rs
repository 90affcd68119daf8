//! Signing backend seam
//!
//! Nonce generation, partial signing and aggregation are provided by an
//! external MuSig2 implementation. The coordinator only moves opaque hex
//! strings around and calls into a [`MusigBackend`].

use crate::crypto::{public_key_from_hex, sha256, transcript_hash, verify_signature, KeyPair};
use crate::error::{CoordinatorError, Result};
use rand::RngCore;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Everything a partial signature commits to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningContext {
    pub session_id: String,
    pub message: Vec<u8>,
    pub aggregated_key: String,
    /// Public nonces by participant public key
    pub nonces: BTreeMap<String, String>,
}

impl SigningContext {
    /// Digest over message, aggregate key and every public nonce
    pub fn transcript(&self) -> Vec<u8> {
        let mut parts: Vec<&[u8]> = vec![
            self.session_id.as_bytes(),
            &self.message,
            self.aggregated_key.as_bytes(),
        ];
        for (public_key, nonce) in &self.nonces {
            parts.push(public_key.as_bytes());
            parts.push(nonce.as_bytes());
        }
        transcript_hash(&parts)
    }
}

pub trait MusigBackend: Send + Sync {
    /// Aggregate the participants' public keys (sorted order)
    fn aggregate_keys(&self, public_keys: &[String]) -> Result<String>;

    /// Generate a fresh nonce pair for `signer` in `session_id`, keep the
    /// secret half and return the public half
    fn generate_nonce(&self, session_id: &str, signer: &KeyPair) -> Result<String>;

    /// Produce this signer's partial signature. Consumes the secret nonce.
    fn partial_sign(&self, signer: &KeyPair, context: &SigningContext) -> Result<String>;

    /// Combine all partial signatures into the final signature
    fn aggregate_signatures(
        &self,
        context: &SigningContext,
        partials: &BTreeMap<String, String>,
    ) -> Result<String>;

    /// Drop any secret state held for a session
    fn forget(&self, session_id: &str);
}

/// Hash-transcript stand-in for a MuSig2 library.
///
/// Produces deterministic, verifiable values with the same data flow as
/// MuSig2 (nonce round, partial signatures bound to all nonces, single use
/// secret nonces) but the output is not a Schnorr signature.
#[derive(Debug, Default)]
pub struct TranscriptBackend {
    /// Secret nonces by (session id, signer public key)
    secret_nonces: Mutex<HashMap<(String, String), [u8; 32]>>,
}

impl TranscriptBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn public_nonce(secret: &[u8; 32], public_key_hex: &str) -> String {
        hex::encode(transcript_hash(&[secret, public_key_hex.as_bytes()]))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(String, String), [u8; 32]>>> {
        self.secret_nonces
            .lock()
            .map_err(|_| CoordinatorError::Backend("nonce store poisoned".into()))
    }
}

impl MusigBackend for TranscriptBackend {
    fn aggregate_keys(&self, public_keys: &[String]) -> Result<String> {
        let mut sorted = public_keys.to_vec();
        sorted.sort();
        for key in &sorted {
            public_key_from_hex(key)?;
        }
        Ok(hex::encode(sha256(sorted.join(":").as_bytes())))
    }

    fn generate_nonce(&self, session_id: &str, signer: &KeyPair) -> Result<String> {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);

        let public_key = signer.public_key_hex();
        let public = Self::public_nonce(&secret, &public_key);
        self.lock()?
            .insert((session_id.to_string(), public_key), secret);
        Ok(public)
    }

    fn partial_sign(&self, signer: &KeyPair, context: &SigningContext) -> Result<String> {
        let public_key = signer.public_key_hex();
        let secret = self
            .lock()?
            .remove(&(context.session_id.clone(), public_key.clone()))
            .ok_or_else(|| {
                CoordinatorError::Backend(format!(
                    "no unused nonce for session {}",
                    context.session_id
                ))
            })?;

        if context.nonces.get(&public_key) != Some(&Self::public_nonce(&secret, &public_key)) {
            return Err(CoordinatorError::Backend(
                "own nonce missing from signing context".into(),
            ));
        }

        let signature = signer.sign(&context.transcript())?;
        Ok(hex::encode(signature))
    }

    fn aggregate_signatures(
        &self,
        context: &SigningContext,
        partials: &BTreeMap<String, String>,
    ) -> Result<String> {
        if partials.len() != context.nonces.len() {
            return Err(CoordinatorError::Backend(format!(
                "expected {} partial signatures, got {}",
                context.nonces.len(),
                partials.len()
            )));
        }

        let transcript = context.transcript();
        let mut parts: Vec<Vec<u8>> = Vec::with_capacity(partials.len());
        for (public_key, partial) in partials {
            let key = public_key_from_hex(public_key)?;
            let signature = hex::decode(partial).map_err(|_| {
                CoordinatorError::Backend(format!("partial from {} is not hex", public_key))
            })?;
            if !verify_signature(&key, &transcript, &signature)? {
                return Err(CoordinatorError::Backend(format!(
                    "invalid partial signature from {}",
                    public_key
                )));
            }
            parts.push(signature);
        }

        let refs: Vec<&[u8]> = parts.iter().map(|p| p.as_slice()).collect();
        Ok(hex::encode(transcript_hash(&refs)))
    }

    fn forget(&self, session_id: &str) {
        if let Ok(mut nonces) = self.secret_nonces.lock() {
            nonces.retain(|(id, _), _| id != session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(backend: &TranscriptBackend, signers: &[&KeyPair]) -> SigningContext {
        let keys: Vec<String> = signers.iter().map(|k| k.public_key_hex()).collect();
        let mut nonces = BTreeMap::new();
        for signer in signers {
            nonces.insert(
                signer.public_key_hex(),
                backend.generate_nonce("s1", signer).unwrap(),
            );
        }
        SigningContext {
            session_id: "s1".into(),
            message: b"pay bob".to_vec(),
            aggregated_key: backend.aggregate_keys(&keys).unwrap(),
            nonces,
        }
    }

    #[test]
    fn test_key_aggregation_is_order_independent() {
        let backend = TranscriptBackend::new();
        let a = KeyPair::generate().public_key_hex();
        let b = KeyPair::generate().public_key_hex();
        assert_eq!(
            backend.aggregate_keys(&[a.clone(), b.clone()]).unwrap(),
            backend.aggregate_keys(&[b, a]).unwrap()
        );
        assert!(backend.aggregate_keys(&["zz".into()]).is_err());
    }

    #[test]
    fn test_sign_and_aggregate() {
        let backend = TranscriptBackend::new();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let ctx = context(&backend, &[&alice, &bob]);

        let mut partials = BTreeMap::new();
        partials.insert(alice.public_key_hex(), backend.partial_sign(&alice, &ctx).unwrap());
        partials.insert(bob.public_key_hex(), backend.partial_sign(&bob, &ctx).unwrap());

        let signature = backend.aggregate_signatures(&ctx, &partials).unwrap();
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn test_nonce_is_single_use() {
        let backend = TranscriptBackend::new();
        let alice = KeyPair::generate();
        let ctx = context(&backend, &[&alice]);

        backend.partial_sign(&alice, &ctx).unwrap();
        assert!(backend.partial_sign(&alice, &ctx).is_err());
    }

    #[test]
    fn test_tampered_partial_rejected() {
        let backend = TranscriptBackend::new();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let ctx = context(&backend, &[&alice, &bob]);

        let mut partials = BTreeMap::new();
        let alice_partial = backend.partial_sign(&alice, &ctx).unwrap();
        backend.partial_sign(&bob, &ctx).unwrap();
        partials.insert(alice.public_key_hex(), alice_partial.clone());
        // Bob's slot carries Alice's signature
        partials.insert(bob.public_key_hex(), alice_partial);

        assert!(backend.aggregate_signatures(&ctx, &partials).is_err());
    }

    #[test]
    fn test_forget_drops_secret_nonces() {
        let backend = TranscriptBackend::new();
        let alice = KeyPair::generate();
        let ctx = context(&backend, &[&alice]);

        backend.forget("s1");
        assert!(backend.partial_sign(&alice, &ctx).is_err());
    }
}
